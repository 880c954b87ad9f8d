use serde::{Deserialize, Serialize};

use crate::logic::{EngineSettings, Validator};
use crate::model::SecuritySettings;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub engine: EngineConfig,
    /// Security applied to a configuration initialized by this process
    pub security: SecuritySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub connection_string: Option<String>,
    pub max_connections: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Merge edits made against an outdated configuration instead of rejecting them
    pub merge_enabled: bool,
    /// Task identifiers accepted by validation
    pub task_types: Vec<String>,
    pub history_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3001,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            connection_string: None,
            max_connections: Some(20),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            merge_enabled: true,
            task_types: Validator::default().task_types().to_vec(),
            history_limit: 50,
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables and config file
    pub fn load() -> anyhow::Result<Self> {
        let mut config = config::Config::builder();

        // Add default configuration
        config = config.add_source(config::Config::try_from(&AppConfig::default())?);

        // Add config file if it exists
        config = config.add_source(config::File::with_name("config").required(false));

        // Environment variables such as PCE_ENGINE__MERGE_ENABLED=false
        config = config.add_source(
            config::Environment::with_prefix("PCE")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("engine.task_types")
                .with_list_parse_key("security.admins")
                .try_parsing(true),
        );

        let config = config.build()?;
        let app_config: AppConfig = config.try_deserialize()?;

        Ok(app_config)
    }

    /// Database URL from config or `DATABASE_URL`; `None` selects the in-memory store
    pub fn database_url(&self) -> Option<String> {
        self.database
            .connection_string
            .clone()
            .or_else(|| std::env::var("DATABASE_URL").ok())
            .filter(|url| !url.trim().is_empty())
    }

    pub fn max_connections(&self) -> u32 {
        self.database.max_connections.unwrap_or(20)
    }

    /// Get the server bind address
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            merge_enabled: self.engine.merge_enabled,
            history_limit: self.engine.history_limit,
        }
    }

    pub fn validator(&self) -> Validator {
        Validator::new(self.engine.task_types.iter().cloned())
    }
}
