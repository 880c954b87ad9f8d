use serde::{Deserialize, Serialize};

/// Acting user of an edit, extracted from request headers and recorded as revision author
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserContext {
    pub user_id: String,
    pub user_email: Option<String>,
    pub user_name: Option<String>,
}

impl UserContext {
    /// Create a new UserContext with just a user ID
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            user_email: None,
            user_name: None,
        }
    }

    /// Create a UserContext with full user information
    pub fn with_details(user_id: String, email: Option<String>, name: Option<String>) -> Self {
        Self {
            user_id,
            user_email: email,
            user_name: name,
        }
    }

    /// Create a system user context for internal operations (seeding, migrations)
    pub fn system() -> Self {
        Self {
            user_id: "system".to_string(),
            user_email: None,
            user_name: Some("System".to_string()),
        }
    }

    /// User for requests that carry no identity headers
    pub fn anonymous() -> Self {
        Self {
            user_id: "anonymous".to_string(),
            user_email: None,
            user_name: None,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.user_id == "anonymous"
    }

    /// Name written into the revision log
    pub fn display_name(&self) -> &str {
        self.user_name.as_deref().unwrap_or(&self.user_id)
    }
}

impl Default for UserContext {
    fn default() -> Self {
        Self::anonymous()
    }
}
