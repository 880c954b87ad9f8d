use crate::model::{ConfigurationDocument, Node, NodeKind, UserContext};
use crate::store::traits::{ChangeMetadata, ConfigStore, PersistOutcome};
use anyhow::{bail, Result};
use log::info;

/// Helper function to create an exec task
fn exec_task(command: &str, args: &str) -> Node {
    let task = Node::new(NodeKind::Task)
        .with_attr("type", "exec")
        .with_attr("command", command);
    if args.is_empty() {
        task
    } else {
        task.with_attr("args", args)
    }
}

/// Helper function to create a stage with a single job
fn stage_with_job(stage: &str, job: &str, tasks: Vec<Node>) -> Node {
    let job = tasks
        .into_iter()
        .fold(Node::named(NodeKind::Job, job), Node::with_child);
    Node::named(NodeKind::Stage, stage).with_child(job)
}

fn param(name: &str, value: &str) -> Node {
    Node::named(NodeKind::Param, name).with_attr("value", value)
}

fn build_pipeline() -> Node {
    Node::named(NodeKind::Pipeline, "build-linux")
        .with_attr("label_template", "${COUNT}")
        .with_attr("materials", "https://git.example.com/app.git")
        .with_child(param("toolchain", "stable"))
        .with_child(
            Node::named(NodeKind::Variable, "RUST_LOG").with_attr("value", "info"),
        )
        .with_child(stage_with_job(
            "compile",
            "build",
            vec![
                exec_task("cargo", "build --release --toolchain #{toolchain}"),
                exec_task("cargo", "test"),
            ],
        ))
        .with_child(
            stage_with_job(
                "package",
                "tarball",
                vec![
                    Node::new(NodeKind::Task)
                        .with_attr("type", "fetch")
                        .with_attr("stage", "compile")
                        .with_attr("job", "build")
                        .with_attr("source", "target/release"),
                    exec_task("tar", "czf app.tgz release"),
                ],
            )
            .with_attr("approval", "success"),
        )
}

fn deploy_pipeline(environment: &str) -> Node {
    Node::named(NodeKind::Pipeline, &format!("deploy-{}", environment))
        .with_attr("template", "deploy")
        .with_attr("materials", "build-linux")
        .with_child(param("environment", environment))
        .with_child(param("replicas", "2"))
}

fn deploy_template() -> Node {
    Node::named(NodeKind::Template, "deploy")
        .with_attr("admins", "release-managers")
        .with_child(
            stage_with_job(
                "rollout",
                "apply",
                vec![exec_task(
                    "kubectl",
                    "apply -f deploy/#{environment} --replicas #{replicas}",
                )],
            )
            .with_attr("approval", "manual"),
        )
        .with_child(stage_with_job(
            "verify",
            "smoke",
            vec![exec_task("curl", "-f https://#{environment}.example.com/health")],
        ))
}

/// Demo configuration with two groups, a template and templated pipelines
pub fn sample_configuration() -> ConfigurationDocument {
    let mut document = ConfigurationDocument::new();
    document.root.children = vec![
        Node::named(NodeKind::Group, "builds")
            .with_attr("admins", "alice")
            .with_child(build_pipeline()),
        Node::named(NodeKind::Group, "deployments")
            .with_attr("admins", "bob")
            .with_child(deploy_pipeline("staging"))
            .with_child(deploy_pipeline("production")),
        deploy_template(),
    ];
    document
}

/// Replace the stored configuration with the sample configuration
pub async fn load_seed_data<S: ConfigStore>(store: &S) -> Result<()> {
    let (current, fingerprint) = store.current().await?;
    let mut document = sample_configuration();
    document.security = current.security;

    let author = UserContext::system();
    match store
        .persist(
            &document,
            &fingerprint,
            ChangeMetadata::new(author.display_name(), "Load sample configuration"),
        )
        .await?
    {
        PersistOutcome::Committed { fingerprint } => {
            info!("Seed configuration stored as {}", fingerprint.short());
            Ok(())
        }
        PersistOutcome::Stale { current } => bail!(
            "configuration changed to {} while loading seed data",
            current.short()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::Validator;
    use crate::store::InMemoryStore;

    #[test]
    fn test_sample_configuration_is_valid() {
        let mut document = sample_configuration();
        let errors = Validator::default().validate(&mut document);
        assert!(errors.is_empty(), "unexpected errors: {:?}", errors);
        assert_eq!(document.pipelines().count(), 3);
        assert_eq!(
            document
                .group_of_pipeline("deploy-production")
                .and_then(|g| g.name()),
            Some("deployments")
        );
    }

    #[tokio::test]
    async fn test_load_seed_data_creates_revision() {
        let store = InMemoryStore::empty().unwrap();
        load_seed_data(&store).await.unwrap();

        let (document, _) = store.current().await.unwrap();
        assert!(document.pipeline("build-linux").is_some());
        assert_eq!(store.revision_count().await, 2);
        assert_eq!(store.history(1).await.unwrap()[0].author, "System");
    }
}
