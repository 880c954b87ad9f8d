use std::sync::Arc;

use parking_lot::Mutex;
use pipeline_config_engine::logic::{ConfigUpdate, ConflictReason, Mutation, UpdateCoordinator, UpdateResult};
use pipeline_config_engine::model::{
    ConfigurationDocument, Fingerprint, Locator, Node, NodeKind, Revision, RevisionSummary,
    SecuritySettings, Segment, UserContext,
};
use pipeline_config_engine::store::{
    ChangeMetadata, ConfigStore, InMemoryStore, PersistOutcome, StoreError,
};

fn document() -> ConfigurationDocument {
    let mut doc = ConfigurationDocument::new().with_security(SecuritySettings {
        enabled: true,
        admins: vec!["root".to_string()],
    });
    doc.root.children.push(
        Node::named(NodeKind::Group, "first")
            .with_attr("admins", "alice, bob")
            .with_child(
                Node::named(NodeKind::Pipeline, "p1")
                    .with_child(
                        Node::named(NodeKind::Stage, "s1").with_child(
                            Node::named(NodeKind::Job, "j1")
                                .with_child(
                                    Node::new(NodeKind::Task)
                                        .with_attr("type", "exec")
                                        .with_attr("command", "ls"),
                                )
                                .with_child(
                                    Node::new(NodeKind::Task)
                                        .with_attr("type", "exec")
                                        .with_attr("command", "make"),
                                ),
                        ),
                    )
                    .with_child(
                        Node::named(NodeKind::Stage, "s2")
                            .with_child(Node::named(NodeKind::Job, "j2")),
                    ),
            )
            .with_child(Node::named(NodeKind::Pipeline, "p2")),
    );
    doc
}

fn coordinator() -> UpdateCoordinator<InMemoryStore> {
    UpdateCoordinator::with_defaults(Arc::new(InMemoryStore::new(document()).unwrap()))
}

fn task_command(value: &str, based_on: Option<Fingerprint>) -> ConfigUpdate {
    task_command_at(0, value, based_on)
}

fn task_command_at(index: usize, value: &str, based_on: Option<Fingerprint>) -> ConfigUpdate {
    ConfigUpdate::builder()
        .locator(Locator::root().pipeline("p1").stage("s1").job("j1").task(index))
        .mutation(Mutation::SetAttributes)
        .field("command", value)
        .based_on(based_on)
        .build()
        .unwrap()
}

fn job_command(stage: &str, job: &str, key: &str, value: &str, based_on: Option<Fingerprint>) -> ConfigUpdate {
    ConfigUpdate::builder()
        .locator(Locator::root().pipeline("p1").stage(stage).job(job))
        .mutation(Mutation::SetAttributes)
        .field(key, value)
        .based_on(based_on)
        .build()
        .unwrap()
}

fn task_command_value(doc: &ConfigurationDocument) -> Option<String> {
    doc.pipeline("p1")?
        .child(NodeKind::Stage, "s1")?
        .child(NodeKind::Job, "j1")?
        .children_of(NodeKind::Task)
        .next()?
        .attr("command")
        .map(str::to_string)
}

#[tokio::test]
async fn test_clean_persist_yields_new_fingerprint() {
    let coordinator = coordinator();
    let (_, base) = coordinator.current().await.unwrap();

    let result = coordinator
        .execute(&task_command("ls -la", Some(base.clone())), &UserContext::new("alice"))
        .await;

    let UpdateResult::Success { fingerprint, merged, .. } = result else {
        panic!("expected success, got {:?}", result);
    };
    assert_ne!(fingerprint, base);
    assert!(!merged);

    let (doc, current) = coordinator.current().await.unwrap();
    assert_eq!(current, fingerprint);
    assert_eq!(task_command_value(&doc).as_deref(), Some("ls -la"));
    assert_eq!(Fingerprint::of(&doc), fingerprint);
}

#[tokio::test]
async fn test_delete_then_stale_edit_is_conflict() {
    let coordinator = coordinator();
    let (_, base) = coordinator.current().await.unwrap();
    let alice = UserContext::new("alice");

    let delete = ConfigUpdate::builder()
        .locator(Locator::root().pipeline("p1").stage("s1"))
        .mutation(Mutation::RemoveChild(Segment::Job("j1".to_string())))
        .based_on(Some(base.clone()))
        .build()
        .unwrap();
    let deleted = coordinator.execute(&delete, &alice).await;
    assert!(deleted.is_success(), "delete failed: {:?}", deleted);

    let edit = coordinator
        .execute(&task_command("ls -la", Some(base)), &UserContext::new("bob"))
        .await;
    assert!(matches!(
        edit.conflict_reason(),
        Some(ConflictReason::TargetMissing { .. })
    ));

    // The user's own edit is handed back next to the winning document
    assert_eq!(edit.subject().and_then(|t| t.attr("command")), Some("ls -la"));
    let UpdateResult::Conflict { current, current_fingerprint, .. } = &edit else {
        unreachable!();
    };
    assert_eq!(Some(current_fingerprint), deleted.fingerprint());
    assert!(current.pipeline("p1").unwrap().child(NodeKind::Stage, "s1").unwrap().children.is_empty());
}

#[tokio::test]
async fn test_sibling_edits_are_merged() {
    let coordinator = coordinator();
    let (_, base) = coordinator.current().await.unwrap();

    let first = coordinator
        .execute(
            &job_command("s2", "j2", "timeout", "30", Some(base.clone())),
            &UserContext::new("bob"),
        )
        .await;
    assert!(first.is_success());

    let second = coordinator
        .execute(&task_command("ls -la", Some(base)), &UserContext::new("alice"))
        .await;
    assert!(second.is_merged(), "expected merged success, got {:?}", second);

    let (doc, fingerprint) = coordinator.current().await.unwrap();
    assert_eq!(Some(&fingerprint), second.fingerprint());
    assert_eq!(task_command_value(&doc).as_deref(), Some("ls -la"));
    let j2 = doc
        .pipeline("p1")
        .and_then(|p| p.child(NodeKind::Stage, "s2"))
        .and_then(|s| s.child(NodeKind::Job, "j2"))
        .unwrap();
    assert_eq!(j2.attr("timeout"), Some("30"));

    let history = coordinator.history().await.unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].parent_fingerprint, Some(history[1].fingerprint.clone()));
}

#[tokio::test]
async fn test_edits_to_different_tasks_of_one_job_are_merged() {
    let coordinator = coordinator();
    let (_, base) = coordinator.current().await.unwrap();

    let upstream = coordinator
        .execute(&task_command_at(1, "make all", Some(base.clone())), &UserContext::new("bob"))
        .await;
    assert!(upstream.is_success(), "upstream edit failed: {:?}", upstream);

    let stale = coordinator
        .execute(&task_command_at(0, "ls -la", Some(base)), &UserContext::new("alice"))
        .await;
    assert!(stale.is_merged(), "expected merged success, got {:?}", stale);

    let (doc, _) = coordinator.current().await.unwrap();
    let commands: Vec<_> = doc
        .pipeline("p1")
        .and_then(|p| p.child(NodeKind::Stage, "s1"))
        .and_then(|s| s.child(NodeKind::Job, "j1"))
        .unwrap()
        .children_of(NodeKind::Task)
        .filter_map(|t| t.attr("command"))
        .collect();
    assert_eq!(commands, vec!["ls -la", "make all"]);
}

#[tokio::test]
async fn test_same_field_edits_conflict() {
    let coordinator = coordinator();
    let (_, base) = coordinator.current().await.unwrap();

    coordinator
        .execute(&task_command("make", Some(base.clone())), &UserContext::new("bob"))
        .await;
    let result = coordinator
        .execute(&task_command("ls -la", Some(base)), &UserContext::new("alice"))
        .await;

    match result.conflict_reason() {
        Some(ConflictReason::Overlap { conflicts }) => assert!(!conflicts.is_empty()),
        other => panic!("expected overlap, got {:?}", other),
    }
    let (doc, _) = coordinator.current().await.unwrap();
    assert_eq!(task_command_value(&doc).as_deref(), Some("make"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_persists_from_same_base_commit_once() {
    let store = Arc::new(InMemoryStore::new(document()).unwrap());
    let (doc, base) = store.current().await.unwrap();

    let handles: Vec<_> = ["alice", "bob"]
        .into_iter()
        .map(|admin| {
            let store = Arc::clone(&store);
            let base = base.clone();
            let mut doc = doc.clone();
            doc.root.children[0].set_attr("admins", admin);
            tokio::spawn(async move {
                store
                    .persist(&doc, &base, ChangeMetadata::new(admin, "grant"))
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut committed = 0;
    let mut stale = 0;
    for handle in handles {
        match handle.await.unwrap() {
            PersistOutcome::Committed { .. } => committed += 1,
            PersistOutcome::Stale { current } => {
                assert_ne!(current, base);
                stale += 1;
            }
        }
    }
    assert_eq!((committed, stale), (1, 1));
    assert_eq!(store.revision_count().await, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_executions_never_lose_updates() {
    let coordinator = Arc::new(coordinator());
    let (_, base) = coordinator.current().await.unwrap();

    let commands = vec![
        job_command("s1", "j1", "timeout", "10", Some(base.clone())),
        job_command("s2", "j2", "timeout", "20", Some(base.clone())),
        job_command("s2", "j2", "resources", "linux", Some(base.clone())),
    ];
    let handles: Vec<_> = commands
        .into_iter()
        .map(|command| {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.execute(&command, &UserContext::new("alice")).await })
        })
        .collect();

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap());
    }

    let (doc, _) = coordinator.current().await.unwrap();
    let pipeline = doc.pipeline("p1").unwrap();
    let j1 = pipeline.child(NodeKind::Stage, "s1").and_then(|s| s.child(NodeKind::Job, "j1")).unwrap();
    let j2 = pipeline.child(NodeKind::Stage, "s2").and_then(|s| s.child(NodeKind::Job, "j2")).unwrap();

    // Every reported success is visible; anything else was reported as a conflict
    let expectations = [(j1, "timeout", "10"), (j2, "timeout", "20"), (j2, "resources", "linux")];
    for (result, (node, key, value)) in results.iter().zip(expectations) {
        match result {
            UpdateResult::Success { .. } => assert_eq!(node.attr(key), Some(value)),
            UpdateResult::Conflict { reason, .. } => assert_eq!(reason, &ConflictReason::Contention),
            other => panic!("unexpected result {:?}", other),
        }
    }
    assert!(results.iter().any(|r| r.is_success()));
}

/// Store where another writer commits right before every persist
struct ContendedStore {
    inner: InMemoryStore,
    attempts: Mutex<Vec<Fingerprint>>,
}

impl ContendedStore {
    fn new(document: ConfigurationDocument) -> Self {
        Self {
            inner: InMemoryStore::new(document).unwrap(),
            attempts: Mutex::new(Vec::new()),
        }
    }

    async fn interfere(&self) -> Result<(), StoreError> {
        let (mut doc, head) = self.inner.current().await?;
        let round = self.attempts.lock().len().to_string();
        if let Some(group) = doc.root.children.first_mut() {
            if let Some(p2) = group.children.iter_mut().find(|c| c.has_name("p2")) {
                p2.set_attr("label_template", &round);
            }
        }
        self.inner
            .persist(&doc, &head, ChangeMetadata::new("intruder", "contend"))
            .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ConfigStore for ContendedStore {
    async fn current(&self) -> Result<(ConfigurationDocument, Fingerprint), StoreError> {
        self.inner.current().await
    }

    async fn persist(
        &self,
        document: &ConfigurationDocument,
        expected_base: &Fingerprint,
        metadata: ChangeMetadata,
    ) -> Result<PersistOutcome, StoreError> {
        self.attempts.lock().push(expected_base.clone());
        self.interfere().await?;
        self.inner.persist(document, expected_base, metadata).await
    }

    async fn revision_at(&self, fingerprint: &Fingerprint) -> Result<Option<Revision>, StoreError> {
        self.inner.revision_at(fingerprint).await
    }

    async fn history(&self, limit: usize) -> Result<Vec<RevisionSummary>, StoreError> {
        self.inner.history(limit).await
    }
}

#[tokio::test]
async fn test_continuous_contention_ends_after_one_merge_retry() {
    let store = Arc::new(ContendedStore::new(document()));
    let coordinator = UpdateCoordinator::with_defaults(Arc::clone(&store));
    let (_, base) = coordinator.current().await.unwrap();

    let result = coordinator
        .execute(&task_command("ls -la", Some(base.clone())), &UserContext::new("alice"))
        .await;

    assert_eq!(result.conflict_reason(), Some(&ConflictReason::Contention));
    assert_eq!(result.subject().and_then(|t| t.attr("command")), Some("ls -la"));

    let attempts = store.attempts.lock().clone();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0], base);
    assert_ne!(attempts[1], base);
}

#[tokio::test]
async fn test_forbidden_and_not_found_are_not_retried() {
    let store = Arc::new(ContendedStore::new(document()));
    let coordinator = UpdateCoordinator::with_defaults(Arc::clone(&store));

    let forbidden = coordinator
        .execute(&task_command("rm -rf /", None), &UserContext::new("mallory"))
        .await;
    assert_eq!(forbidden.http_status(), 403);

    let missing = coordinator
        .execute(&job_command("s9", "j9", "timeout", "1", None), &UserContext::new("alice"))
        .await;
    assert_eq!(missing.http_status(), 404);

    assert!(store.attempts.lock().is_empty());
}
