#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use corral_core::{Kind, Resource, ResourceKey, ResourceMetadata, StateError, StateResult, WatchEvent};
use corral_store::{ListOptions, MemoryState, State, UpdateOptions, WatchOptions};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use corral_validated::{type_rule, FnRule, LabelKeyRule, Operation, ValidatedState};

fn res(ty: &str, id: &str, spec: serde_json::Value) -> Resource {
    Resource::new(ResourceMetadata::new("default", ty, id), spec)
}

fn require_replicas() -> FnRule<impl Fn(&corral_validated::ValidationRequest) -> anyhow::Result<()> + Send + Sync> {
    FnRule::new("replicas", |req| {
        let spec = &req.proposed.as_ref().map(|r| r.spec.clone()).unwrap_or_default();
        if spec.get("replicas").and_then(|v| v.as_u64()).unwrap_or(0) == 0 {
            anyhow::bail!("replicas must be positive");
        }
        Ok(())
    })
    .on(&[Operation::Create, Operation::Update])
}

#[tokio::test]
async fn rejected_create_leaves_store_untouched() {
    let st = ValidatedState::builder(MemoryState::default()).rule(require_replicas()).build();
    let err = st.create(res("Cluster", "c1", serde_json::json!({ "replicas": 0 }))).await.unwrap_err();
    assert_eq!(err, StateError::ValidationFailed { rule: "replicas".into(), reason: "replicas must be positive".into() });
    assert!(st.inner().list(&Kind::new("default", "Cluster"), &ListOptions::default()).await.unwrap().is_empty());

    st.create(res("Cluster", "c1", serde_json::json!({ "replicas": 3 }))).await.unwrap();
}

#[tokio::test]
async fn first_failing_rule_wins_and_later_rules_do_not_run() {
    let later_calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&later_calls);
    let st = ValidatedState::builder(MemoryState::default())
        .rule(FnRule::new("first", |_| anyhow::bail!("nope")))
        .rule(FnRule::new("second", move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
        .build();
    assert_eq!(st.rule_names(), vec!["first", "second"]);
    let err = st.create(res("Cluster", "c1", serde_json::json!({}))).await.unwrap_err();
    assert!(matches!(err, StateError::ValidationFailed { ref rule, .. } if rule == "first"));
    assert_eq!(later_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn update_rules_see_the_stored_copy() {
    let immutable_region = FnRule::new("immutable-region", |req| {
        let old = req.existing.as_ref().and_then(|r| r.spec.get("region").cloned());
        let new = req.proposed.as_ref().and_then(|r| r.spec.get("region").cloned());
        if old.is_some() && old != new { anyhow::bail!("region is immutable"); }
        Ok(())
    })
    .on(&[Operation::Update]);
    let st = ValidatedState::builder(MemoryState::default()).rule(immutable_region).build();

    let v1 = st.create(res("Cluster", "c1", serde_json::json!({ "region": "eu" }))).await.unwrap();
    let mut moved = v1.clone();
    moved.spec = serde_json::json!({ "region": "us" });
    assert!(matches!(st.update(moved, UpdateOptions::default()).await, Err(StateError::ValidationFailed { .. })));

    let mut labelled = v1.with_label("tier", "gold");
    labelled.spec = serde_json::json!({ "region": "eu" });
    st.update(labelled, UpdateOptions::default()).await.unwrap();
}

#[tokio::test]
async fn type_scoped_rule_ignores_other_types() {
    let st = ValidatedState::builder(MemoryState::default())
        .rule(type_rule("Machine", FnRule::new("no-machines", |_| anyhow::bail!("machines are locked"))))
        .build();
    st.create(res("Cluster", "c1", serde_json::json!({}))).await.unwrap();
    assert!(st.create(res("Machine", "m1", serde_json::json!({}))).await.is_err());
}

#[tokio::test]
async fn teardown_and_destroy_are_validated() {
    let protected = FnRule::new("protected", |req| {
        let locked = req.existing.as_ref().and_then(|r| r.metadata.labels.get("protected")).is_some();
        if locked { anyhow::bail!("{} is protected", req.key); }
        Ok(())
    })
    .on(&[Operation::Teardown, Operation::Destroy]);
    let st = ValidatedState::builder(MemoryState::default()).rule(protected).build();
    st.create(res("Cluster", "keep", serde_json::json!({})).with_label("protected", "")).await.unwrap();
    st.create(res("Cluster", "drop", serde_json::json!({}))).await.unwrap();

    let keep = ResourceKey::new("default", "Cluster", "keep");
    let err = st.teardown(&keep).await.unwrap_err();
    assert!(matches!(err, StateError::ValidationFailed { ref reason, .. } if reason == "default/Cluster/keep is protected"));
    assert!(st.destroy(&keep).await.is_err());
    assert!(st.get(&keep).await.is_ok());

    let gone = ResourceKey::new("default", "Cluster", "drop");
    assert!(st.teardown(&gone).await.unwrap());
    st.destroy(&gone).await.unwrap();
}

#[tokio::test]
async fn finalizers_bypass_rules() {
    let st = ValidatedState::builder(MemoryState::default())
        .rule(FnRule::new("frozen", |_| anyhow::bail!("frozen")).on(&[Operation::Update]))
        .build();
    st.create(res("Cluster", "c1", serde_json::json!({}))).await.unwrap();
    let key = ResourceKey::new("default", "Cluster", "c1");
    st.add_finalizers(&key, &["ctrl".to_string()]).await.unwrap();
    assert!(st.get(&key).await.unwrap().metadata.finalizers.contains("ctrl"));
}

#[tokio::test]
async fn label_key_rule_guards_writes() {
    let st = ValidatedState::builder(MemoryState::default()).rule(LabelKeyRule).build();
    let err = st.create(res("Cluster", "c1", serde_json::json!({})).with_label("has space", "x")).await.unwrap_err();
    assert!(matches!(err, StateError::ValidationFailed { ref rule, .. } if rule == "label-keys"));
    st.create(res("Cluster", "c1", serde_json::json!({})).with_label("omni.sidero.dev/role", "cp")).await.unwrap();
}

#[cfg(feature = "jsonschema-validate")]
#[tokio::test]
async fn schema_rule_reports_paths() {
    let rule = corral_validated::SchemaRule::from_yaml(
        "Cluster",
        "type: object\nrequired: [kubernetesVersion]\nproperties:\n  kubernetesVersion:\n    type: string\n",
    )
    .unwrap();
    let st = ValidatedState::builder(MemoryState::default()).rule(rule).build();
    let err = st.create(res("Cluster", "c1", serde_json::json!({ "kubernetesVersion": 1 }))).await.unwrap_err();
    assert!(matches!(err, StateError::ValidationFailed { ref reason, .. } if reason.contains("/kubernetesVersion")));
    st.create(res("Cluster", "c1", serde_json::json!({ "kubernetesVersion": "1.30.1" }))).await.unwrap();
}

/// A store whose reads fail while writes still go through.
#[derive(Default)]
struct ReadsDown(MemoryState);

#[async_trait]
impl State for ReadsDown {
    async fn get(&self, _key: &ResourceKey) -> StateResult<Resource> { Err(StateError::Unavailable("backend offline".into())) }

    async fn list(&self, kind: &Kind, opts: &ListOptions) -> StateResult<Vec<Resource>> { self.0.list(kind, opts).await }

    async fn create(&self, res: Resource) -> StateResult<Resource> { self.0.create(res).await }

    async fn update(&self, res: Resource, opts: UpdateOptions) -> StateResult<Resource> { self.0.update(res, opts).await }

    async fn teardown(&self, key: &ResourceKey) -> StateResult<bool> { self.0.teardown(key).await }

    async fn destroy(&self, key: &ResourceKey) -> StateResult<()> { self.0.destroy(key).await }

    async fn add_finalizers(&self, key: &ResourceKey, finalizers: &[String]) -> StateResult<()> {
        self.0.add_finalizers(key, finalizers).await
    }

    async fn remove_finalizers(&self, key: &ResourceKey, finalizers: &[String]) -> StateResult<()> {
        self.0.remove_finalizers(key, finalizers).await
    }

    async fn watch(
        &self,
        kind: &Kind,
        opts: WatchOptions,
        sink: mpsc::Sender<WatchEvent>,
        cancel: CancellationToken,
    ) -> StateResult<()> {
        self.0.watch(kind, opts, sink, cancel).await
    }
}

#[tokio::test]
async fn failed_lookup_of_the_stored_copy_aborts_the_write() {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    let st = ValidatedState::builder(ReadsDown::default())
        .rule(
            FnRule::new("audit", move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .on(&[Operation::Update, Operation::Teardown]),
        )
        .build();
    let v1 = st.create(res("Cluster", "c1", serde_json::json!({}))).await.unwrap();

    let err = st.update(v1.clone(), UpdateOptions::default()).await.unwrap_err();
    assert_eq!(err, StateError::Unavailable("backend offline".into()));
    let err = st.teardown(&v1.key()).await.unwrap_err();
    assert_eq!(err, StateError::Unavailable("backend offline".into()));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let stored = st.inner().list(&Kind::new("default", "Cluster"), &ListOptions::default()).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert!(!stored[0].metadata.is_torn_down());
}
