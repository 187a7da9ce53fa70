//! Corral validation wrapper: a `State` decorator that runs an ordered rule
//! chain before every mutation.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use corral_core::{Kind, Resource, ResourceKey, StateError, StateResult, WatchEvent};
use corral_store::{ListOptions, State, UpdateOptions, WatchOptions};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

mod rules;

pub use rules::{type_rule, FnRule, LabelKeyRule, TypeScoped};
#[cfg(feature = "jsonschema-validate")]
pub use rules::SchemaRule;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Update,
    Teardown,
    Destroy,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Teardown => "teardown",
            Operation::Destroy => "destroy",
        })
    }
}

/// What a rule gets to look at.
#[derive(Debug, Clone)]
pub struct ValidationRequest {
    pub op: Operation,
    pub key: ResourceKey,
    /// Stored copy; `None` on create or when the resource does not exist.
    pub existing: Option<Resource>,
    /// Resource being written; `None` for teardown and destroy.
    pub proposed: Option<Resource>,
}

impl ValidationRequest {
    pub fn resource_type(&self) -> &str { &self.key.resource_type }

    /// The proposed resource if there is one, else the stored one.
    pub fn subject(&self) -> Option<&Resource> { self.proposed.as_ref().or(self.existing.as_ref()) }
}

#[async_trait]
pub trait ValidationRule: Send + Sync {
    fn name(&self) -> &str;

    fn applies_to(&self, _op: Operation, _resource_type: &str) -> bool { true }

    /// An `Err` rejects the mutation; its message becomes the reported reason.
    async fn validate(&self, req: &ValidationRequest) -> anyhow::Result<()>;
}

/// `State` that validates creates, updates, teardowns and destroys before
/// handing them to the inner store. Reads, watches and finalizer edits pass
/// straight through.
pub struct ValidatedState<S> {
    inner: S,
    rules: Arc<[Arc<dyn ValidationRule>]>,
}

pub struct ValidatedStateBuilder<S> {
    inner: S,
    rules: Vec<Arc<dyn ValidationRule>>,
}

impl<S> ValidatedStateBuilder<S> {
    pub fn rule(mut self, rule: impl ValidationRule + 'static) -> Self {
        self.rules.push(Arc::new(rule));
        self
    }

    pub fn rule_arc(mut self, rule: Arc<dyn ValidationRule>) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn build(self) -> ValidatedState<S> { ValidatedState { inner: self.inner, rules: self.rules.into() } }
}

impl<S: State> ValidatedState<S> {
    pub fn builder(inner: S) -> ValidatedStateBuilder<S> { ValidatedStateBuilder { inner, rules: Vec::new() } }

    pub fn inner(&self) -> &S { &self.inner }

    pub fn rule_names(&self) -> Vec<&str> { self.rules.iter().map(|r| r.name()).collect() }

    async fn check(&self, op: Operation, key: &ResourceKey, proposed: Option<&Resource>) -> StateResult<()> {
        let applicable: Vec<&Arc<dyn ValidationRule>> =
            self.rules.iter().filter(|r| r.applies_to(op, &key.resource_type)).collect();
        if applicable.is_empty() { return Ok(()); }
        let existing = match op {
            Operation::Create => None,
            _ => match self.inner.get(key).await {
                Ok(res) => Some(res),
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e),
            },
        };
        let req = ValidationRequest { op, key: key.clone(), existing, proposed: proposed.cloned() };
        for rule in applicable {
            if let Err(e) = rule.validate(&req).await {
                let reason = format!("{:#}", e);
                metrics::counter!("validation_rejections_total", 1, "rule" => rule.name().to_string());
                debug!(key = %key, op = %op, rule = rule.name(), %reason, "validate: rejected");
                return Err(StateError::validation(rule.name(), reason));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<S: State> State for ValidatedState<S> {
    async fn get(&self, key: &ResourceKey) -> StateResult<Resource> { self.inner.get(key).await }

    async fn list(&self, kind: &Kind, opts: &ListOptions) -> StateResult<Vec<Resource>> { self.inner.list(kind, opts).await }

    async fn create(&self, res: Resource) -> StateResult<Resource> {
        self.check(Operation::Create, &res.key(), Some(&res)).await?;
        self.inner.create(res).await
    }

    async fn update(&self, res: Resource, opts: UpdateOptions) -> StateResult<Resource> {
        self.check(Operation::Update, &res.key(), Some(&res)).await?;
        self.inner.update(res, opts).await
    }

    async fn teardown(&self, key: &ResourceKey) -> StateResult<bool> {
        self.check(Operation::Teardown, key, None).await?;
        self.inner.teardown(key).await
    }

    async fn destroy(&self, key: &ResourceKey) -> StateResult<()> {
        self.check(Operation::Destroy, key, None).await?;
        self.inner.destroy(key).await
    }

    async fn add_finalizers(&self, key: &ResourceKey, finalizers: &[String]) -> StateResult<()> {
        self.inner.add_finalizers(key, finalizers).await
    }

    async fn remove_finalizers(&self, key: &ResourceKey, finalizers: &[String]) -> StateResult<()> {
        self.inner.remove_finalizers(key, finalizers).await
    }

    async fn watch(
        &self,
        kind: &Kind,
        opts: WatchOptions,
        sink: mpsc::Sender<WatchEvent>,
        cancel: CancellationToken,
    ) -> StateResult<()> {
        self.inner.watch(kind, opts, sink, cancel).await
    }
}
