//! Stock rules.

use async_trait::async_trait;

use crate::{Operation, ValidationRequest, ValidationRule};

/// Rule backed by a plain closure.
pub struct FnRule<F> {
    name: String,
    ops: Option<Vec<Operation>>,
    f: F,
}

impl<F> FnRule<F>
where
    F: Fn(&ValidationRequest) -> anyhow::Result<()> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self { Self { name: name.into(), ops: None, f } }

    /// Restrict to the given operations (default: all).
    pub fn on(mut self, ops: &[Operation]) -> Self {
        self.ops = Some(ops.to_vec());
        self
    }
}

#[async_trait]
impl<F> ValidationRule for FnRule<F>
where
    F: Fn(&ValidationRequest) -> anyhow::Result<()> + Send + Sync,
{
    fn name(&self) -> &str { &self.name }

    fn applies_to(&self, op: Operation, _resource_type: &str) -> bool {
        self.ops.as_ref().map(|ops| ops.contains(&op)).unwrap_or(true)
    }

    async fn validate(&self, req: &ValidationRequest) -> anyhow::Result<()> { (self.f)(req) }
}

/// A rule limited to one resource type.
pub struct TypeScoped<R> {
    resource_type: String,
    rule: R,
}

pub fn type_rule<R: ValidationRule>(resource_type: impl Into<String>, rule: R) -> TypeScoped<R> {
    TypeScoped { resource_type: resource_type.into(), rule }
}

#[async_trait]
impl<R: ValidationRule> ValidationRule for TypeScoped<R> {
    fn name(&self) -> &str { self.rule.name() }

    fn applies_to(&self, op: Operation, resource_type: &str) -> bool {
        resource_type == self.resource_type && self.rule.applies_to(op, resource_type)
    }

    async fn validate(&self, req: &ValidationRequest) -> anyhow::Result<()> { self.rule.validate(req).await }
}

/// Rejects label keys the selector grammar could never address.
#[derive(Debug, Clone, Copy, Default)]
pub struct LabelKeyRule;

#[async_trait]
impl ValidationRule for LabelKeyRule {
    fn name(&self) -> &str { "label-keys" }

    fn applies_to(&self, op: Operation, _resource_type: &str) -> bool { matches!(op, Operation::Create | Operation::Update) }

    async fn validate(&self, req: &ValidationRequest) -> anyhow::Result<()> {
        let Some(res) = req.proposed.as_ref() else { return Ok(()) };
        if let Some((bad, _)) = res.metadata.labels.iter().find(|(k, _)| !corral_search::is_valid_key(k)) {
            anyhow::bail!("invalid label key {:?}", bad);
        }
        Ok(())
    }
}

#[cfg(feature = "jsonschema-validate")]
mod schema {
    use anyhow::{anyhow, Context, Result};
    use async_trait::async_trait;
    use jsonschema::{Draft, JSONSchema};

    use crate::{Operation, ValidationRequest, ValidationRule};

    /// Validates the spec of one resource type against a JSON Schema (draft 7).
    pub struct SchemaRule {
        name: String,
        resource_type: String,
        compiled: JSONSchema,
    }

    impl SchemaRule {
        pub fn new(resource_type: impl Into<String>, schema: serde_json::Value) -> Result<Self> {
            let resource_type = resource_type.into();
            // jsonschema 0.17 wants a 'static schema; rules live for the process anyway.
            let schema: &'static serde_json::Value = Box::leak(Box::new(schema));
            let compiled = JSONSchema::options()
                .with_draft(Draft::Draft7)
                .compile(schema)
                .map_err(|e| anyhow!("compiling schema for {}: {}", resource_type, e))?;
            Ok(Self { name: format!("schema:{}", resource_type), resource_type, compiled })
        }

        pub fn from_yaml(resource_type: impl Into<String>, yaml: &str) -> Result<Self> {
            let doc: serde_yaml::Value = serde_yaml::from_str(yaml).context("parsing schema YAML")?;
            let json = serde_json::to_value(doc).context("converting schema YAML to JSON")?;
            Self::new(resource_type, json)
        }
    }

    #[async_trait]
    impl ValidationRule for SchemaRule {
        fn name(&self) -> &str { &self.name }

        fn applies_to(&self, op: Operation, resource_type: &str) -> bool {
            resource_type == self.resource_type && matches!(op, Operation::Create | Operation::Update)
        }

        async fn validate(&self, req: &ValidationRequest) -> Result<()> {
            let Some(res) = req.proposed.as_ref() else { return Ok(()) };
            if let Err(errors) = self.compiled.validate(&res.spec) {
                let issues: Vec<String> = errors
                    .map(|err| {
                        let path = err.instance_path.to_string();
                        if path.is_empty() { err.to_string() } else { format!("{}: {}", path, err) }
                    })
                    .collect();
                anyhow::bail!("{}", issues.join("; "));
            }
            Ok(())
        }
    }
}

#[cfg(feature = "jsonschema-validate")]
pub use schema::SchemaRule;
