//! Uniform list items for resource-agnostic front-ends.
//!
//! This module provides:
//! - `ListItem`: `(id, namespace)` facet + field lookup + free-text match
//! - `BasicItem`: the generic wrapper carrying the facet and an arbitrary value
//! - `FieldAdapter`: explicit per-type field-name-to-value mapping (no reflection)
//! - `FieldRegistry`: resource type -> adapter, with a metadata-only default

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use crate::Resource;

/// Item of a list result as seen by table/search front-ends.
pub trait ListItem: Send + Sync + std::fmt::Debug {
    fn id(&self) -> &str;
    fn namespace(&self) -> &str;
    /// Look up a field by name; `None` when the item has no such field.
    fn field(&self, name: &str) -> Option<String>;
    /// Free-text match against the item.
    fn matches(&self, search_for: &str) -> bool;
}

/// Generic wrapper exposing `id` and `namespace` for any value.
#[derive(Debug, Clone)]
pub struct BasicItem<T> {
    id: String,
    namespace: String,
    value: T,
}

impl<T> BasicItem<T> {
    pub fn new(id: impl Into<String>, namespace: impl Into<String>, value: T) -> Self {
        Self { id: id.into(), namespace: namespace.into(), value }
    }

    pub fn id(&self) -> &str { &self.id }
    pub fn namespace(&self) -> &str { &self.namespace }
    pub fn unwrap(&self) -> &T { &self.value }
    pub fn into_inner(self) -> T { self.value }

    pub fn field(&self, name: &str) -> Option<String> {
        match name {
            "id" => Some(self.id.clone()),
            "namespace" => Some(self.namespace.clone()),
            _ => None,
        }
    }

    /// Case-insensitive substring match on id and namespace.
    pub fn matches(&self, search_for: &str) -> bool {
        let needle = search_for.to_lowercase();
        self.id.to_lowercase().contains(&needle) || self.namespace.to_lowercase().contains(&needle)
    }
}

/// Per-resource-type field mapping.
pub trait FieldAdapter: Send + Sync {
    /// Field names this adapter knows, in display order.
    fn fields(&self) -> Vec<String>;

    fn field(&self, res: &Resource, name: &str) -> Option<String>;

    /// Default: case-insensitive substring match over every known field value.
    fn matches(&self, res: &Resource, search_for: &str) -> bool {
        let needle = search_for.to_lowercase();
        self.fields()
            .iter()
            .filter_map(|f| self.field(res, f))
            .any(|v| v.to_lowercase().contains(&needle))
    }
}

/// Metadata fields common to every resource, plus `label:<key>` and `spec.<path>` lookups.
#[derive(Debug, Clone, Default)]
pub struct MetadataFields {
    /// Spec paths promoted to named fields, e.g. `("replicas", "spec.replicas")`.
    spec_columns: Vec<(String, String)>,
}

impl MetadataFields {
    pub fn new() -> Self { Self::default() }

    pub fn with_spec_column(mut self, name: impl Into<String>, path: impl Into<String>) -> Self {
        self.spec_columns.push((name.into(), path.into()));
        self
    }
}

const METADATA_FIELDS: &[&str] = &["id", "namespace", "type", "version", "phase", "created", "updated", "finalizers"];

impl FieldAdapter for MetadataFields {
    fn fields(&self) -> Vec<String> {
        let mut out: Vec<String> = METADATA_FIELDS.iter().map(|s| s.to_string()).collect();
        out.extend(self.spec_columns.iter().map(|(n, _)| n.clone()));
        out
    }

    fn field(&self, res: &Resource, name: &str) -> Option<String> {
        let md = &res.metadata;
        match name {
            "id" => return Some(md.id.clone()),
            "namespace" => return Some(md.namespace.clone()),
            "type" => return Some(md.resource_type.clone()),
            "version" => return Some(md.version.to_string()),
            "phase" => return Some(md.phase.to_string()),
            "created" => return md.created.map(|t| t.to_rfc3339()),
            "updated" => return md.updated.map(|t| t.to_rfc3339()),
            "finalizers" => return Some(md.finalizers.iter().cloned().collect::<Vec<_>>().join(",")),
            _ => {}
        }
        if let Some(key) = name.strip_prefix("label:") {
            return md.labels.get(key).map(|s| s.to_string());
        }
        if let Some((_, path)) = self.spec_columns.iter().find(|(n, _)| n == name) {
            return extract_path(&res.spec, path.strip_prefix("spec.").unwrap_or(path)).and_then(render_scalar);
        }
        if let Some(path) = name.strip_prefix("spec.") {
            return extract_path(&res.spec, path).and_then(render_scalar);
        }
        None
    }

    fn matches(&self, res: &Resource, search_for: &str) -> bool {
        let needle = search_for.to_lowercase();
        let hit = |s: &str| s.to_lowercase().contains(&needle);
        self.fields().iter().filter_map(|f| self.field(res, f)).any(|v| hit(&v))
            || res.metadata.labels.iter().any(|(k, v)| hit(k) || hit(v))
    }
}

/// Resource type -> field adapter. Frozen after construction.
#[derive(Clone)]
pub struct FieldRegistry {
    by_type: HashMap<String, Arc<dyn FieldAdapter>>,
    fallback: Arc<dyn FieldAdapter>,
}

impl Default for FieldRegistry {
    fn default() -> Self { Self { by_type: HashMap::new(), fallback: Arc::new(MetadataFields::new()) } }
}

impl FieldRegistry {
    pub fn new() -> Self { Self::default() }

    pub fn with_adapter(mut self, resource_type: impl Into<String>, adapter: Arc<dyn FieldAdapter>) -> Self {
        self.by_type.insert(resource_type.into(), adapter);
        self
    }

    pub fn adapter_for(&self, resource_type: &str) -> Arc<dyn FieldAdapter> {
        self.by_type.get(resource_type).cloned().unwrap_or_else(|| Arc::clone(&self.fallback))
    }
}

impl std::fmt::Debug for FieldRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<_> = self.by_type.keys().collect();
        types.sort();
        f.debug_struct("FieldRegistry").field("types", &types).finish()
    }
}

/// Walk a JSON value following dot fields and an optional `[index]` per segment,
/// e.g. `nodes[0].address`.
pub fn extract_path<'a>(root: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    use serde_json::Value;
    let mut cur = root;
    for seg in path.split('.') {
        if seg.is_empty() { return None; }
        let (key, idx_opt) = if let Some(brk) = seg.find('[') {
            let end = seg.get(brk + 1..)?.find(']')? + brk + 1;
            let idx: usize = seg[brk + 1..end].parse().ok()?;
            (&seg[..brk], Some(idx))
        } else {
            (seg, None)
        };
        if !key.is_empty() {
            match cur {
                Value::Object(map) => cur = map.get(key)?,
                _ => return None,
            }
        }
        if let Some(i) = idx_opt {
            match cur {
                Value::Array(arr) => cur = arr.get(i)?,
                _ => return None,
            }
        }
    }
    Some(cur)
}

fn render_scalar(v: &serde_json::Value) -> Option<String> {
    match v {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ResourceMetadata, Version};

    fn cluster() -> Resource {
        let mut md = ResourceMetadata::new("default", "Cluster", "c1");
        md.version = Version::Value(3);
        md.labels.set("env", "prod");
        md.finalizers.insert("backup".into());
        Resource::new(md, serde_json::json!({ "kubernetesVersion": "1.30.1", "nodes": [{ "address": "10.0.0.1" }] }))
    }

    #[test]
    fn metadata_fields_resolve() {
        let f = MetadataFields::new().with_spec_column("k8s", "spec.kubernetesVersion");
        let r = cluster();
        assert_eq!(f.field(&r, "version").as_deref(), Some("3"));
        assert_eq!(f.field(&r, "label:env").as_deref(), Some("prod"));
        assert_eq!(f.field(&r, "k8s").as_deref(), Some("1.30.1"));
        assert_eq!(f.field(&r, "spec.nodes[0].address").as_deref(), Some("10.0.0.1"));
        assert_eq!(f.field(&r, "finalizers").as_deref(), Some("backup"));
        assert_eq!(f.field(&r, "spec.nodes"), None);
        assert_eq!(f.field(&r, "nope"), None);
        assert!(f.fields().contains(&"k8s".to_string()));
    }

    #[test]
    fn metadata_fields_match_labels_and_values() {
        let f = MetadataFields::new();
        let r = cluster();
        assert!(f.matches(&r, "PROD"));
        assert!(f.matches(&r, "clus"));
        assert!(!f.matches(&r, "staging"));
    }

    #[test]
    fn basic_item_facet() {
        let it = BasicItem::new("c1", "default", 42u32);
        assert_eq!(it.field("id").as_deref(), Some("c1"));
        assert_eq!(it.field("namespace").as_deref(), Some("default"));
        assert_eq!(it.field("other"), None);
        assert!(it.matches("DEF"));
        assert_eq!(*it.unwrap(), 42);
    }

    #[test]
    fn registry_falls_back_to_metadata() {
        let reg = FieldRegistry::new().with_adapter("Cluster", Arc::new(MetadataFields::new().with_spec_column("k8s", "spec.kubernetesVersion")));
        assert!(reg.adapter_for("Cluster").fields().contains(&"k8s".to_string()));
        assert!(!reg.adapter_for("Machine").fields().contains(&"k8s".to_string()));
    }
}
