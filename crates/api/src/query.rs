use corral_core::{Kind, ResourceKey, StateError, StateResult};
use serde::{Deserialize, Serialize};

/// Query shared by every runtime operation. Built with chained setters:
///
/// ```
/// use corral_api::QueryOptions;
/// let q = QueryOptions::new("default", "Cluster").name("c1").label_selector("env=prod");
/// assert_eq!(q.name.as_deref(), Some("c1"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryOptions {
    pub namespace: String,
    pub resource_type: String,
    /// Exact id; required by get and delete.
    pub name: Option<String>,
    /// Each entry parses into one label query; all must hold.
    pub label_selectors: Vec<String>,
    /// Watch replay depth; 0 bootstraps from current contents.
    pub tail_events: usize,
    /// Delete stops after teardown instead of waiting to destroy.
    pub teardown_only: bool,
    /// Free-text filter applied to list items.
    pub search: Option<String>,
}

impl QueryOptions {
    pub fn new(namespace: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), resource_type: resource_type.into(), ..Default::default() }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn label_selector(mut self, selector: impl Into<String>) -> Self {
        self.label_selectors.push(selector.into());
        self
    }

    pub fn label_selectors<I, S>(mut self, selectors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.label_selectors.extend(selectors.into_iter().map(Into::into));
        self
    }

    pub fn tail_events(mut self, n: usize) -> Self {
        self.tail_events = n;
        self
    }

    pub fn teardown_only(mut self, on: bool) -> Self {
        self.teardown_only = on;
        self
    }

    pub fn search(mut self, text: impl Into<String>) -> Self {
        self.search = Some(text.into());
        self
    }

    pub fn kind(&self) -> Kind { Kind::new(self.namespace.clone(), self.resource_type.clone()) }

    /// Identity addressed by the query; fails when no name is set.
    pub fn key(&self) -> StateResult<ResourceKey> {
        match self.name.as_deref() {
            Some(name) if !name.is_empty() => {
                Ok(ResourceKey::new(self.namespace.clone(), self.resource_type.clone(), name.to_string()))
            }
            _ => Err(StateError::invalid_query(format!("{}/{}", self.namespace, self.resource_type), "a resource name is required")),
        }
    }
}
