use std::fmt;
use std::sync::Arc;

use corral_core::fields::{BasicItem, FieldAdapter, ListItem};
use corral_core::Resource;

/// List item for a stored resource: the `(id, namespace)` facet plus the
/// fields its type's adapter exposes.
#[derive(Clone)]
pub struct ResourceItem {
    item: BasicItem<Resource>,
    adapter: Arc<dyn FieldAdapter>,
}

impl ResourceItem {
    pub fn new(res: Resource, adapter: Arc<dyn FieldAdapter>) -> Self {
        let item = BasicItem::new(res.metadata.id.clone(), res.metadata.namespace.clone(), res);
        Self { item, adapter }
    }

    pub fn resource(&self) -> &Resource { self.item.unwrap() }

    pub fn into_resource(self) -> Resource { self.item.into_inner() }

    /// Field names in display order.
    pub fn fields(&self) -> Vec<String> { self.adapter.fields() }
}

impl fmt::Debug for ResourceItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceItem").field("key", &self.resource().key().to_string()).finish()
    }
}

impl ListItem for ResourceItem {
    fn id(&self) -> &str { self.item.id() }

    fn namespace(&self) -> &str { self.item.namespace() }

    fn field(&self, name: &str) -> Option<String> {
        self.item.field(name).or_else(|| self.adapter.field(self.resource(), name))
    }

    fn matches(&self, search_for: &str) -> bool {
        self.item.matches(search_for)
            || self.adapter.matches(self.resource(), search_for)
            || corral_search::text_matches(&format!("{}/{}", self.namespace(), self.id()), search_for)
    }
}
