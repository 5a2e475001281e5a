//! The sparse patch type produced by the normalizer and consumed by the merger.

use indexmap::IndexMap;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
/// A sparse patch naming one entity and a subset of its fields.
///
/// Fields absent from the patch are left untouched by the merge; a patch never
/// carries placeholder values for fields it does not intend to update.
pub struct PartialUpdate {
    /// Key of the entity this patch applies to.
    pub entity_key: String,
    /// Resolved values for the subset of fields being updated.
    pub fields: IndexMap<String, String>,
    /// Draw date carried by the patch, when the server supplied one.
    pub draw_date: Option<String>,
    /// Unix-millisecond timestamp of the patch, when the server supplied one.
    pub timestamp: Option<i64>,
    /// Whether the server flagged the entity as fully resolved.
    pub complete: bool,
}

impl PartialUpdate {
    /// An empty patch for the given entity.
    pub fn new(entity_key: impl Into<String>) -> Self {
        Self {
            entity_key: entity_key.into(),
            ..Self::default()
        }
    }

    /// Add one resolved field value.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Attach a patch timestamp.
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Whether the patch carries nothing the merger could apply.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.draw_date.is_none() && !self.complete
    }
}
