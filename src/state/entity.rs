//! Canonical entity records and the per-period template they are built from.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Sentinel written into every field slot until its real value arrives.
pub const PLACEHOLDER: &str = "…";

/// All values treated as "not yet known" when they appear in a field slot.
const PLACEHOLDER_SENTINELS: &[&str] = &["…", "***", ""];

/// Whether a raw value is one of the placeholder sentinels.
pub fn is_placeholder(value: &str) -> bool {
    PLACEHOLDER_SENTINELS.contains(&value)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// A single field of an entity: either a placeholder or a resolved value,
/// plus the timestamp of the write that produced it.
pub struct FieldSlot {
    /// Current value, possibly a placeholder sentinel.
    pub value: String,
    /// Unix-millisecond timestamp of the most recent accepted write, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
}

impl FieldSlot {
    /// A slot holding the canonical placeholder and no timestamp.
    pub fn pending() -> Self {
        Self {
            value: PLACEHOLDER.to_string(),
            updated_at: None,
        }
    }

    /// Whether the slot still holds a placeholder sentinel.
    pub fn is_pending(&self) -> bool {
        is_placeholder(&self.value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// One live-updating record in the canonical set (one province's results).
pub struct DrawEntity {
    /// Stable identifier of the entity within the current period.
    pub entity_key: String,
    /// Draw date the record belongs to, as supplied by the template or server.
    pub draw_date: String,
    /// Ordered field slots, lowest prize tier first.
    pub fields: IndexMap<String, FieldSlot>,
    /// Unix-millisecond timestamp of the most recent accepted field write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<i64>,
    /// Derived: true iff no field still holds a placeholder sentinel.
    pub is_complete: bool,
}

impl DrawEntity {
    /// Recompute the derived completion flag, returning whether it changed.
    pub fn recompute_complete(&mut self) -> bool {
        let complete = self.fields.values().all(|slot| !slot.is_pending());
        let changed = complete != self.is_complete;
        self.is_complete = complete;
        changed
    }

    /// Name of the earliest field (in tier order) still holding a placeholder.
    pub fn first_pending_field(&self) -> Option<&str> {
        self.fields
            .iter()
            .find(|(_, slot)| slot.is_pending())
            .map(|(name, _)| name.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Declaration of one field in the template roster.
pub struct FieldSpec {
    /// Field name as it appears on the wire.
    pub name: String,
    /// Number of digits shown while the field is animated.
    pub digits: u8,
}

impl FieldSpec {
    /// Convenience constructor.
    pub fn new(name: impl Into<String>, digits: u8) -> Self {
        Self {
            name: name.into(),
            digits,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// One expected entity in the template.
pub struct TemplateEntry {
    /// Stable entity identifier.
    pub entity_key: String,
    /// Draw date the entity's record is created with.
    pub draw_date: String,
}

impl TemplateEntry {
    /// Convenience constructor.
    pub fn new(entity_key: impl Into<String>, draw_date: impl Into<String>) -> Self {
        Self {
            entity_key: entity_key.into(),
            draw_date: draw_date.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// The fixed, externally-determined set of entities expected for the current
/// period, together with the ordered field roster shared by all of them.
///
/// The canonical set always contains exactly these entities, in this order;
/// a new period replaces the whole template rather than patching it.
pub struct DrawTemplate {
    fields: Vec<FieldSpec>,
    entries: Vec<TemplateEntry>,
}

impl DrawTemplate {
    /// Build a template from the field roster and the day's expected entities.
    pub fn new(fields: Vec<FieldSpec>, entries: Vec<TemplateEntry>) -> Self {
        Self { fields, entries }
    }

    /// Field roster in reveal priority order (lowest tier first).
    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Expected entities in display order.
    pub fn entries(&self) -> &[TemplateEntry] {
        &self.entries
    }

    /// Digit width configured for the named field, if it exists.
    pub fn field_digits(&self, name: &str) -> Option<u8> {
        self.fields
            .iter()
            .find(|spec| spec.name == name)
            .map(|spec| spec.digits)
    }

    /// A blank all-placeholder record for one template entry.
    pub fn blank_entity(&self, entry: &TemplateEntry) -> DrawEntity {
        DrawEntity {
            entity_key: entry.entity_key.clone(),
            draw_date: entry.draw_date.clone(),
            fields: self
                .fields
                .iter()
                .map(|spec| (spec.name.clone(), FieldSlot::pending()))
                .collect(),
            last_updated: None,
            is_complete: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> DrawTemplate {
        DrawTemplate::new(
            vec![FieldSpec::new("tier8", 2), FieldSpec::new("tier7", 3)],
            vec![TemplateEntry::new("hcm", "2026-08-24")],
        )
    }

    #[test]
    fn blank_entity_is_all_placeholder() {
        let template = template();
        let entity = template.blank_entity(&template.entries()[0]);
        assert_eq!(entity.fields.len(), 2);
        assert!(entity.fields.values().all(FieldSlot::is_pending));
        assert!(!entity.is_complete);
        assert_eq!(entity.first_pending_field(), Some("tier8"));
    }

    #[test]
    fn sentinel_variants_all_count_as_placeholder() {
        assert!(is_placeholder("…"));
        assert!(is_placeholder("***"));
        assert!(is_placeholder(""));
        assert!(!is_placeholder("0"));
        assert!(!is_placeholder("12"));
    }

    #[test]
    fn completion_flag_follows_field_state() {
        let template = template();
        let mut entity = template.blank_entity(&template.entries()[0]);
        entity.fields["tier8"].value = "12".into();
        assert!(!entity.recompute_complete());
        assert!(!entity.is_complete);
        entity.fields["tier7"].value = "345".into();
        assert!(entity.recompute_complete());
        assert!(entity.is_complete);
        assert_eq!(entity.first_pending_field(), None);
    }

    #[test]
    fn entity_round_trips_through_json() {
        let template = template();
        let entity = template.blank_entity(&template.entries()[0]);
        let json = serde_json::to_string(&entity).unwrap();
        assert!(json.contains("\"entityKey\":\"hcm\""));
        let back: DrawEntity = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entity);
    }
}
