//! Idempotent, order-independent merging of partial updates into the
//! canonical entity set.

use indexmap::IndexMap;
use tracing::debug;

use crate::dto::update::PartialUpdate;
use crate::state::entity::{DrawEntity, DrawTemplate, is_placeholder};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// What a merge pass actually changed, used to drive the reveal controller
/// and the snapshot cache writer.
pub struct MergeOutcome {
    /// Keys of entities whose record changed in any way.
    pub touched: Vec<String>,
    /// `(entity_key, field_name)` pairs that went from placeholder to resolved.
    pub resolved: Vec<(String, String)>,
    /// Field writes discarded because their timestamp was not newer.
    pub stale_fields: usize,
    /// Updates referencing an entity key outside the template.
    pub unknown_entities: usize,
}

impl MergeOutcome {
    /// Whether the pass left the canonical set untouched.
    pub fn is_noop(&self) -> bool {
        self.touched.is_empty()
    }
}

#[derive(Debug, Clone)]
/// The canonical entity set for the current period.
///
/// Always contains exactly the template's entities, in template order; only
/// field values change at runtime. All mutation goes through [`merge`] (and
/// [`seed`] once at startup), which keeps the set convergent regardless of
/// update arrival order.
///
/// [`merge`]: CanonicalSet::merge
/// [`seed`]: CanonicalSet::seed
pub struct CanonicalSet {
    template: DrawTemplate,
    entities: IndexMap<String, DrawEntity>,
}

impl CanonicalSet {
    /// Build an all-placeholder set from the period template.
    pub fn new(template: DrawTemplate) -> Self {
        let entities = template
            .entries()
            .iter()
            .map(|entry| (entry.entity_key.clone(), template.blank_entity(entry)))
            .collect();
        Self { template, entities }
    }

    /// The template this set was built from.
    pub fn template(&self) -> &DrawTemplate {
        &self.template
    }

    /// Entities in template order.
    pub fn entities(&self) -> &IndexMap<String, DrawEntity> {
        &self.entities
    }

    /// Look up one entity by key.
    pub fn get(&self, entity_key: &str) -> Option<&DrawEntity> {
        self.entities.get(entity_key)
    }

    /// Whether no field of any entity has resolved yet.
    pub fn is_all_placeholder(&self) -> bool {
        self.entities
            .values()
            .all(|entity| entity.fields.values().all(|slot| slot.is_pending()))
    }

    /// Pre-seed field values from a cached prior session.
    ///
    /// Only entities and fields present in the template are adopted; anything
    /// else in the cached records is dropped. Placeholder slots are accepted
    /// as-is, so a partially revealed prior session restores faithfully.
    pub fn seed(&mut self, cached: Vec<DrawEntity>) {
        for record in cached {
            let Some(entity) = self.entities.get_mut(&record.entity_key) else {
                debug!(entity = %record.entity_key, "cached entity not in template; dropped");
                continue;
            };
            for (name, slot) in record.fields {
                if let Some(held) = entity.fields.get_mut(&name) {
                    *held = slot;
                }
            }
            entity.last_updated = record.last_updated;
            entity.recompute_complete();
        }
    }

    /// Merge a batch of partial updates, field by field.
    ///
    /// Per-field last-write-wins: a write timestamped not newer than the held
    /// field timestamp is discarded for that field only. A write with no
    /// timestamp always wins and clears the held timestamp. Previously known
    /// values are never reset to placeholder. The pass is idempotent and
    /// order-independent for disjoint-field updates.
    pub fn merge(&mut self, updates: &[PartialUpdate]) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();

        for update in updates {
            let Some(entity) = self.entities.get_mut(&update.entity_key) else {
                debug!(entity = %update.entity_key, "update for entity outside template; ignored");
                outcome.unknown_entities += 1;
                continue;
            };

            let mut changed = false;

            for (name, value) in &update.fields {
                if is_placeholder(value) {
                    continue;
                }
                let Some(slot) = entity.fields.get_mut(name) else {
                    debug!(entity = %update.entity_key, field = %name, "unknown field; ignored");
                    continue;
                };

                let newer = match (slot.updated_at, update.timestamp) {
                    (Some(held), Some(incoming)) => incoming > held,
                    // Untimestamped writes always win (snapshot repair path).
                    _ => true,
                };
                if !newer {
                    debug!(
                        entity = %update.entity_key,
                        field = %name,
                        held = ?slot.updated_at,
                        incoming = ?update.timestamp,
                        "stale field write discarded"
                    );
                    outcome.stale_fields += 1;
                    continue;
                }

                let was_pending = slot.is_pending();
                let value_changed = slot.value != *value;
                slot.value = value.clone();
                slot.updated_at = update.timestamp;

                if value_changed {
                    changed = true;
                }
                if was_pending && value_changed {
                    outcome
                        .resolved
                        .push((update.entity_key.clone(), name.clone()));
                }
            }

            if let Some(date) = &update.draw_date
                && entity.draw_date != *date
            {
                entity.draw_date = date.clone();
                changed = true;
            }

            if changed && let Some(timestamp) = update.timestamp {
                entity.last_updated = Some(entity.last_updated.map_or(timestamp, |held| {
                    held.max(timestamp)
                }));
            }

            let completion_changed = entity.recompute_complete();
            if update.complete && !entity.is_complete {
                debug!(
                    entity = %update.entity_key,
                    "completion marker received while fields still pending; flag stays derived"
                );
            }

            if changed || completion_changed {
                outcome.touched.push(update.entity_key.clone());
            }
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::entity::{FieldSpec, TemplateEntry};

    fn template() -> DrawTemplate {
        DrawTemplate::new(
            vec![
                FieldSpec::new("tier1", 2),
                FieldSpec::new("tier2", 3),
                FieldSpec::new("special", 6),
            ],
            vec![
                TemplateEntry::new("a", "2026-08-24"),
                TemplateEntry::new("b", "2026-08-24"),
                TemplateEntry::new("c", "2026-08-24"),
            ],
        )
    }

    fn keys(set: &CanonicalSet) -> Vec<&str> {
        set.entities().keys().map(String::as_str).collect()
    }

    #[test]
    fn merge_is_idempotent() {
        let mut set = CanonicalSet::new(template());
        let batch = vec![
            PartialUpdate::new("a").with_field("tier1", "12").with_timestamp(5),
            PartialUpdate::new("b").with_field("tier2", "345"),
        ];

        set.merge(&batch);
        let once = set.clone();
        let second = set.merge(&batch);

        assert_eq!(set.entities(), once.entities());
        assert!(second.is_noop());
        assert!(second.resolved.is_empty());
    }

    #[test]
    fn merge_is_order_independent_for_disjoint_fields() {
        let u1 = vec![PartialUpdate::new("a").with_field("tier1", "12").with_timestamp(1)];
        let u2 = vec![PartialUpdate::new("a").with_field("tier2", "345").with_timestamp(2)];

        let mut forward = CanonicalSet::new(template());
        forward.merge(&u1);
        forward.merge(&u2);

        let mut reverse = CanonicalSet::new(template());
        reverse.merge(&u2);
        reverse.merge(&u1);

        assert_eq!(forward.entities(), reverse.entities());
    }

    #[test]
    fn entity_set_is_invariant_under_any_updates() {
        let mut set = CanonicalSet::new(template());
        let outcome = set.merge(&[
            PartialUpdate::new("a").with_field("tier1", "12"),
            PartialUpdate::new("ghost").with_field("tier1", "99"),
        ]);

        assert_eq!(keys(&set), vec!["a", "b", "c"]);
        assert_eq!(outcome.unknown_entities, 1);
        assert!(set.get("ghost").is_none());
    }

    #[test]
    fn stale_write_is_discarded_per_field() {
        let mut set = CanonicalSet::new(template());
        set.merge(&[PartialUpdate::new("a").with_field("tier1", "12").with_timestamp(1)]);
        let outcome =
            set.merge(&[PartialUpdate::new("a").with_field("tier1", "99").with_timestamp(0)]);

        assert_eq!(set.get("a").unwrap().fields["tier1"].value, "12");
        assert_eq!(outcome.stale_fields, 1);
        assert!(outcome.is_noop());
    }

    #[test]
    fn untimestamped_write_always_wins() {
        let mut set = CanonicalSet::new(template());
        set.merge(&[PartialUpdate::new("a").with_field("tier1", "12").with_timestamp(9)]);
        set.merge(&[PartialUpdate::new("a").with_field("tier1", "34")]);

        let slot = &set.get("a").unwrap().fields["tier1"];
        assert_eq!(slot.value, "34");
        assert_eq!(slot.updated_at, None);
    }

    #[test]
    fn absent_fields_keep_their_values() {
        let mut set = CanonicalSet::new(template());
        set.merge(&[PartialUpdate::new("a").with_field("tier1", "12")]);
        set.merge(&[PartialUpdate::new("a").with_field("tier2", "345")]);

        let entity = set.get("a").unwrap();
        assert_eq!(entity.fields["tier1"].value, "12");
        assert_eq!(entity.fields["tier2"].value, "345");
    }

    #[test]
    fn placeholder_values_never_clobber_resolved_ones() {
        let mut set = CanonicalSet::new(template());
        set.merge(&[PartialUpdate::new("a").with_field("tier1", "12")]);
        set.merge(&[PartialUpdate::new("a").with_field("tier1", "…")]);

        assert_eq!(set.get("a").unwrap().fields["tier1"].value, "12");
    }

    #[test]
    fn completion_is_derived_from_field_state() {
        let mut set = CanonicalSet::new(template());
        let early = set.merge(&[{
            let mut update = PartialUpdate::new("a").with_field("tier1", "12");
            update.complete = true;
            update
        }]);
        assert!(!set.get("a").unwrap().is_complete);
        assert_eq!(early.touched, vec!["a".to_string()]);

        set.merge(&[PartialUpdate::new("a")
            .with_field("tier2", "345")
            .with_field("special", "678901")]);
        assert!(set.get("a").unwrap().is_complete);
    }

    #[test]
    fn mixed_update_sequence_converges() {
        let mut set = CanonicalSet::new(template());

        set.merge(&[PartialUpdate::new("a").with_field("tier1", "12").with_timestamp(1)]);
        set.merge(&[PartialUpdate::new("a").with_field("tier1", "99").with_timestamp(0)]);
        assert_eq!(set.get("a").unwrap().fields["tier1"].value, "12");

        set.merge(&[PartialUpdate::new("b").with_field("tier1", "34")]);
        assert_eq!(keys(&set), vec!["a", "b", "c"]);
        assert_eq!(set.get("b").unwrap().fields["tier1"].value, "34");
        assert!(set.get("b").unwrap().fields["tier2"].is_pending());
        assert!(set.get("c").unwrap().fields.values().all(|slot| slot.is_pending()));
    }

    #[test]
    fn resolved_transitions_are_reported_once() {
        let mut set = CanonicalSet::new(template());
        let first = set.merge(&[PartialUpdate::new("a").with_field("tier1", "12").with_timestamp(1)]);
        assert_eq!(first.resolved, vec![("a".to_string(), "tier1".to_string())]);

        let repeat =
            set.merge(&[PartialUpdate::new("a").with_field("tier1", "12").with_timestamp(2)]);
        assert!(repeat.resolved.is_empty());
    }

    #[test]
    fn seed_restores_only_template_entities_and_fields() {
        let template = template();
        let mut set = CanonicalSet::new(template.clone());

        let mut cached = template.blank_entity(&template.entries()[0]);
        cached.fields["tier1"].value = "12".into();
        cached.fields["tier1"].updated_at = Some(7);
        let mut stranger = template.blank_entity(&template.entries()[1]);
        stranger.entity_key = "ghost".into();

        set.seed(vec![cached, stranger]);

        assert_eq!(keys(&set), vec!["a", "b", "c"]);
        let slot = &set.get("a").unwrap().fields["tier1"];
        assert_eq!(slot.value, "12");
        assert_eq!(slot.updated_at, Some(7));
        assert!(!set.is_all_placeholder());
    }
}
