//! Per-field reveal animation state machine.
//!
//! A field with no value yet shows a randomized placeholder that re-rolls on
//! every shared tick; once the real value is merged the field keeps a short
//! highlight before settling to the static value. One controller instance
//! multiplexes every active `(entity, field)` pair over a single tick.

use std::fmt::Write as _;
use std::time::Duration;

use indexmap::IndexMap;
use rand::Rng;
use tokio::time::Instant;

use crate::state::merge::{CanonicalSet, MergeOutcome};

#[derive(Debug, Clone, PartialEq, Eq)]
/// Animation phase of one `(entity, field)` pair. Absence means idle.
pub enum RevealPhase {
    /// Field is still pending and actively animated; holds the digits
    /// currently displayed in place of the value.
    Revealing {
        /// Randomized digit string re-rolled on every tick.
        placeholder: String,
    },
    /// Real value has landed; the highlight flag is kept until the deadline.
    Settling {
        /// When the highlight is dropped.
        until: Instant,
    },
}

#[derive(Debug)]
/// Ephemeral reveal state for every animated field of the canonical set.
///
/// Never persisted; torn down with the engine. Dead channels simply stop the
/// tick, freezing any active placeholder harmlessly.
pub struct RevealController {
    settle_delay: Duration,
    states: IndexMap<(String, String), RevealPhase>,
}

impl RevealController {
    /// Create a controller with the configured highlight settle delay.
    pub fn new(settle_delay: Duration) -> Self {
        Self {
            settle_delay,
            states: IndexMap::new(),
        }
    }

    /// Select the animated field for every entity of the set.
    ///
    /// Only the earliest still-pending field per entity (tier order) is
    /// actively revealing; entities with no pending fields get no state.
    pub fn activate(&mut self, set: &CanonicalSet) {
        for key in set.entities().keys() {
            self.select_for_entity(set, key);
        }
    }

    /// Absorb the outcome of a merge pass.
    ///
    /// Must run before the merged snapshot is published so a resolved value is
    /// never displayed next to a stale placeholder: fields that resolved flip
    /// to [`RevealPhase::Settling`] here, and each touched entity re-selects
    /// its next pending field.
    pub fn absorb(&mut self, set: &CanonicalSet, outcome: &MergeOutcome, now: Instant) {
        for pair in &outcome.resolved {
            self.states.insert(
                pair.clone(),
                RevealPhase::Settling {
                    until: now + self.settle_delay,
                },
            );
        }
        for key in &outcome.touched {
            self.select_for_entity(set, key);
        }
    }

    /// Advance the shared tick: re-roll every active placeholder and drop
    /// highlights whose settle deadline has passed.
    ///
    /// Returns whether anything visible changed.
    pub fn tick(&mut self, set: &CanonicalSet, now: Instant) -> bool {
        let mut changed = false;
        let mut expired = Vec::new();

        for ((entity_key, field), phase) in &mut self.states {
            match phase {
                RevealPhase::Revealing { placeholder } => {
                    let digits = set
                        .template()
                        .field_digits(field)
                        .unwrap_or(2);
                    *placeholder = roll_placeholder(digits);
                    changed = true;
                }
                RevealPhase::Settling { until } => {
                    if *until <= now {
                        expired.push((entity_key.clone(), field.clone()));
                    }
                }
            }
        }

        for pair in expired {
            self.states.shift_remove(&pair);
            changed = true;
        }

        changed
    }

    /// Digits currently displayed for a still-pending field, if it is the
    /// actively revealing one.
    pub fn placeholder_for(&self, entity_key: &str, field: &str) -> Option<&str> {
        match self.states.get(&(entity_key.to_string(), field.to_string())) {
            Some(RevealPhase::Revealing { placeholder }) => Some(placeholder),
            _ => None,
        }
    }

    /// Whether the field is currently in its post-reveal highlight window.
    pub fn is_highlighted(&self, entity_key: &str, field: &str) -> bool {
        matches!(
            self.states.get(&(entity_key.to_string(), field.to_string())),
            Some(RevealPhase::Settling { .. })
        )
    }

    /// Whether the field is actively animating a placeholder.
    pub fn is_revealing(&self, entity_key: &str, field: &str) -> bool {
        matches!(
            self.states.get(&(entity_key.to_string(), field.to_string())),
            Some(RevealPhase::Revealing { .. })
        )
    }

    /// Whether any animation state exists at all.
    pub fn is_idle(&self) -> bool {
        self.states.is_empty()
    }

    /// Ensure exactly the earliest pending field of `entity_key` is revealing.
    fn select_for_entity(&mut self, set: &CanonicalSet, entity_key: &str) {
        let Some(entity) = set.get(entity_key) else {
            return;
        };
        let next = entity.first_pending_field().map(str::to_string);

        // Drop revealing states for every other pending field of this entity;
        // settling states are left to expire on their own.
        self.states.retain(|(key, field), phase| {
            if key.as_str() != entity_key {
                return true;
            }
            match phase {
                RevealPhase::Revealing { .. } => next.as_deref() == Some(field.as_str()),
                RevealPhase::Settling { .. } => true,
            }
        });

        if let Some(field) = next {
            let digits = set.template().field_digits(&field).unwrap_or(2);
            self.states
                .entry((entity_key.to_string(), field))
                .or_insert_with(|| RevealPhase::Revealing {
                    placeholder: roll_placeholder(digits),
                });
        }
    }
}

/// Roll a random digit string of the given width.
fn roll_placeholder(digits: u8) -> String {
    let mut rng = rand::rng();
    let mut out = String::with_capacity(digits as usize);
    for _ in 0..digits {
        let _ = write!(out, "{}", rng.random_range(0..10u8));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dto::update::PartialUpdate;
    use crate::state::entity::{DrawTemplate, FieldSpec, TemplateEntry};

    fn set() -> CanonicalSet {
        CanonicalSet::new(DrawTemplate::new(
            vec![
                FieldSpec::new("tier1", 2),
                FieldSpec::new("tier2", 3),
                FieldSpec::new("special", 6),
            ],
            vec![
                TemplateEntry::new("a", "2026-08-24"),
                TemplateEntry::new("b", "2026-08-24"),
            ],
        ))
    }

    #[test]
    fn activation_selects_only_the_earliest_pending_field() {
        let set = set();
        let mut reveal = RevealController::new(Duration::from_millis(800));
        reveal.activate(&set);

        assert!(reveal.is_revealing("a", "tier1"));
        assert!(!reveal.is_revealing("a", "tier2"));
        assert!(reveal.is_revealing("b", "tier1"));
    }

    #[test]
    fn placeholder_matches_configured_digit_width() {
        let set = set();
        let mut reveal = RevealController::new(Duration::from_millis(800));
        reveal.activate(&set);

        let rolled = reveal.placeholder_for("a", "tier1").unwrap();
        assert_eq!(rolled.len(), 2);
        assert!(rolled.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn merge_advances_selection_and_highlights_resolved_field() {
        let mut set = set();
        let mut reveal = RevealController::new(Duration::from_millis(800));
        reveal.activate(&set);

        let now = Instant::now();
        let outcome = set.merge(&[PartialUpdate::new("a").with_field("tier1", "12")]);
        reveal.absorb(&set, &outcome, now);

        assert!(reveal.is_highlighted("a", "tier1"));
        assert!(!reveal.is_revealing("a", "tier1"));
        assert!(reveal.is_revealing("a", "tier2"));
    }

    #[test]
    fn highlight_clears_within_settle_delay_and_never_returns() {
        let mut set = set();
        let delay = Duration::from_millis(800);
        let mut reveal = RevealController::new(delay);
        reveal.activate(&set);

        let now = Instant::now();
        let outcome = set.merge(&[PartialUpdate::new("a").with_field("tier1", "12")]);
        reveal.absorb(&set, &outcome, now);

        reveal.tick(&set, now);
        assert!(reveal.is_highlighted("a", "tier1"));
        reveal.tick(&set, now + delay);
        assert!(!reveal.is_highlighted("a", "tier1"));
        assert!(!reveal.is_revealing("a", "tier1"));

        // Further merges never re-animate a resolved field.
        let outcome = set.merge(&[PartialUpdate::new("a").with_field("tier2", "345")]);
        reveal.absorb(&set, &outcome, now + delay);
        reveal.tick(&set, now + delay * 2);
        assert!(!reveal.is_revealing("a", "tier1"));
        assert!(!reveal.is_highlighted("a", "tier1"));
    }

    #[test]
    fn complete_entity_carries_no_animation_state() {
        let mut set = set();
        let mut reveal = RevealController::new(Duration::from_millis(0));
        reveal.activate(&set);

        let now = Instant::now();
        let outcome = set.merge(&[PartialUpdate::new("a")
            .with_field("tier1", "12")
            .with_field("tier2", "345")
            .with_field("special", "678901")]);
        reveal.absorb(&set, &outcome, now);
        reveal.tick(&set, now + Duration::from_millis(1));

        assert!(!reveal.is_revealing("a", "tier1"));
        assert!(!reveal.is_revealing("a", "tier2"));
        assert!(!reveal.is_revealing("a", "special"));
        // The untouched entity keeps animating.
        assert!(reveal.is_revealing("b", "tier1"));
    }

    #[test]
    fn tick_rerolls_active_placeholders() {
        let set = set();
        let mut reveal = RevealController::new(Duration::from_millis(800));
        reveal.activate(&set);

        let now = Instant::now();
        assert!(reveal.tick(&set, now));
        let rolled = reveal.placeholder_for("b", "tier1").unwrap();
        assert_eq!(rolled.len(), 2);
    }
}
