//! Consumer-facing display snapshots broadcast after every visible change.

use serde::Serialize;

use crate::dto::format_epoch_ms;
use crate::services::connection::ConnectionStatus;
use crate::state::entity::DrawEntity;
use crate::state::merge::CanonicalSet;
use crate::state::reveal::RevealController;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
/// Rendered view of the canonical set, safe to hand straight to a renderer.
pub struct DisplaySnapshot {
    /// Current transport status, for the connection banner.
    pub status: ConnectionStatus,
    /// Entities in template order.
    pub entities: Vec<DisplayEntity>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
/// One entity as it should be displayed right now.
pub struct DisplayEntity {
    /// Stable entity identifier.
    pub entity_key: String,
    /// Draw date of the record.
    pub draw_date: String,
    /// Whether every field has resolved.
    pub is_complete: bool,
    /// RFC 3339 timestamp of the most recent accepted write, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
    /// Fields in tier order with their display values.
    pub fields: Vec<DisplayField>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
/// One field as it should be displayed right now.
pub struct DisplayField {
    /// Field name.
    pub name: String,
    /// Value to show: the resolved value, a randomized placeholder while the
    /// field is actively revealing, or the static sentinel otherwise.
    pub value: String,
    /// Whether the real value is still unknown.
    pub pending: bool,
    /// Whether the field is inside its post-reveal highlight window.
    pub highlighted: bool,
}

impl DisplaySnapshot {
    /// Render the canonical set through the reveal controller.
    pub fn render(
        set: &CanonicalSet,
        reveal: &RevealController,
        status: ConnectionStatus,
    ) -> Self {
        let entities = set
            .entities()
            .values()
            .map(|entity| DisplayEntity::render(entity, reveal))
            .collect();
        Self { status, entities }
    }
}

impl DisplayEntity {
    fn render(entity: &DrawEntity, reveal: &RevealController) -> Self {
        let fields = entity
            .fields
            .iter()
            .map(|(name, slot)| {
                let pending = slot.is_pending();
                let value = if pending {
                    reveal
                        .placeholder_for(&entity.entity_key, name)
                        .unwrap_or(&slot.value)
                        .to_string()
                } else {
                    slot.value.clone()
                };
                DisplayField {
                    name: name.clone(),
                    value,
                    pending,
                    highlighted: reveal.is_highlighted(&entity.entity_key, name),
                }
            })
            .collect();

        Self {
            entity_key: entity.entity_key.clone(),
            draw_date: entity.draw_date.clone(),
            is_complete: entity.is_complete,
            last_updated: entity.last_updated.map(format_epoch_ms),
            fields,
        }
    }
}
