//! Normalization of heterogeneous server payloads into partial updates.
//!
//! Servers push the same data in three shapes: a single keyed record, a map
//! keyed by entity, or an array of records. Everything here is pure and
//! total: malformed input normalizes to an empty list, never to a panic.

use serde_json::Value;
use tracing::debug;

use crate::dto::channel::{EVENT_COMPLETE, EVENT_FIELD_UPDATE, EVENT_LATEST, EVENT_LATEST_ALL};
use crate::dto::update::PartialUpdate;
use crate::state::entity::is_placeholder;

/// Record keys that carry metadata rather than field values.
const RESERVED_KEYS: &[&str] = &["entityKey", "drawDate", "timestamp", "lastUpdated", "isComplete"];

/// Normalize the payload of a named server event into partial updates.
///
/// `latest` / `latest-all` accept all three record shapes; `field-update`
/// accepts the single-field shape; `complete` additionally marks every
/// produced update as a completion. Unknown events normalize to nothing.
pub fn normalize_event(event: &str, data: &Value) -> Vec<PartialUpdate> {
    match event {
        EVENT_LATEST | EVENT_LATEST_ALL => normalize(data),
        EVENT_FIELD_UPDATE => normalize_field_update(data).into_iter().collect(),
        EVENT_COMPLETE => {
            let mut updates = normalize(data);
            for update in &mut updates {
                update.complete = true;
            }
            updates
        }
        other => {
            debug!(event = other, "unhandled server event; ignored");
            Vec::new()
        }
    }
}

/// Normalize a snapshot payload: single record, keyed map, or array.
pub fn normalize(payload: &Value) -> Vec<PartialUpdate> {
    match payload {
        Value::Object(map) => {
            if let Some(key) = map.get("entityKey").and_then(Value::as_str) {
                record_update(key.to_string(), payload).into_iter().collect()
            } else {
                // Keyed map: the map key identifies the entity and wins over
                // any key embedded in the record itself.
                map.iter()
                    .filter_map(|(key, record)| {
                        if record.is_object() {
                            record_update(key.clone(), record)
                        } else {
                            debug!(entity = %key, "map entry is not a record; dropped");
                            None
                        }
                    })
                    .collect()
            }
        }
        Value::Array(records) => records
            .iter()
            .filter_map(|record| {
                match record.get("entityKey").and_then(Value::as_str) {
                    Some(key) => record_update(key.to_string(), record),
                    None => {
                        debug!("array element without entityKey; dropped");
                        None
                    }
                }
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Normalize the single-field `field-update` shape.
pub fn normalize_field_update(payload: &Value) -> Option<PartialUpdate> {
    let key = payload.get("entityKey").and_then(Value::as_str)?;
    let field = payload.get("fieldName").and_then(Value::as_str)?;
    let value = payload.get("value").and_then(scalar_to_string)?;
    if is_placeholder(&value) {
        debug!(entity = key, field, "field update carrying a placeholder; dropped");
        return None;
    }

    let mut update = PartialUpdate::new(key).with_field(field, value);
    update.timestamp = payload.get("timestamp").and_then(Value::as_i64);
    Some(update)
}

/// Build one partial update from a flat record object.
///
/// Reserved keys become metadata; every other scalar entry is a field value.
/// Placeholder-valued entries are dropped so a server snapshot of a still
/// pending field can never clobber a resolved one (absence ≠ placeholder).
fn record_update(entity_key: String, record: &Value) -> Option<PartialUpdate> {
    let object = record.as_object()?;
    let mut update = PartialUpdate::new(entity_key);

    update.draw_date = object
        .get("drawDate")
        .and_then(Value::as_str)
        .map(str::to_string);
    update.timestamp = object
        .get("timestamp")
        .or_else(|| object.get("lastUpdated"))
        .and_then(Value::as_i64);
    update.complete = object
        .get("isComplete")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    for (name, value) in object {
        if RESERVED_KEYS.contains(&name.as_str()) {
            continue;
        }
        if let Some(value) = scalar_to_string(value)
            && !is_placeholder(&value)
        {
            update.fields.insert(name.clone(), value);
        }
    }

    if update.is_empty() {
        None
    } else {
        Some(update)
    }
}

/// Accept strings and numbers as field values; anything else is dropped.
fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
