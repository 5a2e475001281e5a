//! Logical channel protocol: event names and the fan-out payload type.
//!
//! Every wire event is named `<topic>:<suffix>`; the suffix constants below
//! are the full protocol surface. Transport framing is out of scope.

use serde_json::Value;

/// Client→server request for the full current snapshot.
pub const EVENT_GET_LATEST: &str = "get-latest";
/// Server→client snapshot: one record, a keyed map, or an array of records.
pub const EVENT_LATEST: &str = "latest";
/// Server→client snapshot covering every known entity, same shape rules.
pub const EVENT_LATEST_ALL: &str = "latest-all";
/// Server→client single-field update `{entityKey, fieldName, value, timestamp}`.
pub const EVENT_FIELD_UPDATE: &str = "field-update";
/// Server→client marker that one or more entities are fully resolved.
pub const EVENT_COMPLETE: &str = "complete";
/// Server→client recoverable error `{message}`; the connection stays open.
pub const EVENT_ERROR: &str = "error";
/// Heartbeat request sent while connected.
pub const EVENT_PING: &str = "ping";
/// Heartbeat response, consumed silently.
pub const EVENT_PONG: &str = "pong";

/// Build the full wire name for an event on the given topic.
pub fn event_name(topic: &str, suffix: &str) -> String {
    format!("{topic}:{suffix}")
}

/// Split a full wire name back into its suffix, if it belongs to the topic.
pub fn event_suffix<'a>(topic: &str, event: &'a str) -> Option<&'a str> {
    event
        .strip_prefix(topic)
        .and_then(|rest| rest.strip_prefix(':'))
}

#[derive(Debug, Clone)]
/// One frame travelling over a channel link, in either direction.
pub struct Frame {
    /// Full event name (`<topic>:<suffix>`).
    pub event: String,
    /// JSON payload; `Null` for payload-less events.
    pub data: Value,
}

impl Frame {
    /// Build a frame for the given topic and event suffix.
    pub fn new(topic: &str, suffix: &str, data: Value) -> Self {
        Self {
            event: event_name(topic, suffix),
            data,
        }
    }
}

#[derive(Debug, Clone)]
/// Event fanned out to every subscriber of a topic.
pub enum ChannelEvent {
    /// The underlying channel (re)connected; a snapshot request went out.
    Connected,
    /// The underlying channel dropped; reconnection is in progress.
    Disconnected,
    /// A data-bearing server event, identified by its suffix.
    Payload {
        /// Event suffix (e.g. `latest`, `field-update`).
        event: String,
        /// Raw JSON payload as received.
        data: Value,
    },
    /// Recoverable server-side error; the connection remains open.
    ServerError {
        /// Message supplied by the server, or a stand-in when malformed.
        message: String,
    },
    /// Terminal failure: the bounded retry budget was exhausted.
    ConnectionFailed {
        /// Description of the final connection attempt's failure.
        message: String,
    },
}
