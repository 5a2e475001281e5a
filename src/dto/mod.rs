//! Wire-level and consumer-facing data shapes.

use time::{OffsetDateTime, format_description::well_known::Rfc3339};

/// Channel protocol event names and frame types.
pub mod channel;
/// Display snapshots published to consumers.
pub mod snapshot;
/// The partial update patch type.
pub mod update;

/// Format a unix-millisecond timestamp as RFC 3339, tolerating bad input.
pub(crate) fn format_epoch_ms(millis: i64) -> String {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .ok()
        .and_then(|ts| ts.format(&Rfc3339).ok())
        .unwrap_or_else(|| "invalid-timestamp".into())
}
