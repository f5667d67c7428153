//! Request, response, and event payload types for the HTTP surface.

use time::{OffsetDateTime, format_description::well_known::Rfc3339};

pub mod health;
pub mod room;
pub mod sse;
pub mod turn;
pub mod validation;
pub mod ws;

/// Render a store-clock instant (milliseconds since the Unix epoch) as an
/// RFC3339 string for response payloads.
pub(crate) fn format_timestamp_ms(timestamp_ms: i64) -> String {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(timestamp_ms) * 1_000_000)
        .ok()
        .and_then(|instant| instant.format(&Rfc3339).ok())
        .unwrap_or_else(|| "invalid-timestamp".into())
}
