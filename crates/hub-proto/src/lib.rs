pub mod channel;
pub mod events;
pub mod mission;
pub mod spray;
pub mod telemetry;

use time::OffsetDateTime;

/// Wall-clock unix milliseconds, the timestamp unit used in every event
/// payload and snapshot field that leaves the process.
pub fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
