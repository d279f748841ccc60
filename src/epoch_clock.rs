//! Wall-clock interface used by the counters store to gate free-list reuse.
//!
//! The clock itself is out of scope for this crate (spec.md §1) — callers in a
//! full system would plumb through a shared, possibly cached, epoch clock. Only
//! the interface the counters store needs is provided here: milliseconds since
//! the Unix epoch.

use std::time::{SystemTime, UNIX_EPOCH};

/// Source of the current time, in milliseconds since the Unix epoch.
pub trait EpochClock {
    /// Current time, in epoch milliseconds.
    fn time_ms(&self) -> i64;
}

/// Clock backed by the system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemEpochClock;

impl EpochClock for SystemEpochClock {
    fn time_ms(&self) -> i64 {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_millis() as i64,
            // Clock set before the epoch; treat as the epoch rather than panic.
            Err(_) => 0,
        }
    }
}

/// Clock that always reads zero, disabling the free-to-reuse timeout: a
/// freed counter id is eligible for reuse as soon as it's freed.
#[derive(Debug, Default, Clone, Copy)]
pub struct ZeroEpochClock;

impl EpochClock for ZeroEpochClock {
    fn time_ms(&self) -> i64 {
        0
    }
}
