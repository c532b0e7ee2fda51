//! Monotonic time in the recording time base.

use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Seconds since the first call in this process, as a monotonically
/// non-decreasing double. Safe to call from any thread and side-effect
/// free after the first call pins the epoch.
///
/// Transport adapters that carry their own clock (LSL's `local_clock`)
/// override [`crate::source::StreamSource::local_clock`] instead; this is
/// the fallback time base everything else shares.
pub fn now_streaming() -> f64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_secs_f64()
}
