//! Progress percentage calculations.
//!
//! Two independent sources feed an item's progress field:
//! - history polling, which reports node-level `current/total` counters and
//!   is mapped into the 25..=95 band so the percentage keeps moving even
//!   when the live stream is quiet;
//! - the WebSocket stream, which reports sampler step `value/max` pairs and
//!   is passed through as a plain percentage.
//!
//! Both values are raw pass-throughs; no monotonic clamping is applied, so
//! the visible percentage may briefly regress when the two sources
//! interleave.

/// Progress recorded immediately after a job is accepted by a worker.
pub const PROGRESS_SUBMITTED: u8 = 10;

/// Map history-poll execution counters to a percentage.
///
/// Returns `None` when `total` is zero (counters unavailable); callers keep
/// the prior value in that case.
pub fn poll_progress(current: u64, total: u64) -> Option<u8> {
    if total == 0 {
        return None;
    }
    let pct = 25 + (70 * current.min(total)) / total;
    Some(pct.min(100) as u8)
}

/// Map a live `value/max` step pair to a percentage.
///
/// A non-positive `max` yields zero.
pub fn stream_progress(value: u64, max: u64) -> u8 {
    if max == 0 {
        return 0;
    }
    ((100 * value.min(max)) / max) as u8
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_progress_spans_band() {
        assert_eq!(poll_progress(0, 10), Some(25));
        assert_eq!(poll_progress(5, 10), Some(60));
        assert_eq!(poll_progress(10, 10), Some(95));
    }

    #[test]
    fn poll_progress_unavailable_counters() {
        assert_eq!(poll_progress(3, 0), None);
    }

    #[test]
    fn poll_progress_clamps_overshoot() {
        assert_eq!(poll_progress(15, 10), Some(95));
    }

    #[test]
    fn stream_progress_basic() {
        assert_eq!(stream_progress(0, 20), 0);
        assert_eq!(stream_progress(10, 20), 50);
        assert_eq!(stream_progress(20, 20), 100);
        assert_eq!(stream_progress(5, 0), 0);
    }
}
