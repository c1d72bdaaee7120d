//! Sliding-window averaging and scale rate limiting.

use rudder_state::UtilizationSample;

/// Average CPU percent over samples taken at or after `since`.
///
/// Returns `None` when the window is empty — the caller must treat that
/// as "utilization undefined", never as zero.
pub fn average_since(samples: &[UtilizationSample], since: u64) -> Option<f64> {
    let mut sum = 0.0;
    let mut count = 0u32;
    for sample in samples.iter().filter(|s| s.at >= since) {
        sum += sample.cpu_percent;
        count += 1;
    }
    (count > 0).then(|| sum / f64::from(count))
}

/// Asymmetric scale rate limits.
///
/// Each direction keeps an anchor: the replica count when its limit
/// window last opened. Within the window, scale-up may not exceed 200%
/// of the up-anchor count and scale-down may not go below 50% of the
/// down-anchor count (rounded up). Once a window elapses the anchor
/// resets to the current count.
#[derive(Debug)]
pub struct RateLimits {
    up_window_secs: u64,
    down_window_secs: u64,
    up_anchor: Option<(u64, u32)>,
    down_anchor: Option<(u64, u32)>,
}

impl RateLimits {
    /// Defaults: +100% per 30s, −50% per 5m.
    pub fn new() -> Self {
        Self::with_windows(30, 300)
    }

    pub fn with_windows(up_window_secs: u64, down_window_secs: u64) -> Self {
        Self {
            up_window_secs,
            down_window_secs,
            up_anchor: None,
            down_anchor: None,
        }
    }

    /// Clamp a proposed count to what the rate limits allow right now.
    pub fn clamp(&mut self, now: u64, current: u32, proposed: u32) -> u32 {
        if proposed > current {
            let anchor = self.roll_anchor(true, now, current);
            proposed.min(anchor.saturating_mul(2).max(1))
        } else if proposed < current {
            let anchor = self.roll_anchor(false, now, current);
            proposed.max(anchor.div_ceil(2))
        } else {
            proposed
        }
    }

    /// Return the anchor count for a direction, opening a fresh window if
    /// the old one has elapsed (or none exists).
    fn roll_anchor(&mut self, up: bool, now: u64, current: u32) -> u32 {
        let (slot, window) = if up {
            (&mut self.up_anchor, self.up_window_secs)
        } else {
            (&mut self.down_anchor, self.down_window_secs)
        };
        match slot {
            Some((at, count)) if now.saturating_sub(*at) < window => *count,
            _ => {
                *slot = Some((now, current));
                current
            }
        }
    }
}

impl Default for RateLimits {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(at: u64, cpu: f64) -> UtilizationSample {
        UtilizationSample { at, cpu_percent: cpu }
    }

    #[test]
    fn average_over_window() {
        let samples = vec![sample(100, 50.0), sample(160, 70.0), sample(220, 90.0)];
        assert_eq!(average_since(&samples, 0), Some(70.0));
        // Only the last two fall inside the window.
        assert_eq!(average_since(&samples, 160), Some(80.0));
    }

    #[test]
    fn empty_window_is_undefined() {
        assert_eq!(average_since(&[], 0), None);
        assert_eq!(average_since(&[sample(100, 50.0)], 200), None);
    }

    #[test]
    fn scale_up_capped_at_double_within_window() {
        let mut limits = RateLimits::new();
        // current=2, wants 20 — capped at 4.
        assert_eq!(limits.clamp(1000, 2, 20), 4);
        // Still inside the 30s window: the anchor is 2, cap stays 4.
        assert_eq!(limits.clamp(1010, 4, 20), 4);
        // Window elapsed: anchor rolls to 4, cap becomes 8.
        assert_eq!(limits.clamp(1030, 4, 20), 8);
    }

    #[test]
    fn scale_down_capped_at_half_within_window() {
        let mut limits = RateLimits::new();
        // current=8, wants 1 — floored at 4.
        assert_eq!(limits.clamp(1000, 8, 1), 4);
        // Inside the 5m window: anchor is 8, floor stays 4.
        assert_eq!(limits.clamp(1100, 4, 1), 4);
        // Window elapsed: anchor rolls to 4, floor becomes 2.
        assert_eq!(limits.clamp(1300, 4, 1), 2);
    }

    #[test]
    fn odd_counts_round_against_the_change() {
        let mut limits = RateLimits::new();
        // Halving 5 floors at ceil(5/2) = 3.
        assert_eq!(limits.clamp(1000, 5, 1), 3);
    }

    #[test]
    fn unchanged_count_passes_through() {
        let mut limits = RateLimits::new();
        assert_eq!(limits.clamp(1000, 3, 3), 3);
    }

    #[test]
    fn directions_track_independent_windows() {
        let mut limits = RateLimits::new();
        assert_eq!(limits.clamp(1000, 2, 10), 4); // up anchored at 2
        // A scale-down right after is anchored at 4, floored at 2.
        assert_eq!(limits.clamp(1005, 4, 1), 2);
    }
}
