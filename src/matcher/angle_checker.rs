//! Orientation-consistency filter.
//!
//! Correct matches between two views of the same scene share a common
//! keypoint-angle offset. Matches are histogrammed by angle difference in
//! 30° bins; only the three most populated bins survive.

/// 360° / 30° per bin.
const NUM_BINS: usize = 12;
const BIN_WIDTH_DEG: f64 = 360.0 / NUM_BINS as f64;

/// Collects per-match angle differences and reports the matches outside the
/// top-3 bins.
#[derive(Debug, Default)]
pub struct AngleChecker {
    bins: Vec<Vec<usize>>,
}

impl AngleChecker {
    pub fn new() -> Self {
        Self {
            bins: vec![Vec::new(); NUM_BINS],
        }
    }

    /// Record a match (identified by an arbitrary index) with the keypoint
    /// angles of its two views, in degrees.
    pub fn append(&mut self, match_idx: usize, angle_1: f64, angle_2: f64) {
        let mut diff = angle_1 - angle_2;
        while diff < 0.0 {
            diff += 360.0;
        }
        while diff >= 360.0 {
            diff -= 360.0;
        }
        let bin = ((diff / BIN_WIDTH_DEG) as usize).min(NUM_BINS - 1);
        self.bins[bin].push(match_idx);
    }

    /// Indices recorded outside the three most populated bins.
    pub fn invalid_matches(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..NUM_BINS).collect();
        order.sort_by_key(|&b| std::cmp::Reverse(self.bins[b].len()));

        let mut invalid = Vec::new();
        for &bin in order.iter().skip(3) {
            invalid.extend_from_slice(&self.bins[bin]);
        }
        // Empty leading bins mean everything survives.
        invalid
    }
}
