//! Coil-alignment estimation from operating-frequency drift.
//!
//! The operating frequency of the link rises as the coils drift apart under
//! load. After compensating the raw frequency with a current-dependent
//! offset, the adjusted frequency is mapped into configured buckets to yield
//! a 0-100 alignment score. Scores are published with asymmetric hysteresis:
//! a worse score publishes immediately, a better one only once the adjusted
//! frequency clears the bucket's lower boundary by the configured margin,
//! which stops the score from oscillating at bucket edges.
//!
//! Scoring is only enabled for one recognized transmitter manufacturer in
//! extended mode; the capability check runs on the estimation timer with a
//! bounded budget because the manufacturer code register reads as zero early
//! in a session.

use tracing::debug;

use crate::types::{AlignCapability, AlignCode};

/// Moving-sum filter length for the output-current average.
pub(crate) const CURRENT_FILTER_LEN: u32 = 10;
/// Capability-check attempts before giving up on this transmitter.
pub(crate) const MFG_CHECK_BUDGET: u32 = 10;
/// Detect-line edges before pre-online feedback degrades to MOVE.
pub(crate) const DETECT_EDGE_THRESHOLD: u32 = 10;

const MAX_SCORE: u32 = 100;

/// Where an adjusted frequency lands in the configured bucket table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BucketOutcome {
    BelowRange,
    AboveRange,
    InBucket { index: usize, score: u8 },
}

/// Map an adjusted frequency into the bucket table.
///
/// `boundaries` has N >= 3 entries defining N-1 buckets; bucket `i` covers
/// `(boundaries[i], boundaries[i+1]]` and scores `100 * i / (N - 2)`.
pub(crate) fn bucket_score(boundaries: &[u32], adj_freq_hz: u32) -> BucketOutcome {
    if adj_freq_hz < boundaries[0] {
        return BucketOutcome::BelowRange;
    }
    let buckets = boundaries.len() - 1;
    for i in 0..buckets {
        if adj_freq_hz > boundaries[i] && adj_freq_hz <= boundaries[i + 1] {
            let score = (MAX_SCORE * i as u32) / (buckets as u32 - 1);
            return BucketOutcome::InBucket {
                index: i,
                score: score as u8,
            };
        }
    }
    BucketOutcome::AboveRange
}

/// Per-session alignment state.
pub struct AlignmentEstimator {
    code: AlignCode,
    /// Latest computed score; only meaningful while `code` is `Centered`.
    score: Option<u8>,
    /// Last score that cleared the hysteresis gate.
    last_published: Option<u8>,
    capability: AlignCapability,
    current_sum: u32,
    sample_count: u32,
    mfg_checks: u32,
    detect_edges: u32,
}

impl AlignmentEstimator {
    pub fn new() -> Self {
        Self {
            code: AlignCode::Error,
            score: None,
            last_published: None,
            capability: AlignCapability::Failed,
            current_sum: 0,
            sample_count: 0,
            mfg_checks: 0,
            detect_edges: 0,
        }
    }

    pub fn code(&self) -> AlignCode {
        self.code
    }

    pub fn score(&self) -> Option<u8> {
        if self.code == AlignCode::Centered {
            self.score
        } else {
            None
        }
    }

    pub fn capability(&self) -> AlignCapability {
        self.capability
    }

    /// Session confirmed: restart the capability check and the filter.
    pub fn begin_session(&mut self) {
        self.code = AlignCode::Centered;
        self.score = None;
        self.last_published = None;
        self.capability = AlignCapability::Checking;
        self.current_sum = 0;
        self.sample_count = 0;
        self.mfg_checks = 0;
    }

    /// Session torn down: all alignment information is invalid.
    pub fn reset_offline(&mut self) {
        self.code = AlignCode::Error;
        self.score = None;
        self.last_published = None;
        self.capability = AlignCapability::Failed;
        self.current_sum = 0;
        self.sample_count = 0;
        self.mfg_checks = 0;
        self.detect_edges = 0;
    }

    /// Pre-online detect-line edge. Returns true when the feedback code
    /// changed and observers should be notified.
    pub fn note_detect_edge(&mut self) -> bool {
        if self.code == AlignCode::Move {
            return false;
        }
        let mut changed = self.code != AlignCode::Checking;
        self.code = AlignCode::Checking;
        self.detect_edges += 1;
        if self.detect_edges > DETECT_EDGE_THRESHOLD {
            self.code = AlignCode::Move;
            changed = true;
        }
        changed
    }

    /// Confirmation window elapsed without a rectified-voltage signal.
    pub fn note_confirm_timeout(&mut self) -> bool {
        if self.code == AlignCode::Checking {
            self.code = AlignCode::Move;
            return true;
        }
        false
    }

    /// Alignment window elapsed without coupling: give up.
    pub fn note_alignment_timeout(&mut self) -> bool {
        if self.code != AlignCode::Error {
            self.code = AlignCode::Error;
            return true;
        }
        false
    }

    /// Whether the estimation timer should stay armed: keep checking while
    /// the capability budget lasts, and forever once it passed.
    pub fn should_reschedule(&self) -> bool {
        self.mfg_checks < MFG_CHECK_BUDGET || self.capability == AlignCapability::Passed
    }

    /// Count one capability-check attempt.
    pub fn record_mfg_check(&mut self) {
        self.mfg_checks += 1;
    }

    pub fn capability_passed(&mut self) {
        self.capability = AlignCapability::Passed;
    }

    pub fn capability_failed(&mut self) {
        self.capability = AlignCapability::Failed;
    }

    /// Feed one output-current sample, returning the filtered average (mA).
    fn filter_current(&mut self, now_ma: u32) -> u32 {
        let sample = self.current_sum / CURRENT_FILTER_LEN;
        if self.sample_count < CURRENT_FILTER_LEN {
            self.sample_count += 1;
        } else {
            self.current_sum -= sample;
        }
        self.current_sum += now_ma / CURRENT_FILTER_LEN;
        self.current_sum
    }

    /// One scoring pass. Returns the score when a new value cleared the
    /// publication gate; the computed (unpublished) score remains readable
    /// through [`score`](Self::score) either way.
    pub fn evaluate(
        &mut self,
        boundaries: &[u32],
        scalar: u32,
        hysteresis_hz: u32,
        iout_ma: u32,
        freq_hz: u32,
    ) -> Option<u8> {
        self.score = None;

        let scaling = if scalar == 0 {
            0
        } else {
            scalar.saturating_mul(self.filter_current(iout_ma))
        };
        let adj = freq_hz.saturating_add(scaling);

        let (index, score) = match bucket_score(boundaries, adj) {
            BucketOutcome::BelowRange => {
                debug!("align: freq below range ({adj} Hz)");
                return None;
            }
            BucketOutcome::AboveRange => {
                debug!("align: freq above range ({adj} Hz)");
                return None;
            }
            BucketOutcome::InBucket { index, score } => (index, score),
        };

        self.score = Some(score);
        if self.last_published == Some(score) {
            return None;
        }

        let floor = boundaries[index].saturating_add(hysteresis_hz);
        let decreased = self.last_published.is_some_and(|last| score < last);
        if decreased || adj >= floor {
            self.last_published = Some(score);
            Some(score)
        } else {
            None
        }
    }
}

impl Default for AlignmentEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOUNDS: [u32; 5] = [100_000, 110_000, 120_000, 130_000, 140_000];

    fn fresh() -> AlignmentEstimator {
        let mut a = AlignmentEstimator::new();
        a.begin_session();
        a
    }

    #[test]
    fn buckets_map_to_linear_monotonic_scores() {
        // 5 boundaries -> 4 buckets -> scores {0, 33, 66, 100}.
        let expect = [(105_000, 0u8), (115_000, 33), (125_000, 66), (135_000, 100)];
        let mut last = 0u8;
        for (freq, score) in expect {
            match bucket_score(&BOUNDS, freq) {
                BucketOutcome::InBucket { score: s, .. } => {
                    assert_eq!(s, score, "freq {freq}");
                    assert!(s >= last);
                    last = s;
                }
                other => panic!("freq {freq}: {other:?}"),
            }
        }
        // Upper boundaries are inclusive.
        assert_eq!(
            bucket_score(&BOUNDS, 140_000),
            BucketOutcome::InBucket {
                index: 3,
                score: 100
            }
        );
    }

    #[test]
    fn out_of_range_frequencies_score_nothing() {
        assert_eq!(bucket_score(&BOUNDS, 99_999), BucketOutcome::BelowRange);
        assert_eq!(bucket_score(&BOUNDS, 140_001), BucketOutcome::AboveRange);
        // The lowest boundary itself is outside every half-open bucket.
        assert_eq!(bucket_score(&BOUNDS, 100_000), BucketOutcome::AboveRange);

        let mut a = fresh();
        assert_eq!(a.evaluate(&BOUNDS, 0, 5_000, 0, 99_000), None);
        assert_eq!(a.score(), None);
    }

    #[test]
    fn first_publication_requires_clearing_hysteresis() {
        let mut a = fresh();
        // Score 33 bucket, but below 110_000 + 5_000.
        assert_eq!(a.evaluate(&BOUNDS, 0, 5_000, 0, 114_000), None);
        assert_eq!(a.score(), Some(33));
        // Past the margin it publishes.
        assert_eq!(a.evaluate(&BOUNDS, 0, 5_000, 0, 115_500), Some(33));
    }

    #[test]
    fn decrease_publishes_immediately_increase_waits_for_margin() {
        let mut a = fresh();
        assert_eq!(a.evaluate(&BOUNDS, 0, 5_000, 0, 126_000), Some(66));
        // Better coupling (lower bucket): publishes even inside the margin.
        assert_eq!(a.evaluate(&BOUNDS, 0, 5_000, 0, 114_000), Some(33));
        // Back up into the 66 bucket but under its floor + margin: held.
        assert_eq!(a.evaluate(&BOUNDS, 0, 5_000, 0, 121_000), None);
        assert_eq!(a.score(), Some(66));
        // Clears the margin: published.
        assert_eq!(a.evaluate(&BOUNDS, 0, 5_000, 0, 125_500), Some(66));
    }

    #[test]
    fn unchanged_score_is_not_republished() {
        let mut a = fresh();
        assert_eq!(a.evaluate(&BOUNDS, 0, 5_000, 0, 126_000), Some(66));
        assert_eq!(a.evaluate(&BOUNDS, 0, 5_000, 0, 127_000), None);
        assert_eq!(a.score(), Some(66));
    }

    #[test]
    fn current_scaling_shifts_the_adjusted_frequency() {
        let mut a = fresh();
        // One 1000 mA sample: filtered sum = 100, scaling = 4 * 100 = 400 Hz.
        // 125_100 + 400 lands in the 66 bucket past its floor.
        assert_eq!(a.evaluate(&BOUNDS, 4, 5_000, 1_000, 125_100), Some(66));
    }

    #[test]
    fn filter_warms_up_over_ten_samples() {
        let mut a = fresh();
        for _ in 0..CURRENT_FILTER_LEN {
            a.filter_current(1_000);
        }
        // Full window of 1000 mA samples sums to the average itself.
        assert_eq!(a.filter_current(1_000), 1_000);
    }

    #[test]
    fn detect_edges_degrade_to_move_feedback() {
        let mut a = AlignmentEstimator::new();
        assert!(a.note_detect_edge());
        assert_eq!(a.code(), AlignCode::Checking);
        for _ in 0..DETECT_EDGE_THRESHOLD - 1 {
            assert!(!a.note_detect_edge());
        }
        // Edge past the threshold flips to MOVE.
        assert!(a.note_detect_edge());
        assert_eq!(a.code(), AlignCode::Move);
        // Further edges are absorbed.
        assert!(!a.note_detect_edge());
    }

    #[test]
    fn timeouts_walk_checking_to_move_to_error() {
        let mut a = AlignmentEstimator::new();
        a.note_detect_edge();
        assert!(a.note_confirm_timeout());
        assert_eq!(a.code(), AlignCode::Move);
        assert!(a.note_alignment_timeout());
        assert_eq!(a.code(), AlignCode::Error);
        assert!(!a.note_alignment_timeout());
    }

    #[test]
    fn capability_budget_controls_rescheduling() {
        let mut a = fresh();
        assert_eq!(a.capability(), AlignCapability::Checking);
        for _ in 0..MFG_CHECK_BUDGET {
            assert!(a.should_reschedule());
            a.record_mfg_check();
        }
        assert!(!a.should_reschedule());
        a.capability_passed();
        assert!(a.should_reschedule());
    }

    #[test]
    fn score_is_only_meaningful_while_centered() {
        let mut a = fresh();
        assert_eq!(a.evaluate(&BOUNDS, 0, 5_000, 0, 126_000), Some(66));
        a.reset_offline();
        assert_eq!(a.code(), AlignCode::Error);
        assert_eq!(a.score(), None);
        assert_eq!(a.capability(), AlignCapability::Failed);
    }
}
