//! Pass/fail/skip decision for one target unit.

use std::fmt;

use super::config::MutationConfig;
use super::model::{ClassMutationResults, TestRunSummary};

/// Why a unit failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The unmutated tests do not pass.
    BaselineFailed,
    /// Kill rate below the threshold.
    InsufficientCoverage {
        /// Floored percentage of detected mutants.
        percent_detected: u32,
        /// Configured threshold.
        threshold: u32,
    },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BaselineFailed => f.write_str("tests do not pass unmutated"),
            Self::InsufficientCoverage {
                percent_detected,
                threshold,
            } => write!(
                f,
                "insufficient mutation coverage: {percent_detected}% < {threshold}%"
            ),
        }
    }
}

/// Unit classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitVerdict {
    /// Kill rate at or above the threshold.
    Success,
    /// Baseline failure or insufficient kill rate.
    Failure(FailureReason),
    /// No mutation points.
    Skipped,
}

impl UnitVerdict {
    /// True for [`UnitVerdict::Failure`].
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }
}

impl fmt::Display for UnitVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::Failure(reason) => write!(f, "failure: {reason}"),
            Self::Skipped => f.write_str("skipped"),
        }
    }
}

/// True when `detected` out of `total` meets `threshold` percent, compared exactly.
pub fn meets_threshold(detected: usize, total: usize, threshold: u32) -> bool {
    100 * detected as u128 >= threshold as u128 * total as u128
}

/// Floored percentage of detected mutants. Zero when `total` is zero.
pub fn percent_detected(detected: usize, total: usize) -> u32 {
    if total == 0 {
        return 0;
    }
    (100 * detected as u128 / total as u128) as u32
}

/// Classify a unit from its baseline run and mutation results.
///
/// The denominator is `results.mutation_points`, the length of the unit's assigned range after
/// clamping, not the unit's total mutation count. Zero mutation points is `Skipped` whatever the
/// baseline did. Records that were never produced (a worker killed mid-range) count as surviving.
pub fn classify(
    baseline: &TestRunSummary,
    results: &ClassMutationResults,
    config: &MutationConfig,
) -> UnitVerdict {
    let total = results.mutation_points;
    if total == 0 {
        return UnitVerdict::Skipped;
    }
    if baseline.any_failed() {
        return UnitVerdict::Failure(FailureReason::BaselineFailed);
    }

    let detected = results.detected();
    if meets_threshold(detected, total, config.threshold) {
        UnitVerdict::Success
    } else {
        UnitVerdict::Failure(FailureReason::InsufficientCoverage {
            percent_detected: percent_detected(detected, total),
            threshold: config.threshold,
        })
    }
}
