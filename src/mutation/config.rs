//! Mutation analysis configuration.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier of one mutation operator family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationOperator {
    /// `+ - * / %` substitution.
    Arithmetic,
    /// `<` to `<=` and friends.
    ConditionalsBoundary,
    /// `==` to `!=`, `<` to `>=` and friends.
    NegateConditionals,
    /// `true` to `false` and back.
    BooleanLiterals,
    /// `&&` to `||` and back.
    LogicalConnectives,
}

impl MutationOperator {
    /// Every known operator.
    pub const ALL: [MutationOperator; 5] = [
        Self::Arithmetic,
        Self::ConditionalsBoundary,
        Self::NegateConditionals,
        Self::BooleanLiterals,
        Self::LogicalConnectives,
    ];

    /// Operators enabled when none are requested explicitly.
    pub fn defaults() -> BTreeSet<MutationOperator> {
        [
            Self::Arithmetic,
            Self::ConditionalsBoundary,
            Self::NegateConditionals,
        ]
        .into_iter()
        .collect()
    }

    /// Stable snake_case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Arithmetic => "arithmetic",
            Self::ConditionalsBoundary => "conditionals_boundary",
            Self::NegateConditionals => "negate_conditionals",
            Self::BooleanLiterals => "boolean_literals",
            Self::LogicalConnectives => "logical_connectives",
        }
    }
}

impl fmt::Display for MutationOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MutationOperator {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().replace('-', "_").to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|op| op.as_str() == wanted)
            .ok_or_else(|| ConfigError::UnknownOperator(s.to_string()))
    }
}

/// Configuration errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Threshold outside 0..=100.
    #[error("threshold must be a percentage in 0..=100, got {0}")]
    ThresholdOutOfRange(u32),
    /// No operator enabled.
    #[error("at least one mutation operator must be enabled")]
    NoOperators,
    /// Operator name not recognised.
    #[error("unknown mutation operator `{0}`")]
    UnknownOperator(String),
}

/// Configuration for one analysis request. Shared read-only by every unit built from it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MutationConfig {
    /// Minimum kill rate, as an integer percentage.
    pub threshold: u32,
    /// Enabled mutation operators.
    pub operators: BTreeSet<MutationOperator>,
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            threshold: 80,
            operators: MutationOperator::defaults(),
        }
    }
}

impl MutationConfig {
    /// Set the kill-rate threshold.
    pub fn with_threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold;
        self
    }

    /// Replace the enabled operator set.
    pub fn with_operators(mut self, operators: impl IntoIterator<Item = MutationOperator>) -> Self {
        self.operators = operators.into_iter().collect();
        self
    }

    /// Enable one more operator.
    pub fn with_operator(mut self, operator: MutationOperator) -> Self {
        self.operators.insert(operator);
        self
    }

    /// True if `operator` is enabled.
    pub fn enables(&self, operator: MutationOperator) -> bool {
        self.operators.contains(&operator)
    }

    /// Check the configuration is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threshold > 100 {
            return Err(ConfigError::ThresholdOutOfRange(self.threshold));
        }
        if self.operators.is_empty() {
            return Err(ConfigError::NoOperators);
        }
        Ok(())
    }
}

/// Memory watchdog settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchdogConfig {
    /// Percentage of the memory limit at which the worker is aborted.
    pub threshold_percent: u8,
    /// Sampling interval.
    pub poll_interval: Duration,
    /// Explicit memory limit. When absent the cgroup limit is used, if any.
    pub limit_bytes: Option<u64>,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            threshold_percent: 90,
            poll_interval: Duration::from_millis(250),
            limit_bytes: None,
        }
    }
}

impl WatchdogConfig {
    /// Set the abort threshold.
    pub fn with_threshold_percent(mut self, threshold_percent: u8) -> Self {
        self.threshold_percent = threshold_percent.min(100);
        self
    }

    /// Set the sampling interval.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set an explicit memory limit.
    pub fn with_limit_bytes(mut self, limit_bytes: u64) -> Self {
        self.limit_bytes = Some(limit_bytes);
        self
    }

    /// Bytes in use at which the watchdog fires for `limit_bytes`.
    pub fn trip_point(&self, limit_bytes: u64) -> u64 {
        (limit_bytes as u128 * self.threshold_percent as u128 / 100) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_and_builder_overrides_work() {
        let default = MutationConfig::default();
        assert_eq!(default.threshold, 80);
        assert_eq!(default.operators, MutationOperator::defaults());
        assert!(default.validate().is_ok());

        let cfg = MutationConfig::default()
            .with_threshold(66)
            .with_operators([MutationOperator::BooleanLiterals])
            .with_operator(MutationOperator::LogicalConnectives);

        assert_eq!(cfg.threshold, 66);
        assert!(cfg.enables(MutationOperator::BooleanLiterals));
        assert!(cfg.enables(MutationOperator::LogicalConnectives));
        assert!(!cfg.enables(MutationOperator::Arithmetic));
    }

    #[test]
    fn validate_rejects_bad_threshold_and_empty_operators() {
        let cfg = MutationConfig::default().with_threshold(101);
        assert_eq!(cfg.validate(), Err(ConfigError::ThresholdOutOfRange(101)));

        let cfg = MutationConfig::default().with_operators([]);
        assert_eq!(cfg.validate(), Err(ConfigError::NoOperators));
    }

    #[test]
    fn operators_parse_from_cli_spelling() {
        assert_eq!(
            "negate-conditionals".parse::<MutationOperator>(),
            Ok(MutationOperator::NegateConditionals)
        );
        assert_eq!(
            "ARITHMETIC".parse::<MutationOperator>(),
            Ok(MutationOperator::Arithmetic)
        );
        assert!(matches!(
            "swap".parse::<MutationOperator>(),
            Err(ConfigError::UnknownOperator(_))
        ));
    }

    #[test]
    fn config_serializes_to_a_single_line() {
        let json = serde_json::to_string(&MutationConfig::default())
            .expect("config should serialize");
        assert!(!json.contains('\n'));
        let back: MutationConfig = serde_json::from_str(&json).expect("config should parse");
        assert_eq!(back, MutationConfig::default());
    }

    #[test]
    fn watchdog_trip_point_scales_with_percent() {
        let cfg = WatchdogConfig::default();
        assert_eq!(cfg.trip_point(1000), 900);
        assert_eq!(cfg.with_threshold_percent(150).trip_point(1000), 1000);
    }
}
