//! Units, records, and result sets exchanged between workers, units and the scheduler.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::classifier::UnitVerdict;
use super::config::MutationConfig;

/// Identity of one target compilation unit.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(String);

impl UnitId {
    /// Wrap a unit name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Borrow the unit name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UnitId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Half-open range of mutation indices `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRange {
    /// First index, inclusive.
    pub start: usize,
    /// Last index, exclusive.
    pub end: usize,
}

impl IndexRange {
    /// Range `[start, end)`.
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Every index from `start` onwards.
    pub fn from_start(start: usize) -> Self {
        Self {
            start,
            end: usize::MAX,
        }
    }

    /// Clamp the range to the number of mutation points of a unit.
    pub fn clamp_to(&self, total: usize) -> Self {
        let end = self.end.min(total);
        Self {
            start: self.start.min(end),
            end,
        }
    }

    /// Number of indices in the range.
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    /// True when the range holds no index.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if `index` lies inside the range.
    pub fn contains(&self, index: usize) -> bool {
        index >= self.start && index < self.end
    }
}

impl fmt::Display for IndexRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.end == usize::MAX {
            write!(f, "[{}, ..)", self.start)
        } else {
            write!(f, "[{}, {})", self.start, self.end)
        }
    }
}

/// Tests associated with a target unit. Interpretation of the ids is up to the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestGroup {
    /// Group name, used in logs.
    pub name: String,
    /// Test identifiers.
    pub tests: Vec<String>,
}

impl TestGroup {
    /// Empty group named `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tests: Vec::new(),
        }
    }

    /// Add one test id.
    pub fn with_test(mut self, test: impl Into<String>) -> Self {
        self.tests.push(test.into());
        self
    }
}

/// One failed or errored test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestFailure {
    /// Test name.
    pub test_name: String,
    /// Optional failure message.
    pub message: Option<String>,
}

/// Outcome of running a test group once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRunSummary {
    /// Number of tests (or test invocations) run.
    pub tests_run: usize,
    /// Failures and errors.
    pub failures: Vec<TestFailure>,
}

impl TestRunSummary {
    /// Every test passed.
    pub fn passed(tests_run: usize) -> Self {
        Self {
            tests_run,
            failures: Vec::new(),
        }
    }

    /// One failing test.
    pub fn failed(test_name: impl Into<String>, message: Option<String>) -> Self {
        Self {
            tests_run: 1,
            failures: vec![TestFailure {
                test_name: test_name.into(),
                message,
            }],
        }
    }

    /// True if any test failed or errored.
    pub fn any_failed(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Work order for one mutation analysis unit. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisUnit {
    /// Unit under mutation.
    pub target: UnitId,
    /// Tests run against every mutant.
    pub tests: TestGroup,
    /// Shared configuration.
    pub config: Arc<MutationConfig>,
    /// Assigned mutation indices.
    pub range: IndexRange,
}

impl AnalysisUnit {
    /// Unit covering every mutation point of `target`.
    pub fn new(target: UnitId, tests: TestGroup, config: Arc<MutationConfig>) -> Self {
        Self {
            target,
            tests,
            config,
            range: IndexRange::from_start(0),
        }
    }

    /// Restrict the unit to `range`.
    pub fn with_range(mut self, range: IndexRange) -> Self {
        self.range = range;
        self
    }
}

/// Result of testing one mutant. Written once, never changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationRecord {
    /// Mutation index within the unit.
    pub index: usize,
    /// At least one test failed, or the mutant was not viable.
    pub detected: bool,
    /// Name of the mutated unit.
    pub mutated_unit: String,
    /// Source file of the mutated unit.
    pub source_file: String,
    /// Description of the code change.
    pub description: String,
    /// Signature of the mutated member.
    pub member_signature: String,
}

/// Ordered records of one target unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassMutationResults {
    /// Target unit.
    pub unit: UnitId,
    /// Mutation points the unit was asked to cover.
    pub mutation_points: usize,
    records: Vec<MutationRecord>,
}

impl ClassMutationResults {
    /// Empty result set for `unit`.
    pub fn new(unit: UnitId, mutation_points: usize) -> Self {
        Self {
            unit,
            mutation_points,
            records: Vec::new(),
        }
    }

    /// Append a record. Indices must be strictly increasing.
    pub fn push(&mut self, record: MutationRecord) {
        debug_assert!(
            self.records
                .last()
                .is_none_or(|last| last.index < record.index),
            "mutation records must be appended in increasing index order"
        );
        self.records.push(record);
    }

    /// Append every record of `other`, which must cover later indices of the same unit.
    pub fn extend(&mut self, other: ClassMutationResults) {
        for record in other.records {
            self.push(record);
        }
    }

    /// Records in index order.
    pub fn records(&self) -> &[MutationRecord] {
        &self.records
    }

    /// Number of detected mutants.
    pub fn detected(&self) -> usize {
        self.records.iter().filter(|r| r.detected).count()
    }

    /// Number of surviving mutants.
    pub fn survived(&self) -> usize {
        self.records.len() - self.detected()
    }

    /// Index after the last record, if any record exists.
    pub fn next_index(&self) -> Option<usize> {
        self.records.last().map(|r| r.index + 1)
    }
}

/// Result of one scheduled analysis unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationMetaData {
    /// Unit identity.
    pub unit: UnitId,
    /// Classification of the unit.
    pub verdict: UnitVerdict,
    results: Vec<ClassMutationResults>,
}

impl MutationMetaData {
    /// Wrap result sets produced by one unit.
    pub fn new(unit: UnitId, verdict: UnitVerdict, results: Vec<ClassMutationResults>) -> Self {
        Self {
            unit,
            verdict,
            results,
        }
    }

    /// Result sets, one per mutated unit.
    pub fn class_results(&self) -> &[ClassMutationResults] {
        &self.results
    }

    /// Consume into result sets.
    pub fn into_class_results(self) -> Vec<ClassMutationResults> {
        self.results
    }
}
