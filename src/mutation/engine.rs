//! Collaborator contracts: mutant generation and the live execution context.

use thiserror::Error;

use super::config::MutationConfig;
use super::model::{TestGroup, TestRunSummary, UnitId};

/// Engine-level errors.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The target unit could not be found or read.
    #[error("unknown target unit `{0}`")]
    UnknownUnit(String),
    /// Requested a mutant past the last mutation point.
    #[error("mutation index {index} out of range for `{unit}` ({total} mutation points)")]
    IndexOutOfRange {
        /// Target unit.
        unit: String,
        /// Requested index.
        index: usize,
        /// Mutation points available.
        total: usize,
    },
    /// The unit's source could not be parsed.
    #[error("failed to parse source: {0}")]
    Parse(String),
    /// Context used before `load`.
    #[error("execution context has no loaded unit")]
    NotLoaded,
    /// Underlying command execution failed.
    #[error("command execution failed: {0}")]
    CommandFailed(String),
    /// IO failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Kind of member a mutation falls in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    /// Ordinary function or method body.
    Method,
    /// One-time static initialization code.
    StaticInitializer,
}

/// Member containing a mutation point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutatedMember {
    /// Human-readable signature.
    pub signature: String,
    /// Member kind.
    pub kind: MemberKind,
}

impl MutatedMember {
    /// A method member.
    pub fn method(signature: impl Into<String>) -> Self {
        Self {
            signature: signature.into(),
            kind: MemberKind::Method,
        }
    }

    /// A static initializer member.
    pub fn static_initializer(signature: impl Into<String>) -> Self {
        Self {
            signature: signature.into(),
            kind: MemberKind::StaticInitializer,
        }
    }

    /// True if the member runs once per context lifetime.
    pub fn is_static_initializer(&self) -> bool {
        self.kind == MemberKind::StaticInitializer
    }
}

/// One generated mutant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutant {
    /// Mutation index.
    pub index: usize,
    /// Full replacement code for the unit.
    pub code: Vec<u8>,
    /// Member the change falls in.
    pub member: MutatedMember,
    /// Description of the change.
    pub description: String,
    /// Name of the mutated unit.
    pub unit_name: String,
    /// Source identifier of the mutated unit.
    pub source_file: String,
}

/// Produces mutants for a target unit.
pub trait MutationGenerator {
    /// Number of mutation points in `unit`.
    fn count_mutation_points(&self, unit: &UnitId) -> Result<usize, EngineError>;

    /// Mutant at `index`.
    fn mutant_for(&self, unit: &UnitId, index: usize) -> Result<Mutant, EngineError>;
}

/// An isolated runtime into which a unit and its tests are loaded once, then patched in place.
pub trait ExecutionContext {
    /// Load the target unit and its tests.
    fn load(&mut self, unit: &UnitId, tests: &TestGroup) -> Result<(), EngineError>;

    /// Replace the loaded code of `unit` with `code`.
    ///
    /// `Ok(false)` means the patch is structurally non-viable; the context keeps its prior state.
    fn patch(&mut self, unit: &UnitId, code: &[u8]) -> Result<bool, EngineError>;

    /// Run `tests` against the current state.
    fn run_tests(&mut self, tests: &TestGroup) -> Result<TestRunSummary, EngineError>;
}

/// Builds generators and fresh execution contexts for one platform.
pub trait MutationBackend: Send + Sync {
    /// Generator type.
    type Generator: MutationGenerator;
    /// Context type.
    type Context: ExecutionContext;

    /// Generator honouring the operators enabled in `config`.
    fn generator(&self, config: &MutationConfig) -> Result<Self::Generator, EngineError>;

    /// A fresh context that has never run any code of the target unit.
    fn create_context(&self) -> Result<Self::Context, EngineError>;
}
