//! Mutation analysis: scheduling, per-unit workers, classification and result fan-out.

pub mod classifier;
pub mod config;
pub mod engine;
pub mod listener;
pub mod model;
pub mod protocol;
/// Source-tree generator and sandboxed execution context.
pub mod sandbox;
pub mod scheduler;
pub mod state;
pub mod unit;
pub mod watchdog;
pub mod worker;

pub use classifier::{FailureReason, UnitVerdict, classify, meets_threshold, percent_detected};
pub use config::{ConfigError, MutationConfig, MutationOperator, WatchdogConfig};
pub use engine::{
    EngineError, ExecutionContext, MemberKind, MutatedMember, Mutant, MutationBackend,
    MutationGenerator,
};
pub use listener::{LoggingListener, MutationResultListener, ScoreListener, ScoreTotals};
pub use model::{
    AnalysisUnit, ClassMutationResults, IndexRange, MutationMetaData, MutationRecord, TestFailure,
    TestGroup, TestRunSummary, UnitId,
};
pub use protocol::{Handshake, HandshakeError, WorkerExit};
pub use sandbox::{SandboxContext, SandboxSpec, SourceMutator, SourceTreeBackend};
pub use scheduler::{MutationAnalysisExecutor, SchedulerError};
pub use state::{RecordError, RecordReplay, RecordSink, RecordWriter, read_records};
pub use unit::{AnalysisTask, MutationTestUnit, UnitError, UnitSummary};
pub use watchdog::{AbortReason, AbortToken, MemoryProbe, MemoryWatchdog, ProcMemoryProbe};
pub use worker::{MutationWorker, WorkerError, WorkerOutcome};
