//! Prelude module for convenient imports.
//!
//! ```rust,ignore
//! use mutation_executor::prelude::*;
//! ```

pub use crate::mutation::{
    AnalysisTask, AnalysisUnit, ClassMutationResults, ExecutionContext, IndexRange,
    LoggingListener, MutationAnalysisExecutor, MutationBackend, MutationConfig, MutationGenerator,
    MutationOperator, MutationResultListener, MutationTestUnit, ScoreListener, SourceTreeBackend,
    TestGroup, UnitId, UnitVerdict,
};
