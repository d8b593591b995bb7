//! Per-unit mutation worker: patch each mutant into a live context and run the tests.

use thiserror::Error;
use tracing::{debug, info};

use super::engine::{EngineError, ExecutionContext, MutationGenerator};
use super::model::{AnalysisUnit, ClassMutationResults, IndexRange, MutationRecord};
use super::state::{RecordError, RecordSink};
use super::watchdog::{AbortReason, AbortToken};

/// Worker errors.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Generator or context failure.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
    /// Record stream failure.
    #[error("record error: {0}")]
    Record(#[from] RecordError),
    /// Stopped through the abort token.
    #[error("worker aborted before index {index}: {reason:?}")]
    Aborted {
        /// Reason recorded on the token.
        reason: AbortReason,
        /// First index not processed.
        index: usize,
    },
}

/// How a worker invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// Every index of the clamped range was processed.
    Completed(ClassMutationResults),
    /// A static initializer mutant was reached after the first index. A fresh context must
    /// resume at `resume_at`; no record was written for it.
    RestartRequired {
        /// Index the next worker starts at.
        resume_at: usize,
        /// Records produced before the restart point.
        partial: ClassMutationResults,
    },
}

impl WorkerOutcome {
    /// Records produced by this invocation.
    pub fn results(&self) -> &ClassMutationResults {
        match self {
            Self::Completed(results) => results,
            Self::RestartRequired { partial, .. } => partial,
        }
    }
}

/// Runs one unit's index range inside a single execution context.
pub struct MutationWorker<'g, G, C> {
    generator: &'g G,
    context: C,
    abort: AbortToken,
}

impl<'g, G, C> MutationWorker<'g, G, C>
where
    G: MutationGenerator,
    C: ExecutionContext,
{
    /// Worker owning `context` for its whole lifetime.
    pub fn new(generator: &'g G, context: C) -> Self {
        Self {
            generator,
            context,
            abort: AbortToken::new(),
        }
    }

    /// Observe `abort` between indices.
    pub fn with_abort_token(mut self, abort: AbortToken) -> Self {
        self.abort = abort;
        self
    }

    /// Process the unit's range, appending each record to `sink` as soon as it exists.
    pub fn process(
        mut self,
        unit: &AnalysisUnit,
        sink: &mut dyn RecordSink,
    ) -> Result<WorkerOutcome, WorkerError> {
        self.context.load(&unit.target, &unit.tests)?;

        let total = self.generator.count_mutation_points(&unit.target)?;
        let range = unit.range.clamp_to(total);
        let mut results = ClassMutationResults::new(unit.target.clone(), range.len());

        info!(
            unit = %unit.target,
            range = %range,
            total,
            "mutating unit"
        );

        for index in range.start..range.end {
            if let Some(reason) = self.abort.reason() {
                return Err(WorkerError::Aborted { reason, index });
            }

            let mutant = self.generator.mutant_for(&unit.target, index)?;
            debug!(
                unit = %unit.target,
                index,
                member = %mutant.member.signature,
                "generated mutant"
            );

            if mutant.member.is_static_initializer() && index != range.start {
                info!(
                    unit = %unit.target,
                    index,
                    "static initializer mutant needs a fresh context, restarting"
                );
                return Ok(WorkerOutcome::RestartRequired {
                    resume_at: index,
                    partial: results,
                });
            }

            let detected = if self.context.patch(&unit.target, &mutant.code)? {
                self.context.run_tests(&unit.tests)?.any_failed()
            } else {
                info!(unit = %unit.target, index, "mutation was not viable");
                true
            };

            let record = MutationRecord {
                index,
                detected,
                mutated_unit: mutant.unit_name,
                source_file: mutant.source_file,
                description: mutant.description,
                member_signature: mutant.member.signature,
            };
            sink.append(&record)?;
            results.push(record);

            info!(
                unit = %unit.target,
                index,
                last = range.end - 1,
                detected,
                "mutation processed"
            );
        }

        Ok(WorkerOutcome::Completed(results))
    }
}

/// Range a relaunched worker covers after a restart at `resume_at`.
pub fn remaining_range(range: IndexRange, resume_at: usize) -> IndexRange {
    IndexRange::new(resume_at.max(range.start), range.end)
}
