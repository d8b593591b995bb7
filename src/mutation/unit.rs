//! Schedulable analysis units.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use super::classifier::{UnitVerdict, classify};
use super::engine::{EngineError, ExecutionContext, MutationBackend, MutationGenerator};
use super::model::{AnalysisUnit, ClassMutationResults, MutationMetaData, TestRunSummary, UnitId};
use super::state::{RecordError, RecordSink, RecordWriter};
use super::watchdog::AbortToken;
use super::worker::{MutationWorker, WorkerError, WorkerOutcome, remaining_range};

/// Unit-level errors. Any of these is fatal to a scheduled run.
#[derive(Debug, Error)]
pub enum UnitError {
    /// Generator or context failure outside the worker loop.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
    /// Worker failure.
    #[error("worker error: {0}")]
    Worker(#[from] WorkerError),
    /// Journal failure.
    #[error("record error: {0}")]
    Record(#[from] RecordError),
}

/// One unit of work for the scheduler. Executed exactly once.
pub trait AnalysisTask: Send + 'static {
    /// Target unit, for logs and error reports.
    fn unit_id(&self) -> &UnitId;

    /// Run the analysis to completion.
    fn execute(self: Box<Self>) -> Result<MutationMetaData, UnitError>;
}

/// In-process analysis of one target unit over a backend.
///
/// Runs the baseline in its own context, then drives workers over the assigned range. A worker
/// that stops at a static initializer is replaced by a new one on a fresh context, resuming at
/// the index it stopped on.
pub struct MutationTestUnit<B> {
    unit: AnalysisUnit,
    backend: Arc<B>,
    journal: Option<PathBuf>,
    abort: AbortToken,
}

impl<B: MutationBackend> MutationTestUnit<B> {
    /// Unit over `backend`.
    pub fn new(unit: AnalysisUnit, backend: Arc<B>) -> Self {
        Self {
            unit,
            backend,
            journal: None,
            abort: AbortToken::new(),
        }
    }

    /// Also append every record to the record stream at `path`.
    pub fn with_journal(mut self, path: impl Into<PathBuf>) -> Self {
        self.journal = Some(path.into());
        self
    }

    /// Share an abort token with the workers.
    pub fn with_abort_token(mut self, abort: AbortToken) -> Self {
        self.abort = abort;
        self
    }

    fn open_sink(&self) -> Result<Box<dyn RecordSink>, RecordError> {
        Ok(match &self.journal {
            Some(path) => Box::new(RecordWriter::append_to(path)?),
            None => Box::new(RecordWriter::new(std::io::sink())),
        })
    }

    /// Run the unit synchronously.
    pub fn run(&self) -> Result<MutationMetaData, UnitError> {
        let target = &self.unit.target;
        let config = &self.unit.config;
        let generator = self.backend.generator(config)?;
        let total = generator.count_mutation_points(target)?;
        let range = self.unit.range.clamp_to(total);

        if range.is_empty() {
            info!(unit = %target, total, "no mutation points in range, skipping");
            let results = ClassMutationResults::new(target.clone(), 0);
            let verdict = classify(&TestRunSummary::default(), &results, config);
            return Ok(MutationMetaData::new(target.clone(), verdict, vec![results]));
        }

        let baseline = {
            let mut context = self.backend.create_context()?;
            context.load(target, &self.unit.tests)?;
            context.run_tests(&self.unit.tests)?
        };
        if baseline.any_failed() {
            warn!(
                unit = %target,
                failures = baseline.failures.len(),
                "tests do not pass against the unmutated unit"
            );
            let verdict = classify(
                &baseline,
                &ClassMutationResults::new(target.clone(), range.len()),
                config,
            );
            // Nothing was analysed, so the delivered result set carries no points.
            let results = ClassMutationResults::new(target.clone(), 0);
            return Ok(MutationMetaData::new(target.clone(), verdict, vec![results]));
        }

        let mut sink = self.open_sink()?;
        let mut results = ClassMutationResults::new(target.clone(), range.len());
        let mut pending = range;
        let mut restarts = 0usize;
        loop {
            let context = self.backend.create_context()?;
            let outcome = MutationWorker::new(&generator, context)
                .with_abort_token(self.abort.clone())
                .process(&self.unit.clone().with_range(pending), sink.as_mut())?;
            match outcome {
                WorkerOutcome::Completed(partial) => {
                    results.extend(partial);
                    break;
                }
                WorkerOutcome::RestartRequired { resume_at, partial } => {
                    results.extend(partial);
                    restarts += 1;
                    pending = remaining_range(pending, resume_at);
                }
            }
        }

        let verdict = classify(&baseline, &results, config);
        info!(
            unit = %target,
            detected = results.detected(),
            points = results.mutation_points,
            restarts,
            verdict = %verdict,
            "unit analysed"
        );
        Ok(MutationMetaData::new(target.clone(), verdict, vec![results]))
    }
}

impl<B> AnalysisTask for MutationTestUnit<B>
where
    B: MutationBackend + 'static,
{
    fn unit_id(&self) -> &UnitId {
        &self.unit.target
    }

    fn execute(self: Box<Self>) -> Result<MutationMetaData, UnitError> {
        self.run()
    }
}

/// Verdict of one harvested unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitSummary {
    /// Unit identity.
    pub unit: UnitId,
    /// Classification.
    pub verdict: UnitVerdict,
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::atomic::Ordering;

    use tempfile::tempdir;

    use super::*;
    use crate::mutation::classifier::FailureReason;
    use crate::mutation::config::MutationConfig;
    use crate::mutation::engine::fakes::{FakeBackend, FakeUnit};
    use crate::mutation::listener::{MutationResultListener, ScoreListener, ScoreTotals};
    use crate::mutation::model::{IndexRange, TestGroup};
    use crate::mutation::state::read_records;

    fn analysis_unit(threshold: u32) -> AnalysisUnit {
        AnalysisUnit::new(
            UnitId::new("calc"),
            TestGroup::new("calc_tests"),
            Arc::new(MutationConfig::default().with_threshold(threshold)),
        )
    }

    #[test]
    fn restarts_on_fresh_context_at_each_static_initializer() {
        let mut fake = FakeUnit::with_points(6);
        fake.static_init = BTreeSet::from([2, 4]);
        fake.killed = BTreeSet::from([0, 2, 4, 5]);
        let backend = Arc::new(FakeBackend::new(fake));

        let meta = MutationTestUnit::new(analysis_unit(66), Arc::clone(&backend))
            .run()
            .expect("unit should run");

        let results = &meta.class_results()[0];
        let indices: Vec<usize> = results.records().iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(results.detected(), 4);
        assert_eq!(meta.verdict, UnitVerdict::Success);
        // baseline + three worker invocations
        assert_eq!(backend.log.contexts_created.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn failing_baseline_produces_no_records() {
        let mut fake = FakeUnit::with_points(3);
        fake.baseline_fails = true;
        let backend = Arc::new(FakeBackend::new(fake));

        let meta = MutationTestUnit::new(analysis_unit(50), Arc::clone(&backend))
            .run()
            .expect("unit should run");

        assert_eq!(
            meta.verdict,
            UnitVerdict::Failure(FailureReason::BaselineFailed)
        );
        assert!(meta.class_results()[0].records().is_empty());
        assert_eq!(meta.class_results()[0].mutation_points, 0);
        assert!(backend.log.patches.lock().expect("log should lock").is_empty());
    }

    #[test]
    fn failing_baseline_does_not_dilute_batch_score() {
        let mut clean = FakeUnit::with_points(2);
        clean.killed = BTreeSet::from([0, 1]);
        let mut broken = FakeUnit::with_points(100);
        broken.baseline_fails = true;

        let mut listener = ScoreListener::new(80);
        listener.run_start();
        for fake in [clean, broken] {
            let meta = MutationTestUnit::new(analysis_unit(80), Arc::new(FakeBackend::new(fake)))
                .run()
                .expect("unit should run");
            for results in meta.class_results() {
                listener.handle_mutation_result(results);
            }
        }

        assert_eq!(
            listener.totals(),
            ScoreTotals {
                units: 2,
                mutation_points: 2,
                detected: 2,
                survived: 0,
            }
        );
        assert!(listener.summary().starts_with("mutation score 100%"));
        assert!(listener.summary().ends_with("pass"));
    }

    #[test]
    fn zero_points_is_skipped_without_running_tests() {
        let backend = Arc::new(FakeBackend::new(FakeUnit::with_points(0)));
        let meta = MutationTestUnit::new(analysis_unit(100), Arc::clone(&backend))
            .run()
            .expect("unit should run");
        assert_eq!(meta.verdict, UnitVerdict::Skipped);
        assert_eq!(backend.log.contexts_created.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn assigned_range_limits_processed_indices() {
        let mut fake = FakeUnit::with_points(10);
        fake.killed = BTreeSet::from([3, 4]);
        let backend = Arc::new(FakeBackend::new(fake));
        let unit = analysis_unit(100).with_range(IndexRange::new(3, 5));

        let meta = MutationTestUnit::new(unit, backend)
            .run()
            .expect("unit should run");
        let results = &meta.class_results()[0];
        assert_eq!(results.mutation_points, 2);
        assert_eq!(results.records().len(), 2);
        assert_eq!(meta.verdict, UnitVerdict::Success);
    }

    #[test]
    fn journal_receives_every_record() {
        let tmp = tempdir().expect("tempdir should be created");
        let journal = tmp.path().join("calc.records");
        let mut fake = FakeUnit::with_points(4);
        fake.static_init = BTreeSet::from([3]);
        let backend = Arc::new(FakeBackend::new(fake));

        MutationTestUnit::new(analysis_unit(0), backend)
            .with_journal(&journal)
            .run()
            .expect("unit should run");

        let replay = read_records(&journal).expect("journal should replay");
        let indices: Vec<usize> = replay.records.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
        assert_eq!(replay.malformed_lines, 0);
    }
}
