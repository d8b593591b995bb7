//! Concurrent execution of analysis units with ordered, exactly-once listener delivery.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info};

use super::listener::MutationResultListener;
use super::model::{MutationMetaData, UnitId};
use super::unit::{AnalysisTask, UnitError, UnitSummary};

/// Fatal scheduler errors. `run_end` is not signalled when one of these is returned.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A unit returned an error.
    #[error("analysis of `{unit}` failed: {source}")]
    UnitFailed {
        /// Unit that failed.
        unit: UnitId,
        /// Underlying error.
        #[source]
        source: UnitError,
    },
    /// A unit panicked or was cancelled by the runtime.
    #[error("analysis of `{unit}` did not complete: {message}")]
    UnitPanicked {
        /// Unit that panicked.
        unit: UnitId,
        /// Panic payload or cancellation detail.
        message: String,
    },
}

fn join_error_message(err: JoinError) -> String {
    if err.is_cancelled() {
        return "task was cancelled".to_string();
    }
    let payload = err.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unit panicked".to_string()
    }
}

/// Runs units on a bounded pool and fans results out to listeners in completion order.
pub struct MutationAnalysisExecutor {
    concurrency: usize,
    listeners: Vec<Box<dyn MutationResultListener>>,
}

impl MutationAnalysisExecutor {
    /// Executor running at most `concurrency` units at once (minimum one).
    pub fn new(concurrency: usize, listeners: Vec<Box<dyn MutationResultListener>>) -> Self {
        Self {
            concurrency: concurrency.max(1),
            listeners,
        }
    }

    /// Worker slot count.
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Run every unit and deliver its results.
    ///
    /// Results are harvested in the order units finish. Each result set goes to every listener
    /// before the next one is delivered. On a fatal unit error harvesting stops at once; units
    /// still running are left to finish in the background and their results are dropped.
    pub async fn run(
        &mut self,
        units: Vec<Box<dyn AnalysisTask>>,
    ) -> Result<Vec<UnitSummary>, SchedulerError> {
        info!(
            units = units.len(),
            concurrency = self.concurrency,
            "running analysis units"
        );

        for listener in &mut self.listeners {
            listener.run_start();
        }

        let slots = Arc::new(Semaphore::new(self.concurrency));
        let mut running = JoinSet::new();
        for unit in units {
            let slots = Arc::clone(&slots);
            running.spawn(async move {
                let id = unit.unit_id().clone();
                let _slot = slots.acquire_owned().await;
                debug!(unit = %id, "unit dispatched");
                match tokio::task::spawn_blocking(move || unit.execute()).await {
                    Ok(Ok(meta)) => Ok(meta),
                    Ok(Err(source)) => Err(SchedulerError::UnitFailed { unit: id, source }),
                    Err(err) => Err(SchedulerError::UnitPanicked {
                        unit: id,
                        message: join_error_message(err),
                    }),
                }
            });
        }

        let mut summaries = Vec::with_capacity(running.len());
        while let Some(joined) = running.join_next().await {
            let harvested = match joined {
                Ok(harvested) => harvested,
                Err(err) => Err(SchedulerError::UnitPanicked {
                    unit: UnitId::new("<unknown>"),
                    message: join_error_message(err),
                }),
            };
            let meta = match harvested {
                Ok(meta) => meta,
                Err(err) => {
                    error!(error = %err, "aborting mutation analysis");
                    running.detach_all();
                    return Err(err);
                }
            };
            summaries.push(self.deliver(meta));
        }

        for listener in &mut self.listeners {
            listener.run_end();
        }
        Ok(summaries)
    }

    fn deliver(&mut self, meta: MutationMetaData) -> UnitSummary {
        debug!(unit = %meta.unit, verdict = %meta.verdict, "unit harvested");
        let summary = UnitSummary {
            unit: meta.unit.clone(),
            verdict: meta.verdict.clone(),
        };
        for results in meta.class_results() {
            for listener in &mut self.listeners {
                listener.handle_mutation_result(results);
            }
        }
        summary
    }
}
