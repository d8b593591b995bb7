//! Sinks for result sets harvested by the scheduler.

use tracing::info;

use super::classifier::{meets_threshold, percent_detected};
use super::model::ClassMutationResults;

/// Receives result sets for one scheduled batch.
///
/// `run_start` precedes every delivery, `run_end` follows the last one. All calls come from the
/// single harvesting task, never concurrently.
pub trait MutationResultListener: Send {
    /// Batch is about to start.
    fn run_start(&mut self);

    /// One unit's results, delivered exactly once.
    fn handle_mutation_result(&mut self, results: &ClassMutationResults);

    /// Batch finished without a fatal error.
    fn run_end(&mut self);
}

/// Emits one tracing event per delivered result set.
#[derive(Debug, Default)]
pub struct LoggingListener {
    delivered: usize,
}

impl MutationResultListener for LoggingListener {
    fn run_start(&mut self) {
        self.delivered = 0;
        info!("mutation analysis started");
    }

    fn handle_mutation_result(&mut self, results: &ClassMutationResults) {
        self.delivered += 1;
        info!(
            unit = %results.unit,
            detected = results.detected(),
            survived = results.survived(),
            points = results.mutation_points,
            "unit results"
        );
    }

    fn run_end(&mut self) {
        info!(units = self.delivered, "mutation analysis finished");
    }
}

/// Accumulated kill-rate over a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScoreTotals {
    /// Result sets received.
    pub units: usize,
    /// Mutation points across all units.
    pub mutation_points: usize,
    /// Detected mutants across all units.
    pub detected: usize,
    /// Surviving mutants across all units.
    pub survived: usize,
}

impl ScoreTotals {
    /// Floored overall kill-rate.
    pub fn percent_detected(&self) -> u32 {
        percent_detected(self.detected, self.mutation_points)
    }
}

/// Tallies scores and prints a summary line when the batch ends.
#[derive(Debug, Default)]
pub struct ScoreListener {
    threshold: u32,
    totals: ScoreTotals,
    finished: bool,
}

impl ScoreListener {
    /// Listener comparing the overall score against `threshold`.
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            ..Self::default()
        }
    }

    /// Totals so far.
    pub fn totals(&self) -> ScoreTotals {
        self.totals
    }

    /// True once `run_end` was seen.
    pub fn finished(&self) -> bool {
        self.finished
    }

    /// Summary line.
    pub fn summary(&self) -> String {
        let verdict = if self.totals.mutation_points == 0
            || meets_threshold(
                self.totals.detected,
                self.totals.mutation_points,
                self.threshold,
            ) {
            "pass"
        } else {
            "fail"
        };
        format!(
            "mutation score {}% ({} detected, {} survived, {} points across {} unit(s)), threshold {}%: {verdict}",
            self.totals.percent_detected(),
            self.totals.detected,
            self.totals.survived,
            self.totals.mutation_points,
            self.totals.units,
            self.threshold,
        )
    }
}

impl MutationResultListener for ScoreListener {
    fn run_start(&mut self) {
        self.totals = ScoreTotals::default();
        self.finished = false;
    }

    fn handle_mutation_result(&mut self, results: &ClassMutationResults) {
        self.totals.units += 1;
        self.totals.mutation_points += results.mutation_points;
        self.totals.detected += results.detected();
        self.totals.survived += results.survived();
    }

    fn run_end(&mut self) {
        self.finished = true;
        println!("mutation-executor: {}", self.summary());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::model::{MutationRecord, UnitId};

    fn results(unit: &str, detected: &[bool]) -> ClassMutationResults {
        let mut results = ClassMutationResults::new(UnitId::new(unit), detected.len());
        for (index, detected) in detected.iter().enumerate() {
            results.push(MutationRecord {
                index,
                detected: *detected,
                mutated_unit: unit.to_string(),
                source_file: format!("{unit}.rs"),
                description: String::new(),
                member_signature: String::new(),
            });
        }
        results
    }

    #[test]
    fn score_listener_accumulates_across_units() {
        let mut listener = ScoreListener::new(50);
        listener.run_start();
        listener.handle_mutation_result(&results("a", &[true, false]));
        listener.handle_mutation_result(&results("b", &[true, true, false]));
        listener.run_end();

        assert!(listener.finished());
        assert_eq!(
            listener.totals(),
            ScoreTotals {
                units: 2,
                mutation_points: 5,
                detected: 3,
                survived: 2,
            }
        );
        assert_eq!(listener.totals().percent_detected(), 60);
        assert!(listener.summary().ends_with("threshold 50%: pass"));
    }

    #[test]
    fn run_start_resets_totals() {
        let mut listener = ScoreListener::new(90);
        listener.run_start();
        listener.handle_mutation_result(&results("a", &[false]));
        assert!(listener.summary().ends_with("fail"));
        listener.run_start();
        assert_eq!(listener.totals(), ScoreTotals::default());
        assert!(!listener.finished());
    }
}
