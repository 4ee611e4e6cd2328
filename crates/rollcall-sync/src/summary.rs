use chrono::{DateTime, FixedOffset};
use rollcall_core::RunSummary;
use rollcall_storage::ResilientWriter;
use tracing::{info, warn};

use crate::layout::DASHBOARD_SHEET;
use crate::reconcile::{Outcome, OutcomeKind};

/// Running counters for one sync run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunAggregator {
    pub targeted: usize,
    pub seen: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub new: usize,
    pub updated: usize,
    pub unchanged: usize,
}

impl RunAggregator {
    pub fn set_targeted(&mut self, targeted: usize) {
        self.targeted = targeted;
    }

    pub fn record(&mut self, outcome: &Outcome) {
        match outcome.kind {
            OutcomeKind::New => {
                self.succeeded += 1;
                self.new += 1;
            }
            OutcomeKind::Updated => {
                self.succeeded += 1;
                self.updated += 1;
            }
            OutcomeKind::Unchanged => {
                self.succeeded += 1;
                self.unchanged += 1;
            }
            OutcomeKind::Error => self.failed += 1,
        }
    }

    /// A target whose scrape never produced a record.
    pub fn record_failure(&mut self) {
        self.failed += 1;
    }

    /// Counts a target as processed once its work is fully done.
    pub fn finish_identifier(&mut self) {
        self.seen += 1;
    }

    pub fn success_rate(&self) -> f64 {
        if self.seen == 0 {
            0.0
        } else {
            self.succeeded as f64 * 100.0 / self.seen as f64
        }
    }

    pub fn summary(&self, run_no: u32, recorded_at: DateTime<FixedOffset>, source: &str) -> RunSummary {
        RunSummary {
            run_no,
            recorded_at,
            targeted: self.targeted,
            seen: self.seen,
            succeeded: self.succeeded,
            failed: self.failed,
            new: self.new,
            updated: self.updated,
            unchanged: self.unchanged,
            source: source.to_string(),
        }
    }
}

pub async fn append_summary(writer: &ResilientWriter, summary: &RunSummary) -> bool {
    let landed = writer
        .append_row(DASHBOARD_SHEET, &summary.to_row())
        .await
        .is_some();
    if !landed {
        warn!(run_no = summary.run_no, "run summary not recorded");
    }
    landed
}

pub fn log_report(aggregate: &RunAggregator, run_no: u32) {
    info!(
        run_no,
        targeted = aggregate.targeted,
        seen = aggregate.seen,
        succeeded = aggregate.succeeded,
        failed = aggregate.failed,
        new = aggregate.new,
        updated = aggregate.updated,
        unchanged = aggregate.unchanged,
        success_rate = format!("{:.1}%", aggregate.success_rate()),
        "sync run finished"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(kind: OutcomeKind) -> Outcome {
        Outcome {
            kind,
            changed: Vec::new(),
            row: None,
            error: None,
        }
    }

    #[test]
    fn outcomes_feed_the_right_counters() {
        let mut agg = RunAggregator::default();
        for kind in [
            OutcomeKind::New,
            OutcomeKind::Updated,
            OutcomeKind::Unchanged,
            OutcomeKind::Error,
        ] {
            agg.record(&outcome(kind));
            agg.finish_identifier();
        }
        agg.record_failure();
        agg.finish_identifier();

        assert_eq!(agg.seen, 5);
        assert_eq!(agg.succeeded, 3);
        assert_eq!(agg.failed, 2);
        assert_eq!((agg.new, agg.updated, agg.unchanged), (1, 1, 1));
        assert!((agg.success_rate() - 60.0).abs() < f64::EPSILON);
    }

    #[test]
    fn summary_keeps_targets_apart_from_processed() {
        let mut agg = RunAggregator::default();
        agg.set_targeted(10);
        for _ in 0..3 {
            agg.record(&outcome(OutcomeKind::New));
            agg.finish_identifier();
        }
        let summary = agg.summary(4, rollcall_core::site_now(), "Online");
        assert_eq!((summary.targeted, summary.seen, summary.succeeded), (10, 3, 3));
        assert_eq!(summary.to_row()[2], "10");
    }

    #[test]
    fn empty_run_has_zero_rate() {
        assert_eq!(RunAggregator::default().success_rate(), 0.0);
    }
}
