// src/reconcile/scheduler.rs

//! Scheduler for periodic reconciliation passes.
//!
//! The daemon runs as its own tokio task, independent of any ingestion call.
//! It wakes at most every `poll` interval, runs a pass when one is due, and
//! stops promptly when signalled.

use super::Reconciler;
use crate::error::Result;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Default interval between passes
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(6 * 3600);

/// Longest the daemon sleeps before re-checking its schedule
const MAX_POLL: Duration = Duration::from_secs(60);

/// State of the reconciliation scheduler
#[derive(Debug, Clone, Default)]
pub struct SchedulerState {
    /// Last time a pass was run
    pub last_pass: Option<DateTime<Utc>>,

    /// Next scheduled pass
    pub next_pass: Option<DateTime<Utc>>,
}

/// Decides when a pass is due
#[derive(Debug, Clone)]
pub struct ReconcileScheduler {
    interval: Duration,
    state: SchedulerState,
}

impl ReconcileScheduler {
    /// The first pass is due immediately
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            state: SchedulerState::default(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn should_run(&self) -> bool {
        match self.state.next_pass {
            Some(next) => Utc::now() >= next,
            None => true,
        }
    }

    /// Record that a pass was performed
    pub fn record_pass(&mut self) {
        self.state.last_pass = Some(Utc::now());
        self.calculate_next_pass();
    }

    fn calculate_next_pass(&mut self) {
        let base = self.state.last_pass.unwrap_or_else(Utc::now);
        let next = base + chrono::Duration::from_std(self.interval).unwrap_or_default();
        self.state.next_pass = Some(next);
    }

    pub fn state(&self) -> &SchedulerState {
        &self.state
    }

    /// Time until the next pass, zero if one is due
    pub fn time_until_next(&self) -> Duration {
        match self.state.next_pass {
            Some(next) => (next - Utc::now()).to_std().unwrap_or(Duration::ZERO),
            None => Duration::ZERO,
        }
    }

    /// Format status for display
    pub fn status_line(&self) -> String {
        match self.state.next_pass {
            Some(next) if next > Utc::now() => format_duration(next - Utc::now()),
            _ => "Pass due now".to_string(),
        }
    }
}

fn format_duration(duration: chrono::Duration) -> String {
    let total_secs = duration.num_seconds();
    if total_secs < 0 {
        return "overdue".to_string();
    }

    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;

    if hours > 24 {
        format!("Next pass in {} day(s)", hours / 24)
    } else if hours > 0 {
        format!("Next pass in {}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("Next pass in {} minute(s)", minutes)
    } else {
        "Pass due soon".to_string()
    }
}

/// Background runner for scheduled passes
pub struct ReconcileDaemon {
    reconciler: Reconciler,
    scheduler: ReconcileScheduler,
    poll: Duration,
}

/// Handle to a spawned daemon
pub struct DaemonHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<usize>>,
}

impl DaemonHandle {
    /// Signal the daemon to stop after its current pass
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Wait for the daemon to exit; returns the number of passes run
    pub async fn join(self) -> Result<usize> {
        self.task
            .await
            .map_err(|e| crate::error::Error::InitError(format!("Reconcile daemon task failed: {e}")))?
    }

    /// Stop and wait
    pub async fn shutdown(self) -> Result<usize> {
        self.stop();
        self.join().await
    }
}

impl ReconcileDaemon {
    pub fn new(reconciler: Reconciler, interval: Duration) -> Self {
        Self {
            reconciler,
            scheduler: ReconcileScheduler::new(interval),
            poll: MAX_POLL,
        }
    }

    /// Cap on each sleep between schedule checks
    pub fn with_poll(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    pub fn scheduler(&self) -> &ReconcileScheduler {
        &self.scheduler
    }

    /// Run until `shutdown` flips to true; returns the number of passes run
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<usize> {
        info!(
            "Reconcile daemon started (interval {:?})",
            self.scheduler.interval()
        );
        let mut passes = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            if self.scheduler.should_run() {
                match self.reconciler.run_pass().await {
                    Ok(report) => info!(
                        "Pass {}: {} checked, {} re-committed, {} skipped",
                        passes + 1,
                        report.checked,
                        report.recommitted(),
                        report.skipped.len()
                    ),
                    Err(e) => error!("Reconciliation pass failed: {}", e),
                }
                passes += 1;
                self.scheduler.record_pass();
            }

            let sleep = self.scheduler.time_until_next().min(self.poll);
            tokio::select! {
                _ = tokio::time::sleep(sleep) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Reconcile daemon stopping after {} pass(es)", passes);
        Ok(passes)
    }

    /// Run on a background task
    pub fn spawn(self) -> DaemonHandle {
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(self.run(rx));
        DaemonHandle { shutdown: tx, task }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_pass_due_immediately() {
        let scheduler = ReconcileScheduler::new(DEFAULT_INTERVAL);
        assert!(scheduler.should_run());
        assert_eq!(scheduler.time_until_next(), Duration::ZERO);
    }

    #[test]
    fn test_record_pass_schedules_next() {
        let mut scheduler = ReconcileScheduler::new(DEFAULT_INTERVAL);
        scheduler.record_pass();
        assert!(!scheduler.should_run());
        assert!(scheduler.time_until_next() > Duration::from_secs(5 * 3600));
        assert!(scheduler.status_line().starts_with("Next pass in 5h"));
    }

    #[test]
    fn test_status_line_follows_schedule() {
        let mut scheduler = ReconcileScheduler::new(Duration::from_secs(90 * 60));
        assert_eq!(scheduler.status_line(), "Pass due now");
        assert!(scheduler.state().last_pass.is_none());

        scheduler.record_pass();
        assert!(scheduler.state().last_pass.is_some());
        assert!(scheduler.status_line().starts_with("Next pass in 1h"));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(chrono::Duration::hours(2)), "Next pass in 2h 0m");
        assert_eq!(format_duration(chrono::Duration::minutes(45)), "Next pass in 45 minute(s)");
        assert_eq!(format_duration(chrono::Duration::days(2)), "Next pass in 2 day(s)");
    }
}
