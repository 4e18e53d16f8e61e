//! Poll loop that turns due schedules into report generation runs.
//!
//! Each tick claims a lease per due schedule before dispatching, so a firing
//! is generated once even when ticks overlap or several daemons share the
//! catalog. Runs are bounded by a semaphore and each executes inside its own
//! task so a panic is recorded as a failed report instead of escaping.

use std::{future::Future, sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tally_db::{Database, ReportRecord, ScheduleRecord};
use tokio::{
    sync::Semaphore,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{
    report::{ReportBuilder, ReportOutcome},
    worker::BackgroundWorker,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    pub max_concurrent_runs: usize,
    pub lease_duration: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            max_concurrent_runs: 4,
            lease_duration: Duration::from_secs(30 * 60),
        }
    }
}

pub struct ReportScheduler {
    db: Database,
    builder: Arc<ReportBuilder>,
    config: SchedulerConfig,
    permits: Arc<Semaphore>,
}

impl ReportScheduler {
    pub fn new(db: Database, builder: ReportBuilder, config: SchedulerConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_runs.max(1)));
        Self {
            db,
            builder: Arc::new(builder),
            config,
            permits,
        }
    }

    pub fn config(&self) -> SchedulerConfig {
        self.config
    }

    /// Claims every due schedule and dispatches one run per successful claim.
    /// The handles resolve when the corresponding run has finished.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<Vec<JoinHandle<()>>> {
        let due = self.db.due_schedules(now).await?;
        let lease_until = now + chrono::Duration::from_std(self.config.lease_duration)?;

        let mut handles = Vec::with_capacity(due.len());
        for schedule in due {
            let Some(expected) = schedule.next_run else {
                continue;
            };
            match self
                .db
                .claim_schedule(schedule.id, expected, now, lease_until)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    debug!(schedule_id = schedule.id, "schedule already claimed");
                    continue;
                }
                Err(err) => {
                    warn!(schedule_id = schedule.id, error = %err, "failed to claim schedule");
                    continue;
                }
            }
            info!(schedule_id = schedule.id, due_at = %expected, "dispatching report run");
            handles.push(self.dispatch(schedule));
        }
        Ok(handles)
    }

    fn dispatch(&self, schedule: ScheduleRecord) -> JoinHandle<()> {
        let permits = self.permits.clone();
        let builder = self.builder.clone();
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            run_schedule(builder, schedule).await;
        })
    }
}

async fn run_schedule(builder: Arc<ReportBuilder>, schedule: ScheduleRecord) {
    let report = match builder.begin(&schedule, Utc::now()).await {
        Ok(report) => report,
        Err(err) => {
            // The lease stays until it expires, then the firing is retried.
            error!(schedule_id = schedule.id, error = %err, "failed to create pending report");
            return;
        }
    };

    let task_builder = builder.clone();
    let task_schedule = schedule.clone();
    let task_report = report.clone();
    let run = async move { task_builder.complete(&task_schedule, &task_report).await };
    supervise_run(&builder, &schedule, &report, run).await;
}

/// Runs one generation in its own task. An error or panic fails the pending
/// report and still advances the schedule.
async fn supervise_run<F>(
    builder: &ReportBuilder,
    schedule: &ScheduleRecord,
    report: &ReportRecord,
    run: F,
) where
    F: Future<Output = Result<ReportOutcome>> + Send + 'static,
{
    let reason = match tokio::spawn(run).await {
        Ok(Ok(outcome)) => {
            info!(
                schedule_id = schedule.id,
                report_id = outcome.report.id,
                status = outcome.report.status.as_str(),
                sheets = outcome.sheet_names.len(),
                "report run finished"
            );
            return;
        }
        Ok(Err(err)) => format!("report generation failed: {err}"),
        Err(join_err) if join_err.is_panic() => "report generation panicked".to_string(),
        Err(join_err) => format!("report generation aborted: {join_err}"),
    };

    warn!(schedule_id = schedule.id, report_id = report.id, %reason, "report run abandoned");
    if let Err(err) = builder.abandon(schedule, report.id, &reason).await {
        error!(schedule_id = schedule.id, error = %err, "failed to record abandoned report run");
    }
}

#[async_trait]
impl BackgroundWorker for ReportScheduler {
    fn name(&self) -> &'static str {
        "report-scheduler"
    }

    async fn run(self: Arc<Self>) -> Result<()> {
        let mut ticker = interval(self.config.tick_interval.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            tick_secs = self.config.tick_interval.as_secs(),
            max_concurrent_runs = self.config.max_concurrent_runs,
            "report scheduler started"
        );
        loop {
            ticker.tick().await;
            match self.tick(Utc::now()).await {
                Ok(handles) if !handles.is_empty() => {
                    debug!(dispatched = handles.len(), "scheduler tick dispatched runs");
                }
                Ok(_) => {}
                Err(err) => warn!(error = %err, "scheduler tick failed"),
            }
        }
    }
}
