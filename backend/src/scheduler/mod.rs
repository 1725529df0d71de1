// Job Scheduler - cooperative in-process loop driving the periodic jobs.
//
// A tick fires every 30 seconds; due jobs launch on independent workers with
// a per-job timeout. The registry is guarded by a read/write lock: reads
// during tick iteration, writes for add/remove/toggle and post-run updates.

pub mod jobs;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{RwLock, watch};
use tracing::{error, info, warn};

/// Scheduler tick cadence.
pub const TICK_INTERVAL: Duration = Duration::from_secs(30);
/// Default per-job timeout.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(120);
/// Spacing applied to unknown schedule expressions.
const FALLBACK_SPACING_MINUTES: i64 = 30;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("job not found: {0}")]
    NotFound(String),
    #[error("job execution error: {0}")]
    ExecutionError(String),
}

pub type JobResult<T> = Result<T, JobError>;

/// A job handler: an async closure returning Ok or an error message.
pub type JobHandler = Arc<dyn Fn() -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

struct ScheduledJob {
    id: String,
    schedule: String,
    active: bool,
    running: bool,
    last_run: Option<DateTime<Utc>>,
    next_run: DateTime<Utc>,
    run_count: u64,
    error_count: u64,
    timeout: Duration,
    handler: JobHandler,
}

/// Introspection snapshot of one registered job.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    pub schedule: String,
    pub active: bool,
    pub running: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: DateTime<Utc>,
    pub run_count: u64,
    pub error_count: u64,
    pub timeout_secs: u64,
}

pub struct Scheduler {
    registry: Arc<RwLock<HashMap<String, ScheduledJob>>>,
    shutdown: watch::Sender<bool>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            registry: Arc::new(RwLock::new(HashMap::new())),
            shutdown,
        }
    }

    /// Register a job. The first run is scheduled one full interval out.
    pub async fn add_job(
        &self,
        id: impl Into<String>,
        schedule: impl Into<String>,
        timeout: Duration,
        handler: JobHandler,
    ) {
        let id = id.into();
        let schedule = schedule.into();
        let next_run = next_run_after(&schedule, Utc::now());

        let job = ScheduledJob {
            id: id.clone(),
            schedule: schedule.clone(),
            active: true,
            running: false,
            last_run: None,
            next_run,
            run_count: 0,
            error_count: 0,
            timeout,
            handler,
        };

        self.registry.write().await.insert(id.clone(), job);
        info!("registered job '{}' ({}), next run {}", id, schedule, next_run);
    }

    pub async fn remove_job(&self, id: &str) -> JobResult<()> {
        match self.registry.write().await.remove(id) {
            Some(_) => {
                info!("removed job '{}'", id);
                Ok(())
            }
            None => Err(JobError::NotFound(id.to_string())),
        }
    }

    pub async fn set_active(&self, id: &str, active: bool) -> JobResult<()> {
        let mut registry = self.registry.write().await;
        let job = registry
            .get_mut(id)
            .ok_or_else(|| JobError::NotFound(id.to_string()))?;
        job.active = active;
        info!("job '{}' {}", id, if active { "activated" } else { "deactivated" });
        Ok(())
    }

    pub async fn list_jobs(&self) -> Vec<JobInfo> {
        let registry = self.registry.read().await;
        let mut jobs: Vec<JobInfo> = registry.values().map(snapshot).collect();
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        jobs
    }

    /// Run a job immediately, outside its schedule.
    pub async fn run_now(&self, id: &str) -> JobResult<()> {
        let (handler, timeout) = {
            let registry = self.registry.read().await;
            let job = registry
                .get(id)
                .ok_or_else(|| JobError::NotFound(id.to_string()))?;
            (job.handler.clone(), job.timeout)
        };

        match tokio::time::timeout(timeout, handler()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(JobError::ExecutionError(e)),
            Err(_) => Err(JobError::ExecutionError("job timed out".to_string())),
        }
    }

    /// Start the tick loop on its own task. Returns immediately.
    pub fn start(&self) {
        let registry = self.registry.clone();
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            info!("scheduler started, ticking every {:?}", TICK_INTERVAL);

            loop {
                tokio::select! {
                    _ = interval.tick() => tick(&registry).await,
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("scheduler stopping; in-flight workers finish naturally");
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Signal the tick loop to exit after the current tick. Workers already
    /// launched run to completion (or their timeout).
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

type Registry = Arc<RwLock<HashMap<String, ScheduledJob>>>;

/// One scheduler tick: collect due jobs under the read lock, briefly take
/// the write lock to mark them running so a slow job is not launched twice,
/// then hand each to an independent worker.
async fn tick(registry: &Registry) {
    let now = Utc::now();

    let due: Vec<String> = {
        let jobs = registry.read().await;
        jobs.values()
            .filter(|job| job.active && !job.running && job.next_run <= now)
            .map(|job| job.id.clone())
            .collect()
    };

    if due.is_empty() {
        return;
    }

    let mut launches: Vec<(String, JobHandler, Duration)> = Vec::new();
    {
        let mut jobs = registry.write().await;
        for id in &due {
            if let Some(job) = jobs.get_mut(id) {
                if job.active && !job.running && job.next_run <= now {
                    job.running = true;
                    launches.push((job.id.clone(), job.handler.clone(), job.timeout));
                }
            }
        }
    }

    for (id, handler, timeout) in launches {
        let registry = registry.clone();
        tokio::spawn(async move {
            info!("running job '{}'", id);
            let outcome = tokio::time::timeout(timeout, handler()).await;

            let failed = match &outcome {
                Ok(Ok(())) => false,
                Ok(Err(e)) => {
                    error!("job '{}' failed: {}", id, e);
                    true
                }
                Err(_) => {
                    // A cancelled run counts as an error.
                    warn!("job '{}' timed out after {:?}", id, timeout);
                    true
                }
            };

            let finished = Utc::now();
            let mut jobs = registry.write().await;
            if let Some(job) = jobs.get_mut(&id) {
                job.running = false;
                job.last_run = Some(finished);
                job.run_count += 1;
                if failed {
                    job.error_count += 1;
                }
                job.next_run = next_run_after(&job.schedule, finished);
            }
        });
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

fn snapshot(job: &ScheduledJob) -> JobInfo {
    JobInfo {
        id: job.id.clone(),
        schedule: job.schedule.clone(),
        active: job.active,
        running: job.running,
        last_run: job.last_run,
        next_run: job.next_run,
        run_count: job.run_count,
        error_count: job.error_count,
        timeout_secs: job.timeout.as_secs(),
    }
}

/// Next fire time for a schedule expression.
///
/// Supported expressions: `every_1m`, `every_5m`, `every_15m`, `every_30m`,
/// `hourly`, and `daily_HH:MM`. Anything else gets 30-minute spacing rather
/// than a silent error.
pub fn next_run_after(schedule: &str, now: DateTime<Utc>) -> DateTime<Utc> {
    match schedule {
        "every_1m" => now + ChronoDuration::minutes(1),
        "every_5m" => now + ChronoDuration::minutes(5),
        "every_15m" => now + ChronoDuration::minutes(15),
        "every_30m" => now + ChronoDuration::minutes(30),
        "hourly" => now + ChronoDuration::hours(1),
        daily if daily.starts_with("daily_") => {
            let time = daily.trim_start_matches("daily_");
            match chrono::NaiveTime::parse_from_str(time, "%H:%M") {
                Ok(target) => {
                    let today = now
                        .date_naive()
                        .and_time(target)
                        .and_utc();
                    if today > now {
                        today
                    } else {
                        today + ChronoDuration::days(1)
                    }
                }
                Err(_) => {
                    warn!("unparseable daily schedule '{}', using 30-minute spacing", schedule);
                    now + ChronoDuration::minutes(FALLBACK_SPACING_MINUTES)
                }
            }
        }
        other => {
            warn!("unknown schedule expression '{}', using 30-minute spacing", other);
            now + ChronoDuration::minutes(FALLBACK_SPACING_MINUTES)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn handler_ok() -> JobHandler {
        Arc::new(|| Box::pin(async { Ok(()) }))
    }

    #[test]
    fn interval_expressions() {
        let now = Utc.with_ymd_and_hms(2025, 3, 10, 10, 0, 0).unwrap();
        assert_eq!(next_run_after("every_5m", now), now + ChronoDuration::minutes(5));
        assert_eq!(next_run_after("every_15m", now), now + ChronoDuration::minutes(15));
        assert_eq!(next_run_after("hourly", now), now + ChronoDuration::hours(1));
    }

    #[test]
    fn daily_expression_rolls_to_tomorrow() {
        let morning = Utc.with_ymd_and_hms(2025, 3, 10, 1, 0, 0).unwrap();
        assert_eq!(
            next_run_after("daily_02:00", morning),
            Utc.with_ymd_and_hms(2025, 3, 10, 2, 0, 0).unwrap()
        );

        let evening = Utc.with_ymd_and_hms(2025, 3, 10, 23, 0, 0).unwrap();
        assert_eq!(
            next_run_after("daily_02:00", evening),
            Utc.with_ymd_and_hms(2025, 3, 11, 2, 0, 0).unwrap()
        );
    }

    #[test]
    fn unknown_expression_defaults_to_30_minutes() {
        let now = Utc.with_ymd_and_hms(2025, 3, 10, 10, 0, 0).unwrap();
        assert_eq!(
            next_run_after("*/7 * * * *", now),
            now + ChronoDuration::minutes(30)
        );
        assert_eq!(
            next_run_after("daily_25:99", now),
            now + ChronoDuration::minutes(30)
        );
    }

    #[tokio::test]
    async fn registry_add_toggle_remove() {
        let scheduler = Scheduler::new();
        scheduler
            .add_job("sla_check", "every_15m", DEFAULT_JOB_TIMEOUT, handler_ok())
            .await;

        let jobs = scheduler.list_jobs().await;
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].active);
        assert_eq!(jobs[0].run_count, 0);

        scheduler.set_active("sla_check", false).await.unwrap();
        assert!(!scheduler.list_jobs().await[0].active);

        scheduler.remove_job("sla_check").await.unwrap();
        assert!(scheduler.list_jobs().await.is_empty());

        assert!(matches!(
            scheduler.remove_job("sla_check").await,
            Err(JobError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn run_now_reports_handler_failure() {
        let scheduler = Scheduler::new();
        scheduler
            .add_job(
                "failing",
                "hourly",
                DEFAULT_JOB_TIMEOUT,
                Arc::new(|| Box::pin(async { Err("boom".to_string()) })),
            )
            .await;

        match scheduler.run_now("failing").await {
            Err(JobError::ExecutionError(msg)) => assert_eq!(msg, "boom"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn run_now_times_out_slow_handlers() {
        let scheduler = Scheduler::new();
        scheduler
            .add_job(
                "slow",
                "hourly",
                Duration::from_millis(20),
                Arc::new(|| {
                    Box::pin(async {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        Ok(())
                    })
                }),
            )
            .await;

        match scheduler.run_now("slow").await {
            Err(JobError::ExecutionError(msg)) => assert!(msg.contains("timed out")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
