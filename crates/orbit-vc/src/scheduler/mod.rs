use std::{collections::BTreeMap, future::Future, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, info_span, warn, Instrument};

use crate::{
    config::TaskSchedule,
    tasks::{self, Task, TaskContext, TaskReport},
};

#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskStatus {
    pub last_started: Option<DateTime<Utc>>,
    pub last_finished: Option<DateTime<Utc>>,
    pub last_success: Option<bool>,
    pub last_summary: Option<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct SchedulerState {
    pub running: Option<String>,
    pub tasks: BTreeMap<String, TaskStatus>,
}

pub type SharedState = Arc<Mutex<SchedulerState>>;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("task {0} is already running")]
    Busy(String),

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// Whether `schedule` should fire at `now` given when it last started.
pub fn due(schedule: &TaskSchedule, last_started: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    if !schedule.enabled {
        return false;
    }
    match last_started {
        None => true,
        Some(last) => now - last >= chrono::Duration::minutes(schedule.interval_minutes as i64),
    }
}

/// Runs one task unless another is in flight. Status is recorded either way
/// the task ends.
pub async fn run_task(
    state: &SharedState,
    task: &dyn Task,
    ctx: &TaskContext,
) -> Result<TaskReport, SchedulerError> {
    {
        let mut lock = state.lock().await;
        if let Some(current) = &lock.running {
            return Err(SchedulerError::Busy(current.clone()));
        }
        lock.running = Some(task.name().to_string());
        lock.tasks.entry(task.name().to_string()).or_default().last_started = Some(ctx.clock.now());
    }

    let result = task
        .run(ctx)
        .instrument(info_span!("task", name = task.name()))
        .await;

    let mut lock = state.lock().await;
    lock.running = None;
    let status = lock.tasks.entry(task.name().to_string()).or_default();
    status.last_finished = Some(ctx.clock.now());
    match &result {
        Ok(report) => {
            info!(task = task.name(), summary = %report.summary, "task finished");
            status.last_success = Some(true);
            status.last_summary = Some(report.summary.clone());
        }
        Err(e) => {
            error!(task = task.name(), error = %e, "task failed");
            status.last_success = Some(false);
            status.last_summary = Some(format!("{e:#}"));
        }
    }

    result.map_err(SchedulerError::from)
}

/// Enabled schedules whose task exists; unknown names are logged and dropped.
pub fn resolve_schedules(schedules: &[TaskSchedule]) -> Vec<(TaskSchedule, &'static dyn Task)> {
    schedules
        .iter()
        .filter_map(|schedule| match tasks::find(&schedule.name) {
            Some(task) => Some((schedule.clone(), task)),
            None => {
                warn!(task = %schedule.name, "scheduled task is not registered, ignoring");
                None
            }
        })
        .collect()
}

pub async fn scheduler_loop(
    ctx: TaskContext,
    state: SharedState,
    shutdown: impl Future<Output = ()>,
) {
    let schedules = resolve_schedules(&ctx.config.scheduler.tasks);
    let mut ticker = tokio::time::interval(Duration::from_secs(ctx.config.scheduler.check_interval_secs.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    info!(tasks = schedules.len(), "scheduler started");
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {}
        }

        for (schedule, task) in &schedules {
            let last_started = {
                let lock = state.lock().await;
                lock.tasks.get(task.name()).and_then(|s| s.last_started)
            };
            if !due(schedule, last_started, ctx.clock.now()) {
                continue;
            }
            match run_task(&state, *task, &ctx).await {
                Ok(_) | Err(SchedulerError::Failed(_)) => {}
                Err(SchedulerError::Busy(current)) => {
                    info!(task = task.name(), running = %current, "task busy, will retry next tick");
                }
            }
        }
    }
    info!("scheduler stopped");
}
