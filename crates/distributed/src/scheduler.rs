//! Stage scheduler: fans writer tasks out over a worker pool and drives them to an
//! all-or-nothing outcome.
//!
//! Responsibilities:
//! - dispatch one task per upstream partition, bounded by worker slots;
//! - retry transient task failures with exponential backoff, preferring another worker;
//! - blacklist workers that keep failing while healthy workers remain;
//! - cancel all running tasks on the first terminal failure.
//!
//! Retry semantics:
//! - only [`CtasError::is_retryable`] errors are retried, up to `max_task_attempts`;
//! - every attempt carries its number so the writer can clean the previous attempt's files.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use ctas_common::metrics::global_metrics;
use ctas_common::{CtasError, EngineConfig, QueryId, Result, StageId, TaskId};
use ctas_partition::TaskWriteOutput;
use tokio::sync::Semaphore;
use tokio::task::{Id, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::stage::{StageExecution, StageState};
use crate::task::{TaskAssignment, TaskExecutor};

#[derive(Debug, Clone)]
/// Scheduler retry and placement controls.
pub struct SchedulerConfig {
    /// Max attempts before a task is considered terminally failed.
    pub max_task_attempts: u32,
    /// Base retry backoff in milliseconds.
    pub retry_backoff_base_ms: u64,
    /// Consecutive task failures before a worker is blacklisted.
    pub blacklist_failure_threshold: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for SchedulerConfig {
    fn from(cfg: &EngineConfig) -> Self {
        Self {
            max_task_attempts: cfg.max_task_attempts.max(1),
            retry_backoff_base_ms: cfg.retry_backoff_base_ms,
            blacklist_failure_threshold: cfg.blacklist_failure_threshold.max(1),
        }
    }
}

impl SchedulerConfig {
    /// Backoff before dispatching `next_attempt`: `base * 2^(next_attempt - 2)`.
    pub fn backoff_for(&self, next_attempt: u32) -> Duration {
        let failed_attempt = next_attempt.saturating_sub(1);
        let ms = self
            .retry_backoff_base_ms
            .saturating_mul(1_u64 << failed_attempt.saturating_sub(1).min(10));
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSlots {
    pub worker_id: String,
    pub slots: usize,
}

/// Named workers and how many tasks each may run at once.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    workers: Vec<WorkerSlots>,
}

impl WorkerPool {
    pub fn new(workers: Vec<WorkerSlots>) -> Result<Self> {
        if workers.is_empty() {
            return Err(CtasError::InvalidConfig(
                "worker pool must contain at least one worker".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for w in &workers {
            if !seen.insert(w.worker_id.as_str()) {
                return Err(CtasError::InvalidConfig(format!(
                    "duplicate worker id '{}'",
                    w.worker_id
                )));
            }
        }
        Ok(Self { workers })
    }

    /// `count` in-process workers named `worker-1..` with `slots_each` slots.
    pub fn local(count: usize, slots_each: usize) -> Self {
        Self {
            workers: (1..=count.max(1))
                .map(|i| WorkerSlots {
                    worker_id: format!("worker-{i}"),
                    slots: slots_each.max(1),
                })
                .collect(),
        }
    }

    pub fn workers(&self) -> &[WorkerSlots] {
        &self.workers
    }

    pub fn total_slots(&self) -> usize {
        self.workers.iter().map(|w| w.slots.max(1)).sum()
    }
}

/// Successful stage result; `outputs` are ordered by task id.
#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub execution: StageExecution,
    pub outputs: Vec<TaskWriteOutput>,
}

#[derive(Debug)]
struct WorkerRun {
    worker_id: String,
    slots: Arc<Semaphore>,
    capacity: usize,
    assigned: usize,
    consecutive_failures: u32,
    blacklisted: bool,
}

type AttemptResult = (TaskAssignment, Result<TaskWriteOutput>);

#[derive(Debug, Clone)]
pub struct StageScheduler {
    config: SchedulerConfig,
    pool: WorkerPool,
}

impl StageScheduler {
    pub fn new(config: SchedulerConfig, pool: WorkerPool) -> Self {
        Self { config, pool }
    }

    /// Run `task_count` tasks through `executor` until all succeed or one fails terminally.
    ///
    /// Cancelling `cancel` from outside stops the stage with [`CtasError::Cancelled`].
    pub async fn run(
        &self,
        query_id: QueryId,
        stage_id: StageId,
        task_count: usize,
        executor: Arc<dyn TaskExecutor>,
        cancel: CancellationToken,
    ) -> Result<StageOutcome> {
        let mut execution = StageExecution::new(query_id, stage_id, task_count);
        execution.start()?;
        let mut workers: Vec<WorkerRun> = self
            .pool
            .workers()
            .iter()
            .map(|w| WorkerRun {
                worker_id: w.worker_id.clone(),
                slots: Arc::new(Semaphore::new(w.slots.max(1))),
                capacity: w.slots.max(1),
                assigned: 0,
                consecutive_failures: 0,
                blacklisted: false,
            })
            .collect();
        let stage_cancel = cancel.child_token();
        let qid = query_id.to_string();
        let metrics = global_metrics();
        info!(
            query_id = %query_id,
            stage_id = %stage_id,
            tasks = task_count,
            workers = workers.len(),
            slots = self.pool.total_slots(),
            operator = "StageScheduler",
            "write stage started"
        );

        let mut running: JoinSet<AttemptResult> = JoinSet::new();
        // Lets a panicked attempt be traced back to its task and worker.
        let mut in_flight: HashMap<Id, TaskAssignment> = HashMap::new();
        for t in 0..task_count as u64 {
            let idx = pick_worker(&workers, None);
            let assignment = TaskAssignment {
                query_id,
                stage_id,
                task_id: TaskId(t),
                attempt: 1,
                worker_id: workers[idx].worker_id.clone(),
            };
            execution.mark_running(assignment.task_id, 1, &assignment.worker_id)?;
            workers[idx].assigned += 1;
            let id = spawn_attempt(
                &mut running,
                Arc::clone(&executor),
                assignment.clone(),
                Arc::clone(&workers[idx].slots),
                Duration::ZERO,
                stage_cancel.clone(),
            );
            in_flight.insert(id, assignment);
        }
        metrics.set_scheduler_running_tasks(&qid, stage_id.0, running.len() as u64);

        let mut outputs: BTreeMap<TaskId, TaskWriteOutput> = BTreeMap::new();
        let mut first_error: Option<CtasError> = None;
        while let Some(joined) = running.join_next_with_id().await {
            let (assignment, result) = match joined {
                Ok((id, r)) => {
                    in_flight.remove(&id);
                    r
                }
                Err(e) => {
                    let Some(assignment) = in_flight.remove(&e.id()) else {
                        let err = CtasError::Execution(format!(
                            "join error for untracked writer task: {e}"
                        ));
                        if first_error.is_none() {
                            first_error = Some(err);
                        }
                        stage_cancel.cancel();
                        continue;
                    };
                    let err = CtasError::Execution(format!(
                        "task {} attempt {} on {} did not complete: {e}",
                        assignment.task_id, assignment.attempt, assignment.worker_id
                    ));
                    error!(
                        query_id = %query_id,
                        stage_id = %stage_id,
                        task_id = %assignment.task_id,
                        worker_id = %assignment.worker_id,
                        error = %err,
                        operator = "StageScheduler",
                        "writer task panicked"
                    );
                    (assignment, Err(err))
                }
            };
            let widx = workers
                .iter()
                .position(|w| w.worker_id == assignment.worker_id)
                .unwrap_or(0);
            workers[widx].assigned = workers[widx].assigned.saturating_sub(1);

            match result {
                Ok(output) => {
                    workers[widx].consecutive_failures = 0;
                    execution.mark_succeeded(assignment.task_id)?;
                    debug!(
                        query_id = %query_id,
                        stage_id = %stage_id,
                        task_id = %assignment.task_id,
                        attempt = assignment.attempt,
                        worker_id = %assignment.worker_id,
                        rows = output.stats.rows_written,
                        operator = "StageScheduler",
                        "task succeeded"
                    );
                    outputs.insert(assignment.task_id, output);
                }
                Err(e) => {
                    metrics.inc_scheduler_task_failures(&qid, stage_id.0, e.kind());
                    let cancelled_by_stage =
                        matches!(e, CtasError::Cancelled(_)) && stage_cancel.is_cancelled();
                    if !cancelled_by_stage {
                        record_worker_failure(&mut workers, widx, &self.config);
                    }
                    let retry = e.is_retryable()
                        && assignment.attempt < self.config.max_task_attempts
                        && !stage_cancel.is_cancelled();
                    if retry {
                        let next_attempt = assignment.attempt + 1;
                        let backoff = self.config.backoff_for(next_attempt);
                        let next_idx = pick_worker(&workers, Some(assignment.worker_id.as_str()));
                        warn!(
                            query_id = %query_id,
                            stage_id = %stage_id,
                            task_id = %assignment.task_id,
                            attempt = assignment.attempt,
                            next_attempt,
                            backoff_ms = backoff.as_millis() as u64,
                            from_worker = %assignment.worker_id,
                            to_worker = %workers[next_idx].worker_id,
                            error = %e,
                            operator = "StageScheduler",
                            "retrying failed task"
                        );
                        execution.mark_retrying(assignment.task_id, next_attempt, &e.to_string())?;
                        metrics.inc_scheduler_retries(&qid, stage_id.0);
                        let next = TaskAssignment {
                            attempt: next_attempt,
                            worker_id: workers[next_idx].worker_id.clone(),
                            ..assignment
                        };
                        execution.mark_running(next.task_id, next_attempt, &next.worker_id)?;
                        workers[next_idx].assigned += 1;
                        let id = spawn_attempt(
                            &mut running,
                            Arc::clone(&executor),
                            next.clone(),
                            Arc::clone(&workers[next_idx].slots),
                            backoff,
                            stage_cancel.clone(),
                        );
                        in_flight.insert(id, next);
                    } else {
                        execution.mark_failed(assignment.task_id, &e.to_string())?;
                        if cancelled_by_stage {
                            debug!(
                                query_id = %query_id,
                                stage_id = %stage_id,
                                task_id = %assignment.task_id,
                                operator = "StageScheduler",
                                "task stopped after stage cancellation"
                            );
                        } else {
                            error!(
                                query_id = %query_id,
                                stage_id = %stage_id,
                                task_id = %assignment.task_id,
                                attempt = assignment.attempt,
                                worker_id = %assignment.worker_id,
                                error_kind = e.kind(),
                                stage_fatal = e.is_stage_fatal(),
                                error = %e,
                                operator = "StageScheduler",
                                "task failed terminally, cancelling stage"
                            );
                            if first_error.is_none() {
                                first_error = Some(e);
                            }
                        }
                        stage_cancel.cancel();
                    }
                }
            }
            metrics.set_scheduler_running_tasks(&qid, stage_id.0, running.len() as u64);
        }

        let error = match first_error {
            Some(e) => Some(e),
            None if stage_cancel.is_cancelled() => Some(CtasError::Cancelled(format!(
                "stage {stage_id} of query {query_id} cancelled"
            ))),
            None => None,
        };
        if let Some(e) = error {
            execution.fail(&e.to_string());
            warn!(
                query_id = %query_id,
                stage_id = %stage_id,
                succeeded = outputs.len(),
                tasks = task_count,
                error = %e,
                operator = "StageScheduler",
                "write stage failed"
            );
            return Err(e);
        }

        if execution.finish() != StageState::Succeeded {
            return Err(CtasError::Execution(format!(
                "stage {stage_id} finished without all tasks succeeding"
            )));
        }
        info!(
            query_id = %query_id,
            stage_id = %stage_id,
            tasks = task_count,
            operator = "StageScheduler",
            "write stage succeeded"
        );
        Ok(StageOutcome {
            execution,
            outputs: outputs.into_values().collect(),
        })
    }
}

fn spawn_attempt(
    set: &mut JoinSet<AttemptResult>,
    executor: Arc<dyn TaskExecutor>,
    assignment: TaskAssignment,
    slots: Arc<Semaphore>,
    backoff: Duration,
    cancel: CancellationToken,
) -> Id {
    set.spawn(async move {
        let stopped = |a: &TaskAssignment| {
            CtasError::Cancelled(format!(
                "task {} attempt {} cancelled before start",
                a.task_id, a.attempt
            ))
        };
        if !backoff.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let err = stopped(&assignment);
                    return (assignment, Err(err));
                }
                _ = tokio::time::sleep(backoff) => {}
            }
        }
        let permit = tokio::select! {
            _ = cancel.cancelled() => {
                let err = stopped(&assignment);
                return (assignment, Err(err));
            }
            permit = slots.acquire_owned() => permit,
        };
        let _permit = match permit {
            Ok(p) => p,
            Err(e) => {
                let err = CtasError::Execution(format!("failed to acquire worker slot: {e}"));
                return (assignment, Err(err));
            }
        };
        let result = executor.execute(&assignment, &cancel).await;
        (assignment, result)
    })
    .id()
}

/// Least-loaded healthy worker, avoiding `avoid` when another healthy worker exists.
fn pick_worker(workers: &[WorkerRun], avoid: Option<&str>) -> usize {
    let healthy: Vec<usize> = (0..workers.len())
        .filter(|&i| !workers[i].blacklisted)
        .collect();
    let pool = if healthy.is_empty() {
        (0..workers.len()).collect()
    } else {
        healthy
    };
    let preferred: Vec<usize> = pool
        .iter()
        .copied()
        .filter(|&i| Some(workers[i].worker_id.as_str()) != avoid)
        .collect();
    let candidates = if preferred.is_empty() { pool } else { preferred };
    candidates
        .into_iter()
        .min_by(|&a, &b| {
            // compare assigned/capacity without floats
            let la = workers[a].assigned * workers[b].capacity;
            let lb = workers[b].assigned * workers[a].capacity;
            la.cmp(&lb).then(a.cmp(&b))
        })
        .unwrap_or(0)
}

fn record_worker_failure(workers: &mut [WorkerRun], idx: usize, config: &SchedulerConfig) {
    let healthy_others = workers
        .iter()
        .enumerate()
        .filter(|(i, w)| *i != idx && !w.blacklisted)
        .count();
    let w = &mut workers[idx];
    w.consecutive_failures += 1;
    if !w.blacklisted
        && w.consecutive_failures >= config.blacklist_failure_threshold
        && healthy_others > 0
    {
        warn!(
            worker_id = %w.worker_id,
            failures = w.consecutive_failures,
            threshold = config.blacklist_failure_threshold,
            operator = "StageScheduler",
            "worker blacklisted due to repeated failures"
        );
        w.blacklisted = true;
    }
}
