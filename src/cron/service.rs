//! Cron scheduler: timer loop, job execution, job table operations

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::schedule::{compute_next_run, now_ms, validate};
use super::types::{CronJob, CronJobCreate, CronJobState, CronSchedule, RunStatus};
use crate::events::{self, Publisher};
use crate::lanes::{CommandError, CommandLane, CommandQueue, EnqueueOptions};
use crate::serial::SerialLock;
use crate::{Error, Result};

/// Runs the body of a job
#[async_trait]
pub trait CronExecutor: Send + Sync {
    /// Execute one run of `job`. An `Err` is recorded as the run's error.
    async fn execute(&self, job: &CronJob) -> std::result::Result<(), String>;
}

type Jobs = HashMap<String, CronJob>;

struct Inner {
    jobs: Mutex<Jobs>,
    /// Orders every job-table mutation
    table: SerialLock,
    /// One chain per job so a job never overlaps itself
    job_locks: Mutex<HashMap<String, Arc<SerialLock>>>,
    queue: CommandQueue,
    executor: Arc<dyn CronExecutor>,
    publisher: Publisher,
    wake: Notify,
    shutdown: Mutex<Option<CancellationToken>>,
    tracker: TaskTracker,
}

/// In-memory cron scheduler
///
/// Runs are admitted through the `cron` lane, so the lane's ceiling bounds
/// how many jobs execute at once.
#[derive(Clone)]
pub struct CronService {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CronService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CronService")
            .field("jobs", &self.inner.lock_jobs().len())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl CronService {
    #[must_use]
    pub fn new(queue: CommandQueue, executor: Arc<dyn CronExecutor>, publisher: Publisher) -> Self {
        Self {
            inner: Arc::new(Inner {
                jobs: Mutex::default(),
                table: SerialLock::new(),
                job_locks: Mutex::default(),
                queue,
                executor,
                publisher,
                wake: Notify::new(),
                shutdown: Mutex::default(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// Add a job
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cron`] if the schedule is invalid
    pub async fn add(&self, create: CronJobCreate) -> Result<CronJob> {
        validate(&create.schedule)?;

        let now = now_ms();
        let mut job = CronJob {
            id: uuid::Uuid::new_v4().to_string(),
            name: create.name,
            enabled: create.enabled,
            schedule: create.schedule,
            payload: create.payload,
            state: CronJobState::default(),
            created_at_ms: now,
        };
        job.state.next_run_at_ms = initial_next_run(&job.schedule, now)?;

        let stored = job.clone();
        self.inner
            .with_table(move |jobs| {
                jobs.insert(stored.id.clone(), stored);
            })
            .await;
        self.inner.wake.notify_one();

        tracing::info!(job_id = %job.id, name = %job.name, next_run_at_ms = ?job.state.next_run_at_ms, "cron job added");
        Ok(job)
    }

    /// Remove a job
    ///
    /// A run already in progress finishes but is not recorded.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if no job has this id
    pub async fn remove(&self, id: &str) -> Result<()> {
        let removed = self.inner.with_table(|jobs| jobs.remove(id)).await;
        if removed.is_none() {
            return Err(Error::NotFound(format!("cron job {id}")));
        }
        lock(&self.inner.job_locks).remove(id);
        self.inner.wake.notify_one();
        tracing::info!(job_id = %id, "cron job removed");
        Ok(())
    }

    /// Enable or disable a job
    ///
    /// Re-enabling recomputes the next run from now.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if no job has this id
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<CronJob> {
        let now = now_ms();
        let updated = self
            .inner
            .with_table(|jobs| {
                let job = jobs
                    .get_mut(id)
                    .ok_or_else(|| Error::NotFound(format!("cron job {id}")))?;
                if enabled && !job.enabled {
                    job.state.next_run_at_ms = initial_next_run(&job.schedule, now)?;
                }
                job.enabled = enabled;
                Ok::<_, Error>(job.clone())
            })
            .await?;
        self.inner.wake.notify_one();
        Ok(updated)
    }

    /// All jobs, oldest first
    #[must_use]
    pub fn list(&self) -> Vec<CronJob> {
        let mut jobs: Vec<_> = self.inner.lock_jobs().values().cloned().collect();
        jobs.sort_by(|a, b| {
            a.created_at_ms
                .cmp(&b.created_at_ms)
                .then_with(|| a.name.cmp(&b.name))
        });
        jobs
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<CronJob> {
        self.inner.lock_jobs().get(id).cloned()
    }

    /// Run a job now, whether or not it is enabled or due
    ///
    /// Waits behind any run of the same job already in progress, then for a
    /// `cron` lane slot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown job, or [`Error::Cron`] if
    /// the run was cancelled by shutdown or aborted
    pub async fn run_now(&self, id: &str) -> Result<RunStatus> {
        if !self.inner.lock_jobs().contains_key(id) {
            return Err(Error::NotFound(format!("cron job {id}")));
        }
        let cancel = lock(&self.inner.shutdown).clone();
        Arc::clone(&self.inner).execute(id.to_string(), cancel).await
    }

    /// Start the timer loop. No-op if already started.
    pub async fn start(&self) {
        let token = {
            let mut shutdown = lock(&self.inner.shutdown);
            if shutdown.is_some() {
                return;
            }
            let token = CancellationToken::new();
            *shutdown = Some(token.clone());
            token
        };

        let now = now_ms();
        let count = self
            .inner
            .with_table(|jobs| {
                for job in jobs.values_mut().filter(|j| j.enabled) {
                    if job.state.next_run_at_ms.is_none() {
                        job.state.next_run_at_ms = compute_next_run(&job.schedule, now)
                            .unwrap_or_else(|e| {
                                tracing::warn!(job_id = %job.id, error = %e, "cannot schedule cron job");
                                None
                            });
                    }
                }
                jobs.len()
            })
            .await;

        self.inner.tracker.reopen();
        let inner = Arc::clone(&self.inner);
        self.inner.tracker.spawn(inner.timer_loop(token));
        tracing::info!(jobs = count, "cron service started");
    }

    /// Stop the timer loop and wait for runs in progress
    ///
    /// Runs still waiting for a lane slot are cancelled.
    pub async fn stop(&self) {
        let Some(token) = lock(&self.inner.shutdown).take() else {
            return;
        };
        token.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        tracing::info!("cron service stopped");
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        lock(&self.inner.shutdown).is_some()
    }
}

/// First run for a new or re-enabled job
///
/// A one-shot job whose time has already passed fires on the next tick.
fn initial_next_run(schedule: &CronSchedule, now: u64) -> Result<Option<u64>> {
    match schedule {
        CronSchedule::At { at_ms } => Ok(Some(*at_ms)),
        _ => compute_next_run(schedule, now),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Jobs claimed by one tick
#[derive(Default)]
struct Due {
    run: Vec<String>,
    skipped: Vec<String>,
}

impl Inner {
    fn lock_jobs(&self) -> MutexGuard<'_, Jobs> {
        lock(&self.jobs)
    }

    /// Apply `f` to the job table, after every mutation submitted before it
    async fn with_table<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&mut Jobs) -> T + Send,
        T: Send,
    {
        self.table
            .run_exclusive(|| std::future::ready(f(&mut self.lock_jobs())))
            .await
    }

    fn job_lock(&self, id: &str) -> Arc<SerialLock> {
        lock(&self.job_locks).entry(id.to_string()).or_default().clone()
    }

    fn next_wake(&self) -> Option<Duration> {
        let now = now_ms();
        self.lock_jobs()
            .values()
            .filter(|j| j.enabled)
            .filter_map(|j| j.state.next_run_at_ms)
            .min()
            .map(|at| Duration::from_millis(at.saturating_sub(now)))
    }

    async fn timer_loop(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            let sleep = self.next_wake();
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = self.wake.notified() => {
                    tracing::trace!("cron timer woken");
                    continue;
                }
                () = sleep_or_park(sleep) => {}
            }
            self.process_due(&shutdown).await;
        }
        tracing::debug!("cron timer loop exited");
    }

    async fn process_due(self: &Arc<Self>, shutdown: &CancellationToken) {
        let now = now_ms();
        let due = self.with_table(|jobs| claim_due(jobs, now)).await;

        for id in due.skipped {
            tracing::info!(job_id = %id, "cron job still running, tick skipped");
            self.publisher
                .publish(events::cron_run_finished(&id, RunStatus::Skipped.as_str(), 0, None));
        }

        for id in due.run {
            let inner = Arc::clone(self);
            let cancel = Some(shutdown.clone());
            self.tracker.spawn(async move {
                if let Err(e) = inner.execute(id.clone(), cancel).await {
                    tracing::warn!(job_id = %id, error = %e, "scheduled cron run did not complete");
                }
            });
        }
    }

    /// Run a job behind its own chain and through the `cron` lane
    async fn execute(self: Arc<Self>, id: String, cancel: Option<CancellationToken>) -> Result<RunStatus> {
        let chain = self.job_lock(&id);
        let inner = Arc::clone(&self);
        let job_id = id.clone();

        let outcome = chain
            .run_exclusive(move || {
                let mut options = EnqueueOptions::default();
                if let Some(token) = cancel {
                    options = options.with_cancel(token);
                }
                let queue = inner.queue.clone();
                queue.enqueue_with(CommandLane::Cron.as_str(), options, move |_token| {
                    inner.run_job(job_id)
                })
            })
            .await;

        match outcome {
            Ok(status) => Ok(status),
            Err(err) => {
                self.with_table(|jobs| {
                    if let Some(job) = jobs.get_mut(&id) {
                        job.state.running_at_ms = None;
                    }
                })
                .await;
                Err(match err {
                    CommandError::Failed(e) => e,
                    CommandError::Cancelled => Error::Cron(format!("run of job {id} cancelled")),
                    CommandError::Aborted(reason) => {
                        Error::Cron(format!("run of job {id} aborted: {reason}"))
                    }
                })
            }
        }
    }

    async fn run_job(self: Arc<Self>, id: String) -> Result<RunStatus> {
        let started_ms = now_ms();
        let job = self
            .with_table(|jobs| {
                let job = jobs
                    .get_mut(&id)
                    .ok_or_else(|| Error::NotFound(format!("cron job {id}")))?;
                job.state.running_at_ms = Some(started_ms);
                Ok::<_, Error>(job.clone())
            })
            .await?;

        tracing::info!(job_id = %id, name = %job.name, "cron job started");
        self.publisher.publish(events::cron_run_started(&id, &job.name));

        let started = Instant::now();
        let result = self.executor.execute(&job).await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let (status, error) = match result {
            Ok(()) => (RunStatus::Ok, None),
            Err(e) => (RunStatus::Error, Some(e)),
        };

        let recorded_error = error.clone();
        self.with_table(move |jobs| {
            if let Some(job) = jobs.get_mut(&id) {
                job.state.running_at_ms = None;
                job.state.last_run_at_ms = Some(started_ms);
                job.state.last_status = Some(status);
                job.state.last_error = recorded_error;
                job.state.last_duration_ms = Some(duration_ms);
            }
        })
        .await;

        match &error {
            None => tracing::info!(job_id = %job.id, duration_ms, "cron job finished"),
            Some(e) => tracing::warn!(job_id = %job.id, duration_ms, error = %e, "cron job failed"),
        }
        self.publisher.publish(events::cron_run_finished(
            &job.id,
            status.as_str(),
            duration_ms,
            error.as_deref(),
        ));
        Ok(status)
    }
}

/// Advance every due job and mark the ones that will run
///
/// Marking happens under the table lock, before anything is spawned, so the
/// next tick sees the job as running.
fn claim_due(jobs: &mut Jobs, now: u64) -> Due {
    let mut due = Due::default();
    for job in jobs.values_mut() {
        if !job.enabled || !job.state.next_run_at_ms.is_some_and(|at| at <= now) {
            continue;
        }

        job.state.next_run_at_ms = compute_next_run(&job.schedule, now).unwrap_or_else(|e| {
            tracing::warn!(job_id = %job.id, error = %e, "cannot reschedule cron job");
            None
        });
        if matches!(job.schedule, CronSchedule::At { .. }) {
            job.enabled = false;
        }

        if job.state.running_at_ms.is_some() {
            job.state.last_status = Some(RunStatus::Skipped);
            due.skipped.push(job.id.clone());
        } else {
            job.state.running_at_ms = Some(now);
            due.run.push(job.id.clone());
        }
    }
    due
}

async fn sleep_or_park(duration: Option<Duration>) {
    match duration {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}
