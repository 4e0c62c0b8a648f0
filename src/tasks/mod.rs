pub mod handlers;
mod worker;

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    engine::Services,
    state::{AppError, AppResult, Shutdown},
    store::tasks::{self, CancelOutcome, NewTask, TaskKind, WorkerPool},
    utils::HandleErr,
};

/// How long an idle worker sleeps before re-polling the queue; the wake
/// condvar usually gets there first.
const IDLE_POLL: Duration = Duration::from_millis(250);
/// Watchdog scan interval for task timeouts.
const WATCHDOG_TICK: Duration = Duration::from_millis(500);
/// How long a blocked enqueue waits between backpressure probes.
const BACKPRESSURE_POLL: Duration = Duration::from_millis(100);

pub(crate) struct RunningTask {
    kind: TaskKind,
    pool: WorkerPool,
    token: CancellationToken,
    started: Instant,
}

/// Dispatches the persistent queue across three typed worker pools. All
/// queue state lives in the metadata store; this object only tracks the
/// running set (for cancellation and timeouts) and the worker threads.
pub struct TaskEngine {
    services: Arc<Services>,
    caps: HashMap<TaskKind, usize>,
    running: Mutex<HashMap<i64, RunningTask>>,
    /// Workers block here when the queue has nothing for them.
    wake: (Mutex<bool>, Condvar),
    /// Producers block here when the queue is over its bounds.
    drained: (Mutex<()>, Condvar),
    shutdown: Shutdown,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    /// Tasks the watchdog timed out: their cancellation is recorded as a
    /// retryable failure, not a user cancel.
    timed_out: Mutex<HashSet<i64>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub pool: &'static str,
    pub workers: usize,
    pub active: usize,
    pub idle: usize,
    pub load_pct: f64,
}

impl TaskEngine {
    pub fn new(services: Arc<Services>, shutdown: Shutdown) -> Arc<Self> {
        let mut caps = HashMap::new();
        for (name, cap) in &services.config.tasks.per_type_caps {
            match TaskKind::from_name(name) {
                Some(kind) => {
                    caps.insert(kind, *cap);
                }
                None => warn!("ignoring per-type cap for unknown task kind '{name}'"),
            }
        }

        Arc::new(Self {
            services,
            caps,
            running: Mutex::new(HashMap::new()),
            wake: (Mutex::new(false), Condvar::new()),
            drained: (Mutex::new(()), Condvar::new()),
            shutdown,
            workers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            timed_out: Mutex::new(HashSet::new()),
        })
    }

    /// Requeues work a previous process left running, then brings the
    /// worker pools and the timeout watchdog up. Idempotent; only the
    /// first call spawns anything.
    pub fn start(self: &Arc<Self>) -> AppResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        {
            let mut conn = self.services.db.get()?;
            let recovered = tasks::recover_running(&mut conn)?;
            if recovered > 0 {
                info!("requeued {recovered} tasks from a previous run");
            }
        }

        let pools = [
            (WorkerPool::Embedding, self.services.config.pools.embedding.workers),
            (WorkerPool::Io, self.services.config.pools.io.workers),
            (WorkerPool::Task, self.services.config.pools.task.workers),
        ];

        let mut workers = self.workers.lock().expect("worker list lock poisoned");
        for (pool, count) in pools {
            for index in 0..count {
                let engine = self.clone();
                let handle = std::thread::Builder::new()
                    .name(format!("{}-{index}", pool.name()))
                    .spawn(move || worker::worker_loop(engine, pool))?;
                workers.push(handle);
            }
        }

        let engine = self.clone();
        workers.push(
            std::thread::Builder::new()
                .name("task-watchdog".to_owned())
                .spawn(move || engine.watchdog_loop())?,
        );

        info!(
            "task engine started ({} embedding / {} io / {} task workers)",
            self.services.config.pools.embedding.workers,
            self.services.config.pools.io.workers,
            self.services.config.pools.task.workers
        );
        Ok(())
    }

    /// Producer-facing enqueue with backpressure: blocks while the queued
    /// working set (or the embedding backlog) is over its bound, which is
    /// what throttles the scanner during large bursts.
    pub fn enqueue(&self, new: NewTask) -> AppResult<i64> {
        loop {
            if self.shutdown.is_shutdown() {
                return Err(AppError::Cancelled);
            }

            let (queued, queued_embed) = {
                let mut conn = self.services.db.get()?;
                (
                    tasks::queued_count(&mut conn)?,
                    tasks::queued_embed_count(&mut conn)?,
                )
            };
            let bounds = &self.services.config.tasks;
            let over_total = queued >= bounds.working_set as i64;
            let over_embed =
                new.kind.is_embedding() && queued_embed >= bounds.embed_queue as i64;
            if !over_total && !over_embed {
                break;
            }

            let guard = self.drained.0.lock().expect("drained lock poisoned");
            let _unused = self
                .drained
                .1
                .wait_timeout(guard, BACKPRESSURE_POLL)
                .expect("drained lock poisoned");
        }

        self.enqueue_unchecked(new)
    }

    /// Enqueue without the backpressure gate, for task handlers extending
    /// their own pipeline; a blocked worker cannot drain the queue.
    pub fn enqueue_unchecked(&self, new: NewTask) -> AppResult<i64> {
        let id = {
            let mut conn = self.services.db.get()?;
            tasks::enqueue(&mut conn, new)?
        };
        self.wake_workers();
        Ok(id)
    }

    pub fn cancel(&self, id: i64) -> AppResult<CancelOutcome> {
        let outcome = {
            let mut conn = self.services.db.get()?;
            tasks::cancel_task(&mut conn, id)?
        };
        if outcome == CancelOutcome::Signalled {
            self.cancel_running_token(id);
        }
        self.wake_workers();
        Ok(outcome)
    }

    /// Cancels every queued task of a kind immediately and signals the
    /// running ones; those observe the token at their next checkpoint.
    pub fn cancel_by_kind(&self, kind: TaskKind) -> AppResult<()> {
        let running = {
            let mut conn = self.services.db.get()?;
            tasks::cancel_tasks_by_kind(&mut conn, kind)?
        };
        for id in running {
            self.cancel_running_token(id);
        }
        self.wake_workers();
        Ok(())
    }

    fn cancel_running_token(&self, id: i64) {
        let running = self.running.lock().expect("running set lock poisoned");
        if let Some(task) = running.get(&id) {
            task.token.cancel();
        }
    }

    pub fn pool_status(&self) -> Vec<PoolStatus> {
        let running = self.running.lock().expect("running set lock poisoned");
        let pools = [
            (WorkerPool::Embedding, self.services.config.pools.embedding.workers),
            (WorkerPool::Io, self.services.config.pools.io.workers),
            (WorkerPool::Task, self.services.config.pools.task.workers),
        ];
        pools
            .into_iter()
            .map(|(pool, workers)| {
                let active = running.values().filter(|t| t.pool == pool).count();
                PoolStatus {
                    pool: pool.name(),
                    workers,
                    active,
                    idle: workers.saturating_sub(active),
                    load_pct: if workers > 0 {
                        (active as f64 / workers as f64) * 100.0
                    } else {
                        0.0
                    },
                }
            })
            .collect()
    }

    /// Blocks until every worker thread has exited; called after shutdown
    /// has been signalled.
    pub fn join(&self) {
        self.wake_all();
        let mut workers = self.workers.lock().expect("worker list lock poisoned");
        for handle in workers.drain(..) {
            handle
                .join()
                .log_warn_with_msg("worker thread panicked during shutdown");
        }
    }

    pub(crate) fn services(&self) -> &Arc<Services> {
        &self.services
    }

    pub(crate) fn caps(&self) -> &HashMap<TaskKind, usize> {
        &self.caps
    }

    pub(crate) fn shutdown_handle(&self) -> &Shutdown {
        &self.shutdown
    }

    pub(crate) fn register_running(&self, id: i64, kind: TaskKind, pool: WorkerPool) -> CancellationToken {
        let token = self.shutdown.child_token();
        self.running
            .lock()
            .expect("running set lock poisoned")
            .insert(
                id,
                RunningTask {
                    kind,
                    pool,
                    token: token.clone(),
                    started: Instant::now(),
                },
            );
        token
    }

    pub(crate) fn unregister_running(&self, id: i64) {
        self.running
            .lock()
            .expect("running set lock poisoned")
            .remove(&id);
        // Finishing a task can unblock dependents and enqueuers alike.
        self.wake_all();
    }

    pub(crate) fn wake_workers(&self) {
        let mut pending = self.wake.0.lock().expect("wake lock poisoned");
        *pending = true;
        self.wake.1.notify_all();
    }

    fn wake_all(&self) {
        self.wake_workers();
        self.drained.1.notify_all();
    }

    /// Parks an idle worker until new work arrives or the poll interval
    /// elapses.
    pub(crate) fn idle_wait(&self) {
        let mut pending = self.wake.0.lock().expect("wake lock poisoned");
        if !*pending {
            let (guard, _timeout) = self
                .wake
                .1
                .wait_timeout(pending, IDLE_POLL)
                .expect("wake lock poisoned");
            pending = guard;
        }
        *pending = false;
    }

    fn timeout_for(&self, pool: WorkerPool) -> Duration {
        let timeouts = &self.services.config.timeouts;
        Duration::from_secs(match pool {
            WorkerPool::Embedding => timeouts.embedding,
            WorkerPool::Io => timeouts.io,
            WorkerPool::Task => timeouts.task,
        })
    }

    /// Marks tasks over their pool timeout as cancelling and fires their
    /// tokens; the worker abandons the work at its next checkpoint and the
    /// task is failed as retryable.
    fn watchdog_loop(self: Arc<Self>) {
        while !self.shutdown.is_shutdown() {
            std::thread::sleep(WATCHDOG_TICK);

            let expired: Vec<(i64, TaskKind)> = {
                let running = self.running.lock().expect("running set lock poisoned");
                running
                    .iter()
                    .filter(|(_, task)| {
                        task.started.elapsed() > self.timeout_for(task.pool)
                            && !task.token.is_cancelled()
                    })
                    .map(|(id, task)| (*id, task.kind))
                    .collect()
            };

            for (id, kind) in expired {
                warn!("task {id} ({}) exceeded its timeout, cancelling", kind.name());
                if let Some(mut conn) = self.services.db.get().log_err() {
                    tasks::mark_cancelling(&mut conn, id)
                        .log_warn_with_msg("failed to mark timed-out task");
                }
                self.timed_out
                    .lock()
                    .expect("timeout set lock poisoned")
                    .insert(id);
                self.cancel_running_token(id);
            }
        }
    }

    /// Whether a cancellation the worker just observed was a timeout.
    pub(crate) fn take_timed_out(&self, id: i64) -> bool {
        self.timed_out
            .lock()
            .expect("timeout set lock poisoned")
            .remove(&id)
    }
}
