//! Scheduler — wakes tasks when their next check is due.
//!
//! One loop owns all spontaneous work: an interval ticker scans the open
//! tasks for due wake-ups, and a command channel injects manual "run now"
//! requests ahead of the timer. Everything funnels through the same
//! `spawn_step` path, which is what keeps the at-most-one-concurrent-
//! execution guarantee in a single place.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::engine::ExecutionEngine;
use super::model::PollFrequency;
use super::state::TaskStatus;
use crate::config::EngineConfig;
use crate::store::Database;

/// Commands accepted by the scheduler loop.
enum Command {
    /// Execute a task immediately, bypassing its timer.
    RunNow(Uuid),
    Shutdown,
}

/// Handle for talking to a running scheduler.
pub struct SchedulerHandle {
    tx: mpsc::Sender<Command>,
    handle: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Request immediate execution. A no-op if the task is already active.
    pub async fn run_now(&self, task_id: Uuid) {
        if self.tx.send(Command::RunNow(task_id)).await.is_err() {
            warn!(task_id = %task_id, "Scheduler is gone; run-now dropped");
        }
    }

    /// Stop the loop. In-flight steps finish on their own.
    pub async fn shutdown(self) {
        let _ = self.tx.send(Command::Shutdown).await;
        let _ = self.handle.await;
    }
}

/// Spawn the scheduler loop.
pub fn spawn(
    config: EngineConfig,
    store: Arc<dyn Database>,
    engine: Arc<ExecutionEngine>,
) -> SchedulerHandle {
    let (tx, rx) = mpsc::channel(64);
    let handle = tokio::spawn(run_loop(config, store, engine, rx));
    SchedulerHandle { tx, handle }
}

async fn run_loop(
    config: EngineConfig,
    store: Arc<dyn Database>,
    engine: Arc<ExecutionEngine>,
    mut rx: mpsc::Receiver<Command>,
) {
    let in_flight: Arc<Mutex<HashSet<Uuid>>> = Arc::new(Mutex::new(HashSet::new()));
    // on_login cadences fire at most once per process start.
    let mut fired_on_login: HashSet<Uuid> = HashSet::new();

    // Startup: re-park tasks interrupted mid-step, then fire on_login tasks.
    if let Err(e) = engine.recover_interrupted().await {
        error!("Startup recovery failed: {e}");
    }
    match store.list_open_tasks().await {
        Ok(tasks) => {
            for task in tasks {
                if matches!(task.effective_poll(), PollFrequency::OnLogin)
                    && matches!(task.status, TaskStatus::Pending | TaskStatus::Waiting)
                {
                    fired_on_login.insert(task.id);
                    spawn_step(&engine, &in_flight, config.max_concurrent_steps, task.id).await;
                }
            }
        }
        Err(e) => error!("Startup scan failed: {e}"),
    }

    let mut ticker = tokio::time::interval(config.tick_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // Skip immediate first tick
    ticker.tick().await;
    info!(tick = ?config.tick_interval, "Scheduler started");

    loop {
        tokio::select! {
            command = rx.recv() => {
                match command {
                    Some(Command::RunNow(task_id)) => {
                        debug!(task_id = %task_id, "Manual run-now");
                        spawn_step(&engine, &in_flight, config.max_concurrent_steps, task_id)
                            .await;
                    }
                    Some(Command::Shutdown) | None => {
                        info!("Scheduler stopping");
                        break;
                    }
                }
            }
            _ = ticker.tick() => {
                tick(&store, &engine, &in_flight, config.max_concurrent_steps, &mut fired_on_login)
                    .await;
            }
        }
    }
}

/// One scan over the open tasks: fire everything that is due.
async fn tick(
    store: &Arc<dyn Database>,
    engine: &Arc<ExecutionEngine>,
    in_flight: &Arc<Mutex<HashSet<Uuid>>>,
    max_concurrent: usize,
    fired_on_login: &mut HashSet<Uuid>,
) {
    let tasks = match store.list_open_tasks().await {
        Ok(tasks) => tasks,
        Err(e) => {
            error!("Scheduler scan failed: {e}");
            return;
        }
    };

    let now = Utc::now();
    for task in tasks {
        let due = match task.status {
            // Pending tasks run as soon as the scheduler sees them.
            TaskStatus::Pending => {
                // Unless event-gated and already fired this process.
                !matches!(task.effective_poll(), PollFrequency::OnLogin)
                    || !fired_on_login.contains(&task.id)
            }
            TaskStatus::Waiting => task.next_check.is_some_and(|t| t <= now),
            _ => false,
        };
        if !due {
            continue;
        }
        if matches!(task.effective_poll(), PollFrequency::OnLogin) {
            fired_on_login.insert(task.id);
        }
        spawn_step(engine, in_flight, max_concurrent, task.id).await;
    }
}

/// Fire one step for a task unless it is already in flight.
async fn spawn_step(
    engine: &Arc<ExecutionEngine>,
    in_flight: &Arc<Mutex<HashSet<Uuid>>>,
    max_concurrent: usize,
    task_id: Uuid,
) {
    {
        let mut running = in_flight.lock().await;
        if running.contains(&task_id) {
            debug!(task_id = %task_id, "Already executing; trigger ignored");
            return;
        }
        if running.len() >= max_concurrent {
            warn!(task_id = %task_id, "Max concurrent steps reached; deferring to next tick");
            return;
        }
        running.insert(task_id);
    }

    let engine = Arc::clone(engine);
    let in_flight = Arc::clone(in_flight);
    tokio::spawn(async move {
        if let Err(e) = engine.step(task_id).await {
            error!(task_id = %task_id, "Step failed: {e}");
        }
        in_flight.lock().await.remove(&task_id);
    });
}
