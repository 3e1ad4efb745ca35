//! Run admission, capacity and queueing.
//!
//! The scheduler is responsible for:
//! - admitting runs up to the concurrency cap,
//! - queueing the overflow in FIFO order with 1-based positions,
//! - promoting the queue head when a slot frees,
//! - cancelling active children (graceful, then forced) and queued entries,
//! - recording every status transition in the run store.
//!
//! All admission state mutates inside one mutex-guarded critical section;
//! sessions run as spawned tasks and report back through `complete`.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{ClassifierSettings, SchedulerSettings, SessionSettings};
use crate::events::BridgeEvent;
use crate::hub::BroadcastHub;
use crate::registry::{self, PidRegistry};
use crate::session::{ProcessSession, SessionOutcome};
use crate::store::{RecordStore, RunStatus};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("run {0} is not active or queued")]
    UnknownRun(String),
    #[error("run {0} is already being cancelled")]
    AlreadyCancelled(String),
}

/// What `admit` did with the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Started,
    Queued {
        position: usize,
        estimated_wait_minutes: u64,
    },
    AlreadyRunning,
    AlreadyQueued {
        position: usize,
    },
}

/// What a successful `cancel` acted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Active,
    Queued,
}

/// Where a run currently sits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueuePlacement {
    Active,
    Queued {
        position: usize,
        estimated_wait_minutes: u64,
    },
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerStatus {
    pub active_runs: usize,
    pub max_concurrent: usize,
    pub queued_runs: usize,
}

/// Everything a session needs to start.
pub struct RunLaunch {
    pub run_id: String,
    pub job: Value,
    pub cancelled: Arc<AtomicBool>,
}

pub trait SessionLauncher: Send + Sync + 'static {
    fn launch(&self, launch: RunLaunch) -> BoxFuture<'static, SessionOutcome>;
}

/// Launches real child process sessions.
pub struct BridgeLauncher {
    pub session: SessionSettings,
    pub classifier: ClassifierSettings,
    pub hub: Arc<BroadcastHub>,
    pub registry: Arc<PidRegistry>,
    pub log_dir: PathBuf,
}

impl SessionLauncher for BridgeLauncher {
    fn launch(&self, launch: RunLaunch) -> BoxFuture<'static, SessionOutcome> {
        let session = ProcessSession {
            run_id: launch.run_id,
            job: launch.job,
            settings: self.session.clone(),
            classifier: self.classifier.clone(),
            hub: self.hub.clone(),
            registry: self.registry.clone(),
            log_dir: self.log_dir.clone(),
            cancelled: launch.cancelled,
        };
        Box::pin(session.run())
    }
}

struct ActiveRun {
    cancelled: Arc<AtomicBool>,
}

struct QueuedRun {
    run_id: String,
    job: Value,
}

struct SchedState {
    active: HashMap<String, ActiveRun>,
    queue: VecDeque<QueuedRun>,
}

pub struct RunScheduler<L: SessionLauncher = BridgeLauncher> {
    settings: SchedulerSettings,
    launcher: L,
    hub: Arc<BroadcastHub>,
    registry: Arc<PidRegistry>,
    store: Arc<dyn RecordStore>,
    state: Mutex<SchedState>,
    me: Weak<Self>,
}

impl<L: SessionLauncher> RunScheduler<L> {
    pub fn new(
        settings: SchedulerSettings,
        launcher: L,
        hub: Arc<BroadcastHub>,
        registry: Arc<PidRegistry>,
        store: Arc<dyn RecordStore>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            settings,
            launcher,
            hub,
            registry,
            store,
            state: Mutex::new(SchedState {
                active: HashMap::new(),
                queue: VecDeque::new(),
            }),
            me: me.clone(),
        })
    }

    /// Admit a run: start it if a slot is free, otherwise queue it.
    /// Re-admitting an active or queued id reports the existing placement
    /// without double-admitting.
    pub fn admit(&self, run_id: &str, job: Value) -> Admission {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.active.contains_key(run_id) {
            return Admission::AlreadyRunning;
        }
        if let Some(pos) = state.queue.iter().position(|q| q.run_id == run_id) {
            return Admission::AlreadyQueued { position: pos + 1 };
        }

        if state.active.len() < self.settings.max_concurrent {
            self.record(run_id, &job, RunStatus::Running);
            self.start_locked(&mut state, run_id.to_string(), job);
            info!(run_id, "run started");
            Admission::Started
        } else {
            self.record(run_id, &job, RunStatus::Queued);
            state.queue.push_back(QueuedRun {
                run_id: run_id.to_string(),
                job,
            });
            let position = state.queue.len();
            let estimated_wait_minutes = self.wait_estimate(position);
            info!(run_id, position, "run queued");
            self.hub.publish(
                run_id,
                BridgeEvent::Queued {
                    position,
                    estimated_wait_minutes,
                    message: format!("All slots busy, queued at position {position}"),
                },
            );
            Admission::Queued {
                position,
                estimated_wait_minutes,
            }
        }
    }

    /// Called by the session task when a run reaches a terminal state.
    /// Frees the slot and promotes the queue head.
    pub fn complete(&self, run_id: &str, outcome: SessionOutcome) {
        let status = match outcome {
            SessionOutcome::Completed => RunStatus::Completed,
            SessionOutcome::Failed => RunStatus::Failed,
            SessionOutcome::Cancelled => RunStatus::Cancelled,
        };
        self.update_record(run_id, status);
        info!(run_id, ?outcome, "run finished");

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.active.remove(run_id);
        if state.active.len() < self.settings.max_concurrent {
            if let Some(next) = state.queue.pop_front() {
                self.hub.publish(
                    &next.run_id,
                    BridgeEvent::QueueUpdate {
                        position: 0,
                        message: "Your run is starting now".to_string(),
                    },
                );
                self.publish_positions(&state, 0);
                self.update_record(&next.run_id, RunStatus::Running);
                info!(run_id = %next.run_id, "run promoted from queue");
                self.start_locked(&mut state, next.run_id, next.job);
            }
        }
    }

    /// Cancel an active or queued run. Active children get SIGTERM, then
    /// SIGKILL after the grace period. A second cancel is an error.
    pub fn cancel(&self, run_id: &str) -> Result<CancelOutcome, SchedulerError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(active) = state.active.get(run_id) {
            if active.cancelled.swap(true, Ordering::SeqCst) {
                return Err(SchedulerError::AlreadyCancelled(run_id.to_string()));
            }
            drop(state);
            if let Some(pid) = self.registry.pid_of(run_id) {
                registry::terminate(pid);
                let grace = Duration::from_secs(self.settings.cancel_grace_secs);
                tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    if registry::process_alive(pid) {
                        registry::kill(pid);
                    }
                });
            }
            self.update_record(run_id, RunStatus::Cancelled);
            self.hub.publish(
                run_id,
                BridgeEvent::Cancelled {
                    message: "Run cancelled".to_string(),
                },
            );
            info!(run_id, "active run cancelled");
            return Ok(CancelOutcome::Active);
        }

        if let Some(pos) = state.queue.iter().position(|q| q.run_id == run_id) {
            state.queue.remove(pos);
            self.publish_positions(&state, pos);
            drop(state);
            self.update_record(run_id, RunStatus::Cancelled);
            self.hub.publish(
                run_id,
                BridgeEvent::Cancelled {
                    message: "Run removed from queue".to_string(),
                },
            );
            info!(run_id, "queued run cancelled");
            return Ok(CancelOutcome::Queued);
        }

        Err(SchedulerError::UnknownRun(run_id.to_string()))
    }

    pub fn status(&self) -> SchedulerStatus {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        SchedulerStatus {
            active_runs: state.active.len(),
            max_concurrent: self.settings.max_concurrent,
            queued_runs: state.queue.len(),
        }
    }

    pub fn placement(&self, run_id: &str) -> QueuePlacement {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.active.contains_key(run_id) {
            return QueuePlacement::Active;
        }
        match state.queue.iter().position(|q| q.run_id == run_id) {
            Some(pos) => QueuePlacement::Queued {
                position: pos + 1,
                estimated_wait_minutes: self.wait_estimate(pos + 1),
            },
            None => QueuePlacement::Unknown,
        }
    }

    /// Terminate every active child: SIGTERM first, SIGKILL for survivors.
    pub async fn shutdown(&self) {
        let pids: Vec<(String, u32)> = self.registry.snapshot().into_iter().collect();
        if pids.is_empty() {
            return;
        }
        for (run_id, pid) in &pids {
            info!(run_id, pid, "terminating child on shutdown");
            registry::terminate(*pid);
        }
        tokio::time::sleep(Duration::from_secs(self.settings.cancel_grace_secs)).await;
        for (_, pid) in &pids {
            if registry::process_alive(*pid) {
                registry::kill(*pid);
            }
        }
    }

    fn start_locked(&self, state: &mut SchedState, run_id: String, job: Value) {
        let cancelled = Arc::new(AtomicBool::new(false));
        state.active.insert(
            run_id.clone(),
            ActiveRun {
                cancelled: cancelled.clone(),
            },
        );
        let fut = self.launcher.launch(RunLaunch {
            run_id: run_id.clone(),
            job,
            cancelled,
        });
        let me = self.me.clone();
        tokio::spawn(async move {
            let outcome = fut.await;
            if let Some(scheduler) = me.upgrade() {
                scheduler.complete(&run_id, outcome);
            }
        });
    }

    /// Tell every entry from `from` onward its new 1-based position.
    fn publish_positions(&self, state: &SchedState, from: usize) {
        for (idx, entry) in state.queue.iter().enumerate().skip(from) {
            let position = idx + 1;
            self.hub.publish(
                &entry.run_id,
                BridgeEvent::QueueUpdate {
                    position,
                    message: format!("Queue position updated: {position}"),
                },
            );
        }
    }

    fn wait_estimate(&self, position: usize) -> u64 {
        position as u64 * self.settings.wait_minutes_per_position
    }

    fn record(&self, run_id: &str, job: &Value, status: RunStatus) {
        if self.store.create(run_id, job, status).is_err() {
            // Re-admission of a finished id refreshes the old record.
            self.update_record(run_id, status);
        }
    }

    fn update_record(&self, run_id: &str, status: RunStatus) {
        if let Err(err) = self.store.update_status(run_id, status, None) {
            warn!(run_id, %err, "run record update failed");
        }
    }
}
