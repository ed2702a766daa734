//! Background process lifecycle
//!
//! Every recurring loop in the pipeline is registered here by id. The
//! registry owns the "is this loop already running" state, hands out a
//! cancellation token per loop and coordinates shutdown: loops see the
//! signal before their next scheduled tick, and a tick that has already
//! started always runs to completion.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Work executed on every scheduled tick
#[async_trait]
pub trait PeriodicTask: Send + Sync + 'static {
    async fn run(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Registered,
    Running,
    Stopping,
    Stopped,
}

impl ProcessState {
    fn is_active(&self) -> bool {
        matches!(self, ProcessState::Registered | ProcessState::Running)
    }
}

/// Acknowledgement of a start request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    /// A loop with this id is already running; nothing was started
    AlreadyActive,
    /// The loop was started and runs its first tick in the background
    Initializing,
}

/// State shared between the registry and the running loop
#[derive(Debug)]
struct ProcessShared {
    state: Mutex<ProcessState>,
    ticks: AtomicU64,
    last_tick: Mutex<Option<DateTime<Utc>>>,
}

impl ProcessShared {
    fn new() -> Self {
        Self {
            state: Mutex::new(ProcessState::Registered),
            ticks: AtomicU64::new(0),
            last_tick: Mutex::new(None),
        }
    }

    fn state(&self) -> ProcessState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ProcessState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn record_tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        *self.last_tick.lock().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
    }
}

struct ManagedProcess {
    kind: String,
    description: String,
    interval: Duration,
    started_at: DateTime<Utc>,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
    shared: Arc<ProcessShared>,
}

/// Read-only view of one managed process
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
    pub state: ProcessState,
    pub interval_ms: u64,
    pub started_at: DateTime<Utc>,
    pub ticks: u64,
    pub last_tick: Option<DateTime<Utc>>,
}

/// Aggregate status for health endpoints
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleStatus {
    pub status: &'static str,
    pub processes: Vec<ProcessInfo>,
}

/// Registry and scheduler for recurring background loops
pub struct ProcessLifecycleManager {
    processes: DashMap<String, ManagedProcess>,
    shutdown: CancellationToken,
    shutting_down: AtomicBool,
}

impl Default for ProcessLifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessLifecycleManager {
    pub fn new() -> Self {
        Self {
            processes: DashMap::new(),
            shutdown: CancellationToken::new(),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Start `task` on a fixed interval unless `id` is already active
    ///
    /// The check and the start happen under the registry entry lock, so
    /// concurrent requests for the same id start exactly one loop.
    pub fn register_interval(
        &self,
        id: &str,
        kind: &str,
        description: &str,
        interval: Duration,
        task: Arc<dyn PeriodicTask>,
    ) -> Result<Activation> {
        if self.is_shutting_down() {
            return Err(Error::ShuttingDown);
        }

        let mut process = match self.processes.entry(id.to_string()) {
            Entry::Occupied(occupied) if occupied.get().shared.state().is_active() => {
                debug!(process = id, "Process already active");
                return Ok(Activation::AlreadyActive);
            }
            Entry::Occupied(mut occupied) => {
                // Stopped earlier, start it again under the same id
                occupied.insert(Self::new_process(kind, description, interval, &self.shutdown));
                occupied.into_ref()
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Self::new_process(kind, description, interval, &self.shutdown))
            }
        };

        process.shared.set_state(ProcessState::Running);
        let handle = tokio::spawn(run_loop(
            id.to_string(),
            interval,
            task,
            process.token.clone(),
            process.shared.clone(),
        ));
        process.handle = Some(handle);

        info!(
            process = id,
            kind,
            interval_ms = interval.as_millis() as u64,
            "Registered background process"
        );
        Ok(Activation::Initializing)
    }

    fn new_process(
        kind: &str,
        description: &str,
        interval: Duration,
        shutdown: &CancellationToken,
    ) -> ManagedProcess {
        ManagedProcess {
            kind: kind.to_string(),
            description: description.to_string(),
            interval,
            started_at: Utc::now(),
            token: shutdown.child_token(),
            handle: None,
            shared: Arc::new(ProcessShared::new()),
        }
    }

    /// Stop one process and remove it from the registry
    ///
    /// Waits for an in-flight tick to finish.
    pub async fn deregister(&self, id: &str) -> Result<()> {
        let (_, mut process) = self
            .processes
            .remove(id)
            .ok_or_else(|| Error::ProcessNotFound(id.to_string()))?;

        process.shared.set_state(ProcessState::Stopping);
        process.token.cancel();
        if let Some(handle) = process.handle.take() {
            if let Err(e) = handle.await {
                warn!(process = id, error = %e, "Process task ended abnormally");
            }
        }
        process.shared.set_state(ProcessState::Stopped);
        info!(process = id, "Deregistered background process");
        Ok(())
    }

    /// Signal every loop to stop and wait for in-flight ticks to finish
    pub async fn shutdown(&self, grace: Duration) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            debug!("Shutdown already in progress");
            return;
        }

        info!(processes = self.processes.len(), "Shutting down background processes");

        let mut handles = Vec::new();
        for mut process in self.processes.iter_mut() {
            if process.shared.state().is_active() {
                process.shared.set_state(ProcessState::Stopping);
            }
            if let Some(handle) = process.handle.take() {
                handles.push((process.key().clone(), handle, process.shared.clone()));
            }
        }
        self.shutdown.cancel();

        // In-flight ticks always finish; the grace period only bounds the quiet wait
        let deadline = Instant::now() + grace;
        for (id, mut handle, shared) in handles {
            let joined = match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(
                        process = %id,
                        grace_secs = grace.as_secs_f64(),
                        "Process still finishing its tick after grace period, waiting"
                    );
                    handle.await
                }
            };
            if let Err(e) = joined {
                warn!(process = %id, error = %e, "Process task ended abnormally");
            }
            shared.set_state(ProcessState::Stopped);
        }

        info!("All background processes stopped");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.processes
            .get(id)
            .map(|p| p.shared.state().is_active())
            .unwrap_or(false)
    }

    /// Token cancelled when shutdown begins
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Snapshot of every registered process, ordered by id
    pub fn get_all_processes(&self) -> Vec<ProcessInfo> {
        let mut processes: Vec<ProcessInfo> = self
            .processes
            .iter()
            .map(|entry| {
                let process = entry.value();
                ProcessInfo {
                    id: entry.key().clone(),
                    kind: process.kind.clone(),
                    description: process.description.clone(),
                    state: process.shared.state(),
                    interval_ms: process.interval.as_millis() as u64,
                    started_at: process.started_at,
                    ticks: process.shared.ticks.load(Ordering::Relaxed),
                    last_tick: *process
                        .shared
                        .last_tick
                        .lock()
                        .unwrap_or_else(|e| e.into_inner()),
                }
            })
            .collect();
        processes.sort_by(|a, b| a.id.cmp(&b.id));
        processes
    }

    pub fn get_status(&self) -> LifecycleStatus {
        let processes = self.get_all_processes();
        let status = if self.is_shutting_down() {
            if processes.iter().all(|p| p.state == ProcessState::Stopped) {
                "stopped"
            } else {
                "shutting_down"
            }
        } else if processes.iter().any(|p| p.state == ProcessState::Running) {
            "running"
        } else {
            "idle"
        };
        LifecycleStatus { status, processes }
    }
}

async fn run_loop(
    id: String,
    period: Duration,
    task: Arc<dyn PeriodicTask>,
    token: CancellationToken,
    shared: Arc<ProcessShared>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        // First tick completes immediately
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if token.is_cancelled() {
            break;
        }

        task.run().await;
        shared.record_tick();
    }

    shared.set_state(ProcessState::Stopped);
    info!(process = %id, ticks = shared.ticks.load(Ordering::Relaxed), "Background process stopped");
}
