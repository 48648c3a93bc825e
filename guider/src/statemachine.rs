//! Guide state machine
//!
//! Owns the unit's [`GuideMode`] and the single background guide task. The
//! mode is published on a watch channel; every change goes through
//! [`ModeHandle`], which enforces the transition table.

use crate::error::{GuideError, GuideResult};
use crate::mode::GuideMode;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OwnedRwLockReadGuard, RwLock};
use tokio::task::JoinHandle;

/// Shared access to the current mode
#[derive(Clone)]
pub struct ModeHandle {
    tx: Arc<watch::Sender<GuideMode>>,
}

impl ModeHandle {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(GuideMode::Idle);
        Self { tx: Arc::new(tx) }
    }

    pub fn get(&self) -> GuideMode {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<GuideMode> {
        self.tx.subscribe()
    }

    /// Move to `target` if the transition table allows it
    pub(crate) fn set(&self, target: GuideMode) -> GuideResult<()> {
        let mut rejected = None;
        self.tx.send_if_modified(|mode| {
            if *mode == target {
                false
            } else if mode.can_transition_to(target) {
                tracing::info!("Guide mode {} -> {}", mode, target);
                *mode = target;
                true
            } else {
                rejected = Some(*mode);
                false
            }
        });
        match rejected {
            Some(state) => Err(GuideError::invalid_state(
                state,
                format!("cannot change mode to {}", target),
            )),
            None => Ok(()),
        }
    }

    /// Move to `target` only if the mode is still `expected`
    pub(crate) fn compare_and_set(&self, expected: GuideMode, target: GuideMode) -> bool {
        self.tx.send_if_modified(|mode| {
            if *mode == expected && mode.can_transition_to(target) && *mode != target {
                tracing::info!("Guide mode {} -> {}", mode, target);
                *mode = target;
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn force_idle(&self) {
        // Idle is reachable from every mode
        let _ = self.set(GuideMode::Idle);
    }
}

/// Tracks mount/derotator corrections that are still on the bus.
///
/// Each correction holds a read guard for its lifetime; [`drain`] takes the
/// write side and so returns only once every in-flight correction is done.
///
/// [`drain`]: CorrectionGate::drain
#[derive(Clone, Default)]
pub struct CorrectionGate {
    lock: Arc<RwLock<()>>,
}

impl CorrectionGate {
    pub async fn enter(&self) -> OwnedRwLockReadGuard<()> {
        self.lock.clone().read_owned().await
    }

    pub async fn drain(&self) {
        let _guard = self.lock.write().await;
    }
}

/// Lock-free view of whether the guide task is running
#[derive(Clone, Default)]
pub struct TaskLiveness {
    alive: Arc<AtomicBool>,
}

impl TaskLiveness {
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn set(&self, alive: bool) {
        self.alive.store(alive, Ordering::Release);
    }
}

struct ActiveTask {
    handle: JoinHandle<()>,
}

/// Mode and task supervisor for one telescope unit
pub struct GuideStateMachine {
    mode: ModeHandle,
    gate: CorrectionGate,
    task: Option<ActiveTask>,
    liveness: TaskLiveness,
    stop_grace: Duration,
}

impl GuideStateMachine {
    pub fn new(stop_grace: Duration) -> Self {
        Self {
            mode: ModeHandle::new(),
            gate: CorrectionGate::default(),
            task: None,
            liveness: TaskLiveness::default(),
            stop_grace,
        }
    }

    pub fn state(&self) -> GuideMode {
        self.mode.get()
    }

    pub fn is_idle(&self) -> bool {
        self.state() == GuideMode::Idle
    }

    pub fn mode_handle(&self) -> ModeHandle {
        self.mode.clone()
    }

    pub fn correction_gate(&self) -> CorrectionGate {
        self.gate.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<GuideMode> {
        self.mode.subscribe()
    }

    pub fn liveness(&self) -> TaskLiveness {
        self.liveness.clone()
    }

    /// Whether a background task is still running
    pub fn has_active_task(&self) -> bool {
        self.task
            .as_ref()
            .map(|t| !t.handle.is_finished())
            .unwrap_or(false)
    }

    /// Request a mode by its label.
    ///
    /// Only what `stop` or `pause` would do is accepted: `IDLE` stops any
    /// running task, `PAUSED` and `GUIDING` pause or resume a live one.
    pub async fn set_state_value(&mut self, value: &str) -> GuideResult<GuideMode> {
        let target: GuideMode = value.parse()?;
        match target {
            GuideMode::Idle => {
                self.stop().await;
                self.mode.force_idle();
                Ok(self.state())
            }
            GuideMode::Paused | GuideMode::Guiding if self.has_active_task() => {
                self.pause(target == GuideMode::Paused)
            }
            _ if target == self.state() => Ok(target),
            _ => Err(GuideError::invalid_state(
                self.state(),
                format!("mode {} is only entered by guide commands", target),
            )),
        }
    }

    pub(crate) fn set_mode(&self, target: GuideMode) -> GuideResult<()> {
        self.mode.set(target)
    }

    /// Retire any running task, enter `Starting` and run `task` in the background
    pub async fn start<F>(&mut self, task: F) -> GuideResult<GuideMode>
    where
        F: Future<Output = GuideResult<()>> + Send + 'static,
    {
        self.stop().await;
        self.mode.set(GuideMode::Starting)?;

        let mode = self.mode.clone();
        let liveness = self.liveness.clone();
        liveness.set(true);
        let handle = tokio::spawn(async move {
            let outcome = AssertUnwindSafe(task).catch_unwind().await;
            liveness.set(false);
            match outcome {
                Ok(Ok(())) => tracing::debug!("Guide task finished"),
                Ok(Err(GuideError::Cancelled)) => tracing::debug!("Guide task cancelled"),
                Ok(Err(e)) => {
                    tracing::error!("Guide task failed: {}", e);
                    mode.force_idle();
                }
                Err(_) => {
                    tracing::error!("Guide task panicked");
                    mode.force_idle();
                }
            }
        });
        self.task = Some(ActiveTask { handle });
        Ok(self.state())
    }

    /// Pause or resume the running task
    pub fn pause(&mut self, pause: bool) -> GuideResult<GuideMode> {
        if !self.has_active_task() {
            return Err(GuideError::invalid_state(self.state(), "no guide task running"));
        }
        let target = if pause {
            GuideMode::Paused
        } else {
            GuideMode::Guiding
        };
        self.mode.set(target)?;
        Ok(self.state())
    }

    /// End the running task and return to `Idle`.
    ///
    /// The task gets the grace period to notice `Stopping` and exit; after
    /// that it is aborted. Corrections already on the bus are waited for.
    pub async fn stop(&mut self) -> GuideMode {
        let Some(mut active) = self.task.take() else {
            return self.state();
        };

        if !active.handle.is_finished() {
            if self.state().is_active() {
                let _ = self.mode.set(GuideMode::Stopping);
            }
            match tokio::time::timeout(self.stop_grace, &mut active.handle).await {
                Ok(_) => tracing::debug!("Guide task exited within grace period"),
                Err(_) => {
                    tracing::warn!(
                        "Guide task did not stop within {:?}, cancelling",
                        self.stop_grace
                    );
                    active.handle.abort();
                    let _ = active.handle.await;
                }
            }
        }
        self.liveness.set(false);

        self.gate.drain().await;
        self.mode.force_idle();
        GuideMode::Idle
    }
}

impl Drop for GuideStateMachine {
    fn drop(&mut self) {
        if let Some(active) = self.task.take() {
            active.handle.abort();
            self.liveness.set(false);
        }
    }
}
