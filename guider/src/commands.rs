//! Guider command surface
//!
//! Entry points a command dispatcher calls for one telescope unit. Commands
//! are serialized through the state machine lock; calibration and focusing
//! hold it for their whole duration. `status` and `state` never take it.

use crate::calibration::{CalibrationReport, Calibrator};
use crate::config::GuiderConfig;
use crate::error::{GuideError, GuideResult};
use crate::focus::{FocusReport, FocusSeries, FOCUSER_UNIT};
use crate::matrix::MatrixSummary;
use crate::mode::GuideMode;
use crate::statemachine::{GuideStateMachine, ModeHandle, TaskLiveness};
use crate::strategy::{build_strategy, ImageAnalyzer};
use crate::unit::TelescopeUnit;
use crate::worker::{GuideWorker, StatusCallback};
use autoguide_proxy::{invoke, ProxyError};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

/// Reply to the `status` command
#[derive(Debug, Clone, Serialize)]
pub struct UnitStatus {
    pub unit: String,
    pub state: GuideMode,
    pub has_task: bool,
    pub calibration: Option<MatrixSummary>,
}

pub struct GuideCommands {
    unit: Arc<TelescopeUnit>,
    analyzer: Arc<dyn ImageAnalyzer>,
    config: GuiderConfig,
    mode: ModeHandle,
    liveness: TaskLiveness,
    machine: Mutex<GuideStateMachine>,
    status: Option<StatusCallback>,
}

impl GuideCommands {
    pub fn new(unit: Arc<TelescopeUnit>, analyzer: Arc<dyn ImageAnalyzer>, config: GuiderConfig) -> Self {
        let machine = GuideStateMachine::new(config.guide.stop_grace());
        Self {
            unit,
            analyzer,
            mode: machine.mode_handle(),
            liveness: machine.liveness(),
            machine: Mutex::new(machine),
            config,
            status: None,
        }
    }

    pub fn with_status_callback(mut self, callback: StatusCallback) -> Self {
        self.status = Some(callback);
        self
    }

    pub fn unit(&self) -> &Arc<TelescopeUnit> {
        &self.unit
    }

    pub fn state(&self) -> GuideMode {
        self.mode.get()
    }

    pub fn subscribe(&self) -> watch::Receiver<GuideMode> {
        self.mode.subscribe()
    }

    /// Start guiding in the background and return the mode right after.
    ///
    /// Without `force` the guider must be idle; with it any running task is
    /// retired first. Without `exptime` the configured exposure time is used;
    /// one outside the configured bounds is rejected.
    pub async fn guide_start(&self, exptime: Option<f64>, pause: bool, force: bool) -> GuideResult<GuideMode> {
        let mut machine = self.machine.lock().await;
        if !force && !machine.is_idle() {
            return Err(GuideError::invalid_state(machine.state(), "guider is not idle"));
        }

        let exptime = self.config.guide.exposure_time(exptime)?;
        let strategy = build_strategy(&self.config.guide, self.analyzer.clone());
        let mut worker = GuideWorker::new(self.unit.clone(), strategy, &self.config.guide)?;
        if let Some(callback) = &self.status {
            worker = worker.with_status_callback(callback.clone());
        }

        tracing::info!(
            "{}: starting guider with {} s exposures (pause={}, force={})",
            self.unit.name(),
            exptime,
            pause,
            force
        );
        let task = Arc::new(worker).work(machine.mode_handle(), machine.correction_gate(), exptime, pause);
        machine.start(task).await
    }

    pub async fn guide_pause(&self, pause: bool) -> GuideResult<GuideMode> {
        self.machine.lock().await.pause(pause)
    }

    /// Stop guiding; a no-op when nothing is running
    pub async fn guide_stop(&self) -> GuideMode {
        let mut machine = self.machine.lock().await;
        let state = machine.stop().await;
        tracing::info!("{}: guider stopped", self.unit.name());
        state
    }

    /// Run a calibration; the guider must be idle
    pub async fn guide_calibrate(&self) -> GuideResult<CalibrationReport> {
        let machine = self.machine.lock().await;
        if !machine.is_idle() {
            return Err(GuideError::invalid_state(machine.state(), "cannot calibrate while guiding"));
        }
        Calibrator::new(
            self.unit.clone(),
            self.analyzer.clone(),
            &self.config.guide,
            &self.config.calibration,
        )
        .run()
        .await
    }

    /// Move the focuser, to `value` or by `value` steps if `relative`
    pub async fn focus(&self, value: f64, relative: bool) -> GuideResult<GuideMode> {
        let machine = self.machine.lock().await;
        let focuser = self.unit.focuser().ok_or(GuideError::MissingDevice("focuser"))?;
        if !machine.is_idle() {
            return Err(GuideError::invalid_state(machine.state(), "cannot focus while guiding"));
        }

        let call = if relative {
            focuser.move_relative(value, FOCUSER_UNIT)
        } else {
            focuser.move_absolute(value, FOCUSER_UNIT)
        };
        self.while_focusing(&machine, async move {
            invoke(vec![call]).await?;
            Ok(())
        })
        .await?;
        Ok(machine.state())
    }

    /// Run a focus series around `centre` and move to the best focus found
    pub async fn autofocus(&self, centre: Option<f64>) -> GuideResult<FocusReport> {
        let machine = self.machine.lock().await;
        if self.unit.focuser().is_none() {
            return Err(GuideError::MissingDevice("focuser"));
        }
        if !machine.is_idle() {
            return Err(GuideError::invalid_state(machine.state(), "cannot focus while guiding"));
        }

        let series = FocusSeries::new(self.unit.clone(), self.analyzer.clone(), &self.config.focus);
        self.while_focusing(&machine, async move { series.run(centre).await })
            .await
    }

    /// Run `work` in `Focusing`. Idle is restored by the spawned task even if
    /// this request is dropped.
    async fn while_focusing<T, F>(&self, machine: &GuideStateMachine, work: F) -> GuideResult<T>
    where
        T: Send + 'static,
        F: Future<Output = GuideResult<T>> + Send + 'static,
    {
        machine.set_mode(GuideMode::Focusing)?;
        let mode = self.mode.clone();
        let mover = tokio::spawn(async move {
            let result = work.await;
            mode.force_idle();
            result
        });
        match mover.await {
            Ok(result) => result,
            Err(e) => {
                self.mode.force_idle();
                Err(ProxyError::Transport(format!("focuser task failed: {}", e)).into())
            }
        }
    }

    /// Current mode, task and calibration; never waits on a running command
    pub async fn status(&self) -> UnitStatus {
        UnitStatus {
            unit: self.unit.name().to_string(),
            state: self.state(),
            has_task: self.liveness.is_alive(),
            calibration: self.unit.calibration().await.map(|m| m.summary()),
        }
    }

    /// Request a mode by label; `IDLE` stops and `PAUSED`/`GUIDING` pause or resume
    pub async fn set_state(&self, value: &str) -> GuideResult<GuideMode> {
        self.machine.lock().await.set_state_value(value).await
    }
}
