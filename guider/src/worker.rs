//! Guide loop
//!
//! The worker establishes a reference from one round of exposures and then
//! keeps exposing, measuring and correcting while the mode is `Guiding` or
//! `Paused`. While paused it measures without correcting.

use crate::config::GuideConfig;
use crate::correction::{dispatch, Correction, CorrectionPlanner};
use crate::error::{GuideError, GuideResult};
use crate::mode::GuideMode;
use crate::statemachine::{CorrectionGate, ModeHandle};
use crate::strategy::{FrameMeasurement, Offset, OffsetStrategy, Position, ReferenceFrame};
use crate::unit::TelescopeUnit;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Receives one status event per reference and per loop iteration
pub type StatusCallback = Arc<dyn Fn(&GuideStatus) + Send + Sync>;

/// Snapshot reported after each reference or iteration
#[derive(Debug, Clone, Serialize)]
pub struct GuideStatus {
    pub is_reference: bool,
    pub state: GuideMode,
    pub filenames: Vec<String>,
    pub measurements: Vec<FrameMeasurement>,
    pub position: Option<Position>,
    pub offset: Option<Offset>,
    pub correction: Option<Correction>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl GuideStatus {
    fn failure(is_reference: bool, state: GuideMode, error: &GuideError) -> Self {
        Self {
            is_reference,
            state,
            filenames: Vec::new(),
            measurements: Vec::new(),
            position: None,
            offset: None,
            correction: None,
            error: Some(error.to_string()),
            timestamp: Utc::now(),
        }
    }
}

pub struct GuideWorker {
    unit: Arc<TelescopeUnit>,
    strategy: Mutex<Box<dyn OffsetStrategy>>,
    planner: CorrectionPlanner,
    config: GuideConfig,
    status: Option<StatusCallback>,
}

impl GuideWorker {
    pub fn new(unit: Arc<TelescopeUnit>, strategy: Box<dyn OffsetStrategy>, config: &GuideConfig) -> GuideResult<Self> {
        Ok(Self {
            unit,
            strategy: Mutex::new(strategy),
            planner: CorrectionPlanner::new(config)?,
            config: config.clone(),
            status: None,
        })
    }

    pub fn with_status_callback(mut self, callback: StatusCallback) -> Self {
        self.status = Some(callback);
        self
    }

    pub fn unit(&self) -> &Arc<TelescopeUnit> {
        &self.unit
    }

    /// Reference then loop; this is the body of the guide task
    pub async fn work(self: Arc<Self>, mode: ModeHandle, gate: CorrectionGate, exptime: f64, pause: bool) -> GuideResult<()> {
        self.reference(&mode, exptime, pause).await?;
        self.run_loop(&mode, &gate, exptime).await
    }

    /// Expose all cameras and make the result the new reference.
    ///
    /// Ends in `Paused` if `pause`, else `Guiding`, unless the mode was
    /// changed meanwhile: a pause/resume request is kept, and a stop request
    /// makes this return [`GuideError::Cancelled`].
    pub async fn reference(&self, mode: &ModeHandle, exptime: f64, pause: bool) -> GuideResult<ReferenceFrame> {
        match mode.get() {
            GuideMode::Idle => mode.set(GuideMode::Starting)?,
            GuideMode::Starting | GuideMode::Guiding | GuideMode::Paused => {}
            GuideMode::Stopping => return Err(GuideError::Cancelled),
            other => return Err(GuideError::invalid_state(other, "cannot take a reference now")),
        }

        let established = async {
            let frames = self.unit.expose_all(exptime).await?;
            self.strategy.lock().await.establish_reference(&frames).await
        }
        .await;

        let reference = match established {
            Ok(reference) => reference,
            Err(e) => {
                if matches!(mode.get(), GuideMode::Stopping | GuideMode::Idle) {
                    return Err(GuideError::Cancelled);
                }
                tracing::error!("{}: reference failed: {}", self.unit.name(), e);
                mode.force_idle();
                self.emit(&GuideStatus::failure(true, mode.get(), &e));
                return Err(e);
            }
        };

        let target = if pause {
            GuideMode::Paused
        } else {
            GuideMode::Guiding
        };
        if !mode.compare_and_set(GuideMode::Starting, target) && !mode.get().is_looping() {
            return Err(GuideError::Cancelled);
        }

        tracing::info!(
            "{}: reference established from {}",
            self.unit.name(),
            reference.filenames().join(", ")
        );
        self.emit(&GuideStatus {
            is_reference: true,
            state: mode.get(),
            filenames: reference.filenames(),
            measurements: reference.measurements.clone(),
            position: Some(reference.position),
            offset: None,
            correction: None,
            error: None,
            timestamp: Utc::now(),
        });
        Ok(reference)
    }

    /// Iterate until the mode leaves `Guiding`/`Paused`.
    ///
    /// Unreliable measurements are skipped. Any other failure forces `Idle`
    /// and ends the loop with that error.
    pub async fn run_loop(&self, mode: &ModeHandle, gate: &CorrectionGate, exptime: f64) -> GuideResult<()> {
        while mode.get().is_looping() {
            match self.iterate(mode, gate, exptime).await {
                Ok(status) => self.emit(&status),
                Err(e) if e.is_recoverable() => {
                    tracing::warn!("{}: skipping correction: {}", self.unit.name(), e);
                    self.emit(&GuideStatus::failure(false, mode.get(), &e));
                }
                Err(e) => {
                    tracing::error!("{}: guide loop aborted: {}", self.unit.name(), e);
                    mode.force_idle();
                    self.emit(&GuideStatus::failure(false, mode.get(), &e));
                    return Err(e);
                }
            }
            self.pace(mode).await;
        }
        tracing::info!("{}: guide loop finished ({})", self.unit.name(), mode.get());
        Ok(())
    }

    async fn iterate(&self, mode: &ModeHandle, gate: &CorrectionGate, exptime: f64) -> GuideResult<GuideStatus> {
        let frames = self.unit.expose_all(exptime).await?;

        let (measured, strategy_name) = {
            let mut strategy = self.strategy.lock().await;
            let measured = strategy.find_offset(&frames).await?;
            (measured, strategy.name())
        };

        let mut correction = None;
        if mode.get() == GuideMode::Guiding {
            let declination = match measured.position {
                Position::Sky(coord) => coord.dec_deg,
                Position::Pixel(_) => {
                    self.unit
                        .mount()
                        .declination(&self.config.declination_key)
                        .await?
                }
            };
            let calibration = self.unit.calibration().await;
            correction = self.planner.plan(
                strategy_name,
                &measured.offset,
                calibration.as_ref(),
                declination,
                self.unit.derotator().is_some(),
            );

            if let Some(c) = &correction {
                tracing::info!(
                    "{}: correcting ra={:.3}\" dec={:.3}\" rot={:?}",
                    self.unit.name(),
                    c.ra_arcsec,
                    c.dec_arcsec,
                    c.rotation_deg
                );
                dispatch(&self.unit, c, gate).await?;
            }
        }

        Ok(GuideStatus {
            is_reference: false,
            state: mode.get(),
            filenames: frames.iter().map(|f| f.filename.clone()).collect(),
            measurements: measured.measurements,
            position: Some(measured.position),
            offset: Some(measured.offset),
            correction,
            error: None,
            timestamp: Utc::now(),
        })
    }

    /// Wait out the loop interval, returning early once the loop should end
    async fn pace(&self, mode: &ModeHandle) {
        let mut changes = mode.subscribe();
        let sleep = tokio::time::sleep(self.config.loop_interval());
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return,
                changed = changes.changed() => {
                    if changed.is_err() || !changes.borrow().is_looping() {
                        return;
                    }
                }
            }
        }
    }

    fn emit(&self, status: &GuideStatus) {
        if let Some(callback) = &self.status {
            callback(status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::SimulatedUnit;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    fn collector() -> (StatusCallback, Arc<StdMutex<Vec<GuideStatus>>>) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: StatusCallback = Arc::new(move |status: &GuideStatus| {
            sink.lock().unwrap().push(status.clone());
        });
        (callback, seen)
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reference_then_correction() {
        let sim = SimulatedUnit::start().await;
        sim.unit.set_calibration(sim.truth()).await;
        let (callback, seen) = collector();
        let worker = Arc::new(
            GuideWorker::new(sim.unit.clone(), sim.strategy(), &sim.config.guide)
                .unwrap()
                .with_status_callback(callback),
        );

        let mode = sim.machine.mode_handle();
        let gate = sim.machine.correction_gate();
        let reference = worker.reference(&mode, 0.01, true).await.unwrap();
        assert_eq!(mode.get(), GuideMode::Paused);
        assert_eq!(reference.filenames().len(), 2);
        assert!(seen.lock().unwrap()[0].is_reference);

        sim.sky.set_drift(4.0, -3.0);
        mode.set(GuideMode::Guiding).unwrap();
        let task = tokio::spawn({
            let worker = worker.clone();
            let mode = mode.clone();
            async move { worker.run_loop(&mode, &gate, 0.01).await }
        });

        wait_until(|| !sim.sky.offsets().is_empty()).await;
        mode.set(GuideMode::Stopping).unwrap();
        task.await.unwrap().unwrap();

        let (ra, dec) = sim.sky.offsets()[0];
        let cos_dec = sim.sky.declination().to_radians().cos();
        assert!((ra - (-0.8 * 4.0 / cos_dec)).abs() < 1e-6, "ra={}", ra);
        assert!((dec - 2.4).abs() < 1e-6, "dec={}", dec);

        let statuses = seen.lock().unwrap();
        let corrected = statuses.iter().find(|s| s.correction.is_some()).unwrap();
        assert!(!corrected.is_reference);
        assert_eq!(corrected.filenames.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_paused_measures_without_correcting() {
        let sim = SimulatedUnit::start().await;
        let (callback, seen) = collector();
        let worker = Arc::new(
            GuideWorker::new(sim.unit.clone(), sim.strategy(), &sim.config.guide)
                .unwrap()
                .with_status_callback(callback),
        );
        let mode = sim.machine.mode_handle();
        let gate = sim.machine.correction_gate();
        worker.reference(&mode, 0.01, true).await.unwrap();
        sim.sky.set_drift(5.0, 5.0);

        let task = tokio::spawn({
            let worker = worker.clone();
            let mode = mode.clone();
            async move { worker.run_loop(&mode, &gate, 0.01).await }
        });
        wait_until(|| seen.lock().unwrap().len() >= 4).await;
        mode.set(GuideMode::Stopping).unwrap();
        task.await.unwrap().unwrap();

        assert!(sim.sky.offsets().is_empty());
        let statuses = seen.lock().unwrap();
        assert!(statuses[1..].iter().all(|s| s.offset.is_some() && s.correction.is_none()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_flux_drop_skips_dispatch() {
        let sim = SimulatedUnit::start().await;
        let (callback, seen) = collector();
        let worker = Arc::new(
            GuideWorker::new(sim.unit.clone(), sim.strategy(), &sim.config.guide)
                .unwrap()
                .with_status_callback(callback),
        );
        let mode = sim.machine.mode_handle();
        let gate = sim.machine.correction_gate();
        worker.reference(&mode, 0.01, false).await.unwrap();
        assert_eq!(mode.get(), GuideMode::Guiding);

        sim.sky.set_drift(6.0, 6.0);
        sim.sky.set_flux_scale(0.4);
        let task = tokio::spawn({
            let worker = worker.clone();
            let mode = mode.clone();
            async move { worker.run_loop(&mode, &gate, 0.01).await }
        });
        wait_until(|| seen.lock().unwrap().len() >= 4).await;
        assert_eq!(mode.get(), GuideMode::Guiding);
        mode.set(GuideMode::Stopping).unwrap();
        task.await.unwrap().unwrap();

        assert_eq!(sim.sky.mount_commands(), 0);
        let statuses = seen.lock().unwrap();
        assert!(statuses[1..]
            .iter()
            .all(|s| s.error.as_deref().map_or(false, |e| e.contains("Unreliable"))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_camera_failure_forces_idle() {
        let sim = SimulatedUnit::start().await;
        let worker = Arc::new(GuideWorker::new(sim.unit.clone(), sim.strategy(), &sim.config.guide).unwrap());
        let mode = sim.machine.mode_handle();
        let gate = sim.machine.correction_gate();
        worker.reference(&mode, 0.01, false).await.unwrap();

        sim.sky.fail_exposures("shutter stuck");
        let err = worker.run_loop(&mode, &gate, 0.01).await.unwrap_err();
        assert!(matches!(err, GuideError::Proxy(_)));
        assert_eq!(mode.get(), GuideMode::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reference_respects_stop_request() {
        let sim = SimulatedUnit::start().await;
        sim.sky.set_exposure_delay(Duration::from_millis(200));
        let worker = Arc::new(GuideWorker::new(sim.unit.clone(), sim.strategy(), &sim.config.guide).unwrap());
        let mode = sim.machine.mode_handle();

        let task = tokio::spawn({
            let worker = worker.clone();
            let mode = mode.clone();
            async move { worker.reference(&mode, 0.01, false).await }
        });
        wait_until(|| mode.get() == GuideMode::Starting).await;
        mode.set(GuideMode::Stopping).unwrap();

        assert!(matches!(task.await.unwrap(), Err(GuideError::Cancelled)));
        assert_eq!(mode.get(), GuideMode::Stopping);
    }
}
