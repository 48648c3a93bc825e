//! Simulated telescope for tests
//!
//! Mount offsets and an externally set drift move a fixed star field by a
//! known pixel-per-arcsec matrix. Cameras record the pointing at exposure
//! time under the returned filename so the analyzer can render that frame.
//! Star sizes grow quadratically with the focuser's distance from best focus.

use crate::config::{CalibrationConfig, CameraConfig, CameraRole, FocusConfig, GuideConfig, GuiderConfig, UnitConfig};
use crate::error::{GuideError, GuideResult};
use crate::matrix::CalibrationMatrix;
use crate::statemachine::GuideStateMachine;
use crate::strategy::{build_strategy, Frame, ImageAnalyzer, OffsetStrategy, PixelCoord, SkyCoord, Source};
use crate::unit::TelescopeUnit;
use async_trait::async_trait;
use autoguide_proxy::{ActorHandler, Body, CommandRequest, LocalBus, RemoteError, RemoteErrorKind, ReplySink};
use nalgebra::{Matrix2, Vector2};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const NOMINAL_FOCUS: f64 = 4200.0;
const DEFOCUS_PER_STEP2: f64 = 1e-3;

const STARS: [(f64, f64, f64); 6] = [
    (120.0, 140.0, 9000.0),
    (380.0, 110.0, 4200.0),
    (620.0, 180.0, 2600.0),
    (200.0, 420.0, 1800.0),
    (470.0, 390.0, 1100.0),
    (650.0, 520.0, 700.0),
];

#[derive(Debug, Clone, Copy)]
struct Snapshot {
    pointing: (f64, f64),
    flux_scale: f64,
    defocus: f64,
}

struct SkyState {
    mount_sky: (f64, f64),
    drift: (f64, f64),
    flux_scale: f64,
    offsets: Vec<(f64, f64)>,
    mount_commands: usize,
    focuser_moves: Vec<String>,
    focuser_position: f64,
    best_focus: f64,
    exposures: HashMap<String, Snapshot>,
    counter: usize,
    failure: Option<String>,
    delay: Duration,
    focuser_delay: Duration,
}

pub(crate) struct SimSky {
    declination: f64,
    truth: Matrix2<f64>,
    state: Mutex<SkyState>,
}

impl SimSky {
    fn new(declination: f64, truth: Matrix2<f64>) -> Arc<Self> {
        Arc::new(Self {
            declination,
            truth,
            state: Mutex::new(SkyState {
                mount_sky: (0.0, 0.0),
                drift: (0.0, 0.0),
                flux_scale: 1.0,
                offsets: Vec::new(),
                mount_commands: 0,
                focuser_moves: Vec::new(),
                focuser_position: NOMINAL_FOCUS,
                best_focus: NOMINAL_FOCUS,
                exposures: HashMap::new(),
                counter: 0,
                failure: None,
                delay: Duration::ZERO,
                focuser_delay: Duration::ZERO,
            }),
        })
    }

    pub fn declination(&self) -> f64 {
        self.declination
    }

    /// On-sky drift in arcsec added to the mount pointing
    pub fn set_drift(&self, ra: f64, dec: f64) {
        self.state.lock().unwrap().drift = (ra, dec);
    }

    pub fn set_flux_scale(&self, scale: f64) {
        self.state.lock().unwrap().flux_scale = scale;
    }

    pub fn fail_exposures(&self, reason: &str) {
        self.state.lock().unwrap().failure = Some(reason.to_string());
    }

    pub fn set_exposure_delay(&self, delay: Duration) {
        self.state.lock().unwrap().delay = delay;
    }

    pub fn set_focuser_delay(&self, delay: Duration) {
        self.state.lock().unwrap().focuser_delay = delay;
    }

    pub fn set_best_focus(&self, position: f64) {
        self.state.lock().unwrap().best_focus = position;
    }

    pub fn focuser_position(&self) -> f64 {
        self.state.lock().unwrap().focuser_position
    }

    /// Offsets received by the mount, in mount-axis arcsec
    pub fn offsets(&self) -> Vec<(f64, f64)> {
        self.state.lock().unwrap().offsets.clone()
    }

    /// Accumulated on-sky mount offset in arcsec
    pub fn mount_pointing(&self) -> (f64, f64) {
        self.state.lock().unwrap().mount_sky
    }

    pub fn mount_commands(&self) -> usize {
        self.state.lock().unwrap().mount_commands
    }

    pub fn focuser_moves(&self) -> Vec<String> {
        self.state.lock().unwrap().focuser_moves.clone()
    }

    fn render(&self, filename: &str) -> GuideResult<Vec<Source>> {
        let snapshot = self
            .state
            .lock()
            .unwrap()
            .exposures
            .get(filename)
            .copied()
            .ok_or_else(|| GuideError::analysis(format!("unknown frame {}", filename)))?;

        let shift = self.truth * Vector2::new(snapshot.pointing.0, snapshot.pointing.1);
        Ok(STARS
            .iter()
            .map(|&(x, y, flux)| Source {
                position: PixelCoord::new(x + shift.x, y + shift.y),
                flux: flux * snapshot.flux_scale,
                size: SimulatedUnit::SHARPEST_SIZE + DEFOCUS_PER_STEP2 * snapshot.defocus.powi(2),
            })
            .collect())
    }
}

struct MountActor(Arc<SimSky>);

#[async_trait]
impl ActorHandler for MountActor {
    async fn handle(&self, request: &CommandRequest, _replies: &ReplySink) -> Result<Body, RemoteError> {
        let sky = &self.0;
        let mut state = sky.state.lock().unwrap();
        state.mount_commands += 1;
        let body = match request.command.as_str() {
            "status" => json!({"ra_j2000_hours": 10.5, "dec_j2000_degs": sky.declination, "is_tracking": true}),
            "offset" => {
                let parse = |key: &str| {
                    request
                        .option(key)
                        .and_then(|v| v.parse::<f64>().ok())
                        .ok_or_else(|| RemoteError::new(RemoteErrorKind::InvalidArgument, key))
                };
                let (ra, dec) = (parse("ra_add_arcsec")?, parse("dec_add_arcsec")?);
                state.offsets.push((ra, dec));
                state.mount_sky.0 += ra * sky.declination.to_radians().cos();
                state.mount_sky.1 += dec;
                json!({})
            }
            other => {
                return Err(RemoteError::new(RemoteErrorKind::NotImplemented, other));
            }
        };
        Ok(body.as_object().cloned().unwrap_or_default())
    }
}

struct CameraActor(Arc<SimSky>);

#[async_trait]
impl ActorHandler for CameraActor {
    async fn handle(&self, request: &CommandRequest, _replies: &ReplySink) -> Result<Body, RemoteError> {
        let delay = self.0.state.lock().unwrap().delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.0.state.lock().unwrap();
        if let Some(reason) = &state.failure {
            return Err(RemoteError::new(RemoteErrorKind::HardwareFault, reason.clone()));
        }
        state.counter += 1;
        let filename = format!("{}_{:05}.fits", request.actor, state.counter);
        let snapshot = Snapshot {
            pointing: (
                state.mount_sky.0 + state.drift.0,
                state.mount_sky.1 + state.drift.1,
            ),
            flux_scale: state.flux_scale,
            defocus: state.focuser_position - state.best_focus,
        };
        state.exposures.insert(filename.clone(), snapshot);

        let body = json!({ "filename": filename });
        Ok(body.as_object().cloned().unwrap_or_default())
    }
}

struct FocuserActor(Arc<SimSky>);

#[async_trait]
impl ActorHandler for FocuserActor {
    async fn handle(&self, request: &CommandRequest, _replies: &ReplySink) -> Result<Body, RemoteError> {
        let delay = self.0.state.lock().unwrap().focuser_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let value = request
            .positional_f64(0)
            .ok_or_else(|| RemoteError::new(RemoteErrorKind::InvalidArgument, "position"))?;
        let mut state = self.0.state.lock().unwrap();
        match request.command.as_str() {
            "moveabsolute" => state.focuser_position = value,
            "moverelative" => state.focuser_position += value,
            other => return Err(RemoteError::new(RemoteErrorKind::NotImplemented, other)),
        }
        state.focuser_moves.push(request.command_line());
        Ok(Body::new())
    }
}

struct DerotatorActor;

#[async_trait]
impl ActorHandler for DerotatorActor {
    async fn handle(&self, _request: &CommandRequest, _replies: &ReplySink) -> Result<Body, RemoteError> {
        Ok(Body::new())
    }
}

pub(crate) struct SimAnalyzer(Arc<SimSky>);

#[async_trait]
impl ImageAnalyzer for SimAnalyzer {
    async fn detect_sources(&self, frame: &Frame) -> GuideResult<Vec<Source>> {
        self.0.render(&frame.filename)
    }

    async fn centroid(&self, frame: &Frame, guesses: &[PixelCoord], _box_px: u32) -> GuideResult<Vec<Option<Source>>> {
        let stars = self.0.render(&frame.filename)?;
        Ok(guesses
            .iter()
            .map(|g| {
                stars
                    .iter()
                    .filter(|s| (s.position.x - g.x).hypot(s.position.y - g.y) < 50.0)
                    .min_by(|a, b| {
                        let da = (a.position.x - g.x).hypot(a.position.y - g.y);
                        let db = (b.position.x - g.x).hypot(b.position.y - g.y);
                        da.total_cmp(&db)
                    })
                    .copied()
            })
            .collect())
    }

    async fn solve(&self, frame: &Frame) -> GuideResult<SkyCoord> {
        Err(GuideError::analysis(format!("{} has no WCS", frame.filename)))
    }
}

/// A unit wired to simulated actors on a [`LocalBus`]
pub(crate) struct SimulatedUnit {
    pub sky: Arc<SimSky>,
    pub unit: Arc<TelescopeUnit>,
    pub analyzer: Arc<SimAnalyzer>,
    pub config: GuiderConfig,
    pub machine: GuideStateMachine,
    truth: Matrix2<f64>,
}

impl SimulatedUnit {
    /// Star size in pixels at best focus
    pub const SHARPEST_SIZE: f64 = 2.8;

    pub fn default_truth() -> Matrix2<f64> {
        Matrix2::new(0.2, 0.4, -0.4, 0.2)
    }

    pub async fn start() -> Self {
        Self::with_truth(Self::default_truth()).await
    }

    pub async fn with_truth(truth: Matrix2<f64>) -> Self {
        Self::build(truth, -30.0).await
    }

    pub async fn at_declination(declination: f64) -> Self {
        Self::build(Self::default_truth(), declination).await
    }

    async fn build(truth: Matrix2<f64>, declination: f64) -> Self {
        let config = Self::config();
        let sky = SimSky::new(declination, truth);
        let bus = Arc::new(LocalBus::new());

        bus.register(config.unit.mount.clone(), Arc::new(MountActor(sky.clone())))
            .await;
        for camera in &config.unit.cameras {
            bus.register(camera.actor.clone(), Arc::new(CameraActor(sky.clone())))
                .await;
        }
        if let Some(name) = &config.unit.focuser {
            bus.register(name.clone(), Arc::new(FocuserActor(sky.clone())))
                .await;
        }
        if let Some(name) = &config.unit.derotator {
            bus.register(name.clone(), Arc::new(DerotatorActor)).await;
        }

        let unit = Arc::new(TelescopeUnit::from_config(&config, bus).unwrap());
        Self {
            analyzer: Arc::new(SimAnalyzer(sky.clone())),
            sky,
            unit,
            machine: GuideStateMachine::new(config.guide.stop_grace()),
            config,
            truth,
        }
    }

    pub fn config() -> GuiderConfig {
        GuiderConfig {
            unit: UnitConfig {
                name: "sim".to_string(),
                mount: "sim.pwi".to_string(),
                focuser: Some("sim.foc".to_string()),
                derotator: Some("sim.km".to_string()),
                cameras: vec![
                    CameraConfig {
                        actor: "sim.agcam.east".to_string(),
                        role: CameraRole::East,
                    },
                    CameraConfig {
                        actor: "sim.agcam.west".to_string(),
                        role: CameraRole::West,
                    },
                ],
            },
            guide: GuideConfig::for_simulation(),
            calibration: CalibrationConfig {
                exptime_secs: 0.01,
                ..CalibrationConfig::default()
            },
            focus: FocusConfig {
                nominal_position: NOMINAL_FOCUS,
                step: 20.0,
                exptime_secs: 0.01,
                ..FocusConfig::default()
            },
            ..GuiderConfig::default()
        }
    }

    pub fn truth(&self) -> CalibrationMatrix {
        CalibrationMatrix::from_pixel_per_arcsec(self.truth).unwrap()
    }

    pub fn strategy(&self) -> Box<dyn OffsetStrategy> {
        build_strategy(&self.config.guide, self.analyzer.clone())
    }
}
