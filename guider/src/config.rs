//! Guider configuration
//!
//! All sections default sensibly so a config file only needs to name the
//! actors of the telescope unit.

use crate::error::{GuideError, GuideResult};
use autoguide_proxy::ProxyConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Where a guide camera sits in the focal plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraRole {
    East,
    West,
    Center,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Actor name of the camera
    pub actor: String,
    pub role: CameraRole,
}

/// Actors making up one telescope unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitConfig {
    pub name: String,
    pub mount: String,
    pub focuser: Option<String>,
    pub derotator: Option<String>,
    pub cameras: Vec<CameraConfig>,
}

impl Default for UnitConfig {
    fn default() -> Self {
        Self {
            name: "sci".to_string(),
            mount: "lvm.sci.pwi".to_string(),
            focuser: Some("lvm.sci.foc".to_string()),
            derotator: Some("lvm.sci.km".to_string()),
            cameras: vec![
                CameraConfig {
                    actor: "lvm.sci.agcam.east".to_string(),
                    role: CameraRole::East,
                },
                CameraConfig {
                    actor: "lvm.sci.agcam.west".to_string(),
                    role: CameraRole::West,
                },
            ],
        }
    }
}

/// Offset estimation method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Centroid,
    Astrometric,
}

/// Guide loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuideConfig {
    pub strategy: StrategyKind,
    /// Exposure time used when a start request does not give one
    pub exptime_secs: f64,
    /// Longest exposure a start request may ask for
    pub max_exptime_secs: f64,
    /// Pause between loop iterations
    pub loop_interval_ms: u64,
    /// Time a stopping guide task gets before it is cancelled
    pub stop_grace_ms: u64,
    /// Maximum mean fractional flux change between reference and frame
    pub flux_tolerance: f64,
    /// Offsets smaller than this are not sent to the mount
    pub min_offset_px: f64,
    /// Derotations smaller than this are not sent to the derotator
    pub min_rotation_deg: f64,
    /// Fraction of the measured offset applied per correction
    pub correction_gain: f64,
    /// Plate scale used when the unit has not been calibrated
    pub pixel_scale_arcsec: f64,
    /// Camera rotation used when the unit has not been calibrated
    pub rotation_deg: f64,
    /// Brightest sources kept for the reference
    pub max_sources: usize,
    pub min_sources: usize,
    /// Centroiding box edge in pixels
    pub search_box_px: u32,
    /// Status key holding the mount declination in degrees
    pub declination_key: String,
}

impl Default for GuideConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::Centroid,
            exptime_secs: 5.0,
            max_exptime_secs: 300.0,
            loop_interval_ms: 2000,
            stop_grace_ms: 5000,
            flux_tolerance: 0.3,
            min_offset_px: 0.3,
            min_rotation_deg: 0.05,
            correction_gain: 0.8,
            pixel_scale_arcsec: 1.01,
            rotation_deg: 140.0,
            max_sources: 42,
            min_sources: 3,
            search_box_px: 9,
            declination_key: "dec_j2000_degs".to_string(),
        }
    }
}

impl GuideConfig {
    pub fn loop_interval(&self) -> Duration {
        Duration::from_millis(self.loop_interval_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    /// Exposure time for a start request; `None` selects the configured default
    pub fn exposure_time(&self, requested: Option<f64>) -> GuideResult<f64> {
        match requested {
            None => Ok(self.exptime_secs),
            Some(t) if t.is_finite() && t >= 0.0 && t <= self.max_exptime_secs => Ok(t),
            Some(t) => Err(GuideError::InvalidExposure {
                exptime: t,
                max: self.max_exptime_secs,
            }),
        }
    }

    /// Fast settings for simulated hardware
    pub fn for_simulation() -> Self {
        Self {
            exptime_secs: 0.01,
            loop_interval_ms: 20,
            stop_grace_ms: 500,
            ..Self::default()
        }
    }
}

/// Calibration routine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Mount offset per step in arcsec
    pub offset_per_step_arcsec: f64,
    pub num_steps: usize,
    pub exptime_secs: f64,
    /// Measured axes closer than this to parallel are rejected
    pub min_axis_angle_deg: f64,
    /// No calibration is attempted closer to the pole than this
    pub max_abs_dec_deg: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            offset_per_step_arcsec: 5.0,
            num_steps: 3,
            exptime_secs: 5.0,
            min_axis_angle_deg: 10.0,
            max_abs_dec_deg: 85.0,
        }
    }
}

/// Focus series settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FocusConfig {
    /// Focuser position the series is centred on when none is given
    pub nominal_position: f64,
    /// Focuser steps between positions
    pub step: f64,
    /// Positions on each side of the centre
    pub count: usize,
    pub exptime_secs: f64,
    /// Positions with fewer usable sources are left out of the fit
    pub min_sources: usize,
}

impl Default for FocusConfig {
    fn default() -> Self {
        Self {
            nominal_position: 4200.0,
            step: 50.0,
            count: 3,
            exptime_secs: 5.0,
            min_sources: 3,
        }
    }
}

impl FocusConfig {
    /// Focuser positions of a series centred on `centre`
    pub fn positions(&self, centre: f64) -> Vec<f64> {
        let n = self.count as f64;
        (0..=2 * self.count)
            .map(|i| centre + (i as f64 - n) * self.step)
            .collect()
    }
}

/// Complete guider configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GuiderConfig {
    pub unit: UnitConfig,
    pub proxy: ProxyConfig,
    pub guide: GuideConfig,
    pub calibration: CalibrationConfig,
    pub focus: FocusConfig,
}

impl GuiderConfig {
    pub fn from_json(json: &str) -> GuideResult<Self> {
        let config: GuiderConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> GuideResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        tracing::info!("Loading guider config from {}", path.display());
        Self::from_json(&json)
    }

    pub fn validate(&self) -> GuideResult<()> {
        if self.unit.mount.is_empty() {
            return Err(GuideError::Config("unit.mount must name an actor".into()));
        }
        if self.unit.cameras.is_empty() {
            return Err(GuideError::Config("unit.cameras must not be empty".into()));
        }
        if !(self.guide.correction_gain > 0.0 && self.guide.correction_gain <= 1.0) {
            return Err(GuideError::Config(format!(
                "guide.correction_gain must be in (0, 1], got {}",
                self.guide.correction_gain
            )));
        }
        if self.guide.pixel_scale_arcsec <= 0.0 {
            return Err(GuideError::Config("guide.pixel_scale_arcsec must be positive".into()));
        }
        if self.guide.min_sources == 0 || self.guide.min_sources > self.guide.max_sources {
            return Err(GuideError::Config(format!(
                "guide.min_sources must be in 1..={}",
                self.guide.max_sources
            )));
        }
        if let Err(e) = self.guide.exposure_time(Some(self.guide.exptime_secs)) {
            return Err(GuideError::Config(format!("guide.exptime_secs: {}", e)));
        }
        if !(self.calibration.max_abs_dec_deg > 0.0 && self.calibration.max_abs_dec_deg < 90.0) {
            return Err(GuideError::Config(
                "calibration.max_abs_dec_deg must be in (0, 90)".into(),
            ));
        }
        if self.calibration.num_steps == 0 || self.calibration.offset_per_step_arcsec == 0.0 {
            return Err(GuideError::Config(
                "calibration needs at least one non-zero step".into(),
            ));
        }
        if self.focus.count == 0 || !(self.focus.step.is_finite() && self.focus.step > 0.0) {
            return Err(GuideError::Config(
                "focus needs a positive step and at least one position per side".into(),
            ));
        }
        if let Err(e) = self.guide.exposure_time(Some(self.focus.exptime_secs)) {
            return Err(GuideError::Config(format!("focus.exptime_secs: {}", e)));
        }
        Ok(())
    }
}
