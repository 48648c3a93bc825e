//! Offset estimation
//!
//! An [`OffsetStrategy`] turns guide frames into a reference position and
//! then into offsets from that reference. Image processing itself is done by
//! an [`ImageAnalyzer`] supplied by the host.

mod astrometric;
mod centroid;
mod stars;

pub use astrometric::AstrometricStrategy;
pub use centroid::CentroidStrategy;
pub use stars::{StarDisplacement, StarSet};

use crate::config::{CameraRole, GuideConfig, StrategyKind};
use crate::error::GuideResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A guide camera image as stored by the camera actor
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Frame {
    pub camera: String,
    pub role: CameraRole,
    pub filename: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PixelCoord {
    pub x: f64,
    pub y: f64,
}

impl PixelCoord {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SkyCoord {
    pub ra_deg: f64,
    pub dec_deg: f64,
}

impl SkyCoord {
    pub fn new(ra_deg: f64, dec_deg: f64) -> Self {
        Self { ra_deg, dec_deg }
    }
}

/// A detected or re-centroided star
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub position: PixelCoord,
    pub flux: f64,
    /// Characteristic size (FWHM) in pixels
    pub size: f64,
}

impl Source {
    pub fn is_usable(&self) -> bool {
        self.position.is_finite() && self.flux.is_finite() && self.flux > 0.0
    }
}

/// Telescope position as seen by a strategy
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Position {
    Sky(SkyCoord),
    Pixel(PixelCoord),
}

/// Drift from the reference position
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Offset {
    /// On-sky arcsec, RA already scaled by cos(dec)
    Sky { ra_arcsec: f64, dec_arcsec: f64 },
    /// Star displacement in pixels and field rotation in degrees
    Pixel {
        dx: f64,
        dy: f64,
        rotation_deg: Option<f64>,
    },
}

/// What was measured on one frame
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameMeasurement {
    pub frame: Frame,
    pub sources: Vec<Source>,
    pub solution: Option<SkyCoord>,
}

/// Baseline the guide loop corrects towards
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReferenceFrame {
    pub measurements: Vec<FrameMeasurement>,
    pub position: Position,
}

impl ReferenceFrame {
    pub fn filenames(&self) -> Vec<String> {
        self.measurements
            .iter()
            .map(|m| m.frame.filename.clone())
            .collect()
    }
}

/// Result of one [`OffsetStrategy::find_offset`] call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OffsetMeasurement {
    pub measurements: Vec<FrameMeasurement>,
    pub position: Position,
    pub offset: Offset,
}

/// Image processing consumed by the strategies
#[async_trait]
pub trait ImageAnalyzer: Send + Sync {
    /// Find stars in a frame
    async fn detect_sources(&self, frame: &Frame) -> GuideResult<Vec<Source>>;

    /// Re-centroid around each guess; `None` where no star was found
    async fn centroid(
        &self,
        frame: &Frame,
        guesses: &[PixelCoord],
        box_px: u32,
    ) -> GuideResult<Vec<Option<Source>>>;

    /// Plate-solve the frame center
    async fn solve(&self, frame: &Frame) -> GuideResult<SkyCoord>;
}

#[async_trait]
pub trait OffsetStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Measure the frames and make them the new reference
    async fn establish_reference(&mut self, frames: &[Frame]) -> GuideResult<ReferenceFrame>;

    /// Measure the frames against the reference
    async fn find_offset(&mut self, frames: &[Frame]) -> GuideResult<OffsetMeasurement>;

    fn reference(&self) -> Option<&ReferenceFrame>;
}

/// Strategy selected by the configuration
pub fn build_strategy(config: &GuideConfig, analyzer: Arc<dyn ImageAnalyzer>) -> Box<dyn OffsetStrategy> {
    match config.strategy {
        StrategyKind::Centroid => Box::new(CentroidStrategy::new(analyzer, config)),
        StrategyKind::Astrometric => Box::new(AstrometricStrategy::new(analyzer)),
    }
}

/// Median of the finite values
pub(crate) fn median(values: &[f64]) -> Option<f64> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}
