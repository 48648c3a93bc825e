//! Offsets from plate solutions

use super::{
    Frame, FrameMeasurement, ImageAnalyzer, Offset, OffsetMeasurement, OffsetStrategy, Position, ReferenceFrame,
    SkyCoord,
};
use crate::config::CameraRole;
use crate::error::{GuideError, GuideResult};
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;

/// Plate-solves every frame and tracks the pointing between the cameras.
///
/// With an east/west pair the pointing is the great-circle midpoint of the
/// two solutions. A single camera, or a center camera without a full pair,
/// is used directly.
pub struct AstrometricStrategy {
    analyzer: Arc<dyn ImageAnalyzer>,
    reference: Option<ReferenceFrame>,
    reference_pointing: Option<SkyCoord>,
}

impl AstrometricStrategy {
    pub fn new(analyzer: Arc<dyn ImageAnalyzer>) -> Self {
        Self {
            analyzer,
            reference: None,
            reference_pointing: None,
        }
    }

    async fn solve_all(&self, frames: &[Frame]) -> GuideResult<(Vec<FrameMeasurement>, SkyCoord)> {
        let analyzer = self.analyzer.as_ref();
        let solutions = join_all(frames.iter().map(|f| analyzer.solve(f))).await;

        let mut measurements = Vec::with_capacity(frames.len());
        for (frame, solution) in frames.iter().zip(solutions) {
            let solution = solution?;
            tracing::debug!(
                "{} solved at ra={:.6} dec={:.6}",
                frame.camera,
                solution.ra_deg,
                solution.dec_deg
            );
            measurements.push(FrameMeasurement {
                frame: frame.clone(),
                sources: Vec::new(),
                solution: Some(solution),
            });
        }

        let pointing = pointing(&measurements)?;
        Ok((measurements, pointing))
    }
}

#[async_trait]
impl OffsetStrategy for AstrometricStrategy {
    fn name(&self) -> &'static str {
        "astrometric"
    }

    async fn establish_reference(&mut self, frames: &[Frame]) -> GuideResult<ReferenceFrame> {
        let (measurements, pointing) = self.solve_all(frames).await?;
        let reference = ReferenceFrame {
            measurements,
            position: Position::Sky(pointing),
        };
        self.reference = Some(reference.clone());
        self.reference_pointing = Some(pointing);
        Ok(reference)
    }

    async fn find_offset(&mut self, frames: &[Frame]) -> GuideResult<OffsetMeasurement> {
        let reference = self.reference_pointing.ok_or(GuideError::NoReference)?;
        let (measurements, current) = self.solve_all(frames).await?;
        let (ra_arcsec, dec_arcsec) = sky_offset(&reference, &current);
        Ok(OffsetMeasurement {
            measurements,
            position: Position::Sky(current),
            offset: Offset::Sky {
                ra_arcsec,
                dec_arcsec,
            },
        })
    }

    fn reference(&self) -> Option<&ReferenceFrame> {
        self.reference.as_ref()
    }
}

fn pointing(measurements: &[FrameMeasurement]) -> GuideResult<SkyCoord> {
    let solved = |role: CameraRole| {
        measurements
            .iter()
            .find(|m| m.frame.role == role)
            .and_then(|m| m.solution)
    };

    if let (Some(east), Some(west)) = (solved(CameraRole::East), solved(CameraRole::West)) {
        return midpoint(&east, &west);
    }
    if let [only] = measurements {
        if let Some(solution) = only.solution {
            return Ok(solution);
        }
    }
    if let Some(center) = solved(CameraRole::Center) {
        return Ok(center);
    }

    let cameras: Vec<&str> = measurements.iter().map(|m| m.frame.camera.as_str()).collect();
    Err(GuideError::UnsupportedCameraSet(format!(
        "cannot derive pointing from [{}]",
        cameras.join(", ")
    )))
}

fn to_unit_vector(c: &SkyCoord) -> [f64; 3] {
    let (ra, dec) = (c.ra_deg.to_radians(), c.dec_deg.to_radians());
    [dec.cos() * ra.cos(), dec.cos() * ra.sin(), dec.sin()]
}

/// Great-circle midpoint of two positions
pub(crate) fn midpoint(a: &SkyCoord, b: &SkyCoord) -> GuideResult<SkyCoord> {
    let (u, v) = (to_unit_vector(a), to_unit_vector(b));
    let sum = [u[0] + v[0], u[1] + v[1], u[2] + v[2]];
    let norm = (sum[0] * sum[0] + sum[1] * sum[1] + sum[2] * sum[2]).sqrt();
    if norm < 1e-12 {
        return Err(GuideError::analysis("solutions are antipodal"));
    }

    let dec = (sum[2] / norm).clamp(-1.0, 1.0).asin().to_degrees();
    let ra = sum[1].atan2(sum[0]).to_degrees().rem_euclid(360.0);
    Ok(SkyCoord::new(ra, dec))
}

/// On-sky offset of `current` from `reference` in arcsec
pub(crate) fn sky_offset(reference: &SkyCoord, current: &SkyCoord) -> (f64, f64) {
    let mut d_ra = current.ra_deg - reference.ra_deg;
    if d_ra > 180.0 {
        d_ra -= 360.0;
    } else if d_ra < -180.0 {
        d_ra += 360.0;
    }
    let ra_arcsec = d_ra * reference.dec_deg.to_radians().cos() * 3600.0;
    let dec_arcsec = (current.dec_deg - reference.dec_deg) * 3600.0;
    (ra_arcsec, dec_arcsec)
}
