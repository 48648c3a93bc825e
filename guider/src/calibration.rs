//! Pixel/sky calibration
//!
//! Steps the mount along Dec and then RA, measuring how a fixed set of stars
//! moves on the guide cameras. The displacement per arcsec of each axis is
//! fitted by least squares through the origin and the two axis vectors form
//! the unit's [`CalibrationMatrix`].

use crate::config::{CalibrationConfig, GuideConfig};
use crate::correction::mount_ra_arcsec;
use crate::error::{GuideError, GuideResult};
use crate::matrix::{CalibrationMatrix, MatrixSummary};
use crate::strategy::{ImageAnalyzer, StarSet};
use crate::unit::TelescopeUnit;
use autoguide_proxy::invoke;
use chrono::{DateTime, Utc};
use nalgebra::Vector2;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    Ra,
    Dec,
}

/// Star displacement after `step` cumulative offsets along `axis`
#[derive(Debug, Clone, Serialize)]
pub struct CalibrationSample {
    pub axis: Axis,
    pub step: usize,
    /// Cumulative on-sky offset in arcsec
    pub offset_arcsec: f64,
    pub dx: f64,
    pub dy: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CalibrationReport {
    pub unit: String,
    pub declination_deg: f64,
    /// Pixel displacement per arcsec of RA offset
    pub ra_axis: [f64; 2],
    /// Pixel displacement per arcsec of Dec offset
    pub dec_axis: [f64; 2],
    pub matrix: MatrixSummary,
    pub samples: Vec<CalibrationSample>,
    pub completed_at: DateTime<Utc>,
}

pub struct Calibrator {
    unit: Arc<TelescopeUnit>,
    analyzer: Arc<dyn ImageAnalyzer>,
    guide: GuideConfig,
    config: CalibrationConfig,
}

impl Calibrator {
    pub fn new(
        unit: Arc<TelescopeUnit>,
        analyzer: Arc<dyn ImageAnalyzer>,
        guide: &GuideConfig,
        config: &CalibrationConfig,
    ) -> Self {
        Self {
            unit,
            analyzer,
            guide: guide.clone(),
            config: config.clone(),
        }
    }

    /// Run the calibration and store the resulting matrix on the unit.
    ///
    /// On failure the unit keeps its previous matrix.
    pub async fn run(&self) -> GuideResult<CalibrationReport> {
        let declination = self
            .unit
            .mount()
            .declination(&self.guide.declination_key)
            .await?;
        if !(declination.abs() <= self.config.max_abs_dec_deg) {
            return Err(GuideError::DeclinationLimit {
                declination,
                limit: self.config.max_abs_dec_deg,
            });
        }
        tracing::info!(
            "{}: calibrating at dec={:.3} with {} steps of {}\"",
            self.unit.name(),
            declination,
            self.config.num_steps,
            self.config.offset_per_step_arcsec
        );

        let frames = self.unit.expose_all(self.config.exptime_secs).await?;
        let (stars, _) = StarSet::capture(
            self.analyzer.as_ref(),
            &frames,
            self.guide.max_sources,
            self.guide.min_sources,
        )
        .await?;

        let dec_samples = self.walk(Axis::Dec, &stars, declination).await?;
        let ra_samples = self.walk(Axis::Ra, &stars, declination).await?;

        let dec_axis = fit_axis(&dec_samples, self.config.offset_per_step_arcsec);
        let ra_axis = fit_axis(&ra_samples, self.config.offset_per_step_arcsec);
        let matrix = CalibrationMatrix::from_axes(ra_axis, dec_axis, self.config.min_axis_angle_deg)?;
        self.unit.set_calibration(matrix).await;

        let mut samples = dec_samples;
        samples.extend(ra_samples);
        Ok(CalibrationReport {
            unit: self.unit.name().to_string(),
            declination_deg: declination,
            ra_axis: [ra_axis.x, ra_axis.y],
            dec_axis: [dec_axis.x, dec_axis.y],
            matrix: matrix.summary(),
            samples,
            completed_at: Utc::now(),
        })
    }

    /// Step along one axis, then undo the cumulative offset in one command
    async fn walk(&self, axis: Axis, stars: &StarSet, declination: f64) -> GuideResult<Vec<CalibrationSample>> {
        let step = self.config.offset_per_step_arcsec;
        let (ra_step, dec_step) = match axis {
            Axis::Ra => (mount_ra_arcsec(step, declination), 0.0),
            Axis::Dec => (0.0, step),
        };
        let mount = self.unit.mount();

        let mut samples = vec![CalibrationSample {
            axis,
            step: 0,
            offset_arcsec: 0.0,
            dx: 0.0,
            dy: 0.0,
        }];
        let mut taken = 0usize;

        let stepped = async {
            for i in 1..=self.config.num_steps {
                invoke(vec![mount.offset(ra_step, dec_step)]).await?;
                taken = i;

                let frames = self.unit.expose_all(self.config.exptime_secs).await?;
                let moved = stars
                    .measure(self.analyzer.as_ref(), &frames, self.guide.search_box_px)
                    .await?;
                if moved.flux_change.abs() > self.guide.flux_tolerance {
                    return Err(GuideError::UnreliableMeasurement {
                        flux_change: moved.flux_change,
                        tolerance: self.guide.flux_tolerance,
                    });
                }

                tracing::debug!(
                    "{:?} step {}: dx={:.3} dy={:.3}",
                    axis,
                    i,
                    moved.dx,
                    moved.dy
                );
                samples.push(CalibrationSample {
                    axis,
                    step: i,
                    offset_arcsec: step * i as f64,
                    dx: moved.dx,
                    dy: moved.dy,
                });
            }
            Ok::<(), GuideError>(())
        }
        .await;

        let undone = if taken > 0 {
            let n = taken as f64;
            invoke(vec![mount.offset(-ra_step * n, -dec_step * n)])
                .await
                .map(|_| ())
        } else {
            Ok(())
        };

        match (stepped, undone) {
            (Ok(()), Ok(())) => Ok(samples),
            (Ok(()), Err(e)) => Err(e.into()),
            (Err(e), undone) => {
                if let Err(undo_err) = undone {
                    tracing::error!("{}: could not undo {:?} offset: {}", self.unit.name(), axis, undo_err);
                }
                tracing::warn!("{}: calibration aborted on {:?}: {}", self.unit.name(), axis, e);
                Err(e)
            }
        }
    }
}

/// Least-squares slope through the origin against step index, per arcsec.
///
/// The zero sample carries no information and is left out.
fn fit_axis(samples: &[CalibrationSample], step_arcsec: f64) -> Vector2<f64> {
    let (mut sx, mut sy, mut sii) = (0.0, 0.0, 0.0);
    for s in samples.iter().filter(|s| s.step > 0) {
        let i = s.step as f64;
        sx += i * s.dx;
        sy += i * s.dy;
        sii += i * i;
    }
    if sii == 0.0 {
        return Vector2::zeros();
    }
    Vector2::new(sx / sii / step_arcsec, sy / sii / step_arcsec)
}
