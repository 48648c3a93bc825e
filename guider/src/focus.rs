//! Focus series
//!
//! Steps the focuser through `2 * count + 1` positions around a centre,
//! takes the median source size over all guide cameras at each position and
//! fits a parabola through the sizes. The vertex is the best focus.

use crate::config::FocusConfig;
use crate::error::{GuideError, GuideResult};
use crate::strategy::ImageAnalyzer;
use crate::unit::{FocuserClient, TelescopeUnit};
use autoguide_proxy::invoke;
use chrono::{DateTime, Utc};
use nalgebra::{Matrix3, Vector3};
use serde::Serialize;
use std::sync::Arc;

pub(crate) const FOCUSER_UNIT: &str = "STEPS";

/// Median source size measured at one focuser position
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FocusPoint {
    pub position: f64,
    pub median_size: f64,
    pub sources: usize,
}

/// Parabola `size = a*u^2 + b*u + c` in `u = position - centre`
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FocusCurve {
    pub centre: f64,
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub r_squared: f64,
}

impl FocusCurve {
    /// Least-squares fit through at least three points.
    ///
    /// Fails when the curve has no minimum.
    pub fn fit(points: &[FocusPoint], centre: f64) -> GuideResult<Self> {
        if points.len() < 3 {
            return Err(GuideError::FocusFit(format!(
                "need 3 measured positions, got {}",
                points.len()
            )));
        }

        let mut normal = Matrix3::<f64>::zeros();
        let mut rhs = Vector3::<f64>::zeros();
        for p in points {
            let u = p.position - centre;
            let row = Vector3::new(u * u, u, 1.0);
            normal += row * row.transpose();
            rhs += row * p.median_size;
        }
        let coeffs = normal
            .lu()
            .solve(&rhs)
            .ok_or_else(|| GuideError::FocusFit("positions do not span a parabola".into()))?;

        let (a, b, c) = (coeffs[0], coeffs[1], coeffs[2]);
        if !(a > 0.0) {
            return Err(GuideError::FocusFit(format!("curve opens downward (a={:.3e})", a)));
        }

        let mean = points.iter().map(|p| p.median_size).sum::<f64>() / points.len() as f64;
        let (mut ss_tot, mut ss_res) = (0.0, 0.0);
        for p in points {
            let u = p.position - centre;
            ss_tot += (p.median_size - mean).powi(2);
            ss_res += (p.median_size - (a * u * u + b * u + c)).powi(2);
        }
        let r_squared = if ss_tot > 0.0 { (1.0 - ss_res / ss_tot).max(0.0) } else { 0.0 };

        Ok(Self {
            centre,
            a,
            b,
            c,
            r_squared,
        })
    }

    pub fn vertex(&self) -> f64 {
        self.centre - self.b / (2.0 * self.a)
    }

    pub fn size_at(&self, position: f64) -> f64 {
        let u = position - self.centre;
        self.a * u * u + self.b * u + self.c
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FocusReport {
    pub unit: String,
    pub best_position: f64,
    pub best_size: f64,
    pub curve: FocusCurve,
    pub points: Vec<FocusPoint>,
    pub completed_at: DateTime<Utc>,
}

pub struct FocusSeries {
    unit: Arc<TelescopeUnit>,
    analyzer: Arc<dyn ImageAnalyzer>,
    config: FocusConfig,
}

impl FocusSeries {
    pub fn new(unit: Arc<TelescopeUnit>, analyzer: Arc<dyn ImageAnalyzer>, config: &FocusConfig) -> Self {
        Self {
            unit,
            analyzer,
            config: config.clone(),
        }
    }

    /// Run the series around `centre` and leave the focuser at the best focus.
    ///
    /// When no best focus is found the focuser goes back to `centre`.
    pub async fn run(&self, centre: Option<f64>) -> GuideResult<FocusReport> {
        let focuser = self.unit.focuser().ok_or(GuideError::MissingDevice("focuser"))?;
        let centre = centre.unwrap_or(self.config.nominal_position);
        let positions = self.config.positions(centre);
        tracing::info!(
            "{}: focus series of {} positions around {} {}",
            self.unit.name(),
            positions.len(),
            centre,
            FOCUSER_UNIT
        );

        let fitted = async {
            let mut points = Vec::with_capacity(positions.len());
            for &position in &positions {
                if let Some(point) = self.measure(focuser, position).await? {
                    points.push(point);
                }
            }
            let curve = FocusCurve::fit(&points, centre)?;
            let best = curve.vertex();
            let (low, high) = (positions[0], positions[positions.len() - 1]);
            if !(low..=high).contains(&best) {
                return Err(GuideError::FocusFit(format!(
                    "best focus {:.1} outside scanned range {}..={}",
                    best, low, high
                )));
            }
            Ok::<_, GuideError>((points, curve))
        }
        .await;

        let (points, curve) = match fitted {
            Ok(fitted) => fitted,
            Err(e) => {
                tracing::warn!("{}: focus series failed: {}", self.unit.name(), e);
                if let Err(back) = invoke(vec![focuser.move_absolute(centre, FOCUSER_UNIT)]).await {
                    tracing::error!("{}: could not return focuser to {}: {}", self.unit.name(), centre, back);
                }
                return Err(e);
            }
        };

        let best = curve.vertex();
        invoke(vec![focuser.move_absolute(best, FOCUSER_UNIT)]).await?;
        tracing::info!(
            "{}: best focus {:.1} (size {:.2} px, r2={:.3})",
            self.unit.name(),
            best,
            curve.size_at(best),
            curve.r_squared
        );

        Ok(FocusReport {
            unit: self.unit.name().to_string(),
            best_position: best,
            best_size: curve.size_at(best),
            curve,
            points,
            completed_at: Utc::now(),
        })
    }

    async fn measure(&self, focuser: &FocuserClient, position: f64) -> GuideResult<Option<FocusPoint>> {
        invoke(vec![focuser.move_absolute(position, FOCUSER_UNIT)]).await?;
        let frames = self.unit.expose_all(self.config.exptime_secs).await?;

        let mut sizes = Vec::new();
        for frame in &frames {
            let sources = self.analyzer.detect_sources(frame).await?;
            sizes.extend(
                sources
                    .iter()
                    .filter(|s| s.is_usable() && s.size.is_finite() && s.size > 0.0)
                    .map(|s| s.size),
            );
        }

        if sizes.is_empty() || sizes.len() < self.config.min_sources {
            tracing::warn!(
                "{}: {} usable sources at focus {}, skipping",
                self.unit.name(),
                sizes.len(),
                position
            );
            return Ok(None);
        }
        let median_size = median(&mut sizes);
        tracing::debug!("focus {}: median size {:.3} from {} sources", position, median_size, sizes.len());
        Ok(Some(FocusPoint {
            position,
            median_size,
            sources: sizes.len(),
        }))
    }
}

fn median(values: &mut [f64]) -> f64 {
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::SimulatedUnit;
    use approx::assert_relative_eq;

    fn series(sim: &SimulatedUnit) -> FocusSeries {
        FocusSeries::new(sim.unit.clone(), sim.analyzer.clone(), &sim.config.focus)
    }

    fn point(position: f64, median_size: f64) -> FocusPoint {
        FocusPoint {
            position,
            median_size,
            sources: 6,
        }
    }

    #[test]
    fn test_median() {
        assert_eq!(median(&mut [3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(&mut [4.0, 1.0, 3.0, 2.0]), 2.5);
    }

    #[test]
    fn test_curve_vertex() {
        let points: Vec<FocusPoint> = [900.0, 950.0, 1000.0, 1050.0, 1100.0]
            .iter()
            .map(|&x| point(x, 2.5 + 1e-4 * (x - 1020.0).powi(2)))
            .collect();
        let curve = FocusCurve::fit(&points, 1000.0).unwrap();
        assert_relative_eq!(curve.vertex(), 1020.0, epsilon = 1e-6);
        assert_relative_eq!(curve.size_at(1020.0), 2.5, epsilon = 1e-9);
        assert_relative_eq!(curve.r_squared, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_curve_without_minimum() {
        let points = [point(0.0, 3.0), point(10.0, 4.0), point(20.0, 3.0)];
        assert!(matches!(FocusCurve::fit(&points, 10.0), Err(GuideError::FocusFit(_))));
        assert!(matches!(FocusCurve::fit(&points[..2], 10.0), Err(GuideError::FocusFit(_))));
    }

    #[tokio::test]
    async fn test_recovers_best_focus() {
        let sim = SimulatedUnit::start().await;
        sim.sky.set_best_focus(4030.0);

        let report = series(&sim).run(Some(4000.0)).await.unwrap();
        assert_eq!(report.points.len(), 7);
        assert_relative_eq!(report.points[0].position, 3940.0);
        assert_relative_eq!(report.best_position, 4030.0, epsilon = 1e-6);
        assert_relative_eq!(report.best_size, SimulatedUnit::SHARPEST_SIZE, epsilon = 1e-6);
        assert_relative_eq!(sim.sky.focuser_position(), 4030.0, epsilon = 1e-6);
        // seven series positions and the final move
        assert_eq!(sim.sky.focuser_moves().len(), 8);
    }

    #[tokio::test]
    async fn test_best_focus_outside_scan_returns_to_centre() {
        let sim = SimulatedUnit::start().await;
        sim.sky.set_best_focus(9000.0);

        let err = series(&sim).run(Some(4000.0)).await.unwrap_err();
        assert!(matches!(err, GuideError::FocusFit(_)));
        assert_relative_eq!(sim.sky.focuser_position(), 4000.0);
    }

    #[tokio::test]
    async fn test_exposure_failure_returns_to_centre() {
        let sim = SimulatedUnit::start().await;
        sim.sky.fail_exposures("shutter stuck");

        let err = series(&sim).run(None).await.unwrap_err();
        assert!(matches!(err, GuideError::Proxy(_)));
        assert_relative_eq!(sim.sky.focuser_position(), sim.config.focus.nominal_position);
        assert_eq!(sim.sky.focuser_moves().len(), 2);
    }
}
