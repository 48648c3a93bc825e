//! Offsets from re-centroided reference stars

use super::{
    Frame, ImageAnalyzer, Offset, OffsetMeasurement, OffsetStrategy, PixelCoord, Position, ReferenceFrame, StarSet,
};
use crate::config::GuideConfig;
use crate::error::{GuideError, GuideResult};
use async_trait::async_trait;
use std::sync::Arc;

/// Tracks the brightest stars found on the reference frames.
///
/// Each new frame is centroided at the reference star positions and the
/// offset is the median displacement. A frame whose flux-weighted mean flux
/// differs from the reference by more than the tolerance is rejected as
/// unreliable.
pub struct CentroidStrategy {
    analyzer: Arc<dyn ImageAnalyzer>,
    max_sources: usize,
    min_sources: usize,
    search_box_px: u32,
    flux_tolerance: f64,
    stars: Option<StarSet>,
    reference: Option<ReferenceFrame>,
}

impl CentroidStrategy {
    pub fn new(analyzer: Arc<dyn ImageAnalyzer>, config: &GuideConfig) -> Self {
        Self {
            analyzer,
            max_sources: config.max_sources,
            min_sources: config.min_sources,
            search_box_px: config.search_box_px,
            flux_tolerance: config.flux_tolerance,
            stars: None,
            reference: None,
        }
    }
}

#[async_trait]
impl OffsetStrategy for CentroidStrategy {
    fn name(&self) -> &'static str {
        "centroid"
    }

    async fn establish_reference(&mut self, frames: &[Frame]) -> GuideResult<ReferenceFrame> {
        let (stars, measurements) =
            StarSet::capture(self.analyzer.as_ref(), frames, self.max_sources, self.min_sources).await?;

        let count = stars.len() as f64;
        let (sx, sy) = measurements
            .iter()
            .flat_map(|m| m.sources.iter())
            .fold((0.0, 0.0), |(x, y), s| (x + s.position.x, y + s.position.y));

        let reference = ReferenceFrame {
            measurements,
            position: Position::Pixel(PixelCoord::new(sx / count, sy / count)),
        };
        self.stars = Some(stars);
        self.reference = Some(reference.clone());
        Ok(reference)
    }

    async fn find_offset(&mut self, frames: &[Frame]) -> GuideResult<OffsetMeasurement> {
        let stars = self.stars.as_ref().ok_or(GuideError::NoReference)?;
        let moved = stars
            .measure(self.analyzer.as_ref(), frames, self.search_box_px)
            .await?;

        if moved.flux_change.abs() > self.flux_tolerance {
            return Err(GuideError::UnreliableMeasurement {
                flux_change: moved.flux_change,
                tolerance: self.flux_tolerance,
            });
        }

        Ok(OffsetMeasurement {
            measurements: moved.measurements,
            position: Position::Pixel(moved.mean_position),
            offset: Offset::Pixel {
                dx: moved.dx,
                dy: moved.dy,
                rotation_deg: moved.rotation_deg,
            },
        })
    }

    fn reference(&self) -> Option<&ReferenceFrame> {
        self.reference.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CameraRole;
    use crate::strategy::{SkyCoord, Source};
    use approx::assert_relative_eq;
    use std::sync::Mutex;

    struct Drifting {
        shift: Mutex<(f64, f64)>,
        flux_scale: Mutex<f64>,
    }

    const STARS: [(f64, f64, f64); 5] = [
        (50.0, 60.0, 8000.0),
        (210.0, 80.0, 3000.0),
        (130.0, 300.0, 1500.0),
        (400.0, 250.0, 900.0),
        (320.0, 420.0, 400.0),
    ];

    #[async_trait]
    impl ImageAnalyzer for Drifting {
        async fn detect_sources(&self, _frame: &Frame) -> GuideResult<Vec<Source>> {
            Ok(STARS
                .iter()
                .map(|&(x, y, flux)| Source {
                    position: PixelCoord::new(x, y),
                    flux,
                    size: 3.0,
                })
                .collect())
        }

        async fn centroid(&self, _frame: &Frame, guesses: &[PixelCoord], _box_px: u32) -> GuideResult<Vec<Option<Source>>> {
            let (dx, dy) = *self.shift.lock().unwrap();
            let scale = *self.flux_scale.lock().unwrap();
            Ok(guesses
                .iter()
                .map(|g| {
                    STARS.iter().find(|s| s.0 == g.x && s.1 == g.y).map(|&(x, y, flux)| Source {
                        position: PixelCoord::new(x + dx, y + dy),
                        flux: flux * scale,
                        size: 3.0,
                    })
                })
                .collect())
        }

        async fn solve(&self, _frame: &Frame) -> GuideResult<SkyCoord> {
            Err(GuideError::analysis("no wcs"))
        }
    }

    fn frames() -> Vec<Frame> {
        vec![Frame {
            camera: "agcam.center".to_string(),
            role: CameraRole::Center,
            filename: "center_0001.fits".to_string(),
        }]
    }

    fn strategy() -> (Arc<Drifting>, CentroidStrategy) {
        let analyzer = Arc::new(Drifting {
            shift: Mutex::new((0.0, 0.0)),
            flux_scale: Mutex::new(1.0),
        });
        let config = GuideConfig {
            max_sources: 4,
            ..GuideConfig::default()
        };
        let strategy = CentroidStrategy::new(analyzer.clone(), &config);
        (analyzer, strategy)
    }

    #[tokio::test]
    async fn test_median_displacement() {
        let (analyzer, mut strategy) = strategy();
        let reference = strategy.establish_reference(&frames()).await.unwrap();
        assert_eq!(reference.measurements[0].sources.len(), 4);
        assert!(strategy.reference().is_some());

        *analyzer.shift.lock().unwrap() = (0.7, -1.2);
        let measured = strategy.find_offset(&frames()).await.unwrap();
        match measured.offset {
            Offset::Pixel { dx, dy, .. } => {
                assert_relative_eq!(dx, 0.7, epsilon = 1e-9);
                assert_relative_eq!(dy, -1.2, epsilon = 1e-9);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_flux_guard() {
        let (analyzer, mut strategy) = strategy();
        strategy.establish_reference(&frames()).await.unwrap();

        *analyzer.flux_scale.lock().unwrap() = 0.5;
        match strategy.find_offset(&frames()).await {
            Err(e @ GuideError::UnreliableMeasurement { .. }) => assert!(e.is_recoverable()),
            other => panic!("unexpected {:?}", other),
        }

        *analyzer.flux_scale.lock().unwrap() = 0.9;
        assert!(strategy.find_offset(&frames()).await.is_ok());
    }

    #[tokio::test]
    async fn test_offset_needs_reference() {
        let (_, mut strategy) = strategy();
        assert!(matches!(
            strategy.find_offset(&frames()).await,
            Err(GuideError::NoReference)
        ));
    }
}
