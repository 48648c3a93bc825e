//! Fixed star sets tracked across frames

use super::{median, Frame, FrameMeasurement, ImageAnalyzer, PixelCoord, Source};
use crate::error::{GuideError, GuideResult};
use futures::future::join_all;

/// Stars below this distance from the field centroid carry no rotation signal
const MIN_ROTATION_RADIUS_PX: f64 = 5.0;

#[derive(Debug, Clone)]
struct CameraStars {
    camera: String,
    stars: Vec<Source>,
}

/// The brightest stars of each camera at the time of capture
#[derive(Debug, Clone)]
pub struct StarSet {
    cameras: Vec<CameraStars>,
    min_sources: usize,
}

/// Movement of a [`StarSet`] between capture and a later frame set
#[derive(Debug, Clone)]
pub struct StarDisplacement {
    /// Median displacement in pixels
    pub dx: f64,
    pub dy: f64,
    /// Median field rotation in degrees, when there were enough stars
    pub rotation_deg: Option<f64>,
    /// Flux-weighted mean fractional flux change
    pub flux_change: f64,
    /// Stars found again
    pub matched: usize,
    /// Mean position of the matched stars
    pub mean_position: PixelCoord,
    pub measurements: Vec<FrameMeasurement>,
}

impl StarSet {
    /// Detect the brightest `max_sources` stars on each frame
    pub async fn capture(
        analyzer: &dyn ImageAnalyzer,
        frames: &[Frame],
        max_sources: usize,
        min_sources: usize,
    ) -> GuideResult<(Self, Vec<FrameMeasurement>)> {
        let detections = join_all(frames.iter().map(|f| analyzer.detect_sources(f))).await;

        let mut cameras = Vec::with_capacity(frames.len());
        let mut measurements = Vec::with_capacity(frames.len());
        for (frame, detected) in frames.iter().zip(detections) {
            let mut stars: Vec<Source> = detected?.into_iter().filter(Source::is_usable).collect();
            stars.sort_by(|a, b| b.flux.total_cmp(&a.flux));
            stars.truncate(max_sources);

            if stars.len() < min_sources {
                return Err(GuideError::NotEnoughSources {
                    camera: frame.camera.clone(),
                    found: stars.len(),
                    required: min_sources,
                });
            }
            tracing::debug!("{}: tracking {} stars", frame.camera, stars.len());

            cameras.push(CameraStars {
                camera: frame.camera.clone(),
                stars: stars.clone(),
            });
            measurements.push(FrameMeasurement {
                frame: frame.clone(),
                sources: stars,
                solution: None,
            });
        }

        Ok((
            Self {
                cameras,
                min_sources,
            },
            measurements,
        ))
    }

    pub fn len(&self) -> usize {
        self.cameras.iter().map(|c| c.stars.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Re-centroid the captured stars on `frames` and reduce their movement
    pub async fn measure(
        &self,
        analyzer: &dyn ImageAnalyzer,
        frames: &[Frame],
        box_px: u32,
    ) -> GuideResult<StarDisplacement> {
        let mut jobs = Vec::with_capacity(self.cameras.len());
        for camera in &self.cameras {
            let frame = frames
                .iter()
                .find(|f| f.camera == camera.camera)
                .ok_or_else(|| GuideError::UnsupportedCameraSet(format!("no frame from {}", camera.camera)))?;
            jobs.push((camera, frame));
        }

        let results = join_all(jobs.iter().map(|(camera, frame)| {
            let guesses: Vec<PixelCoord> = camera.stars.iter().map(|s| s.position).collect();
            async move { analyzer.centroid(frame, &guesses, box_px).await }
        }))
        .await;

        let mut dxs = Vec::new();
        let mut dys = Vec::new();
        let mut rotations = Vec::new();
        let mut flux_sum = 0.0;
        let mut weight_sum = 0.0;
        let mut plain_sum = 0.0;
        let mut position_sum = PixelCoord::default();
        let mut measurements = Vec::with_capacity(jobs.len());

        for ((camera, frame), found) in jobs.iter().zip(results) {
            let found = found?;
            let pairs: Vec<(&Source, Source)> = camera
                .stars
                .iter()
                .zip(found)
                .filter_map(|(reference, current)| current.filter(Source::is_usable).map(|c| (reference, c)))
                .collect();

            if pairs.len() < self.min_sources {
                return Err(GuideError::NotEnoughSources {
                    camera: camera.camera.clone(),
                    found: pairs.len(),
                    required: self.min_sources,
                });
            }

            for (reference, current) in &pairs {
                dxs.push(current.position.x - reference.position.x);
                dys.push(current.position.y - reference.position.y);

                let change = current.flux / reference.flux - 1.0;
                let weight = (2.5 * (reference.flux * 10.0).log10()).max(0.0);
                flux_sum += weight * change;
                weight_sum += weight;
                plain_sum += change;

                position_sum.x += current.position.x;
                position_sum.y += current.position.y;
            }
            rotations.extend(rotation_samples(&pairs));

            measurements.push(FrameMeasurement {
                frame: (*frame).clone(),
                sources: pairs.into_iter().map(|(_, c)| c).collect(),
                solution: None,
            });
        }

        let matched = dxs.len();
        let flux_change = if weight_sum > 0.0 {
            flux_sum / weight_sum
        } else {
            plain_sum / matched.max(1) as f64
        };

        Ok(StarDisplacement {
            dx: median(&dxs).unwrap_or(0.0),
            dy: median(&dys).unwrap_or(0.0),
            rotation_deg: median(&rotations),
            flux_change,
            matched,
            mean_position: PixelCoord::new(
                position_sum.x / matched.max(1) as f64,
                position_sum.y / matched.max(1) as f64,
            ),
            measurements,
        })
    }
}

/// Per-star change of position angle about the field centroid, in degrees
fn rotation_samples(pairs: &[(&Source, Source)]) -> Vec<f64> {
    if pairs.len() < 2 {
        return Vec::new();
    }
    let n = pairs.len() as f64;
    let (rx, ry) = pairs
        .iter()
        .fold((0.0, 0.0), |(x, y), (r, _)| (x + r.position.x, y + r.position.y));
    let (cx, cy) = pairs
        .iter()
        .fold((0.0, 0.0), |(x, y), (_, c)| (x + c.position.x, y + c.position.y));
    let (rx, ry, cx, cy) = (rx / n, ry / n, cx / n, cy / n);

    pairs
        .iter()
        .filter_map(|(r, c)| {
            let (ux, uy) = (r.position.x - rx, r.position.y - ry);
            let (vx, vy) = (c.position.x - cx, c.position.y - cy);
            if ux.hypot(uy) < MIN_ROTATION_RADIUS_PX || vx.hypot(vy) < MIN_ROTATION_RADIUS_PX {
                return None;
            }
            let mut delta = (vy.atan2(vx) - uy.atan2(ux)).to_degrees();
            if delta > 180.0 {
                delta -= 360.0;
            } else if delta < -180.0 {
                delta += 360.0;
            }
            Some(delta)
        })
        .collect()
}
