//! Pixel/sky calibration matrix
//!
//! Columns of the forward matrix are the pixel displacement per arcsec of
//! on-sky offset along RA and Dec. Its inverse maps a pixel drift back to
//! the sky offset that would have produced it.

use crate::error::{GuideError, GuideResult};
use nalgebra::{Matrix2, Vector2};
use serde::Serialize;

/// Determinants below this are treated as singular
const DETERMINANT_EPSILON: f64 = 1e-10;

/// Calibrated mapping between pixel offsets and on-sky arcsec
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationMatrix {
    pixel_per_arcsec: Matrix2<f64>,
    arcsec_per_pixel: Matrix2<f64>,
}

impl CalibrationMatrix {
    /// Build from the measured RA and Dec axis vectors (pixels per arcsec).
    ///
    /// Fails when the axes are closer than `min_axis_angle_deg` to parallel
    /// or the matrix cannot be inverted.
    pub fn from_axes(ra_axis: Vector2<f64>, dec_axis: Vector2<f64>, min_axis_angle_deg: f64) -> GuideResult<Self> {
        let angle = angle_between(&ra_axis, &dec_axis);
        let valid = min_axis_angle_deg..=(180.0 - min_axis_angle_deg);
        if !valid.contains(&angle) {
            return Err(GuideError::SingularCalibration(format!(
                "RA and Dec axes are {:.2}° apart",
                angle
            )));
        }
        Self::from_pixel_per_arcsec(Matrix2::from_columns(&[ra_axis, dec_axis]))
    }

    pub fn from_pixel_per_arcsec(matrix: Matrix2<f64>) -> GuideResult<Self> {
        let arcsec_per_pixel = invert(&matrix)?;
        Ok(Self {
            pixel_per_arcsec: matrix,
            arcsec_per_pixel,
        })
    }

    /// Nominal mapping from plate scale and camera rotation
    pub fn from_plate(scale_arcsec: f64, rotation_deg: f64) -> GuideResult<Self> {
        let (s, c) = rotation_deg.to_radians().sin_cos();
        let arcsec_per_pixel = Matrix2::new(c, -s, s, c) * scale_arcsec;
        let pixel_per_arcsec = invert(&arcsec_per_pixel)?;
        Ok(Self {
            pixel_per_arcsec,
            arcsec_per_pixel,
        })
    }

    /// On-sky offset `(ra, dec)` in arcsec for a pixel displacement
    pub fn pixel_to_sky(&self, dx: f64, dy: f64) -> (f64, f64) {
        let sky = self.arcsec_per_pixel * Vector2::new(dx, dy);
        (sky.x, sky.y)
    }

    /// Pixel displacement for an on-sky offset in arcsec
    pub fn sky_to_pixel(&self, ra_arcsec: f64, dec_arcsec: f64) -> (f64, f64) {
        let px = self.pixel_per_arcsec * Vector2::new(ra_arcsec, dec_arcsec);
        (px.x, px.y)
    }

    pub fn determinant(&self) -> f64 {
        self.pixel_per_arcsec.determinant()
    }

    /// Mean pixel scale in arcsec per pixel
    pub fn mean_scale(&self) -> f64 {
        self.determinant().abs().sqrt().recip()
    }

    /// Rows of the forward matrix: `[[x_ra, x_dec], [y_ra, y_dec]]`
    pub fn pixel_per_arcsec_rows(&self) -> [[f64; 2]; 2] {
        rows(&self.pixel_per_arcsec)
    }

    pub fn arcsec_per_pixel_rows(&self) -> [[f64; 2]; 2] {
        rows(&self.arcsec_per_pixel)
    }

    pub fn summary(&self) -> MatrixSummary {
        MatrixSummary {
            pixel_per_arcsec: self.pixel_per_arcsec_rows(),
            arcsec_per_pixel: self.arcsec_per_pixel_rows(),
            determinant: self.determinant(),
        }
    }
}

/// Serializable view of a [`CalibrationMatrix`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MatrixSummary {
    pub pixel_per_arcsec: [[f64; 2]; 2],
    pub arcsec_per_pixel: [[f64; 2]; 2],
    pub determinant: f64,
}

fn invert(matrix: &Matrix2<f64>) -> GuideResult<Matrix2<f64>> {
    let det = matrix.determinant();
    if det.abs() < DETERMINANT_EPSILON {
        return Err(GuideError::SingularCalibration(format!("determinant={:.6e}", det)));
    }
    matrix
        .try_inverse()
        .ok_or_else(|| GuideError::SingularCalibration(format!("determinant={:.6e}", det)))
}

fn angle_between(v1: &Vector2<f64>, v2: &Vector2<f64>) -> f64 {
    let (n1, n2) = (v1.norm(), v2.norm());
    if n1 < f64::EPSILON || n2 < f64::EPSILON {
        return 0.0;
    }
    (v1.dot(v2) / (n1 * n2)).clamp(-1.0, 1.0).acos().to_degrees()
}

fn rows(m: &Matrix2<f64>) -> [[f64; 2]; 2] {
    [[m[(0, 0)], m[(0, 1)]], [m[(1, 0)], m[(1, 1)]]]
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_round_trip() {
        let m = CalibrationMatrix::from_axes(Vector2::new(0.2, -0.4), Vector2::new(0.4, 0.2), 10.0).unwrap();
        let (dx, dy) = m.sky_to_pixel(3.0, -7.5);
        let (ra, dec) = m.pixel_to_sky(dx, dy);
        assert_relative_eq!(ra, 3.0, epsilon = 1e-9);
        assert_relative_eq!(dec, -7.5, epsilon = 1e-9);
        assert_eq!(m.pixel_per_arcsec_rows(), [[0.2, 0.4], [-0.4, 0.2]]);
    }

    #[test]
    fn test_plate_scale() {
        let m = CalibrationMatrix::from_plate(1.01, 0.0).unwrap();
        let (ra, dec) = m.pixel_to_sky(2.0, -1.0);
        assert_relative_eq!(ra, 2.02, epsilon = 1e-12);
        assert_relative_eq!(dec, -1.01, epsilon = 1e-12);
        assert_relative_eq!(m.mean_scale(), 1.01, epsilon = 1e-12);

        let rotated = CalibrationMatrix::from_plate(1.0, 90.0).unwrap();
        let (ra, dec) = rotated.pixel_to_sky(1.0, 0.0);
        assert_relative_eq!(ra, 0.0, epsilon = 1e-12);
        assert_relative_eq!(dec, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_singular_matrix() {
        let err = CalibrationMatrix::from_pixel_per_arcsec(Matrix2::new(1.0, 2.0, 2.0, 4.0)).unwrap_err();
        assert!(matches!(err, GuideError::SingularCalibration(_)));
    }

    #[test]
    fn test_parallel_axes_rejected() {
        let err = CalibrationMatrix::from_axes(Vector2::new(1.0, 0.0), Vector2::new(1.0, 0.05), 10.0).unwrap_err();
        assert!(err.to_string().contains("apart"));

        let err = CalibrationMatrix::from_axes(Vector2::new(0.0, 0.0), Vector2::new(0.0, 1.0), 10.0).unwrap_err();
        assert!(matches!(err, GuideError::SingularCalibration(_)));
    }
}
