//! Mount and derotator corrections
//!
//! A measured drift is converted to on-sky arcsec, scaled by the correction
//! gain and negated. The RA component is divided by cos(dec) so it is
//! expressed in mount-axis arcsec.

use crate::config::GuideConfig;
use crate::error::{GuideError, GuideResult};
use crate::matrix::CalibrationMatrix;
use crate::statemachine::CorrectionGate;
use crate::strategy::Offset;
use crate::unit::TelescopeUnit;
use autoguide_proxy::{invoke, ProxyError};
use serde::Serialize;

/// Smallest |cos(dec)| used when scaling RA, to stay finite at the pole
const MIN_COS_DEC: f64 = 1e-3;

/// On-sky RA arcsec expressed as mount-axis arcsec at `declination_deg`
pub(crate) fn mount_ra_arcsec(sky_ra_arcsec: f64, declination_deg: f64) -> f64 {
    sky_ra_arcsec / declination_deg.to_radians().cos().abs().max(MIN_COS_DEC)
}

/// Where a correction came from
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Provenance {
    pub strategy: String,
    /// Measured on-sky drift in arcsec
    pub sky_ra_arcsec: f64,
    pub sky_dec_arcsec: f64,
    /// Measured pixel drift, for pixel strategies
    pub pixel_offset: Option<[f64; 2]>,
    pub declination_deg: f64,
    /// Whether a fitted calibration was used instead of the nominal plate scale
    pub calibrated: bool,
}

/// Physical correction for one guide iteration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Correction {
    /// Mount-axis arcsec for `offset --ra_add_arcsec`
    pub ra_arcsec: f64,
    pub dec_arcsec: f64,
    /// Derotator move in degrees
    pub rotation_deg: Option<f64>,
    pub provenance: Provenance,
}

impl Correction {
    pub fn has_translation(&self) -> bool {
        self.ra_arcsec != 0.0 || self.dec_arcsec != 0.0
    }
}

/// Turns measured offsets into corrections
#[derive(Debug, Clone)]
pub struct CorrectionPlanner {
    gain: f64,
    min_offset_px: f64,
    min_rotation_deg: f64,
    pixel_scale_arcsec: f64,
    nominal: CalibrationMatrix,
}

impl CorrectionPlanner {
    pub fn new(config: &GuideConfig) -> GuideResult<Self> {
        Ok(Self {
            gain: config.correction_gain,
            min_offset_px: config.min_offset_px,
            min_rotation_deg: config.min_rotation_deg,
            pixel_scale_arcsec: config.pixel_scale_arcsec,
            nominal: CalibrationMatrix::from_plate(config.pixel_scale_arcsec, config.rotation_deg)?,
        })
    }

    /// Correction for `offset`, or `None` when it is below the thresholds
    pub fn plan(
        &self,
        strategy: &str,
        offset: &Offset,
        calibration: Option<&CalibrationMatrix>,
        declination_deg: f64,
        can_derotate: bool,
    ) -> Option<Correction> {
        let (sky, pixel, size_px, rotation) = match *offset {
            Offset::Sky {
                ra_arcsec,
                dec_arcsec,
            } => (
                (ra_arcsec, dec_arcsec),
                None,
                ra_arcsec.hypot(dec_arcsec) / self.pixel_scale_arcsec,
                None,
            ),
            Offset::Pixel { dx, dy, rotation_deg } => {
                let matrix = calibration.unwrap_or(&self.nominal);
                (matrix.pixel_to_sky(dx, dy), Some([dx, dy]), dx.hypot(dy), rotation_deg)
            }
        };

        let translate = size_px.is_finite() && size_px >= self.min_offset_px;
        let rotation_deg = rotation
            .filter(|r| can_derotate && r.is_finite() && r.abs() >= self.min_rotation_deg)
            .map(|r| -self.gain * r);

        if !translate && rotation_deg.is_none() {
            tracing::debug!(
                "Offset of {:.3} px below {:.3} px, not correcting",
                size_px,
                self.min_offset_px
            );
            return None;
        }

        let (ra_arcsec, dec_arcsec) = if translate {
            (mount_ra_arcsec(-self.gain * sky.0, declination_deg), -self.gain * sky.1)
        } else {
            (0.0, 0.0)
        };

        Some(Correction {
            ra_arcsec,
            dec_arcsec,
            rotation_deg,
            provenance: Provenance {
                strategy: strategy.to_string(),
                sky_ra_arcsec: sky.0,
                sky_dec_arcsec: sky.1,
                pixel_offset: pixel,
                declination_deg,
                calibrated: calibration.is_some() && pixel.is_some(),
            },
        })
    }
}

/// Send `correction` to the unit's mount and derotator.
///
/// The commands are collected on a separate task holding a gate guard, so
/// cancelling the caller neither interrupts them nor lets `stop` finish
/// before they complete.
pub async fn dispatch(unit: &TelescopeUnit, correction: &Correction, gate: &CorrectionGate) -> GuideResult<()> {
    let guard = gate.enter().await;

    let mut calls = Vec::with_capacity(2);
    if correction.has_translation() {
        calls.push(unit.mount().offset(correction.ra_arcsec, correction.dec_arcsec));
    }
    if let (Some(degrees), Some(derotator)) = (correction.rotation_deg, unit.derotator()) {
        calls.push(derotator.move_relative(degrees));
    }
    if calls.is_empty() {
        return Ok(());
    }

    let collector = tokio::spawn(async move {
        let _guard = guard;
        invoke(calls).await
    });

    match collector.await {
        Ok(result) => result.map(|_| ()).map_err(GuideError::from),
        Err(e) => Err(ProxyError::Transport(format!("correction task failed: {}", e)).into()),
    }
}
