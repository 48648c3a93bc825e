//! Guider error types

use crate::mode::GuideMode;
use autoguide_proxy::ProxyError;
use thiserror::Error;

/// Errors raised by the guider
#[derive(Debug, Error)]
pub enum GuideError {
    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error("{reason} (state={state})")]
    InvalidState { state: GuideMode, reason: String },

    #[error("Invalid state value: {0}")]
    InvalidStateValue(String),

    #[error("Not enough sources on {camera}: found {found}, need {required}")]
    NotEnoughSources {
        camera: String,
        found: usize,
        required: usize,
    },

    #[error("Unreliable measurement: mean flux change {flux_change:.3} exceeds {tolerance}")]
    UnreliableMeasurement { flux_change: f64, tolerance: f64 },

    #[error("Exposure time {exptime} s outside 0..={max} s")]
    InvalidExposure { exptime: f64, max: f64 },

    #[error("Declination {declination:.2} is beyond the calibration limit of {limit} deg")]
    DeclinationLimit { declination: f64, limit: f64 },

    #[error("Singular calibration: {0}")]
    SingularCalibration(String),

    #[error("Focus fit failed: {0}")]
    FocusFit(String),

    #[error("Image analysis failed: {0}")]
    Analysis(String),

    #[error("Unsupported camera set: {0}")]
    UnsupportedCameraSet(String),

    #[error("No reference position established")]
    NoReference,

    #[error("Unit has no {0}")]
    MissingDevice(&'static str),

    #[error("Guide task cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl GuideError {
    pub fn invalid_state(state: GuideMode, reason: impl Into<String>) -> Self {
        GuideError::InvalidState {
            state,
            reason: reason.into(),
        }
    }

    pub fn analysis(message: impl Into<String>) -> Self {
        GuideError::Analysis(message.into())
    }

    /// Measurement problems the guide loop skips over instead of aborting
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            GuideError::UnreliableMeasurement { .. } | GuideError::NotEnoughSources { .. }
        )
    }

    /// Mode carried by an `InvalidState` error
    pub fn state(&self) -> Option<GuideMode> {
        match self {
            GuideError::InvalidState { state, .. } => Some(*state),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for GuideError {
    fn from(err: serde_json::Error) -> Self {
        GuideError::Config(err.to_string())
    }
}

impl From<std::io::Error> for GuideError {
    fn from(err: std::io::Error) -> Self {
        GuideError::Config(err.to_string())
    }
}

impl From<GuideError> for String {
    fn from(err: GuideError) -> String {
        err.to_string()
    }
}

/// Result type for guider operations
pub type GuideResult<T> = Result<T, GuideError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_state_display() {
        let err = GuideError::invalid_state(GuideMode::Guiding, "guider is not idle");
        assert_eq!(err.to_string(), "guider is not idle (state=GUIDING)");
        assert_eq!(err.state(), Some(GuideMode::Guiding));
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(GuideError::UnreliableMeasurement {
            flux_change: 0.5,
            tolerance: 0.3
        }
        .is_recoverable());
        assert!(!GuideError::SingularCalibration("det=0".into()).is_recoverable());
        assert!(!GuideError::Proxy(ProxyError::ActorUnreachable("mount".into())).is_recoverable());
    }
}
