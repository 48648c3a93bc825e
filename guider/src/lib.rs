//! Autoguider core for a telescope unit
//!
//! The [`GuideStateMachine`] owns the guide mode and the single background
//! guide task. The [`GuideWorker`] runs that task: it takes a reference, then
//! measures drift with an [`OffsetStrategy`] and corrects the mount through
//! the unit's actor clients. [`Calibrator`] fits the pixel/sky matrix used to
//! turn pixel drift into mount offsets, [`FocusSeries`] finds the best focus
//! from star sizes, and [`GuideCommands`] exposes it all as commands.

pub mod calibration;
pub mod commands;
pub mod config;
pub mod correction;
pub mod error;
pub mod focus;
pub mod matrix;
pub mod mode;
pub mod statemachine;
pub mod strategy;
pub mod unit;
pub mod worker;

#[cfg(test)]
mod testkit;

pub use calibration::{Axis, CalibrationReport, CalibrationSample, Calibrator};
pub use commands::{GuideCommands, UnitStatus};
pub use config::{
    CalibrationConfig, CameraConfig, CameraRole, FocusConfig, GuideConfig, GuiderConfig, StrategyKind, UnitConfig,
};
pub use correction::{dispatch, Correction, CorrectionPlanner, Provenance};
pub use error::{GuideError, GuideResult};
pub use focus::{FocusCurve, FocusPoint, FocusReport, FocusSeries};
pub use matrix::{CalibrationMatrix, MatrixSummary};
pub use mode::GuideMode;
pub use statemachine::{CorrectionGate, GuideStateMachine, ModeHandle, TaskLiveness};
pub use strategy::{
    build_strategy, AstrometricStrategy, CentroidStrategy, Frame, FrameMeasurement, ImageAnalyzer, Offset,
    OffsetMeasurement, OffsetStrategy, PixelCoord, Position, ReferenceFrame, SkyCoord, Source, StarDisplacement,
    StarSet,
};
pub use unit::{CameraClient, DerotatorClient, FocuserClient, MountClient, TelescopeUnit};
pub use worker::{GuideStatus, GuideWorker, StatusCallback};

pub use autoguide_proxy as proxy;
