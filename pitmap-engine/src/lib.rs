pub mod calibration;
pub mod geodesy;
pub mod jobs;
pub mod session;
pub mod snap;
pub mod spatial;
pub mod viewport;

pub mod errors {
    use thiserror::Error;

    #[derive(Debug, Clone, PartialEq, Error)]
    pub enum EngineError {
        #[error("spatial index cell size must be finite and positive, got {0}")]
        InvalidCellSize(f64),
        #[error("snap threshold must be finite and non-negative, got {0}")]
        InvalidSnapThreshold(f64),
        #[error("view scale must be finite and positive, got {0}")]
        InvalidViewScale(f64),
        #[error("view offset must be finite, got ({0}, {1})")]
        InvalidViewOffset(f64, f64),
    }
}

pub use calibration::{
    Affine2, AffineMatrix, Calibration, CalibrationError, CalibrationMode, CalibrationPoint,
};
pub use errors::EngineError;
pub use geodesy::{CoordinateFormat, GeodesyError, Hemisphere, UtmCoordinate};
pub use jobs::{JobError, JobHandle, spawn_job};
pub use session::{MapSession, TapResult, WorldPosition};
pub use snap::SnapEngine;
pub use spatial::{SnapResult, SpatialIndex};
pub use viewport::{ViewState, screen_to_world, world_to_screen};
