//! Multicam Refine Library
//!
//! A Rust library for jointly refining the calibration of a multi-camera rig
//! against shared point correspondences. Given initial camera parameters and
//! pixel observations of common world points, the library:
//! - re-triangulates every world point from all observing cameras (batched
//!   homogeneous DLT),
//! - evaluates point-to-ray and reprojection residuals for every observation,
//! - refines all camera parameters at once with a staged, box-bounded
//!   Levenberg-Marquardt optimization (tiny-solver) under a Huber robust loss.
//!
//! Each camera is described by 11 parameters: a rotation vector, a
//! translation, a single shared focal length, the principal point and two
//! radial distortion coefficients.
//!
//! # Example
//!
//! ```no_run
//! use multicam_refine::{
//!     optimize_all_cameras, Camera, CameraSet, Correspondence, ProgressSink, RefineConfig,
//! };
//! use nalgebra::{Vector2, Vector3};
//! use std::collections::BTreeMap;
//!
//! # fn main() -> Result<(), multicam_refine::CalibError> {
//! let mut cameras: CameraSet = BTreeMap::new();
//! cameras.insert(
//!     0,
//!     Camera::from_params(
//!         &Vector3::zeros(),
//!         &Vector3::new(0.0, 0.0, 400.0),
//!         1200.0,
//!         640.0,
//!         480.0,
//!         -0.2,
//!         0.05,
//!     )?,
//! );
//! // ... more cameras and real correspondences ...
//! let mut corr = Correspondence::new(Vector3::new(1.0, 2.0, 10.0));
//! corr.pixels.insert(0, Vector2::new(650.0, 470.0));
//!
//! let (refined, summary) = optimize_all_cameras(
//!     &cameras,
//!     &[corr],
//!     (960, 1280),
//!     &RefineConfig::default(),
//!     &ProgressSink::none(),
//! )?;
//! println!("reprojection rmse: {:.3} px", summary.proj_after.rmse);
//! # Ok(())
//! # }
//! ```

pub mod camera;
pub mod correspondence;
pub mod geometry;
pub mod optimization;

// Re-export commonly used types
pub use camera::{
    decode, encode, ActiveDistortion, CalibError, Camera, CameraSet, PARAMS_PER_CAMERA,
};
pub use correspondence::{CameraObservations, Correspondence, ObservationIndex};
pub use optimization::{
    optimize_all_cameras, ErrorStats, ProgressSink, RefineConfig, RefineSummary,
    MIN_CORRESPONDENCES,
};
