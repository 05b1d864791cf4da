//! Camera model and the flat parameter codec used by the refinement engine.
//!
//! A [`Camera`] owns the intrinsic matrix, the rotation in both matrix and
//! rotation-vector form (always kept synchronized), the translation, and up to
//! two radial distortion coefficients. The derived quantities (inverse
//! rotation and camera center) are recomputed whenever a camera is built and
//! are never mutated independently, so a `Camera` is internally consistent by
//! construction.
//!
//! The codec ([`encode`]/[`decode`]) maps an ordered camera collection to and
//! from the camera-major flat vector that the optimizer works on: 11 slots per
//! camera in the fixed order `[rvec (3), tvec (3), f, cx, cy, k1, k2]`.

use nalgebra::{DVector, Matrix3, Matrix3x4, Rotation3, Vector2, Vector3};
use std::collections::BTreeMap;
use std::fmt;

use crate::geometry;

/// Ordered collection of cameras keyed by their external identifier.
///
/// The `BTreeMap` ordering doubles as the canonical camera order of the flat
/// parameter vector, fixed once per refinement run.
pub type CameraSet = BTreeMap<u32, Camera>;

/// Number of optimization slots per camera: rotation vector (3), translation
/// (3), focal length (1), principal point (2), radial distortion (2).
pub const PARAMS_PER_CAMERA: usize = 11;

/// A distortion coefficient below this magnitude counts as absent when the
/// active coefficient count is inferred from the initial calibration.
const DIST_EPSILON: f64 = 1e-10;

/// Orthonormality tolerance for rotation matrices supplied by callers.
const ROTATION_TOLERANCE: f64 = 1e-6;

#[derive(thiserror::Error, Debug)]
pub enum CalibError {
    #[error("Focal length must be positive")]
    FocalLengthMustBePositive,
    #[error("Principal point must be finite")]
    PrincipalPointMustBeFinite,
    #[error("Rotation matrix is not orthonormal")]
    InvalidRotation,
    #[error("z is close to zero, point is at camera center")]
    PointAtCameraCenter,
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),
}

/// How many radial distortion coefficients are free during refinement.
///
/// The count is decided once per run from the initial calibration and shared
/// by every camera; the codec, the bounds builder and the residual evaluator
/// all receive it explicitly instead of re-deriving it from object state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveDistortion {
    /// All distortion slots pinned near zero.
    None,
    /// Only `k1` is free.
    K1,
    /// Both `k1` and `k2` are free.
    K1K2,
}

impl ActiveDistortion {
    /// Infers the active coefficient count from the initial cameras:
    /// coefficient `k` is active if any camera's initial value exceeds a small
    /// epsilon in magnitude. The policy is global, not per-camera.
    pub fn infer(cameras: &CameraSet) -> Self {
        let mut count = 0usize;
        for cam in cameras.values() {
            if cam.dist[0].abs() > DIST_EPSILON {
                count = count.max(1);
            }
            if cam.dist[1].abs() > DIST_EPSILON {
                count = count.max(2);
            }
        }
        match count {
            0 => ActiveDistortion::None,
            1 => ActiveDistortion::K1,
            _ => ActiveDistortion::K1K2,
        }
    }

    /// Number of free distortion coefficients.
    pub fn count(self) -> usize {
        match self {
            ActiveDistortion::None => 0,
            ActiveDistortion::K1 => 1,
            ActiveDistortion::K1K2 => 2,
        }
    }
}

/// A calibrated pinhole camera with radial distortion.
///
/// All fields are private so the synchronization invariants (rotation matrix
/// vs. rotation vector, derived inverse rotation and center) cannot be broken
/// from outside; updated cameras are produced as full replacement values by
/// [`decode`], never by partial mutation.
#[derive(Clone)]
pub struct Camera {
    k: Matrix3<f64>,
    r: Matrix3<f64>,
    rvec: Vector3<f64>,
    r_inv: Matrix3<f64>,
    tvec: Vector3<f64>,
    center: Vector3<f64>,
    dist: [f64; 5],
}

impl Camera {
    /// Creates a camera from an intrinsic matrix, rotation matrix, translation
    /// and a distortion coefficient sequence of length 0 to 5 (only the first
    /// two entries participate in refinement; the rest are carried as given).
    ///
    /// The rotation vector, inverse rotation and camera center are derived
    /// here. Returns an error for a non-positive focal length, a non-finite
    /// principal point, or a rotation matrix that is not orthonormal.
    pub fn new(
        k: Matrix3<f64>,
        r: Matrix3<f64>,
        tvec: Vector3<f64>,
        dist: &[f64],
    ) -> Result<Self, CalibError> {
        validate_intrinsics(&k)?;
        if dist.len() > 5 {
            return Err(CalibError::InvalidParams(format!(
                "expected at most 5 distortion coefficients, got {}",
                dist.len()
            )));
        }
        let orthonormality = (r * r.transpose() - Matrix3::identity()).norm();
        if orthonormality > ROTATION_TOLERANCE || r.determinant() < 0.0 {
            return Err(CalibError::InvalidRotation);
        }

        let rvec = Rotation3::from_matrix_unchecked(r).scaled_axis();
        let mut padded = [0.0; 5];
        padded[..dist.len()].copy_from_slice(dist);

        let r_inv = r.transpose();
        let center = -(r_inv * tvec);
        Ok(Camera {
            k,
            r,
            rvec,
            r_inv,
            tvec,
            center,
            dist: padded,
        })
    }

    /// Creates a camera from the individual refinement parameters: rotation
    /// vector, translation, shared focal length, principal point and the two
    /// radial distortion coefficients.
    pub fn from_params(
        rvec: &Vector3<f64>,
        tvec: &Vector3<f64>,
        f: f64,
        cx: f64,
        cy: f64,
        k1: f64,
        k2: f64,
    ) -> Result<Self, CalibError> {
        let k = geometry::intrinsic_matrix(f, cx, cy);
        validate_intrinsics(&k)?;
        let r = geometry::rodrigues(rvec);
        let r_inv = r.transpose();
        let center = -(r_inv * tvec);
        Ok(Camera {
            k,
            r,
            rvec: *rvec,
            r_inv,
            tvec: *tvec,
            center,
            dist: [k1, k2, 0.0, 0.0, 0.0],
        })
    }

    /// Intrinsic matrix `K`.
    pub fn k(&self) -> &Matrix3<f64> {
        &self.k
    }

    /// Rotation matrix `R` (world to camera).
    pub fn r(&self) -> &Matrix3<f64> {
        &self.r
    }

    /// Inverse rotation `R^-1 = R^T` (camera to world).
    pub fn r_inv(&self) -> &Matrix3<f64> {
        &self.r_inv
    }

    /// Rotation vector equivalent of [`Camera::r`].
    pub fn rvec(&self) -> &Vector3<f64> {
        &self.rvec
    }

    /// Translation vector `t`.
    pub fn tvec(&self) -> &Vector3<f64> {
        &self.tvec
    }

    /// Camera center in world coordinates, `-R^-1 t`.
    pub fn center(&self) -> &Vector3<f64> {
        &self.center
    }

    /// The 5-slot distortion array; only the first two entries are refined.
    pub fn dist(&self) -> &[f64; 5] {
        &self.dist
    }

    /// Focal length as used by the refinement (the `K[0,0]` entry).
    pub fn focal(&self) -> f64 {
        self.k[(0, 0)]
    }

    /// Principal point `(cx, cy)`.
    pub fn principal_point(&self) -> Vector2<f64> {
        Vector2::new(self.k[(0, 2)], self.k[(1, 2)])
    }

    /// The 3x4 projection matrix `K [R | t]`.
    pub fn projection_matrix(&self) -> Matrix3x4<f64> {
        geometry::projection_matrix(&self.k, &self.r, &self.tvec)
    }

    /// Projects a world point into pixel coordinates through the full
    /// distortion model.
    pub fn project(&self, point3d: &Vector3<f64>) -> Result<Vector2<f64>, CalibError> {
        let pc = self.r * point3d + self.tvec;
        if pc.z < f64::EPSILON.sqrt() {
            return Err(CalibError::PointAtCameraCenter);
        }
        let (xd, yd) = geometry::distort(pc.x / pc.z, pc.y / pc.z, self.dist[0], self.dist[1]);
        Ok(Vector2::new(
            self.k[(0, 0)] * xd + self.k[(0, 2)],
            self.k[(1, 1)] * yd + self.k[(1, 2)],
        ))
    }

    /// Undistorts a pixel into a unit-length viewing ray in camera
    /// coordinates.
    pub fn unproject(&self, point2d: &Vector2<f64>) -> Vector3<f64> {
        let xd = (point2d.x - self.k[(0, 2)]) / self.k[(0, 0)];
        let yd = (point2d.y - self.k[(1, 2)]) / self.k[(1, 1)];
        let (x, y) = geometry::undistort(xd, yd, self.dist[0], self.dist[1]);
        Vector3::new(x, y, 1.0).normalize()
    }
}

impl fmt::Debug for Camera {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Camera [f: {} cx: {} cy: {} rvec: {:?} tvec: {:?} dist: {:?}]",
            self.k[(0, 0)],
            self.k[(0, 2)],
            self.k[(1, 2)],
            self.rvec.as_slice(),
            self.tvec.as_slice(),
            self.dist,
        )
    }
}

fn validate_intrinsics(k: &Matrix3<f64>) -> Result<(), CalibError> {
    if k[(0, 0)] <= 0.0 || k[(1, 1)] <= 0.0 {
        return Err(CalibError::FocalLengthMustBePositive);
    }
    if !k[(0, 2)].is_finite() || !k[(1, 2)].is_finite() {
        return Err(CalibError::PrincipalPointMustBeFinite);
    }
    Ok(())
}

/// Flattens a camera collection into the camera-major parameter vector.
///
/// Cameras are visited in identifier order; each contributes
/// `[rvec (3), tvec (3), f, cx, cy, k1, k2]`.
pub fn encode(cameras: &CameraSet) -> DVector<f64> {
    let mut x = DVector::zeros(cameras.len() * PARAMS_PER_CAMERA);
    for (i, cam) in cameras.values().enumerate() {
        let b = i * PARAMS_PER_CAMERA;
        x[b] = cam.rvec.x;
        x[b + 1] = cam.rvec.y;
        x[b + 2] = cam.rvec.z;
        x[b + 3] = cam.tvec.x;
        x[b + 4] = cam.tvec.y;
        x[b + 5] = cam.tvec.z;
        x[b + 6] = cam.k[(0, 0)];
        x[b + 7] = cam.k[(0, 2)];
        x[b + 8] = cam.k[(1, 2)];
        x[b + 9] = cam.dist[0];
        x[b + 10] = cam.dist[1];
    }
    x
}

/// Rebuilds a camera collection from a parameter vector.
///
/// Camera identifiers are taken from `template` (the codec optimizes
/// parameters, not the set membership). Distortion slots beyond the active
/// count are zeroed; every decoded camera has its rotation matrix, inverse
/// rotation and center freshly derived, so no stale state survives a stage.
pub fn decode(
    x: &DVector<f64>,
    template: &CameraSet,
    active: ActiveDistortion,
) -> Result<CameraSet, CalibError> {
    let expected = template.len() * PARAMS_PER_CAMERA;
    if x.len() != expected {
        return Err(CalibError::InvalidParams(format!(
            "parameter vector has length {}, expected {} for {} cameras",
            x.len(),
            expected,
            template.len()
        )));
    }

    let mut cameras = BTreeMap::new();
    for (i, id) in template.keys().enumerate() {
        let b = i * PARAMS_PER_CAMERA;
        let rvec = Vector3::new(x[b], x[b + 1], x[b + 2]);
        let tvec = Vector3::new(x[b + 3], x[b + 4], x[b + 5]);
        let k1 = if active.count() >= 1 { x[b + 9] } else { 0.0 };
        let k2 = if active.count() >= 2 { x[b + 10] } else { 0.0 };
        let cam = Camera::from_params(&rvec, &tvec, x[b + 6], x[b + 7], x[b + 8], k1, k2)?;
        cameras.insert(*id, cam);
    }
    Ok(cameras)
}
