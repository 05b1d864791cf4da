//! Multi-view point correspondences and the per-camera observation index.
//!
//! A [`Correspondence`] is one world point together with its pixel detections
//! in the subset of cameras that saw it. The refinement engine never trusts
//! the stored world point (it re-triangulates internally) but carries it so
//! callers can seed and read back structure.
//!
//! [`ObservationIndex`] regroups a correspondence list into the camera-major
//! layout the residual evaluator wants: for each camera, the indices of the
//! points it observed plus the matching pixels, in point order.

use nalgebra::{Vector2, Vector3};
use std::collections::BTreeMap;

/// One world point observed by one or more cameras.
#[derive(Debug, Clone)]
pub struct Correspondence {
    /// Current estimate of the world point. Recomputed by triangulation
    /// during refinement; the stored value is only a seed.
    pub point3d: Vector3<f64>,
    /// Pixel detections keyed by camera identifier.
    pub pixels: BTreeMap<u32, Vector2<f64>>,
}

impl Correspondence {
    pub fn new(point3d: Vector3<f64>) -> Self {
        Correspondence {
            point3d,
            pixels: BTreeMap::new(),
        }
    }

    /// Number of cameras that observed this point.
    pub fn n_views(&self) -> usize {
        self.pixels.len()
    }
}

/// Per-camera view of a correspondence list.
///
/// `point_indices[i]` is the index into the original correspondence slice of
/// the observation whose pixel is `pixels[i]`. Both vectors are in ascending
/// point order because the index is built in a single forward pass.
#[derive(Debug, Clone, Default)]
pub struct CameraObservations {
    pub point_indices: Vec<usize>,
    pub pixels: Vec<Vector2<f64>>,
}

impl CameraObservations {
    pub fn len(&self) -> usize {
        self.point_indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.point_indices.is_empty()
    }
}

/// Camera-major index over a correspondence list, built once per refinement
/// run and shared read-only afterwards.
#[derive(Debug, Clone)]
pub struct ObservationIndex {
    per_camera: BTreeMap<u32, CameraObservations>,
    n_points: usize,
}

impl ObservationIndex {
    /// Builds the index in one pass over `correspondences`. Only cameras
    /// listed in `cam_ids` are indexed; cameras that observed nothing get no
    /// entry at all, so iteration skips them for free.
    pub fn build(correspondences: &[Correspondence], cam_ids: &[u32]) -> Self {
        let mut per_camera: BTreeMap<u32, CameraObservations> = BTreeMap::new();
        for (pt_idx, corr) in correspondences.iter().enumerate() {
            for (&cam_id, pixel) in &corr.pixels {
                if !cam_ids.contains(&cam_id) {
                    continue;
                }
                let entry = per_camera.entry(cam_id).or_default();
                entry.point_indices.push(pt_idx);
                entry.pixels.push(*pixel);
            }
        }
        ObservationIndex {
            per_camera,
            n_points: correspondences.len(),
        }
    }

    /// Observations for one camera, if it saw anything.
    pub fn get(&self, cam_id: u32) -> Option<&CameraObservations> {
        self.per_camera.get(&cam_id)
    }

    /// Iterates cameras with at least one observation, in identifier order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &CameraObservations)> {
        self.per_camera.iter().map(|(id, obs)| (*id, obs))
    }

    /// Number of points in the indexed correspondence list.
    pub fn n_points(&self) -> usize {
        self.n_points
    }

    /// Total observation count across all cameras.
    pub fn n_observations(&self) -> usize {
        self.per_camera.values().map(CameraObservations::len).sum()
    }
}
