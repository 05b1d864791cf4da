//! Joint refinement of all camera parameters against multi-view point
//! correspondences.
//!
//! The refinement minimizes two residual families at once: a point-to-ray
//! distance (how far each re-triangulated world point lies from the viewing
//! ray of its observation) and a classic reprojection error. World points are
//! not optimization variables; they are re-triangulated from the current
//! camera estimates inside every residual evaluation, which keeps the
//! parameter vector small and the problem dense.
//!
//! The driver runs a fixed number of outer stages. Each stage rebuilds the
//! box constraints around the current estimate and hands the problem to
//! `tiny_solver`'s Levenberg-Marquardt optimizer with a Huber robust loss, so
//! later stages can walk further than the initial margins would allow while
//! any single stage stays tightly bounded.

use crate::camera::{decode, encode, ActiveDistortion, CalibError, CameraSet, PARAMS_PER_CAMERA};
use crate::correspondence::{Correspondence, ObservationIndex};
use crate::geometry;

use log::{debug, info, warn};
use nalgebra::{DVector, Matrix3, Matrix3x4, RealField, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tiny_solver::factors::Factor;
use tiny_solver::loss_functions::HuberLoss;
use tiny_solver::optimizer::{Optimizer, OptimizerOptions};
use tiny_solver::LevenbergMarquardtOptimizer;

/// Fewer correspondences than this and refinement is skipped entirely; the
/// input cameras are returned unchanged with `converged = false`.
pub const MIN_CORRESPONDENCES: usize = 10;

/// Every how many plain (non-autodiff) residual evaluations a progress line
/// is emitted.
const NFEV_LOG_EVERY: usize = 20;

// Per-stage box margins around the current estimate.
const ROTATION_MARGIN: f64 = 0.1;
const TRANSLATION_MARGIN: f64 = 50.0;
const FOCAL_SCALE_LOW: f64 = 0.95;
const FOCAL_SCALE_HIGH: f64 = 1.05;
const PRINCIPAL_POINT_MARGIN: f64 = 50.0;
const DISTORTION_MIN_MARGIN: f64 = 0.1;
const DISTORTION_REL_MARGIN: f64 = 0.5;
const PINNED_MARGIN: f64 = 1e-10;

/// Tunable knobs of the refinement driver.
///
/// The defaults reproduce the standard behavior; hosts usually only touch
/// `huber_scale` (in pixels, shared by both residual families) and `stages`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefineConfig {
    /// Iteration cap handed to the inner solver, per stage.
    pub max_nfev: usize,
    /// Cost-decrease tolerance of the inner solver (absolute and relative).
    pub ftol: f64,
    /// Parameter-change tolerance; with [`RefineConfig::early_stop`] set, a
    /// stage whose step norm falls below this skips the remaining stages.
    pub xtol: f64,
    /// Scale of the Huber robust loss applied to the stacked residuals.
    pub huber_scale: f64,
    /// Number of outer re-centering stages.
    pub stages: usize,
    /// Opt-in early termination between stages based on `xtol`. Off by
    /// default: every configured stage runs.
    pub early_stop: bool,
}

impl Default for RefineConfig {
    fn default() -> Self {
        RefineConfig {
            max_nfev: 500,
            ftol: 1e-7,
            xtol: 1e-7,
            huber_scale: 1.0,
            stages: 3,
            early_stop: false,
        }
    }
}

/// Observer for human-readable progress lines.
///
/// The sink is purely informational: it never influences control flow, and
/// every message it receives is also emitted through the `log` facade. The
/// callback must be thread-safe because the inner solver owns a clone of the
/// sink while it evaluates residuals.
#[derive(Clone, Default)]
pub struct ProgressSink {
    callback: Option<Arc<dyn Fn(&str) + Send + Sync>>,
}

impl ProgressSink {
    /// A sink that discards everything.
    pub fn none() -> Self {
        ProgressSink { callback: None }
    }

    /// A sink forwarding each message to `callback`.
    pub fn new(callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        ProgressSink {
            callback: Some(Arc::new(callback)),
        }
    }

    fn emit(&self, message: &str) {
        if let Some(cb) = &self.callback {
            cb(message);
        }
    }
}

/// Summary statistics over one family of per-observation errors.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ErrorStats {
    pub rmse: f64,
    pub mean: f64,
    pub stddev: f64,
    pub max: f64,
    /// Outlier threshold `mean + 3 * stddev`.
    pub tol: f64,
}

impl ErrorStats {
    /// Computes the statistics over a slice of non-negative errors. An empty
    /// slice yields all zeros.
    pub fn from_errors(errors: &[f64]) -> Self {
        if errors.is_empty() {
            return ErrorStats::default();
        }
        let n = errors.len() as f64;
        let mean = errors.iter().sum::<f64>() / n;
        let rmse = (errors.iter().map(|e| e * e).sum::<f64>() / n).sqrt();
        let var = errors.iter().map(|e| (e - mean) * (e - mean)).sum::<f64>() / n;
        let stddev = var.sqrt();
        let max = errors.iter().cloned().fold(0.0, f64::max);
        ErrorStats {
            rmse,
            mean,
            stddev,
            max,
            tol: mean + 3.0 * stddev,
        }
    }
}

/// Outcome report of one refinement run.
///
/// `converged = false` covers both the insufficient-data short circuit and a
/// solver stage that failed; `message` says which. The returned cameras are
/// always usable: a failed stage keeps the last accepted estimate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefineSummary {
    pub triang_before: ErrorStats,
    pub triang_after: ErrorStats,
    pub proj_before: ErrorStats,
    pub proj_after: ErrorStats,
    pub n_points: usize,
    pub n_cameras: usize,
    /// Plain residual evaluations performed by the solver (autodiff probes
    /// excluded), summed over all stages.
    pub nfev: usize,
    pub converged: bool,
    pub message: String,
}

/// Immutable per-run lookup state, built once in [`optimize_all_cameras`] and
/// shared read-only by every residual evaluation.
pub(crate) struct RunContext {
    /// Camera identifiers in ascending order; position `i` owns parameter
    /// slots `[i * PARAMS_PER_CAMERA, (i + 1) * PARAMS_PER_CAMERA)`.
    cam_ids: Vec<u32>,
    index: ObservationIndex,
    active: ActiveDistortion,
}

impl RunContext {
    pub(crate) fn new(cameras: &CameraSet, correspondences: &[Correspondence]) -> Self {
        let cam_ids: Vec<u32> = cameras.keys().copied().collect();
        let index = ObservationIndex::build(correspondences, &cam_ids);
        RunContext {
            cam_ids,
            index,
            active: ActiveDistortion::infer(cameras),
        }
    }
}

/// Per-camera working state decoded from a parameter vector slice. Unlike a
/// full `Camera` this is generic over the scalar so it can carry dual numbers
/// through the residuals.
struct WorkingCamera<T: RealField> {
    r: Matrix3<T>,
    r_inv: Matrix3<T>,
    tvec: Vector3<T>,
    center: Vector3<T>,
    proj: Matrix3x4<T>,
    f: T,
    cx: T,
    cy: T,
    k1: T,
    k2: T,
}

fn parse_cameras<T: RealField>(x: &DVector<T>, n_cameras: usize) -> Vec<WorkingCamera<T>> {
    (0..n_cameras)
        .map(|i| {
            let b = i * PARAMS_PER_CAMERA;
            let rvec = Vector3::new(x[b].clone(), x[b + 1].clone(), x[b + 2].clone());
            let tvec = Vector3::new(x[b + 3].clone(), x[b + 4].clone(), x[b + 5].clone());
            let f = x[b + 6].clone();
            let cx = x[b + 7].clone();
            let cy = x[b + 8].clone();
            let r = geometry::rodrigues(&rvec);
            let r_inv = r.transpose();
            let center = -(&r_inv * &tvec);
            let k = geometry::intrinsic_matrix(f.clone(), cx.clone(), cy.clone());
            let proj = geometry::projection_matrix(&k, &r, &tvec);
            WorkingCamera {
                r,
                r_inv,
                tvec,
                center,
                proj,
                f,
                cx,
                cy,
                k1: x[b + 9].clone(),
                k2: x[b + 10].clone(),
            }
        })
        .collect()
}

/// Evaluates the full stacked residual vector for a parameter vector.
///
/// Layout, per camera in identifier order (cameras without observations are
/// skipped): first one point-to-ray distance per observation, then the two
/// reprojection components per observation. World points are re-triangulated
/// from the current parameters before any residual is formed.
pub(crate) fn refine_residuals<T: RealField>(x: &DVector<T>, ctx: &RunContext) -> DVector<T> {
    let cams = parse_cameras(x, ctx.cam_ids.len());

    let views = ctx.cam_ids.iter().enumerate().filter_map(|(i, id)| {
        ctx.index.get(*id).map(|obs| {
            (
                cams[i].proj.clone(),
                obs.point_indices.as_slice(),
                obs.pixels.as_slice(),
            )
        })
    });
    let points = geometry::triangulate_all(views, ctx.index.n_points());

    let mut residuals = DVector::zeros(3 * ctx.index.n_observations());
    let mut offset = 0;
    for (i, id) in ctx.cam_ids.iter().enumerate() {
        let Some(obs) = ctx.index.get(*id) else {
            continue;
        };
        let cam = &cams[i];
        let n = obs.len();

        for (j, (&pt_idx, uv)) in obs.point_indices.iter().zip(&obs.pixels).enumerate() {
            let p = &points[pt_idx];
            let u = T::from_f64(uv.x).unwrap();
            let v = T::from_f64(uv.y).unwrap();

            // Point-to-ray distance: the viewing ray through the undistorted
            // pixel, expressed in world coordinates.
            let xd = (u.clone() - cam.cx.clone()) / cam.f.clone();
            let yd = (v.clone() - cam.cy.clone()) / cam.f.clone();
            let (xu, yu) = geometry::undistort(xd, yd, cam.k1.clone(), cam.k2.clone());
            let ray = (&cam.r_inv * Vector3::new(xu, yu, T::one())).normalize();
            let w = p - &cam.center;
            let along = w.dot(&ray);
            let perp = w - ray * along;
            residuals[offset + j] = perp.norm();

            // Reprojection through the full distortion model.
            let pc = &cam.r * p + &cam.tvec;
            let xn = pc.x.clone() / pc.z.clone();
            let yn = pc.y.clone() / pc.z.clone();
            let (xdn, ydn) = geometry::distort(xn, yn, cam.k1.clone(), cam.k2.clone());
            residuals[offset + n + 2 * j] = cam.f.clone() * xdn + cam.cx.clone() - u;
            residuals[offset + n + 2 * j + 1] = cam.f.clone() * ydn + cam.cy.clone() - v;
        }
        offset += 3 * n;
    }
    residuals
}

/// Converts a generic vector to `f64` if every entry converts losslessly.
/// Dual numbers carrying a derivative do not, which is how plain evaluations
/// are told apart from autodiff probes.
fn try_to_f64<T: RealField>(v: &DVector<T>) -> Option<DVector<f64>> {
    let mut out = DVector::zeros(v.len());
    for i in 0..v.len() {
        out[i] = v[i].clone().to_subset()?;
    }
    Some(out)
}

/// Splits a stacked residual vector into its two per-observation error
/// families: point-to-ray distances and Euclidean reprojection errors.
fn split_residual_errors(residuals: &DVector<f64>, ctx: &RunContext) -> (Vec<f64>, Vec<f64>) {
    let mut triang = Vec::with_capacity(ctx.index.n_observations());
    let mut proj = Vec::with_capacity(ctx.index.n_observations());

    let mut offset = 0;
    for (_, obs) in ctx.index.iter() {
        let n = obs.len();
        for j in 0..n {
            triang.push(residuals[offset + j].abs());
            let du = residuals[offset + n + 2 * j];
            let dv = residuals[offset + n + 2 * j + 1];
            proj.push((du * du + dv * dv).sqrt());
        }
        offset += 3 * n;
    }
    (triang, proj)
}

/// Evaluates the residuals for a parameter vector and summarizes both error
/// families.
pub(crate) fn compute_both_errors(x: &DVector<f64>, ctx: &RunContext) -> (ErrorStats, ErrorStats) {
    let residuals = refine_residuals(x, ctx);
    let (triang, proj) = split_residual_errors(&residuals, ctx);
    (
        ErrorStats::from_errors(&triang),
        ErrorStats::from_errors(&proj),
    )
}

/// Builds the per-stage box constraint around the current estimate.
///
/// Margins per slot: rotation vector components +-0.1 rad, translation
/// components +-50, focal length scaled by [0.95, 1.05], principal point
/// +-50 px, each active distortion coefficient +-max(0.1, 0.5 * |k|).
/// Inactive distortion slots are pinned to their current value.
pub(crate) fn build_bounds(
    x: &DVector<f64>,
    active: ActiveDistortion,
) -> (DVector<f64>, DVector<f64>) {
    let mut lo = x.clone();
    let mut hi = x.clone();
    let n_cameras = x.len() / PARAMS_PER_CAMERA;

    for i in 0..n_cameras {
        let b = i * PARAMS_PER_CAMERA;
        for s in 0..3 {
            lo[b + s] -= ROTATION_MARGIN;
            hi[b + s] += ROTATION_MARGIN;
        }
        for s in 3..6 {
            lo[b + s] -= TRANSLATION_MARGIN;
            hi[b + s] += TRANSLATION_MARGIN;
        }
        lo[b + 6] = x[b + 6] * FOCAL_SCALE_LOW;
        hi[b + 6] = x[b + 6] * FOCAL_SCALE_HIGH;
        for s in 7..9 {
            lo[b + s] -= PRINCIPAL_POINT_MARGIN;
            hi[b + s] += PRINCIPAL_POINT_MARGIN;
        }
        for s in 0..2 {
            let idx = b + 9 + s;
            let margin = if s < active.count() {
                DISTORTION_MIN_MARGIN.max(DISTORTION_REL_MARGIN * x[idx].abs())
            } else {
                PINNED_MARGIN
            };
            lo[idx] -= margin;
            hi[idx] += margin;
        }
    }
    (lo, hi)
}

/// Cost factor handed to `tiny_solver`.
///
/// Jacobians come from the solver's dual-number autodiff through the exact
/// residual code, triangulation included. The factor also counts plain `f64`
/// evaluations and emits a progress line every [`NFEV_LOG_EVERY`]-th one.
#[derive(Clone)]
struct RefineCost {
    ctx: Arc<RunContext>,
    nfev: Arc<AtomicUsize>,
    progress: ProgressSink,
}

impl<T: nalgebra::RealField> Factor<T> for RefineCost {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let residuals = refine_residuals(&params[0], &self.ctx);

        if let Some(plain) = try_to_f64(&residuals) {
            let n = self.nfev.fetch_add(1, Ordering::Relaxed) + 1;
            if n % NFEV_LOG_EVERY == 0 && !plain.is_empty() {
                let (triang, proj) = split_residual_errors(&plain, &self.ctx);
                let line = format!(
                    "evaluation {n}: triang rmse {:.6}, reproj rmse {:.6}",
                    ErrorStats::from_errors(&triang).rmse,
                    ErrorStats::from_errors(&proj).rmse
                );
                debug!("{line}");
                self.progress.emit(&line);
            }
        }
        residuals
    }
}

/// Jointly refines every camera in `cameras` against the correspondences.
///
/// Runs the staged bounded optimization described in the module docs and
/// returns the refined cameras together with a [`RefineSummary`]. With fewer
/// than [`MIN_CORRESPONDENCES`] correspondences (or none observed by any
/// known camera) the input cameras are returned unchanged and the summary
/// reports `converged = false`; that situation is not an error.
///
/// `img_size` is `(height, width)` of the images the pixel observations come
/// from. It takes no part in the optimization; an initial principal point
/// outside the image only logs a warning.
pub fn optimize_all_cameras(
    cameras: &CameraSet,
    correspondences: &[Correspondence],
    img_size: (u32, u32),
    config: &RefineConfig,
    progress: &ProgressSink,
) -> Result<(CameraSet, RefineSummary), CalibError> {
    if cameras.is_empty() {
        return Err(CalibError::InvalidParams(
            "camera set cannot be empty".to_string(),
        ));
    }
    if config.stages == 0 || config.max_nfev == 0 {
        return Err(CalibError::InvalidParams(
            "stages and max_nfev must be positive".to_string(),
        ));
    }
    if config.huber_scale <= 0.0 {
        return Err(CalibError::InvalidParams(
            "huber_scale must be positive".to_string(),
        ));
    }
    let (h, w) = (img_size.0 as f64, img_size.1 as f64);
    for (id, cam) in cameras {
        let pp = cam.principal_point();
        if pp.x < 0.0 || pp.x > w || pp.y < 0.0 || pp.y > h {
            warn!(
                "camera {id}: principal point ({}, {}) outside image (h, w) = {img_size:?}",
                pp.x, pp.y
            );
        }
    }

    let ctx = Arc::new(RunContext::new(cameras, correspondences));
    let mut x = encode(cameras);
    let (triang_before, proj_before) = compute_both_errors(&x, &ctx);

    if correspondences.len() < MIN_CORRESPONDENCES || ctx.index.n_observations() == 0 {
        let message = format!(
            "insufficient data: {} correspondences ({} observations), need at least {}",
            correspondences.len(),
            ctx.index.n_observations(),
            MIN_CORRESPONDENCES
        );
        warn!("{message}");
        progress.emit(&message);
        let summary = RefineSummary {
            triang_before,
            triang_after: triang_before,
            proj_before,
            proj_after: proj_before,
            n_points: correspondences.len(),
            n_cameras: cameras.len(),
            nfev: 0,
            converged: false,
            message,
        };
        return Ok((cameras.clone(), summary));
    }

    info!(
        "refining {} cameras against {} points ({} observations), distortion: {:?}",
        cameras.len(),
        correspondences.len(),
        ctx.index.n_observations(),
        ctx.active
    );
    info!(
        "initial errors: triang rmse {:.6}, reproj rmse {:.6}",
        triang_before.rmse, proj_before.rmse
    );
    progress.emit(&format!(
        "start: triang rmse {:.6}, reproj rmse {:.6}",
        triang_before.rmse, proj_before.rmse
    ));

    let nfev = Arc::new(AtomicUsize::new(0));
    let residual_dim = 3 * ctx.index.n_observations();
    let mut converged = true;
    let mut message = String::from("converged");

    for stage in 1..=config.stages {
        let (lo, hi) = build_bounds(&x, ctx.active);
        progress.emit(&format!("stage {stage}: bounds re-centered"));

        let mut problem = tiny_solver::Problem::new();
        let cost = RefineCost {
            ctx: ctx.clone(),
            nfev: nfev.clone(),
            progress: progress.clone(),
        };
        problem.add_residual_block(
            residual_dim,
            &["cameras"],
            Box::new(cost),
            Some(Box::new(HuberLoss::new(config.huber_scale))),
        );
        for i in 0..x.len() {
            problem.set_variable_bounds("cameras", i, lo[i], hi[i]);
        }

        let mut initial = HashMap::new();
        initial.insert("cameras".to_string(), x.clone());

        let options = OptimizerOptions {
            max_iteration: config.max_nfev,
            min_abs_error_decrease_threshold: config.ftol,
            min_rel_error_decrease_threshold: config.ftol,
            ..OptimizerOptions::default()
        };

        let optimizer = LevenbergMarquardtOptimizer::default();
        match optimizer.optimize(&problem, &initial, Some(options)) {
            Some(result) => {
                let x_new = result.get("cameras").cloned().ok_or_else(|| {
                    CalibError::InvalidParams("solver returned no camera block".to_string())
                })?;
                let step = (&x_new - &x).norm();
                x = x_new;

                let (t, p) = compute_both_errors(&x, &ctx);
                let line = format!(
                    "stage {stage} done: triang rmse {:.6}, reproj rmse {:.6}",
                    t.rmse, p.rmse
                );
                info!("{line}");
                progress.emit(&line);

                if config.early_stop && step < config.xtol {
                    info!("parameter change {step:.3e} below xtol, stopping after stage {stage}");
                    break;
                }
            }
            None => {
                // Keep the last accepted estimate and move on; later stages
                // may still succeed from the same point.
                converged = false;
                message = format!("stage {stage} did not converge; keeping current estimate");
                warn!("{message}");
                progress.emit(&message);
            }
        }
    }

    let (triang_after, proj_after) = compute_both_errors(&x, &ctx);
    let refined = decode(&x, cameras, ctx.active)?;

    let line = format!(
        "refinement finished: triang rmse {:.6} -> {:.6}, reproj rmse {:.6} -> {:.6}",
        triang_before.rmse, triang_after.rmse, proj_before.rmse, proj_after.rmse
    );
    info!("{line}");
    progress.emit(&line);

    let summary = RefineSummary {
        triang_before,
        triang_after,
        proj_before,
        proj_after,
        n_points: correspondences.len(),
        n_cameras: cameras.len(),
        nfev: nfev.load(Ordering::Relaxed),
        converged,
        message,
    };
    Ok((refined, summary))
}
