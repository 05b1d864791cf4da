//! Generic geometric kernels shared by the refinement residuals and the
//! diagnostics code.
//!
//! Everything here is written over `T: nalgebra::RealField` so the exact same
//! code path serves two callers: the `tiny_solver` cost factor (which supplies
//! dual numbers to obtain Jacobians through automatic differentiation) and the
//! plain `f64` statistics helpers. Keeping one implementation guarantees the
//! optimizer and the reported error metrics never disagree about the model.

use nalgebra::{Matrix3, Matrix3x4, Matrix4, RealField, Vector2, Vector3};

/// Iteration cap for the Newton undistortion loop.
const UNDISTORT_MAX_ITERATIONS: usize = 20;

/// Skew-symmetric cross-product matrix of `v`.
fn skew<T: RealField>(v: &Vector3<T>) -> Matrix3<T> {
    Matrix3::new(
        T::zero(),
        -v.z.clone(),
        v.y.clone(),
        v.z.clone(),
        T::zero(),
        -v.x.clone(),
        -v.y.clone(),
        v.x.clone(),
        T::zero(),
    )
}

/// Converts a rotation vector (axis scaled by angle) into a rotation matrix.
///
/// Small rotations fall back to the first-order expansion `I + [r]x` so the
/// axis normalization never divides by a vanishing angle.
pub fn rodrigues<T: RealField>(rvec: &Vector3<T>) -> Matrix3<T> {
    let theta = rvec.norm();
    if theta < T::from_f64(1e-12).unwrap() {
        return Matrix3::identity() + skew(rvec);
    }
    let axis = rvec / theta.clone();
    let k = skew(&axis);
    let one_minus_cos = T::one() - theta.clone().cos();
    Matrix3::identity() + &k * theta.sin() + (&k * &k) * one_minus_cos
}

/// Builds the intrinsic matrix for a single shared focal length.
pub fn intrinsic_matrix<T: RealField>(f: T, cx: T, cy: T) -> Matrix3<T> {
    let mut k = Matrix3::identity();
    k[(0, 0)] = f.clone();
    k[(1, 1)] = f;
    k[(0, 2)] = cx;
    k[(1, 2)] = cy;
    k
}

/// Assembles the 3x4 projection matrix `K [R | t]`.
pub fn projection_matrix<T: RealField>(
    k: &Matrix3<T>,
    r: &Matrix3<T>,
    tvec: &Vector3<T>,
) -> Matrix3x4<T> {
    let mut rt = Matrix3x4::zeros();
    rt.fixed_view_mut::<3, 3>(0, 0).copy_from(r);
    rt.set_column(3, tvec);
    k * rt
}

/// Applies radial distortion (k1, k2) to normalized image coordinates.
pub fn distort<T: RealField>(x: T, y: T, k1: T, k2: T) -> (T, T) {
    let r2 = x.clone() * x.clone() + y.clone() * y.clone();
    let r4 = r2.clone() * r2.clone();
    let radial = T::one() + k1 * r2 + k2 * r4;
    (x * radial.clone(), y * radial)
}

/// Removes radial distortion from normalized image coordinates.
///
/// Solves `distort(x, y) = (xd, yd)` for `(x, y)` with Newton iterations on
/// the 2x2 distortion Jacobian, starting from the distorted coordinates. The
/// loop always returns its best estimate; for the moderate coefficients this
/// crate refines, convergence is reached well inside the iteration cap.
pub fn undistort<T: RealField>(xd: T, yd: T, k1: T, k2: T) -> (T, T) {
    let mut x = xd.clone();
    let mut y = yd.clone();
    let tol = T::from_f64(1e-12).unwrap();
    let two = T::from_f64(2.0).unwrap();

    for _ in 0..UNDISTORT_MAX_ITERATIONS {
        let r2 = x.clone() * x.clone() + y.clone() * y.clone();
        let r4 = r2.clone() * r2.clone();
        let radial = T::one() + k1.clone() * r2.clone() + k2.clone() * r4;

        let ex = x.clone() * radial.clone() - xd.clone();
        let ey = y.clone() * radial.clone() - yd.clone();
        if ex.clone().abs() + ey.clone().abs() < tol {
            break;
        }

        // d(radial)/dr2 scaled by dr2/dx = 2x (and 2y respectively).
        let dradial = k1.clone() + two.clone() * k2.clone() * r2;
        let dr_x = dradial.clone() * two.clone() * x.clone();
        let dr_y = dradial * two.clone() * y.clone();

        let j00 = radial.clone() + x.clone() * dr_x.clone();
        let j01 = x.clone() * dr_y.clone();
        let j10 = y.clone() * dr_x;
        let j11 = radial + y.clone() * dr_y;

        let det = j00.clone() * j11.clone() - j01.clone() * j10.clone();
        if det.clone().abs() < tol {
            break;
        }

        let dx = (j11 * ex.clone() - j01 * ey.clone()) / det.clone();
        let dy = (j00 * ey - j10 * ex) / det;
        x -= dx;
        y -= dy;
    }

    (x, y)
}

/// Triangulates every 3D point of a scene from all cameras that observe it,
/// as one batch of independent homogeneous 4x4 systems.
///
/// Each view contributes, for every observed pixel `(u, v)`, the two DLT rows
/// `r1 = u * P3 - P1` and `r2 = v * P3 - P2` to the normal matrix
/// `M = sum(r1' r1 + r2' r2)` of the point it observes. The accumulation
/// iterates over views (cameras), scattering into the per-point matrices, so
/// the cost stays linear in cameras x observations. The triangulated point is
/// the eigenvector of `M` for the smallest eigenvalue, de-homogenized.
///
/// Points observed by fewer than two views yield an ill-conditioned system;
/// filtering those out is the caller's contract and no error is raised here.
pub fn triangulate_all<'a, T, I>(views: I, n_points: usize) -> Vec<Vector3<T>>
where
    T: RealField,
    I: IntoIterator<Item = (Matrix3x4<T>, &'a [usize], &'a [Vector2<f64>])>,
{
    let mut normal = vec![Matrix4::<T>::zeros(); n_points];

    for (p, point_indices, pixels) in views {
        let p1 = p.row(0).clone_owned();
        let p2 = p.row(1).clone_owned();
        let p3 = p.row(2).clone_owned();

        for (&pt_idx, uv) in point_indices.iter().zip(pixels) {
            let u = T::from_f64(uv.x).unwrap();
            let v = T::from_f64(uv.y).unwrap();
            let r1 = p3.clone() * u - p1.clone();
            let r2 = p3.clone() * v - p2.clone();
            normal[pt_idx] += r1.transpose() * r1 + r2.transpose() * r2;
        }
    }

    normal
        .into_iter()
        .map(|m| {
            let eig = m.symmetric_eigen();
            let mut min_idx = 0;
            for i in 1..4 {
                if eig.eigenvalues[i] < eig.eigenvalues[min_idx] {
                    min_idx = i;
                }
            }
            let h = eig.eigenvectors.column(min_idx);
            let w = h[3].clone();
            Vector3::new(
                h[0].clone() / w.clone(),
                h[1].clone() / w.clone(),
                h[2].clone() / w,
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Rotation3;

    #[test]
    fn rodrigues_matches_nalgebra() {
        let rvec = Vector3::new(0.3, -0.2, 0.5);
        let r = rodrigues(&rvec);
        let expected = Rotation3::from_scaled_axis(rvec).into_inner();
        assert_relative_eq!(r, expected, epsilon = 1e-12);
    }

    #[test]
    fn rodrigues_small_angle_is_near_identity() {
        let rvec = Vector3::new(1e-14, 0.0, -1e-14);
        let r = rodrigues(&rvec);
        assert_relative_eq!(r, Matrix3::identity(), epsilon = 1e-12);
    }

    #[test]
    fn rodrigues_round_trips_through_scaled_axis() {
        let rvec = Vector3::new(-0.1, 0.4, 0.25);
        let r = rodrigues(&rvec);
        let recovered = Rotation3::from_matrix_unchecked(r).scaled_axis();
        assert_relative_eq!(recovered, rvec, epsilon = 1e-10);
    }

    #[test]
    fn undistort_inverts_distort() {
        let (k1, k2) = (-0.25, 0.06);
        for &(x, y) in &[(0.0, 0.0), (0.1, -0.2), (0.35, 0.3), (-0.4, 0.05)] {
            let (xd, yd) = distort(x, y, k1, k2);
            let (xu, yu) = undistort(xd, yd, k1, k2);
            assert_relative_eq!(xu, x, epsilon = 1e-9);
            assert_relative_eq!(yu, y, epsilon = 1e-9);
        }
    }

    #[test]
    fn distort_is_identity_for_zero_coefficients() {
        let (xd, yd) = distort(0.2, -0.3, 0.0, 0.0);
        assert_relative_eq!(xd, 0.2, epsilon = 1e-15);
        assert_relative_eq!(yd, -0.3, epsilon = 1e-15);
    }

    /// Two noiseless views must pin the point down to near machine precision.
    #[test]
    fn triangulation_recovers_exact_points() {
        let k = intrinsic_matrix(1000.0, 320.0, 240.0);
        let r_a = Matrix3::identity();
        let t_a = Vector3::new(0.0, 0.0, 10.0);
        let r_b = rodrigues(&Vector3::new(0.0, 0.4, 0.0));
        let t_b = Vector3::new(-2.0, 0.0, 11.0);

        let p_a = projection_matrix(&k, &r_a, &t_a);
        let p_b = projection_matrix(&k, &r_b, &t_b);

        let points = [
            Vector3::new(0.5, -0.2, 1.0),
            Vector3::new(-0.8, 0.3, 2.5),
            Vector3::new(0.1, 0.9, 0.4),
        ];

        let pixel = |p: &Matrix3x4<f64>, x: &Vector3<f64>| {
            let h = p * x.push(1.0);
            Vector2::new(h.x / h.z, h.y / h.z)
        };

        let indices: Vec<usize> = (0..points.len()).collect();
        let pixels_a: Vec<Vector2<f64>> = points.iter().map(|x| pixel(&p_a, x)).collect();
        let pixels_b: Vec<Vector2<f64>> = points.iter().map(|x| pixel(&p_b, x)).collect();

        let views = vec![
            (p_a, indices.as_slice(), pixels_a.as_slice()),
            (p_b, indices.as_slice(), pixels_b.as_slice()),
        ];
        let recovered = triangulate_all(views, points.len());

        for (got, want) in recovered.iter().zip(&points) {
            assert_relative_eq!(*got, *want, epsilon = 1e-8);
        }
    }

    /// A camera must only contribute to the points it actually observes.
    #[test]
    fn triangulation_scatters_partial_observations() {
        let k = intrinsic_matrix(800.0, 400.0, 300.0);
        let rotations = [
            Matrix3::identity(),
            rodrigues(&Vector3::new(0.0, 0.3, 0.0)),
            rodrigues(&Vector3::new(0.2, 0.0, 0.1)),
        ];
        let translations = [
            Vector3::new(0.0, 0.0, 8.0),
            Vector3::new(-1.5, 0.0, 8.0),
            Vector3::new(0.5, -1.0, 9.0),
        ];
        let projections: Vec<Matrix3x4<f64>> = rotations
            .iter()
            .zip(&translations)
            .map(|(r, t)| projection_matrix(&k, r, t))
            .collect();

        let points = [Vector3::new(0.3, 0.1, 1.2), Vector3::new(-0.4, 0.6, 0.8)];
        let pixel = |p: &Matrix3x4<f64>, x: &Vector3<f64>| {
            let h = p * x.push(1.0);
            Vector2::new(h.x / h.z, h.y / h.z)
        };

        // Camera 0 and 1 observe both points, camera 2 only the second one.
        let idx_full: Vec<usize> = vec![0, 1];
        let idx_partial: Vec<usize> = vec![1];
        let px0: Vec<Vector2<f64>> = points.iter().map(|x| pixel(&projections[0], x)).collect();
        let px1: Vec<Vector2<f64>> = points.iter().map(|x| pixel(&projections[1], x)).collect();
        let px2: Vec<Vector2<f64>> = vec![pixel(&projections[2], &points[1])];

        let views = vec![
            (projections[0], idx_full.as_slice(), px0.as_slice()),
            (projections[1], idx_full.as_slice(), px1.as_slice()),
            (projections[2], idx_partial.as_slice(), px2.as_slice()),
        ];
        let recovered = triangulate_all(views, points.len());

        for (got, want) in recovered.iter().zip(&points) {
            assert_relative_eq!(*got, *want, epsilon = 1e-8);
        }
    }
}
