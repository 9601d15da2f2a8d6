use nalgebra as na;
use num_traits::Float;

/// Weighted least squares fit of `y = a * x + b`, returns `(a, b)`.
///
/// `None` when the abscissas do not span a line (all equal or weights zero).
pub fn weighted_linear_ls<T: na::RealField + Float>(
    x: &na::DVector<T>,
    y: &na::DVector<T>,
    w: &na::DVector<T>,
) -> Option<na::Matrix2x1<T>> {
    let s_w = w.sum();
    let s_wx = w.zip_map(x, |w, x| w * x).sum();
    let s_wx2 = w.zip_map(x, |w, x| w * x * x).sum();
    let s_wxy = w.component_mul(x).zip_map(y, |wx, y| wx * y).sum();
    let s_wy = w.zip_map(y, |w, y| w * y).sum();

    let a = na::Matrix2::new(s_wx2, s_wx, s_wx, s_w);
    let b = na::Matrix2x1::new(s_wxy, s_wy);

    // relative conditioning of the normal equations
    let det = s_wx2 * s_w - s_wx * s_wx;
    let scale = s_wx2 * s_w;
    if !(scale > T::zero()) || det <= scale * T::from(1e-12)? {
        return None;
    }

    let qr_result = a.qr();
    let qty = qr_result.q().transpose() * b;
    let beta_hat = qr_result.r().solve_upper_triangular(&qty)?;

    if beta_hat.iter().all(|v| Float::is_finite(*v)) {
        Some(beta_hat)
    } else {
        None
    }
}

/// Least squares fit of `y = a x² + b x + c`, returns `(a, b, c)`.
pub fn quadratic_ls<T: na::RealField + Float>(
    x: &na::DVector<T>,
    y: &na::DVector<T>,
) -> Option<na::Matrix3x1<T>> {
    let n = T::from(x.len())?;

    let s_x1 = x.sum();
    let x2 = x.map(|x| x * x);
    let s_x2 = x2.sum();
    let x3 = x2.zip_map(x, |a, b| a * b);
    let s_x3 = x3.sum();
    let s_x4 = x3.zip_map(x, |a, b| a * b).sum();
    let s_x2y = x2.zip_map(y, |x, y| x * y).sum();
    let s_xy = x.zip_map(y, |x, y| x * y).sum();
    let s_y = y.sum();

    let a = na::Matrix3::new(s_x4, s_x3, s_x2, s_x3, s_x2, s_x1, s_x2, s_x1, n);
    let b = na::Matrix3x1::new(s_x2y, s_xy, s_y);

    let qr_result = a.qr();
    let qty = qr_result.q().transpose() * b;
    let beta_hat = qr_result.r().solve_upper_triangular(&qty)?;

    beta_hat
        .iter()
        .all(|v| Float::is_finite(*v))
        .then(|| beta_hat)
}

/// Weighted root mean square of the given residual magnitudes
pub fn weighted_rms<T: na::RealField + Float>(
    residuals: impl Iterator<Item = T>,
    w: &na::DVector<T>,
) -> T {
    let s_w = w.sum();
    let s = residuals
        .zip(w.iter())
        .fold(T::zero(), |acc, (r, &w)| acc + w * r * r);

    if s_w > T::zero() {
        Float::sqrt(s / s_w)
    } else {
        T::zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn fits_weighted_line() {
        let x = na::DVector::from_vec(vec![0.0, 1.0, 2.0, 3.0]);
        let y = x.map(|x| 3.0 * x - 2.0);
        let w = na::DVector::from_vec(vec![1.0, 0.5, 0.25, 2.0]);

        let beta = weighted_linear_ls(&x, &y, &w).unwrap();

        assert_abs_diff_eq!(beta[0], 3.0, epsilon = 1e-9);
        assert_abs_diff_eq!(beta[1], -2.0, epsilon = 1e-9);
    }

    #[test]
    fn weights_pull_towards_trusted_points() {
        let x = na::DVector::from_vec(vec![0.0, 1.0, 2.0]);
        let y = na::DVector::from_vec(vec![0.0, 1.0, 10.0]);

        let even = weighted_linear_ls(&x, &y, &na::DVector::from_element(3, 1.0)).unwrap();
        let skewed =
            weighted_linear_ls(&x, &y, &na::DVector::from_vec(vec![1.0, 1.0, 0.01])).unwrap();

        assert!(skewed[0] < even[0]);
    }

    #[test]
    fn degenerate_abscissas_have_no_fit() {
        let x = na::DVector::from_element(4, 2.0);
        let y = na::DVector::from_vec(vec![1.0, 2.0, 3.0, 4.0]);
        let w = na::DVector::from_element(4, 1.0);

        assert!(weighted_linear_ls(&x, &y, &w).is_none());
    }

    #[test]
    fn fits_parabola() {
        let x = na::DVector::from_vec(vec![0.0, 0.1, 0.2, 0.3, 0.4]);
        let y = x.map(|t| -490.5 * t * t + 300.0 * t + 120.0);

        let beta = quadratic_ls(&x, &y).unwrap();

        assert_abs_diff_eq!(beta[0], -490.5, epsilon = 1e-6);
        assert_abs_diff_eq!(beta[1], 300.0, epsilon = 1e-6);
        assert_abs_diff_eq!(beta[2], 120.0, epsilon = 1e-6);
    }

    #[test]
    fn rms_of_constant_residual() {
        let w = na::DVector::from_vec(vec![1.0, 3.0]);

        assert_abs_diff_eq!(weighted_rms([2.0, 2.0].into_iter(), &w), 2.0, epsilon = 1e-12);
    }
}
