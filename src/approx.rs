//! Tolerances and numerical checks for `f32` results.
//!
//! Kernels run in single precision and reduce in whatever order rayon picks,
//! so tests compare against tolerances rather than exact values. The finite
//! difference helpers are what gradient checks are built on.

/// The max epsilon accepted on `f32`s.
pub const F32_MAX_ERROR: f32 = 1e-3;

/// The expected epsilon accepted on `f32`s.
pub const F32_AVG_ERROR: f32 = 1e-5;

/// The best expected epsilon accepted on `f32`s.
pub const F32_MIN_ERROR: f32 = 1e-6;

/// Step of [`finite_diff_scalar`].
pub const SCALAR_STEP: f32 = 1e-3;

/// Step of [`finite_diff_grad`]. Larger than [`SCALAR_STEP`] because the
/// perturbed function is usually a whole graph whose rounding error grows
/// with its size.
pub const GRAD_STEP: f32 = 1e-2;

/// How close two values are, in the bands above.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ApproxEquality {
    /// Within [`F32_MIN_ERROR`].
    Precise = 0,
    /// Within [`F32_AVG_ERROR`].
    Partial = 1,
    /// Within [`F32_MAX_ERROR`].
    Relative = 2,
    /// Further apart.
    Scarce = 3,
}

impl ApproxEquality {
    /// Band of `|a - b|`. Non-finite values only match themselves.
    pub fn of(a: f32, b: f32) -> Self {
        if a == b {
            return Self::Precise;
        }
        let dif = (a - b).abs();
        if dif < F32_MIN_ERROR {
            Self::Precise
        } else if dif < F32_AVG_ERROR {
            Self::Partial
        } else if dif < F32_MAX_ERROR {
            Self::Relative
        } else {
            Self::Scarce
        }
    }

    /// Worst band over two equally long slices; `Scarce` if the lengths differ.
    pub fn of_slices(a: &[f32], b: &[f32]) -> Self {
        if a.len() != b.len() {
            return Self::Scarce;
        }
        a.iter()
            .zip(b)
            .map(|(&x, &y)| Self::of(x, y))
            .max()
            .unwrap_or(Self::Precise)
    }
}

/// Returns `true` if `|a - b| < tol`, or both are the same non-finite value.
pub fn approx_eq(a: f32, b: f32, tol: f32) -> bool {
    a == b || (a - b).abs() < tol
}

/// Largest elementwise distance between two equally long slices.
///
/// # Panics
/// Panics if the lengths differ.
pub fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len(), "length mismatch: {} vs {}", a.len(), b.len());
    a.iter()
        .zip(b)
        .map(|(x, y)| if x == y { 0.0 } else { (x - y).abs() })
        .fold(0.0, f32::max)
}

/// Asserts that every element of `actual` is within `tol` of `expected`.
///
/// # Panics
/// Panics with the first offending index on mismatch.
#[track_caller]
pub fn assert_slices_close(actual: &[f32], expected: &[f32], tol: f32) {
    assert_eq!(
        actual.len(),
        expected.len(),
        "length mismatch: {actual:?} vs {expected:?}"
    );
    for (i, (&a, &e)) in actual.iter().zip(expected).enumerate() {
        assert!(
            approx_eq(a, e, tol),
            "index {i}: {a} vs {e} (tolerance {tol})\n  actual:   {actual:?}\n  expected: {expected:?}"
        );
    }
}

/// Central difference `(f(x+h) - f(x-h)) / 2h` with `h = SCALAR_STEP`.
pub fn finite_diff_scalar(f: impl Fn(f32) -> f32, x: f32) -> f32 {
    (f(x + SCALAR_STEP) - f(x - SCALAR_STEP)) / (2.0 * SCALAR_STEP)
}

/// Central-difference gradient of `f` at `x`, one component at a time.
///
/// `x` is perturbed in place and restored before returning.
pub fn finite_diff_grad(x: &mut [f32], mut f: impl FnMut(&[f32]) -> f32) -> Vec<f32> {
    let mut grad = Vec::with_capacity(x.len());
    for i in 0..x.len() {
        let orig = x[i];
        x[i] = orig + GRAD_STEP;
        let plus = f(x);
        x[i] = orig - GRAD_STEP;
        let minus = f(x);
        x[i] = orig;
        grad.push((plus - minus) / (2.0 * GRAD_STEP));
    }
    grad
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bands() {
        assert_eq!(ApproxEquality::of(1.0, 1.0), ApproxEquality::Precise);
        assert_eq!(ApproxEquality::of(1.0, 1.000_05), ApproxEquality::Relative);
        assert_eq!(ApproxEquality::of(f32::NAN, 0.0), ApproxEquality::Scarce);
        assert_eq!(
            ApproxEquality::of(f32::NEG_INFINITY, f32::NEG_INFINITY),
            ApproxEquality::Precise
        );
        assert_eq!(
            ApproxEquality::of_slices(&[1.0, 2.0], &[1.0, 2.5]),
            ApproxEquality::Scarce
        );
    }

    #[test]
    fn gradient_of_quadratic() {
        let mut x = [1.0, -2.0, 0.5];
        let g = finite_diff_grad(&mut x, |v| v.iter().map(|a| a * a).sum());
        assert_slices_close(&g, &[2.0, -4.0, 1.0], F32_MAX_ERROR);
        assert_eq!(x, [1.0, -2.0, 0.5]);
    }

    #[test]
    fn scalar_derivative() {
        let d = finite_diff_scalar(|x| x * x * x, 2.0);
        assert!(approx_eq(d, 12.0, 1e-2));
        assert_eq!(max_abs_diff(&[1.0, f32::INFINITY], &[1.5, f32::INFINITY]), 0.5);
    }
}
