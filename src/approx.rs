//! Approximate equality of floating point values.
//!
//! Kernels on different backends (and `rayon` reductions in different
//! orders) do not produce bit-identical results, so comparisons grade the
//! relative distance instead of testing `==`.

/// Largest relative error still considered equal.
pub const F32_MAX_ERROR: f32 = 1e-3;

/// Relative error expected from a well-conditioned kernel.
pub const F32_AVG_ERROR: f32 = 1e-5;

/// Relative error of an exact computation up to rounding.
pub const F32_MIN_ERROR: f32 = 1e-6;

/// How close two values are.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ApproxEquality {
    /// Within [`F32_MIN_ERROR`].
    Precise = 0,
    /// Within [`F32_AVG_ERROR`].
    Partial = 1,
    /// Within [`F32_MAX_ERROR`].
    Relative = 2,
    /// Not equal.
    Scarce = 3,
}

/// Grades the relative distance between `self` and `rhs`.
pub trait RelativeEq<Rhs: ?Sized> {
    fn approx_eq(&self, rhs: &Rhs) -> ApproxEquality;
}

impl RelativeEq<Self> for f32 {
    fn approx_eq(&self, rhs: &Self) -> ApproxEquality {
        if self == rhs {
            return ApproxEquality::Precise;
        }
        if self.is_nan() || rhs.is_nan() {
            return ApproxEquality::Scarce;
        }
        let scale = self.abs().max(rhs.abs()).max(1.0);
        let dif = (self - rhs).abs() / scale;

        if dif < F32_MIN_ERROR {
            ApproxEquality::Precise
        } else if dif < F32_AVG_ERROR {
            ApproxEquality::Partial
        } else if dif < F32_MAX_ERROR {
            ApproxEquality::Relative
        } else {
            ApproxEquality::Scarce
        }
    }
}

impl<T: RelativeEq<U>, U> RelativeEq<[U]> for [T] {
    /// The worst grade over all element pairs; slices of different lengths
    /// are never equal.
    fn approx_eq(&self, rhs: &[U]) -> ApproxEquality {
        if self.len() != rhs.len() {
            return ApproxEquality::Scarce;
        }
        self.iter()
            .zip(rhs)
            .map(|(a, b)| a.approx_eq(b))
            .max()
            .unwrap_or(ApproxEquality::Precise)
    }
}

impl<const N: usize, T: RelativeEq<U>, U> RelativeEq<[U; N]> for [T; N] {
    fn approx_eq(&self, rhs: &[U; N]) -> ApproxEquality {
        self[..].approx_eq(&rhs[..])
    }
}

impl<T: RelativeEq<U>, U> RelativeEq<Vec<U>> for Vec<T> {
    fn approx_eq(&self, rhs: &Vec<U>) -> ApproxEquality {
        self[..].approx_eq(&rhs[..])
    }
}

/// Whether `a` and `b` agree to within [`F32_AVG_ERROR`].
pub fn approx_eq<A: RelativeEq<B> + ?Sized, B: ?Sized>(a: &A, b: &B) -> bool {
    a.approx_eq(b) <= ApproxEquality::Partial
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grades_by_relative_distance() {
        assert_eq!(1.0_f32.approx_eq(&1.0), ApproxEquality::Precise);
        assert_eq!(1000.0_f32.approx_eq(&1000.005), ApproxEquality::Partial);
        assert_eq!(1.0_f32.approx_eq(&1.0005), ApproxEquality::Relative);
        assert_eq!(1.0_f32.approx_eq(&1.1), ApproxEquality::Scarce);
        assert_eq!(f32::NAN.approx_eq(&f32::NAN), ApproxEquality::Scarce);
    }

    #[test]
    fn slices_take_the_worst_grade() {
        assert!(approx_eq(&[1.0_f32, 2.0][..], &[1.0, 2.000_001][..]));
        assert!(!approx_eq(&[1.0_f32, 2.0][..], &[1.0][..]));
        assert!(!approx_eq(&vec![1.0_f32, 2.0], &vec![1.0, 3.0]));
    }
}
