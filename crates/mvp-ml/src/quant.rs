//! Fixed-point constants and fp16 range checks shared by the kernels.
//!
//! Accumulation runs in fp16. Inputs are scaled down by
//! [`ACCUMULATOR_SCALER`] before they are summed so that long reductions stay
//! inside the fp16 range, and the scale is undone with
//! [`ACCUMULATOR_MULTIPLIER`] folded into the final per-channel factor.

use half::f16;
use mvp_driver::{MvpError, Result};

/// Scale applied to every input before accumulation (2^-10).
pub const ACCUMULATOR_SCALER: f32 = 1.0 / 1024.0;

/// Inverse of [`ACCUMULATOR_SCALER`] (2^10).
pub const ACCUMULATOR_MULTIPLIER: f32 = 1024.0;

/// Smallest positive normal fp16 value.
pub const FP16_MIN_NORMAL: f32 = 1.0 / 16384.0;

/// Largest finite fp16 value.
pub const FP16_MAX: f32 = 65504.0;

/// True if `value` is a positive fp16 normal number.
pub fn is_fp16_normal(value: f32) -> bool {
    (FP16_MIN_NORMAL..=FP16_MAX).contains(&value)
}

/// Require `value` to be representable as a finite fp16.
///
/// # Errors
///
/// Returns `InvalidRange` naming `what` otherwise.
pub fn check_fp16(value: f32, what: &str) -> Result<f16> {
    if value.is_finite() && value.abs() <= FP16_MAX {
        Ok(f16::from_f32(value))
    } else {
        Err(MvpError::invalid_range(format!(
            "{what} {value} does not fit in fp16"
        )))
    }
}

/// Saturating round-half-to-even conversion to int8, as the store path does.
#[allow(clippy::cast_possible_truncation)]
pub fn saturate_i8(value: f32) -> i8 {
    if value.is_nan() {
        return 0;
    }
    value.round_ties_even().clamp(-128.0, 127.0) as i8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaler_and_multiplier_cancel() {
        assert!((ACCUMULATOR_SCALER * ACCUMULATOR_MULTIPLIER - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_fp16_normal_bounds() {
        assert!(is_fp16_normal(1.0));
        assert!(is_fp16_normal(FP16_MAX));
        assert!(!is_fp16_normal(0.0));
        assert!(!is_fp16_normal(1.0e-6));
        assert!(!is_fp16_normal(70000.0));
        assert_eq!(f16::MIN_POSITIVE.to_f32(), FP16_MIN_NORMAL);
    }

    #[test]
    fn test_check_fp16() {
        assert_eq!(check_fp16(0.5, "scale").unwrap().to_f32(), 0.5);
        let err = check_fp16(1.0e6, "bias").unwrap_err();
        assert_eq!(err.kind(), mvp_driver::ErrorKind::InvalidRange);
        assert!(check_fp16(f32::NAN, "bias").is_err());
    }

    #[test]
    fn test_saturate_i8() {
        assert_eq!(saturate_i8(2.5), 2);
        assert_eq!(saturate_i8(3.5), 4);
        assert_eq!(saturate_i8(-2.5), -2);
        assert_eq!(saturate_i8(300.0), 127);
        assert_eq!(saturate_i8(-300.0), -128);
        assert_eq!(saturate_i8(f32::NAN), 0);
    }
}
