// Progress value encoding shared by the registry and the polling API

use crate::domain::error::{DomainError, Result};

/// Job is waiting in the queue (or was requeued for another attempt)
pub const PROGRESS_QUEUED: i32 = -1;

/// Encoding failed permanently
pub const PROGRESS_FAILED: i32 = -2;

/// Encoding finished and artifacts are published
pub const PROGRESS_COMPLETE: i32 = 100;

/// Highest value an in-flight encode may report.
/// 100 is reserved for "artifacts published".
pub const PROGRESS_ENCODING_CEILING: i32 = 99;

pub fn validate_progress(value: i32) -> Result<i32> {
    if (PROGRESS_FAILED..=PROGRESS_COMPLETE).contains(&value) {
        Ok(value)
    } else {
        Err(DomainError::InvalidProgress(value))
    }
}

/// Convert an engine-reported fraction (0.0..=1.0) into a whole percent.
///
/// Rounds down and caps at [`PROGRESS_ENCODING_CEILING`]; NaN maps to 0.
pub fn percent_from_fraction(fraction: f64) -> i32 {
    if !fraction.is_finite() || fraction <= 0.0 {
        return 0;
    }
    ((fraction * 100.0).floor() as i32).min(PROGRESS_ENCODING_CEILING)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_progress_range() {
        assert!(validate_progress(-2).is_ok());
        assert!(validate_progress(-1).is_ok());
        assert!(validate_progress(0).is_ok());
        assert!(validate_progress(100).is_ok());
        assert!(validate_progress(-3).is_err());
        assert!(validate_progress(101).is_err());
    }

    #[test]
    fn test_percent_from_fraction() {
        assert_eq!(percent_from_fraction(0.0), 0);
        assert_eq!(percent_from_fraction(0.426), 42);
        assert_eq!(percent_from_fraction(0.999), 99);
        assert_eq!(percent_from_fraction(1.0), 99);
        assert_eq!(percent_from_fraction(3.5), 99);
        assert_eq!(percent_from_fraction(-0.2), 0);
        assert_eq!(percent_from_fraction(f64::NAN), 0);
    }
}
