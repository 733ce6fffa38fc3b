//! Utility functions for sample smoothing and formatting

use time::{format_description, OffsetDateTime};

/// Format a timestamp for human-readable logging
///
/// Converts an OffsetDateTime to DD.MM.YYYY - HH:MM:SS format
/// Falls back to default string representation if formatting fails.
pub fn format_datetime(dt: &OffsetDateTime) -> String {
    format_description::parse("[day].[month].[year] - [hour]:[minute]:[second]")
        .ok()
        .and_then(|format| dt.format(&format).ok())
        .unwrap_or_else(|| dt.to_string())
}

/// Average of a batch with the highest and lowest valid sample discarded
///
/// NaN samples are skipped. If two or fewer valid samples remain there is
/// nothing meaningful left after discarding the outliers, and the result is
/// NaN.
pub fn average(samples: &[f32]) -> f32 {
    let (nan_count, min, max, total) = samples.iter().fold(
        (0usize, f32::INFINITY, f32::NEG_INFINITY, 0.0f64),
        |(nan_count, min, max, total), &value| {
            if value.is_nan() {
                (nan_count + 1, min, max, total)
            } else {
                (nan_count, min.min(value), max.max(value), total + f64::from(value))
            }
        },
    );
    if nan_count + 2 >= samples.len() {
        return f32::NAN;
    }

    let kept = total - f64::from(min) - f64::from(max);
    (kept / (samples.len() - nan_count - 2) as f64) as f32
}

/// Round to one decimal. NaN stays NaN.
pub fn round_to_tenth(value: f32) -> f32 {
    if value.is_nan() {
        return f32::NAN;
    }
    ((f64::from(value) * 10.0).round() / 10.0) as f32
}

/// Outlier-rejecting average rounded to one decimal
pub fn rounded_average(samples: &[f32]) -> f32 {
    round_to_tenth(average(samples))
}
