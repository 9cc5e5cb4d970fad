//! Image rescaling and intensity normalization applied before inference

use ndarray::{ArrayD, Axis, IxDyn, Zip};
use tracing::debug;

use crate::error::{Result, SegmentationError};

/// Denominator floor for percentile normalization
pub const NORMALIZE_EPS: f32 = 1e-6;

/// Zoom factor that brings objects of `object_diameter_px` to the size the
/// network was trained on
pub fn scale_factor(reference_diameter_px: f32, object_diameter_px: f32) -> Result<f32> {
    if !object_diameter_px.is_finite() || object_diameter_px <= 0.0 {
        return Err(SegmentationError::InvalidDiameter(object_diameter_px));
    }
    Ok(reference_diameter_px / object_diameter_px)
}

/// Factors within this distance of 1 leave the image untouched
fn is_unit_scale(factor: f32) -> bool {
    (factor - 1.0).abs() <= 1e-8 + 1e-5 * factor.abs()
}

/// Rescale every axis by `factor` with linear interpolation.
///
/// Output length is `round(len * factor)`; the first and last samples of
/// each axis map onto the first and last input samples. Returns `None`
/// when `factor` is effectively 1.
pub fn rescale(image: &ArrayD<f32>, factor: f32) -> Result<Option<ArrayD<f32>>> {
    if is_unit_scale(factor) {
        return Ok(None);
    }
    let target: Vec<usize> = image
        .shape()
        .iter()
        .map(|&len| (len as f64 * factor as f64).round() as usize)
        .collect();
    if target.iter().any(|&len| len == 0) {
        return Err(SegmentationError::EmptyAfterScaling {
            factor,
            shape: target,
        });
    }
    let zoomed = zoom_linear(image, &target);
    debug!(
        "Rescaled image {:?} -> {:?} (factor {:.4})",
        image.shape(),
        zoomed.shape(),
        factor
    );
    Ok(Some(zoomed))
}

/// Separable linear resampling to `target`
pub fn zoom_linear(image: &ArrayD<f32>, target: &[usize]) -> ArrayD<f32> {
    let mut current = image.to_owned();
    for (axis, &out_len) in target.iter().enumerate() {
        if current.shape()[axis] == out_len {
            continue;
        }
        current = zoom_axis(&current, axis, out_len);
    }
    current
}

fn zoom_axis(image: &ArrayD<f32>, axis: usize, out_len: usize) -> ArrayD<f32> {
    let in_len = image.shape()[axis];
    let mut shape = image.shape().to_vec();
    shape[axis] = out_len;
    let mut out = ArrayD::<f32>::zeros(IxDyn(&shape));
    if in_len == 0 {
        return out;
    }
    let ratio = if out_len > 1 {
        (in_len - 1) as f64 / (out_len - 1) as f64
    } else {
        0.0
    };
    let taps: Vec<(usize, usize, f32)> = (0..out_len)
        .map(|i| {
            let x = i as f64 * ratio;
            let lo = (x.floor() as usize).min(in_len - 1);
            let hi = (lo + 1).min(in_len - 1);
            (lo, hi, (x - lo as f64) as f32)
        })
        .collect();

    Zip::from(out.lanes_mut(Axis(axis)))
        .and(image.lanes(Axis(axis)))
        .for_each(|mut dst, src| {
            for (d, &(lo, hi, w)) in dst.iter_mut().zip(&taps) {
                *d = src[lo] * (1.0 - w) + src[hi] * w;
            }
        });
    out
}

/// Min/max scale intensities to `[0, 1]`, ignoring NaN.
///
/// Images with a non-finite bound or a flat range are returned unchanged.
pub fn scale_intensity(image: &mut ArrayD<f32>) -> bool {
    let (min, max) = image
        .iter()
        .filter(|v| !v.is_nan())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    if !min.is_finite() || !max.is_finite() || max <= min {
        return false;
    }
    let range = max - min;
    image.mapv_inplace(|v| (v - min) / range);
    true
}

/// Percentile with linear interpolation between order statistics.
///
/// Non-finite values are ignored; `None` when nothing finite remains.
pub fn percentile(values: &ArrayD<f32>, q: f32) -> Option<f32> {
    let mut sorted: Vec<f32> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(f32::total_cmp);
    Some(percentile_sorted(&sorted, q))
}

fn percentile_sorted(sorted: &[f32], q: f32) -> f32 {
    let rank = (q.clamp(0.0, 100.0) as f64 / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = (lo + 1).min(sorted.len() - 1);
    let w = (rank - lo as f64) as f32;
    sorted[lo] + (sorted[hi] - sorted[lo]) * w
}

/// Percentile normalization clipped to `[0, 1]`
pub fn normalize_percentile(image: &mut ArrayD<f32>, pmin: f32, pmax: f32) -> Result<()> {
    if pmax <= pmin {
        return Err(SegmentationError::InvalidSettings(format!(
            "pmax ({pmax}) must be greater than pmin ({pmin})"
        )));
    }
    let mut sorted: Vec<f32> = image.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return Ok(());
    }
    sorted.sort_by(f32::total_cmp);
    let lo = percentile_sorted(&sorted, pmin);
    let hi = percentile_sorted(&sorted, pmax);
    let mut scale = hi - lo;
    if scale < NORMALIZE_EPS {
        scale = 1.0;
    }
    debug!("Percentile normalization: lo={lo}, hi={hi}");
    image.mapv_inplace(|v| ((v - lo) / scale).clamp(0.0, 1.0));
    Ok(())
}
