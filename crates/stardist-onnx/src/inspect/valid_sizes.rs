//! Empirical discovery of the input sizes a graph accepts.
//!
//! Some architectures reject sizes that plain divisibility would allow (for
//! example networks that need `size % 16 == 1`). Running the session on
//! all-zero inputs of every size up to `max_probe` and summarizing the
//! accepted sizes as residues modulo a period captures those rules.

use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::divisibility::gcd;
use crate::error::{Result, SegmentationError};
use crate::layout::Layout;
use crate::session::InferenceSession;

/// Largest size probed per axis by default
pub const DEFAULT_MAX_PROBE: usize = 64;

/// Valid sizes along one axis: `size >= min_valid` and `size % period` in `residues`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidSizePattern {
    pub period: usize,
    pub residues: Vec<usize>,
    pub min_valid: usize,
}

impl ValidSizePattern {
    pub fn is_valid(&self, size: usize) -> bool {
        size >= self.min_valid && self.residues.contains(&(size % self.period.max(1)))
    }

    /// Nearest valid size at or below `size`, or the next one above when
    /// nothing at or above `min_valid` qualifies below
    pub fn snap(&self, size: usize) -> usize {
        if self.is_valid(size) {
            return size;
        }
        if let Some(s) = (self.min_valid..size).rev().find(|&s| self.is_valid(s)) {
            return s;
        }
        let period = self.period.max(1);
        (size + 1..=size.max(self.min_valid) + period)
            .find(|&s| self.is_valid(s))
            .unwrap_or(size)
    }
}

/// Snap every axis not listed in `skip_axes` to its pattern
pub fn snap_shape(
    shape: &[usize],
    patterns: Option<&[ValidSizePattern]>,
    skip_axes: &[usize],
) -> Vec<usize> {
    let Some(patterns) = patterns else {
        return shape.to_vec();
    };
    shape
        .iter()
        .enumerate()
        .map(|(axis, &size)| match patterns.get(axis) {
            Some(p) if !skip_axes.contains(&axis) => p.snap(size),
            _ => size,
        })
        .collect()
}

/// Probe the session to find the valid-size pattern of every spatial axis.
///
/// The other axes are held at the smallest symmetric size that runs.
pub fn infer_valid_size_patterns(
    session: &mut dyn InferenceSession,
    layout: Layout,
    ndim: usize,
    max_probe: usize,
) -> Result<Vec<ValidSizePattern>> {
    if ndim != 2 && ndim != 3 {
        return Err(SegmentationError::InvalidSettings(format!(
            "valid-size probing supports 2 or 3 spatial axes, got {ndim}"
        )));
    }
    let base = (1..=max_probe)
        .find(|&s| try_run(session, layout, &vec![s; ndim]))
        .ok_or_else(|| {
            SegmentationError::InvalidGraph(
                "failed to find a valid base size for probing".to_string(),
            )
        })?;
    debug!("Valid-size probing base size {}", base);

    let mut patterns = Vec::with_capacity(ndim);
    for axis in 0..ndim {
        let valid: Vec<usize> = (1..=max_probe)
            .filter(|&size| {
                let mut shape = vec![base; ndim];
                shape[axis] = size;
                try_run(session, layout, &shape)
            })
            .collect();
        let Some(&min_valid) = valid.first() else {
            return Err(SegmentationError::InvalidGraph(format!(
                "no valid sizes found for axis {axis} within 1..{max_probe}"
            )));
        };
        let (period, residues) = infer_period_and_residues(&valid, max_probe);
        debug!(axis, period, ?residues, min_valid, "Inferred valid-size pattern");
        patterns.push(ValidSizePattern {
            period,
            residues,
            min_valid,
        });
    }
    Ok(patterns)
}

fn try_run(session: &mut dyn InferenceSession, layout: Layout, spatial: &[usize]) -> bool {
    let input = ArrayD::<f32>::zeros(IxDyn(&layout.input_shape(spatial)));
    match session.run(&input) {
        Ok(_) => true,
        Err(e) => {
            trace!("Probe {:?} rejected: {}", spatial, e);
            false
        }
    }
}

/// Smallest period whose residue set exactly predicts validity on
/// `[min_valid, max_probe]`; otherwise the GCD of the gaps between valid sizes
pub fn infer_period_and_residues(valid: &[usize], max_probe: usize) -> (usize, Vec<usize>) {
    let Some(&min_valid) = valid.iter().min() else {
        return (1, vec![0]);
    };
    let is_valid = |s: usize| valid.contains(&s);

    for period in 1..=max_probe {
        let mut residues: Vec<usize> = valid.iter().map(|v| v % period).collect();
        residues.sort_unstable();
        residues.dedup();
        let consistent =
            (min_valid..=max_probe).all(|s| residues.contains(&(s % period)) == is_valid(s));
        if consistent {
            return (period, residues);
        }
    }

    if valid.len() < 2 {
        let period = valid[0].max(1);
        return (period, vec![valid[0] % period]);
    }
    let period = valid
        .windows(2)
        .filter(|w| w[1] > w[0])
        .map(|w| w[1] - w[0])
        .fold(0, gcd)
        .max(1);
    let mut residues: Vec<usize> = valid.iter().map(|v| v % period).collect();
    residues.sort_unstable();
    residues.dedup();
    (period, residues)
}
