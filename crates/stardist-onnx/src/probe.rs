//! Probe image construction and grid (output stride) estimation

use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SegmentationError};
use crate::inspect::{snap_shape, GraphConstraints};
use crate::layout::Layout;
use crate::session::InferenceSession;

/// Largest probe edge; large enough to see every downsampling stage
pub const PROBE_MAX_EDGE: usize = 256;

/// Integer input-to-output stride per spatial axis
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridSpec(pub Vec<usize>);

impl GridSpec {
    pub fn unit(ndim: usize) -> Self {
        Self(vec![1; ndim])
    }

    pub fn axes(&self) -> &[usize] {
        &self.0
    }

    /// Output extent for an input extent, rounding partial cells up
    pub fn output_shape(&self, input: &[usize]) -> Vec<usize> {
        input
            .iter()
            .zip(&self.0)
            .map(|(&s, &g)| s.div_ceil(g.max(1)))
            .collect()
    }
}

/// Spatial probe shape: capped, divisible, and snapped to the valid sizes
pub fn probe_shape(image_shape: &[usize], constraints: &GraphConstraints) -> Vec<usize> {
    let floored: Vec<usize> = image_shape
        .iter()
        .enumerate()
        .map(|(axis, &size)| {
            let div = divisor(constraints, axis);
            let capped = size.min(PROBE_MAX_EDGE);
            div.max(capped / div * div)
        })
        .collect();
    let snapped = snap_shape(&floored, constraints.patterns.as_deref(), &[]);
    snapped
        .iter()
        .enumerate()
        .map(|(axis, &size)| {
            let div = divisor(constraints, axis);
            let refloored = size / div * div;
            if refloored >= div {
                refloored
            } else {
                size
            }
        })
        .collect()
}

/// All-zero image of the probe shape, with the same rank as the real image
pub fn build_probe_image(image_shape: &[usize], constraints: &GraphConstraints) -> ArrayD<f32> {
    ArrayD::zeros(IxDyn(&probe_shape(image_shape, constraints)))
}

/// Run one forward pass on `probe` and derive the stride of the
/// probability output: `max(1, round(input / output))` per axis.
pub fn estimate_grid(
    session: &mut dyn InferenceSession,
    probe: &ArrayD<f32>,
    input_layout: Layout,
    prob_layout: Layout,
) -> Result<GridSpec> {
    let input = input_layout.wrap(probe)?;
    let outputs = session.run(&input)?;
    let out_spatial = prob_layout
        .spatial_dims(outputs.prob.shape())
        .ok_or_else(|| {
            SegmentationError::InvalidOutput(format!(
                "probability output shape {:?} does not match layout {}",
                outputs.prob.shape(),
                prob_layout
            ))
        })?;
    if out_spatial.len() != probe.ndim() {
        return Err(SegmentationError::InvalidOutput(format!(
            "probability output has {} spatial axes, expected {}",
            out_spatial.len(),
            probe.ndim()
        )));
    }
    let grid: Vec<usize> = probe
        .shape()
        .iter()
        .zip(out_spatial)
        .map(|(&input, &output)| {
            if output == 0 {
                1
            } else {
                ((input as f64 / output as f64).round() as usize).max(1)
            }
        })
        .collect();
    debug!(
        "Estimated grid {:?} from probe {:?} -> {:?}",
        grid,
        probe.shape(),
        out_spatial
    );
    Ok(GridSpec(grid))
}

fn divisor(constraints: &GraphConstraints, axis: usize) -> usize {
    constraints.divisibility.get(axis).copied().unwrap_or(1).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspect::ValidSizePattern;
    use crate::session::{ProviderKind, RawOutputs};

    /// Emits outputs downsampled by `factor` on every spatial axis
    struct StridedSession {
        factor: usize,
    }

    impl InferenceSession for StridedSession {
        fn run(&mut self, input: &ArrayD<f32>) -> Result<RawOutputs> {
            let shape = input.shape();
            let spatial: Vec<usize> = shape[1..shape.len() - 1]
                .iter()
                .map(|s| s / self.factor)
                .collect();
            let mut prob_shape = vec![1];
            prob_shape.extend(&spatial);
            prob_shape.push(1);
            let mut dist_shape = prob_shape.clone();
            *dist_shape.last_mut().unwrap() = 8;
            Ok(RawOutputs {
                prob: ArrayD::zeros(IxDyn(&prob_shape)),
                dist: ArrayD::zeros(IxDyn(&dist_shape)),
            })
        }

        fn provider(&self) -> ProviderKind {
            ProviderKind::Cpu
        }
    }

    fn constraints(div: usize, patterns: Option<Vec<ValidSizePattern>>) -> GraphConstraints {
        GraphConstraints {
            divisibility: vec![div, div],
            overlap: vec![0, 0],
            patterns,
        }
    }

    #[test]
    fn test_probe_respects_divisibility_after_snapping() {
        let residues = vec![1, 2, 3, 4, 13, 14, 15, 16, 29, 30, 31, 32, 45, 46, 47, 48];
        let pattern = ValidSizePattern {
            period: 60,
            residues,
            min_valid: 1,
        };
        let c = constraints(16, Some(vec![pattern.clone(), pattern]));
        let probe = build_probe_image(&[227, 303], &c);
        assert_eq!(probe.shape(), &[208, 256]);
        assert!(probe.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_probe_small_image_keeps_divisor() {
        let c = constraints(16, None);
        assert_eq!(probe_shape(&[10, 40], &c), vec![16, 32]);
    }

    #[test]
    fn test_estimate_grid() {
        let mut session = StridedSession { factor: 2 };
        let probe = ArrayD::zeros(IxDyn(&[64, 64]));
        let grid = estimate_grid(&mut session, &probe, Layout::Nhwc, Layout::Nhwc).unwrap();
        assert_eq!(grid, GridSpec(vec![2, 2]));
    }

    #[test]
    fn test_estimate_grid_zero_output_defaults_to_one() {
        let mut session = StridedSession { factor: 100 };
        let probe = ArrayD::zeros(IxDyn(&[64, 64]));
        let grid = estimate_grid(&mut session, &probe, Layout::Nhwc, Layout::Nhwc).unwrap();
        assert_eq!(grid, GridSpec(vec![1, 1]));
    }

    #[test]
    fn test_grid_output_shape_rounds_up() {
        assert_eq!(GridSpec(vec![2, 4]).output_shape(&[9, 16]), vec![5, 4]);
    }
}
