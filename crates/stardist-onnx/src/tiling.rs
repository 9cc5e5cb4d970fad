//! Tile planning and overlap-aware tiled inference

use ndarray::{ArrayD, Dimension, IxDyn, Slice};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::TilingPolicy;
use crate::error::{Result, SegmentationError};
use crate::inspect::{snap_shape, GraphConstraints};
use crate::layout::IoLayouts;
use crate::probe::GridSpec;
use crate::session::InferenceSession;

/// Tile geometry for one inference call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TilingPlan {
    pub tile_shape: Vec<usize>,
    pub overlap: Vec<usize>,
    /// Extra voxels appended at the end of each axis
    pub padding: Vec<usize>,
}

impl TilingPlan {
    /// Distance between consecutive tile origins, a positive multiple of the grid
    pub fn step(&self, grid: &GridSpec) -> Vec<usize> {
        self.tile_shape
            .iter()
            .zip(&self.overlap)
            .zip(grid.axes())
            .map(|((&t, &o), &g)| {
                let g = g.max(1);
                g.max(t.saturating_sub(o) / g * g)
            })
            .collect()
    }

    /// Tile origins along each axis for an image of `shape`.
    ///
    /// Interior tiles advance by the step. The last tile is pulled back so
    /// it ends flush with the image, rounded up to the grid, instead of
    /// running past it.
    pub fn origins(&self, shape: &[usize], grid: &GridSpec) -> Vec<Vec<usize>> {
        shape
            .iter()
            .zip(&self.tile_shape)
            .zip(self.step(grid))
            .zip(grid.axes())
            .map(|(((&size, &tile), step), &g)| {
                let extent = covered_extent(size, tile, g.max(1));
                let n = 1 + (extent - tile).div_ceil(step);
                (0..n)
                    .map(|k| if k + 1 == n { extent - tile } else { k * step })
                    .collect()
            })
            .collect()
    }

    /// Number of tiles along each axis for an image of `shape`
    pub fn tile_counts(&self, shape: &[usize], grid: &GridSpec) -> Vec<usize> {
        self.origins(shape, grid).iter().map(Vec::len).collect()
    }

    /// Recompute padding for the grid-aligned origins actually used
    pub fn aligned(&self, shape: &[usize], grid: &GridSpec) -> TilingPlan {
        let padding = shape
            .iter()
            .zip(&self.tile_shape)
            .zip(grid.axes())
            .map(|((&s, &t), &g)| covered_extent(s, t, g.max(1)) - s)
            .collect();
        TilingPlan {
            tile_shape: self.tile_shape.clone(),
            overlap: self.overlap.clone(),
            padding,
        }
    }
}

/// Smallest extent `>= size` covered by whole tiles whose origins are
/// multiples of the grid. Padding only appears when the image is smaller
/// than one tile or not a multiple of the grid.
fn covered_extent(size: usize, tile: usize, g: usize) -> usize {
    let extent = tile.max(size.div_ceil(g) * g);
    (extent - tile).div_ceil(g) * g + tile
}

/// Choose a tile shape and overlap for `image_shape`.
///
/// Each axis is capped (at `ceil(size / n_tiles)` and `max_tile_edge`),
/// floored to a multiple of its divisibility but never below it, snapped to
/// the valid-size pattern, and optionally floored to the divisibility again.
/// The overlap is clamped below the tile size.
pub fn plan_tiles(
    image_shape: &[usize],
    constraints: &GraphConstraints,
    policy: &TilingPolicy,
) -> TilingPlan {
    let ndim = image_shape.len();
    let div = |axis: usize| constraints.divisibility.get(axis).copied().unwrap_or(1).max(1);

    let capped: Vec<usize> = image_shape
        .iter()
        .enumerate()
        .map(|(axis, &size)| {
            let mut tile = size.max(1).div_ceil(policy.n_tiles.max(1));
            let uncapped_z = policy.cap_xy_only && ndim == 3 && axis == 0;
            if !uncapped_z {
                tile = tile.min(policy.max_tile_edge);
            }
            let d = div(axis);
            d.max(tile / d * d)
        })
        .collect();

    let snapped = snap_shape(
        &capped,
        constraints.patterns.as_deref(),
        &policy.snap_skip_axes,
    );
    let tile_shape: Vec<usize> = snapped
        .iter()
        .enumerate()
        .map(|(axis, &tile)| {
            if policy.enforce_post_snap_divisibility {
                let d = div(axis);
                d.max(tile / d * d)
            } else {
                tile
            }
        })
        .collect();

    let overlap: Vec<usize> = tile_shape
        .iter()
        .enumerate()
        .map(|(axis, &tile)| {
            let o = constraints.overlap.get(axis).copied().unwrap_or(0);
            o.min(tile.saturating_sub(1))
        })
        .collect();

    let plan = TilingPlan {
        padding: tile_shape
            .iter()
            .zip(image_shape)
            .map(|(&t, &s)| t.saturating_sub(s))
            .collect(),
        tile_shape,
        overlap,
    };
    let plan = plan.aligned(image_shape, &GridSpec::unit(ndim));
    debug!(
        tile_shape = ?plan.tile_shape,
        overlap = ?plan.overlap,
        "Planned tiles for image {:?}",
        image_shape
    );
    plan
}

/// Stitched full-image network output
#[derive(Debug, Clone)]
pub struct TiledPrediction {
    /// Probability map, `ceil(size / grid)` per axis
    pub prob: ArrayD<f32>,
    /// Ray distances, spatial axes of `prob` plus one ray axis
    pub dist: ArrayD<f32>,
    /// Plan with the padding actually applied
    pub plan: TilingPlan,
    pub tiles: usize,
}

/// Run the network tile by tile and stitch the outputs.
///
/// Tiles stay inside the image: the last tile on each axis is shifted back
/// to end at the image edge, and reflect padding is only added when the
/// image is smaller than a tile or not a multiple of the grid. Tiles are
/// visited in raster order; each writes only its interior, bounded at the
/// midpoint of the overlap with its neighbours rounded down to a multiple
/// of the grid.
pub fn run_tiled_inference(
    image: &ArrayD<f32>,
    session: &mut dyn InferenceSession,
    plan: &TilingPlan,
    grid: &GridSpec,
    layouts: IoLayouts,
) -> Result<TiledPrediction> {
    let shape = image.shape().to_vec();
    let ndim = shape.len();
    if plan.tile_shape.len() != ndim || grid.axes().len() != ndim {
        return Err(SegmentationError::InvalidSettings(format!(
            "tile shape {:?} and grid {:?} must match image rank {}",
            plan.tile_shape,
            grid.axes(),
            ndim
        )));
    }
    let plan = plan.aligned(&shape, grid);
    let origins = plan.origins(&shape, grid);
    let counts: Vec<usize> = origins.iter().map(Vec::len).collect();
    let g: Vec<usize> = grid.axes().iter().map(|&g| g.max(1)).collect();
    let out_shape = grid.output_shape(&shape);

    let padded_shape: Vec<usize> = shape.iter().zip(&plan.padding).map(|(s, p)| s + p).collect();
    let padded = reflect_pad(image, &padded_shape);
    let total: usize = counts.iter().product();
    info!(
        "Tiled inference: image {:?}, tile {:?}, overlap {:?}, step {:?}, {} tiles",
        shape,
        plan.tile_shape,
        plan.overlap,
        plan.step(grid),
        total
    );

    // cuts[axis][k] is the first image position owned by tile k
    let cuts: Vec<Vec<usize>> = (0..ndim)
        .map(|a| {
            let t = plan.tile_shape[a];
            let o = &origins[a];
            let mut cuts: Vec<usize> = (0..o.len())
                .map(|k| {
                    if k == 0 {
                        0
                    } else {
                        // Midpoint of the region shared with the previous tile
                        let mid = (o[k] + (o[k - 1] + t).max(o[k])) / 2;
                        (mid / g[a] * g[a]).max(o[k])
                    }
                })
                .collect();
            cuts.push(padded_shape[a]);
            cuts
        })
        .collect();

    let mut prob_out = ArrayD::<f32>::zeros(IxDyn(&out_shape));
    let mut dist_out: Option<ArrayD<f32>> = None;

    for tile_index in ndarray::indices(IxDyn(&counts)) {
        let k = tile_index.slice();
        let origin: Vec<usize> = (0..ndim).map(|a| origins[a][k[a]]).collect();
        let tile = padded
            .slice_each_axis(|ax| {
                let a = ax.axis.index();
                Slice::from(origin[a]..origin[a] + plan.tile_shape[a])
            })
            .to_owned();

        let raw = session.run(&layouts.input.wrap(&tile)?)?;
        let prob_tile = layouts.prob.unwrap_output(raw.prob)?;
        let dist_tile = layouts.dist.unwrap_output(raw.dist)?;
        if prob_tile.ndim() != ndim + 1 || dist_tile.ndim() != ndim + 1 {
            return Err(SegmentationError::InvalidOutput(format!(
                "tile outputs {:?} / {:?} do not match image rank {}",
                prob_tile.shape(),
                dist_tile.shape(),
                ndim
            )));
        }
        let n_rays = dist_tile.shape()[ndim];
        let dist_out = dist_out.get_or_insert_with(|| {
            let mut s = out_shape.clone();
            s.push(n_rays);
            ArrayD::zeros(IxDyn(&s))
        });
        if dist_out.shape()[ndim] != n_rays {
            return Err(SegmentationError::InvalidOutput(format!(
                "ray count changed between tiles ({} vs {})",
                dist_out.shape()[ndim],
                n_rays
            )));
        }

        // Global output range and tile-local output range per axis
        let mut global = Vec::with_capacity(ndim);
        let mut local = Vec::with_capacity(ndim);
        for a in 0..ndim {
            let start = cuts[a][k[a]] / g[a];
            let end = (cuts[a][k[a] + 1].min(shape[a]).div_ceil(g[a])).min(out_shape[a]);
            let local_start = start - origin[a] / g[a];
            let available = prob_tile.shape()[a].min(dist_tile.shape()[a]);
            let len = end.saturating_sub(start).min(available.saturating_sub(local_start));
            global.push(start..start + len);
            local.push(local_start..local_start + len);
        }

        prob_out
            .slice_each_axis_mut(|ax| Slice::from(global[ax.axis.index()].clone()))
            .assign(
                &prob_tile
                    .index_axis(ndarray::Axis(ndim), 0)
                    .slice_each_axis(|ax| Slice::from(local[ax.axis.index()].clone())),
            );
        dist_out
            .slice_each_axis_mut(|ax| match global.get(ax.axis.index()) {
                Some(r) => Slice::from(r.clone()),
                None => Slice::from(..),
            })
            .assign(&dist_tile.slice_each_axis(|ax| match local.get(ax.axis.index()) {
                Some(r) => Slice::from(r.clone()),
                None => Slice::from(..),
            }));
    }

    let dist = dist_out.ok_or_else(|| {
        SegmentationError::InvalidOutput("tiled inference produced no tiles".to_string())
    })?;
    Ok(TiledPrediction {
        prob: prob_out,
        dist,
        plan,
        tiles: total,
    })
}

/// Index into `[0, len)` with numpy-style `reflect` padding (edge not repeated)
fn reflect_index(i: usize, len: usize) -> usize {
    if len <= 1 {
        return 0;
    }
    let period = 2 * (len - 1);
    let m = i % period;
    if m < len {
        m
    } else {
        period - m
    }
}

/// Pad `image` at the end of every axis up to `target` by reflection
pub fn reflect_pad(image: &ArrayD<f32>, target: &[usize]) -> ArrayD<f32> {
    if image.shape() == target {
        return image.clone();
    }
    let shape = image.shape().to_vec();
    ArrayD::from_shape_fn(IxDyn(target), |idx| {
        let src: Vec<usize> = idx
            .slice()
            .iter()
            .zip(&shape)
            .map(|(&i, &len)| reflect_index(i, len))
            .collect();
        image[IxDyn(&src)]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Layout;
    use crate::session::{ProviderKind, RawOutputs};
    use ndarray::Array2;

    const NHWC: IoLayouts = IoLayouts {
        input: Layout::Nhwc,
        prob: Layout::Nhwc,
        dist: Layout::Nhwc,
    };

    /// Pointwise network with output stride `grid`: prob is the input pixel
    /// at each output cell, dist repeats it over 4 rays
    struct PointwiseSession {
        grid: usize,
        accepted: Option<Vec<usize>>,
        calls: usize,
    }

    impl InferenceSession for PointwiseSession {
        fn run(&mut self, input: &ArrayD<f32>) -> Result<RawOutputs> {
            self.calls += 1;
            let spatial = input.shape()[1..input.ndim() - 1].to_vec();
            if let Some(accepted) = &self.accepted {
                if &spatial != accepted {
                    return Err(SegmentationError::Inference("bad tile shape".into()));
                }
            }
            let out: Vec<usize> = spatial.iter().map(|s| s / self.grid).collect();
            let mut prob_shape = vec![1];
            prob_shape.extend(&out);
            prob_shape.push(1);
            let prob = ArrayD::from_shape_fn(IxDyn(&prob_shape), |idx| {
                let mut src = vec![0];
                src.extend(idx.slice()[1..=out.len()].iter().map(|i| i * self.grid));
                src.push(0);
                input[IxDyn(&src)]
            });
            let mut dist_shape = prob_shape.clone();
            dist_shape[out.len() + 1] = 4;
            let dist = ArrayD::from_shape_fn(IxDyn(&dist_shape), |idx| {
                let mut src = idx.slice().to_vec();
                src[out.len() + 1] = 0;
                prob[IxDyn(&src)]
            });
            Ok(RawOutputs { prob, dist })
        }

        fn provider(&self) -> ProviderKind {
            ProviderKind::Cpu
        }
    }

    /// 3x3 mean filter with zero padding at the input border, so every
    /// output depends on its neighbours
    struct BoxFilterSession {
        calls: usize,
    }

    impl InferenceSession for BoxFilterSession {
        fn run(&mut self, input: &ArrayD<f32>) -> Result<RawOutputs> {
            self.calls += 1;
            let (h, w) = (input.shape()[1], input.shape()[2]);
            let at = |y: isize, x: isize| -> f32 {
                if y < 0 || x < 0 || y >= h as isize || x >= w as isize {
                    0.0
                } else {
                    input[[0, y as usize, x as usize, 0]]
                }
            };
            let prob = ArrayD::from_shape_fn(IxDyn(&[1, h, w, 1]), |idx| {
                let (y, x) = (idx[1] as isize, idx[2] as isize);
                let mut sum = 0.0;
                for dy in -1..=1 {
                    for dx in -1..=1 {
                        sum += at(y + dy, x + dx);
                    }
                }
                sum / 9.0
            });
            let dist = ArrayD::from_shape_fn(IxDyn(&[1, h, w, 2]), |idx| {
                prob[[0, idx[1], idx[2], 0]] * (idx[3] + 1) as f32
            });
            Ok(RawOutputs { prob, dist })
        }

        fn provider(&self) -> ProviderKind {
            ProviderKind::Cpu
        }
    }

    fn ramp(h: usize, w: usize) -> ArrayD<f32> {
        Array2::from_shape_fn((h, w), |(y, x)| (y * w + x) as f32).into_dyn()
    }

    fn constraints(div: usize, overlap: usize) -> GraphConstraints {
        GraphConstraints {
            divisibility: vec![div, div],
            overlap: vec![overlap, overlap],
            patterns: None,
        }
    }

    #[test]
    fn test_plan_tiles_floors_to_divisibility() {
        let plan = plan_tiles(&[300, 300], &constraints(16, 24), &TilingPolicy::default());
        assert_eq!(plan.tile_shape, vec![288, 288]);
        assert!(plan.overlap.iter().zip(&plan.tile_shape).all(|(o, t)| o < t));
        assert_eq!(plan.tile_shape[0] % 16, 0);
    }

    #[test]
    fn test_plan_tiles_caps_edge_and_clamps_overlap() {
        let policy = TilingPolicy {
            max_tile_edge: 64,
            ..Default::default()
        };
        let plan = plan_tiles(&[500, 40], &constraints(16, 100), &policy);
        assert_eq!(plan.tile_shape, vec![64, 32]);
        assert_eq!(plan.overlap, vec![63, 31]);
    }

    #[test]
    fn test_plan_tiles_never_below_divisibility() {
        let plan = plan_tiles(&[10, 10], &constraints(16, 0), &TilingPolicy::default());
        assert_eq!(plan.tile_shape, vec![16, 16]);
        assert_eq!(plan.padding, vec![6, 6]);
    }

    #[test]
    fn test_plan_tiles_n_tiles_and_uncapped_z() {
        let c = GraphConstraints {
            divisibility: vec![1, 1, 1],
            overlap: vec![0, 0, 0],
            patterns: None,
        };
        let policy = TilingPolicy {
            max_tile_edge: 32,
            n_tiles: 2,
            cap_xy_only: true,
            snap_skip_axes: vec![0],
            enforce_post_snap_divisibility: false,
        };
        let plan = plan_tiles(&[100, 100, 40], &c, &policy);
        assert_eq!(plan.tile_shape, vec![50, 32, 20]);
    }

    #[test]
    fn test_reflect_pad_matches_numpy() {
        let image = Array2::from_shape_vec((1, 4), vec![1.0, 2.0, 3.0, 4.0])
            .unwrap()
            .into_dyn();
        let padded = reflect_pad(&image, &[1, 7]);
        let row: Vec<f32> = padded.iter().copied().collect();
        assert_eq!(row, vec![1.0, 2.0, 3.0, 4.0, 3.0, 2.0, 1.0]);
    }

    #[test]
    fn test_tiled_equals_whole_image() {
        let image = ramp(40, 56);
        let grid = GridSpec(vec![2, 2]);

        let mut whole = PointwiseSession {
            grid: 2,
            accepted: None,
            calls: 0,
        };
        let single = TilingPlan {
            tile_shape: vec![40, 56],
            overlap: vec![0, 0],
            padding: vec![0, 0],
        };
        let reference = run_tiled_inference(&image, &mut whole, &single, &grid, NHWC).unwrap();
        assert_eq!(whole.calls, 1);

        let mut tiled = PointwiseSession {
            grid: 2,
            accepted: Some(vec![16, 16]),
            calls: 0,
        };
        let plan = plan_tiles(
            &[40, 56],
            &constraints(16, 4),
            &TilingPolicy {
                max_tile_edge: 16,
                ..Default::default()
            },
        );
        let result = run_tiled_inference(&image, &mut tiled, &plan, &grid, NHWC).unwrap();
        assert!(tiled.calls > 1);
        assert_eq!(result.tiles, tiled.calls);
        assert_eq!(result.prob.shape(), &[20, 28]);
        assert_eq!(result.dist.shape(), &[20, 28, 4]);
        for (a, b) in result.prob.iter().zip(reference.prob.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
        assert_eq!(result.dist, reference.dist);
    }

    #[test]
    fn test_last_tile_ends_at_image_edge() {
        let plan = TilingPlan {
            tile_shape: vec![16, 16],
            overlap: vec![4, 4],
            padding: vec![0, 0],
        };
        let origins = plan.origins(&[41, 32], &GridSpec::unit(2));
        assert_eq!(origins, vec![vec![0, 12, 24, 25], vec![0, 12, 16]]);
        assert_eq!(plan.aligned(&[41, 32], &GridSpec::unit(2)).padding, vec![0, 0]);

        // Odd sizes are only padded up to the grid
        let aligned = plan.aligned(&[41, 32], &GridSpec(vec![2, 2]));
        assert_eq!(aligned.padding, vec![1, 0]);
        assert_eq!(aligned.origins(&[41, 32], &GridSpec(vec![2, 2]))[0], vec![0, 12, 24, 26]);
    }

    #[test]
    fn test_tiled_equals_whole_image_with_context() {
        let image = ramp(41, 41);
        let grid = GridSpec::unit(2);

        let mut whole = BoxFilterSession { calls: 0 };
        let single = TilingPlan {
            tile_shape: vec![41, 41],
            overlap: vec![0, 0],
            padding: vec![0, 0],
        };
        let reference = run_tiled_inference(&image, &mut whole, &single, &grid, NHWC).unwrap();

        let mut tiled = BoxFilterSession { calls: 0 };
        let plan = plan_tiles(
            &[41, 41],
            &constraints(1, 4),
            &TilingPolicy {
                max_tile_edge: 16,
                ..Default::default()
            },
        );
        assert_eq!(plan.tile_shape, vec![16, 16]);
        let result = run_tiled_inference(&image, &mut tiled, &plan, &grid, NHWC).unwrap();

        assert_eq!(result.plan.padding, vec![0, 0]);
        assert_eq!(tiled.calls, 16);
        assert_eq!(result.prob.shape(), &[41, 41]);
        for ((idx, a), b) in result.prob.indexed_iter().zip(reference.prob.iter()) {
            assert!((a - b).abs() < 1e-3, "prob differs at {:?}: {} vs {}", idx, a, b);
        }
        for (a, b) in result.dist.iter().zip(reference.dist.iter()) {
            assert!((a - b).abs() < 1e-3);
        }
    }

    #[test]
    fn test_odd_size_output_rounds_up() {
        let image = ramp(33, 17);
        let mut session = PointwiseSession {
            grid: 2,
            accepted: None,
            calls: 0,
        };
        let plan = plan_tiles(&[33, 17], &constraints(2, 2), &TilingPolicy::default());
        let result =
            run_tiled_inference(&image, &mut session, &plan, &GridSpec(vec![2, 2]), NHWC).unwrap();
        assert_eq!(result.prob.shape(), &[17, 9]);
        assert_eq!(result.prob[[16, 8]], image[[32, 16]]);
    }

    #[test]
    fn test_wrong_rank_plan_is_rejected() {
        let image = ramp(16, 16);
        let mut session = PointwiseSession {
            grid: 1,
            accepted: None,
            calls: 0,
        };
        let plan = TilingPlan {
            tile_shape: vec![16],
            overlap: vec![0],
            padding: vec![0],
        };
        let result = run_tiled_inference(&image, &mut session, &plan, &GridSpec(vec![1, 1]), NHWC);
        assert!(result.is_err());
        assert_eq!(session.calls, 0);
    }
}
