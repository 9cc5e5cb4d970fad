//! Rasterize surviving candidates into integer label maps

use ndarray::{s, Array2, Array3};
use tracing::debug;

use super::nms::NmsMode;
use super::{DetectionCandidate, DetectionSet};
use crate::geometry::{Polygon, Polyhedron, Rays, VoxelMask};

/// Shape drawn for each 3D instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    Polyhedron,
    /// Ball with the median ray distance as radius
    Sphere,
}

impl From<NmsMode> for RenderMode {
    fn from(mode: NmsMode) -> Self {
        match mode {
            NmsMode::Compiled => RenderMode::Polyhedron,
            NmsMode::Fallback => RenderMode::Sphere,
        }
    }
}

/// Candidates in ascending score order; equal scores keep their order
fn paint_order(detections: &DetectionSet) -> Vec<&DetectionCandidate> {
    let mut order: Vec<&DetectionCandidate> = detections.iter().collect();
    order.sort_by(|a, b| a.score.total_cmp(&b.score));
    order
}

/// Render polygons into a `shape` label image.
///
/// Candidate points and distances are divided by `scale` to return to the
/// unscaled frame. Instances are drawn lowest score first and labelled
/// `1..=N` in that order, so higher scores win shared pixels. A candidate
/// whose mask is empty still consumes its label, so labels may skip values.
pub fn render_2d(detections: &DetectionSet, shape: [usize; 2], scale: Option<[f32; 2]>) -> Array2<i32> {
    let inv = scale.map_or([1.0; 2], |s| [1.0 / s[0], 1.0 / s[1]]);
    let mut labels = Array2::<i32>::zeros((shape[0], shape[1]));
    for (n, c) in paint_order(detections).into_iter().enumerate() {
        let center = [c.point[0] * inv[0], c.point[1] * inv[1]];
        let mask = Polygon::from_rays(center, &c.distances, inv).rasterize(shape);
        if mask.count == 0 {
            continue;
        }
        let label = n as i32 + 1;
        let (lo, hi) = (&mask.bbox.lo, &mask.bbox.hi);
        labels
            .slice_mut(s![lo[0]..hi[0], lo[1]..hi[1]])
            .zip_mut_with(&mask.mask, |l, &inside| {
                if inside {
                    *l = label;
                }
            });
    }
    debug!("Rendered {} polygons into {:?}", detections.len(), shape);
    labels
}

/// Render polyhedra (or spheres) into a `shape` label volume, with the same
/// ordering and label contract as [`render_2d`], including skipped labels
/// for empty masks
pub fn render_3d(
    detections: &DetectionSet,
    shape: [usize; 3],
    scale: Option<[f32; 3]>,
    rays: &Rays,
    mode: RenderMode,
) -> Array3<i32> {
    let inv = scale.map_or([1.0; 3], |s| [1.0 / s[0], 1.0 / s[1], 1.0 / s[2]]);
    let mut labels = Array3::<i32>::zeros((shape[0], shape[1], shape[2]));
    for (n, c) in paint_order(detections).into_iter().enumerate() {
        let center = [c.point[0] * inv[0], c.point[1] * inv[1], c.point[2] * inv[2]];
        let mask = match mode {
            RenderMode::Polyhedron => Polyhedron::new(center, &c.distances, rays, inv).rasterize(shape),
            RenderMode::Sphere => VoxelMask::sphere(center, median(&c.distances), inv, shape),
        };
        if mask.count == 0 {
            continue;
        }
        let label = n as i32 + 1;
        let (lo, hi) = (&mask.bbox.lo, &mask.bbox.hi);
        labels
            .slice_mut(s![lo[0]..hi[0], lo[1]..hi[1], lo[2]..hi[2]])
            .zip_mut_with(&mask.mask, |l, &inside| {
                if inside {
                    *l = label;
                }
            });
    }
    debug!("Rendered {} {:?} instances into {:?}", detections.len(), mode, shape);
    labels
}

pub(crate) fn median(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f32::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn candidate(point: Vec<f32>, score: f32, radius: f32, n_rays: usize) -> DetectionCandidate {
        DetectionCandidate {
            point,
            score,
            distances: vec![radius; n_rays],
        }
    }

    #[test]
    fn test_higher_score_wins_overlap() {
        let set = DetectionSet {
            candidates: vec![
                candidate(vec![10.0, 10.0], 0.9, 5.0, 32),
                candidate(vec![10.0, 14.0], 0.6, 5.0, 32),
            ],
        };
        let labels = render_2d(&set, [24, 24], None);
        // Ascending order: the 0.6 instance is label 1, the 0.9 instance label 2
        assert_eq!(labels[[10, 10]], 2);
        assert_eq!(labels[[10, 12]], 2);
        assert_eq!(labels[[10, 17]], 1);
        assert_eq!(labels[[0, 0]], 0);
    }

    #[test]
    fn test_empty_mask_skips_its_label() {
        let set = DetectionSet {
            candidates: vec![
                candidate(vec![6.0, 6.0], 0.9, 3.0, 16),
                // Entirely outside the frame
                candidate(vec![-40.0, -40.0], 0.5, 3.0, 16),
            ],
        };
        let labels = render_2d(&set, [24, 24], None);
        let values: HashSet<i32> = labels.iter().copied().filter(|&l| l > 0).collect();
        assert_eq!(values, HashSet::from([2]));
        assert_eq!(labels[[6, 6]], 2);
    }

    #[test]
    fn test_label_count_bounded_by_survivors() {
        let set = DetectionSet {
            candidates: vec![
                candidate(vec![5.0, 5.0], 0.9, 3.0, 16),
                candidate(vec![15.0, 15.0], 0.8, 3.0, 16),
                candidate(vec![40.0, 40.0], 0.7, 3.0, 16),
            ],
        };
        let labels = render_2d(&set, [20, 20], None);
        let distinct: HashSet<i32> = labels.iter().copied().filter(|&l| l > 0).collect();
        assert!(distinct.len() <= set.len());
        assert_eq!(distinct.len(), 2);
    }

    #[test]
    fn test_scale_maps_back_to_original_frame() {
        let set = DetectionSet {
            candidates: vec![candidate(vec![8.0, 8.0], 0.9, 3.0, 32)],
        };
        let labels = render_2d(&set, [32, 32], Some([0.5, 0.5]));
        assert_eq!(labels[[16, 16]], 1);
        assert_eq!(labels[[16, 21]], 1);
        assert_eq!(labels[[16, 24]], 0);
    }

    #[test]
    fn test_render_3d_modes() {
        let rays = Rays::golden_spiral(32);
        let set = DetectionSet {
            candidates: vec![
                candidate(vec![8.0, 8.0, 8.0], 0.9, 3.0, 32),
                candidate(vec![20.0, 20.0, 20.0], 0.8, 3.0, 32),
            ],
        };
        for mode in [RenderMode::Polyhedron, RenderMode::Sphere] {
            let labels = render_3d(&set, [28, 28, 28], None, &rays, mode);
            assert_eq!(labels[[8, 8, 8]], 2, "{mode:?}");
            assert_eq!(labels[[20, 20, 20]], 1, "{mode:?}");
            assert_eq!(labels[[0, 0, 0]], 0);
        }
    }

    #[test]
    fn test_empty_set_renders_background() {
        let labels = render_2d(&DetectionSet::default(), [8, 8], None);
        assert!(labels.iter().all(|&l| l == 0));
    }

    #[test]
    fn test_median() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(&[1.0, 2.0, 3.0, 4.0]), 2.5);
    }
}
