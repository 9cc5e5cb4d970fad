//! Candidate extraction, non-maximum suppression, and label rendering

pub mod nms;
pub mod render;

use ndarray::{ArrayD, Axis, Dimension, IxDyn};
use serde::Serialize;
use tracing::debug;

use crate::error::{Result, SegmentationError};
use crate::probe::GridSpec;

pub use nms::{suppress, NmsMode, SuppressionDomain};
pub use render::{render_2d, render_3d, RenderMode};

/// Cells this close to the map edge never become candidates
pub const DEFAULT_BORDER: usize = 2;

/// One potential object: a center in prediction-frame pixels, its
/// probability, and its ray distances
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionCandidate {
    pub point: Vec<f32>,
    pub score: f32,
    pub distances: Vec<f32>,
}

/// Candidates ordered by descending score; ties keep raster order
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DetectionSet {
    pub candidates: Vec<DetectionCandidate>,
}

impl DetectionSet {
    /// Threshold a probability map `(*spatial)` with distances
    /// `(*spatial, R)`.
    ///
    /// Points are output indices multiplied by the grid. Non-finite
    /// probabilities count as background and negative distances are
    /// clamped to zero.
    pub fn from_maps(
        prob: &ArrayD<f32>,
        dist: &ArrayD<f32>,
        grid: &GridSpec,
        prob_thresh: f32,
        border: usize,
    ) -> Result<Self> {
        let ndim = prob.ndim();
        if dist.ndim() != ndim + 1 || dist.shape()[..ndim] != *prob.shape() {
            return Err(SegmentationError::InvalidOutput(format!(
                "probability map {:?} and distance map {:?} are incompatible",
                prob.shape(),
                dist.shape()
            )));
        }
        if grid.axes().len() != ndim {
            return Err(SegmentationError::InvalidOutput(format!(
                "grid {:?} does not match map rank {}",
                grid.axes(),
                ndim
            )));
        }
        let shape = prob.shape();
        let mut candidates = Vec::new();
        for (idx, &p) in prob.indexed_iter() {
            if !p.is_finite() || p <= prob_thresh {
                continue;
            }
            let idx = idx.slice();
            let inside = idx
                .iter()
                .zip(shape)
                .all(|(&i, &len)| i >= border && i + border < len);
            if !inside {
                continue;
            }
            let lane = dist.index_axis(Axis(0), idx[0]);
            let distances: Vec<f32> = idx[1..]
                .iter()
                .fold(lane, |lane, &i| lane.index_axis_move(Axis(0), i))
                .iter()
                .map(|&d| if d.is_finite() { d.max(0.0) } else { 0.0 })
                .collect();
            let point = idx
                .iter()
                .zip(grid.axes())
                .map(|(&i, &g)| (i * g.max(1)) as f32)
                .collect();
            candidates.push(DetectionCandidate {
                point,
                score: p,
                distances,
            });
        }
        // Stable: equal scores keep raster order
        candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
        debug!(
            "{} candidates above prob_thresh={} from map {:?}",
            candidates.len(),
            prob_thresh,
            shape
        );
        Ok(Self { candidates })
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DetectionCandidate> {
        self.candidates.iter()
    }

    /// Per-instance metadata with points and distances mapped back through
    /// `scale` (the zoom applied before inference)
    pub fn to_info(&self, ndim: usize, scale: Option<&[f32]>, n_rays: usize) -> InstanceInfo {
        let points: Vec<Vec<f32>> = self
            .candidates
            .iter()
            .map(|c| match scale {
                Some(s) => c.point.iter().zip(s).map(|(p, s)| p / s).collect(),
                None => c.point.clone(),
            })
            .collect();
        let prob = self.candidates.iter().map(|c| c.score).collect();
        let dist = self
            .candidates
            .iter()
            .map(|c| match scale {
                // Isotropic zoom: every ray shrinks by the same factor
                Some(s) if !s.is_empty() => c.distances.iter().map(|d| d / s[0]).collect(),
                _ => c.distances.clone(),
            })
            .collect();
        InstanceInfo {
            ndim,
            n_rays,
            points,
            prob,
            dist,
            radii: None,
        }
    }
}

impl<'a> IntoIterator for &'a DetectionSet {
    type Item = &'a DetectionCandidate;
    type IntoIter = std::slice::Iter<'a, DetectionCandidate>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Per-instance outputs reported alongside the label map
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InstanceInfo {
    pub ndim: usize,
    pub n_rays: usize,
    pub points: Vec<Vec<f32>>,
    pub prob: Vec<f32>,
    pub dist: Vec<Vec<f32>>,
    /// Sphere radii, present when 3D instances were drawn as balls
    #[serde(skip_serializing_if = "Option::is_none")]
    pub radii: Option<Vec<f32>>,
}

impl InstanceInfo {
    /// Points as an `(N, ndim)` array
    pub fn points_array(&self) -> Result<ArrayD<f32>> {
        let flat: Vec<f32> = self.points.iter().flatten().copied().collect();
        ArrayD::from_shape_vec(IxDyn(&[self.points.len(), self.ndim]), flat).map_err(|e| {
            SegmentationError::InvalidOutput(format!(
                "{} points do not all have {} coordinates: {e}",
                self.points.len(),
                self.ndim
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, Array3};

    fn maps(h: usize, w: usize) -> (ArrayD<f32>, ArrayD<f32>) {
        (
            Array2::<f32>::zeros((h, w)).into_dyn(),
            Array3::<f32>::from_elem((h, w, 4), 3.0).into_dyn(),
        )
    }

    #[test]
    fn test_threshold_is_strict_and_sorted() {
        let (mut prob, dist) = maps(10, 10);
        prob[[4, 4]] = 0.9;
        prob[[5, 6]] = 0.5;
        prob[[6, 3]] = 0.7;
        let set = DetectionSet::from_maps(&prob, &dist, &GridSpec::unit(2), 0.5, 2).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.candidates[0].point, vec![4.0, 4.0]);
        assert_eq!(set.candidates[1].score, 0.7);
        assert_eq!(set.candidates[0].distances, vec![3.0; 4]);
    }

    #[test]
    fn test_border_and_grid() {
        let (mut prob, dist) = maps(10, 10);
        prob[[1, 5]] = 0.9;
        prob[[8, 5]] = 0.9;
        prob[[2, 7]] = 0.8;
        let set = DetectionSet::from_maps(&prob, &dist, &GridSpec(vec![2, 2]), 0.5, 2).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.candidates[0].point, vec![4.0, 14.0]);
    }

    #[test]
    fn test_nan_and_negative_values() {
        let (mut prob, mut dist) = maps(10, 10);
        prob[[3, 3]] = f32::NAN;
        prob[[5, 5]] = 0.8;
        dist[[5, 5, 1]] = -2.0;
        let set = DetectionSet::from_maps(&prob, &dist, &GridSpec::unit(2), 0.5, 2).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.candidates[0].distances, vec![3.0, 0.0, 3.0, 3.0]);
    }

    #[test]
    fn test_ties_keep_raster_order() {
        let (mut prob, dist) = maps(10, 10);
        prob[[6, 6]] = 0.8;
        prob[[3, 3]] = 0.8;
        let set = DetectionSet::from_maps(&prob, &dist, &GridSpec::unit(2), 0.5, 2).unwrap();
        assert_eq!(set.candidates[0].point, vec![3.0, 3.0]);
    }

    #[test]
    fn test_mismatched_maps() {
        let prob = Array2::<f32>::zeros((4, 4)).into_dyn();
        let dist = Array3::<f32>::zeros((4, 5, 8)).into_dyn();
        assert!(DetectionSet::from_maps(&prob, &dist, &GridSpec::unit(2), 0.5, 2).is_err());
    }

    #[test]
    fn test_info_maps_back_through_scale() {
        let set = DetectionSet {
            candidates: vec![DetectionCandidate {
                point: vec![10.0, 20.0],
                score: 0.9,
                distances: vec![4.0; 4],
            }],
        };
        let info = set.to_info(2, Some(&[0.5, 0.5]), 4);
        assert_eq!(info.points, vec![vec![20.0, 40.0]]);
        assert_eq!(info.dist, vec![vec![8.0; 4]]);
        assert_eq!(info.points_array().unwrap().shape(), &[1, 2]);
        assert!(info.radii.is_none());
    }

    #[test]
    fn test_empty_info_keeps_dimensionality() {
        let info = DetectionSet::default().to_info(3, None, 96);
        assert_eq!(info.points_array().unwrap().shape(), &[0, 3]);
    }

    #[test]
    fn test_points_array_rejects_ragged_points() {
        let info = InstanceInfo {
            ndim: 2,
            points: vec![vec![1.0, 2.0], vec![3.0]],
            ..Default::default()
        };
        assert!(matches!(
            info.points_array(),
            Err(SegmentationError::InvalidOutput(_))
        ));
    }
}
