//! Greedy non-maximum suppression over star-convex candidates

use tracing::debug;

use super::render::median;
use super::{DetectionCandidate, DetectionSet};
use crate::geometry::{BoundingBox, Polygon, PolygonMask, Polyhedron, Rays, VoxelMask};

/// Overlap geometry used by [`suppress`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NmsMode {
    /// Exact polygon clipping in 2D, polyhedron rasterization in 3D
    Compiled,
    /// Rasterized polygons in 2D, median-radius axis-aligned boxes in 3D
    Fallback,
}

/// Frame the candidates live in
#[derive(Debug, Clone, Copy)]
pub enum SuppressionDomain<'a> {
    Planar { shape: [usize; 2] },
    Volumetric { shape: [usize; 3], rays: &'a Rays },
}

/// Keep candidates in descending score order, dropping any whose overlap
/// with an already kept candidate exceeds `nms_thresh` of the smaller
/// shape's measure. Shapes with zero measure are dropped.
pub fn suppress(
    detections: &DetectionSet,
    nms_thresh: f32,
    mode: NmsMode,
    domain: SuppressionDomain<'_>,
) -> DetectionSet {
    let shapes: Vec<Shape> = detections
        .iter()
        .map(|c| Shape::build(c, mode, domain))
        .collect();

    let mut keep: Vec<usize> = Vec::new();
    for (i, shape) in shapes.iter().enumerate() {
        if shape.measure() <= 0.0 {
            continue;
        }
        let suppressed = keep.iter().any(|&j| {
            let inter = shape.intersection(&shapes[j]);
            let ratio = (inter / shape.measure().min(shapes[j].measure())).min(1.0);
            ratio > nms_thresh as f64
        });
        if !suppressed {
            keep.push(i);
        }
    }
    debug!(
        "NMS ({:?}, nms_thresh={}): kept {} of {} candidates",
        mode,
        nms_thresh,
        keep.len(),
        detections.len()
    );
    DetectionSet {
        candidates: keep
            .into_iter()
            .map(|i| detections.candidates[i].clone())
            .collect(),
    }
}

enum Shape {
    #[cfg_attr(not(feature = "compiled-geometry"), allow(dead_code))]
    Exact {
        polygon: Polygon,
        area: f64,
        min: [f32; 2],
        max: [f32; 2],
    },
    Raster2d(PolygonMask),
    Raster3d(VoxelMask),
    /// Voxel box of `center +- median(distances)`, clipped to the frame
    Aabb(BoundingBox),
}

impl Shape {
    fn build(c: &DetectionCandidate, mode: NmsMode, domain: SuppressionDomain<'_>) -> Self {
        match domain {
            SuppressionDomain::Planar { shape } => {
                let polygon = Polygon::from_rays([c.point[0], c.point[1]], &c.distances, [1.0; 2]);
                if mode == NmsMode::Compiled && cfg!(feature = "compiled-geometry") {
                    let (min, max) = extent2(&polygon);
                    Shape::Exact {
                        area: polygon.area(),
                        polygon,
                        min,
                        max,
                    }
                } else {
                    Shape::Raster2d(polygon.rasterize(shape))
                }
            }
            SuppressionDomain::Volumetric { shape, rays } => {
                let center = [c.point[0], c.point[1], c.point[2]];
                match mode {
                    NmsMode::Compiled => Shape::Raster3d(
                        Polyhedron::new(center, &c.distances, rays, [1.0; 3]).rasterize(shape),
                    ),
                    NmsMode::Fallback => {
                        let radius = median(&c.distances).max(0.0);
                        let min = center.map(|p| p - radius);
                        let max = center.map(|p| p + radius);
                        Shape::Aabb(BoundingBox::from_extent(&min, &max, &shape))
                    }
                }
            }
        }
    }

    fn measure(&self) -> f64 {
        match self {
            Shape::Exact { area, .. } => *area,
            Shape::Raster2d(mask) => mask.count as f64,
            Shape::Raster3d(mask) => mask.count as f64,
            Shape::Aabb(bbox) => bbox.extent().iter().map(|&e| e as f64).product(),
        }
    }

    fn intersection(&self, other: &Shape) -> f64 {
        match (self, other) {
            (
                Shape::Exact {
                    polygon: a,
                    min: amin,
                    max: amax,
                    ..
                },
                Shape::Exact {
                    polygon: b,
                    min: bmin,
                    max: bmax,
                    ..
                },
            ) => {
                let disjoint = (0..2).any(|k| amax[k] < bmin[k] || bmax[k] < amin[k]);
                if disjoint {
                    0.0
                } else {
                    exact_area(a, b)
                }
            }
            (Shape::Raster2d(a), Shape::Raster2d(b)) => a.overlap(b) as f64,
            (Shape::Raster3d(a), Shape::Raster3d(b)) => a.overlap(b) as f64,
            (Shape::Aabb(a), Shape::Aabb(b)) => a
                .intersect(b)
                .map_or(0.0, |i| i.extent().iter().map(|&e| e as f64).product()),
            _ => 0.0,
        }
    }
}

#[cfg(feature = "compiled-geometry")]
fn exact_area(a: &Polygon, b: &Polygon) -> f64 {
    a.intersection_area(b)
}

#[cfg(not(feature = "compiled-geometry"))]
fn exact_area(_a: &Polygon, _b: &Polygon) -> f64 {
    0.0
}

fn extent2(polygon: &Polygon) -> ([f32; 2], [f32; 2]) {
    let mut min = [f32::INFINITY; 2];
    let mut max = [f32::NEG_INFINITY; 2];
    for (&r, &c) in polygon.rows.iter().zip(&polygon.cols) {
        min = [min[0].min(r), min[1].min(c)];
        max = [max[0].max(r), max[1].max(c)];
    }
    (min, max)
}
