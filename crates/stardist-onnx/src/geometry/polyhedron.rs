//! Star-convex polyhedra and their voxel rasterization

use ndarray::Array3;

use super::rays::{cross, dot, Rays};
use super::BoundingBox;

/// One face cone: maps a direction from the center to barycentric weights
/// of the face vertices
#[derive(Debug, Clone)]
struct FaceCone {
    inverse: [[f64; 3]; 3],
}

impl FaceCone {
    fn new(a: [f64; 3], b: [f64; 3], c: [f64; 3]) -> Option<Self> {
        // Columns a, b, c; the inverse rows are the scaled cross products
        let det = dot(a, cross(b, c));
        if det.abs() < 1e-12 {
            return None;
        }
        let r0 = cross(b, c);
        let r1 = cross(c, a);
        let r2 = cross(a, b);
        let inv = |r: [f64; 3]| [r[0] / det, r[1] / det, r[2] / det];
        Some(Self {
            inverse: [inv(r0), inv(r1), inv(r2)],
        })
    }

    /// Sum of barycentric weights when `u` falls inside this cone
    fn weight(&self, u: [f64; 3]) -> Option<f64> {
        const EPS: f64 = -1e-9;
        let w = self.inverse.map(|row| dot(row, u));
        (w[0] >= EPS && w[1] >= EPS && w[2] >= EPS).then(|| w[0] + w[1] + w[2])
    }
}

/// Polyhedron with vertices `center + d_k * ray_k`, optionally anisotropic
#[derive(Debug, Clone)]
pub struct Polyhedron {
    center: [f64; 3],
    vertices: Vec<[f64; 3]>,
    cones: Vec<FaceCone>,
}

impl Polyhedron {
    /// `scale` multiplies the offsets from the center per axis
    pub fn new(center: [f32; 3], distances: &[f32], rays: &Rays, scale: [f32; 3]) -> Self {
        let center = center.map(f64::from);
        let offsets: Vec<[f64; 3]> = rays
            .vertices
            .iter()
            .zip(distances)
            .map(|(v, &d)| {
                [
                    v[0] as f64 * d as f64 * scale[0] as f64,
                    v[1] as f64 * d as f64 * scale[1] as f64,
                    v[2] as f64 * d as f64 * scale[2] as f64,
                ]
            })
            .collect();
        let cones = rays
            .faces
            .iter()
            .filter(|f| f.iter().all(|&i| i < offsets.len()))
            .filter_map(|f| FaceCone::new(offsets[f[0]], offsets[f[1]], offsets[f[2]]))
            .collect();
        let vertices = offsets
            .iter()
            .map(|o| [center[0] + o[0], center[1] + o[1], center[2] + o[2]])
            .collect();
        Self {
            center,
            vertices,
            cones,
        }
    }

    pub fn contains(&self, z: f64, y: f64, x: f64) -> bool {
        let u = [z - self.center[0], y - self.center[1], x - self.center[2]];
        if dot(u, u) < 1e-18 {
            return !self.cones.is_empty();
        }
        self.cones
            .iter()
            .filter_map(|c| c.weight(u))
            .any(|w| w <= 1.0 + 1e-9)
    }

    pub fn bounding_box(&self, shape: [usize; 3]) -> BoundingBox {
        let mut min = [f32::INFINITY; 3];
        let mut max = [f32::NEG_INFINITY; 3];
        for v in &self.vertices {
            for a in 0..3 {
                min[a] = min[a].min(v[a] as f32);
                max[a] = max[a].max(v[a] as f32);
            }
        }
        if self.vertices.is_empty() {
            return BoundingBox {
                lo: vec![0; 3],
                hi: vec![0; 3],
            };
        }
        BoundingBox::from_extent(&min, &max, &shape)
    }

    /// Voxel centers inside the polyhedron within its clipped bounding box
    pub fn rasterize(&self, shape: [usize; 3]) -> VoxelMask {
        let bbox = self.bounding_box(shape);
        let e = bbox.extent();
        let mut mask = Array3::from_elem((e[0], e[1], e[2]), false);
        if bbox.is_empty() || self.cones.is_empty() {
            return VoxelMask { bbox, mask, count: 0 };
        }
        let mut count = 0;
        for ((z, y, x), v) in mask.indexed_iter_mut() {
            let inside = self.contains(
                (bbox.lo[0] + z) as f64,
                (bbox.lo[1] + y) as f64,
                (bbox.lo[2] + x) as f64,
            );
            if inside {
                *v = true;
                count += 1;
            }
        }
        VoxelMask { bbox, mask, count }
    }
}

/// Rasterized solid restricted to its bounding box
#[derive(Debug, Clone)]
pub struct VoxelMask {
    pub bbox: BoundingBox,
    pub mask: Array3<bool>,
    pub count: usize,
}

impl VoxelMask {
    /// Ball of `radius` (in scaled units per axis) around `center`
    pub fn sphere(center: [f32; 3], radius: f32, scale: [f32; 3], shape: [usize; 3]) -> Self {
        let r = [0, 1, 2].map(|a| (radius * scale[a]).max(0.0));
        let min = [0, 1, 2].map(|a| center[a] - r[a]);
        let max = [0, 1, 2].map(|a| center[a] + r[a]);
        let bbox = BoundingBox::from_extent(&min, &max, &shape);
        let e = bbox.extent();
        let mut mask = Array3::from_elem((e[0], e[1], e[2]), false);
        let mut count = 0;
        if r.iter().all(|&v| v > 0.0) {
            for ((z, y, x), v) in mask.indexed_iter_mut() {
                let p = [bbox.lo[0] + z, bbox.lo[1] + y, bbox.lo[2] + x];
                let d2: f32 = (0..3)
                    .map(|a| ((p[a] as f32 - center[a]) / r[a]).powi(2))
                    .sum();
                if d2 <= 1.0 {
                    *v = true;
                    count += 1;
                }
            }
        }
        Self { bbox, mask, count }
    }

    pub fn overlap(&self, other: &VoxelMask) -> usize {
        let Some(bbox) = self.bbox.intersect(&other.bbox) else {
            return 0;
        };
        let mut n = 0;
        for z in bbox.lo[0]..bbox.hi[0] {
            for y in bbox.lo[1]..bbox.hi[1] {
                for x in bbox.lo[2]..bbox.hi[2] {
                    let a = self.mask[[z - self.bbox.lo[0], y - self.bbox.lo[1], x - self.bbox.lo[2]]];
                    let b = other.mask
                        [[z - other.bbox.lo[0], y - other.bbox.lo[1], x - other.bbox.lo[2]]];
                    if a && b {
                        n += 1;
                    }
                }
            }
        }
        n
    }
}
