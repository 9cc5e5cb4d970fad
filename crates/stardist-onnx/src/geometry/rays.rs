//! Golden-spiral ray directions for 3D star-convex polyhedra

use serde::Serialize;

/// Unit ray directions in `(z, y, x)` order plus the triangles connecting
/// them into a closed surface, oriented outward
#[derive(Debug, Clone, Serialize)]
pub struct Rays {
    pub vertices: Vec<[f32; 3]>,
    pub faces: Vec<[usize; 3]>,
}

impl Rays {
    /// `n` directions along a golden-angle spiral from the south to the north pole
    pub fn golden_spiral(n: usize) -> Self {
        let golden = (3.0 - 5.0f64.sqrt()) * std::f64::consts::PI;
        let vertices: Vec<[f32; 3]> = (0..n)
            .map(|i| {
                let z = if n > 1 {
                    -1.0 + 2.0 * i as f64 / (n - 1) as f64
                } else {
                    0.0
                };
                let rho = (1.0 - z * z).max(0.0).sqrt();
                let phi = golden * i as f64;
                [z as f32, (rho * phi.sin()) as f32, (rho * phi.cos()) as f32]
            })
            .collect();
        let faces = convex_hull_faces(&vertices);
        Self { vertices, faces }
    }

    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }
}

fn sub(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

pub(crate) fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

pub(crate) fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

/// Hull triangles of points on the unit sphere.
///
/// A triple is a face when every other point lies on the origin's side of its
/// plane. Coplanar extra points are tolerated so that each hull facet is
/// triangulated once by the lowest-indexed triples.
fn convex_hull_faces(vertices: &[[f32; 3]]) -> Vec<[usize; 3]> {
    const EPS: f64 = 1e-9;
    let pts: Vec<[f64; 3]> = vertices
        .iter()
        .map(|v| [v[0] as f64, v[1] as f64, v[2] as f64])
        .collect();
    let n = pts.len();
    let mut faces = Vec::new();
    for i in 0..n {
        for j in i + 1..n {
            for k in j + 1..n {
                let mut normal = cross(sub(pts[j], pts[i]), sub(pts[k], pts[i]));
                let norm = dot(normal, normal).sqrt();
                if norm < EPS {
                    continue;
                }
                normal = [normal[0] / norm, normal[1] / norm, normal[2] / norm];
                let mut offset = dot(normal, pts[i]);
                let mut face = [i, j, k];
                if offset < 0.0 {
                    normal = [-normal[0], -normal[1], -normal[2]];
                    offset = -offset;
                    face = [i, k, j];
                }
                let mut coplanar = false;
                let is_face = (0..n).all(|m| {
                    if m == i || m == j || m == k {
                        return true;
                    }
                    let side = dot(normal, pts[m]) - offset;
                    if side.abs() <= EPS {
                        coplanar = true;
                    }
                    side <= EPS
                });
                if is_face && (!coplanar || !overlaps_existing(&faces, &pts, normal, offset, face)) {
                    faces.push(face);
                }
            }
        }
    }
    faces
}

/// True when a face on the same plane already covers the centroid of `face`
fn overlaps_existing(
    faces: &[[usize; 3]],
    pts: &[[f64; 3]],
    normal: [f64; 3],
    offset: f64,
    face: [usize; 3],
) -> bool {
    let centroid = [0, 1, 2].map(|a| (pts[face[0]][a] + pts[face[1]][a] + pts[face[2]][a]) / 3.0);
    faces.iter().any(|f| {
        let fnormal = cross(sub(pts[f[1]], pts[f[0]]), sub(pts[f[2]], pts[f[0]]));
        let fnorm = dot(fnormal, fnormal).sqrt();
        if fnorm < 1e-12 || dot(fnormal, normal) / fnorm < 1.0 - 1e-9 {
            return false;
        }
        if (dot(normal, pts[f[0]]) - offset).abs() > 1e-9 {
            return false;
        }
        (0..3).all(|e| {
            let a = pts[f[e]];
            let b = pts[f[(e + 1) % 3]];
            dot(cross(sub(b, a), sub(centroid, a)), normal) >= -1e-12
        })
    })
}
