//! Star-convex polygons from radial distances

use ndarray::Array2;

use super::BoundingBox;

/// Evenly spaced ray angles on `[0, 2π)`
pub fn ray_angles(n_rays: usize) -> Vec<f32> {
    (0..n_rays)
        .map(|i| 2.0 * std::f32::consts::PI * i as f32 / n_rays as f32)
        .collect()
}

/// Polygon in `(row, col)` image coordinates
#[derive(Debug, Clone, PartialEq)]
pub struct Polygon {
    pub rows: Vec<f32>,
    pub cols: Vec<f32>,
}

impl Polygon {
    /// Vertices `center + d_k * (sin θ_k, cos θ_k)`, each axis multiplied
    /// by `scale` afterwards
    pub fn from_rays(center: [f32; 2], distances: &[f32], scale: [f32; 2]) -> Self {
        let angles = ray_angles(distances.len());
        let (rows, cols) = distances
            .iter()
            .zip(&angles)
            .map(|(&d, &phi)| {
                (
                    center[0] + d * phi.sin() * scale[0],
                    center[1] + d * phi.cos() * scale[1],
                )
            })
            .unzip();
        Self { rows, cols }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Shoelace area
    pub fn area(&self) -> f64 {
        let n = self.len();
        if n < 3 {
            return 0.0;
        }
        let twice: f64 = (0..n)
            .map(|i| {
                let j = (i + 1) % n;
                self.rows[i] as f64 * self.cols[j] as f64 - self.rows[j] as f64 * self.cols[i] as f64
            })
            .sum();
        twice.abs() / 2.0
    }

    pub fn bounding_box(&self, shape: [usize; 2]) -> BoundingBox {
        if self.is_empty() {
            return BoundingBox {
                lo: vec![0, 0],
                hi: vec![0, 0],
            };
        }
        let fold = |v: &[f32]| {
            v.iter()
                .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &x| (lo.min(x), hi.max(x)))
        };
        let (r0, r1) = fold(&self.rows);
        let (c0, c1) = fold(&self.cols);
        BoundingBox::from_extent(&[r0, c0], &[r1, c1], &shape)
    }

    /// Even-odd test at a pixel center
    pub fn contains(&self, row: f32, col: f32) -> bool {
        let n = self.len();
        let mut inside = false;
        let mut j = n.wrapping_sub(1);
        for i in 0..n {
            let (ri, ci) = (self.rows[i], self.cols[i]);
            let (rj, cj) = (self.rows[j], self.cols[j]);
            if (ri > row) != (rj > row) {
                let cross = (cj - ci) * (row - ri) / (rj - ri) + ci;
                if col < cross {
                    inside = !inside;
                }
            }
            j = i;
        }
        inside
    }

    /// Rasterize the pixel centers inside the polygon within its clipped
    /// bounding box
    pub fn rasterize(&self, shape: [usize; 2]) -> PolygonMask {
        let bbox = self.bounding_box(shape);
        let [h, w] = [bbox.extent()[0], bbox.extent()[1]];
        let mut mask = Array2::from_elem((h, w), false);
        if bbox.is_empty() || self.len() < 3 {
            return PolygonMask { bbox, mask, count: 0 };
        }
        let mut count = 0;
        for ((r, c), v) in mask.indexed_iter_mut() {
            if self.contains((bbox.lo[0] + r) as f32, (bbox.lo[1] + c) as f32) {
                *v = true;
                count += 1;
            }
        }
        PolygonMask { bbox, mask, count }
    }

    #[cfg(feature = "compiled-geometry")]
    fn to_geo(&self) -> geo::Polygon<f64> {
        use geo::{Coord, LineString};
        let coords: Vec<Coord<f64>> = self
            .rows
            .iter()
            .zip(&self.cols)
            .map(|(&r, &c)| Coord {
                x: c as f64,
                y: r as f64,
            })
            .collect();
        geo::Polygon::new(LineString::from(coords), vec![])
    }

    /// Exact area of the intersection with `other`
    #[cfg(feature = "compiled-geometry")]
    pub fn intersection_area(&self, other: &Polygon) -> f64 {
        use geo::Area;
        use geo_clipper::Clipper;
        if self.len() < 3 || other.len() < 3 {
            return 0.0;
        }
        self.to_geo()
            .intersection(&other.to_geo(), CLIPPER_FACTOR)
            .unsigned_area()
    }
}

/// Fixed-point scale used when handing float coordinates to Clipper
#[cfg(feature = "compiled-geometry")]
const CLIPPER_FACTOR: f64 = 1024.0;

/// Rasterized polygon restricted to its bounding box
#[derive(Debug, Clone)]
pub struct PolygonMask {
    pub bbox: BoundingBox,
    pub mask: Array2<bool>,
    /// Number of set pixels
    pub count: usize,
}

impl PolygonMask {
    /// Pixels set in both masks
    pub fn overlap(&self, other: &PolygonMask) -> usize {
        let Some(bbox) = self.bbox.intersect(&other.bbox) else {
            return 0;
        };
        let mut n = 0;
        for r in bbox.lo[0]..bbox.hi[0] {
            for c in bbox.lo[1]..bbox.hi[1] {
                let a = self.mask[[r - self.bbox.lo[0], c - self.bbox.lo[1]]];
                let b = other.mask[[r - other.bbox.lo[0], c - other.bbox.lo[1]]];
                if a && b {
                    n += 1;
                }
            }
        }
        n
    }
}
