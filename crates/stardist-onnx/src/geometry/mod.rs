//! Star-convex shape geometry: polygons, ray sets, polyhedra, and the
//! compiled-geometry capability probe.

pub mod polygon;
pub mod polyhedron;
pub mod rays;

use once_cell::sync::OnceCell;
use serde::Serialize;
use tracing::{debug, warn};

pub use polygon::{ray_angles, Polygon, PolygonMask};
pub use polyhedron::{Polyhedron, VoxelMask};
pub use rays::Rays;

/// Set to `1` to force the rasterized fallback geometry
pub const DISABLE_COMPILED_ENV: &str = "STARDIST_ONNX_DISABLE_COMPILED";

/// Whether exact (compiled) overlap geometry can be used
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Capability {
    Available,
    Unavailable(String),
}

impl Capability {
    pub fn is_available(&self) -> bool {
        matches!(self, Capability::Available)
    }

    /// Probe the build and environment
    pub fn detect() -> Self {
        if std::env::var(DISABLE_COMPILED_ENV).is_ok_and(|v| v.trim() == "1") {
            return Capability::Unavailable(format!("disabled by {DISABLE_COMPILED_ENV}=1"));
        }
        if cfg!(feature = "compiled-geometry") {
            Capability::Available
        } else {
            Capability::Unavailable("built without the `compiled-geometry` feature".to_string())
        }
    }
}

static DETECTED: OnceCell<Capability> = OnceCell::new();

/// Process-wide capability, detected on first use
pub fn compiled_geometry() -> &'static Capability {
    DETECTED.get_or_init(|| {
        let capability = Capability::detect();
        match &capability {
            Capability::Available => debug!("Compiled geometry available"),
            Capability::Unavailable(reason) => {
                warn!("Compiled geometry unavailable ({}), using fallback overlap", reason)
            }
        }
        capability
    })
}

/// Integer bounding box `[lo, hi)` per axis, clipped to an image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundingBox {
    pub lo: Vec<usize>,
    pub hi: Vec<usize>,
}

impl BoundingBox {
    /// Box covering every pixel center within `[min, max]`, clipped to `shape`
    pub fn from_extent(min: &[f32], max: &[f32], shape: &[usize]) -> Self {
        let lo = min
            .iter()
            .zip(shape)
            .map(|(&m, &s)| (m.floor().max(0.0) as usize).min(s))
            .collect();
        let hi = max
            .iter()
            .zip(shape)
            .map(|(&m, &s)| ((m.ceil() + 1.0).max(0.0) as usize).min(s))
            .collect();
        Self { lo, hi }
    }

    pub fn is_empty(&self) -> bool {
        self.lo.iter().zip(&self.hi).any(|(l, h)| l >= h)
    }

    pub fn extent(&self) -> Vec<usize> {
        self.lo
            .iter()
            .zip(&self.hi)
            .map(|(l, h)| h.saturating_sub(*l))
            .collect()
    }

    pub fn intersect(&self, other: &Self) -> Option<Self> {
        let lo: Vec<usize> = self.lo.iter().zip(&other.lo).map(|(a, b)| *a.max(b)).collect();
        let hi: Vec<usize> = self.hi.iter().zip(&other.hi).map(|(a, b)| *a.min(b)).collect();
        let out = Self { lo, hi };
        (!out.is_empty()).then_some(out)
    }
}
