//! Run settings and the static model-variant registry

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{Result, SegmentationError};
use crate::layout::{IoLayouts, Layout};

/// Largest tile edge the tiler will use on a capped axis
pub const DEFAULT_MAX_TILE_EDGE: usize = 1024;

/// Segmentation task requested by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Task {
    Nuclear,
}

impl FromStr for Task {
    type Err = SegmentationError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "nuclear" => Ok(Task::Nuclear),
            other => Err(SegmentationError::UnsupportedTask(other.to_string())),
        }
    }
}

/// User-facing settings for one segmentation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    /// Minimum object probability for a candidate center
    pub prob_thresh: f32,
    /// Overlap ratio above which a lower-scoring candidate is suppressed
    pub nms_thresh: f32,
    /// Requested number of tiles per axis
    pub n_tiles: usize,
    /// Apply percentile normalization before inference
    pub normalize: bool,
    pub pmin: f32,
    pub pmax: f32,
    /// Typical object diameter in the input image
    pub object_diameter_px: f32,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            prob_thresh: 0.5,
            nms_thresh: 0.4,
            n_tiles: 1,
            normalize: true,
            pmin: 1.0,
            pmax: 99.8,
            object_diameter_px: 30.0,
        }
    }
}

impl RunSettings {
    /// Parse settings from JSON, filling missing fields with defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(json)
            .map_err(|e| SegmentationError::InvalidSettings(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.prob_thresh) {
            return Err(SegmentationError::InvalidSettings(format!(
                "prob_thresh must be within [0, 1], got {}",
                self.prob_thresh
            )));
        }
        if !(0.0..=1.0).contains(&self.nms_thresh) {
            return Err(SegmentationError::InvalidSettings(format!(
                "nms_thresh must be within [0, 1], got {}",
                self.nms_thresh
            )));
        }
        if self.n_tiles == 0 {
            return Err(SegmentationError::InvalidSettings(
                "n_tiles must be at least 1".to_string(),
            ));
        }
        if self.normalize
            && !(0.0 <= self.pmin && self.pmin < self.pmax && self.pmax <= 100.0)
        {
            return Err(SegmentationError::InvalidSettings(format!(
                "percentiles must satisfy 0 <= pmin < pmax <= 100, got pmin={} pmax={}",
                self.pmin, self.pmax
            )));
        }
        if !self.object_diameter_px.is_finite() || self.object_diameter_px <= 0.0 {
            return Err(SegmentationError::InvalidDiameter(self.object_diameter_px));
        }
        Ok(())
    }
}

/// Which instance renderer a variant's outputs feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Renderer {
    Polygon2d,
    Polyhedron3d,
}

/// Immutable description of one exported network variant
#[derive(Debug, Clone, Serialize)]
pub struct VariantConfig {
    pub key: &'static str,
    pub ndim: usize,
    /// Human-readable axis description used in error messages
    pub shape_label: &'static str,
    pub input_layout: Layout,
    pub prob_layout: Layout,
    pub dist_layout: Layout,
    /// Object diameter the network was trained on
    pub reference_diameter_px: f32,
    pub scale_axes: &'static [&'static str],
    pub default_filename: &'static str,
    /// Model paths relative to the variant directory, in priority order
    pub model_candidates: &'static [&'static str],
    pub fallback_divisibility: usize,
    /// Only cap the Y/X axes of 3D tiles
    pub cap_xy_only: bool,
    /// Axes excluded from valid-size snapping
    pub snap_skip_axes: &'static [usize],
    pub enforce_post_snap_divisibility: bool,
    pub renderer: Renderer,
    /// Refuse to run when exact geometry is unavailable
    pub require_compiled_geometry: bool,
    pub compiled_ops_message: &'static str,
}

impl VariantConfig {
    pub fn layouts(&self) -> IoLayouts {
        IoLayouts {
            input: self.input_layout,
            prob: self.prob_layout,
            dist: self.dist_layout,
        }
    }

    pub fn fallback_divisibility(&self) -> Vec<usize> {
        vec![self.fallback_divisibility.max(1); self.ndim]
    }

    /// Tiling policy for this variant with the requested tile count
    pub fn tiling_policy(&self, n_tiles: usize) -> TilingPolicy {
        TilingPolicy {
            max_tile_edge: DEFAULT_MAX_TILE_EDGE,
            n_tiles: n_tiles.max(1),
            cap_xy_only: self.cap_xy_only,
            snap_skip_axes: self.snap_skip_axes.to_vec(),
            enforce_post_snap_divisibility: self.enforce_post_snap_divisibility,
        }
    }
}

/// Registered network variants
pub static VARIANTS: &[VariantConfig] = &[
    VariantConfig {
        key: "default_2d",
        ndim: 2,
        shape_label: "(Y, X)",
        input_layout: Layout::Nhwc,
        prob_layout: Layout::Nhwc,
        dist_layout: Layout::Nhwc,
        reference_diameter_px: 17.44,
        scale_axes: &["Y", "X"],
        default_filename: "default_2d.onnx",
        model_candidates: &[
            "onnx_models/default_2d.onnx",
            "default_2d.onnx",
            "onnx_models/stardist_mod_2d.onnx",
            "onnx_models/stardist2d_2D_versatile_fluo.onnx",
            "stardist_mod_2d.onnx",
            "stardist2d_2D_versatile_fluo.onnx",
            "stardist2d.onnx",
        ],
        fallback_divisibility: 16,
        cap_xy_only: false,
        snap_skip_axes: &[],
        enforce_post_snap_divisibility: true,
        renderer: Renderer::Polygon2d,
        require_compiled_geometry: false,
        compiled_ops_message: "StarDist 2D compiled ops are missing; build with the \
                               `compiled-geometry` feature",
    },
    VariantConfig {
        key: "default_3d",
        ndim: 3,
        shape_label: "(Z, Y, X)",
        input_layout: Layout::Ndhwc,
        prob_layout: Layout::Ndhwc,
        dist_layout: Layout::Ndhwc,
        reference_diameter_px: 30.0,
        scale_axes: &["Z", "Y", "X"],
        default_filename: "default_3d.onnx",
        model_candidates: &[
            "onnx_models/default_3d.onnx",
            "default_3d.onnx",
            "onnx_models/stardist3d_3D_demo.onnx",
            "stardist3d_3D_demo.onnx",
            "stardist3d.onnx",
        ],
        fallback_divisibility: 1,
        cap_xy_only: true,
        snap_skip_axes: &[0],
        enforce_post_snap_divisibility: false,
        renderer: Renderer::Polyhedron3d,
        require_compiled_geometry: true,
        compiled_ops_message: "3D StarDist labeling requires compiled ops; build with the \
                               `compiled-geometry` feature",
    },
];

/// Find a registered variant by key
pub fn lookup(key: &str) -> Result<&'static VariantConfig> {
    VARIANTS
        .iter()
        .find(|v| v.key == key)
        .ok_or_else(|| SegmentationError::UnknownVariant(key.to_string()))
}

/// Limits applied when choosing a tile shape
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TilingPolicy {
    pub max_tile_edge: usize,
    /// Each axis is capped at `ceil(size / n_tiles)`
    pub n_tiles: usize,
    pub cap_xy_only: bool,
    pub snap_skip_axes: Vec<usize>,
    pub enforce_post_snap_divisibility: bool,
}

impl Default for TilingPolicy {
    fn default() -> Self {
        Self {
            max_tile_edge: DEFAULT_MAX_TILE_EDGE,
            n_tiles: 1,
            cap_xy_only: false,
            snap_skip_axes: Vec::new(),
            enforce_post_snap_divisibility: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = RunSettings::default();
        assert_eq!(settings.prob_thresh, 0.5);
        assert_eq!(settings.nms_thresh, 0.4);
        assert_eq!(settings.object_diameter_px, 30.0);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_settings_from_partial_json() {
        let settings = RunSettings::from_json(r#"{"prob_thresh": 0.7, "normalize": false}"#).unwrap();
        assert_eq!(settings.prob_thresh, 0.7);
        assert!(!settings.normalize);
        assert_eq!(settings.pmax, 99.8);
    }

    #[test]
    fn test_invalid_settings() {
        let settings = RunSettings {
            nms_thresh: 1.5,
            ..Default::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(SegmentationError::InvalidSettings(_))
        ));

        let settings = RunSettings {
            object_diameter_px: 0.0,
            ..Default::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(SegmentationError::InvalidDiameter(_))
        ));
    }

    #[test]
    fn test_task_parsing() {
        assert_eq!("nuclear".parse::<Task>().unwrap(), Task::Nuclear);
        assert!(matches!(
            "cyto".parse::<Task>(),
            Err(SegmentationError::UnsupportedTask(_))
        ));
    }

    #[test]
    fn test_registry_lookup() {
        let v2 = lookup("default_2d").unwrap();
        assert_eq!(v2.ndim, 2);
        assert_eq!(v2.fallback_divisibility(), vec![16, 16]);
        assert!(!v2.require_compiled_geometry);

        let v3 = lookup("default_3d").unwrap();
        assert_eq!(v3.renderer, Renderer::Polyhedron3d);
        assert_eq!(v3.tiling_policy(2).snap_skip_axes, vec![0]);
        assert!(v3.tiling_policy(2).cap_xy_only);

        assert!(lookup("default_4d").is_err());
    }
}
