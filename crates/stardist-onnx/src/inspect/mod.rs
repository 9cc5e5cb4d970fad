//! Graph inspector: size constraints an exported network imposes on its input
//!
//! # Features
//! - Divisibility from strided convolutions, pools and resampling
//! - Safe tile overlap from the receptive field
//! - Exactly-valid input sizes discovered by probing the session
//!
//! Every step degrades to a conservative fallback (static divisibility, zero
//! overlap, no valid-size constraint) so an unfamiliar graph still tiles.

pub mod divisibility;
pub mod receptive_field;
pub mod valid_sizes;

pub use divisibility::infer_divisibility;
pub use receptive_field::{infer_overlap, infer_receptive_field};
pub use valid_sizes::{
    infer_period_and_residues, infer_valid_size_patterns, snap_shape, ValidSizePattern,
    DEFAULT_MAX_PROBE,
};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::VariantConfig;
use crate::graph::proto::NodeProto;
use crate::graph::{attr, attr_floats, attr_ints, GraphModel};
use crate::probe::GridSpec;
use crate::session::InferenceSession;

/// Size constraints of one inference graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphConstraints {
    pub divisibility: Vec<usize>,
    pub overlap: Vec<usize>,
    /// One pattern per spatial axis when probing succeeded
    pub patterns: Option<Vec<ValidSizePattern>>,
}

impl GraphConstraints {
    /// Constraints used when nothing could be learned from the graph
    pub fn fallback(variant: &VariantConfig) -> Self {
        Self {
            divisibility: variant.fallback_divisibility(),
            overlap: vec![0; variant.ndim],
            patterns: None,
        }
    }
}

/// Derive all constraints for the graph at `path`.
///
/// `session` must already be open on the same graph; it is only used for
/// valid-size probing.
pub fn inspect_graph(
    path: &Path,
    variant: &VariantConfig,
    session: &mut dyn InferenceSession,
    max_probe: usize,
) -> GraphConstraints {
    let ndim = variant.ndim;
    let graph = GraphModel::from_file(path);
    if let Err(e) = &graph {
        warn!("Could not parse ONNX graph {:?}: {}", path, e);
    }
    let graph = graph.ok();

    let divisibility = match graph.as_ref().map(|g| infer_divisibility(g, ndim)) {
        Some(Ok(div)) => div,
        Some(Err(e)) => {
            warn!("Divisibility inference failed ({}), using fallback", e);
            variant.fallback_divisibility()
        }
        None => variant.fallback_divisibility(),
    };

    let overlap = match graph.as_ref().map(|g| infer_overlap(g, ndim)) {
        Some(Ok(overlap)) => overlap,
        Some(Err(e)) => {
            warn!("Overlap inference failed ({}), using zero overlap", e);
            vec![0; ndim]
        }
        None => vec![0; ndim],
    };

    let patterns = match infer_valid_size_patterns(session, variant.input_layout, ndim, max_probe)
    {
        Ok(patterns) => Some(patterns),
        Err(e) => {
            warn!("Valid-size probing failed ({}), sizes are unconstrained", e);
            None
        }
    };

    let constraints = GraphConstraints {
        divisibility,
        overlap,
        patterns,
    };
    info!(
        "Graph constraints for {:?}: divisibility {:?}, overlap {:?}, patterns {}",
        path,
        constraints.divisibility,
        constraints.overlap,
        if constraints.patterns.is_some() { "found" } else { "none" }
    );
    constraints
}

/// Memoization of per-graph constraints and grids.
///
/// Entries are keyed by graph path and live as long as the cache; there is
/// no invalidation. Population is check-then-insert through `&mut self`, so
/// sharing one cache across threads needs external locking.
#[derive(Debug, Default)]
pub struct GraphConstraintsCache {
    constraints: HashMap<PathBuf, GraphConstraints>,
    grids: HashMap<(PathBuf, String), GridSpec>,
}

impl GraphConstraintsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &Path) -> Option<&GraphConstraints> {
        self.constraints.get(path)
    }

    /// Cached constraints for `path`, computing them on first use
    pub fn get_or_compute<F>(&mut self, path: &Path, compute: F) -> &GraphConstraints
    where
        F: FnOnce() -> GraphConstraints,
    {
        self.constraints
            .entry(path.to_path_buf())
            .or_insert_with(compute)
    }

    /// Cached grid for `(path, variant)`; failed computations are not cached
    pub fn grid_or_compute<F>(
        &mut self,
        path: &Path,
        variant: &str,
        compute: F,
    ) -> crate::Result<GridSpec>
    where
        F: FnOnce() -> crate::Result<GridSpec>,
    {
        let key = (path.to_path_buf(), variant.to_string());
        if let Some(grid) = self.grids.get(&key) {
            return Ok(grid.clone());
        }
        let grid = compute()?;
        self.grids.insert(key, grid.clone());
        Ok(grid)
    }

    pub fn len(&self) -> usize {
        self.constraints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }
}

/// Values of initializers and `Constant` node outputs, by tensor name
pub(crate) fn constant_values(graph: &GraphModel) -> HashMap<String, Vec<f64>> {
    let mut values: HashMap<String, Vec<f64>> = graph
        .graph()
        .initializer
        .iter()
        .map(|t| (t.name.clone(), t.values_f64()))
        .collect();
    for node in graph.nodes().iter().filter(|n| n.op_type == "Constant") {
        if let (Some(t), Some(out)) = (attr(node, "value").and_then(|a| a.t.as_ref()), node.output.first()) {
            values.insert(out.clone(), t.values_f64());
        }
    }
    values
}

/// Tracked state of every node input that has one
pub(crate) fn node_inputs<'a, V>(node: &NodeProto, known: &'a HashMap<String, V>) -> Vec<&'a V> {
    node.input
        .iter()
        .filter(|name| !name.is_empty())
        .filter_map(|name| known.get(name))
        .collect()
}

/// Per-axis integer attribute, broadcast from a single value when needed
pub(crate) fn spatial_attr(node: &NodeProto, name: &str, ndim: usize, default: i64) -> Vec<i64> {
    match attr_ints(node, name) {
        Some(v) if v.len() == ndim => v,
        Some(v) if v.len() == 1 => vec![v[0]; ndim],
        _ => vec![default; ndim],
    }
}

/// Spatial scale factors of a `Resize` or `Upsample` node
pub(crate) fn resample_factors(
    node: &NodeProto,
    constants: &HashMap<String, Vec<f64>>,
    ndim: usize,
) -> Option<Vec<f64>> {
    let scales_input = match node.op_type.as_str() {
        "Resize" => node.input.get(2),
        _ => node.input.get(1),
    };
    let scales = scales_input
        .filter(|name| !name.is_empty())
        .and_then(|name| constants.get(name))
        .filter(|s| !s.is_empty())
        .cloned()
        .or_else(|| attr_floats(node, "scales").map(|f| f.into_iter().map(f64::from).collect()))?;

    if scales.len() == ndim {
        return Some(scales);
    }
    if scales.len() != ndim + 2 {
        return None;
    }
    // Batch first; channels either right after it or last
    let channels_last = (scales[ndim + 1] - 1.0).abs() < 1e-6 && (scales[1] - 1.0).abs() > 1e-6;
    if channels_last {
        Some(scales[1..=ndim].to_vec())
    } else {
        Some(scales[2..].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::lookup;
    use crate::graph::testing::*;

    #[test]
    fn test_fallback_constraints() {
        let c = GraphConstraints::fallback(lookup("default_2d").unwrap());
        assert_eq!(c.divisibility, vec![16, 16]);
        assert_eq!(c.overlap, vec![0, 0]);
        assert!(c.patterns.is_none());
    }

    #[test]
    fn test_cache_computes_once() {
        let mut cache = GraphConstraintsCache::new();
        let path = Path::new("/models/a.onnx");
        let mut calls = 0;
        for _ in 0..3 {
            cache.get_or_compute(path, || {
                calls += 1;
                GraphConstraints {
                    divisibility: vec![8, 8],
                    overlap: vec![4, 4],
                    patterns: None,
                }
            });
        }
        assert_eq!(calls, 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(path).unwrap().divisibility, vec![8, 8]);
    }

    #[test]
    fn test_grid_cache_skips_failures() {
        let mut cache = GraphConstraintsCache::new();
        let path = Path::new("/models/a.onnx");
        let failed = cache.grid_or_compute(path, "default_2d", || {
            Err(crate::SegmentationError::Inference("boom".into()))
        });
        assert!(failed.is_err());
        let grid = cache
            .grid_or_compute(path, "default_2d", || Ok(GridSpec(vec![2, 2])))
            .unwrap();
        assert_eq!(grid, GridSpec(vec![2, 2]));
        let cached = cache
            .grid_or_compute(path, "default_2d", || Ok(GridSpec(vec![1, 1])))
            .unwrap();
        assert_eq!(cached, GridSpec(vec![2, 2]));
    }

    #[test]
    fn test_resample_factors_layouts() {
        let constants: HashMap<String, Vec<f64>> = [
            ("nchw".to_string(), vec![1.0, 1.0, 2.0, 2.0]),
            ("nhwc".to_string(), vec![1.0, 2.0, 2.0, 1.0]),
        ]
        .into_iter()
        .collect();
        let nchw = node("Resize", &["x", "", "nchw"], "y", Vec::new());
        let nhwc = node("Resize", &["x", "", "nhwc"], "y", Vec::new());
        assert_eq!(resample_factors(&nchw, &constants, 2), Some(vec![2.0, 2.0]));
        assert_eq!(resample_factors(&nhwc, &constants, 2), Some(vec![2.0, 2.0]));

        let sizes_only: NodeProto = node("Resize", &["x", "", "", "sizes"], "y", Vec::new());
        assert_eq!(resample_factors(&sizes_only, &constants, 2), None);
    }
}
