//! End-to-end segmentation runs for one model variant

use ndarray::ArrayD;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{self, RunSettings, Task, VariantConfig};
use crate::error::{Result, SegmentationError};
use crate::geometry::{self, Capability, Rays};
use crate::inspect::{inspect_graph, GraphConstraints, GraphConstraintsCache, DEFAULT_MAX_PROBE};
use crate::model::resolve_model_path;
use crate::postprocess::render::median;
use crate::postprocess::{
    render_2d, render_3d, suppress, DetectionSet, InstanceInfo, NmsMode, RenderMode,
    SuppressionDomain, DEFAULT_BORDER,
};
use crate::preprocess;
use crate::probe::{build_probe_image, estimate_grid, GridSpec};
use crate::session::{
    run_with_fallback, InferenceSession, OrtSessionFactory, ProviderPolicy, RunOutcome,
    SessionFactory,
};
use crate::tiling::{plan_tiles, run_tiled_inference, TiledPrediction, TilingPlan};

/// One segmentation request
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Only `"nuclear"` is supported
    pub task: String,
    /// Single-channel `(Y, X)` or `(Z, Y, X)` image
    pub image: ArrayD<f32>,
    pub settings: RunSettings,
}

impl RunRequest {
    pub fn nuclear(image: ArrayD<f32>, settings: RunSettings) -> Self {
        Self {
            task: "nuclear".to_string(),
            image,
            settings,
        }
    }
}

/// Which session produced the prediction
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "path", rename_all = "snake_case")]
pub enum InferencePath {
    Primary,
    /// The accelerated run failed and was repeated on CPU
    CpuFallback { first_error: String },
}

/// Output of a segmentation run
#[derive(Debug, Clone)]
pub struct RunResult {
    /// Instance labels with the shape of the input image
    pub masks: ArrayD<i32>,
    /// Probability map at network resolution
    pub prob: ArrayD<f32>,
    /// Ray distances at network resolution, rays on the last axis
    pub dist: ArrayD<f32>,
    pub info: InstanceInfo,
    pub inference: InferencePath,
    pub grid: GridSpec,
    pub plan: TilingPlan,
}

/// Runs one model variant end to end: rescaling, normalization, tiled
/// inference with CPU retry, NMS, and rendering.
///
/// Sessions, graph constraints, and grids are cached per model path for the
/// lifetime of the segmenter.
pub struct StarDistSegmenter<F: SessionFactory = OrtSessionFactory> {
    variant: &'static VariantConfig,
    model_dir: PathBuf,
    model_path: Option<PathBuf>,
    factory: F,
    sessions: HashMap<PathBuf, Box<dyn InferenceSession>>,
    cache: GraphConstraintsCache,
    capability: Capability,
    max_probe: usize,
}

impl StarDistSegmenter<OrtSessionFactory> {
    /// Segmenter for a registered variant backed by ONNX Runtime
    pub fn new(variant: &str, model_dir: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::with_factory(
            config::lookup(variant)?,
            model_dir,
            OrtSessionFactory,
        ))
    }
}

impl<F: SessionFactory> StarDistSegmenter<F> {
    pub fn with_factory(
        variant: &'static VariantConfig,
        model_dir: impl AsRef<Path>,
        factory: F,
    ) -> Self {
        Self {
            variant,
            model_dir: model_dir.as_ref().to_path_buf(),
            model_path: None,
            factory,
            sessions: HashMap::new(),
            cache: GraphConstraintsCache::new(),
            capability: geometry::compiled_geometry().clone(),
            max_probe: DEFAULT_MAX_PROBE,
        }
    }

    /// Use this graph file instead of searching `model_dir`
    pub fn with_model_path(mut self, path: impl AsRef<Path>) -> Self {
        self.model_path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_cache(mut self, cache: GraphConstraintsCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capability = capability;
        self
    }

    /// Largest size tried per axis while probing valid input sizes
    pub fn with_max_probe(mut self, max_probe: usize) -> Self {
        self.max_probe = max_probe.max(1);
        self
    }

    pub fn variant(&self) -> &'static VariantConfig {
        self.variant
    }

    pub fn cache(&self) -> &GraphConstraintsCache {
        &self.cache
    }

    pub fn capability(&self) -> &Capability {
        &self.capability
    }

    pub fn model_path(&self) -> Result<PathBuf> {
        match &self.model_path {
            Some(path) => Ok(path.clone()),
            None => resolve_model_path(&self.model_dir, self.variant),
        }
    }

    /// Constraints for the variant's graph, inspecting it on first use
    pub fn constraints(&mut self) -> Result<GraphConstraints> {
        let path = self.model_path()?;
        self.ensure_session(&path)?;
        let variant = self.variant;
        let max_probe = self.max_probe;
        let Self { sessions, cache, .. } = &mut *self;
        let session = session_for(sessions, &path)?;
        Ok(cache
            .get_or_compute(&path, || inspect_graph(&path, variant, session, max_probe))
            .clone())
    }

    pub fn run(&mut self, request: &RunRequest) -> Result<RunResult> {
        let started = Instant::now();
        let _task: Task = request.task.parse()?;
        let settings = &request.settings;
        settings.validate()?;
        let variant = self.variant;

        let image = &request.image;
        if image.ndim() != variant.ndim {
            return Err(SegmentationError::DimensionMismatch {
                variant: variant.key.to_string(),
                expected: variant.ndim,
                actual: image.ndim(),
                label: variant.shape_label.to_string(),
            });
        }
        if variant.require_compiled_geometry {
            if let Capability::Unavailable(reason) = &self.capability {
                warn!("Compiled geometry unavailable for {}: {}", variant.key, reason);
                return Err(SegmentationError::CompiledOpsRequired(
                    variant.compiled_ops_message.to_string(),
                ));
            }
        }
        let original_shape = image.shape().to_vec();

        let factor =
            preprocess::scale_factor(variant.reference_diameter_px, settings.object_diameter_px)?;
        let (mut prepared, scale) = match preprocess::rescale(image, factor)? {
            Some(scaled) => (scaled, Some(vec![factor; variant.ndim])),
            None => (image.to_owned(), None),
        };
        if let Some(scale) = &scale {
            info!(
                "Rescaled {} input by {:.4} on axes {:?}",
                variant.key, factor, variant.scale_axes
            );
            debug!("Per-axis scale {:?}", scale);
        }
        preprocess::scale_intensity(&mut prepared);
        if settings.normalize {
            preprocess::normalize_percentile(&mut prepared, settings.pmin, settings.pmax)?;
        }

        let path = self.model_path()?;
        self.ensure_session(&path)?;
        let layouts = variant.layouts();
        let max_probe = self.max_probe;
        let Self {
            sessions,
            cache,
            factory,
            ..
        } = &mut *self;
        let session = session_for(sessions, &path)?;
        let constraints = cache
            .get_or_compute(&path, || inspect_graph(&path, variant, session, max_probe))
            .clone();
        let plan = plan_tiles(
            prepared.shape(),
            &constraints,
            &variant.tiling_policy(settings.n_tiles),
        );

        let (outcome, replacement) = run_with_fallback(
            session,
            || factory.open(&path, ProviderPolicy::CpuOnly),
            |session: &mut dyn InferenceSession| {
                let grid = cache.grid_or_compute(&path, variant.key, || {
                    let probe = build_probe_image(prepared.shape(), &constraints);
                    estimate_grid(session, &probe, layouts.input, layouts.prob)
                })?;
                let prediction = run_tiled_inference(&prepared, session, &plan, &grid, layouts)?;
                Ok((grid, prediction))
            },
        );
        let inference = match &outcome {
            RunOutcome::RecoveredViaFallback { first_error, .. } => InferencePath::CpuFallback {
                first_error: first_error.to_string(),
            },
            _ => InferencePath::Primary,
        };
        if let Some(cpu) = replacement {
            sessions.insert(path.clone(), cpu);
        }
        let (grid, prediction) = outcome.into_result()?;
        let TiledPrediction {
            prob, dist, plan, ..
        } = prediction;

        let candidates =
            DetectionSet::from_maps(&prob, &dist, &grid, settings.prob_thresh, DEFAULT_BORDER)?;
        let mode = if self.capability.is_available() {
            NmsMode::Compiled
        } else {
            NmsMode::Fallback
        };
        let n_rays = dist.shape().last().copied().unwrap_or(0);
        let frame: Vec<usize> = prob
            .shape()
            .iter()
            .zip(grid.axes())
            .map(|(s, g)| s * g)
            .collect();

        let mut sphere_radii = false;
        let (kept, masks) = match variant.renderer {
            config::Renderer::Polygon2d => {
                let domain = SuppressionDomain::Planar {
                    shape: [frame[0], frame[1]],
                };
                let kept = suppress(&candidates, settings.nms_thresh, mode, domain);
                let masks = render_2d(
                    &kept,
                    [original_shape[0], original_shape[1]],
                    scale.as_ref().map(|s| [s[0], s[1]]),
                );
                (kept, masks.into_dyn())
            }
            config::Renderer::Polyhedron3d => {
                let rays = Rays::golden_spiral(n_rays);
                let domain = SuppressionDomain::Volumetric {
                    shape: [frame[0], frame[1], frame[2]],
                    rays: &rays,
                };
                let kept = suppress(&candidates, settings.nms_thresh, mode, domain);
                let render_mode = RenderMode::from(mode);
                sphere_radii = render_mode == RenderMode::Sphere;
                let masks = render_3d(
                    &kept,
                    [original_shape[0], original_shape[1], original_shape[2]],
                    scale.as_ref().map(|s| [s[0], s[1], s[2]]),
                    &rays,
                    render_mode,
                );
                (kept, masks.into_dyn())
            }
        };

        info!(
            "Segmented {:?} with {}: {} candidates, {} instances, {} ms",
            original_shape,
            variant.key,
            candidates.len(),
            kept.len(),
            started.elapsed().as_millis()
        );
        let mut info = kept.to_info(variant.ndim, scale.as_deref(), n_rays);
        if sphere_radii {
            info.radii = Some(info.dist.iter().map(|d| median(d)).collect());
        }
        Ok(RunResult {
            masks,
            info,
            prob,
            dist,
            inference,
            grid,
            plan,
        })
    }

    fn ensure_session(&mut self, path: &Path) -> Result<()> {
        if !self.sessions.contains_key(path) {
            let session = self.factory.open(path, ProviderPolicy::Preferred)?;
            self.sessions.insert(path.to_path_buf(), session);
        }
        Ok(())
    }
}

fn session_for<'a>(
    sessions: &'a mut HashMap<PathBuf, Box<dyn InferenceSession>>,
    path: &Path,
) -> Result<&'a mut (dyn InferenceSession + 'static)> {
    sessions
        .get_mut(path)
        .map(|s| s.as_mut())
        .ok_or_else(|| SegmentationError::ModelLoad {
            path: path.display().to_string(),
            error: "session was not opened".to_string(),
        })
}
