//! StarDist ONNX - tiled inference and instance rendering for ray-distance
//! segmentation networks
//!
//! This crate runs exported StarDist graphs (one probability channel, one
//! distance channel per ray) on images of arbitrary size and turns their
//! outputs into integer label images.
//!
//! # Features
//! - Graph inspection: divisibility, receptive-field overlap, and valid input sizes
//! - Adaptive tiling with grid-aligned stitching and CPU retry on accelerator failure
//! - Non-maximum suppression with exact (`compiled-geometry`) or rasterized overlap
//! - 2D polygon and 3D polyhedron rendering
//!
//! # Example
//! ```no_run
//! use ndarray::ArrayD;
//! use stardist_onnx::{RunRequest, RunSettings, StarDistSegmenter};
//!
//! # fn main() -> stardist_onnx::Result<()> {
//! let mut segmenter = StarDistSegmenter::new("default_2d", "models/default_2d")?;
//! let image = ArrayD::<f32>::zeros(ndarray::IxDyn(&[512, 512]));
//! let result = segmenter.run(&RunRequest::nuclear(image, RunSettings::default()))?;
//! println!("{} instances", result.info.prob.len());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod geometry;
pub mod graph;
pub mod inspect;
pub mod layout;
pub mod model;
pub mod postprocess;
pub mod preprocess;
pub mod probe;
pub mod segmenter;
pub mod session;
pub mod tiling;

pub use config::{RunSettings, Task, TilingPolicy, VariantConfig, VARIANTS};
pub use error::{Result, SegmentationError};
pub use geometry::{Capability, Rays};
pub use inspect::{inspect_graph, GraphConstraints, GraphConstraintsCache, ValidSizePattern};
pub use layout::{IoLayouts, Layout};
pub use postprocess::{DetectionCandidate, DetectionSet, InstanceInfo, NmsMode};
pub use probe::GridSpec;
pub use segmenter::{InferencePath, RunRequest, RunResult, StarDistSegmenter};
pub use session::{
    InferenceSession, OrtSession, OrtSessionFactory, ProviderKind, ProviderPolicy, RawOutputs,
    RunOutcome, SessionFactory,
};
pub use tiling::{plan_tiles, run_tiled_inference, TiledPrediction, TilingPlan};
