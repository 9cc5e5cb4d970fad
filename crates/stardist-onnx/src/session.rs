//! Inference session seam, the ONNX Runtime implementation, and the
//! CPU retry policy for accelerator failures.

use ndarray::{ArrayD, IxDyn};
use ort::execution_providers::CPUExecutionProvider;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::error::{Result, SegmentationError};
use crate::graph::{resolve_io_names, GraphModel, IoNames, TensorInfo};

/// Raw network outputs, still carrying batch and channel axes
#[derive(Debug, Clone)]
pub struct RawOutputs {
    pub prob: ArrayD<f32>,
    pub dist: ArrayD<f32>,
}

/// Which execution path a session runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// At least one hardware accelerator provider was registered
    Accelerated,
    Cpu,
}

/// Execution providers requested when opening a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderPolicy {
    /// Compiled-in accelerators first, CPU last
    Preferred,
    CpuOnly,
}

/// A loaded network that maps one input tensor to probability and distance
/// tensors
pub trait InferenceSession {
    /// `input` is the full tensor including batch and channel axes
    fn run(&mut self, input: &ArrayD<f32>) -> Result<RawOutputs>;

    fn provider(&self) -> ProviderKind;
}

/// Opens sessions for graph files
pub trait SessionFactory {
    fn open(&self, path: &Path, policy: ProviderPolicy) -> Result<Box<dyn InferenceSession>>;
}

/// ONNX Runtime session with resolved input/output names
pub struct OrtSession {
    session: Session,
    io: IoNames,
    provider: ProviderKind,
}

impl OrtSession {
    pub fn open(path: &Path, policy: ProviderPolicy) -> Result<Self> {
        if !path.exists() {
            return Err(SegmentationError::ModelLoad {
                path: path.display().to_string(),
                error: "file not found".to_string(),
            });
        }

        // Allow override via environment variable
        let num_threads = std::env::var("STARDIST_ONNX_THREADS")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or_else(num_cpus::get_physical);

        let (providers, provider) = execution_providers(policy);
        let session = Session::builder()
            .map_err(|e| session_error(path, e))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| session_error(path, e))?
            .with_intra_threads(num_threads)
            .map_err(|e| session_error(path, e))?
            .with_execution_providers(providers)
            .map_err(|e| session_error(path, e))?
            .commit_from_file(path)
            .map_err(|e| session_error(path, e))?;

        // Declared shapes come from the graph; the session only exposes names
        let declared = GraphModel::from_file(path).ok();
        let find_dims = |name: &str, infos: Option<Vec<TensorInfo>>| {
            infos
                .and_then(|infos| infos.into_iter().find(|i| i.name == name))
                .map(|i| i.dims)
                .unwrap_or_default()
        };
        let inputs: Vec<TensorInfo> = session
            .inputs
            .iter()
            .map(|i| {
                TensorInfo::new(
                    i.name.clone(),
                    find_dims(&i.name, declared.as_ref().map(|g| g.input_infos())),
                )
            })
            .collect();
        let outputs: Vec<TensorInfo> = session
            .outputs
            .iter()
            .map(|o| {
                TensorInfo::new(
                    o.name.clone(),
                    find_dims(&o.name, declared.as_ref().map(|g| g.output_infos())),
                )
            })
            .collect();
        let io = resolve_io_names(&inputs, &outputs)?;

        info!(
            "Loaded ONNX model {:?} ({:?}, {} threads): input '{}', prob '{}', dist '{}'",
            path, provider, num_threads, io.input, io.prob, io.dist
        );
        Ok(Self {
            session,
            io,
            provider,
        })
    }

    pub fn io_names(&self) -> &IoNames {
        &self.io
    }
}

impl InferenceSession for OrtSession {
    fn run(&mut self, input: &ArrayD<f32>) -> Result<RawOutputs> {
        let input = input.as_standard_layout();
        let input_tensor = TensorRef::from_array_view(input.view())
            .map_err(|e| SegmentationError::Inference(e.to_string()))?;
        let outputs = self
            .session
            .run(ort::inputs![self.io.input.as_str() => input_tensor])
            .map_err(|e| SegmentationError::Inference(e.to_string()))?;

        let extract = |name: &str| -> Result<ArrayD<f32>> {
            let (shape, data) = outputs[name]
                .try_extract_tensor::<f32>()
                .map_err(|e| SegmentationError::InvalidOutput(format!("{name}: {e}")))?;
            let dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
            ArrayD::from_shape_vec(IxDyn(&dims), data.to_vec())
                .map_err(|e| SegmentationError::InvalidOutput(format!("{name}: {e}")))
        };
        let prob = extract(&self.io.prob)?;
        let dist = extract(&self.io.dist)?;
        debug!("ONNX outputs: prob {:?}, dist {:?}", prob.shape(), dist.shape());
        Ok(RawOutputs { prob, dist })
    }

    fn provider(&self) -> ProviderKind {
        self.provider
    }
}

fn execution_providers(
    policy: ProviderPolicy,
) -> (Vec<ort::execution_providers::ExecutionProviderDispatch>, ProviderKind) {
    let mut providers = Vec::new();
    #[allow(unused_mut)]
    let mut kind = ProviderKind::Cpu;
    if policy == ProviderPolicy::Preferred {
        #[cfg(feature = "cuda")]
        {
            providers.push(ort::execution_providers::CUDAExecutionProvider::default().build());
            kind = ProviderKind::Accelerated;
        }
        #[cfg(feature = "coreml")]
        {
            providers.push(ort::execution_providers::CoreMLExecutionProvider::default().build());
            kind = ProviderKind::Accelerated;
        }
    }
    providers.push(CPUExecutionProvider::default().build());
    (providers, kind)
}

fn session_error(path: &Path, e: impl std::fmt::Display) -> SegmentationError {
    SegmentationError::ModelLoad {
        path: path.display().to_string(),
        error: e.to_string(),
    }
}

/// Opens [`OrtSession`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct OrtSessionFactory;

impl SessionFactory for OrtSessionFactory {
    fn open(&self, path: &Path, policy: ProviderPolicy) -> Result<Box<dyn InferenceSession>> {
        Ok(Box::new(OrtSession::open(path, policy)?))
    }
}

/// How a run with CPU retry ended
#[derive(Debug)]
pub enum RunOutcome<T> {
    Succeeded(T),
    /// The accelerated attempt failed and the CPU-only retry succeeded
    RecoveredViaFallback {
        value: T,
        first_error: SegmentationError,
    },
    Failed(SegmentationError),
}

impl<T> RunOutcome<T> {
    pub fn used_fallback(&self) -> bool {
        matches!(self, RunOutcome::RecoveredViaFallback { .. })
    }

    pub fn into_result(self) -> Result<T> {
        match self {
            RunOutcome::Succeeded(value) | RunOutcome::RecoveredViaFallback { value, .. } => {
                Ok(value)
            }
            RunOutcome::Failed(e) => Err(e),
        }
    }
}

/// Run `work` on `primary`; if an accelerated session fails during
/// execution, open a CPU-only session with `open_cpu` and run `work` once
/// more. A CPU failure is never retried.
///
/// Returns the outcome and, when a retry happened, the CPU session so the
/// caller can keep using it.
pub fn run_with_fallback<T, W, O>(
    primary: &mut dyn InferenceSession,
    open_cpu: O,
    mut work: W,
) -> (RunOutcome<T>, Option<Box<dyn InferenceSession>>)
where
    W: FnMut(&mut dyn InferenceSession) -> Result<T>,
    O: FnOnce() -> Result<Box<dyn InferenceSession>>,
{
    let first_error = match work(primary) {
        Ok(value) => return (RunOutcome::Succeeded(value), None),
        Err(e) => e,
    };
    let retriable = primary.provider() == ProviderKind::Accelerated
        && matches!(
            first_error,
            SegmentationError::Inference(_) | SegmentationError::Ort(_)
        );
    if !retriable {
        return (RunOutcome::Failed(first_error), None);
    }

    warn!("Accelerated inference failed ({}), retrying on CPU", first_error);
    let mut cpu = match open_cpu() {
        Ok(session) => session,
        Err(e) => return (RunOutcome::Failed(e), None),
    };
    match work(cpu.as_mut()) {
        Ok(value) => (
            RunOutcome::RecoveredViaFallback { value, first_error },
            Some(cpu),
        ),
        Err(e) => (RunOutcome::Failed(e), Some(cpu)),
    }
}
