pub mod inspect;
pub mod segment;
pub mod variants;

use anyhow::{Context as _, Result};
use ndarray::ArrayD;
use ndarray_npy::read_npy;
use std::path::{Path, PathBuf};
use stardist_onnx::StarDistSegmenter;

/// Model selection flags shared by the subcommands
#[derive(clap::Args, Debug)]
pub struct ModelArgs {
    /// Registered model variant
    #[arg(long, default_value = "default_2d")]
    pub variant: String,

    /// Variant directory searched for the ONNX graph
    #[arg(long, default_value = ".")]
    pub model_dir: PathBuf,

    /// Explicit ONNX graph, bypassing the directory search
    #[arg(long)]
    pub model: Option<PathBuf>,
}

impl ModelArgs {
    pub fn segmenter(&self) -> Result<StarDistSegmenter> {
        let segmenter = StarDistSegmenter::new(&self.variant, &self.model_dir)
            .with_context(|| format!("Unknown variant '{}'", self.variant))?;
        Ok(match &self.model {
            Some(path) => segmenter.with_model_path(path),
            None => segmenter,
        })
    }
}

/// Load a `.npy` image as `f32`, accepting common integer microscopy dtypes
pub fn read_image(path: &Path) -> Result<ArrayD<f32>> {
    if let Ok(image) = read_npy::<_, ArrayD<f32>>(path) {
        return Ok(image);
    }
    if let Ok(image) = read_npy::<_, ArrayD<f64>>(path) {
        return Ok(image.mapv(|v| v as f32));
    }
    if let Ok(image) = read_npy::<_, ArrayD<u16>>(path) {
        return Ok(image.mapv(f32::from));
    }
    let image: ArrayD<u8> = read_npy(path)
        .with_context(|| format!("Failed to read {} as f32, f64, u16, or u8 .npy", path.display()))?;
    Ok(image.mapv(f32::from))
}
