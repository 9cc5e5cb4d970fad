//! Segment one image

use anyhow::{Context as _, Result};
use clap::Args;
use ndarray_npy::write_npy;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Instant;
use tracing::info;

use stardist_onnx::{InferencePath, InstanceInfo, RunRequest, RunSettings, TilingPlan};

use super::{read_image, ModelArgs};

#[derive(Args)]
pub struct SegmentCommand {
    /// Single-channel (Y, X) or (Z, Y, X) .npy image
    #[arg(value_name = "FILE")]
    input: PathBuf,

    #[command(flatten)]
    model: ModelArgs,

    /// JSON file with run settings; flags below override it
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Minimum object probability
    #[arg(long)]
    prob_thresh: Option<f32>,

    /// Overlap ratio above which a weaker detection is suppressed
    #[arg(long)]
    nms_thresh: Option<f32>,

    /// Requested tiles per axis
    #[arg(long)]
    n_tiles: Option<usize>,

    /// Typical object diameter in pixels
    #[arg(long)]
    diameter: Option<f32>,

    /// Skip percentile normalization
    #[arg(long, default_value = "false")]
    no_normalize: bool,

    /// Output directory
    #[arg(long, default_value = "./stardist_output")]
    output_dir: PathBuf,
}

#[derive(Serialize)]
struct Summary<'a> {
    input: &'a PathBuf,
    model: PathBuf,
    variant: &'a str,
    instances: usize,
    grid: &'a [usize],
    plan: &'a TilingPlan,
    inference: &'a InferencePath,
    settings: &'a RunSettings,
    info: &'a InstanceInfo,
}

impl SegmentCommand {
    pub fn execute(self) -> Result<()> {
        let start = Instant::now();
        if !self.input.exists() {
            anyhow::bail!("Input file does not exist: {}", self.input.display());
        }
        let settings = self.settings()?;
        let image = read_image(&self.input)?;
        info!("Loaded {} with shape {:?}", self.input.display(), image.shape());

        let mut segmenter = self.model.segmenter()?;
        let model_path = segmenter.model_path().context("Failed to locate ONNX model")?;
        let result = segmenter
            .run(&RunRequest::nuclear(image, settings.clone()))
            .context("Segmentation failed")?;

        std::fs::create_dir_all(&self.output_dir).context("Failed to create output directory")?;
        write_npy(self.output_dir.join("masks.npy"), &result.masks).context("Failed to write masks")?;
        write_npy(self.output_dir.join("prob.npy"), &result.prob)
            .context("Failed to write probability map")?;
        write_npy(self.output_dir.join("dist.npy"), &result.dist)
            .context("Failed to write distance map")?;
        let points = result.info.points_array().context("Failed to collect instance points")?;
        write_npy(self.output_dir.join("points.npy"), &points).context("Failed to write points")?;

        let summary = Summary {
            input: &self.input,
            model: model_path,
            variant: &self.model.variant,
            instances: result.info.prob.len(),
            grid: result.grid.axes(),
            plan: &result.plan,
            inference: &result.inference,
            settings: &settings,
            info: &result.info,
        };
        let json = serde_json::to_string_pretty(&summary)?;
        std::fs::write(self.output_dir.join("info.json"), json).context("Failed to write info.json")?;

        println!(
            "{} instances -> {} ({:.2}s)",
            summary.instances,
            self.output_dir.display(),
            start.elapsed().as_secs_f64()
        );
        Ok(())
    }

    fn settings(&self) -> Result<RunSettings> {
        let mut settings = match &self.settings {
            Some(path) => {
                let json = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                RunSettings::from_json(&json).context("Invalid settings file")?
            }
            None => RunSettings::default(),
        };
        if let Some(v) = self.prob_thresh {
            settings.prob_thresh = v;
        }
        if let Some(v) = self.nms_thresh {
            settings.nms_thresh = v;
        }
        if let Some(v) = self.n_tiles {
            settings.n_tiles = v;
        }
        if let Some(v) = self.diameter {
            settings.object_diameter_px = v;
        }
        if self.no_normalize {
            settings.normalize = false;
        }
        settings.validate().context("Invalid settings")?;
        Ok(settings)
    }
}
