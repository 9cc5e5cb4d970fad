//! Print the size constraints of an inference graph

use anyhow::{Context as _, Result};
use clap::Args;
use serde::Serialize;

use stardist_onnx::{plan_tiles, GraphConstraints, TilingPlan};

use super::ModelArgs;

#[derive(Args)]
pub struct InspectCommand {
    #[command(flatten)]
    model: ModelArgs,

    /// Largest size probed per axis when searching valid input sizes
    #[arg(long, default_value = "64")]
    max_probe: usize,

    /// Also show the tile plan for an image of this shape (e.g. 512,512)
    #[arg(long, value_delimiter = ',')]
    shape: Option<Vec<usize>>,
}

#[derive(Serialize)]
struct Report {
    model: String,
    variant: String,
    constraints: GraphConstraints,
    #[serde(skip_serializing_if = "Option::is_none")]
    tile_plan: Option<TilingPlan>,
}

impl InspectCommand {
    pub fn execute(self) -> Result<()> {
        let mut segmenter = self.model.segmenter()?.with_max_probe(self.max_probe);
        let model = segmenter.model_path().context("Failed to locate ONNX model")?;
        let constraints = segmenter
            .constraints()
            .with_context(|| format!("Failed to inspect {}", model.display()))?;

        let variant = segmenter.variant();
        let tile_plan = match &self.shape {
            Some(shape) if shape.len() != variant.ndim => anyhow::bail!(
                "--shape has {} axes but variant '{}' is {}D",
                shape.len(),
                variant.key,
                variant.ndim
            ),
            Some(shape) => Some(plan_tiles(shape, &constraints, &variant.tiling_policy(1))),
            None => None,
        };

        let report = Report {
            model: model.display().to_string(),
            variant: variant.key.to_string(),
            constraints,
            tile_plan,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        Ok(())
    }
}
