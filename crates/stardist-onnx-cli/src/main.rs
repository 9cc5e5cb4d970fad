//! StarDist ONNX CLI - segment microscopy images from the command line
//!
//! Reads single-channel `.npy` images, runs a registered model variant, and
//! writes label images plus per-instance metadata.

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod commands;

use commands::inspect::InspectCommand;
use commands::segment::SegmentCommand;

#[derive(Parser)]
#[command(
    name = "stardist-onnx",
    version,
    about = "StarDist instance segmentation with ONNX Runtime",
    after_help = "EXAMPLES:\n  \
                  # List registered variants\n  \
                  stardist-onnx variants\n\n  \
                  # Segment a 2D image with the default model directory layout\n  \
                  stardist-onnx segment --model-dir models/default_2d nuclei.npy\n\n  \
                  # Segment a 3D stack in 2 tiles per axis\n  \
                  stardist-onnx segment --variant default_3d --n-tiles 2 --model-dir models/default_3d stack.npy\n\n  \
                  # Show the size constraints of a graph\n  \
                  stardist-onnx inspect --model custom.onnx"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Segment an image and write labels, maps, and instance metadata
    Segment(SegmentCommand),

    /// Print divisibility, overlap, and valid sizes of a graph
    Inspect(InspectCommand),

    /// List registered model variants
    Variants,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Variants => "warn",
        _ if cli.verbose => "debug",
        _ => "info",
    };
    // RUST_LOG wins over the verbosity flag
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    match cli.command {
        Commands::Segment(cmd) => cmd.execute(),
        Commands::Inspect(cmd) => cmd.execute(),
        Commands::Variants => commands::variants::list_variants(),
    }
}
