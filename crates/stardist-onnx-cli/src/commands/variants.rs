//! Variant listing command

use anyhow::Result;
use stardist_onnx::VARIANTS;

pub fn list_variants() -> Result<()> {
    println!("Registered variants:");
    for variant in VARIANTS {
        println!("\n{}", variant.key);
        println!("  Image: {}D {}", variant.ndim, variant.shape_label);
        println!(
            "  Layouts: input {}, prob {}, dist {}",
            variant.input_layout, variant.prob_layout, variant.dist_layout
        );
        println!("  Reference diameter: {} px", variant.reference_diameter_px);
        println!("  Default model: {}", variant.default_filename);
        println!("  Requires compiled geometry: {}", variant.require_compiled_geometry);
    }
    Ok(())
}
