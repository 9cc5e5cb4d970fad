//! Locating a variant's exported graph on disk

use std::path::{Path, PathBuf};
use tracing::debug;

use crate::config::VariantConfig;
use crate::error::{Result, SegmentationError};

/// Resolve the graph file for `variant` inside `model_dir`.
///
/// Known candidate names are tried in priority order. Otherwise a lone
/// `*.onnx` file in `model_dir/onnx_models` or `model_dir` is used; more
/// than one is ambiguous.
pub fn resolve_model_path(model_dir: &Path, variant: &VariantConfig) -> Result<PathBuf> {
    for candidate in variant.model_candidates {
        let path = model_dir.join(candidate);
        if path.is_file() {
            debug!("Using {} model {:?}", variant.key, path);
            return Ok(path);
        }
    }

    let mut found = Vec::new();
    for dir in [model_dir.join("onnx_models"), model_dir.to_path_buf()] {
        found.extend(onnx_files(&dir)?);
    }
    found.sort();
    found.dedup();
    match found.len() {
        0 => Err(SegmentationError::ModelNotFound {
            variant: variant.key.to_string(),
            root: model_dir.to_path_buf(),
        }),
        1 => {
            let path = found.remove(0);
            debug!("Using only ONNX file {:?} for {}", path, variant.key);
            Ok(path)
        }
        _ => Err(SegmentationError::AmbiguousModel(found)),
    }
}

fn onnx_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_onnx = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("onnx"));
        if is_onnx && path.is_file() {
            files.push(path);
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::lookup;
    use std::fs;

    #[test]
    fn test_candidate_priority() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("onnx_models")).unwrap();
        fs::write(dir.path().join("stardist2d.onnx"), b"x").unwrap();
        fs::write(dir.path().join("onnx_models/default_2d.onnx"), b"x").unwrap();
        let path = resolve_model_path(dir.path(), lookup("default_2d").unwrap()).unwrap();
        assert_eq!(path, dir.path().join("onnx_models/default_2d.onnx"));
    }

    #[test]
    fn test_single_unknown_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("custom.onnx"), b"x").unwrap();
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        let path = resolve_model_path(dir.path(), lookup("default_3d").unwrap()).unwrap();
        assert_eq!(path, dir.path().join("custom.onnx"));
    }

    #[test]
    fn test_ambiguous_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let variant = lookup("default_2d").unwrap();
        assert!(matches!(
            resolve_model_path(dir.path(), variant),
            Err(SegmentationError::ModelNotFound { .. })
        ));
        fs::write(dir.path().join("a.onnx"), b"x").unwrap();
        fs::write(dir.path().join("b.onnx"), b"x").unwrap();
        assert!(matches!(
            resolve_model_path(dir.path(), variant),
            Err(SegmentationError::AmbiguousModel(paths)) if paths.len() == 2
        ));
    }
}
