//! Checkpoint loading utilities.
//!
//! This module provides functions for:
//! - Locating `config.json` and SafeTensors weights in a checkpoint directory
//! - Parsing hyperparameters from `config.json`
//! - Loading SafeTensors weights into a flat parameter map

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{Error, Result};

/// Paths to the files of a local checkpoint.
#[derive(Debug, Clone)]
pub struct CheckpointFiles {
    /// Path to config.json.
    pub config: PathBuf,
    /// Paths to weight files (SafeTensors).
    pub weights: Vec<PathBuf>,
}

impl CheckpointFiles {
    /// Locates checkpoint files in `dir`.
    ///
    /// Weights are looked up in this order:
    /// 1. `model.safetensors`
    /// 2. the shards listed in `model.safetensors.index.json`
    /// 3. every `*.safetensors` file in the directory
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let config = dir.join("config.json");
        if !config.is_file() {
            return Err(Error::ModelLoad(format!(
                "no config.json in {}",
                dir.display()
            )));
        }
        let weights = find_weights(dir)?;
        debug!(dir = %dir.display(), n_shards = weights.len(), "found checkpoint files");
        Ok(Self { config, weights })
    }
}

fn find_weights(dir: &Path) -> Result<Vec<PathBuf>> {
    let single = dir.join("model.safetensors");
    if single.is_file() {
        return Ok(vec![single]);
    }

    let index_path = dir.join("model.safetensors.index.json");
    if index_path.is_file() {
        let index_content = std::fs::read_to_string(&index_path)
            .map_err(|e| Error::ModelLoad(format!("Failed to read safetensors index: {e}")))?;

        let index: serde_json::Value = serde_json::from_str(&index_content)
            .map_err(|e| Error::ModelLoad(format!("Failed to parse safetensors index: {e}")))?;

        // Unique shard filenames from weight_map
        let weight_map = index["weight_map"].as_object().ok_or_else(|| {
            Error::ModelLoad("Invalid safetensors index: missing weight_map".into())
        })?;

        let mut shard_files: Vec<&str> = weight_map.values().filter_map(|v| v.as_str()).collect();
        shard_files.sort_unstable();
        shard_files.dedup();

        return shard_files
            .into_iter()
            .map(|filename| {
                let path = dir.join(filename);
                if path.is_file() {
                    Ok(path)
                } else {
                    Err(Error::ModelLoad(format!("missing shard {filename}")))
                }
            })
            .collect();
    }

    let mut paths = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "safetensors"))
        .collect::<Vec<_>>();
    paths.sort();
    if paths.is_empty() {
        return Err(Error::ModelLoad(format!(
            "No SafeTensors weights found in {}. Only the SafeTensors format is supported.",
            dir.display()
        )));
    }
    Ok(paths)
}

/// Parses a hyperparameter file.
pub fn load_config<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let content = std::fs::read_to_string(path.as_ref())
        .map_err(|e| Error::ModelLoad(format!("Failed to read config.json: {e}")))?;

    serde_json::from_str(&content)
        .map_err(|e| Error::ModelLoad(format!("Failed to parse config.json: {e}")))
}

/// Loads SafeTensors files into a single parameter map.
///
/// Floating point tensors are converted to `dtype`; integer buffers keep
/// their type. A parameter that appears in more than one file is an error.
pub fn load_safetensors(
    paths: &[PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<HashMap<String, Tensor>> {
    let mut params = HashMap::new();
    for path in paths {
        let tensors = candle_core::safetensors::load(path, device)?;
        debug!(path = %path.display(), n_tensors = tensors.len(), "loaded safetensors");
        for (name, tensor) in tensors {
            let tensor = if tensor.dtype().is_float() {
                tensor.to_dtype(dtype)?
            } else {
                tensor
            };
            if params.insert(name.clone(), tensor).is_some() {
                return Err(Error::ModelLoad(format!(
                    "parameter {name} appears in more than one weight file"
                )));
            }
        }
    }
    Ok(params)
}
