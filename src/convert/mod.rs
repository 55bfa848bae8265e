//! Conversion of hub checkpoints.
//!
//! A hub checkpoint consists of a `config.json` with architecture-specific
//! hyperparameter names and a flat parameter map keyed by the upstream
//! module names. Each architecture implements [`FromHf`], which converts
//! both into a [`TransformerConfig`] and a parameter map keyed by this
//! crate's module names:
//!
//! ```text
//! embeddings.{piece_embeddings, type_embeddings, position_embeddings, layer_norm, projection}
//! layers.{i}.mha.{query, key, value, input, output}
//! layers.{i}.ffn.{intermediate, gate, output}
//! layers.{i}.{attn_input_layer_norm, ffn_input_layer_norm}          (decoders)
//! layers.{i}.{attn_residual_layer_norm, ffn_residual_layer_norm}    (encoders)
//! groups.{g}.group_layers.{j}.*                                     (grouped encoders)
//! output_layer_norm
//! ```
//!
//! Conversion is exact: every expected parameter must be present with the
//! expected shape, and every checkpoint parameter must be consumed, except
//! for known buffers and task heads.

pub mod albert;
pub mod llama;
pub mod refined_web_model;
pub mod roberta;

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::config::TransformerConfig;
use crate::error::{Error, Result};
use crate::model::{load_config, load_safetensors, CheckpointFiles};

pub use albert::{AlbertEncoder, HfAlbertConfig};
pub use llama::{HfLlamaConfig, LlamaDecoder};
pub use refined_web_model::{HfRefinedWebModelConfig, RefinedWebModelDecoder};
pub use roberta::{HfRobertaConfig, RobertaEncoder};

/// Prefixes added by task-specific model classes.
const MODEL_PREFIXES: &[&str] = &["model.", "transformer.", "roberta.", "albert."];

/// Top-level modules that belong to task heads rather than the base model.
const TASK_HEADS: &[&str] = &["lm_head", "pooler", "predictions", "cls", "sop_classifier"];

/// Non-trainable buffers stored in some checkpoints.
const BUFFER_SUFFIXES: &[&str] = &["rotary_emb.inv_freq", "position_ids"];

/// Construction of a model from a hub checkpoint.
pub trait FromHf: Sized {
    /// Hyperparameters as stored in `config.json`.
    type HfConfig: DeserializeOwned;

    /// Converts hub hyperparameters into a validated config.
    fn convert_hf_config(hf_config: &Self::HfConfig) -> Result<TransformerConfig>;

    /// Renames hub parameters to this crate's module names.
    fn convert_hf_state_dict(
        params: HashMap<String, Tensor>,
        config: &TransformerConfig,
    ) -> Result<HashMap<String, Tensor>>;

    /// Builds the model from a config and converted parameters.
    fn from_config(config: &TransformerConfig, vb: VarBuilder) -> Result<Self>;

    /// Builds the model from hub hyperparameters and an unconverted
    /// parameter map.
    fn from_hf_parts(
        hf_config: &Self::HfConfig,
        params: HashMap<String, Tensor>,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let config = Self::convert_hf_config(hf_config)?;
        let params = Self::convert_hf_state_dict(params, &config)?;
        let vb = VarBuilder::from_tensors(params, dtype, device);
        Self::from_config(&config, vb)
    }

    /// Loads the model from a local checkpoint directory.
    fn from_hf_dir(dir: impl AsRef<Path>, dtype: DType, device: &Device) -> Result<Self> {
        let files = CheckpointFiles::from_dir(dir)?;
        let hf_config: Self::HfConfig = load_config(&files.config)?;
        let params = load_safetensors(&files.weights, dtype, device)?;
        Self::from_hf_parts(&hf_config, params, dtype, device)
    }
}

/// Moves parameters from a hub map to a converted map, checking shapes.
pub(crate) struct ParamConverter {
    source: HashMap<String, Tensor>,
    converted: HashMap<String, Tensor>,
}

impl ParamConverter {
    /// Strips model prefixes and drops buffers and task heads.
    pub(crate) fn new(params: HashMap<String, Tensor>) -> Self {
        let source = params
            .into_iter()
            .map(|(key, tensor)| (strip_prefix(&key).to_string(), tensor))
            .filter(|(key, _)| !is_ignored(key))
            .collect();
        Self {
            source,
            converted: HashMap::new(),
        }
    }

    /// Removes `key` from the hub map, checking its shape.
    pub(crate) fn take(&mut self, key: &str, shape: &[usize]) -> Result<Tensor> {
        let tensor = self
            .source
            .remove(key)
            .ok_or_else(|| Error::conversion(key, "missing from checkpoint"))?;
        if tensor.dims() != shape {
            return Err(Error::conversion(
                key,
                format!("expected shape {shape:?}, got {:?}", tensor.dims()),
            ));
        }
        Ok(tensor)
    }

    pub(crate) fn insert(&mut self, key: impl Into<String>, tensor: Tensor) {
        self.converted.insert(key.into(), tensor);
    }

    /// Moves a single parameter.
    pub(crate) fn rename(&mut self, from: &str, to: &str, shape: &[usize]) -> Result<()> {
        let tensor = self.take(from, shape)?;
        self.insert(to, tensor);
        Ok(())
    }

    /// Moves the `weight` [out, in] and optional `bias` [out] of a linear layer.
    pub(crate) fn rename_linear(
        &mut self,
        from: &str,
        to: &str,
        in_width: usize,
        out_width: usize,
        bias: bool,
    ) -> Result<()> {
        self.rename(
            &format!("{from}.weight"),
            &format!("{to}.weight"),
            &[out_width, in_width],
        )?;
        if bias {
            self.rename(&format!("{from}.bias"), &format!("{to}.bias"), &[out_width])?;
        }
        Ok(())
    }

    /// Moves the `weight` and `bias` of a layer norm.
    pub(crate) fn rename_layer_norm(&mut self, from: &str, to: &str, width: usize) -> Result<()> {
        self.rename(&format!("{from}.weight"), &format!("{to}.weight"), &[width])?;
        self.rename(&format!("{from}.bias"), &format!("{to}.bias"), &[width])
    }

    /// Returns the converted map, failing on unconsumed hub parameters.
    pub(crate) fn finish(self) -> Result<HashMap<String, Tensor>> {
        let mut leftover: Vec<&String> = self.source.keys().collect();
        leftover.sort();
        if let Some(key) = leftover.first() {
            return Err(Error::conversion(
                key.as_str(),
                format!(
                    "unexpected parameter ({} unconverted in total)",
                    leftover.len()
                ),
            ));
        }
        debug!(n_params = self.converted.len(), "converted checkpoint parameters");
        Ok(self.converted)
    }
}

fn strip_prefix(key: &str) -> &str {
    MODEL_PREFIXES
        .iter()
        .find_map(|prefix| key.strip_prefix(prefix))
        .unwrap_or(key)
}

fn is_ignored(key: &str) -> bool {
    let head = key.split('.').next().unwrap_or(key);
    TASK_HEADS.contains(&head) || BUFFER_SUFFIXES.iter().any(|suffix| key.ends_with(suffix))
}
