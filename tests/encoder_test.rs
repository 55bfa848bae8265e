//! Integration tests for TransformerEncoder with shared layer groups.

use std::collections::HashMap;

use candle_core::{DType, Device, Tensor};
use curated_candle::convert::{AlbertEncoder, FromHf, HfAlbertConfig};
use curated_candle::Error;

fn test_device() -> Device {
    Device::Cpu
}

fn randn(shape: &[usize]) -> Tensor {
    Tensor::randn(0.0f32, 0.2, shape, &test_device()).unwrap()
}

fn albert_config(num_hidden_layers: usize, num_hidden_groups: usize) -> HfAlbertConfig {
    albert_config_with_embedding_size(num_hidden_layers, num_hidden_groups, 8)
}

fn albert_config_with_embedding_size(
    num_hidden_layers: usize,
    num_hidden_groups: usize,
    embedding_size: usize,
) -> HfAlbertConfig {
    serde_json::from_str(&format!(
        r#"{{
            "vocab_size": 30,
            "embedding_size": {embedding_size},
            "hidden_size": 16,
            "num_hidden_layers": {num_hidden_layers},
            "num_hidden_groups": {num_hidden_groups},
            "num_attention_heads": 2,
            "intermediate_size": 32,
            "max_position_embeddings": 16
        }}"#
    ))
    .unwrap()
}

fn albert_params(num_hidden_groups: usize) -> HashMap<String, Tensor> {
    albert_params_with_embedding_size(num_hidden_groups, 8)
}

fn albert_params_with_embedding_size(
    num_hidden_groups: usize,
    embedding_size: usize,
) -> HashMap<String, Tensor> {
    let mut params = HashMap::new();
    let mut linear = |name: String, in_width: usize, out_width: usize| {
        params.insert(format!("{name}.weight"), randn(&[out_width, in_width]));
        params.insert(format!("{name}.bias"), randn(&[out_width]));
    };
    linear(
        "albert.encoder.embedding_hidden_mapping_in".to_string(),
        embedding_size,
        16,
    );
    for g in 0..num_hidden_groups {
        let p = format!("albert.encoder.albert_layer_groups.{g}.albert_layers.0");
        for name in ["query", "key", "value", "dense"] {
            linear(format!("{p}.attention.{name}"), 16, 16);
        }
        linear(format!("{p}.ffn"), 16, 32);
        linear(format!("{p}.ffn_output"), 32, 16);
    }

    let mut layer_norm = |name: String, width: usize| {
        params.insert(format!("{name}.weight"), Tensor::ones(width, DType::F32, &test_device()).unwrap());
        params.insert(format!("{name}.bias"), randn(&[width]));
    };
    layer_norm("albert.embeddings.LayerNorm".to_string(), embedding_size);
    for g in 0..num_hidden_groups {
        let p = format!("albert.encoder.albert_layer_groups.{g}.albert_layers.0");
        layer_norm(format!("{p}.attention.LayerNorm"), 16);
        layer_norm(format!("{p}.full_layer_layer_norm"), 16);
    }

    params.insert(
        "albert.embeddings.word_embeddings.weight".to_string(),
        randn(&[30, embedding_size]),
    );
    params.insert(
        "albert.embeddings.position_embeddings.weight".to_string(),
        randn(&[16, embedding_size]),
    );
    params.insert(
        "albert.embeddings.token_type_embeddings.weight".to_string(),
        randn(&[2, embedding_size]),
    );
    params.insert("predictions.bias".to_string(), randn(&[30]));
    params
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .flatten_all()
        .unwrap()
        .max(0)
        .unwrap()
        .to_scalar()
        .unwrap()
}

#[test]
fn test_four_layers_two_groups() {
    let device = test_device();
    let encoder =
        AlbertEncoder::from_hf_parts(&albert_config(4, 2), albert_params(2), DType::F32, &device)
            .unwrap();
    assert_eq!(encoder.n_layers(), 4);
    assert_eq!(encoder.groups().len(), 2);

    let groups: Vec<_> = (0..4).map(|i| encoder.group_for_layer(i).unwrap()).collect();
    assert!(std::ptr::eq(groups[0], groups[1]));
    assert!(std::ptr::eq(groups[2], groups[3]));
    assert!(!std::ptr::eq(groups[1], groups[2]));

    // Shared parameters are the same tensors, not copies.
    let output_weight = |layer: usize| {
        groups[layer].layers()[0]
            .self_attn()
            .output_projection()
            .weight()
            .id()
    };
    assert_eq!(output_weight(0), output_weight(1));
    assert_ne!(output_weight(1), output_weight(2));

    let ids = Tensor::new(&[[2u32, 5, 9, 11], [3, 4, 0, 0]], &device).unwrap();
    let out = encoder.forward(&ids, None, None).unwrap();
    assert_eq!(out.layer_hidden_states.len(), 4);
    assert_eq!(out.embedding_output.dims(), &[2, 4, 16]);

    // Applying the same group again still transforms the hidden states.
    assert!(max_abs_diff(&out.layer_hidden_states[0], &out.layer_hidden_states[1]) > 1e-3);
}

#[test]
fn test_group_output_matches_manual_application() {
    let device = test_device();
    let encoder =
        AlbertEncoder::from_hf_parts(&albert_config(4, 2), albert_params(2), DType::F32, &device)
            .unwrap();
    let ids = Tensor::new(&[[2u32, 5, 9]], &device).unwrap();
    let out = encoder.forward(&ids, None, None).unwrap();

    let mask = curated_candle::AttentionMask::all_valid(1, 3, &device).unwrap();
    let layer1 = encoder.groups()[0]
        .forward_t(&out.layer_hidden_states[0], &mask, false)
        .unwrap();
    assert!(max_abs_diff(&layer1, &out.layer_hidden_states[1]) < 1e-5);
}

#[test]
fn test_indivisible_groups_fail() {
    let result = AlbertEncoder::convert_hf_config(&albert_config(5, 2));
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn test_missing_group_parameters() {
    let device = test_device();
    let result =
        AlbertEncoder::from_hf_parts(&albert_config(4, 2), albert_params(1), DType::F32, &device);
    match result {
        Err(Error::Conversion { key, .. }) => {
            assert!(key.starts_with("encoder.albert_layer_groups.1."))
        }
        other => panic!("expected a conversion error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_embedding_size_equal_to_hidden_size() {
    let device = test_device();
    let hf = albert_config_with_embedding_size(2, 1, 16);
    let config = AlbertEncoder::convert_hf_config(&hf).unwrap();
    assert!(config.embedding.projection);

    // The hidden mapping is still present in the checkpoint and must be consumed.
    let encoder = AlbertEncoder::from_hf_parts(
        &hf,
        albert_params_with_embedding_size(1, 16),
        DType::F32,
        &device,
    )
    .unwrap();
    let ids = Tensor::new(&[[2u32, 5, 9]], &device).unwrap();
    let out = encoder.forward(&ids, None, None).unwrap();
    assert_eq!(out.last_hidden_layer_state().dims(), &[1, 3, 16]);
}
