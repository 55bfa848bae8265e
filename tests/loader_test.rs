//! Integration tests for checkpoint loading.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use curated_candle::convert::{FromHf, LlamaDecoder};
use curated_candle::model::{load_safetensors, CheckpointFiles};
use curated_candle::Error;

const LLAMA_CONFIG: &str = r#"{
    "architectures": ["LlamaForCausalLM"],
    "vocab_size": 20,
    "hidden_size": 8,
    "intermediate_size": 12,
    "num_hidden_layers": 1,
    "num_attention_heads": 2,
    "num_key_value_heads": 1,
    "rms_norm_eps": 1e-5,
    "hidden_act": "silu",
    "torch_dtype": "float32"
}"#;

fn test_device() -> Device {
    Device::Cpu
}

fn randn(shape: &[usize]) -> Tensor {
    Tensor::randn(0.0f32, 0.2, shape, &test_device()).unwrap()
}

fn llama_params() -> HashMap<String, Tensor> {
    let p = "model.layers.0";
    HashMap::from([
        ("model.embed_tokens.weight".to_string(), randn(&[20, 8])),
        (format!("{p}.self_attn.q_proj.weight"), randn(&[8, 8])),
        (format!("{p}.self_attn.k_proj.weight"), randn(&[4, 8])),
        (format!("{p}.self_attn.v_proj.weight"), randn(&[4, 8])),
        (format!("{p}.self_attn.o_proj.weight"), randn(&[8, 8])),
        (format!("{p}.mlp.gate_proj.weight"), randn(&[12, 8])),
        (format!("{p}.mlp.up_proj.weight"), randn(&[12, 8])),
        (format!("{p}.mlp.down_proj.weight"), randn(&[8, 12])),
        (format!("{p}.input_layernorm.weight"), randn(&[8])),
        (format!("{p}.post_attention_layernorm.weight"), randn(&[8])),
        ("model.norm.weight".to_string(), randn(&[8])),
    ])
}

fn write_config(dir: &Path) {
    std::fs::write(dir.join("config.json"), LLAMA_CONFIG).unwrap();
}

#[test]
fn test_load_single_file_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    write_config(dir.path());
    candle_core::safetensors::save(&llama_params(), dir.path().join("model.safetensors")).unwrap();

    let decoder = LlamaDecoder::from_hf_dir(dir.path(), DType::F32, &test_device()).unwrap();
    let ids = Tensor::new(&[[1u32, 2, 3]], &test_device()).unwrap();
    let out = decoder.forward(&ids, None, None, false).unwrap();
    assert_eq!(out.last_hidden_layer_state().dims(), &[1, 3, 8]);
    assert!(out.cache.is_none());
}

#[test]
fn test_load_sharded_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    write_config(dir.path());

    let mut shards = [HashMap::new(), HashMap::new()];
    let mut weight_map = serde_json::Map::new();
    for (i, (name, tensor)) in llama_params().into_iter().enumerate() {
        let shard = i % 2;
        weight_map.insert(
            name.clone(),
            serde_json::Value::String(format!("model-0000{}-of-00002.safetensors", shard + 1)),
        );
        shards[shard].insert(name, tensor);
    }
    for (i, shard) in shards.iter().enumerate() {
        let path = dir.path().join(format!("model-0000{}-of-00002.safetensors", i + 1));
        candle_core::safetensors::save(shard, path).unwrap();
    }
    let index = serde_json::json!({ "metadata": {}, "weight_map": weight_map });
    std::fs::write(
        dir.path().join("model.safetensors.index.json"),
        index.to_string(),
    )
    .unwrap();

    let files = CheckpointFiles::from_dir(dir.path()).unwrap();
    assert_eq!(files.weights.len(), 2);

    let decoder = LlamaDecoder::from_hf_dir(dir.path(), DType::F32, &test_device()).unwrap();
    assert_eq!(decoder.n_layers(), 1);
}

#[test]
fn test_dtype_conversion_keeps_integer_buffers() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("weights.safetensors");
    let tensors = HashMap::from([
        ("weight".to_string(), randn(&[2, 3])),
        (
            "position_ids".to_string(),
            Tensor::arange(0u32, 4, &test_device()).unwrap(),
        ),
    ]);
    candle_core::safetensors::save(&tensors, &path).unwrap();

    let params = load_safetensors(&[path], DType::F64, &test_device()).unwrap();
    assert_eq!(params["weight"].dtype(), DType::F64);
    assert_eq!(params["position_ids"].dtype(), DType::U32);
}

#[test]
fn test_duplicate_parameter_across_files() {
    let dir = tempfile::tempdir().unwrap();
    let tensors = HashMap::from([("weight".to_string(), randn(&[2]))]);
    let a = dir.path().join("a.safetensors");
    let b = dir.path().join("b.safetensors");
    candle_core::safetensors::save(&tensors, &a).unwrap();
    candle_core::safetensors::save(&tensors, &b).unwrap();

    assert!(matches!(
        load_safetensors(&[a, b], DType::F32, &test_device()),
        Err(Error::ModelLoad(_))
    ));
}

#[test]
fn test_unparseable_config() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("config.json"), "{ not json").unwrap();
    candle_core::safetensors::save(&llama_params(), dir.path().join("model.safetensors")).unwrap();

    assert!(matches!(
        LlamaDecoder::from_hf_dir(dir.path(), DType::F32, &test_device()),
        Err(Error::ModelLoad(_))
    ));
}
