#![allow(dead_code)]

use std::sync::Arc;

use anyhow::Result;
use attention::kv_cache::LayerPresent;
use candle_core::{DType, Device, Tensor};
use chatglm::{ChatGlmConfig, ChatGlmForCausalLM, SyntheticWeights};
use layers::SingleProcess;

/// Two layers, hidden 8, two query and two key/value heads.
pub fn tiny_config(version: &str) -> ChatGlmConfig {
    let legacy = matches!(version, "glm" | "chatglm");
    ChatGlmConfig {
        chatglm_version: Some(version.to_string()),
        hidden_size: 8,
        num_hidden_layers: 2,
        num_attention_heads: 2,
        num_key_value_heads: Some(2),
        vocab_size: 11,
        max_position_embeddings: 16,
        rmsnorm: Some(!legacy),
        add_bias_linear: Some(legacy),
        ..ChatGlmConfig::default()
    }
}

pub fn weights(seed: u64) -> SyntheticWeights {
    SyntheticWeights::new(seed, DType::F32, Device::Cpu).with_scale(0.5)
}

pub fn build(config: &ChatGlmConfig, seed: u64) -> Result<ChatGlmForCausalLM> {
    Ok(ChatGlmForCausalLM::new(
        config,
        &weights(seed),
        Arc::new(SingleProcess),
    )?)
}

pub fn max_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    Ok(a.sub(b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?)
}

pub fn u32s(values: &[u32]) -> Result<Tensor> {
    Ok(Tensor::new(values, &Device::Cpu)?)
}

pub fn contiguous_presents(presents: &[LayerPresent]) -> Vec<Option<Tensor>> {
    presents
        .iter()
        .map(|p| p.as_contiguous().cloned())
        .collect()
}
