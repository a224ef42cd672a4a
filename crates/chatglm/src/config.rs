//! Model configuration: raw checkpoint fields, defaults and version strategy.

use std::{fs, path::Path};

use attention::{AttentionMaskType, HeadLayout};
use attention::kv_cache::CacheMode;
use candle_core::DType;
use embedding::{EmbeddingSharding, RopeScaling};
use layers::{dtypes::parse_dtype, ActivationKind, Mapping, NormKind, ResidualConfig};
use serde::Deserialize;

use crate::error::{config_err, config_from, ChatGlmError, Result};
use crate::position::InputLayout;

/// Model family member. Each version fixes the mask, the residual wiring and
/// the position encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GlmVersion {
    /// GLM-130B style: causal mask, learned position and block embeddings.
    Glm,
    /// ChatGLM-6B: prefix-bidirectional mask, scaled residuals, 2D rotary.
    ChatGlm,
    ChatGlm2,
    #[default]
    ChatGlm3,
}

impl GlmVersion {
    pub fn parse(tag: &str) -> Result<Self> {
        match tag {
            "glm" => Ok(Self::Glm),
            "chatglm" => Ok(Self::ChatGlm),
            "chatglm2" => Ok(Self::ChatGlm2),
            "chatglm3" => Ok(Self::ChatGlm3),
            other => Err(config_err(format!(
                "unrecognized chatglm_version '{other}' (expected glm, chatglm, chatglm2 or chatglm3)"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Glm => "glm",
            Self::ChatGlm => "chatglm",
            Self::ChatGlm2 => "chatglm2",
            Self::ChatGlm3 => "chatglm3",
        }
    }

    /// The two legacy versions feed `(position, block)` index pairs.
    pub fn position_encoding_2d(&self) -> bool {
        matches!(self, Self::Glm | Self::ChatGlm)
    }

    fn default_activation(&self) -> &'static str {
        match self {
            Self::Glm | Self::ChatGlm => "gelu",
            Self::ChatGlm2 | Self::ChatGlm3 => "swiglu",
        }
    }
}

/// How positions enter the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionScheme {
    /// Learned position and block tables summed into the token embedding.
    LearnedBlock,
    /// Head halves rotated by position and block index.
    Rotary2d,
    /// Leading `rotary_pct` of each head rotated by position.
    Rotary1d,
}

/// Residual wiring of a decoder layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResidualStrategy {
    /// `out = norm_out * alpha + branch` at both combines.
    Scaled { alpha: f32 },
    /// Plain addition; the residual is the normalized value when
    /// `post_layernorm` is set and the layer input otherwise.
    Standard { post_layernorm: bool },
}

impl ResidualStrategy {
    pub fn residual_config(&self) -> ResidualConfig {
        match *self {
            Self::Scaled { alpha } => ResidualConfig::scaled(alpha),
            Self::Standard { post_layernorm } => ResidualConfig::standard(post_layernorm),
        }
    }
}

/// Version-dependent behaviour, chosen once when the model is built.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VersionStrategy {
    pub mask_type: AttentionMaskType,
    pub residual: ResidualStrategy,
    pub positions: PositionScheme,
}

impl VersionStrategy {
    pub fn select(version: GlmVersion, num_layers: usize, post_layernorm: bool) -> Self {
        let standard = ResidualStrategy::Standard { post_layernorm };
        match version {
            GlmVersion::Glm => Self {
                mask_type: AttentionMaskType::Causal,
                residual: standard,
                positions: PositionScheme::LearnedBlock,
            },
            GlmVersion::ChatGlm => Self {
                mask_type: AttentionMaskType::Bidirectional,
                residual: ResidualStrategy::Scaled {
                    alpha: ((2 * num_layers) as f32).sqrt(),
                },
                positions: PositionScheme::Rotary2d,
            },
            GlmVersion::ChatGlm2 | GlmVersion::ChatGlm3 => Self {
                mask_type: AttentionMaskType::Causal,
                residual: standard,
                positions: PositionScheme::Rotary1d,
            },
        }
    }

    pub fn position_encoding_2d(&self) -> bool {
        matches!(
            self.positions,
            PositionScheme::LearnedBlock | PositionScheme::Rotary2d
        )
    }
}

/// `rope_scaling` entry of a checkpoint config.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RopeScalingConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub factor: f32,
}

impl RopeScalingConfig {
    fn resolve(&self) -> Result<RopeScaling> {
        match self.kind.as_str() {
            "linear" => Ok(RopeScaling::Linear {
                factor: self.factor,
            }),
            "dynamic" | "ntk" => Ok(RopeScaling::NtkAware {
                alpha: self.factor,
            }),
            other => Err(config_err(format!("unsupported rope_scaling type '{other}'"))),
        }
    }
}

/// Checkpoint configuration as stored on disk. Optional fields are filled by
/// [`ChatGlmConfig::normalize`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatGlmConfig {
    pub chatglm_version: Option<String>,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    pub vocab_size: usize,
    #[serde(default)]
    pub output_vocab_size: Option<usize>,
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub intermediate_size: Option<usize>,
    #[serde(default)]
    pub hidden_act: Option<String>,
    #[serde(default)]
    pub norm_epsilon: Option<f64>,
    #[serde(default)]
    pub rmsnorm: Option<bool>,
    #[serde(default)]
    pub add_bias_linear: Option<bool>,
    #[serde(default)]
    pub add_qkv_bias: Option<bool>,
    #[serde(default)]
    pub apply_residual_connection_post_layernorm: Option<bool>,
    /// Accepted for checkpoint compatibility. Scores are always reduced in
    /// `f32`, where the per-layer query/key rescaling cancels out.
    #[serde(default)]
    pub apply_query_key_layer_scaling: Option<bool>,
    #[serde(default)]
    pub rope_ratio: Option<f32>,
    #[serde(default)]
    pub rotary_pct: Option<f32>,
    #[serde(default)]
    pub rope_scaling: Option<RopeScalingConfig>,
    #[serde(default)]
    pub use_parallel_embedding: Option<bool>,
    #[serde(default)]
    pub embedding_sharding_dim: Option<usize>,
    #[serde(default)]
    pub share_embedding_table: Option<bool>,
    #[serde(default)]
    pub dtype: Option<String>,
    #[serde(default)]
    pub tp_size: Option<usize>,
    #[serde(default)]
    pub tp_rank: Option<usize>,
}

/// Fully-resolved model parameters.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub version: GlmVersion,
    pub strategy: VersionStrategy,
    pub hidden_size: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub vocab_size: usize,
    pub output_vocab_size: usize,
    pub padded_vocab_size: usize,
    pub max_position_embeddings: usize,
    pub intermediate_size: usize,
    pub activation: ActivationKind,
    pub norm_kind: NormKind,
    pub norm_epsilon: f64,
    pub add_bias_linear: bool,
    pub add_qkv_bias: bool,
    pub rope_base: f32,
    pub rotary_pct: f32,
    pub rope_scaling: RopeScaling,
    pub embedding_sharding: EmbeddingSharding,
    pub share_embedding_table: bool,
    pub dtype: DType,
    pub mapping: Mapping,
}

impl ResolvedConfig {
    /// Head geometry held by this rank.
    pub fn local_heads(&self) -> Result<HeadLayout> {
        let heads = self
            .mapping
            .shard("num_attention_heads", self.num_heads)
            .map_err(config_from)?;
        let kv_heads = self
            .mapping
            .kv_heads_per_rank(self.num_kv_heads)
            .map_err(config_from)?;
        Ok(HeadLayout::new(heads, kv_heads, self.head_dim)?)
    }

    pub fn position_encoding_2d(&self) -> bool {
        self.strategy.position_encoding_2d()
    }
}

impl ChatGlmConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(config_err(format!(
                    "unsupported configuration extension '{other}'"
                )));
            }
        };
        log::info!("loaded chatglm config from {}", path.display());
        Ok(config)
    }

    /// Applies defaults and validates the result.
    pub fn normalize(&self) -> Result<ResolvedConfig> {
        let version = match &self.chatglm_version {
            Some(tag) => GlmVersion::parse(tag)?,
            None => GlmVersion::default(),
        };
        let mut errors = Vec::new();

        if self.hidden_size == 0 {
            errors.push("hidden_size must be greater than 0".to_string());
        }
        if self.num_hidden_layers == 0 {
            errors.push("num_hidden_layers must be greater than 0".to_string());
        }
        if self.vocab_size == 0 {
            errors.push("vocab_size must be greater than 0".to_string());
        }
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            errors.push(format!(
                "hidden_size {} must be divisible by num_attention_heads {}",
                self.hidden_size, self.num_attention_heads
            ));
        }
        let num_kv_heads = self.num_key_value_heads.unwrap_or(self.num_attention_heads);
        if num_kv_heads == 0 || self.num_attention_heads % num_kv_heads.max(1) != 0 {
            errors.push(format!(
                "num_attention_heads {} must be divisible by num_key_value_heads {num_kv_heads}",
                self.num_attention_heads
            ));
        }
        if !errors.is_empty() {
            return Err(config_err(errors.join("; ")));
        }

        let head_dim = self.hidden_size / self.num_attention_heads;
        let post_layernorm = self.apply_residual_connection_post_layernorm.unwrap_or(false);
        let strategy = VersionStrategy::select(version, self.num_hidden_layers, post_layernorm);

        let rotary_pct = self.rotary_pct.unwrap_or(0.5);
        if !(rotary_pct > 0.0 && rotary_pct <= 1.0) {
            return Err(config_err(format!("rotary_pct must be in (0, 1], got {rotary_pct}")));
        }
        match strategy.positions {
            PositionScheme::Rotary2d if head_dim % 4 != 0 => {
                return Err(config_err(format!(
                    "2d rotary embedding needs head_dim divisible by 4, got {head_dim}"
                )));
            }
            PositionScheme::Rotary1d if ((head_dim as f32 * rotary_pct) as usize) % 2 != 0 => {
                return Err(config_err(format!(
                    "rotary_pct {rotary_pct} of head_dim {head_dim} does not give an even rotary width"
                )));
            }
            _ => {}
        }

        let mapping = Mapping::new(self.tp_size.unwrap_or(1), self.tp_rank.unwrap_or(0))
            .map_err(config_from)?;
        let activation = ActivationKind::parse(
            self.hidden_act
                .as_deref()
                .unwrap_or_else(|| version.default_activation()),
        )
        .map_err(config_from)?;
        let embedding_sharding = EmbeddingSharding::from_dim(
            self.use_parallel_embedding.unwrap_or(false) && mapping.is_parallel(),
            self.embedding_sharding_dim.unwrap_or(0),
        )
        .map_err(config_from)?;
        let rope_scaling = match &self.rope_scaling {
            Some(scaling) => scaling.resolve()?,
            None => RopeScaling::None,
        };
        let output_vocab_size = self.output_vocab_size.unwrap_or(self.vocab_size);

        let resolved = ResolvedConfig {
            version,
            strategy,
            hidden_size: self.hidden_size,
            num_layers: self.num_hidden_layers,
            num_heads: self.num_attention_heads,
            num_kv_heads,
            head_dim,
            vocab_size: self.vocab_size,
            output_vocab_size,
            padded_vocab_size: layers::pad_vocab_size(output_vocab_size, mapping.tp_size),
            max_position_embeddings: self.max_position_embeddings,
            intermediate_size: self.intermediate_size.unwrap_or(4 * self.hidden_size),
            activation,
            norm_kind: NormKind::from_rmsnorm_flag(self.rmsnorm.unwrap_or(true)),
            norm_epsilon: self.norm_epsilon.unwrap_or(1e-5),
            add_bias_linear: self.add_bias_linear.unwrap_or(false),
            add_qkv_bias: self.add_qkv_bias.unwrap_or(true),
            rope_base: 10_000.0 * self.rope_ratio.unwrap_or(1.0),
            rotary_pct,
            rope_scaling,
            embedding_sharding,
            share_embedding_table: self.share_embedding_table.unwrap_or(false),
            dtype: parse_dtype(self.dtype.as_deref().unwrap_or("float32")).map_err(config_from)?,
            mapping,
        };
        resolved.local_heads()?;
        if resolved.share_embedding_table && resolved.embedding_sharding != EmbeddingSharding::None {
            return Err(config_err(
                "share_embedding_table needs an unsharded vocabulary embedding",
            ));
        }
        if resolved.share_embedding_table && output_vocab_size != self.vocab_size {
            return Err(config_err(
                "share_embedding_table needs output_vocab_size == vocab_size",
            ));
        }
        Ok(resolved)
    }
}

/// Layout and cache knobs owned by the execution environment, passed
/// explicitly into every forward call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RuntimeOptions {
    /// Tokens of all requests are packed into one `[tokens]` axis.
    pub remove_input_padding: bool,
    /// The cache arrives as block pointers rather than past tensors.
    pub paged_kv_cache: bool,
}

impl RuntimeOptions {
    pub fn layout(&self) -> InputLayout {
        if self.remove_input_padding {
            InputLayout::Packed
        } else {
            InputLayout::Padded
        }
    }

    pub fn cache_mode(&self) -> CacheMode {
        if self.paged_kv_cache {
            CacheMode::Paged
        } else {
            CacheMode::Contiguous
        }
    }
}

impl std::str::FromStr for GlmVersion {
    type Err = ChatGlmError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ChatGlmConfig {
        ChatGlmConfig {
            hidden_size: 16,
            num_hidden_layers: 2,
            num_attention_heads: 4,
            vocab_size: 10,
            max_position_embeddings: 32,
            ..ChatGlmConfig::default()
        }
    }

    #[test]
    fn defaults_follow_chatglm3() {
        let resolved = base().normalize().unwrap();
        assert_eq!(resolved.version, GlmVersion::ChatGlm3);
        assert!(!resolved.add_bias_linear);
        assert!(resolved.add_qkv_bias);
        assert_eq!(resolved.norm_kind, NormKind::RmsNorm);
        assert_eq!(resolved.rope_base, 10_000.0);
        assert_eq!(resolved.intermediate_size, 64);
        assert_eq!(resolved.num_kv_heads, 4);
        assert_eq!(resolved.activation, ActivationKind::SwiGlu);
        assert_eq!(resolved.dtype, DType::F32);
        assert_eq!(
            resolved.strategy.residual,
            ResidualStrategy::Standard {
                post_layernorm: false
            }
        );
        assert!(!resolved.position_encoding_2d());
    }

    #[test]
    fn each_version_selects_one_strategy() {
        let mut config = base();
        for (tag, mask, scaled, positions) in [
            ("glm", AttentionMaskType::Causal, false, PositionScheme::LearnedBlock),
            ("chatglm", AttentionMaskType::Bidirectional, true, PositionScheme::Rotary2d),
            ("chatglm2", AttentionMaskType::Causal, false, PositionScheme::Rotary1d),
            ("chatglm3", AttentionMaskType::Causal, false, PositionScheme::Rotary1d),
        ] {
            config.chatglm_version = Some(tag.to_string());
            let resolved = config.normalize().unwrap();
            assert_eq!(resolved.version.as_str(), tag);
            assert_eq!(resolved.strategy.mask_type, mask);
            assert_eq!(resolved.strategy.positions, positions);
            assert_eq!(
                matches!(resolved.strategy.residual, ResidualStrategy::Scaled { .. }),
                scaled
            );
            assert_eq!(resolved.position_encoding_2d(), resolved.version.position_encoding_2d());
        }
    }

    #[test]
    fn scaled_residual_uses_layer_count() {
        let strategy = VersionStrategy::select(GlmVersion::ChatGlm, 8, false);
        assert_eq!(strategy.residual, ResidualStrategy::Scaled { alpha: 4.0 });
        let config = strategy.residual.residual_config();
        assert!(config.post_layernorm);
        assert_eq!(config.residual_scale, Some(4.0));
    }

    #[test]
    fn unknown_version_is_a_config_error() {
        let config = ChatGlmConfig {
            chatglm_version: Some("chatglm4".to_string()),
            ..base()
        };
        assert!(matches!(config.normalize(), Err(ChatGlmError::Config(_))));
        assert!("glm".parse::<GlmVersion>().is_ok());
    }

    #[test]
    fn invalid_head_grouping_is_rejected() {
        let config = ChatGlmConfig {
            num_key_value_heads: Some(3),
            ..base()
        };
        assert!(matches!(config.normalize(), Err(ChatGlmError::Config(_))));

        let config = ChatGlmConfig {
            num_attention_heads: 5,
            ..base()
        };
        assert!(config.normalize().is_err());
    }

    #[test]
    fn tensor_parallel_geometry_is_checked() {
        let config = ChatGlmConfig {
            num_key_value_heads: Some(2),
            tp_size: Some(2),
            tp_rank: Some(1),
            vocab_size: 11,
            ..base()
        };
        let resolved = config.normalize().unwrap();
        let heads = resolved.local_heads().unwrap();
        assert_eq!((heads.num_heads, heads.num_kv_heads), (2, 1));
        assert_eq!(resolved.padded_vocab_size, 12);

        let config = ChatGlmConfig {
            tp_size: Some(3),
            ..base()
        };
        assert!(config.normalize().is_err());
    }

    #[test]
    fn rope_scaling_and_ratio_resolve() {
        let config = ChatGlmConfig {
            rope_ratio: Some(50.0),
            rope_scaling: Some(RopeScalingConfig {
                kind: "linear".to_string(),
                factor: 2.0,
            }),
            ..base()
        };
        let resolved = config.normalize().unwrap();
        assert_eq!(resolved.rope_base, 500_000.0);
        assert_eq!(resolved.rope_scaling, RopeScaling::Linear { factor: 2.0 });

        let config = ChatGlmConfig {
            rope_scaling: Some(RopeScalingConfig {
                kind: "yarn".to_string(),
                factor: 2.0,
            }),
            ..base()
        };
        assert!(config.normalize().is_err());
    }
}
