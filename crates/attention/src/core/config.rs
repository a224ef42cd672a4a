//! Configuration options shared by all attention implementations.

use super::errors::{config_err, AttentionError};

/// Which keys a query may see before window and sink rules are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttentionMaskType {
    /// Query at position `t` sees keys `0..=t`.
    #[default]
    Causal,
    /// ChatGLM-6B prefix mask: in a fresh context every token but the last sees
    /// the whole prefix and the last token sees everything. Decode steps are
    /// causal.
    Bidirectional,
}

/// Run-time knobs for the attention kernel.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Config {
    /// Multiplier applied to `q·k`; `None` selects `1 / sqrt(head_dim)`.
    pub softmax_scale: Option<f32>,
}

/// Head geometry of one attention layer on one rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadLayout {
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
}

impl HeadLayout {
    pub fn new(num_heads: usize, num_kv_heads: usize, head_dim: usize) -> Result<Self, AttentionError> {
        if num_heads == 0 || num_kv_heads == 0 || head_dim == 0 {
            return Err(config_err(format!(
                "head layout must be non-zero, got heads={num_heads} kv_heads={num_kv_heads} head_dim={head_dim}"
            )));
        }
        if num_heads % num_kv_heads != 0 {
            return Err(config_err(format!(
                "num_heads {num_heads} is not a multiple of num_kv_heads {num_kv_heads}"
            )));
        }
        Ok(Self {
            num_heads,
            num_kv_heads,
            head_dim,
        })
    }

    /// Query heads served by each key/value head.
    pub fn group_size(&self) -> usize {
        self.num_heads / self.num_kv_heads
    }

    /// Width of the fused `q | k | v` projection output.
    pub fn qkv_width(&self) -> usize {
        (self.num_heads + 2 * self.num_kv_heads) * self.head_dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_layout_checks_grouping() {
        let layout = HeadLayout::new(8, 2, 16).unwrap();
        assert_eq!(layout.group_size(), 4);
        assert_eq!(layout.qkv_width(), (8 + 4) * 16);
        assert!(matches!(
            HeadLayout::new(6, 4, 16),
            Err(AttentionError::Configuration { .. })
        ));
        assert!(HeadLayout::new(4, 0, 16).is_err());
    }
}
