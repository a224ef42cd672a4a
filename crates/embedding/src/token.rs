//! Token embedding lookup over a pre-loaded table.
//!
//! The table may be sharded across tensor-parallel ranks along either axis:
//!
//! * vocabulary rows (`sharding_dim = 0`): each rank owns a contiguous slice of
//!   the padded vocabulary, ids outside it produce zeros and the partial
//!   lookups are summed across ranks;
//! * hidden columns (`sharding_dim = 1`): each rank owns a slice of every
//!   vector and the slices are gathered along the last axis.

use std::sync::Arc;

use candle_core::{bail, DType, Result, Tensor};
use layers::{checks, pad_vocab_size, Communicator, SingleProcess};

/// Axis along which the embedding table is split across ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmbeddingSharding {
    #[default]
    None,
    Vocab,
    Hidden,
}

impl EmbeddingSharding {
    /// Maps the checkpoint's `embedding_sharding_dim` onto a sharding mode.
    pub fn from_dim(parallel: bool, sharding_dim: usize) -> Result<Self> {
        match (parallel, sharding_dim) {
            (false, _) => Ok(Self::None),
            (true, 0) => Ok(Self::Vocab),
            (true, 1) => Ok(Self::Hidden),
            (true, other) => bail!("embedding_sharding_dim must be 0 or 1, got {other}"),
        }
    }
}

/// Configuration for a token embedding table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenEmbeddingConfig {
    /// Size of the vocabulary (number of distinct tokens).
    pub vocab_size: usize,
    /// Dimensionality of each embedding vector.
    pub hidden_dim: usize,
    pub sharding: EmbeddingSharding,
}

impl TokenEmbeddingConfig {
    pub fn new(vocab_size: usize, hidden_dim: usize) -> Self {
        Self {
            vocab_size,
            hidden_dim,
            sharding: EmbeddingSharding::None,
        }
    }

    pub fn with_sharding(mut self, sharding: EmbeddingSharding) -> Self {
        self.sharding = sharding;
        self
    }

    /// Shape of the table held by a rank of a `tp_size` group.
    pub fn local_shape(&self, tp_size: usize) -> Result<(usize, usize)> {
        match self.sharding {
            EmbeddingSharding::None => Ok((self.vocab_size, self.hidden_dim)),
            EmbeddingSharding::Vocab => Ok((
                pad_vocab_size(self.vocab_size, tp_size) / tp_size.max(1),
                self.hidden_dim,
            )),
            EmbeddingSharding::Hidden => {
                if self.hidden_dim % tp_size.max(1) != 0 {
                    bail!(
                        "hidden_dim {} is not divisible by tp_size {tp_size}",
                        self.hidden_dim
                    );
                }
                Ok((self.vocab_size, self.hidden_dim / tp_size.max(1)))
            }
        }
    }
}

/// Token embedding table.
#[derive(Debug, Clone)]
pub struct TokenEmbedding {
    config: TokenEmbeddingConfig,
    weight: Tensor,
    comm: Arc<dyn Communicator>,
}

impl TokenEmbedding {
    /// Wraps an unsharded `(vocab_size, hidden_dim)` table.
    pub fn new(config: TokenEmbeddingConfig, weight: Tensor) -> Result<Self> {
        Self::sharded(config, weight, Arc::new(SingleProcess))
    }

    /// Wraps this rank's slice of the table; see [`TokenEmbeddingConfig::local_shape`].
    pub fn sharded(
        config: TokenEmbeddingConfig,
        weight: Tensor,
        comm: Arc<dyn Communicator>,
    ) -> Result<Self> {
        if config.vocab_size == 0 {
            bail!("token embedding requires vocab_size > 0");
        }
        if config.hidden_dim == 0 {
            bail!("token embedding requires hidden_dim > 0");
        }
        let (rows, cols) = config.local_shape(comm.mapping().tp_size)?;
        checks::expect_shape("embedding.weight", &weight, &[rows, cols])?;
        checks::expect_dtype_in("embedding.weight", &weight, checks::PARAMETER_DTYPES)?;
        Ok(Self {
            config,
            weight,
            comm,
        })
    }

    pub fn config(&self) -> &TokenEmbeddingConfig {
        &self.config
    }

    /// This rank's slice of the table.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Looks up embeddings for integer `token_ids` of any rank. The output
    /// appends a trailing `hidden_dim` axis and keeps the table's dtype.
    pub fn forward(&self, token_ids: &Tensor) -> Result<Tensor> {
        if !token_ids.dtype().is_int() {
            bail!(
                "token_ids expected integer dtype but received {:?}",
                token_ids.dtype()
            );
        }
        let flat = token_ids.flatten_all()?.to_dtype(DType::I64)?;
        self.ensure_id_range(&flat)?;

        let gathered = match self.config.sharding {
            EmbeddingSharding::None => self.weight.index_select(&flat.to_dtype(DType::U32)?, 0)?,
            EmbeddingSharding::Hidden => {
                let local = self.weight.index_select(&flat.to_dtype(DType::U32)?, 0)?;
                self.comm.all_gather(&local, 1)?
            }
            EmbeddingSharding::Vocab => {
                let local = self.lookup_vocab_shard(&flat)?;
                self.comm.all_reduce_sum(&local)?
            }
        };

        let mut output_dims = token_ids.dims().to_vec();
        output_dims.push(self.config.hidden_dim);
        gathered.reshape(output_dims)
    }

    fn lookup_vocab_shard(&self, flat_ids: &Tensor) -> Result<Tensor> {
        let rows = self.weight.dim(0)?;
        let offset = Tensor::new((self.comm.mapping().tp_rank * rows) as i64, flat_ids.device())?;
        let local = flat_ids.broadcast_sub(&offset)?;
        let in_shard = local
            .ge(0i64)?
            .mul(&local.lt(rows as i64)?)?
            .to_dtype(self.weight.dtype())?
            .unsqueeze(1)?;
        let index = local.clamp(0i64, rows as i64 - 1)?.to_dtype(DType::U32)?;
        self.weight.index_select(&index, 0)?.broadcast_mul(&in_shard)
    }

    fn ensure_id_range(&self, flat_ids: &Tensor) -> Result<()> {
        if flat_ids.elem_count() == 0 {
            return Ok(());
        }
        let min_id = flat_ids.min_all()?.to_scalar::<i64>()?;
        if min_id < 0 {
            bail!("encountered negative token id {min_id}");
        }
        let max_id = flat_ids.max_all()?.to_scalar::<i64>()?;
        let vocab = self.config.vocab_size as i64;
        if max_id >= vocab {
            bail!("token id {max_id} exceeds vocab size {vocab}");
        }
        Ok(())
    }
}
