use std::sync::Arc;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use embedding::token::{EmbeddingSharding, TokenEmbedding, TokenEmbeddingConfig};
use layers::{Communicator, Mapping};

fn table(vocab: usize, hidden: usize, device: &Device) -> Result<Tensor> {
    Ok(Tensor::arange(0f32, (vocab * hidden) as f32, device)?.reshape((vocab, hidden))?)
}

#[test]
fn forward_shape_and_dtype_match_table() -> Result<()> {
    let device = Device::Cpu;
    let weight = table(8, 4, &device)?.to_dtype(DType::F16)?;
    let embedding = TokenEmbedding::new(TokenEmbeddingConfig::new(8, 4), weight)?;

    let padded = Tensor::from_slice(&[0i64, 1, 2, 3], (2, 2), &device)?;
    let output = embedding.forward(&padded)?;
    assert_eq!(output.dims(), &[2, 2, 4]);
    assert_eq!(output.dtype(), DType::F16);

    let packed = Tensor::new(&[7u32, 0, 5], &device)?;
    let output = embedding.forward(&packed)?.to_dtype(DType::F32)?;
    assert_eq!(output.dims(), &[3, 4]);
    assert_eq!(output.get(0)?.to_vec1::<f32>()?, vec![28.0, 29.0, 30.0, 31.0]);
    Ok(())
}

#[test]
fn forward_rejects_out_of_range_ids() -> Result<()> {
    let device = Device::Cpu;
    let embedding = TokenEmbedding::new(TokenEmbeddingConfig::new(4, 3), table(4, 3, &device)?)?;
    let token_ids = Tensor::from_slice(&[0i64, 4], (1, 2), &device)?;

    let err = embedding.forward(&token_ids).unwrap_err();
    assert!(err.to_string().contains("token id 4 exceeds vocab size"));

    let floats = Tensor::new(&[0f32, 1.0], &device)?;
    assert!(embedding.forward(&floats).is_err());
    Ok(())
}

/// Pretends to be one rank of a two-way group. Collectives add or append the
/// other rank's contribution, which the test supplies up front.
#[derive(Debug)]
struct PeerRank {
    rank: usize,
    peer: Tensor,
}

impl Communicator for PeerRank {
    fn mapping(&self) -> Mapping {
        Mapping {
            tp_size: 2,
            tp_rank: self.rank,
        }
    }

    fn all_reduce_sum(&self, partial: &Tensor) -> candle_core::Result<Tensor> {
        partial.add(&self.peer)
    }

    fn all_gather(&self, local: &Tensor, dim: usize) -> candle_core::Result<Tensor> {
        if self.rank == 0 {
            Tensor::cat(&[local, &self.peer], dim)
        } else {
            Tensor::cat(&[&self.peer, local], dim)
        }
    }
}

#[test]
fn vocab_sharded_lookup_matches_full_table() -> Result<()> {
    let device = Device::Cpu;
    // vocab 5 pads to 6 for two ranks: rank 0 holds rows 0..3, rank 1 holds 3..6.
    let full = table(5, 2, &device)?;
    let padded = Tensor::cat(&[&full, &Tensor::zeros((1, 2), DType::F32, &device)?], 0)?;
    let ids = Tensor::new(&[4u32, 0, 2, 3], &device)?;
    let config = TokenEmbeddingConfig::new(5, 2).with_sharding(EmbeddingSharding::Vocab);

    let rank1 = TokenEmbedding::sharded(
        config.clone(),
        padded.narrow(0, 3, 3)?,
        Arc::new(PeerRank {
            rank: 1,
            peer: Tensor::zeros((4, 2), DType::F32, &device)?,
        }),
    )?;
    let rank1_partial = rank1.forward(&ids)?;
    let rank0 = TokenEmbedding::sharded(
        config,
        padded.narrow(0, 0, 3)?,
        Arc::new(PeerRank {
            rank: 0,
            peer: rank1_partial,
        }),
    )?;

    let sharded = rank0.forward(&ids)?;
    let reference = TokenEmbedding::new(TokenEmbeddingConfig::new(5, 2), full)?.forward(&ids)?;
    assert_eq!(sharded.to_vec2::<f32>()?, reference.to_vec2::<f32>()?);
    Ok(())
}

#[test]
fn hidden_sharded_lookup_gathers_columns() -> Result<()> {
    let device = Device::Cpu;
    let full = table(3, 4, &device)?;
    let ids = Tensor::new(&[2u32, 1], &device)?;
    let config = TokenEmbeddingConfig::new(3, 4).with_sharding(EmbeddingSharding::Hidden);
    let peer = full.narrow(1, 2, 2)?.contiguous()?.index_select(&ids, 0)?;
    let rank0 = TokenEmbedding::sharded(
        config,
        full.narrow(1, 0, 2)?.contiguous()?,
        Arc::new(PeerRank { rank: 0, peer }),
    )?;
    let out = rank0.forward(&ids)?;
    assert_eq!(
        out.to_vec2::<f32>()?,
        vec![vec![8.0, 9.0, 10.0, 11.0], vec![4.0, 5.0, 6.0, 7.0]]
    );
    Ok(())
}

#[test]
fn sharding_dim_parses() -> Result<()> {
    assert_eq!(EmbeddingSharding::from_dim(false, 1)?, EmbeddingSharding::None);
    assert_eq!(EmbeddingSharding::from_dim(true, 0)?, EmbeddingSharding::Vocab);
    assert_eq!(EmbeddingSharding::from_dim(true, 1)?, EmbeddingSharding::Hidden);
    assert!(EmbeddingSharding::from_dim(true, 2).is_err());
    Ok(())
}
