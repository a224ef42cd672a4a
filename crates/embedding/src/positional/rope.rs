//! Rotary positional embeddings.
//!
//! Only the leading `rotate_dim` features of each head are rotated; the tail is
//! passed through untouched. Two pairings are supported:
//!
//! * [`RotaryStyle::Interleaved`] rotates adjacent pairs `(2i, 2i + 1)` (GPT-J).
//! * [`RotaryStyle::HalfSplit`] rotates `i` with `i + rotate_dim / 2` (GPT-NeoX).
//!
//! Sine/cosine tables are f32 tensors shaped `[max_seq_len, rotate_dim / 2]`
//! kept in a bounded, process-wide LRU keyed by geometry, scaling and device.

use candle_core::{bail, DType, Device, DeviceLocation, Error, Result, Tensor};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};

const SIN_COS_CACHE_CAPACITY: usize = 16;

static SIN_COS_CACHE_HITS: AtomicUsize = AtomicUsize::new(0);
static SIN_COS_CACHE_MISSES: AtomicUsize = AtomicUsize::new(0);

/// Return the current `(hits, misses)` counters for the shared sin/cos cache.
pub fn sin_cos_cache_counters() -> (usize, usize) {
    (
        SIN_COS_CACHE_HITS.load(Ordering::Relaxed),
        SIN_COS_CACHE_MISSES.load(Ordering::Relaxed),
    )
}

/// Reset the shared sin/cos cache counters.
pub fn reset_sin_cos_cache_stats() {
    SIN_COS_CACHE_HITS.store(0, Ordering::Relaxed);
    SIN_COS_CACHE_MISSES.store(0, Ordering::Relaxed);
}

struct SinCosCache {
    capacity: usize,
    order: Vec<String>,
    entries: HashMap<String, (Tensor, Tensor)>,
}

impl SinCosCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: Vec::with_capacity(capacity),
            entries: HashMap::with_capacity(capacity),
        }
    }

    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            let key_owned = self.order.remove(pos);
            self.order.push(key_owned);
        }
    }

    fn get(&mut self, key: &str) -> Option<(Tensor, Tensor)> {
        let (sin, cos) = self.entries.get(key).cloned()?;
        self.touch(key);
        Some((sin, cos))
    }

    fn insert(&mut self, key: String, value: (Tensor, Tensor)) {
        if self.entries.insert(key.clone(), value).is_some() {
            self.touch(&key);
            return;
        }
        if self.order.len() >= self.capacity && !self.order.is_empty() {
            let oldest = self.order.remove(0);
            self.entries.remove(&oldest);
        }
        self.order.push(key);
    }
}

fn lock_cache() -> Result<MutexGuard<'static, SinCosCache>> {
    static CACHE: OnceLock<Mutex<SinCosCache>> = OnceLock::new();
    CACHE
        .get_or_init(|| Mutex::new(SinCosCache::new(SIN_COS_CACHE_CAPACITY)))
        .lock()
        .map_err(|_| Error::Msg("sin/cos cache lock poisoned".into()))
}

/// Which feature pairs a rotation acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RotaryStyle {
    /// Adjacent pairs `(2i, 2i + 1)`.
    #[default]
    Interleaved,
    /// Pairs `(i, i + rotate_dim / 2)`.
    HalfSplit,
}

/// Available scaling strategies for rotary positional embeddings.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum RopeScaling {
    #[default]
    None,
    /// Position interpolation: every angle is divided by `factor`.
    Linear { factor: f32 },
    /// NTK-aware base stretch: `theta * alpha^(d / (d - 2))`.
    NtkAware { alpha: f32 },
}

/// Configuration for building rotary positional embeddings.
#[derive(Debug, Clone, PartialEq)]
pub struct RopeConfig {
    /// Per-head dimensionality of the representations being rotated.
    pub head_dim: usize,
    /// Base angle parameter θ controlling the frequency spectrum.
    pub rope_theta: f32,
    /// How many leading dimensions to rotate; `None` rotates the full head.
    pub rotate_dim: Option<usize>,
    pub scaling: RopeScaling,
    pub style: RotaryStyle,
}

impl Default for RopeConfig {
    fn default() -> Self {
        Self {
            head_dim: 0,
            rope_theta: 10_000.0,
            rotate_dim: None,
            scaling: RopeScaling::default(),
            style: RotaryStyle::default(),
        }
    }
}

impl RopeConfig {
    pub fn rotate_dim(&self) -> usize {
        self.rotate_dim.unwrap_or(self.head_dim)
    }

    /// Rotates `floor(head_dim * pct)` features, rounded down to an even count.
    pub fn with_rotary_pct(mut self, pct: f32) -> Self {
        let dim = (self.head_dim as f32 * pct) as usize;
        self.rotate_dim = Some(dim - dim % 2);
        self
    }

    fn validate(&self) -> Result<()> {
        let rotate_dim = self.rotate_dim();
        if self.head_dim == 0 {
            bail!("head_dim must be non-zero");
        }
        if rotate_dim < 2 || rotate_dim > self.head_dim {
            bail!("invalid rotate_dim {rotate_dim} for head_dim {}", self.head_dim);
        }
        if rotate_dim % 2 != 0 {
            bail!("rotate_dim must be even, got {rotate_dim}");
        }
        match self.scaling {
            RopeScaling::Linear { factor } if factor <= 0.0 => {
                bail!("linear rope scaling factor must be positive, got {factor}")
            }
            RopeScaling::NtkAware { alpha } if alpha < 1.0 => {
                bail!("ntk rope alpha must be >= 1.0, got {alpha}")
            }
            _ => Ok(()),
        }
    }

    fn inverse_frequencies(&self) -> Vec<f64> {
        let rotate_dim = self.rotate_dim();
        let mut base = f64::from(self.rope_theta);
        let mut divisor = 1.0;
        match self.scaling {
            RopeScaling::None => {}
            RopeScaling::Linear { factor } => divisor = f64::from(factor),
            RopeScaling::NtkAware { alpha } => {
                let d = rotate_dim as f64;
                base *= f64::from(alpha).powf(d / (d - 2.0));
            }
        }
        (0..rotate_dim / 2)
            .map(|idx| base.powf(-((2 * idx) as f64) / rotate_dim as f64) / divisor)
            .collect()
    }
}

/// Build a stable cache key derived from geometry and device inputs.
pub fn rope_cache_key(max_seq_len: usize, cfg: &RopeConfig, device: &Device) -> String {
    let device_id = match device.location() {
        DeviceLocation::Cpu => "cpu".to_owned(),
        DeviceLocation::Cuda { gpu_id } => format!("cuda{gpu_id}"),
        DeviceLocation::Metal { gpu_id } => format!("metal{gpu_id}"),
    };
    format!(
        "seq={};rot={};dev={};{}",
        max_seq_len,
        cfg.rotate_dim(),
        device_id,
        scaling_fingerprint(cfg)
    )
}

/// Stable description of the frequency spectrum, used in cache keys and logs.
pub fn scaling_fingerprint(cfg: &RopeConfig) -> String {
    let scaling = match cfg.scaling {
        RopeScaling::None => "none".to_owned(),
        RopeScaling::Linear { factor } => format!("linear={factor:.6}"),
        RopeScaling::NtkAware { alpha } => format!("ntk={alpha:.6}"),
    };
    format!("theta={:.6};scaling={scaling}", cfg.rope_theta)
}

/// Retrieve (or lazily build) the sine/cosine tables for RoPE.
///
/// Returns f32 tensors shaped `[max_seq_len, rotate_dim / 2]`.
pub fn get_sin_cos(max_seq_len: usize, cfg: &RopeConfig, device: &Device) -> Result<(Tensor, Tensor)> {
    if max_seq_len == 0 {
        bail!("max_seq_len must be non-zero");
    }
    cfg.validate()?;

    let cache_key = rope_cache_key(max_seq_len, cfg, device);
    if let Some(tables) = lock_cache()?.get(&cache_key) {
        SIN_COS_CACHE_HITS.fetch_add(1, Ordering::Relaxed);
        log::debug!("rope sin/cos cache hit: {cache_key}");
        return Ok(tables);
    }
    SIN_COS_CACHE_MISSES.fetch_add(1, Ordering::Relaxed);
    log::debug!("rope sin/cos cache miss: {cache_key}");

    let inv_freqs = cfg.inverse_frequencies();
    let half_dim = inv_freqs.len();
    let mut sin_data = Vec::with_capacity(max_seq_len * half_dim);
    let mut cos_data = Vec::with_capacity(max_seq_len * half_dim);
    for pos in 0..max_seq_len {
        for &inv_freq in &inv_freqs {
            let angle = pos as f64 * inv_freq;
            sin_data.push(angle.sin() as f32);
            cos_data.push(angle.cos() as f32);
        }
    }
    let sin = Tensor::from_vec(sin_data, (max_seq_len, half_dim), device)?;
    let cos = Tensor::from_vec(cos_data, (max_seq_len, half_dim), device)?;

    lock_cache()?.insert(cache_key, (sin.clone(), cos.clone()));
    Ok((sin, cos))
}

/// Rotates the leading `rotate_dim` features of `x` (`[batch, heads, seq, head_dim]`)
/// with per-row `sin`/`cos` tables shaped `[seq, rotate_dim / 2]`.
fn rotate_leading(
    x: &Tensor,
    sin: &Tensor,
    cos: &Tensor,
    rotate_dim: usize,
    style: RotaryStyle,
) -> Result<Tensor> {
    let (batch, heads, seq_len, head_dim) = x.dims4()?;
    let half = rotate_dim / 2;
    let sin = sin
        .reshape((1, 1, seq_len, half))?
        .broadcast_as((batch, heads, seq_len, half))?;
    let cos = cos
        .reshape((1, 1, seq_len, half))?
        .broadcast_as((batch, heads, seq_len, half))?;

    let dtype = x.dtype();
    let main = x.narrow(3, 0, rotate_dim)?.contiguous()?.to_dtype(DType::F32)?;
    let rotated = match style {
        RotaryStyle::Interleaved => {
            let pairs = main.reshape((batch, heads, seq_len, half, 2))?;
            let even = pairs.narrow(4, 0, 1)?.squeeze(4)?;
            let odd = pairs.narrow(4, 1, 1)?.squeeze(4)?;
            let rotated_even = even.mul(&cos)?.sub(&odd.mul(&sin)?)?;
            let rotated_odd = odd.mul(&cos)?.add(&even.mul(&sin)?)?;
            Tensor::stack(&[&rotated_even, &rotated_odd], 4)?
                .reshape((batch, heads, seq_len, rotate_dim))?
        }
        RotaryStyle::HalfSplit => {
            let first = main.narrow(3, 0, half)?;
            let second = main.narrow(3, half, half)?;
            let rotated_first = first.mul(&cos)?.sub(&second.mul(&sin)?)?;
            let rotated_second = second.mul(&cos)?.add(&first.mul(&sin)?)?;
            Tensor::cat(&[&rotated_first, &rotated_second], 3)?
        }
    }
    .to_dtype(dtype)?;

    if rotate_dim == head_dim {
        Ok(rotated)
    } else {
        let tail = x.narrow(3, rotate_dim, head_dim - rotate_dim)?;
        Tensor::cat(&[&rotated, &tail], 3)
    }
}

/// Apply rotary embeddings to query/key tensors at contiguous positions
/// `pos_start..pos_start + seq_len`.
///
/// `q` and `k` are shaped `[batch, heads, seq_len, head_dim]` and may carry a
/// different number of heads (grouped-query attention). Outputs keep the input
/// dtype.
pub fn apply_rope_to_qk(
    q: &Tensor,
    k: &Tensor,
    pos_start: usize,
    cfg: &RopeConfig,
    sin: &Tensor,
    cos: &Tensor,
) -> Result<(Tensor, Tensor)> {
    let (_, _, seq_len, head_dim) = q.dims4()?;
    let (_, _, k_seq, k_dim) = k.dims4()?;
    if (k_seq, k_dim) != (seq_len, head_dim) {
        bail!("q/k shape mismatch: q={:?} k={:?}", q.dims(), k.dims());
    }
    let rotate_dim = cfg.rotate_dim();
    if rotate_dim > head_dim {
        bail!("rotate_dim {rotate_dim} exceeds head_dim {head_dim}");
    }
    let (rows, _) = sin.dims2()?;
    if rows < pos_start + seq_len {
        bail!("sin/cos table has {rows} rows, need {}", pos_start + seq_len);
    }
    let sin = sin.narrow(0, pos_start, seq_len)?;
    let cos = cos.narrow(0, pos_start, seq_len)?;
    Ok((
        rotate_leading(q, &sin, &cos, rotate_dim, cfg.style)?,
        rotate_leading(k, &sin, &cos, rotate_dim, cfg.style)?,
    ))
}

/// Rotates `x` (`[batch, heads, seq, head_dim]`) with one arbitrary position per
/// sequence row. `positions` is a rank-1 integer tensor of length `seq`.
pub fn apply_rope_at_positions(x: &Tensor, positions: &Tensor, cfg: &RopeConfig) -> Result<Tensor> {
    let (_, _, seq_len, head_dim) = x.dims4()?;
    if positions.dims() != [seq_len] {
        bail!(
            "positions shape {:?} does not match sequence length {seq_len}",
            positions.dims()
        );
    }
    let rotate_dim = cfg.rotate_dim();
    if rotate_dim > head_dim {
        bail!("rotate_dim {rotate_dim} exceeds head_dim {head_dim}");
    }
    if seq_len == 0 {
        return Ok(x.clone());
    }
    let positions = positions.to_dtype(DType::U32)?;
    let max_position = positions.max(0)?.to_scalar::<u32>()? as usize;
    // Power-of-two table lengths keep decode steps on the same cache entry.
    let table_len = (max_position + 1).next_power_of_two();
    let (sin, cos) = get_sin_cos(table_len, cfg, x.device())?;
    let sin = sin.index_select(&positions, 0)?;
    let cos = cos.index_select(&positions, 0)?;
    rotate_leading(x, &sin, &cos, rotate_dim, cfg.style)
}

/// Rotary positional embedding helper.
#[derive(Debug, Clone, PartialEq)]
pub struct Rope {
    config: RopeConfig,
}

impl Rope {
    pub fn new(config: RopeConfig) -> Result<Self> {
        config.validate()?;
        log::debug!(
            "rope init: head_dim={} rotate_dim={} style={:?} {}",
            config.head_dim,
            config.rotate_dim(),
            config.style,
            scaling_fingerprint(&config)
        );
        Ok(Self { config })
    }

    pub fn config(&self) -> &RopeConfig {
        &self.config
    }

    /// Rotates a single `[batch, heads, seq, head_dim]` tensor.
    pub fn apply(&self, x: &Tensor, positions: &Tensor) -> Result<Tensor> {
        apply_rope_at_positions(x, positions, &self.config)
    }

    /// Apply rotary positional embeddings to query/key tensors.
    pub fn apply_rotary_embeddings(
        &self,
        query: &Tensor,
        key: &Tensor,
        positions: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        if !query.device().same_device(key.device()) {
            bail!("query and key must live on the same device");
        }
        Ok((self.apply(query, positions)?, self.apply(key, positions)?))
    }
}

/// Two-dimensional rotary embedding: the first half of every head is rotated
/// by the position index and the second half by the block index, each half
/// fully rotated in [`RotaryStyle::HalfSplit`] pairing.
#[derive(Debug, Clone, PartialEq)]
pub struct Rope2d {
    half: Rope,
}

impl Rope2d {
    pub fn new(head_dim: usize, rope_theta: f32, scaling: RopeScaling) -> Result<Self> {
        if head_dim % 4 != 0 {
            bail!("2d rotary embedding needs head_dim divisible by 4, got {head_dim}");
        }
        let half = Rope::new(RopeConfig {
            head_dim: head_dim / 2,
            rope_theta,
            rotate_dim: None,
            scaling,
            style: RotaryStyle::HalfSplit,
        })?;
        Ok(Self { half })
    }

    pub fn apply(&self, x: &Tensor, positions: &Tensor, blocks: &Tensor) -> Result<Tensor> {
        let head_dim = x.dim(3)?;
        let half = head_dim / 2;
        if half != self.half.config().head_dim {
            bail!("2d rotary expects head_dim {}, got {head_dim}", 2 * self.half.config().head_dim);
        }
        let first = self.half.apply(&x.narrow(3, 0, half)?, positions)?;
        let second = self.half.apply(&x.narrow(3, half, half)?, blocks)?;
        Tensor::cat(&[&first, &second], 3)
    }
}
