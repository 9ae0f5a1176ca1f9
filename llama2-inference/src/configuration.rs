#[cfg(test)]
#[path = "../tests/unit/configuration_test.rs"]
mod configuration_test;

use std::io::Cursor;

use crate::error::{LlamaError, Result};
use crate::utils::MemoryMapper;
use byteorder::{LittleEndian, ReadBytesExt};

/// Size of the checkpoint header in bytes (7 i32 fields).
pub const HEADER_SIZE: usize = 7 * std::mem::size_of::<i32>();

/// Transformer hyperparameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelConfig {
    pub dim: usize,
    pub hidden_dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub vocab_size: usize,
    pub seq_len: usize,
    pub head_size: usize,
    pub shared_weights: bool,
}

impl ModelConfig {
    /// Width of the key/value projections.
    #[inline]
    pub fn kv_dim(&self) -> usize {
        self.dim * self.n_kv_heads / self.n_heads
    }

    /// Number of query heads sharing one key/value head.
    #[inline]
    pub fn kv_mul(&self) -> usize {
        self.n_heads / self.n_kv_heads
    }

    /// Floats in each of the two legacy RoPE tables stored after the final norm.
    #[inline]
    pub fn rope_table_len(&self) -> usize {
        self.seq_len * self.head_size / 2
    }

    /// Total checkpoint size in bytes implied by the header, `None` on overflow.
    pub fn checkpoint_size(&self) -> Option<usize> {
        let Self { dim, hidden_dim, n_layers, vocab_size, .. } = *self;
        let kv_dim = self.kv_dim();

        let per_layer = [
            dim,                   // rms_att
            dim.checked_mul(dim)?, // wq
            dim.checked_mul(kv_dim)?,
            dim.checked_mul(kv_dim)?,
            dim.checked_mul(dim)?, // wo
            dim,                   // rms_ffn
            hidden_dim.checked_mul(dim)?.checked_mul(3)?,
        ]
        .iter()
        .try_fold(0usize, |acc, &n| acc.checked_add(n))?;

        let embedding = vocab_size.checked_mul(dim)?;
        let classifier = if self.shared_weights { 0 } else { embedding };

        let floats = [
            embedding,
            n_layers.checked_mul(per_layer)?,
            dim,
            self.rope_table_len().checked_mul(2)?,
            classifier,
        ]
        .iter()
        .try_fold(0usize, |acc, &n| acc.checked_add(n))?;

        floats.checked_mul(std::mem::size_of::<f32>())?.checked_add(HEADER_SIZE)
    }
}

/// Raw header as stored in the checkpoint.
#[derive(Debug, Clone, Copy)]
struct Config {
    pub dim: i32,
    pub hidden_dim: i32,
    pub n_layers: i32,
    pub n_heads: i32,
    pub n_kv_heads: i32,
    pub vocab_size: i32,
    pub seq_len: i32,
}

impl TryFrom<Config> for ModelConfig {
    type Error = LlamaError;

    fn try_from(config: Config) -> Result<ModelConfig> {
        validate_config(&config)?;

        let dim = config.dim as usize;
        let n_heads = config.n_heads as usize;

        Ok(ModelConfig {
            dim,
            hidden_dim: config.hidden_dim as usize,
            n_layers: config.n_layers as usize,
            n_heads,
            n_kv_heads: config.n_kv_heads as usize,
            // the sign only carries the shared classifier flag
            vocab_size: config.vocab_size.unsigned_abs() as usize,
            seq_len: config.seq_len as usize,
            head_size: dim / n_heads,
            shared_weights: config.vocab_size > 0,
        })
    }
}

/// Reads and validates the model configuration from the start of the checkpoint.
///
/// The header is 7 consecutive little-endian i32 values: dim, hidden_dim, n_layers,
/// n_heads, n_kv_heads, vocab_size (signed) and seq_len.
pub(crate) fn read_config(mapper: &mut MemoryMapper) -> Result<ModelConfig> {
    let file_size = mapper.len();
    let data = mapper.get_bytes(HEADER_SIZE).map_err(|_| {
        LlamaError::InvalidCheckpoint(format!("file has {file_size} bytes, header needs {HEADER_SIZE}"))
    })?;

    let mut cursor = Cursor::new(data);

    macro_rules! read_i32 {
        ($field:literal) => {
            cursor
                .read_i32::<LittleEndian>()
                .map_err(|e| LlamaError::InvalidCheckpoint(format!("failed to read {}: {e}", $field)))?
        };
    }

    let config = Config {
        dim: read_i32!("dimension"),
        hidden_dim: read_i32!("hidden dimension"),
        n_layers: read_i32!("number of layers"),
        n_heads: read_i32!("number of heads"),
        n_kv_heads: read_i32!("number of KV heads"),
        vocab_size: read_i32!("vocabulary size"),
        seq_len: read_i32!("sequence length"),
    };

    config.try_into()
}

fn validate_config(config: &Config) -> Result<()> {
    let dimensions = [
        ("dim", config.dim),
        ("hidden_dim", config.hidden_dim),
        ("n_layers", config.n_layers),
        ("n_heads", config.n_heads),
        ("n_kv_heads", config.n_kv_heads),
        ("seq_len", config.seq_len),
    ];

    for (name, value) in dimensions {
        if value <= 0 {
            return Err(LlamaError::InvalidCheckpoint(format!("{name} must be positive, got {value}")));
        }
    }

    if config.vocab_size == 0 {
        return Err(LlamaError::InvalidCheckpoint("vocab_size must be non-zero".into()));
    }

    if config.dim % config.n_heads != 0 {
        return Err(LlamaError::InvalidCheckpoint(format!(
            "dim {} is not divisible by n_heads {}",
            config.dim, config.n_heads
        )));
    }

    if config.n_kv_heads > config.n_heads || config.n_heads % config.n_kv_heads != 0 {
        return Err(LlamaError::InvalidCheckpoint(format!(
            "n_heads {} is not a multiple of n_kv_heads {}",
            config.n_heads, config.n_kv_heads
        )));
    }

    if (config.dim / config.n_heads) % 2 != 0 {
        return Err(LlamaError::InvalidCheckpoint(format!(
            "head size {} must be even",
            config.dim / config.n_heads
        )));
    }

    Ok(())
}
