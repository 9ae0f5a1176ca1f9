#[cfg(test)]
#[path = "../tests/unit/transformer_test.rs"]
mod transformer_test;

use crate::configuration::{ModelConfig, read_config};
use crate::error::{LlamaError, Result};
use crate::layers::*;
use crate::tensor::MatmulKernel;
use crate::utils::MemoryMapper;
use log::debug;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Read-only model parameters: the checkpoint mapping plus every tensor view into it.
///
/// The mapping is owned here, so it lives exactly as long as the views. Several
/// [`Transformer`] sessions can share one instance through an `Arc`.
pub struct TransformerWeights {
    token_embedding: TokenEmbedding,
    blocks: Vec<TransformerBlock>,
    final_norm: RMSNorm,
    lm_head: Linear,
    mapper: MemoryMapper,
}

impl TransformerWeights {
    /// Slices every tensor out of the mapping in checkpoint order.
    ///
    /// Per tensor kind the file stores all layers back to back:
    /// embedding, rms_att, wq, wk, wv, wo, rms_ffn, w1, w2, w3, rms_final,
    /// two legacy RoPE tables (skipped) and, unless shared, the classifier.
    fn load(mut mapper: MemoryMapper, config: &ModelConfig) -> Result<Self> {
        let ModelConfig { dim, hidden_dim, n_layers, vocab_size, shared_weights, .. } = *config;
        let kv_dim = config.kv_dim();

        let token_embedding_table = mapper.take_f32(vocab_size * dim)?;
        let rms_att_weight = mapper.take_f32(n_layers * dim)?;
        let wq = mapper.take_f32(n_layers * dim * dim)?;
        let wk = mapper.take_f32(n_layers * dim * kv_dim)?;
        let wv = mapper.take_f32(n_layers * dim * kv_dim)?;
        let wo = mapper.take_f32(n_layers * dim * dim)?;
        let rms_ffn_weight = mapper.take_f32(n_layers * dim)?;
        let w1 = mapper.take_f32(n_layers * hidden_dim * dim)?;
        let w2 = mapper.take_f32(n_layers * dim * hidden_dim)?;
        let w3 = mapper.take_f32(n_layers * hidden_dim * dim)?;
        let rms_final_weight = mapper.take_f32(dim)?;

        // what used to be freq_cis_real and freq_cis_imag
        mapper.skip_f32(config.rope_table_len())?;
        mapper.skip_f32(config.rope_table_len())?;

        let wcls = if shared_weights { token_embedding_table } else { mapper.take_f32(vocab_size * dim)? };

        let blocks = (0..n_layers)
            .map(|l| {
                let attention = MultiHeadAttention::new(
                    Linear::new(wq.part(l, n_layers), dim, dim),
                    Linear::new(wk.part(l, n_layers), dim, kv_dim),
                    Linear::new(wv.part(l, n_layers), dim, kv_dim),
                    Linear::new(wo.part(l, n_layers), dim, dim),
                    config,
                );

                let feed_forward = FeedForward::new(
                    Linear::new(w1.part(l, n_layers), dim, hidden_dim),
                    Linear::new(w2.part(l, n_layers), hidden_dim, dim),
                    Linear::new(w3.part(l, n_layers), dim, hidden_dim),
                );

                TransformerBlock {
                    attn_norm: RMSNorm::new(rms_att_weight.part(l, n_layers)),
                    attention,
                    ffn_norm: RMSNorm::new(rms_ffn_weight.part(l, n_layers)),
                    feed_forward,
                    layer_idx: l,
                }
            })
            .collect();

        Ok(Self {
            token_embedding: TokenEmbedding::new(token_embedding_table, dim),
            blocks,
            final_norm: RMSNorm::new(rms_final_weight),
            lm_head: Linear::new(wcls, dim, vocab_size),
            mapper,
        })
    }

    pub fn n_layers(&self) -> usize {
        self.blocks.len()
    }

    /// Whether the classifier aliases the embedding table.
    pub fn shares_classifier(&self) -> bool {
        self.lm_head.weight == self.token_embedding.table
    }
}

impl std::fmt::Debug for TransformerWeights {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        struct BlocksSummary<'a, T>(&'a [T]);

        impl<'a, T: std::fmt::Debug> std::fmt::Debug for BlocksSummary<'a, T> {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_list()
                    .entries(self.0.iter().take(1))
                    .entry(&format_args!("... and {} more", self.0.len().saturating_sub(1)))
                    .finish()
            }
        }

        f.debug_struct("TransformerWeights")
            .field("token_embedding", &self.token_embedding)
            .field("blocks", &BlocksSummary(&self.blocks))
            .field("final_norm", &self.final_norm)
            .field("lm_head", &self.lm_head)
            .field("mapped_bytes", &self.mapper.len())
            .finish()
    }
}

/// Forward pass for one token at one position, returning the logits.
///
/// Only `state` is written: its scratch buffers and the KV cache slot of `pos`.
/// `pos` must equal the number of earlier calls on the same state; this is not checked.
pub fn forward<'a>(
    weights: &TransformerWeights,
    state: &'a mut RunState,
    token: usize,
    pos: usize,
    kernel: MatmulKernel,
) -> &'a mut [f32] {
    let source = &weights.mapper;

    // Token embedding
    weights.token_embedding.forward(source, token, &mut state.x);

    // Decoder layers
    for block in &weights.blocks {
        block.forward(source, kernel, pos, state);
    }

    // Final normalization
    weights.final_norm.forward_inplace(source, &mut state.x);

    // Classification head
    weights.lm_head.forward(source, kernel, &mut state.logits, &state.x);

    &mut state.logits
}

/// Decoder-only Llama-2 style transformer session.
///
/// **Architecture:**
/// - Multi-head self-attention with grouped/multi-query KV sharing and a KV cache
/// - Rotary position embedding on queries and keys
/// - Pre-norm RMSNorm, SwiGLU feed-forward, residual connections
///
/// Weights are shared, the [`RunState`] (including the KV cache) belongs to this session.
pub struct Transformer {
    pub config: ModelConfig,
    weights: Arc<TransformerWeights>,
    state: RunState,
    kernel: MatmulKernel,
}

impl Transformer {
    /// Runs the forward pass and returns the logits for the next token.
    pub fn forward(&mut self, token: usize, pos: usize) -> &mut [f32] {
        forward(&self.weights, &mut self.state, token, pos, self.kernel)
    }

    /// Creates an independent session over the same weights with a fresh KV cache.
    pub fn new_session(&self) -> Transformer {
        Transformer {
            config: self.config.clone(),
            weights: Arc::clone(&self.weights),
            state: RunState::new(&self.config),
            kernel: self.kernel,
        }
    }

    pub fn get_config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn weights(&self) -> &Arc<TransformerWeights> {
        &self.weights
    }

    pub fn kernel(&self) -> MatmulKernel {
        self.kernel
    }
}

impl std::fmt::Debug for Transformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transformer")
            .field("config", &self.config)
            .field("kernel", &self.kernel)
            .field("weights", &self.weights)
            .finish_non_exhaustive()
    }
}

/// Builder pattern for creating transformer models
pub struct TransformerBuilder {
    checkpoint_path: PathBuf,
    ctx_length: Option<usize>,
    kernel: MatmulKernel,
}

impl TransformerBuilder {
    pub fn new<P: AsRef<Path>>(checkpoint_path: P) -> Self {
        Self { checkpoint_path: checkpoint_path.as_ref().to_path_buf(), ctx_length: None, kernel: MatmulKernel::default() }
    }

    pub fn with_ctx_length(mut self, ctx_length: Option<usize>) -> Self {
        self.ctx_length = ctx_length;
        self
    }

    pub fn with_kernel(mut self, kernel: MatmulKernel) -> Self {
        self.kernel = kernel;
        self
    }

    pub fn build(self) -> Result<Transformer> {
        let file = File::open(&self.checkpoint_path)?;
        let mut mapper = MemoryMapper::new(file)?;

        let mut config = read_config(&mut mapper)?;
        debug!("{config:?}");

        let expected = config.checkpoint_size().ok_or_else(|| {
            LlamaError::InvalidCheckpoint("dimensions in the header overflow the addressable size".into())
        })?;
        if mapper.len() < expected {
            return Err(LlamaError::InvalidCheckpoint(format!(
                "{} has {} bytes, header implies {}",
                self.checkpoint_path.display(),
                mapper.len(),
                expected
            )));
        }

        let weights = TransformerWeights::load(mapper, &config)?;

        // Shrinking the context only affects the run state; the skipped tables above
        // were sized by the file's own seq_len.
        if let Some(ctx_len) = self.ctx_length.filter(|&len| len > 0) {
            config.seq_len = ctx_len.min(config.seq_len);
        }

        let state = RunState::new(&config);

        Ok(Transformer { config, weights: Arc::new(weights), state, kernel: self.kernel })
    }
}
