#[cfg(test)]
#[path = "../tests/unit/layers_test.rs"]
mod layers_test;

use crate::configuration::ModelConfig;
use crate::tensor::{MatmulKernel, TensorSource, TensorView, matmul};
use rayon::prelude::*;

/// Epsilon value for numerical stability in normalization
pub const EPSILON: f32 = 1e-5;

/// Base frequency for RoPE (Rotary Position Embedding)
const ROPE_BASE_FREQ: f32 = 10000.0;

/// Token embedding layer - converts token IDs to dense vectors
///
/// **Shape**: [vocab_size, dim]
/// **Note**: Shared with the classifier when the checkpoint ties the weights
pub struct TokenEmbedding {
    pub table: TensorView,
    pub dim: usize,
}

impl TokenEmbedding {
    pub fn new(table: TensorView, dim: usize) -> Self {
        Self { table, dim }
    }

    pub fn forward<S: TensorSource + ?Sized>(&self, source: &S, token: usize, output: &mut [f32]) {
        let row = self.table.part(token, self.table.len / self.dim);
        output[..self.dim].copy_from_slice(source.tensor(row));
    }
}

impl std::fmt::Debug for TokenEmbedding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenEmbedding")
            .field("dim", &self.dim)
            .field("vocab_size", &(self.table.len / self.dim))
            .finish()
    }
}

/// RMS Layer Normalization
///
/// **Mathematical Formula**:
/// ```text
/// RMSNorm(x) = x / RMS(x) * γ
/// where RMS(x) = sqrt(mean(x²) + ε)
/// ```
pub struct RMSNorm {
    pub weight: TensorView,
}

impl RMSNorm {
    pub fn new(weight: TensorView) -> Self {
        Self { weight }
    }

    pub fn forward<S: TensorSource + ?Sized>(&self, source: &S, output: &mut [f32], input: &[f32]) {
        rmsnorm(output, input, source.tensor(self.weight));
    }

    pub fn forward_inplace<S: TensorSource + ?Sized>(&self, source: &S, x: &mut [f32]) {
        let weight = source.tensor(self.weight);
        debug_assert_eq!(x.len(), weight.len());

        let factor = rms_factor(x);
        x.iter_mut().zip(weight).for_each(|(val, &w)| {
            *val = w * (factor * *val);
        });
    }
}

impl std::fmt::Debug for RMSNorm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RMSNorm").field("dim", &self.weight.len).finish()
    }
}

#[inline]
fn rms_factor(x: &[f32]) -> f32 {
    let sum_of_squares = x.iter().map(|&v| v * v).sum::<f32>();
    1.0f32 / ((sum_of_squares / x.len() as f32) + EPSILON).sqrt()
}

/// `output[j] = weight[j] * input[j] / sqrt(mean(input²) + ε)`
pub fn rmsnorm(output: &mut [f32], input: &[f32], weight: &[f32]) {
    debug_assert_eq!(output.len(), input.len());
    debug_assert_eq!(input.len(), weight.len());

    let factor = rms_factor(input);
    output.iter_mut().zip(input).zip(weight).for_each(|((out, &inp), &w)| {
        *out = w * (factor * inp);
    });
}

/// Applies softmax normalization to a slice in-place.
pub fn softmax(x: &mut [f32]) {
    if x.is_empty() {
        return;
    }

    let max_val = x.iter().fold(f32::NEG_INFINITY, |acc, &val| acc.max(val));
    let sum = x
        .iter_mut()
        .map(|val| {
            *val = (*val - max_val).exp();
            *val
        })
        .sum::<f32>();
    let inv_sum = sum.recip();
    x.iter_mut().for_each(|val| *val *= inv_sum);
}

/// Rotary Position Embedding over interleaved pairs `(v[i], v[i + 1])`.
///
/// The rotation frequency depends on the index within the head, so each head is
/// rotated identically for a given position.
pub struct RoPE {
    pub head_size: usize,
}

impl RoPE {
    pub fn new(head_size: usize) -> Self {
        Self { head_size }
    }

    /// Rotates every pair of `q`, and the pairs of `k` that fall inside its (possibly
    /// narrower) key/value width.
    pub fn apply(&self, q: &mut [f32], k: &mut [f32], pos: usize) {
        let head_size = self.head_size as f32;

        for i in (0..q.len()).step_by(2) {
            let head_dim = (i % self.head_size) as f32;
            let freq = ROPE_BASE_FREQ.powf(-head_dim / head_size);
            let (sin, cos) = (pos as f32 * freq).sin_cos();

            rotate(&mut q[i..i + 2], cos, sin);
            if i < k.len() {
                rotate(&mut k[i..i + 2], cos, sin);
            }
        }
    }
}

#[inline]
fn rotate(pair: &mut [f32], cos: f32, sin: f32) {
    let (v0, v1) = (pair[0], pair[1]);
    pair[0] = v0 * cos - v1 * sin;
    pair[1] = v0 * sin + v1 * cos;
}

impl std::fmt::Debug for RoPE {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoPE").field("head_size", &self.head_size).finish()
    }
}

/// Linear layer over a row-major `[out_features][in_features]` f32 weight.
pub struct Linear {
    pub weight: TensorView,
    pub in_features: usize,
    pub out_features: usize,
}

impl Linear {
    pub fn new(weight: TensorView, in_features: usize, out_features: usize) -> Self {
        debug_assert_eq!(weight.len, in_features * out_features);
        Self { weight, in_features, out_features }
    }

    pub fn forward<S: TensorSource + ?Sized>(
        &self,
        source: &S,
        kernel: MatmulKernel,
        output: &mut [f32],
        input: &[f32],
    ) {
        matmul(
            &mut output[..self.out_features],
            &input[..self.in_features],
            source.tensor(self.weight),
            kernel,
        );
    }
}

impl std::fmt::Debug for Linear {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Linear")
            .field("in_features", &self.in_features)
            .field("out_features", &self.out_features)
            .finish()
    }
}

/// Multi-Head Attention with Grouped Query Attention (GQA) support
///
/// - **MHA**: n_heads query heads, n_heads key/value heads
/// - **GQA/MQA**: n_heads query heads share n_kv_heads key/value heads, `kv_mul` each
///
/// **Attention Formula**:
/// ```text
/// Attention(Q,K,V) = softmax(QK^T / √d_k)V
/// ```
pub struct MultiHeadAttention {
    pub wq: Linear,
    pub wk: Linear,
    pub wv: Linear,
    pub wo: Linear,
    pub rope: RoPE,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub head_size: usize,
    pub kv_mul: usize,
}

impl MultiHeadAttention {
    pub fn new(wq: Linear, wk: Linear, wv: Linear, wo: Linear, config: &ModelConfig) -> Self {
        Self {
            wq,
            wk,
            wv,
            wo,
            rope: RoPE::new(config.head_size),
            n_heads: config.n_heads,
            n_kv_heads: config.n_kv_heads,
            head_size: config.head_size,
            kv_mul: config.kv_mul(),
        }
    }

    /// Reads the normalized input from `state.xb` and leaves the concatenated head
    /// outputs in `state.xb`.
    pub fn forward<S: TensorSource + ?Sized>(
        &self,
        source: &S,
        kernel: MatmulKernel,
        pos: usize,
        layer_idx: usize,
        state: &mut RunState,
    ) {
        let kv_dim = self.n_kv_heads * self.head_size;

        // Compute Q, K, V projections
        self.wq.forward(source, kernel, &mut state.q, &state.xb);
        self.wk.forward(source, kernel, &mut state.k, &state.xb);
        self.wv.forward(source, kernel, &mut state.v, &state.xb);

        self.rope.apply(&mut state.q, &mut state.k, pos);

        // Save key/value at this position
        let cache_range = pos * kv_dim..(pos + 1) * kv_dim;
        state.key_cache[layer_idx][cache_range.clone()].copy_from_slice(&state.k);
        state.value_cache[layer_idx][cache_range].copy_from_slice(&state.v);

        self.compute_attention(pos, layer_idx, state);
    }

    fn compute_attention(&self, pos: usize, layer_idx: usize, state: &mut RunState) {
        let attention_scale = (self.head_size as f32).sqrt().recip();
        let kv_dim = self.n_kv_heads * self.head_size;
        let seq_len = state.seq_len;

        let q = &state.q;
        let key_cache = &state.key_cache[layer_idx];
        let value_cache = &state.value_cache[layer_idx];

        // every head owns one row of `att` and one head-sized slice of `xb`
        state
            .att
            .par_chunks_mut(seq_len)
            .zip(state.xb.par_chunks_mut(self.head_size))
            .enumerate()
            .for_each(|(head_idx, (att_slice, xb_slice))| {
                let q_head = &q[head_idx * self.head_size..(head_idx + 1) * self.head_size];
                let kv_head_offset = (head_idx / self.kv_mul) * self.head_size;

                let att_head = &mut att_slice[..=pos];

                att_head.iter_mut().enumerate().for_each(|(time_step, att_score)| {
                    let k_start = time_step * kv_dim + kv_head_offset;
                    let k = &key_cache[k_start..k_start + self.head_size];

                    *att_score = q_head.iter().zip(k).map(|(&q, &k)| q * k).sum::<f32>() * attention_scale;
                });

                softmax(att_head);

                xb_slice.fill(0.0);
                for (time_step, &attention_weight) in att_head.iter().enumerate() {
                    let v_start = time_step * kv_dim + kv_head_offset;
                    let v = &value_cache[v_start..v_start + self.head_size];

                    xb_slice.iter_mut().zip(v).for_each(|(out, &value)| *out += attention_weight * value);
                }
            });
    }
}

impl std::fmt::Debug for MultiHeadAttention {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiHeadAttention")
            .field("n_heads", &self.n_heads)
            .field("n_kv_heads", &self.n_kv_heads)
            .field("head_size", &self.head_size)
            .field("wq", &self.wq)
            .field("wk", &self.wk)
            .field("wv", &self.wv)
            .field("wo", &self.wo)
            .finish()
    }
}

/// Feed-Forward Network with SwiGLU activation
///
/// `FFN(x) = W2 · (SiLU(W1·x) ⊙ (W3·x))`, where `SiLU(x) = x · sigmoid(x)`.
pub struct FeedForward {
    pub w1: Linear, // Gate projection
    pub w2: Linear, // Down projection
    pub w3: Linear, // Up projection
}

impl FeedForward {
    pub fn new(w1: Linear, w2: Linear, w3: Linear) -> Self {
        Self { w1, w2, w3 }
    }

    /// Reads the normalized input from `state.xb` and writes the block output back into it.
    pub fn forward<S: TensorSource + ?Sized>(&self, source: &S, kernel: MatmulKernel, state: &mut RunState) {
        self.w1.forward(source, kernel, &mut state.hb, &state.xb);
        self.w3.forward(source, kernel, &mut state.hb2, &state.xb);

        swiglu(&mut state.hb, &state.hb2);

        self.w2.forward(source, kernel, &mut state.xb, &state.hb);
    }
}

/// `gate = SiLU(gate) * up`, elementwise.
#[inline]
pub fn swiglu(gate: &mut [f32], up: &[f32]) {
    gate.iter_mut().zip(up).for_each(|(gate_val, &up_val)| {
        let silu = *gate_val * (1.0f32 + (-*gate_val).exp()).recip();
        *gate_val = silu * up_val;
    });
}

impl std::fmt::Debug for FeedForward {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedForward")
            .field("hidden_dim", &self.w1.out_features)
            .field("w1", &self.w1)
            .field("w2", &self.w2)
            .field("w3", &self.w3)
            .finish()
    }
}

/// Transformer Block - one decoder layer: pre-norm attention and pre-norm FFN,
/// each wrapped in a residual connection.
pub struct TransformerBlock {
    pub attn_norm: RMSNorm,
    pub attention: MultiHeadAttention,
    pub ffn_norm: RMSNorm,
    pub feed_forward: FeedForward,
    pub layer_idx: usize,
}

impl TransformerBlock {
    pub fn forward<S: TensorSource + ?Sized>(
        &self,
        source: &S,
        kernel: MatmulKernel,
        pos: usize,
        state: &mut RunState,
    ) {
        // Attention block with residual connection
        self.attn_norm.forward(source, &mut state.xb, &state.x);
        self.attention.forward(source, kernel, pos, self.layer_idx, state);
        self.attention.wo.forward(source, kernel, &mut state.xb2, &state.xb);
        accumulate(&mut state.x, &state.xb2);

        // Feed-forward block with residual connection
        self.ffn_norm.forward(source, &mut state.xb, &state.x);
        self.feed_forward.forward(source, kernel, state);
        accumulate(&mut state.x, &state.xb);
    }
}

impl std::fmt::Debug for TransformerBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformerBlock")
            .field("layer_idx", &self.layer_idx)
            .field("attn_norm", &self.attn_norm)
            .field("attention", &self.attention)
            .field("ffn_norm", &self.ffn_norm)
            .field("feed_forward", &self.feed_forward)
            .finish()
    }
}

#[inline]
fn accumulate(x: &mut [f32], delta: &[f32]) {
    x.iter_mut().zip(delta).for_each(|(x_val, &d)| *x_val += d);
}

/// Runtime state for transformer inference.
///
/// All buffers are allocated once per session. The KV cache only grows with the
/// position; entries past the current position hold stale or zero data.
#[derive(Debug, Clone)]
pub struct RunState {
    /// Activation at the current time step
    /// Shape: [dim]
    pub x: Vec<f32>,

    /// Normalized input, and the concatenated attention heads inside the attention block
    /// Shape: [dim]
    pub xb: Vec<f32>,

    /// Projection output added back into `x`
    /// Shape: [dim]
    pub xb2: Vec<f32>,

    /// FFN gate buffer
    /// Shape: [hidden_dim]
    pub hb: Vec<f32>,

    /// FFN up buffer
    /// Shape: [hidden_dim]
    pub hb2: Vec<f32>,

    /// Query
    /// Shape: [dim]
    pub q: Vec<f32>,

    /// Key at the current position
    /// Shape: [kv_dim]
    pub k: Vec<f32>,

    /// Value at the current position
    /// Shape: [kv_dim]
    pub v: Vec<f32>,

    /// Attention scores
    /// Shape: [n_heads, seq_len]
    pub att: Vec<f32>,

    /// Output logits
    /// Shape: [vocab_size]
    pub logits: Vec<f32>,

    /// Keys: [n_layers][seq_len * kv_dim]
    pub key_cache: Vec<Vec<f32>>,
    /// Values: [n_layers][seq_len * kv_dim]
    pub value_cache: Vec<Vec<f32>>,

    /// Context window this state was sized for
    pub seq_len: usize,
}

impl RunState {
    /// Creates a new runtime state with pre-allocated buffers based on model configuration.
    pub fn new(config: &ModelConfig) -> Self {
        let ModelConfig { dim, hidden_dim, n_layers, n_heads, vocab_size, seq_len, .. } = *config;
        let kv_dim = config.kv_dim();

        Self {
            x: vec![0.0; dim],
            xb: vec![0.0; dim],
            xb2: vec![0.0; dim],
            hb: vec![0.0; hidden_dim],
            hb2: vec![0.0; hidden_dim],
            q: vec![0.0; dim],
            k: vec![0.0; kv_dim],
            v: vec![0.0; kv_dim],
            att: vec![0.0; n_heads * seq_len],
            logits: vec![0.0; vocab_size],
            key_cache: (0..n_layers).map(|_| vec![0.0; seq_len * kv_dim]).collect(),
            value_cache: (0..n_layers).map(|_| vec![0.0; seq_len * kv_dim]).collect(),
            seq_len,
        }
    }
}
