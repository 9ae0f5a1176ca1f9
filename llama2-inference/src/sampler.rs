#[cfg(test)]
#[path = "../tests/unit/sampler_test.rs"]
mod sampler_test;

use crate::layers::softmax;

/// Temperature / top-p sampler for language model logits.
///
/// Implements greedy decoding, multinomial sampling and nucleus (top-p) sampling,
/// driven by a xorshift RNG so runs are reproducible for a given seed.
#[derive(Debug)]
pub struct Sampler {
    pub vocab_size: usize,
    pub temperature: f32,
    pub topp: f32,
    pub rng_state: u64,
    /// Scratch buffer of token indices reused by nucleus sampling.
    indices: Vec<usize>,
}

impl Sampler {
    /// Creates a new sampler with the given vocabulary size, temperature, top-p, and RNG seed.
    ///
    /// # Arguments
    /// * `vocab_size` - Size of the vocabulary
    /// * `temperature` - 0.0 for greedy decoding, 1.0 leaves the logits untouched
    /// * `topp` - Nucleus threshold; values outside (0, 1) disable top-p
    /// * `rng_seed` - Initial RNG state, must be non-zero
    pub fn new(vocab_size: usize, temperature: f32, topp: f32, rng_seed: u64) -> Self {
        debug_assert!(rng_seed != 0, "xorshift is stuck at a zero state");

        Self { vocab_size, temperature, topp, rng_state: rng_seed, indices: vec![0; vocab_size] }
    }

    /// Xorshift-based random number generator.
    pub(crate) fn random_u32(&mut self) -> u32 {
        self.rng_state ^= self.rng_state >> 12;
        self.rng_state ^= self.rng_state << 25;
        self.rng_state ^= self.rng_state >> 27;
        ((self.rng_state.wrapping_mul(0x2545F4914F6CDD1D)) >> 32) as u32
    }

    /// Returns a random float in [0, 1).
    pub(crate) fn random_f32(&mut self) -> f32 {
        (self.random_u32() >> 8) as f32 / 16777216.0
    }

    /// Returns the index of the maximum logit; the first one wins on ties.
    fn sample_argmax(logits: &[f32]) -> usize {
        let mut max_idx = 0;
        for (i, &value) in logits.iter().enumerate().skip(1) {
            if value > logits[max_idx] {
                max_idx = i;
            }
        }
        max_idx
    }

    /// Multinomial sampling from a probability distribution.
    fn sample_mult(probs: &[f32], coin: f32) -> usize {
        let mut cdf = 0.0;
        for (i, &prob) in probs.iter().enumerate() {
            cdf += prob;
            if coin < cdf {
                return i;
            }
        }
        probs.len().saturating_sub(1) // in case of rounding errors
    }

    /// Top-p (nucleus) sampling: sample from the smallest set of tokens whose cumulative
    /// probability exceeds `topp`.
    ///
    /// Tokens below `(1 - topp) / (n - 1)` can never be part of that set, so they are moved
    /// to the tail of the index buffer. The remaining candidates form a max-heap that is
    /// popped only until the threshold is crossed.
    fn sample_topp(&mut self, probs: &[f32], coin: f32) -> usize {
        let n = probs.len();
        let indices = &mut self.indices[..n];
        let cutoff = (1.0 - self.topp) / n.saturating_sub(1).max(1) as f32;

        let mut head = 0;
        let mut tail = n;
        for (i, &prob) in probs.iter().enumerate() {
            if prob >= cutoff {
                indices[head] = i;
                head += 1;
            } else {
                tail -= 1;
                indices[tail] = i;
            }
        }

        // With a tiny topp the cutoff can exceed every probability; keep everything then.
        let n0 = if head == 0 { n } else { head };

        for i in (0..n0 / 2).rev() {
            sift_down(indices, i, n0, probs);
        }

        // pop maxima to the back of the candidate range until topp is exceeded
        let mut cumulative_prob = 0.0f32;
        let mut last_idx = 0;
        for i in (0..n0).rev() {
            indices.swap(0, i);
            cumulative_prob += probs[indices[i]];
            last_idx = i;
            if cumulative_prob > self.topp {
                break;
            }
            sift_down(indices, 0, i, probs);
        }

        // sample from the popped elements, most probable first
        let r = coin * cumulative_prob;
        let mut cdf = 0.0f32;
        for i in (last_idx..n0).rev() {
            cdf += probs[indices[i]];
            if r < cdf {
                return indices[i];
            }
        }
        indices[last_idx] // in case of rounding errors
    }

    /// Samples a token index from logits using temperature and top-p.
    ///
    /// - If temperature is 0, returns the argmax (greedy).
    /// - Otherwise scales by temperature, applies softmax in place and samples.
    pub fn sample(&mut self, logits: &mut [f32]) -> usize {
        let n = self.vocab_size.min(logits.len());
        let logits = &mut logits[..n];

        if self.temperature == 0.0 {
            return Self::sample_argmax(logits);
        }

        for logit in logits.iter_mut() {
            *logit /= self.temperature;
        }

        softmax(logits);

        let coin = self.random_f32();

        if self.topp <= 0.0 || self.topp >= 1.0 {
            Self::sample_mult(logits, coin)
        } else {
            self.sample_topp(logits, coin)
        }
    }
}

/// Restores the max-heap property (by probability) for the subtree at `from` within `heap[..len]`.
fn sift_down(heap: &mut [usize], from: usize, len: usize, probs: &[f32]) {
    let mut parent = from;
    loop {
        let left = 2 * parent + 1;
        if left >= len {
            break;
        }

        let right = left + 1;
        let mut child = left;
        if right < len && probs[heap[right]] > probs[heap[left]] {
            child = right;
        }

        if probs[heap[child]] > probs[heap[parent]] {
            heap.swap(parent, child);
            parent = child;
        } else {
            break;
        }
    }
}
