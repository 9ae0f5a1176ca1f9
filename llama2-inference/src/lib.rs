//! Llama 2 inference on the CPU.
//!
//! Loads a flat float32 checkpoint through a read-only memory mapping, runs the
//! transformer forward pass with rayon-parallel kernels, and samples text in either
//! completion or chat mode.

mod configuration;
mod error;
mod generation;
mod layers;
mod sampler;
mod tensor;
mod tokenizer;
mod transformer;
mod utils;

use anyhow::{Context, Result};
use log::{debug, warn};
use std::io::{self, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

pub use crate::configuration::ModelConfig;
pub use crate::error::LlamaError;
pub use crate::generation::{Generation, NoMoreTurns, TurnSource, chat, chat_streaming, generate, generate_streaming};
pub use crate::layers::{RunState, rmsnorm, softmax};
pub use crate::sampler::Sampler;
pub use crate::tensor::{MatmulKernel, matmul};
pub use crate::tokenizer::{BOS_TOKEN_ID, EOS_TOKEN_ID, Tokenizer, UNK_TOKEN_ID, printable};
pub use crate::transformer::{Transformer, TransformerBuilder, TransformerWeights, forward};

/// Default top-p used when the requested one is outside [0, 1].
const DEFAULT_TOPP: f32 = 0.9;

#[derive(Debug, Clone)]
pub struct InferenceConfig {
    pub checkpoint_path: String,
    pub tokenizer_path: String,
    pub temperature: f32,
    pub topp: f32,
    pub steps: usize,
    pub ctx_length: Option<usize>,
    pub mode: String,
    pub prompt: Option<String>,
    pub system_prompt: Option<String>,
    pub kernel: MatmulKernel,
    pub seed: u64,
}

impl InferenceConfig {
    pub fn builder() -> InferenceConfigBuilder {
        InferenceConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct InferenceConfigBuilder {
    checkpoint_path: Option<String>,
    tokenizer_path: Option<String>,
    temperature: Option<f32>,
    topp: Option<f32>,
    steps: Option<usize>,
    ctx_length: Option<usize>,
    mode: Option<String>,
    prompt: Option<String>,
    system_prompt: Option<String>,
    kernel: Option<MatmulKernel>,
    seed: Option<u64>,
}

impl InferenceConfigBuilder {
    pub fn checkpoint_path(mut self, path: Option<&String>) -> Self {
        self.checkpoint_path = path.cloned();
        self
    }
    pub fn tokenizer_path(mut self, path: Option<&String>) -> Self {
        self.tokenizer_path = path.cloned();
        self
    }
    pub fn temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }
    pub fn topp(mut self, topp: Option<f32>) -> Self {
        self.topp = topp;
        self
    }
    pub fn steps(mut self, steps: Option<usize>) -> Self {
        self.steps = steps;
        self
    }
    pub fn ctx_length(mut self, ctx_length: Option<usize>) -> Self {
        self.ctx_length = ctx_length;
        self
    }
    pub fn mode(mut self, mode: Option<&String>) -> Self {
        self.mode = mode.cloned();
        self
    }
    pub fn prompt(mut self, prompt: Option<&String>) -> Self {
        self.prompt = prompt.cloned();
        self
    }
    pub fn system_prompt(mut self, system_prompt: Option<&String>) -> Self {
        self.system_prompt = system_prompt.cloned();
        self
    }
    pub fn kernel(mut self, kernel: Option<MatmulKernel>) -> Self {
        self.kernel = kernel;
        self
    }
    pub fn seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }
    pub fn build(self) -> Result<InferenceConfig, String> {
        Ok(InferenceConfig {
            checkpoint_path: self.checkpoint_path.ok_or("checkpoint_path is required")?,
            tokenizer_path: self.tokenizer_path.unwrap_or_else(|| "tokenizer.bin".to_string()),
            temperature: self.temperature.unwrap_or(1.0),
            topp: self.topp.unwrap_or(DEFAULT_TOPP),
            steps: self.steps.unwrap_or(256),
            ctx_length: self.ctx_length,
            mode: self.mode.unwrap_or_else(|| "generate".to_string()),
            prompt: self.prompt,
            system_prompt: self.system_prompt,
            kernel: self.kernel.unwrap_or_default(),
            seed: self.seed.filter(|&seed| seed != 0).unwrap_or_else(time_seed),
        })
    }
}

/// Current wall-clock time in milliseconds, never 0.
fn time_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
        .max(1)
}

/// Memory-maps a checkpoint and builds a transformer session with default options.
pub fn load_model<P: AsRef<Path>>(checkpoint_path: P) -> Result<Transformer, LlamaError> {
    TransformerBuilder::new(checkpoint_path).build()
}

/// Loads `vocab_size` tokens from a tokenizer file.
pub fn load_tokenizer<P: AsRef<Path>>(path: P, vocab_size: usize) -> Result<Tokenizer, LlamaError> {
    Tokenizer::new(path, vocab_size)
}

/// Creates a sampler, replacing out-of-range parameters with usable defaults:
/// negative temperature becomes 0 (greedy), top-p outside [0, 1] becomes 0.9 and a zero
/// seed is replaced by the current time.
pub fn make_sampler(vocab_size: usize, temperature: f32, topp: f32, seed: u64) -> Sampler {
    let temperature = if temperature < 0.0 {
        warn!("temperature {temperature} is negative, using greedy decoding");
        0.0
    } else {
        temperature
    };

    let topp = if (0.0..=1.0).contains(&topp) {
        topp
    } else {
        warn!("top-p {topp} is outside [0, 1], using {DEFAULT_TOPP}");
        DEFAULT_TOPP
    };

    let seed = if seed == 0 { time_seed() } else { seed };

    Sampler::new(vocab_size, temperature, topp, seed)
}

/// Runs inference, streaming the generated text to stdout.
///
/// Chat turns after the first one are read from `turns`.
pub fn run_inference(inference_config: InferenceConfig, turns: &mut dyn TurnSource) -> Result<()> {
    debug!("{inference_config:#?}");

    let mut transformer = TransformerBuilder::new(&inference_config.checkpoint_path)
        .with_ctx_length(inference_config.ctx_length)
        .with_kernel(inference_config.kernel)
        .build()
        .with_context(|| format!("Failed to load checkpoint: {}", inference_config.checkpoint_path))?;

    debug!("{transformer:#?}");

    let vocab_size = transformer.get_config().vocab_size;

    let tokenizer = load_tokenizer(&inference_config.tokenizer_path, vocab_size)
        .with_context(|| format!("Failed to load tokenizer: {}", inference_config.tokenizer_path))?;

    debug!("{tokenizer:#?}");

    let mut sampler = make_sampler(vocab_size, inference_config.temperature, inference_config.topp, inference_config.seed);

    let prompt = inference_config.prompt.as_deref();
    let system_prompt = inference_config.system_prompt.as_deref();
    let steps = inference_config.steps;

    let mut stdout = io::stdout();
    let print_piece = |piece: &str| {
        // a closed stdout must not abort generation
        let _ = write!(stdout, "{piece}").and_then(|_| stdout.flush());
    };

    let report = match inference_config.mode.as_str() {
        "generate" => generate_streaming(&mut transformer, &tokenizer, &mut sampler, prompt, steps, print_piece)?
            .throughput_report(),
        "chat" => {
            chat_streaming(&mut transformer, &tokenizer, &mut sampler, prompt, system_prompt, steps, turns, print_piece)?;
            None
        }
        _ => anyhow::bail!("Unknown mode: {}", inference_config.mode),
    };

    println!();
    if let Some(report) = report {
        println!("{report}");
    }
    Ok(())
}
