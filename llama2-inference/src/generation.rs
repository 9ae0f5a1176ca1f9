#[cfg(test)]
#[path = "../tests/unit/generation_test.rs"]
mod generation_test;

use crate::error::Result;
use crate::sampler::Sampler;
use crate::tokenizer::{BOS_TOKEN_ID, EOS_TOKEN_ID, Tokenizer, printable};
use crate::transformer::Transformer;
use log::debug;
use std::time::Instant;

/// Result of a completion run.
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    /// Measured from the end of the first step, `None` when too few steps ran.
    pub tokens_per_second: Option<f64>,
}

impl Generation {
    /// Throughput line printed after a completion, if it was measured.
    pub fn throughput_report(&self) -> Option<String> {
        self.tokens_per_second.map(|tps| format!("achieved tok/s: {tps:.2}"))
    }
}

/// Supplies chat turns that were not given up front.
pub trait TurnSource {
    /// Asked once, at position 0, when no system prompt was passed in.
    fn system_prompt(&mut self) -> Option<String> {
        None
    }

    /// Next user message; `None` ends the conversation.
    fn user_prompt(&mut self) -> Option<String>;
}

/// Turn source for one-shot chats: every follow-up turn ends the conversation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMoreTurns;

impl TurnSource for NoMoreTurns {
    fn user_prompt(&mut self) -> Option<String> {
        None
    }
}

/// Runs a completion and returns the generated text.
pub fn generate(
    transformer: &mut Transformer,
    tokenizer: &Tokenizer,
    sampler: &mut Sampler,
    prompt: Option<&str>,
    max_steps: usize,
) -> Result<String> {
    generate_streaming(transformer, tokenizer, sampler, prompt, max_steps, |_| {}).map(|generation| generation.text)
}

/// Runs a completion, passing every printable piece to `on_piece` as soon as it is decoded.
///
/// The prompt is forced token by token; afterwards tokens are sampled until BOS is
/// produced or `max_steps` positions (capped by the context window) were used.
pub fn generate_streaming<F: FnMut(&str)>(
    transformer: &mut Transformer,
    tokenizer: &Tokenizer,
    sampler: &mut Sampler,
    prompt: Option<&str>,
    max_steps: usize,
    on_piece: F,
) -> Result<Generation> {
    let steps = clamp_steps(max_steps, transformer.config.seq_len);
    let prompt_tokens = tokenizer.encode(prompt.unwrap_or(""), true, false)?;
    debug!("prompt tokens: {prompt_tokens:?}");

    let mut output = Output::new(on_piece);
    let mut state = GenerationState::new(prompt_tokens[0]);

    while state.pos < steps {
        let logits = transformer.forward(state.token, state.pos);

        let next_token = if state.pos + 1 < prompt_tokens.len() {
            // Still processing prompt tokens
            prompt_tokens[state.pos + 1]
        } else {
            sampler.sample(logits)
        };

        // BOS delimits sequences
        if next_token == BOS_TOKEN_ID {
            break;
        }

        output.emit(printable(&tokenizer.decode(state.token, next_token)));
        state.advance(next_token);
        state.metrics.tick();
    }

    let tokens_per_second = state.metrics.report_and_reset();

    Ok(Generation { text: output.text, tokens_per_second })
}

/// Runs a one-shot chat: a single user turn (with optional system prompt) and the
/// assistant's answer.
pub fn chat(
    transformer: &mut Transformer,
    tokenizer: &Tokenizer,
    sampler: &mut Sampler,
    user_prompt: Option<&str>,
    system_prompt: Option<&str>,
    max_steps: usize,
) -> Result<String> {
    chat_streaming(transformer, tokenizer, sampler, user_prompt, system_prompt, max_steps, &mut NoMoreTurns, |_| {})
}

/// Runs a Llama 2 chat dialog.
///
/// User turns are rendered into the `[INST]` schema and forced into the model; the
/// assistant then samples until it produces EOS, which hands the dialog back to the
/// user. Turns after the first are pulled from `turns`. The dialog stops when the step
/// budget is spent or `turns` has nothing more to say.
#[allow(clippy::too_many_arguments)]
pub fn chat_streaming<F: FnMut(&str)>(
    transformer: &mut Transformer,
    tokenizer: &Tokenizer,
    sampler: &mut Sampler,
    user_prompt: Option<&str>,
    system_prompt: Option<&str>,
    max_steps: usize,
    turns: &mut dyn TurnSource,
    on_piece: F,
) -> Result<String> {
    let steps = clamp_steps(max_steps, transformer.config.seq_len);

    let mut output = Output::new(on_piece);
    let mut metrics = TokenMetrics::new();
    let mut system_prompt = system_prompt.map(str::to_owned);
    let mut prompt_tokens: Vec<usize> = Vec::new();
    let mut user_idx = 0;
    let mut user_turn = true;
    let mut next_token = 0;
    let mut pos = 0;

    while pos < steps {
        if user_turn {
            if pos == 0 && system_prompt.is_none() {
                system_prompt = turns.system_prompt();
            }

            let message = match user_prompt {
                Some(prompt) if pos == 0 => prompt.to_owned(),
                _ => match turns.user_prompt() {
                    Some(prompt) => prompt,
                    None => break,
                },
            };

            let rendered_prompt = render_prompt(pos, system_prompt.as_deref(), &message);
            prompt_tokens = tokenizer.encode(rendered_prompt.as_str(), true, false)?;
            debug!("rendered prompt {rendered_prompt:?} -> {} tokens", prompt_tokens.len());

            user_idx = 0;
            user_turn = false;
            output.emit("Assistant: ");
        }

        let token = if user_idx < prompt_tokens.len() {
            // force the prompt
            user_idx += 1;
            prompt_tokens[user_idx - 1]
        } else {
            next_token
        };

        // EOS ends the assistant turn
        if token == EOS_TOKEN_ID {
            user_turn = true;
        }

        let logits = transformer.forward(token, pos);
        next_token = sampler.sample(logits);
        pos += 1;

        // the model has seen EOS; whatever it sampled is replaced by the next user turn
        if user_turn {
            continue;
        }

        // nothing is shown while the prompt is being forced
        if user_idx < prompt_tokens.len() {
            continue;
        }

        if next_token == EOS_TOKEN_ID {
            output.emit("\n");
            metrics.report_and_reset();
        } else {
            output.emit(printable(&tokenizer.decode(token, next_token)));
            metrics.tick();
        }
    }

    metrics.report_and_reset();
    Ok(output.text)
}

/// Caps the step budget at the context window; 0 means "use the whole window".
fn clamp_steps(max_steps: usize, seq_len: usize) -> usize {
    if max_steps == 0 || max_steps > seq_len { seq_len } else { max_steps }
}

/// Renders a user message into the Llama 2 chat schema; the system block is only
/// emitted for the first turn.
fn render_prompt(pos: usize, system_prompt: Option<&str>, user_prompt: &str) -> String {
    match system_prompt.filter(|system| !system.is_empty()) {
        Some(system) if pos == 0 => format!("[INST] <<SYS>>\n{system}\n<</SYS>>\n\n{user_prompt} [/INST]"),
        _ => format!("[INST] {user_prompt} [/INST]"),
    }
}

/// Accumulates the generated text and forwards every piece to a sink.
struct Output<F: FnMut(&str)> {
    text: String,
    sink: F,
}

impl<F: FnMut(&str)> Output<F> {
    fn new(sink: F) -> Self {
        Self { text: String::new(), sink }
    }

    fn emit(&mut self, piece: &str) {
        if piece.is_empty() {
            return;
        }
        self.text.push_str(piece);
        (self.sink)(piece);
    }
}

/// Tracks token generation throughput.
///
/// The clock starts at the first tick since the first step is usually slower.
struct TokenMetrics {
    start_time: Option<Instant>,
    generated_count: usize,
}

impl TokenMetrics {
    fn new() -> Self {
        Self { start_time: None, generated_count: 0 }
    }

    fn tick(&mut self) {
        match self.start_time {
            None => self.start_time = Some(Instant::now()),
            Some(_) => self.generated_count += 1,
        }
    }

    fn report_and_reset(&mut self) -> Option<f64> {
        let tokens_per_second = self.start_time.take().and_then(|start_time| {
            let duration = start_time.elapsed().as_secs_f64();
            (self.generated_count > 0 && duration > 0.0).then(|| {
                let tps = self.generated_count as f64 / duration;
                debug!("achieved tok/s: {tps:.2} ({} tokens in {duration:.2}s)", self.generated_count);
                tps
            })
        });
        self.generated_count = 0;
        tokens_per_second
    }
}

/// Position and current token of a completion run.
struct GenerationState {
    pos: usize,
    token: usize,
    metrics: TokenMetrics,
}

impl GenerationState {
    fn new(initial_token: usize) -> Self {
        Self { pos: 0, token: initial_token, metrics: TokenMetrics::new() }
    }

    fn advance(&mut self, next_token: usize) {
        self.token = next_token;
        self.pos += 1;
    }
}
