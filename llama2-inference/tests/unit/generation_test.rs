//! Tests for the completion and chat drivers
//!
//! The fixture model has an identity embedding, all-zero decoder layers and a separate
//! classifier wired so that greedy decoding follows a fixed successor table.

use super::*;
use crate::transformer::TransformerBuilder;
use anyhow::Result;
use byteorder::{LittleEndian, WriteBytesExt};
use std::path::PathBuf;
use tempfile::TempDir;

const VOCAB: [&str; 32] = [
    "<unk>", "<s>", "</s>", " ", "[", "I", "N", "S", "T", "]", "/", "h", "i", "o", "k", "<", ">", "Y", "\n", "a", "b",
    "c", "\u{7}", "<0x41>", "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7",
];

/// Greedy successor of each token; unlisted tokens are followed by `<unk>`.
const SUCCESSORS: [(usize, usize); 8] = [
    (BOS_TOKEN_ID, 19), // <s> -> a
    (19, 20),           // a -> b
    (20, 21),           // b -> c
    (21, BOS_TOKEN_ID), // c -> <s>
    (22, 23),           // bell -> <0x41>
    (23, BOS_TOKEN_ID), // <0x41> -> <s>
    (9, 13),            // ] -> o
    (13, 14),           // o -> k
];

const SEQ_LEN: usize = 96;

struct Fixture {
    _temp_dir: TempDir,
    transformer: Transformer,
    tokenizer: Tokenizer,
}

fn write_successor_model(temp_dir: &TempDir) -> Result<PathBuf> {
    const DIM: usize = 32;
    const HIDDEN_DIM: usize = 8;
    let head_size = DIM / 2;

    let embedding = DIM * DIM;
    let layer = 2 * DIM + 4 * DIM * DIM + 3 * DIM * HIDDEN_DIM;
    let final_norm = embedding + layer;
    let rope = final_norm + DIM;
    let classifier = rope + SEQ_LEN * head_size;
    let total = classifier + DIM * DIM;

    let mut successor = vec![None; DIM];
    for (token, next) in SUCCESSORS {
        successor[token] = Some(next);
    }
    successor[14] = Some(EOS_TOKEN_ID); // k -> </s>

    let mut bytes = Vec::new();
    for value in [DIM as i32, HIDDEN_DIM as i32, 1, 2, 2, -(DIM as i32), SEQ_LEN as i32] {
        bytes.write_i32::<LittleEndian>(value)?;
    }

    for i in 0..total {
        let value = if i < embedding {
            (i / DIM == i % DIM) as u8 as f32
        } else if (final_norm..rope).contains(&i) {
            1.0
        } else if i >= classifier {
            let (row, slot) = ((i - classifier) / DIM, (i - classifier) % DIM);
            (successor[slot] == Some(row)) as u8 as f32
        } else {
            0.0
        };
        bytes.write_f32::<LittleEndian>(value)?;
    }

    let path = temp_dir.path().join("model.bin");
    std::fs::write(&path, bytes)?;
    Ok(path)
}

fn fixture() -> Result<Fixture> {
    let temp_dir = TempDir::new()?;
    let transformer = TransformerBuilder::new(write_successor_model(&temp_dir)?).build()?;
    let tokenizer = Tokenizer::from_vocab(VOCAB.iter().map(|piece| piece.to_string()).collect(), vec![0.0; VOCAB.len()]);

    Ok(Fixture { _temp_dir: temp_dir, transformer, tokenizer })
}

fn greedy() -> Sampler {
    Sampler::new(VOCAB.len(), 0.0, 0.9, 1)
}

/// Replays scripted turns, then ends the conversation.
struct ScriptedTurns {
    system: Option<String>,
    users: Vec<String>,
    system_asked: usize,
}

impl ScriptedTurns {
    fn new(system: Option<&str>, users: &[&str]) -> Self {
        Self { system: system.map(str::to_owned), users: users.iter().rev().map(|s| s.to_string()).collect(), system_asked: 0 }
    }
}

impl TurnSource for ScriptedTurns {
    fn system_prompt(&mut self) -> Option<String> {
        self.system_asked += 1;
        self.system.take()
    }

    fn user_prompt(&mut self) -> Option<String> {
        self.users.pop()
    }
}

#[test]
fn test_generate_follows_prompt_then_samples_until_bos() -> Result<()> {
    let Fixture { mut transformer, tokenizer, .. } = fixture()?;

    let text = generate(&mut transformer, &tokenizer, &mut greedy(), Some("a"), 32)?;

    assert_eq!(text, "abc");
    Ok(())
}

#[test]
fn test_generate_without_prompt_starts_from_bos() -> Result<()> {
    let Fixture { mut transformer, tokenizer, .. } = fixture()?;

    let text = generate(&mut transformer, &tokenizer, &mut greedy(), None, 0)?;

    assert_eq!(text, "abc");
    Ok(())
}

#[test]
fn test_generate_respects_step_budget() -> Result<()> {
    let Fixture { mut transformer, tokenizer, .. } = fixture()?;

    // positions 0..3: BOS -> " ", " " -> "a", "a" -> "b"
    let text = generate(&mut transformer, &tokenizer, &mut greedy(), Some("a"), 3)?;

    assert_eq!(text, "ab");
    Ok(())
}

#[test]
fn test_generate_streams_printable_pieces() -> Result<()> {
    let Fixture { mut transformer, tokenizer, .. } = fixture()?;

    let mut pieces = Vec::new();
    let generation = generate_streaming(&mut transformer, &tokenizer, &mut greedy(), Some("\u{7}"), 32, |piece| {
        pieces.push(piece.to_string())
    })?;

    // the bell is dropped, the byte piece decodes to its character
    assert_eq!(pieces, vec!["A"]);
    assert_eq!(generation.text, "A");

    Ok(())
}

#[test]
fn test_generation_reports_throughput_only_with_enough_tokens() -> Result<()> {
    let Fixture { mut transformer, tokenizer, .. } = fixture()?;

    let short = generate_streaming(&mut transformer, &tokenizer, &mut greedy(), Some("a"), 1, |_| {})?;
    assert_eq!(short.tokens_per_second, None);
    assert_eq!(short.throughput_report(), None);

    let mut session = transformer.new_session();
    let full = generate_streaming(&mut session, &tokenizer, &mut greedy(), Some("a"), 32, |_| {})?;
    assert!(full.tokens_per_second.is_none_or(|tps| tps > 0.0));

    Ok(())
}

#[test]
fn test_throughput_report() {
    let generation = Generation { text: "abc".to_string(), tokens_per_second: Some(12.5) };
    assert_eq!(generation.throughput_report().as_deref(), Some("achieved tok/s: 12.50"));

    let generation = Generation { text: String::new(), tokens_per_second: None };
    assert_eq!(generation.throughput_report(), None);
}

#[test]
fn test_chat_single_turn() -> Result<()> {
    let Fixture { mut transformer, tokenizer, .. } = fixture()?;

    let text = chat(&mut transformer, &tokenizer, &mut greedy(), Some("hi"), None, 0)?;

    assert_eq!(text, "Assistant: ok\n");
    Ok(())
}

#[test]
fn test_chat_with_system_prompt() -> Result<()> {
    let Fixture { mut transformer, tokenizer, .. } = fixture()?;

    let text = chat(&mut transformer, &tokenizer, &mut greedy(), Some("hi"), Some("o"), 0)?;

    assert_eq!(text, "Assistant: ok\n");
    Ok(())
}

#[test]
fn test_chat_pulls_following_turns() -> Result<()> {
    let Fixture { mut transformer, tokenizer, .. } = fixture()?;
    let mut turns = ScriptedTurns::new(Some("o"), &["hi"]);

    let mut streamed = String::new();
    let text = chat_streaming(&mut transformer, &tokenizer, &mut greedy(), Some("hi"), None, 0, &mut turns, |piece| {
        streamed.push_str(piece)
    })?;

    assert_eq!(text, "Assistant: ok\nAssistant: ok\n");
    assert_eq!(streamed, text);
    // the system prompt is only asked for at the start of the dialog
    assert_eq!(turns.system_asked, 1);
    assert!(turns.users.is_empty());

    Ok(())
}

#[test]
fn test_chat_without_user_prompt_asks_turn_source() -> Result<()> {
    let Fixture { mut transformer, tokenizer, .. } = fixture()?;

    let text = chat(&mut transformer, &tokenizer, &mut greedy(), None, None, 0)?;
    assert!(text.is_empty());

    let mut turns = ScriptedTurns::new(None, &["hi"]);
    let mut session = transformer.new_session();
    let text = chat_streaming(&mut session, &tokenizer, &mut greedy(), None, None, 0, &mut turns, |_| {})?;
    assert_eq!(text, "Assistant: ok\n");

    Ok(())
}

#[test]
fn test_chat_stops_at_step_budget() -> Result<()> {
    let Fixture { mut transformer, tokenizer, .. } = fixture()?;

    // BOS, dummy prefix and "[INST] hi [/INST]" take all 19 positions, the last one samples "o"
    let text = chat(&mut transformer, &tokenizer, &mut greedy(), Some("hi"), None, 19)?;
    assert_eq!(text, "Assistant: o");

    Ok(())
}

#[test]
fn test_render_prompt() {
    assert_eq!(render_prompt(0, None, "hi"), "[INST] hi [/INST]");
    assert_eq!(render_prompt(0, Some(""), "hi"), "[INST] hi [/INST]");
    assert_eq!(render_prompt(0, Some("be brief"), "hi"), "[INST] <<SYS>>\nbe brief\n<</SYS>>\n\nhi [/INST]");
    // the system block only opens the dialog
    assert_eq!(render_prompt(12, Some("be brief"), "hi"), "[INST] hi [/INST]");
}

#[test]
fn test_clamp_steps() {
    assert_eq!(clamp_steps(0, 64), 64);
    assert_eq!(clamp_steps(100, 64), 64);
    assert_eq!(clamp_steps(10, 64), 10);
}
