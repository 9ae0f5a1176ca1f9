//! Tokenizer for sentencepiece-style BPE vocabularies.
//!
//! - Loads token pieces and merge scores from a binary file.
//! - Encodes text into code point tokens (with byte fallback), then applies greedy BPE merges.
//! - Decodes token pairs back into text fragments, expanding raw byte tokens.

#[cfg(test)]
#[path = "../tests/unit/tokenizer_test.rs"]
mod tokenizer_test;

use crate::error::{LlamaError, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use std::borrow::Cow;
use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::OnceLock;

/// Unknown token ID.
pub const UNK_TOKEN_ID: usize = 0;
/// Beginning-of-sequence token ID.
pub const BOS_TOKEN_ID: usize = 1;
/// End-of-sequence token ID.
pub const EOS_TOKEN_ID: usize = 2;
/// Raw byte `b` is encoded as token `b + BYTE_TOKEN_OFFSET` (after unk, bos and eos).
const BYTE_TOKEN_OFFSET: usize = 3;

/// Tokenizer for byte-fallback BPE models.
pub struct Tokenizer {
    /// Vocabulary: token id -> piece
    pub vocab: Vec<String>,
    /// Merge scores for BPE merges (higher is better)
    pub vocab_scores: Vec<f32>,
    /// Reverse index piece -> token id, built on the first encode
    sorted_vocab: OnceLock<HashMap<String, usize>>,
}

impl Tokenizer {
    /// Loads a tokenizer file holding `vocab_size` records of
    /// `{f32 score}{i32 length}{length bytes}`.
    pub fn new<P: AsRef<Path>>(path: P, vocab_size: usize) -> Result<Self> {
        let data = std::fs::read(path)?;
        Self::from_bytes(&data, vocab_size)
    }

    /// Parses the tokenizer records from an in-memory buffer.
    pub fn from_bytes(data: &[u8], vocab_size: usize) -> Result<Self> {
        let mut reader = Cursor::new(data);

        let mut vocab = Vec::with_capacity(vocab_size);
        let mut vocab_scores = Vec::with_capacity(vocab_size);

        for i in 0..vocab_size {
            let score = reader
                .read_f32::<LittleEndian>()
                .map_err(|_| LlamaError::InvalidVocabulary(format!("truncated score of token {i}")))?;

            let len = reader
                .read_i32::<LittleEndian>()
                .map_err(|_| LlamaError::InvalidVocabulary(format!("truncated length of token {i}")))?;

            let remaining = data.len() - reader.position() as usize;
            let len = usize::try_from(len)
                .ok()
                .filter(|&len| len <= remaining)
                .ok_or_else(|| {
                    LlamaError::InvalidVocabulary(format!(
                        "token {i} declares {len} bytes, {remaining} remaining"
                    ))
                })?;

            let mut token_bytes = vec![0u8; len];
            reader.read_exact(&mut token_bytes)?;

            vocab.push(String::from_utf8_lossy(&token_bytes).into_owned());
            vocab_scores.push(score);
        }

        Ok(Self { vocab, vocab_scores, sorted_vocab: OnceLock::new() })
    }

    /// Builds a tokenizer directly from pieces and scores.
    pub fn from_vocab(vocab: Vec<String>, vocab_scores: Vec<f32>) -> Self {
        debug_assert_eq!(vocab.len(), vocab_scores.len());
        Self { vocab, vocab_scores, sorted_vocab: OnceLock::new() }
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    /// Decodes `token` given the token that preceded it.
    ///
    /// A leading space is stripped right after BOS, and raw byte pieces such as `<0x0A>`
    /// become the single character with that byte value.
    pub fn decode(&self, prev_token: usize, token: usize) -> Cow<'_, str> {
        let Some(piece) = self.vocab.get(token) else {
            return Cow::Borrowed("");
        };

        let piece = match piece.strip_prefix(' ') {
            Some(stripped) if prev_token == BOS_TOKEN_ID => stripped,
            _ => piece.as_str(),
        };

        match parse_byte_piece(piece) {
            Some(byte) => Cow::Owned(char::from(byte).to_string()),
            None => Cow::Borrowed(piece),
        }
    }

    /// Looks up a string in the vocabulary and returns its token ID, if present.
    fn str_lookup(&self, s: &str) -> Option<usize> {
        self.sorted_vocab().get(s).copied()
    }

    fn sorted_vocab(&self) -> &HashMap<String, usize> {
        self.sorted_vocab.get_or_init(|| {
            let mut index = HashMap::with_capacity(self.vocab.len());
            // duplicated pieces resolve to their lowest id
            for (id, piece) in self.vocab.iter().enumerate() {
                index.entry(piece.clone()).or_insert(id);
            }
            index
        })
    }

    /// Encodes a string into a sequence of token IDs using BPE.
    ///
    /// 1. Optional BOS, then a dummy-prefix space token when `text` is non-empty.
    /// 2. One token per code point, or one byte token per UTF-8 byte when the code point
    ///    has no piece of its own.
    /// 3. Repeatedly merges the adjacent pair whose concatenation has the highest score
    ///    (leftmost on ties) until no pair forms a known piece.
    /// 4. Optional EOS.
    ///
    /// `None` text, and BOS or EOS requested from a vocabulary too small to hold them, are
    /// rejected with [`LlamaError::InvalidInput`].
    pub fn encode<'t>(&self, text: impl Into<Option<&'t str>>, bos: bool, eos: bool) -> Result<Vec<usize>> {
        let text = text.into().ok_or_else(|| LlamaError::InvalidInput("cannot encode absent text".into()))?;

        for (wanted, id, name) in [(bos, BOS_TOKEN_ID, "BOS"), (eos, EOS_TOKEN_ID, "EOS")] {
            if wanted && id >= self.vocab.len() {
                return Err(LlamaError::InvalidInput(format!(
                    "{name} token {id} is outside a vocabulary of {}",
                    self.vocab.len()
                )));
            }
        }

        let mut tokens = Vec::with_capacity(text.len() * 2 + 3);

        if bos {
            tokens.push(BOS_TOKEN_ID);
        }

        // The dummy prefix mirrors sentencepiece's add_dummy_prefix; it is not correct for
        // every input but is kept for compatibility with the exported vocabularies.
        if !text.is_empty() {
            if let Some(dummy_prefix) = self.str_lookup(" ") {
                tokens.push(dummy_prefix);
            }
        }

        let mut buf = [0u8; 4];
        for c in text.chars() {
            let code_point = c.encode_utf8(&mut buf);
            match self.str_lookup(code_point) {
                Some(id) => tokens.push(id),
                None => {
                    for &byte in code_point.as_bytes() {
                        let id = byte as usize + BYTE_TOKEN_OFFSET;
                        if id >= self.vocab.len() {
                            return Err(LlamaError::InvalidInput(format!(
                                "byte {byte:#04x} of {c:?} has no token in a vocabulary of {}",
                                self.vocab.len()
                            )));
                        }
                        tokens.push(id);
                    }
                }
            }
        }

        self.merge_pairs(&mut tokens);

        if eos {
            tokens.push(EOS_TOKEN_ID);
        }

        Ok(tokens)
    }

    /// Greedy BPE: merges the best scoring adjacent pair until none is in the vocabulary.
    ///
    /// Returns the number of merges performed; each one shortens `tokens` by exactly one.
    fn merge_pairs(&self, tokens: &mut Vec<usize>) -> usize {
        let mut merged = String::new();
        let mut merges = 0;

        loop {
            let mut best: Option<(f32, usize, usize)> = None; // (score, id, position)

            for (idx, pair) in tokens.windows(2).enumerate() {
                let (Some(left), Some(right)) = (self.vocab.get(pair[0]), self.vocab.get(pair[1])) else {
                    continue;
                };
                merged.clear();
                merged.push_str(left);
                merged.push_str(right);

                if let Some(id) = self.str_lookup(&merged) {
                    let score = self.vocab_scores[id];
                    if best.is_none_or(|(best_score, ..)| score > best_score) {
                        best = Some((score, id, idx));
                    }
                }
            }

            let Some((_, id, idx)) = best else {
                break;
            };

            tokens[idx] = id;
            tokens.remove(idx + 1);
            merges += 1;
        }

        merges
    }
}

impl std::fmt::Debug for Tokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let special = |id: usize| (id, self.vocab.get(id).map(String::as_str).unwrap_or_default());

        f.debug_struct("Tokenizer")
            .field("vocab_size", &self.vocab.len())
            .field("unk_token", &special(UNK_TOKEN_ID))
            .field("bos_token", &special(BOS_TOKEN_ID))
            .field("eos_token", &special(EOS_TOKEN_ID))
            .field("index_built", &self.sorted_vocab.get().is_some())
            .finish_non_exhaustive()
    }
}

/// Parses pieces of the exact form `<0xHH>`.
fn parse_byte_piece(piece: &str) -> Option<u8> {
    let hex = piece.strip_prefix("<0x")?.strip_suffix('>')?;
    if hex.len() != 2 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u8::from_str_radix(hex, 16).ok()
}

/// Filters a decoded piece before display.
///
/// A single-character piece is kept only when it is printable ASCII or whitespace, so raw
/// byte tokens never reach the terminal as control codes or stray Latin-1 characters.
pub fn printable(piece: &str) -> &str {
    let mut chars = piece.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if !((' '..='~').contains(&c) || c.is_whitespace()) => "",
        _ => piece,
    }
}
