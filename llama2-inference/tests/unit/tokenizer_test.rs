//! Tests for vocabulary loading, BPE encoding and piece decoding

use super::*;
use anyhow::Result;
use byteorder::WriteBytesExt;
use tempfile::TempDir;

fn vocab_bytes(entries: &[(&str, f32)]) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    for &(piece, score) in entries {
        bytes.write_f32::<LittleEndian>(score)?;
        bytes.write_i32::<LittleEndian>(piece.len() as i32)?;
        bytes.extend_from_slice(piece.as_bytes());
    }
    Ok(bytes)
}

fn tokenizer(entries: &[(&str, f32)]) -> Tokenizer {
    Tokenizer::from_vocab(
        entries.iter().map(|(piece, _)| piece.to_string()).collect(),
        entries.iter().map(|&(_, score)| score).collect(),
    )
}

/// `<unk>`, `<s>`, `</s>`, the 256 byte pieces, then `extra`.
fn byte_fallback_tokenizer(extra: &[(&str, f32)]) -> Tokenizer {
    let mut vocab = vec!["<unk>".to_string(), "<s>".to_string(), "</s>".to_string()];
    vocab.extend((0..=255u8).map(|b| format!("<0x{b:02X}>")));
    let mut scores = vec![0.0; vocab.len()];

    for &(piece, score) in extra {
        vocab.push(piece.to_string());
        scores.push(score);
    }
    Tokenizer::from_vocab(vocab, scores)
}

#[test]
fn test_load_from_file() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let path = temp_dir.path().join("tokenizer.bin");
    std::fs::write(&path, vocab_bytes(&[("<unk>", 0.0), ("<s>", 0.0), ("</s>", 0.0), ("hello", -1.5)])?)?;

    let tokenizer = Tokenizer::new(&path, 4)?;

    assert_eq!(tokenizer.vocab_size(), 4);
    assert_eq!(tokenizer.vocab[3], "hello");
    assert_eq!(tokenizer.vocab_scores[3], -1.5);

    Ok(())
}

#[test]
fn test_reads_only_requested_entries() -> Result<()> {
    let bytes = vocab_bytes(&[("a", 0.0), ("b", 0.0), ("c", 0.0)])?;
    let tokenizer = Tokenizer::from_bytes(&bytes, 2)?;

    assert_eq!(tokenizer.vocab, vec!["a", "b"]);
    Ok(())
}

#[test]
fn test_truncated_vocabulary() -> Result<()> {
    let bytes = vocab_bytes(&[("a", 0.0), ("bcd", 0.0)])?;

    // missing third record
    assert!(matches!(Tokenizer::from_bytes(&bytes, 3), Err(LlamaError::InvalidVocabulary(_))));

    // second record cut inside its payload
    let cut = &bytes[..bytes.len() - 1];
    assert!(matches!(Tokenizer::from_bytes(cut, 2), Err(LlamaError::InvalidVocabulary(_))));

    // second record cut inside its length
    let cut = &bytes[..4 + 4 + 1 + 6];
    assert!(matches!(Tokenizer::from_bytes(cut, 2), Err(LlamaError::InvalidVocabulary(_))));

    Ok(())
}

#[test]
fn test_negative_length_is_rejected() -> Result<()> {
    let mut bytes = Vec::new();
    bytes.write_f32::<LittleEndian>(0.0)?;
    bytes.write_i32::<LittleEndian>(-3)?;
    bytes.extend_from_slice(b"abc");

    assert!(matches!(Tokenizer::from_bytes(&bytes, 1), Err(LlamaError::InvalidVocabulary(_))));
    Ok(())
}

#[test]
fn test_missing_file_is_io_error() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let result = Tokenizer::new(temp_dir.path().join("missing.bin"), 4);
    assert!(matches!(result, Err(LlamaError::Io(_))));
    Ok(())
}

#[test]
fn test_single_merge_without_space_token() -> Result<()> {
    let tokenizer = tokenizer(&[("a", 0.0), ("b", 0.0), ("ab", 1.0), ("<unk>", 0.0)]);

    let tokens = tokenizer.encode("ab", false, false)?;

    assert_eq!(tokens, vec![2]);
    Ok(())
}

#[test]
fn test_bos_dummy_prefix_and_eos() -> Result<()> {
    let tokenizer = tokenizer(&[("<unk>", 0.0), ("<s>", 0.0), ("</s>", 0.0), (" ", 0.0), ("h", 0.0), ("i", 0.0)]);

    assert_eq!(tokenizer.encode("hi", true, true)?, vec![BOS_TOKEN_ID, 3, 4, 5, EOS_TOKEN_ID]);
    // no dummy prefix for empty text
    assert_eq!(tokenizer.encode("", true, false)?, vec![BOS_TOKEN_ID]);
    assert!(tokenizer.encode("", false, false)?.is_empty());

    Ok(())
}

#[test]
fn test_absent_text_is_invalid_input() {
    let tokenizer = tokenizer(&[("<unk>", 0.0), ("<s>", 0.0), ("</s>", 0.0)]);
    let result = tokenizer.encode(None, true, false);
    assert!(matches!(result, Err(LlamaError::InvalidInput(_))));
}

#[test]
fn test_merges_prefer_highest_score() -> Result<()> {
    let tokenizer = tokenizer(&[
        ("<unk>", 0.0),
        ("<s>", 0.0),
        ("</s>", 0.0),
        ("a", 0.0),
        ("b", 0.0),
        ("c", 0.0),
        ("ab", 1.0),
        ("bc", 2.0),
        ("abc", 3.0),
    ]);

    // "bc" outscores "ab", then "a" + "bc" forms "abc"
    assert_eq!(tokenizer.encode("abc", false, false)?, vec![8]);
    // only "ab" applies to "abab"
    assert_eq!(tokenizer.encode("abab", false, false)?, vec![6, 6]);

    Ok(())
}

#[test]
fn test_merges_leftmost_on_equal_scores() -> Result<()> {
    let tokenizer = tokenizer(&[("<unk>", 0.0), ("<s>", 0.0), ("</s>", 0.0), ("a", 0.0), ("aa", 1.0)]);

    // "aaa": both pairs score 1.0, the left one merges
    assert_eq!(tokenizer.encode("aaa", false, false)?, vec![4, 3]);
    Ok(())
}

#[test]
fn test_each_merge_removes_one_token() {
    let tokenizer = tokenizer(&[
        ("<unk>", 0.0),
        ("<s>", 0.0),
        ("</s>", 0.0),
        ("l", 0.0),
        ("o", 0.0),
        ("w", 0.0),
        ("lo", 1.0),
        ("low", 2.0),
        ("ow", 0.5),
    ]);

    let mut tokens = vec![3, 4, 5, 3, 4, 5, 3];
    let initial = tokens.len();
    let merges = tokenizer.merge_pairs(&mut tokens);

    assert_eq!(tokens.len(), initial - merges);
    assert!(merges < initial);
    assert_eq!(tokens, vec![7, 7, 3]);
}

#[test]
fn test_byte_fallback() -> Result<()> {
    let tokenizer = byte_fallback_tokenizer(&[("h", 0.0)]);

    // 'é' is 0xC3 0xA9 in UTF-8
    let tokens = tokenizer.encode("hé", false, false)?;
    assert_eq!(tokens, vec![259, 0xC3 + 3, 0xA9 + 3]);

    Ok(())
}

#[test]
fn test_byte_fallback_outside_vocabulary() {
    let tokenizer = tokenizer(&[("<unk>", 0.0), ("<s>", 0.0), ("</s>", 0.0), ("a", 0.0)]);
    let result = tokenizer.encode("z", false, false);
    assert!(matches!(result, Err(LlamaError::InvalidInput(_))));
}

#[test]
fn test_encode_decode_round_trip() -> Result<()> {
    let tokenizer = tokenizer(&[
        ("<unk>", 0.0),
        ("<s>", 0.0),
        ("</s>", 0.0),
        (" ", 0.0),
        ("h", 0.0),
        ("e", 0.0),
        ("l", 0.0),
        ("o", 0.0),
        ("!", 0.0),
    ]);
    let text = "hello hello!";

    let tokens = tokenizer.encode(text, true, true)?;

    // skip BOS and the dummy prefix, stop before EOS
    let body = &tokens[2..tokens.len() - 1];
    let mut decoded = String::new();
    let mut prev = tokens[1];
    for &token in body {
        decoded.push_str(&tokenizer.decode(prev, token));
        prev = token;
    }

    assert_eq!(decoded, text);
    Ok(())
}

#[test]
fn test_decode_strips_space_after_bos() {
    let tokenizer = tokenizer(&[("<unk>", 0.0), ("<s>", 0.0), ("</s>", 0.0), (" Hello", 0.0)]);

    assert_eq!(tokenizer.decode(BOS_TOKEN_ID, 3), "Hello");
    assert_eq!(tokenizer.decode(3, 3), " Hello");
}

#[test]
fn test_decode_byte_pieces() {
    let tokenizer = byte_fallback_tokenizer(&[]);

    assert_eq!(tokenizer.decode(5, 0x0A + 3), "\n");
    assert_eq!(tokenizer.decode(5, 0x41 + 3), "A");
    // out of range ids decode to nothing
    assert_eq!(tokenizer.decode(5, 100_000), "");
}

#[test]
fn test_parse_byte_piece() {
    assert_eq!(parse_byte_piece("<0x0A>"), Some(0x0A));
    assert_eq!(parse_byte_piece("<0xff>"), Some(0xFF));
    assert_eq!(parse_byte_piece("<0x0>"), None);
    assert_eq!(parse_byte_piece("<0x+A>"), None);
    assert_eq!(parse_byte_piece("0x0A"), None);
}

#[test]
fn test_printable() {
    assert_eq!(printable("hello"), "hello");
    assert_eq!(printable("\n"), "\n");
    assert_eq!(printable("\u{7}"), "");
    assert_eq!(printable("\u{7}a"), "\u{7}a");
    assert_eq!(printable(""), "");
    // single non-ASCII characters are dropped, longer pieces are not
    assert_eq!(printable("\u{e4}"), "");
    assert_eq!(printable("\u{e4}b"), "\u{e4}b");
}

#[test]
fn test_printable_byte_pieces() {
    let tokenizer = byte_fallback_tokenizer(&[]);

    // upper half bytes decode to Latin-1 characters that must not be shown
    assert_eq!(printable(&tokenizer.decode(5, 0xE4 + 3)), "");
    assert_eq!(printable(&tokenizer.decode(5, 0xBD + 3)), "");
    assert_eq!(printable(&tokenizer.decode(5, 0x1B + 3)), "");
    assert_eq!(printable(&tokenizer.decode(5, 0x41 + 3)), "A");
    assert_eq!(printable(&tokenizer.decode(5, 0x09 + 3)), "\t");
}

#[test]
fn test_special_tokens_outside_small_vocabulary() -> Result<()> {
    let tokenizer = tokenizer(&[("a", 0.0)]);

    assert!(matches!(tokenizer.encode("a", true, false), Err(LlamaError::InvalidInput(_))));
    assert!(matches!(tokenizer.encode("a", false, true), Err(LlamaError::InvalidInput(_))));
    assert_eq!(tokenizer.encode("a", false, false)?, vec![0]);

    Ok(())
}

#[test]
fn test_merge_skips_ids_outside_vocabulary() {
    let tokenizer = tokenizer(&[("a", 0.0), ("b", 0.0), ("ab", 1.0)]);

    let mut tokens = vec![7, 0, 1];
    assert_eq!(tokenizer.merge_pairs(&mut tokens), 1);
    assert_eq!(tokens, vec![7, 2]);
}

#[test]
fn test_duplicate_pieces_keep_first_id() -> Result<()> {
    let tokenizer = tokenizer(&[("<unk>", 0.0), ("<s>", 0.0), ("</s>", 0.0), ("x", 0.0), ("x", 0.0)]);
    assert_eq!(tokenizer.encode("x", false, false)?, vec![3]);
    Ok(())
}
