//! WordPiece vocabulary used to turn pregenerated tokens into ids.
//!
//! Pregenerated shards already hold word pieces, so the only tokenizer
//! operation training needs is `token → id`. A `tokenizer.json` is preferred
//! when present; a plain `vocab.txt` (one token per line) is the fallback.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;

pub const UNK_TOKEN: &str = "[UNK]";

#[derive(Debug, Serialize, Deserialize)]
struct TokenizerSettings {
    do_lower_case: bool,
}

/// Token ↔ id mapping loaded from a model directory.
///
/// Ids are line numbers of `vocab.txt`; a repeated line keeps its slot so
/// later ids do not shift, but lookups resolve to its first occurrence.
pub struct Vocab {
    ids: HashMap<String, u32>,
    /// Token of every id slot, in id order.
    tokens: Vec<String>,
    unk_id: u32,
    do_lower_case: bool,
    tokenizer: Option<Tokenizer>,
}

impl Vocab {
    /// Load from `model_dir/tokenizer.json` or `model_dir/vocab.txt`.
    pub fn from_pretrained(model_dir: &Path, do_lower_case: bool) -> Result<Self> {
        let tokenizer_path = model_dir.join("tokenizer.json");
        let vocab_path = model_dir.join("vocab.txt");
        let (tokens, tokenizer) = if tokenizer_path.is_file() {
            let tokenizer = Tokenizer::from_file(&tokenizer_path)
                .map_err(|e| anyhow::anyhow!("load tokenizer {}: {e}", tokenizer_path.display()))?;
            (tokens_by_id(tokenizer.get_vocab(true)), Some(tokenizer))
        } else if vocab_path.is_file() {
            (read_vocab_txt(&vocab_path)?, None)
        } else {
            anyhow::bail!(
                "no tokenizer.json or vocab.txt in {}",
                model_dir.display()
            );
        };
        Self::from_parts(tokens, tokenizer, do_lower_case)
    }

    /// Build from an explicit token list; ids follow list order.
    pub fn from_tokens<I, S>(tokens: I, do_lower_case: bool) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tokens = tokens.into_iter().map(Into::into).collect();
        Self::from_parts(tokens, None, do_lower_case)
    }

    fn from_parts(
        tokens: Vec<String>,
        tokenizer: Option<Tokenizer>,
        do_lower_case: bool,
    ) -> Result<Self> {
        let mut ids = HashMap::with_capacity(tokens.len());
        for (i, token) in tokens.iter().enumerate() {
            // First occurrence wins, as in the reference WordPiece loader.
            ids.entry(token.clone()).or_insert(i as u32);
        }
        let unk_id = *ids
            .get(UNK_TOKEN)
            .with_context(|| format!("vocabulary has no {UNK_TOKEN} token"))?;
        Ok(Self {
            ids,
            tokens,
            unk_id,
            do_lower_case,
            tokenizer,
        })
    }

    /// Number of id slots (highest id + 1); the embedding table must be at
    /// least this large.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn do_lower_case(&self) -> bool {
        self.do_lower_case
    }

    /// Id of `token`, or the `[UNK]` id when the token is not in the vocabulary.
    pub fn token_to_id(&self, token: &str) -> u32 {
        self.ids.get(token).copied().unwrap_or(self.unk_id)
    }

    pub fn tokens_to_ids<S: AsRef<str>>(&self, tokens: &[S]) -> Vec<u32> {
        tokens.iter().map(|t| self.token_to_id(t.as_ref())).collect()
    }

    /// Write `vocab.txt`, `tokenizer_config.json` and, if loaded, `tokenizer.json`.
    pub fn save_pretrained(&self, output_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(output_dir)?;

        let vocab_path = output_dir.join("vocab.txt");
        let mut w = BufWriter::new(File::create(&vocab_path).context("create vocab.txt")?);
        for token in &self.tokens {
            writeln!(w, "{token}")?;
        }
        w.flush()?;

        if let Some(ref tokenizer) = self.tokenizer {
            tokenizer
                .save(output_dir.join("tokenizer.json"), true)
                .map_err(|e| anyhow::anyhow!("save tokenizer: {e}"))?;
        }

        let settings = TokenizerSettings {
            do_lower_case: self.do_lower_case,
        };
        std::fs::write(
            output_dir.join("tokenizer_config.json"),
            serde_json::to_string_pretty(&settings)?,
        )?;
        Ok(())
    }
}

fn read_vocab_txt(path: &Path) -> Result<Vec<String>> {
    let reader = BufReader::new(File::open(path).context("open vocab.txt")?);
    reader
        .lines()
        .map(|line| Ok(line?.trim_end_matches(['\r', '\n']).to_string()))
        .collect()
}

/// Invert a tokenizer vocabulary; unused ids become empty slots.
fn tokens_by_id(ids: HashMap<String, u32>) -> Vec<String> {
    let slots = ids.values().map(|&id| id as usize + 1).max().unwrap_or(0);
    let mut tokens = vec![String::new(); slots];
    for (token, id) in ids {
        tokens[id as usize] = token;
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_vocab() -> Vocab {
        Vocab::from_tokens(["[PAD]", "[UNK]", "[CLS]", "[SEP]", "[MASK]", "the", "cat"], true)
            .unwrap()
    }

    #[test]
    fn unknown_tokens_map_to_unk() {
        let vocab = small_vocab();
        assert_eq!(vocab.token_to_id("cat"), 6);
        assert_eq!(vocab.token_to_id("dog"), 1);
        assert_eq!(vocab.tokens_to_ids(&["[CLS]", "the", "zebra"]), vec![2, 5, 1]);
    }

    #[test]
    fn missing_unk_is_an_error() {
        assert!(Vocab::from_tokens(["[PAD]", "a"], false).is_err());
    }

    #[test]
    fn vocab_txt_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        small_vocab().save_pretrained(dir.path()).unwrap();
        let text = std::fs::read_to_string(dir.path().join("vocab.txt")).unwrap();
        assert!(text.starts_with("[PAD]\n[UNK]\n"));

        let loaded = Vocab::from_pretrained(dir.path(), true).unwrap();
        assert_eq!(loaded.len(), 7);
        assert_eq!(loaded.token_to_id("the"), 5);
        assert!(dir.path().join("tokenizer_config.json").is_file());
    }

    #[test]
    fn duplicate_lines_keep_their_slot() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("vocab.txt"), "[PAD]\n[UNK]\na\na\nb\n").unwrap();

        let vocab = Vocab::from_pretrained(dir.path(), true).unwrap();
        assert_eq!(vocab.token_to_id("a"), 2);
        assert_eq!(vocab.token_to_id("b"), 4);
        // Ids reach 4, so the model needs five embedding rows.
        assert_eq!(vocab.len(), 5);

        let out = tempfile::tempdir().unwrap();
        vocab.save_pretrained(out.path()).unwrap();
        let reloaded = Vocab::from_pretrained(out.path(), true).unwrap();
        assert_eq!(reloaded.token_to_id("b"), 4);
        assert_eq!(reloaded.len(), 5);
    }

    #[test]
    fn tokenizer_ids_are_inverted_with_gaps() {
        let ids = HashMap::from([("[UNK]".to_string(), 0), ("x".to_string(), 2)]);
        assert_eq!(tokens_by_id(ids), vec!["[UNK]".to_string(), String::new(), "x".to_string()]);
    }

    #[test]
    fn empty_dir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Vocab::from_pretrained(dir.path(), true).is_err());
    }
}
