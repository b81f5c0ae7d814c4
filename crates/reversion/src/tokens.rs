//! Tokenizer seam, relation-token registration and the static word sets used
//! by the steering loss.
//!
//! The tokenizer itself lives outside this crate; it is consumed through the
//! [`TextTokenizer`] trait. [`HfTokenizer`] adapts a HuggingFace
//! `tokenizer.json` (CLIP BPE for Stable Diffusion).

use std::collections::HashSet;
use std::path::Path;

use tokenizers::{AddedToken, Tokenizer};

use crate::error::ConfigError;

/// Ids of the special tokens wrapped around every tokenized sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialIds {
    pub bos: u32,
    pub eos: u32,
    /// CLIP pads with its end-of-text token, so `pad == eos` is common.
    pub pad: u32,
}

impl SpecialIds {
    pub fn to_vec(self) -> Vec<u32> {
        let mut ids = vec![self.bos, self.eos];
        if self.pad != self.bos && self.pad != self.eos {
            ids.push(self.pad);
        }
        ids
    }
}

/// Minimal tokenizer interface consumed by setup and caption batching.
pub trait TextTokenizer {
    /// Encode text to ids. With `add_special_tokens`, the sequence is wrapped
    /// in bos/eos.
    fn encode(&self, text: &str, add_special_tokens: bool) -> anyhow::Result<Vec<u32>>;

    /// Add `token` to the vocabulary. Returns `false` when it already exists.
    fn add_token(&mut self, token: &str) -> bool;

    fn token_to_id(&self, token: &str) -> Option<u32>;

    /// Vocabulary size including added tokens.
    fn vocab_size(&self) -> usize;

    fn special_ids(&self) -> SpecialIds;

    /// Fixed sequence length captions are padded/truncated to (77 for CLIP).
    fn model_max_length(&self) -> usize;
}

/// Tokenize `text` with bos/eos, truncated and padded to `max_length`.
///
/// Truncation drops content tokens so the sequence always keeps its bos and
/// eos markers.
pub fn encode_padded(
    tokenizer: &dyn TextTokenizer,
    text: &str,
    max_length: usize,
) -> anyhow::Result<Vec<u32>> {
    anyhow::ensure!(max_length >= 2, "max_length must leave room for bos/eos");
    let special = tokenizer.special_ids();
    let mut content = tokenizer.encode(text, false)?;
    content.truncate(max_length - 2);

    let mut ids = Vec::with_capacity(max_length);
    ids.push(special.bos);
    ids.extend(content);
    ids.push(special.eos);
    ids.resize(max_length, special.pad);
    Ok(ids)
}

/// The single new vocabulary entry whose embedding row is trained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationToken {
    /// Literal placeholder string, e.g. `<R>`.
    pub placeholder: String,
    pub id: u32,
    /// Token whose embedding seeds the new row.
    pub initializer_id: u32,
}

/// Add the placeholder to the tokenizer and resolve the initializer.
///
/// Fails when the placeholder is already part of the vocabulary or when the
/// initializer does not encode to exactly one token.
pub fn register_relation_token(
    tokenizer: &mut dyn TextTokenizer,
    placeholder: &str,
    initializer: &str,
) -> anyhow::Result<RelationToken> {
    if !tokenizer.add_token(placeholder) {
        return Err(ConfigError::PlaceholderExists(placeholder.to_string()).into());
    }

    let initializer_ids = tokenizer.encode(initializer, false)?;
    if initializer_ids.len() != 1 {
        return Err(ConfigError::InitializerNotSingleToken {
            token: initializer.to_string(),
            count: initializer_ids.len(),
        }
        .into());
    }

    let id = tokenizer
        .token_to_id(placeholder)
        .ok_or_else(|| anyhow::anyhow!("placeholder {placeholder:?} missing after insertion"))?;

    let token = RelationToken {
        placeholder: placeholder.to_string(),
        id,
        initializer_id: initializer_ids[0],
    };
    tracing::info!(
        placeholder,
        id = token.id,
        initializer,
        initializer_id = token.initializer_id,
        vocab = tokenizer.vocab_size(),
        "Registered relation token"
    );
    Ok(token)
}

/// Token-id sets that shape the steering loss pools.
#[derive(Debug, Clone)]
pub struct WordSets {
    /// Stop words and relation words: never negatives.
    pub stop_ids: HashSet<u32>,
    /// bos/eos/pad.
    pub special_ids: HashSet<u32>,
    /// Relation words positive samples are drawn from.
    pub relation_words: Vec<String>,
}

impl WordSets {
    /// Build the id sets by tokenizing the word lists.
    ///
    /// Relation words are folded into the stop set so a caption's own
    /// relation words never act as negatives.
    pub fn from_words(
        tokenizer: &dyn TextTokenizer,
        stop_words: &[String],
        relation_words: &[String],
    ) -> anyhow::Result<Self> {
        let expanded: Vec<&str> = stop_words
            .iter()
            .chain(relation_words.iter())
            .map(String::as_str)
            .collect();
        let stop_ids: HashSet<u32> = tokenizer
            .encode(&expanded.join(" "), true)?
            .into_iter()
            .collect();
        let special_ids: HashSet<u32> = tokenizer.special_ids().to_vec().into_iter().collect();

        tracing::debug!(
            stop_ids = stop_ids.len(),
            relation_words = relation_words.len(),
            "Built steering word sets"
        );
        Ok(Self {
            stop_ids,
            special_ids,
            relation_words: relation_words.to_vec(),
        })
    }

    /// True when `id` may enter the negative pool.
    pub fn is_negative_candidate(&self, id: u32, relation_id: u32) -> bool {
        id != relation_id && !self.stop_ids.contains(&id) && !self.special_ids.contains(&id)
    }
}

/// Read a word list: one word per line, blank lines and `#` comments skipped.
pub fn load_word_list(path: &Path) -> anyhow::Result<Vec<String>> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read word list {}: {e}", path.display()))?;
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect())
}

/// Prepositions and spatial/interaction words used as steering positives.
pub const DEFAULT_RELATION_WORDS: &[&str] = &[
    "above", "across", "against", "along", "alongside", "amid", "among", "around", "astride",
    "at", "atop", "behind", "below", "beneath", "beside", "between", "beyond", "by", "carrying",
    "climbing", "down", "facing", "holding", "hugging", "in", "inside", "into", "leaning",
    "near", "next", "off", "on", "onto", "opposite", "outside", "over", "painted", "past",
    "riding", "shaking", "sitting", "standing", "through", "toward", "under", "underneath",
    "upon", "with", "within",
];

/// English function words excluded from the negative pool.
pub const DEFAULT_STOP_WORDS: &[&str] = &[
    "a", "an", "the", "and", "or", "but", "if", "of", "for", "as", "is", "are", "was", "were",
    "be", "been", "being", "am", "do", "does", "did", "has", "have", "had", "having", "it",
    "its", "itself", "they", "them", "their", "this", "that", "these", "those", "there", "here",
    "he", "she", "his", "her", "him", "we", "our", "you", "your", "i", "me", "my", "what",
    "which", "who", "whom", "when", "where", "why", "how", "all", "any", "both", "each", "few",
    "more", "most", "other", "some", "such", "no", "nor", "not", "only", "own", "same", "so",
    "than", "too", "very", "can", "will", "just", "should", "now", "about", "again", "further",
    "then", "once", "while", "until", "because", "from", "up", "out", "during", "before",
    "after", "to",
];

/// Owned copies of a static word list.
pub fn owned_words(words: &[&str]) -> Vec<String> {
    words.iter().map(|w| w.to_string()).collect()
}

/// [`TextTokenizer`] over a HuggingFace `tokenizers::Tokenizer`.
pub struct HfTokenizer {
    inner: Tokenizer,
    special: SpecialIds,
    model_max_length: usize,
}

impl HfTokenizer {
    /// CLIP markers used by Stable Diffusion 1.x/2.x.
    pub const CLIP_BOS: &'static str = "<|startoftext|>";
    pub const CLIP_EOS: &'static str = "<|endoftext|>";

    /// Load a CLIP tokenizer from `tokenizer.json`; padding uses end-of-text.
    pub fn from_file(path: &Path, model_max_length: usize) -> anyhow::Result<Self> {
        let inner = Tokenizer::from_file(path)
            .map_err(|e| anyhow::anyhow!("Failed to load tokenizer {}: {e}", path.display()))?;
        let lookup = |tok: &str| {
            inner
                .token_to_id(tok)
                .ok_or_else(|| anyhow::anyhow!("tokenizer {} lacks {tok}", path.display()))
        };
        let bos = lookup(Self::CLIP_BOS)?;
        let eos = lookup(Self::CLIP_EOS)?;
        Ok(Self {
            special: SpecialIds { bos, eos, pad: eos },
            inner,
            model_max_length,
        })
    }
}

impl TextTokenizer for HfTokenizer {
    fn encode(&self, text: &str, add_special_tokens: bool) -> anyhow::Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| anyhow::anyhow!("Failed to tokenize {text:?}: {e}"))?;
        let content = encoding.get_ids();
        if !add_special_tokens {
            return Ok(content.to_vec());
        }
        let mut ids = Vec::with_capacity(content.len() + 2);
        ids.push(self.special.bos);
        ids.extend_from_slice(content);
        ids.push(self.special.eos);
        Ok(ids)
    }

    fn add_token(&mut self, token: &str) -> bool {
        if self.inner.token_to_id(token).is_some() {
            return false;
        }
        self.inner.add_tokens(&[AddedToken::from(token.to_string(), false)]) > 0
    }

    fn token_to_id(&self, token: &str) -> Option<u32> {
        self.inner.token_to_id(token)
    }

    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    fn special_ids(&self) -> SpecialIds {
        self.special
    }

    fn model_max_length(&self) -> usize {
        self.model_max_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::WordTokenizer;

    fn tokenizer() -> WordTokenizer {
        WordTokenizer::new(&["a", "photo", "of", "cat", "table", "the", "on", "in", "and"], 10)
    }

    #[test]
    fn test_encode_padded_wraps_and_pads() {
        let tok = tokenizer();
        let special = tok.special_ids();
        let ids = encode_padded(&tok, "a cat", 6).unwrap();
        assert_eq!(ids.len(), 6);
        assert_eq!(ids[0], special.bos);
        assert_eq!(ids[3], special.eos);
        assert!(ids[4..].iter().all(|&i| i == special.pad));
    }

    #[test]
    fn test_encode_padded_truncates_but_keeps_markers() {
        let tok = tokenizer();
        let special = tok.special_ids();
        let ids = encode_padded(&tok, "a photo of the cat on the table", 5).unwrap();
        assert_eq!(ids.len(), 5);
        assert_eq!(ids[0], special.bos);
        assert_eq!(ids[4], special.eos);
    }

    #[test]
    fn test_register_relation_token() {
        let mut tok = tokenizer();
        let before = tok.vocab_size();
        let token = register_relation_token(&mut tok, "<R>", "and").unwrap();
        assert_eq!(tok.vocab_size(), before + 1);
        assert_eq!(token.id as usize, before);
        assert_eq!(Some(token.initializer_id), tok.token_to_id("and"));
    }

    #[test]
    fn test_register_rejects_existing_placeholder() {
        let mut tok = tokenizer();
        let err = register_relation_token(&mut tok, "cat", "and").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::PlaceholderExists(p)) if p == "cat"
        ));
    }

    #[test]
    fn test_register_rejects_multi_token_initializer() {
        let mut tok = tokenizer();
        let err = register_relation_token(&mut tok, "<R>", "on the").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::InitializerNotSingleToken { count: 2, .. })
        ));
    }

    #[test]
    fn test_word_sets_negative_candidates() {
        let tok = tokenizer();
        let sets = WordSets::from_words(
            &tok,
            &owned_words(&["a", "the", "of"]),
            &owned_words(&["on", "in"]),
        )
        .unwrap();
        let id = |w: &str| tok.token_to_id(w).unwrap();
        let special = tok.special_ids();

        assert!(sets.is_negative_candidate(id("cat"), 999));
        assert!(!sets.is_negative_candidate(id("the"), 999));
        assert!(!sets.is_negative_candidate(id("on"), 999));
        assert!(!sets.is_negative_candidate(special.bos, 999));
        assert!(!sets.is_negative_candidate(id("cat"), id("cat")));
    }

    #[test]
    fn test_load_word_list_skips_comments() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("words.txt");
        std::fs::write(&path, "# relations\non\n\n  under \nbeside\n").unwrap();
        let words = load_word_list(&path).unwrap();
        assert_eq!(words, vec!["on", "under", "beside"]);
    }
}
