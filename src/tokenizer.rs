//! Tokenizer boundary
//!
//! The tensorizer only needs `encode`/`decode` and the special-token ids.
//! [`HfTokenizer`] wraps a Hugging Face `tokenizer.json`; [`ByteTokenizer`]
//! is a dependency-free byte-level fallback for offline runs and tests.

use std::path::Path;

use hf_hub::{api::sync::Api, Repo, RepoType};
use tokenizers::Tokenizer;
use tracing::info;

use crate::error::{MetaIclError, Result};

/// Text <-> token id capability consumed by the formatter.
pub trait TokenEncoder: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;
    fn decode(&self, ids: &[u32]) -> Result<String>;

    /// Reserved; packing does not insert it.
    fn bos_token_id(&self) -> Option<u32> {
        None
    }

    /// Reserved; packing does not insert it.
    fn eos_token_id(&self) -> Option<u32> {
        None
    }
}

/// Hugging Face tokenizer (GPT-2 style `tokenizer.json`)
pub struct HfTokenizer {
    inner: Tokenizer,
}

impl HfTokenizer {
    /// Load from a local `tokenizer.json`
    pub fn from_file(path: &Path) -> Result<Self> {
        let inner = Tokenizer::from_file(path)
            .map_err(|e| MetaIclError::Tokenizer(format!("{}: {e}", path.display())))?;
        Ok(Self { inner })
    }

    /// Download `tokenizer.json` from the Hugging Face hub (e.g. "gpt2-large")
    pub fn from_pretrained(model_id: &str) -> Result<Self> {
        info!("Loading tokenizer for {}", model_id);
        let api = Api::new().map_err(|e| MetaIclError::Tokenizer(e.to_string()))?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));
        let path = repo
            .get("tokenizer.json")
            .map_err(|e| MetaIclError::Tokenizer(format!("Failed to download tokenizer.json: {e}")))?;
        Self::from_file(&path)
    }

    fn special_id(&self, candidates: &[&str]) -> Option<u32> {
        candidates
            .iter()
            .find_map(|token| self.inner.token_to_id(token))
    }
}

impl TokenEncoder for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| MetaIclError::Tokenizer(format!("Tokenization error: {e}")))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner
            .decode(ids, false)
            .map_err(|e| MetaIclError::Tokenizer(format!("Decode error: {e}")))
    }

    fn bos_token_id(&self) -> Option<u32> {
        self.special_id(&["<|endoftext|>", "<s>"])
    }

    fn eos_token_id(&self) -> Option<u32> {
        self.special_id(&["<|endoftext|>", "</s>"])
    }
}

/// One token per UTF-8 byte, id = byte + 1 so that 0 stays the pad id.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteTokenizer;

impl TokenEncoder for ByteTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text.bytes().map(|b| u32::from(b) + 1).collect())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        let bytes = ids
            .iter()
            .filter(|&&id| id != 0)
            .map(|&id| {
                u8::try_from(id - 1)
                    .map_err(|_| MetaIclError::Tokenizer(format!("Token ID {id} out of range")))
            })
            .collect::<Result<Vec<u8>>>()?;
        String::from_utf8(bytes).map_err(|e| MetaIclError::Tokenizer(format!("UTF-8 decode error: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_tokenizer_roundtrip() {
        let tok = ByteTokenizer;
        let ids = tok.encode("\n\n\nhi é").unwrap();
        assert_eq!(ids.len(), "\n\n\nhi é".len());
        assert!(ids.iter().all(|&id| id > 0));
        assert_eq!(tok.decode(&ids).unwrap(), "\n\n\nhi é");
    }

    #[test]
    fn test_byte_tokenizer_skips_padding() {
        let tok = ByteTokenizer;
        let mut ids = tok.encode("ab").unwrap();
        ids.extend([0, 0]);
        assert_eq!(tok.decode(&ids).unwrap(), "ab");
    }

    #[test]
    fn test_byte_tokenizer_has_no_special_tokens() {
        let tok = ByteTokenizer;
        assert_eq!(tok.encode("\u{7f}").unwrap(), vec![128]);
        assert_eq!(tok.eos_token_id(), None);
        assert_eq!(tok.bos_token_id(), None);
    }

    #[test]
    fn test_byte_tokenizer_out_of_range() {
        assert!(ByteTokenizer.decode(&[300]).is_err());
    }
}
