//! CLIP prompt tokenization.

use std::path::Path;

use tokenizers::Tokenizer;

use crate::error::{DiffusionError, Result};

/// Token limit of the CLIP text encoders, including start and end tokens.
pub const DEFAULT_MODEL_MAX_LENGTH: usize = 77;

const START_OF_TEXT: &str = "<|startoftext|>";
const END_OF_TEXT: &str = "<|endoftext|>";

/// Options for a single tokenization call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenizeOptions {
    /// Pad up to `max_length` with the pad token.
    pub padding: bool,
    /// Cut sequences longer than `max_length`.
    pub truncation: bool,
    /// Target length, capped at the model limit. `None` uses the sequence length.
    pub max_length: Option<usize>,
}

impl TokenizeOptions {
    /// Padded to `max_length`, not truncated.
    pub fn padded(max_length: usize) -> Self {
        Self {
            padding: true,
            truncation: false,
            max_length: Some(max_length),
        }
    }

    /// Raw ids with start and end tokens only.
    pub fn unpadded() -> Self {
        Self::default()
    }
}

/// Token ids of one prompt, including start and end tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizedPrompt {
    pub input_ids: Vec<i64>,
    pub attention_mask: Vec<i64>,
}

impl TokenizedPrompt {
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }
}

/// Turns prompt text into token ids for the text encoder.
pub trait PromptTokenizer: Send {
    fn tokenize(&self, text: &str, options: &TokenizeOptions) -> Result<TokenizedPrompt>;

    /// Maximum sequence length the text encoder accepts.
    fn model_max_length(&self) -> usize;
}

/// Wraps raw ids with start/end tokens and applies padding and truncation.
///
/// Padding goes on the right with `pad_id`; padded positions get a zero in
/// the attention mask.
pub fn build_prompt(
    ids: &[u32],
    bos_id: u32,
    eos_id: u32,
    pad_id: u32,
    model_max_length: usize,
    options: &TokenizeOptions,
) -> TokenizedPrompt {
    let mut input_ids: Vec<i64> = Vec::with_capacity(ids.len() + 2);
    input_ids.push(bos_id as i64);
    input_ids.extend(ids.iter().map(|&id| id as i64));
    input_ids.push(eos_id as i64);

    let max_length = options
        .max_length
        .unwrap_or(input_ids.len())
        .min(model_max_length);

    if options.truncation && input_ids.len() > max_length {
        input_ids.truncate(max_length);
    }

    let mut attention_mask = vec![1; input_ids.len()];
    if options.padding && input_ids.len() < max_length {
        let diff = max_length - input_ids.len();
        input_ids.extend(std::iter::repeat(pad_id as i64).take(diff));
        attention_mask.extend(std::iter::repeat(0).take(diff));
    }

    TokenizedPrompt {
        input_ids,
        attention_mask,
    }
}

/// CLIP BPE tokenizer loaded from a HuggingFace `tokenizer.json`.
pub struct ClipTokenizer {
    tokenizer: Tokenizer,
    bos_id: u32,
    eos_id: u32,
    model_max_length: usize,
}

impl std::fmt::Debug for ClipTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClipTokenizer")
            .field("bos_id", &self.bos_id)
            .field("eos_id", &self.eos_id)
            .field("model_max_length", &self.model_max_length)
            .finish_non_exhaustive()
    }
}

impl ClipTokenizer {
    /// Loads `tokenizer.json`. Start and end tokens are added here, so any
    /// padding, truncation or post-processing configured in the file is ignored.
    pub fn from_file(path: &Path, model_max_length: usize) -> Result<Self> {
        if !path.exists() {
            return Err(DiffusionError::model_not_found(path.display().to_string()));
        }

        let mut tokenizer = Tokenizer::from_file(path).map_err(|e| {
            DiffusionError::model_load_failed(format!("Failed to load tokenizer: {}", e))
        })?;

        tokenizer
            .with_padding(None)
            .with_truncation(None)
            .map_err(|e| {
                DiffusionError::model_load_failed(format!("Failed to configure tokenizer: {}", e))
            })?;

        let special = |token: &str| {
            tokenizer.token_to_id(token).ok_or_else(|| {
                DiffusionError::model_load_failed(format!(
                    "Tokenizer vocabulary has no {} token",
                    token
                ))
            })
        };
        let bos_id = special(START_OF_TEXT)?;
        let eos_id = special(END_OF_TEXT)?;

        Ok(Self {
            tokenizer,
            bos_id,
            eos_id,
            model_max_length,
        })
    }

    pub fn bos_id(&self) -> u32 {
        self.bos_id
    }

    pub fn eos_id(&self) -> u32 {
        self.eos_id
    }
}

impl PromptTokenizer for ClipTokenizer {
    fn tokenize(&self, text: &str, options: &TokenizeOptions) -> Result<TokenizedPrompt> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| DiffusionError::tokenizer_failed(format!("{}", e)))?;

        Ok(build_prompt(
            encoding.get_ids(),
            self.bos_id,
            self.eos_id,
            self.eos_id,
            self.model_max_length,
            options,
        ))
    }

    fn model_max_length(&self) -> usize {
        self.model_max_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    const BOS: u32 = 49406;
    const EOS: u32 = 49407;

    #[test]
    fn unpadded_wraps_with_special_tokens() {
        let p = build_prompt(&[10, 11, 12], BOS, EOS, EOS, 77, &TokenizeOptions::unpadded());
        assert_eq!(p.input_ids, vec![49406, 10, 11, 12, 49407]);
        assert_eq!(p.attention_mask, vec![1; 5]);
    }

    #[test]
    fn padding_fills_with_end_token() {
        let p = build_prompt(&[10, 11], BOS, EOS, EOS, 77, &TokenizeOptions::padded(77));
        assert_eq!(p.len(), 77);
        assert_eq!(&p.input_ids[..4], &[49406, 10, 11, 49407]);
        assert!(p.input_ids[4..].iter().all(|&id| id == EOS as i64));
        assert_eq!(p.attention_mask.iter().sum::<i64>(), 4);
    }

    #[test]
    fn long_prompts_pass_through_without_truncation() {
        let ids: Vec<u32> = (0..100).collect();
        let p = build_prompt(&ids, BOS, EOS, EOS, 77, &TokenizeOptions::padded(77));
        assert_eq!(p.len(), 102);

        let truncated = TokenizeOptions {
            truncation: true,
            ..TokenizeOptions::padded(77)
        };
        let p = build_prompt(&ids, BOS, EOS, EOS, 77, &truncated);
        assert_eq!(p.len(), 77);
        assert_eq!(p.input_ids[0], BOS as i64);
    }

    #[test]
    fn max_length_is_capped_by_model_limit() {
        let p = build_prompt(&[1], BOS, EOS, EOS, 8, &TokenizeOptions::padded(100));
        assert_eq!(p.len(), 8);
    }

    #[test]
    fn empty_prompt_still_has_start_and_end() {
        let p = build_prompt(&[], BOS, EOS, EOS, 77, &TokenizeOptions::unpadded());
        assert_eq!(p.input_ids, vec![BOS as i64, EOS as i64]);
        assert!(!p.is_empty());
    }

    #[test]
    fn missing_tokenizer_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = ClipTokenizer::from_file(&dir.path().join("tokenizer.json"), 77).unwrap_err();
        assert_eq!(err.code, ErrorCode::ModelNotFound);
    }
}
