use serde::{Deserialize, Serialize};

/// Prompt shapes accepted at the executor boundary.
///
/// Dynamic dispatch across request shapes is resolved here, before entering
/// the scheduler core: a `Text` prompt is tokenized during validation (which
/// requires a tokenizer to have been supplied), while `Tokens` is passed
/// through as-is.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Prompt {
    Text(String),
    Tokens(Vec<u32>),
}

impl From<&str> for Prompt {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Prompt {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<u32>> for Prompt {
    fn from(value: Vec<u32>) -> Self {
        Self::Tokens(value)
    }
}

/// `GenerateRequest` - a generation request as submitted by a caller
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GenerateRequest {
    /// The prompt, either raw text or pre-tokenized ids
    pub prompt: Prompt,
    /// Generation parameters
    #[serde(default)]
    pub parameters: GenerateParameters,
    /// Whether partial outputs are streamed per step, or only one final
    /// output is delivered
    #[serde(default)]
    pub streaming: bool,
}

/// Default number of new tokens generated when the caller does not specify
/// `max_new_tokens`.
pub const DEFAULT_MAX_NEW_TOKENS: usize = 8;

/// `GenerateParameters` - Sampling and stopping parameters of a generation
/// request. All fields are optional; defaults are applied during validation.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct GenerateParameters {
    /// Maximum number of tokens to generate. Defaults to
    /// [`DEFAULT_MAX_NEW_TOKENS`].
    pub max_new_tokens: Option<usize>,
    /// End-of-sequence token id. Generation stops when this token is
    /// produced. `None` disables the stop-token check.
    pub end_id: Option<u32>,
    /// Padding token id. Defaults to `end_id` when unset.
    pub pad_id: Option<u32>,
    /// Temperature used for modeling the logits distribution. Defaults to
    /// 1.0 (no rescaling).
    pub temperature: Option<f32>,
    /// Number of highest probability vocabulary tokens to keep for
    /// top-k-filtering. Defaults to 0 (disabled).
    pub top_k: Option<u32>,
    /// Top-p value for nucleus sampling. Defaults to 1.0 (disabled).
    pub top_p: Option<f32>,
    /// Random sampling seed
    pub random_seed: Option<u64>,
}
