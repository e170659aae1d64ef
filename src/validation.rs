use std::sync::Arc;

use thiserror::Error;
use tokenizers::Tokenizer;
use tracing::{info_span, instrument, Span};

use crate::{
    config::{CacheConfig, SchedulerPolicy},
    types::{GenerateParameters, GenerateRequest, Prompt, DEFAULT_MAX_NEW_TOKENS},
};

/// Validated sampling and stopping parameters, with defaults applied.
#[derive(Clone, Debug, PartialEq)]
pub struct SamplingParams {
    /// Maximum number of tokens to generate
    pub max_new_tokens: usize,
    /// End-of-sequence token id; `None` disables the stop-token check
    pub end_id: Option<u32>,
    /// Padding token id
    pub pad_id: Option<u32>,
    /// Sampling temperature
    pub temperature: f32,
    /// Top-k filtering; 0 disables it
    pub top_k: u32,
    /// Nucleus sampling mass
    pub top_p: f32,
    /// Random sampling seed
    pub random_seed: Option<u64>,
}

/// A canonical, validated generation request, ready to enter the scheduler
/// core. The prompt is fixed once issued.
#[derive(Clone, Debug)]
pub struct ValidGenerateRequest {
    /// The tokenized prompt
    pub prompt_token_ids: Vec<u32>,
    /// Validated sampling parameters
    pub params: SamplingParams,
    /// Whether partial outputs are streamed per step
    pub streaming: bool,
}

/// `Validation` - resolves incoming [`GenerateRequest`]s into the single
/// canonical representation consumed by the scheduler, rejecting requests the
/// serving instance can never satisfy.
#[derive(Clone, Debug)]
pub struct Validation {
    /// Pool block size, in token positions
    block_size: usize,
    /// Total number of pool blocks
    num_blocks: usize,
    /// Admission policy, which determines the capacity check
    policy: SchedulerPolicy,
    /// Optional tokenizer for text prompts
    tokenizer: Option<Arc<Tokenizer>>,
    /// Tracing span
    span: Span,
}

impl Validation {
    /// Constructor
    pub fn new(
        cache_config: &CacheConfig,
        policy: SchedulerPolicy,
        tokenizer: Option<Arc<Tokenizer>>,
    ) -> Self {
        Self {
            block_size: cache_config.block_size(),
            num_blocks: cache_config.num_blocks(),
            policy,
            tokenizer,
            span: info_span!("validation"),
        }
    }

    /// Validates a [`GenerateRequest`] into a [`ValidGenerateRequest`].
    ///
    /// Capacity is checked against the whole pool: a request whose prompt (or,
    /// under `GuaranteedNoEvict`, whose worst-case prompt plus generation
    /// length) exceeds the total pool capacity is rejected here and never
    /// enters the pending queue.
    #[instrument(skip_all)]
    pub fn validate(
        &self,
        request: GenerateRequest,
    ) -> Result<ValidGenerateRequest, ValidationError> {
        let _enter = self.span.enter();

        let prompt_token_ids = self.tokenize(request.prompt)?;
        if prompt_token_ids.is_empty() {
            return Err(ValidationError::EmptyPrompt);
        }

        let params = self.validate_parameters(request.parameters)?;

        // Worst-case number of blocks this request can ever hold. Under
        // `MaxUtilization` a request only needs its prompt plus one generated
        // token to make progress; under `GuaranteedNoEvict` admission assumes
        // the full generation length.
        let worst_case_tokens = match self.policy {
            SchedulerPolicy::MaxUtilization => prompt_token_ids.len() + 1,
            SchedulerPolicy::GuaranteedNoEvict => prompt_token_ids.len() + params.max_new_tokens,
        };
        let worst_case_blocks = worst_case_tokens.div_ceil(self.block_size);
        if worst_case_blocks > self.num_blocks {
            return Err(ValidationError::PromptTooLong {
                needed_blocks: worst_case_blocks,
                total_blocks: self.num_blocks,
            });
        }

        Ok(ValidGenerateRequest {
            prompt_token_ids,
            params,
            streaming: request.streaming,
        })
    }

    /// Resolves the prompt into token ids, encoding text prompts with the
    /// supplied tokenizer.
    fn tokenize(&self, prompt: Prompt) -> Result<Vec<u32>, ValidationError> {
        match prompt {
            Prompt::Tokens(token_ids) => Ok(token_ids),
            Prompt::Text(text) => {
                let tokenizer = self
                    .tokenizer
                    .as_ref()
                    .ok_or(ValidationError::MissingTokenizer)?;
                let encoding = tokenizer
                    .encode(text, false)
                    .map_err(|e| ValidationError::Tokenizer(e.to_string()))?;
                Ok(encoding.get_ids().to_vec())
            }
        }
    }

    /// Applies defaults and range checks to the sampling parameters.
    fn validate_parameters(
        &self,
        parameters: GenerateParameters,
    ) -> Result<SamplingParams, ValidationError> {
        let GenerateParameters {
            max_new_tokens,
            end_id,
            pad_id,
            temperature,
            top_k,
            top_p,
            random_seed,
        } = parameters;

        let max_new_tokens = max_new_tokens.unwrap_or(DEFAULT_MAX_NEW_TOKENS);
        if max_new_tokens == 0 {
            return Err(ValidationError::InvalidMaxNewTokens);
        }

        let temperature = temperature.unwrap_or(1.0);
        if temperature <= 0.0 {
            return Err(ValidationError::InvalidTemperature(temperature));
        }

        let top_p = top_p.unwrap_or(1.0);
        if top_p <= 0.0 || top_p > 1.0 {
            return Err(ValidationError::InvalidTopP(top_p));
        }

        Ok(SamplingParams {
            max_new_tokens,
            end_id,
            pad_id: pad_id.or(end_id),
            temperature,
            top_k: top_k.unwrap_or(0),
            top_p,
            random_seed,
        })
    }
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Prompt is empty")]
    EmptyPrompt,
    #[error("Request can never be satisfied: needs `{needed_blocks}` blocks, pool holds `{total_blocks}`")]
    PromptTooLong {
        needed_blocks: usize,
        total_blocks: usize,
    },
    #[error("`max_new_tokens` must be at least 1")]
    InvalidMaxNewTokens,
    #[error("`temperature` must be strictly positive, got `{0}`")]
    InvalidTemperature(f32),
    #[error("`top_p` must lie in (0, 1], got `{0}`")]
    InvalidTopP(f32),
    #[error("Text prompts require a tokenizer, none was supplied")]
    MissingTokenizer,
    #[error("Tokenizer error: `{0}`")]
    Tokenizer(String),
}
