//! Example formatting: separators, tokenization and per-example truncation
//!
//! Each example becomes a (context, continuation) token pair. In direct mode
//! the context is the input and the continuation the output; channel mode
//! swaps the roles so the model learns to predict the input from the label.
//!
//! ## Separators
//!
//! The field that gets glued onto the previous example (the input in direct
//! mode, the output in channel mode) receives `"\n\n\n"` when the example is
//! not first in its sequence; the other field always receives `"\n"`. Without
//! newlines a single space plays both roles.

use tracing::debug;

use crate::config::{DataConfig, Method, TruncationPolicy};
use crate::corpus::{EvaluationExample, TrainingExample};
use crate::error::{MetaIclError, Result};
use crate::tokenizer::TokenEncoder;

/// Tokens reserved per example on top of input and output
const RESERVED_TOKENS: usize = 2;

/// Context and continuation ids for one example at one position
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TokenPair {
    pub context: Vec<u32>,
    pub continuation: Vec<u32>,
}

impl TokenPair {
    pub fn len(&self) -> usize {
        self.context.len() + self.continuation.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `context ++ continuation`, as used inside a demonstration block
    pub fn concatenated(&self) -> Vec<u32> {
        let mut ids = Vec::with_capacity(self.len());
        ids.extend_from_slice(&self.context);
        ids.extend_from_slice(&self.continuation);
        ids
    }
}

/// One pair per answer option, all sharing the same (truncated) query text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionPairs {
    pub pairs: Vec<TokenPair>,
    /// Index of the true answer within the options
    pub answer: usize,
}

/// Formats and tokenizes examples for one method and length budget
pub struct ExampleFormatter<'a> {
    tokenizer: &'a dyn TokenEncoder,
    method: Method,
    add_newlines: bool,
    max_length_per_example: usize,
    policy: TruncationPolicy,
}

impl<'a> ExampleFormatter<'a> {
    pub fn new(tokenizer: &'a dyn TokenEncoder, config: &DataConfig) -> Self {
        Self {
            tokenizer,
            method: config.method,
            add_newlines: config.add_newlines,
            max_length_per_example: config.max_length_per_example,
            policy: config.truncation.clone(),
        }
    }

    /// Same formatter with a different separator style
    pub fn with_newlines(mut self, add_newlines: bool) -> Self {
        self.add_newlines = add_newlines;
        self
    }

    /// Prefix for the field concatenated onto the previous example
    fn boundary_prefix(&self, is_first: bool) -> &'static str {
        match (is_first, self.add_newlines) {
            (true, _) => "",
            (false, true) => "\n\n\n",
            (false, false) => " ",
        }
    }

    /// Prefix for the field that is always separated
    fn inner_prefix(&self) -> &'static str {
        if self.add_newlines {
            "\n"
        } else {
            " "
        }
    }

    /// Apply separators, returning (input text, prefix applied to outputs/options)
    fn decorate(&self, input: &str, is_first: bool) -> (String, &'static str) {
        match self.method {
            Method::Direct => (
                format!("{}{input}", self.boundary_prefix(is_first)),
                self.inner_prefix(),
            ),
            Method::Channel => (
                format!("{}{input}", self.inner_prefix()),
                self.boundary_prefix(is_first),
            ),
        }
    }

    fn orient(&self, input: Vec<u32>, output: Vec<u32>) -> TokenPair {
        match self.method {
            Method::Direct => TokenPair {
                context: input,
                continuation: output,
            },
            Method::Channel => TokenPair {
                context: output,
                continuation: input,
            },
        }
    }

    /// Format a labeled example (training query or demonstration).
    ///
    /// Truncates to the per-example budget and fails with
    /// [`MetaIclError::Budget`] when the example still does not fit.
    pub fn format_labeled(&self, example: &TrainingExample, is_first: bool) -> Result<TokenPair> {
        let (input, output_prefix) = self.decorate(&example.input, is_first);
        let mut input_tokens = self.tokenizer.encode(&input)?;
        let mut output_tokens = self
            .tokenizer
            .encode(&format!("{output_prefix}{}", example.output))?;

        let budget = self.max_length_per_example;
        let (n_in, n_out) = (input_tokens.len(), output_tokens.len());

        if self.policy.is_balanced(&example.task) && n_in + n_out + RESERVED_TOKENS > budget {
            input_tokens.truncate(budget / 2);
            output_tokens.truncate((budget / 2).saturating_sub(RESERVED_TOKENS));
        } else if n_in + n_out + RESERVED_TOKENS >= budget {
            if self.policy.is_instruction(&example.task) && n_in < n_out {
                output_tokens.truncate(budget.saturating_sub(RESERVED_TOKENS + n_in));
            } else {
                input_tokens.truncate(budget.saturating_sub(RESERVED_TOKENS + n_out));
            }
        }

        if (input_tokens.len(), output_tokens.len()) != (n_in, n_out) {
            debug!(
                "Truncated {} example from ({}, {}) to ({}, {}) tokens",
                example.task,
                n_in,
                n_out,
                input_tokens.len(),
                output_tokens.len()
            );
        }

        if input_tokens.len() + output_tokens.len() + RESERVED_TOKENS > budget {
            return Err(MetaIclError::Budget {
                task: example.task.clone(),
                input_len: input_tokens.len(),
                output_len: output_tokens.len(),
                budget,
            });
        }

        Ok(self.orient(input_tokens, output_tokens))
    }

    /// Format a test example once per answer option.
    ///
    /// The input is cut so that the longest option still fits the budget.
    pub fn format_options(&self, example: &EvaluationExample, is_first: bool) -> Result<OptionPairs> {
        let (input, option_prefix) = self.decorate(&example.input, is_first);
        let mut input_tokens = self.tokenizer.encode(&input)?;
        let option_tokens = example
            .options
            .iter()
            .map(|option| self.tokenizer.encode(&format!("{option_prefix}{option}")))
            .collect::<Result<Vec<_>>>()?;

        let option_length = option_tokens.iter().map(Vec::len).max().unwrap_or(0);
        let limit = self
            .max_length_per_example
            .saturating_sub(RESERVED_TOKENS + option_length);
        if input_tokens.len() >= limit {
            input_tokens.truncate(limit);
        }

        let pairs = option_tokens
            .into_iter()
            .map(|option| self.orient(input_tokens.clone(), option))
            .collect();

        Ok(OptionPairs {
            pairs,
            answer: example.answer_index(),
        })
    }
}
