//! Fixed-length sequence packing with attention and segment masks
//!
//! Every row handed to the model has exactly `max_length` positions:
//!
//! ```text
//! input_ids      = [C0, C1, ..., O0, O1, ..., 0, 0, 0]
//! attention_mask = [1,  1,  ..., 1,  1,  ..., 0, 0, 0]
//! segment_mask   = [0,  0,  ..., 1,  1,  ..., 0, 0, 0]
//! ```
//!
//! `C*` are context tokens and `O*` continuation tokens. The segment mask
//! restricts the loss to the continuation.
//!
//! ## Truncation
//!
//! When truncation is allowed and the pair is too long, the oldest context
//! tokens are dropped so the newest demonstrations and the query survive.
//! The continuation is never truncated here.

use serde::{Deserialize, Serialize};

use crate::error::{MetaIclError, Result};

/// Pad token id
pub const PAD_TOKEN_ID: u32 = 0;

/// One packed row of the tensor table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackedRow {
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
    pub segment_mask: Vec<u32>,
}

impl PackedRow {
    /// Row length (always the `max_length` it was packed with)
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }

    /// Number of real (non-padding) tokens
    pub fn n_tokens(&self) -> usize {
        self.attention_mask.iter().filter(|&&m| m == 1).count()
    }

    /// Context ids: everything before the first continuation token
    pub fn context_ids(&self) -> &[u32] {
        let end = self
            .segment_mask
            .iter()
            .position(|&m| m == 1)
            .unwrap_or_else(|| self.n_tokens());
        &self.input_ids[..end]
    }

    /// Continuation ids: every position with segment mask 1
    pub fn continuation_ids(&self) -> Vec<u32> {
        self.input_ids
            .iter()
            .zip(&self.segment_mask)
            .filter(|(_, &m)| m == 1)
            .map(|(&id, _)| id)
            .collect()
    }

    /// Replace the segment mask by the attention mask (loss on every real token)
    pub fn unmasked(&self) -> Self {
        Self {
            input_ids: self.input_ids.clone(),
            attention_mask: self.attention_mask.clone(),
            segment_mask: self.attention_mask.clone(),
        }
    }
}

/// Pack `context ++ continuation` into a row of exactly `max_length` tokens.
///
/// Fails with [`MetaIclError::Length`] when the continuation alone exceeds
/// `max_length`, or when truncation is disallowed and the pair does not fit.
pub fn pack(
    context: &[u32],
    continuation: &[u32],
    max_length: usize,
    allow_truncation: bool,
) -> Result<PackedRow> {
    let length_error = || MetaIclError::Length {
        context_len: context.len(),
        continuation_len: continuation.len(),
        max_length,
    };

    let total = context.len() + continuation.len();
    let context = if total > max_length {
        if !allow_truncation || continuation.len() > max_length {
            return Err(length_error());
        }
        &context[total - max_length..]
    } else {
        context
    };

    let n_real = context.len() + continuation.len();
    let n_pad = max_length - n_real;

    let mut input_ids = Vec::with_capacity(max_length);
    input_ids.extend_from_slice(context);
    input_ids.extend_from_slice(continuation);
    input_ids.resize(max_length, PAD_TOKEN_ID);

    let mut attention_mask = vec![1u32; n_real];
    attention_mask.resize(max_length, 0);

    let mut segment_mask = vec![0u32; context.len()];
    segment_mask.resize(n_real, 1);
    segment_mask.resize(n_real + n_pad, 0);

    Ok(PackedRow {
        input_ids,
        attention_mask,
        segment_mask,
    })
}
