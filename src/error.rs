//! Error taxonomy for tensorization, sharding and scoring

use thiserror::Error;

/// Errors raised by the MetaICL data pipeline.
///
/// Only [`MetaIclError::Budget`] is recovered locally (the tensorizer skips
/// the offending partition and logs it); every other variant propagates.
#[derive(Debug, Error)]
pub enum MetaIclError {
    /// Malformed input record: caller contract violation, nothing is processed.
    #[error("Invalid record: {0}")]
    Validation(String),

    /// One example cannot fit the per-example length budget after truncation.
    #[error("Example from task {task:?} does not fit the length budget: {input_len} + {output_len} + 2 > {budget}")]
    Budget {
        task: String,
        input_len: usize,
        output_len: usize,
        budget: usize,
    },

    /// Packing contract violated upstream of formatting.
    #[error("Cannot pack {context_len} + {continuation_len} tokens into max_length {max_length}")]
    Length {
        context_len: usize,
        continuation_len: usize,
        max_length: usize,
    },

    /// Fewer eligible demonstrations than requested.
    #[error("Cannot draw {k} demonstrations from a pool of {pool_size} (one index excluded)")]
    InsufficientPool { pool_size: usize, k: usize },

    /// A partition of the tensorization fan-out failed with a non-recoverable error.
    #[error("Tensorizing partition {name} failed: {source}")]
    Partition {
        name: String,
        source: Box<MetaIclError>,
    },

    /// Shard requested before it was materialized.
    #[error("Shard file {0} does not exist; run `metaicl tensorize` (materialize) with the same configuration first")]
    MissingShard(String),

    #[error("Failed to start worker pool: {0}")]
    WorkerPool(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Corrupt shard file {path}: {reason}")]
    CorruptShard { path: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    SafeTensors(#[from] safetensors::SafeTensorError),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

impl MetaIclError {
    /// Build a validation error from anything printable.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Whether the error is recoverable by skipping a single partition.
    pub fn is_budget(&self) -> bool {
        matches!(self, Self::Budget { .. })
    }
}

/// Result type for the MetaICL pipeline
pub type Result<T> = std::result::Result<T, MetaIclError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MetaIclError::validation("missing input");
        assert!(err.to_string().contains("missing input"));

        let err = MetaIclError::Budget {
            task: "inst:piqa".into(),
            input_len: 300,
            output_len: 10,
            budget: 256,
        };
        assert!(err.is_budget());
        assert!(err.to_string().contains("inst:piqa"));

        let err = MetaIclError::MissingShard("tensorized/x-rank=0.safetensors".into());
        assert!(!err.is_budget());
        assert!(err.to_string().contains("tensorize"));

        let err = MetaIclError::InsufficientPool { pool_size: 3, k: 4 };
        assert!(err.to_string().contains("pool of 3"));

        let err = MetaIclError::Partition {
            name: "glue-sst2".into(),
            source: Box::new(err),
        };
        assert!(!err.is_budget());
        assert!(err.to_string().contains("partition glue-sst2"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
