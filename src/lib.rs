// Pedantic clippy configuration for data-pipeline code
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in metrics
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor shapes
#![allow(clippy::module_name_repetitions)] // TensorTable in tensorize.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility

//! metaicl-rs: in-context learning data preparation and evaluation
//!
//! Turns task datasets into fixed-length token tables that concatenate k
//! demonstrations with a query, persists them as sharded safetensors
//! files, and scores answer options by per-token loss.
//!
//! ## Architecture
//!
//! - `config`: DataConfig, Method, TaskConfig and the truncation policy
//! - `error`: MetaIclError taxonomy
//! - `tokenizer`: TokenEncoder boundary (Hugging Face and byte-level tokenizers)
//! - `corpus`: Example records, validation and JSONL loading
//! - `formatting`: Per-example separators, mode swap and truncation
//! - `sampler`: Demonstration sampling without replacement
//! - `masks`: Packing into fixed-length rows with attention and segment masks
//! - `tensorize`: Training and evaluation tensor tables
//! - `cache`: Sharded, parallel tensorization persisted as safetensors
//! - `model`: CausalLm boundary, candle batches, per-row loss and inference
//! - `scoring`: Option aggregation, accuracy / macro-F1 and calibration
//! - `experiment`: Multi-task evaluation runner

pub mod cache;
pub mod config;
pub mod corpus;
pub mod error;
pub mod experiment;
pub mod formatting;
pub mod masks;
pub mod model;
pub mod sampler;
pub mod scoring;
pub mod tensorize;
pub mod tokenizer;

pub use cache::{
    read_shard, write_shard, CacheKey, Materialized, Partition, ShardSelection,
    ShardedTensorizationCache,
};
pub use config::{DataConfig, Method, TaskConfig, TruncationPolicy, MAX_CONTEXT_LENGTH};
pub use corpus::{
    load_jsonl, load_task_data, parse_evaluation, parse_training, EvaluationExample,
    TrainingExample,
};
pub use error::{MetaIclError, Result};
pub use experiment::{
    EvaluationConfig, EvaluationResults, EvaluationRun, LossRequest, LossSource, ModelLosses,
    PrecomputedLosses, TaskResult,
};
pub use formatting::{ExampleFormatter, OptionPairs, TokenPair};
pub use masks::{pack, PackedRow, PAD_TOKEN_ID};
pub use model::{per_row_loss, run_inference, Batch, CausalLm};
pub use sampler::DemonstrationSampler;
pub use scoring::{calibrate, evaluate, Groundtruth, ScoreAggregator};
pub use tensorize::{render_row, EvaluationSet, ExampleMetadata, TensorTable, Tensorizer};
pub use tokenizer::{ByteTokenizer, HfTokenizer, TokenEncoder};
