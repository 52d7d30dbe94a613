//! Configuration for tensorization and evaluation
//!
//! Everything the core needs arrives through these values; the CLI builds
//! them from flags and nothing in the library reads flags or the environment.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Hard cap on the packed sequence length (GPT-2 context size).
pub const MAX_CONTEXT_LENGTH: usize = 1024;

/// Formatting mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    /// Predict the output given the input
    Direct,
    /// Predict the input given the output
    Channel,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Direct => "direct",
            Method::Channel => "channel",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task-name prefixes whose examples split the length budget evenly
/// between input and output instead of truncating one side.
///
/// Long-answer tasks that are not listed here fall back to the general rule,
/// which may drop most of a long output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruncationPolicy {
    pub balanced_prefixes: Vec<String>,
    /// Prefix marking instruction tasks, whose input is kept intact
    pub instruction_prefix: String,
}

impl Default for TruncationPolicy {
    fn default() -> Self {
        Self {
            balanced_prefixes: vec![
                "inst:piqa".to_string(),
                "inst:yahoo_answers_topics".to_string(),
            ],
            instruction_prefix: "inst:".to_string(),
        }
    }
}

impl TruncationPolicy {
    pub fn is_balanced(&self, task: &str) -> bool {
        self.balanced_prefixes.iter().any(|p| task.starts_with(p))
    }

    pub fn is_instruction(&self, task: &str) -> bool {
        task.starts_with(&self.instruction_prefix)
    }
}

/// Configuration for MetaICL data preparation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    pub method: Method,
    /// Concatenate k demonstrations in front of each query
    pub use_demonstrations: bool,
    /// Number of demonstrations
    pub k: usize,
    /// Packed row length
    pub max_length: usize,
    /// Per-example token budget before concatenation
    pub max_length_per_example: usize,
    /// Separate examples with newlines (otherwise single spaces)
    pub add_newlines: bool,
    /// Demonstration draws per training example
    pub repeat: usize,
    /// Worker threads for the tensorization fan-out
    pub n_process: usize,
    /// Number of shards (one per training consumer)
    pub n_gpu: usize,
    /// Rank of the consumer loading shards (None = load all)
    pub local_rank: Option<usize>,
    pub tensorize_dir: PathBuf,
    /// Seed for demonstration sampling, subsampling and the shard permutation
    pub seed: u64,
    pub truncation: TruncationPolicy,
    /// Training data is subsampled per task when it spans more than this many tasks...
    pub subsample_min_tasks: usize,
    /// ...and holds at least this many examples
    pub subsample_min_examples: usize,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            method: Method::Direct,
            use_demonstrations: true,
            k: 16,
            max_length: MAX_CONTEXT_LENGTH,
            max_length_per_example: 256,
            add_newlines: true,
            repeat: 1,
            n_process: 4,
            n_gpu: 1,
            local_rank: None,
            tensorize_dir: PathBuf::from("tensorized"),
            seed: 100,
            truncation: TruncationPolicy::default(),
            subsample_min_tasks: 200,
            subsample_min_examples: 1_638_400,
        }
    }
}

impl DataConfig {
    /// Packed length derived from a per-example base length.
    ///
    /// With demonstrations the row must hold k examples: `min(base * k, 1024)`.
    pub fn effective_max_length(&self, base: usize) -> usize {
        if self.use_demonstrations {
            (base * self.k).min(MAX_CONTEXT_LENGTH)
        } else {
            base.min(MAX_CONTEXT_LENGTH)
        }
    }

    /// Whether a training corpus is large enough to be subsampled per task
    pub fn should_subsample(&self, n_tasks: usize, n_examples: usize) -> bool {
        n_tasks > self.subsample_min_tasks && n_examples >= self.subsample_min_examples
    }

    /// Method label used in cache keys (`direct-demon`, `channel`, ...)
    pub fn method_name(&self) -> String {
        if self.use_demonstrations {
            format!("{}-demon", self.method)
        } else {
            self.method.to_string()
        }
    }
}

/// Per-task configuration file (`<config_dir>/<task>.json`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    pub task_type: String,
    #[serde(default)]
    pub options: Option<Vec<String>>,
}

impl TaskConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Load `<config_dir>/<task>.json`
    pub fn for_task(config_dir: &Path, task: &str) -> Result<Self> {
        Self::load(&config_dir.join(format!("{task}.json")))
    }

    /// Classification tasks are scored by macro-F1, everything else by accuracy
    pub fn is_classification(&self) -> bool {
        self.task_type == "classification"
    }
}
