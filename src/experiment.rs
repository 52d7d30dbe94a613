//! Multi-task evaluation runner
//!
//! Coordinates data loading, tensorization, loss computation and scoring
//! for a list of test tasks.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use candle_core::Device;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::config::{DataConfig, TaskConfig};
use crate::corpus::{check_shared_options, load_task_data, parse_evaluation, parse_training, EvaluationExample, TrainingExample};
use crate::error::{MetaIclError, Result};
use crate::model::{run_inference, CausalLm};
use crate::scoring::{calibrate, Groundtruth, ScoreAggregator};
use crate::tensorize::{EvaluationSet, Tensorizer};
use crate::tokenizer::TokenEncoder;

/// Test input used for the null-prompt calibration run
pub const NULL_INPUT: &str = "N/A";

/// Configuration for an evaluation run
#[derive(Debug, Clone)]
pub struct EvaluationConfig {
    /// Root of `<task>/<task>_<k>_<seed>_<split>.jsonl` files
    pub data_dir: PathBuf,
    /// Directory of `<task>.json` task configs
    pub config_dir: PathBuf,
    pub tasks: Vec<String>,
    /// Split holding the test examples
    pub split: String,
    /// Seeds of the k-shot support sets, assigned to tasks round-robin
    pub seeds: Vec<String>,
    /// Seed in the file name of the test split
    pub test_seed: String,
    pub max_examples_per_task: Option<usize>,
    /// Subtract null-input losses before predicting
    pub use_calibration: bool,
    /// Where computed losses are saved as JSON (None = not saved)
    pub out_dir: Option<PathBuf>,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            config_dir: PathBuf::from("config/tasks"),
            tasks: vec![],
            split: "dev".to_string(),
            seeds: vec!["100".to_string()],
            test_seed: "100".to_string(),
            max_examples_per_task: None,
            use_calibration: false,
            out_dir: None,
        }
    }
}

/// Identifies one set of losses to compute or look up
#[derive(Debug, Clone)]
pub struct LossRequest {
    pub task: String,
    pub seed: String,
    /// Losses of the null-input run
    pub null: bool,
    /// File name the losses are saved under
    pub file_name: String,
}

/// Produces one loss per row of an evaluation set
pub trait LossSource {
    fn losses(&mut self, request: &LossRequest, set: &EvaluationSet) -> Result<Vec<f32>>;
}

/// Losses computed by running a model
pub struct ModelLosses<'m> {
    model: &'m dyn CausalLm,
    device: Device,
    batch_size: usize,
}

impl<'m> ModelLosses<'m> {
    pub fn new(model: &'m dyn CausalLm, device: Device, batch_size: usize) -> Self {
        Self {
            model,
            device,
            batch_size,
        }
    }
}

impl LossSource for ModelLosses<'_> {
    fn losses(&mut self, _request: &LossRequest, set: &EvaluationSet) -> Result<Vec<f32>> {
        run_inference(self.model, &set.table, self.batch_size, &self.device)
    }
}

/// Losses saved by an earlier run (JSON arrays in one directory)
pub struct PrecomputedLosses {
    dir: PathBuf,
}

impl PrecomputedLosses {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl LossSource for PrecomputedLosses {
    fn losses(&mut self, request: &LossRequest, _set: &EvaluationSet) -> Result<Vec<f32>> {
        let path = self.dir.join(&request.file_name);
        let file = File::open(&path).map_err(|e| {
            MetaIclError::validation(format!("Cannot read losses {}: {e}", path.display()))
        })?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }
}

/// `<task>-<split>[-null]-<method>[-k=K-s=SEED][-no-newlines].json`
pub fn loss_file_name(config: &DataConfig, task: &str, split: &str, seed: &str, null: bool) -> String {
    let mut name = format!("{task}-{split}");
    if null {
        name.push_str("-null");
    }
    name.push('-');
    name.push_str(config.method.as_str());
    if config.use_demonstrations {
        name.push_str(&format!("-k={}-s={seed}", config.k));
    }
    if !config.add_newlines {
        name.push_str("-no-newlines");
    }
    name.push_str(".json");
    name
}

/// Score of one test task
#[derive(Debug, Clone, Serialize)]
pub struct TaskResult {
    pub task: String,
    pub seed: String,
    pub is_classification: bool,
    pub n_examples: usize,
    pub n_rows: usize,
    /// Macro-F1 for classification, accuracy otherwise
    pub score: f64,
    pub predictions: Vec<String>,
}

/// Results of a full evaluation run
#[derive(Debug, Clone, Default, Serialize)]
pub struct EvaluationResults {
    pub tasks: Vec<TaskResult>,
    /// `task/seed: reason` for every task that failed
    pub errors: Vec<String>,
}

impl EvaluationResults {
    /// Mean score over the tasks that succeeded
    pub fn mean(&self) -> Option<f64> {
        if self.tasks.is_empty() {
            return None;
        }
        Some(self.tasks.iter().map(|t| t.score).sum::<f64>() / self.tasks.len() as f64)
    }

    pub fn score_of(&self, task: &str) -> Option<f64> {
        self.tasks.iter().find(|t| t.task == task).map(|t| t.score)
    }
}

/// Main evaluation runner
pub struct EvaluationRun<'a> {
    tokenizer: &'a dyn TokenEncoder,
    data: DataConfig,
    config: EvaluationConfig,
}

impl<'a> EvaluationRun<'a> {
    pub fn new(tokenizer: &'a dyn TokenEncoder, data: DataConfig, config: EvaluationConfig) -> Self {
        Self {
            tokenizer,
            data,
            config,
        }
    }

    /// Evaluate every configured task; failing tasks are recorded, not fatal
    pub fn run(&self, source: &mut dyn LossSource) -> Result<EvaluationResults> {
        if self.config.tasks.is_empty() {
            return Err(MetaIclError::validation("No test tasks given"));
        }
        if self.config.seeds.is_empty() {
            return Err(MetaIclError::validation("No seeds given"));
        }
        info!("Starting evaluation of {} tasks", self.config.tasks.len());
        info!(
            "method={}, k={}, max_length={}, max_length_per_example={}",
            self.data.method_name(),
            self.data.k,
            self.data.max_length,
            self.data.max_length_per_example
        );

        let mut results = EvaluationResults::default();
        for (task_idx, task) in self.config.tasks.iter().enumerate() {
            let seed = &self.config.seeds[task_idx % self.config.seeds.len()];
            info!(
                "--- SEED {} | TEST TASK ({} / {}): {}",
                seed,
                task_idx,
                self.config.tasks.len(),
                task
            );
            match self.run_task(task, seed, source) {
                Ok(result) => {
                    info!("{}: score={:.4}", task, result.score);
                    results.tasks.push(result);
                }
                Err(e) => {
                    warn!("Task {} (seed {}) failed: {}", task, seed, e);
                    results.errors.push(format!("{task}/{seed}: {e}"));
                }
            }
        }

        if let Some(mean) = results.mean() {
            info!(
                "Mean score over {} tasks: {:.1}",
                results.tasks.len(),
                100.0 * mean
            );
        }
        if !results.errors.is_empty() {
            warn!("Errors with datasets: {}", results.errors.join(", "));
        }
        Ok(results)
    }

    fn run_task(&self, task: &str, seed: &str, source: &mut dyn LossSource) -> Result<TaskResult> {
        let data_dir = &self.config.data_dir;
        let k = self.data.k;

        let mut test_records = load_task_data(data_dir, task, k, &self.config.test_seed, &self.config.split)?;
        if let Some(max) = self.config.max_examples_per_task {
            test_records.truncate(max);
        }
        if test_records.is_empty() {
            return Err(MetaIclError::validation(format!("No test examples for task {task}")));
        }
        let test = parse_evaluation(&test_records)?;

        let (train_records, demonstrations) = if self.data.use_demonstrations {
            let records = load_task_data(data_dir, task, k, seed, "train")?;
            let demonstrations = parse_training(&records)?;
            if demonstrations.len() != k {
                return Err(MetaIclError::validation(format!(
                    "Expected {k} demonstrations for task {task}, found {}",
                    demonstrations.len()
                )));
            }
            (records, demonstrations)
        } else {
            (vec![], vec![])
        };

        let task_config = TaskConfig::for_task(&self.config.config_dir, task)?;
        let is_classification = task_config.is_classification();
        if is_classification {
            check_option_consistency(&test, &train_records)?;
        }
        if let Some(options) = &task_config.options {
            check_shared_options(&demonstrations, options)?;
            if let Some(bad) = test.iter().find(|e| &e.options != options) {
                return Err(MetaIclError::validation(format!(
                    "Test options {:?} differ from the configured {options:?}",
                    bad.options
                )));
            }
        }

        let tensorizer = Tensorizer::new(self.tokenizer, self.data.clone());
        let set = tensorizer.tensorize(&demonstrations, &test)?;
        info!("{}", tensorizer.describe(Some(&set)));

        let mut losses = self.losses_for(task, seed, false, &set, source)?;
        if self.config.use_calibration {
            let null_set = self.null_set(&tensorizer, &demonstrations, &test)?;
            let null_losses = self.losses_for(task, seed, true, &null_set, source)?;
            losses = calibrate(&losses, &null_losses)?;
        }

        let groundtruths: Vec<Groundtruth> = test_records
            .iter()
            .zip(&test)
            .map(|(record, example)| groundtruth_of(record, example))
            .collect();
        let (predictions, score) = ScoreAggregator::aggregate_and_evaluate(
            &losses,
            &set.metadata,
            &groundtruths,
            is_classification,
        )?;

        Ok(TaskResult {
            task: task.to_string(),
            seed: seed.to_string(),
            is_classification,
            n_examples: test.len(),
            n_rows: set.table.len(),
            score,
            predictions,
        })
    }

    /// The same test examples with every input replaced by [`NULL_INPUT`]
    fn null_set(
        &self,
        tensorizer: &Tensorizer<'_>,
        demonstrations: &[TrainingExample],
        test: &[EvaluationExample],
    ) -> Result<EvaluationSet> {
        let null_test: Vec<EvaluationExample> = test
            .iter()
            .map(|e| EvaluationExample {
                input: NULL_INPUT.to_string(),
                ..e.clone()
            })
            .collect();
        tensorizer.tensorize(demonstrations, &null_test)
    }

    fn losses_for(
        &self,
        task: &str,
        seed: &str,
        null: bool,
        set: &EvaluationSet,
        source: &mut dyn LossSource,
    ) -> Result<Vec<f32>> {
        let request = LossRequest {
            task: task.to_string(),
            seed: seed.to_string(),
            null,
            file_name: loss_file_name(&self.data, task, &self.config.split, seed, null),
        };
        let losses = source.losses(&request, set)?;
        if losses.len() != set.table.len() {
            return Err(MetaIclError::validation(format!(
                "Got {} losses for {} rows ({})",
                losses.len(),
                set.table.len(),
                request.file_name
            )));
        }
        if let Some(out_dir) = &self.config.out_dir {
            save_losses(&out_dir.join(&request.file_name), &losses)?;
        }
        Ok(losses)
    }
}

fn save_losses(path: &Path, losses: &[f32]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer(writer, losses)?;
    info!("Saved losses to {}", path.display());
    Ok(())
}

/// Classification tasks must share one option list across test and support records
fn check_option_consistency(test: &[EvaluationExample], train_records: &[Value]) -> Result<()> {
    let Some(first) = test.first() else {
        return Ok(());
    };
    let options = &first.options;
    if let Some(bad) = test.iter().find(|e| &e.options != options) {
        return Err(MetaIclError::validation(format!(
            "Test options {:?} differ from {:?}",
            bad.options, options
        )));
    }
    for record in train_records {
        if let Some(train_options) = record.get("options") {
            let matches = train_options
                .as_array()
                .is_some_and(|list| list.iter().map(Value::as_str).eq(options.iter().map(|o| Some(o.as_str()))));
            if !matches {
                return Err(MetaIclError::validation(format!(
                    "Demonstration options {train_options} differ from {options:?}"
                )));
            }
        }
    }
    Ok(())
}

/// A record's `output` may be a single answer or a list of acceptable ones
fn groundtruth_of(record: &Value, example: &EvaluationExample) -> Groundtruth {
    match record.get("output") {
        Some(Value::Array(answers)) => Groundtruth::AnyOf(
            answers
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
        ),
        _ => Groundtruth::Single(example.output.clone()),
    }
}
