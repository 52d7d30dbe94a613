//! Example records and JSONL loading
//!
//! Raw records are JSON objects. They are validated once, at the boundary,
//! into [`TrainingExample`] or [`EvaluationExample`]; nothing downstream
//! looks at untyped JSON again.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{MetaIclError, Result};

/// A labeled example used for training or as a demonstration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingExample {
    pub task: String,
    pub input: String,
    pub output: String,
}

/// A test example scored over its answer options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationExample {
    pub task: String,
    pub input: String,
    pub output: String,
    pub options: Vec<String>,
}

fn field_str<'a>(obj: &'a serde_json::Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(Value::as_str)
}

fn as_object<'a>(value: &'a Value, kind: &str) -> Result<&'a serde_json::Map<String, Value>> {
    value
        .as_object()
        .ok_or_else(|| MetaIclError::validation(format!("{kind} example should be a dictionary: {value}")))
}

impl TrainingExample {
    pub fn new(task: impl Into<String>, input: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            input: input.into(),
            output: output.into(),
        }
    }

    /// Validate a raw record: it must be an object with string `input` and `output`.
    pub fn from_value(value: &Value) -> Result<Self> {
        let obj = as_object(value, "Training")?;
        let (Some(input), Some(output)) = (field_str(obj, "input"), field_str(obj, "output")) else {
            return Err(MetaIclError::validation(format!(
                "Training example should contain input and output: {value}"
            )));
        };
        Ok(Self::new(field_str(obj, "task").unwrap_or_default(), input, output))
    }
}

impl EvaluationExample {
    /// Build a validated evaluation example.
    ///
    /// `output` defaults to the first option when the record has no label.
    pub fn new(
        task: impl Into<String>,
        input: impl Into<String>,
        output: Option<String>,
        options: Vec<String>,
    ) -> Result<Self> {
        let task = task.into();
        if options.len() < 2 {
            return Err(MetaIclError::validation(format!(
                "Test example from task {task:?} needs at least 2 options, got {}",
                options.len()
            )));
        }
        let output = output.unwrap_or_else(|| options[0].clone());
        if !options.contains(&output) {
            return Err(MetaIclError::validation(format!(
                "Answer {output:?} is not among the options of task {task:?}: {options:?}"
            )));
        }
        Ok(Self {
            task,
            input: input.into(),
            output,
            options,
        })
    }

    /// A plain test input scored against a shared option list.
    pub fn with_shared_options(
        task: impl Into<String>,
        input: impl Into<String>,
        options: &[String],
    ) -> Result<Self> {
        Self::new(task, input, None, options.to_vec())
    }

    /// Validate a raw record: an object with string `input` and an `options` list of strings.
    pub fn from_value(value: &Value) -> Result<Self> {
        let obj = as_object(value, "Test")?;
        let input = field_str(obj, "input");
        let options = obj.get("options").and_then(Value::as_array);
        let (Some(input), Some(options)) = (input, options) else {
            return Err(MetaIclError::validation(format!(
                "Test example should contain input and options in a list format: {value}"
            )));
        };
        let options = options
            .iter()
            .map(|o| {
                o.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| MetaIclError::validation(format!("Option is not a string: {o}")))
            })
            .collect::<Result<Vec<_>>>()?;
        let output = field_str(obj, "output").map(str::to_string);
        Self::new(field_str(obj, "task").unwrap_or_default(), input, output, options)
    }

    /// Index of the true answer within `options`
    pub fn answer_index(&self) -> usize {
        self.options
            .iter()
            .position(|o| o == &self.output)
            .unwrap_or_default()
    }
}

/// Check that every demonstration label is one of the shared options.
pub fn check_shared_options(demonstrations: &[TrainingExample], options: &[String]) -> Result<()> {
    match demonstrations.iter().find(|d| !options.contains(&d.output)) {
        Some(d) => Err(MetaIclError::validation(format!(
            "Demonstration output {:?} is not among the shared options {options:?}",
            d.output
        ))),
        None => Ok(()),
    }
}

/// Read one JSON value per non-empty line.
pub fn load_jsonl(path: &Path) -> Result<Vec<Value>> {
    let file = std::fs::File::open(path)?;
    let mut records = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str(&line)?);
    }
    Ok(records)
}

/// Validate every record as a training example before any work starts
pub fn parse_training(records: &[Value]) -> Result<Vec<TrainingExample>> {
    records.iter().map(TrainingExample::from_value).collect()
}

/// Validate every record as an evaluation example before any work starts
pub fn parse_evaluation(records: &[Value]) -> Result<Vec<EvaluationExample>> {
    records.iter().map(EvaluationExample::from_value).collect()
}

/// `<data_dir>/<task>/<task>_<k>_<seed>_<split>.jsonl`
pub fn task_data_path(data_dir: &Path, task: &str, k: usize, seed: &str, split: &str) -> PathBuf {
    data_dir
        .join(task)
        .join(format!("{task}_{k}_{seed}_{split}.jsonl"))
}

/// Load the raw records of one task split
pub fn load_task_data(
    data_dir: &Path,
    task: &str,
    k: usize,
    seed: &str,
    split: &str,
) -> Result<Vec<Value>> {
    load_jsonl(&task_data_path(data_dir, task, k, seed, split))
}

/// Number of examples per task, in task-name order
pub fn count_by_task<'a>(tasks: impl IntoIterator<Item = &'a str>) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for task in tasks {
        *counts.entry(task.to_string()).or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_training_validation() {
        let ok = TrainingExample::from_value(&json!({"task": "t", "input": "x", "output": "y"})).unwrap();
        assert_eq!(ok, TrainingExample::new("t", "x", "y"));

        let err = TrainingExample::from_value(&json!({"task": "t", "input": "x"})).unwrap_err();
        assert!(matches!(err, MetaIclError::Validation(_)));

        let err = TrainingExample::from_value(&json!("just a string")).unwrap_err();
        assert!(matches!(err, MetaIclError::Validation(_)));
    }

    #[test]
    fn test_evaluation_validation() {
        let ex = EvaluationExample::from_value(
            &json!({"task": "t", "input": "x", "output": "no", "options": ["yes", "no"]}),
        )
        .unwrap();
        assert_eq!(ex.answer_index(), 1);

        // Missing output falls back to the first option
        let ex = EvaluationExample::from_value(&json!({"input": "x", "options": ["a", "b"]})).unwrap();
        assert_eq!(ex.output, "a");
        assert_eq!(ex.answer_index(), 0);

        let too_short = EvaluationExample::from_value(&json!({"input": "x", "options": ["a"]}));
        assert!(matches!(too_short, Err(MetaIclError::Validation(_))));

        let not_listed = EvaluationExample::from_value(
            &json!({"input": "x", "output": "c", "options": ["a", "b"]}),
        );
        assert!(matches!(not_listed, Err(MetaIclError::Validation(_))));

        let not_list = EvaluationExample::from_value(&json!({"input": "x", "options": "a,b"}));
        assert!(matches!(not_list, Err(MetaIclError::Validation(_))));
    }

    #[test]
    fn test_shared_options() {
        let options = vec!["positive".to_string(), "negative".to_string()];
        let ex = EvaluationExample::with_shared_options("sst2", "great movie", &options).unwrap();
        assert_eq!(ex.options, options);

        let demos = vec![TrainingExample::new("sst2", "a", "positive")];
        assert!(check_shared_options(&demos, &options).is_ok());
        let demos = vec![TrainingExample::new("sst2", "a", "neutral")];
        assert!(check_shared_options(&demos, &options).is_err());
    }

    #[test]
    fn test_task_data_path() {
        let path = task_data_path(Path::new("data"), "glue-sst2", 16, "100", "train");
        assert_eq!(path, Path::new("data/glue-sst2/glue-sst2_16_100_train.jsonl"));
    }

    #[test]
    fn test_count_by_task() {
        let counts = count_by_task(["b", "a", "b"]);
        assert_eq!(counts.get("a"), Some(&1));
        assert_eq!(counts.get("b"), Some(&2));
    }
}
