//! Tensorization: formatted examples -> fixed-length tensor tables
//!
//! - Training: every example becomes a query preceded by k demonstrations
//!   drawn at random from the same partition (never itself).
//! - Evaluation: one fixed k-shot demonstration block is shared by every
//!   option of every test example; metadata maps each test example to the
//!   rows holding its options.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::DataConfig;
use crate::corpus::{check_shared_options, EvaluationExample, TrainingExample};
use crate::error::{MetaIclError, Result};
use crate::formatting::{ExampleFormatter, TokenPair};
use crate::masks::{pack, PackedRow};
use crate::sampler::DemonstrationSampler;
use crate::tokenizer::TokenEncoder;

/// Packed rows of one dataset, all of the same length
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TensorTable {
    max_length: usize,
    rows: Vec<PackedRow>,
}

impl TensorTable {
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length,
            rows: Vec::new(),
        }
    }

    /// Build from rows, checking that every row has `max_length` positions
    pub fn from_rows(max_length: usize, rows: Vec<PackedRow>) -> Result<Self> {
        if let Some(bad) = rows.iter().find(|r| {
            r.input_ids.len() != max_length
                || r.attention_mask.len() != max_length
                || r.segment_mask.len() != max_length
        }) {
            return Err(MetaIclError::Length {
                context_len: bad.context_ids().len(),
                continuation_len: bad.continuation_ids().len(),
                max_length,
            });
        }
        Ok(Self { max_length, rows })
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[PackedRow] {
        &self.rows
    }

    pub fn get(&self, idx: usize) -> Option<&PackedRow> {
        self.rows.get(idx)
    }

    pub fn into_rows(self) -> Vec<PackedRow> {
        self.rows
    }

    pub fn push(&mut self, row: PackedRow) {
        debug_assert_eq!(row.len(), self.max_length);
        self.rows.push(row);
    }

    /// Append another table's rows in order
    pub fn append(&mut self, other: TensorTable) {
        self.rows.extend(other.rows);
    }

    /// Randomly permute the row order
    pub fn shuffle<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.rows.shuffle(rng);
    }

    /// Split into `n` contiguous shards of `ceil(len / n)` rows (the last ones may be shorter)
    pub fn into_shards(self, n: usize) -> Vec<TensorTable> {
        let n = n.max(1);
        let per_shard = self.rows.len().div_ceil(n);
        let max_length = self.max_length;
        let mut rows = self.rows.into_iter();
        (0..n)
            .map(|_| TensorTable {
                max_length,
                rows: rows.by_ref().take(per_shard).collect(),
            })
            .collect()
    }

    /// Split off a validation table of `floor(fraction * len)` random rows
    pub fn split_validation<R: Rng + ?Sized>(
        mut self,
        fraction: f64,
        rng: &mut R,
    ) -> Result<(TensorTable, TensorTable)> {
        if !(0.0..=1.0).contains(&fraction) {
            return Err(MetaIclError::validation(format!(
                "Validation fraction must be within [0, 1], got {fraction}"
            )));
        }
        let val_size = (fraction * self.rows.len() as f64) as usize;
        self.rows.shuffle(rng);
        let val_rows = self.rows.split_off(self.rows.len() - val_size);
        let max_length = self.max_length;
        Ok((
            self,
            TensorTable {
                max_length,
                rows: val_rows,
            },
        ))
    }

    /// Loss over every real token instead of the continuation only
    pub fn without_loss_masking(&self) -> Self {
        Self {
            max_length: self.max_length,
            rows: self.rows.iter().map(PackedRow::unmasked).collect(),
        }
    }
}

/// Row bookkeeping for one test example
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExampleMetadata {
    /// Row indices holding each option, in option order
    pub indices: Vec<Vec<usize>>,
    /// Index of the true answer within `options`
    pub answer: usize,
    pub options: Vec<String>,
}

/// Tensors plus metadata for one evaluation task
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationSet {
    pub table: TensorTable,
    pub metadata: Vec<ExampleMetadata>,
}

/// Builds tensor tables from validated examples
pub struct Tensorizer<'a> {
    tokenizer: &'a dyn TokenEncoder,
    config: DataConfig,
}

impl<'a> Tensorizer<'a> {
    pub fn new(tokenizer: &'a dyn TokenEncoder, config: DataConfig) -> Self {
        Self { tokenizer, config }
    }

    pub fn config(&self) -> &DataConfig {
        &self.config
    }

    pub fn tokenizer(&self) -> &'a dyn TokenEncoder {
        self.tokenizer
    }

    fn formatter(&self) -> ExampleFormatter<'a> {
        ExampleFormatter::new(self.tokenizer, &self.config)
    }

    /// Tensorize one partition of training examples.
    ///
    /// Fails with [`MetaIclError::Budget`] if any example in the partition
    /// cannot fit its budget; the caller decides to skip the partition.
    pub fn tensorize_for_training<R: Rng + ?Sized>(
        &self,
        examples: &[TrainingExample],
        rng: &mut R,
    ) -> Result<TensorTable> {
        let formatter = self.formatter();
        let max_length = self.config.max_length;
        let mut table = TensorTable::new(max_length);

        if !self.config.use_demonstrations {
            for example in examples {
                let pair = formatter.format_labeled(example, true)?;
                table.push(pack(&pair.context, &pair.continuation, max_length, false)?);
            }
            return Ok(table);
        }

        let first = examples
            .iter()
            .map(|e| formatter.format_labeled(e, true))
            .collect::<Result<Vec<TokenPair>>>()?;
        let non_first = examples
            .iter()
            .map(|e| formatter.format_labeled(e, false))
            .collect::<Result<Vec<TokenPair>>>()?;

        let sampler = DemonstrationSampler::new(self.config.k);
        for (query_idx, query) in non_first.iter().enumerate() {
            for _ in 0..self.config.repeat {
                let demonstrations = sampler.sample(rng, examples.len(), query_idx)?;
                let mut context = Vec::new();
                for (position, &idx) in demonstrations.iter().enumerate() {
                    let demo = if position == 0 {
                        &first[idx]
                    } else {
                        &non_first[idx]
                    };
                    context.extend_from_slice(&demo.context);
                    context.extend_from_slice(&demo.continuation);
                }
                context.extend_from_slice(&query.context);
                table.push(pack(&context, &query.continuation, max_length, true)?);
            }
        }

        debug!(
            "Tensorized {} examples into {} rows",
            examples.len(),
            table.len()
        );
        Ok(table)
    }

    /// Format the k-shot support set into one demonstration token block
    pub fn demonstration_block(&self, demonstrations: &[TrainingExample]) -> Result<Vec<u32>> {
        if demonstrations.len() != self.config.k {
            return Err(MetaIclError::validation(format!(
                "Expected {} demonstrations, got {}",
                self.config.k,
                demonstrations.len()
            )));
        }
        let formatter = self.formatter();
        let mut block = Vec::new();
        for (i, demo) in demonstrations.iter().enumerate() {
            block.extend(formatter.format_labeled(demo, i == 0)?.concatenated());
        }
        Ok(block)
    }

    /// Tensorize test examples, one row per option.
    ///
    /// `demonstrations` is the fixed k-shot support set; it is ignored when
    /// demonstrations are disabled.
    pub fn tensorize(
        &self,
        demonstrations: &[TrainingExample],
        test: &[EvaluationExample],
    ) -> Result<EvaluationSet> {
        let use_demonstrations = self.config.use_demonstrations;
        let block = if use_demonstrations {
            self.demonstration_block(demonstrations)?
        } else {
            Vec::new()
        };

        let formatter = self.formatter();
        let max_length = self.config.max_length;
        let mut table = TensorTable::new(max_length);
        let mut metadata = Vec::with_capacity(test.len());

        for example in test {
            let options = formatter.format_options(example, !use_demonstrations)?;
            let start = table.len();
            metadata.push(ExampleMetadata {
                indices: (start..start + options.pairs.len()).map(|i| vec![i]).collect(),
                answer: options.answer,
                options: example.options.clone(),
            });

            for pair in options.pairs {
                let mut context = block.clone();
                context.extend(pair.context);
                table.push(pack(&context, &pair.continuation, max_length, use_demonstrations)?);
            }
        }

        Ok(EvaluationSet { table, metadata })
    }

    /// Tensorize plain test inputs that all share one option list.
    ///
    /// Every demonstration label must be one of `options`.
    pub fn tensorize_with_shared_options(
        &self,
        demonstrations: &[TrainingExample],
        task: &str,
        inputs: &[String],
        options: &[String],
    ) -> Result<EvaluationSet> {
        if self.config.use_demonstrations {
            check_shared_options(demonstrations, options)?;
        }
        let test = inputs
            .iter()
            .map(|input| EvaluationExample::with_shared_options(task, input.as_str(), options))
            .collect::<Result<Vec<_>>>()?;
        self.tensorize(demonstrations, &test)
    }

    /// Human-readable summary of the configuration and a tensorized set
    pub fn describe(&self, set: Option<&EvaluationSet>) -> String {
        let mut text = format!("[MetaICL Data]: method={}, ", self.config.method);
        if self.config.use_demonstrations {
            text.push_str(&format!("{} demonstrations\n", self.config.k));
        } else {
            text.push_str("no demonstrations\n");
        }
        match set {
            None => text.push_str("Currently not containing any examples"),
            Some(set) => {
                text.push_str(&format!(
                    "Currently containing {} examples with {} tensors to be fed in\n",
                    set.metadata.len(),
                    set.table.len()
                ));
                if let Some(rendered) = set.table.get(0).and_then(|row| render_row(row, self.tokenizer).ok()) {
                    text.push('\n');
                    text.push_str(&rendered);
                }
            }
        }
        let rule = "=".repeat(50);
        format!("{rule}\n{text}\n{rule}")
    }
}

/// Decode a packed row into its context and answer text
pub fn render_row(row: &PackedRow, tokenizer: &dyn TokenEncoder) -> Result<String> {
    let context = row.context_ids();
    let answer = row.continuation_ids();
    Ok(format!(
        "input_ids: ({}) {:?}\nsegment_mask: ({}) {:?}\n\ncontext_input_ids: ({}) {:?}\nanswer_input_ids: ({}) {:?}\nTotal ids excluding padding: {}\n\nCONTEXT:\n{}\n\nANSWER:\n{}",
        row.input_ids.len(),
        row.input_ids,
        row.segment_mask.len(),
        row.segment_mask,
        context.len(),
        context,
        answer.len(),
        answer,
        row.n_tokens(),
        tokenizer.decode(context)?,
        tokenizer.decode(&answer)?,
    ))
}
