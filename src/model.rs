//! Model boundary: candle batches, per-row loss and inference
//!
//! The language model itself is an external collaborator behind
//! [`CausalLm`]. This module turns packed rows into candle tensors and the
//! returned logits into one loss per row.

use candle_core::{DType, Device, Tensor, D};
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{debug, info};

use crate::error::{MetaIclError, Result};
use crate::masks::PackedRow;
use crate::tensorize::TensorTable;

/// A causal language model returning per-token logits.
///
/// `input_ids` and `attention_mask` are `(batch, seq)` U32 tensors; the
/// result is `(batch, seq, vocab)`.
pub trait CausalLm {
    fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor>;
}

/// One batch of packed rows on a device
#[derive(Debug, Clone)]
pub struct Batch {
    pub input_ids: Tensor,
    pub attention_mask: Tensor,
    pub segment_mask: Tensor,
}

impl Batch {
    pub fn from_rows(rows: &[&PackedRow], max_length: usize, device: &Device) -> Result<Self> {
        let shape = (rows.len(), max_length);
        let stack = |field: fn(&PackedRow) -> &[u32]| -> Result<Tensor> {
            let data: Vec<u32> = rows.iter().flat_map(|&r| field(r).iter().copied()).collect();
            Ok(Tensor::from_vec(data, shape, device)?)
        };
        Ok(Self {
            input_ids: stack(|r| r.input_ids.as_slice())?,
            attention_mask: stack(|r| r.attention_mask.as_slice())?,
            segment_mask: stack(|r| r.segment_mask.as_slice())?,
        })
    }

    pub fn len(&self) -> usize {
        self.input_ids.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TensorTable {
    /// Batches in row order, the last one possibly smaller
    pub fn batches(&self, batch_size: usize, device: &Device) -> Result<Vec<Batch>> {
        let rows: Vec<&PackedRow> = self.rows().iter().collect();
        self.collect_batches(&rows, batch_size, device)
    }

    /// Batches over a random permutation of the rows
    pub fn shuffled_batches<R: Rng + ?Sized>(
        &self,
        batch_size: usize,
        rng: &mut R,
        device: &Device,
    ) -> Result<Vec<Batch>> {
        let mut rows: Vec<&PackedRow> = self.rows().iter().collect();
        rows.shuffle(rng);
        self.collect_batches(&rows, batch_size, device)
    }

    fn collect_batches(&self, rows: &[&PackedRow], batch_size: usize, device: &Device) -> Result<Vec<Batch>> {
        if batch_size == 0 {
            return Err(MetaIclError::validation("batch_size must be positive"));
        }
        rows.chunks(batch_size)
            .map(|chunk| Batch::from_rows(chunk, self.max_length(), device))
            .collect()
    }
}

/// Mean continuation loss per row.
///
/// Logits at position `t` are scored against the token at `t + 1`; only
/// positions whose target lies in the segment mask count. With
/// `label_smoothing > 0` the target distribution puts that much mass
/// uniformly over the vocabulary.
pub fn per_row_loss(
    logits: &Tensor,
    input_ids: &Tensor,
    segment_mask: &Tensor,
    label_smoothing: f64,
) -> Result<Tensor> {
    let (_batch, seq_len, _vocab) = logits.dims3()?;
    if seq_len < 2 {
        return Err(MetaIclError::validation(format!(
            "Need at least 2 positions to score, got {seq_len}"
        )));
    }
    if !(0.0..1.0).contains(&label_smoothing) {
        return Err(MetaIclError::validation(format!(
            "label_smoothing must be in [0, 1), got {label_smoothing}"
        )));
    }

    let logits = logits.narrow(1, 0, seq_len - 1)?.to_dtype(DType::F32)?;
    let targets = input_ids
        .narrow(1, 1, seq_len - 1)?
        .to_dtype(DType::U32)?
        .contiguous()?
        .unsqueeze(2)?;
    let mask = segment_mask.narrow(1, 1, seq_len - 1)?.to_dtype(DType::F32)?;

    let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
    let nll = log_probs.gather(&targets, 2)?.squeeze(2)?.neg()?;
    let token_loss = if label_smoothing > 0.0 {
        let smooth = log_probs.mean(D::Minus1)?.neg()?;
        ((nll * (1.0 - label_smoothing))? + (smooth * label_smoothing)?)?
    } else {
        nll
    };

    let total = (token_loss * &mask)?.sum(1)?;
    let count = mask.sum(1)?.maximum(1f32)?;
    Ok((total / count)?)
}

/// Run the model over every row and return the losses in row order
pub fn run_inference(
    model: &dyn CausalLm,
    table: &TensorTable,
    batch_size: usize,
    device: &Device,
) -> Result<Vec<f32>> {
    let batches = table.batches(batch_size, device)?;
    info!("Running inference on {} rows in {} batches", table.len(), batches.len());

    let mut losses = Vec::with_capacity(table.len());
    for (i, batch) in batches.iter().enumerate() {
        let logits = model.forward(&batch.input_ids, &batch.attention_mask)?;
        let batch_losses = per_row_loss(&logits, &batch.input_ids, &batch.segment_mask, 0.0)?;
        losses.extend(batch_losses.to_vec1::<f32>()?);
        debug!("Batch {}/{} done", i + 1, batches.len());
    }
    Ok(losses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::masks::pack;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const VOCAB: usize = 8;

    /// Always predicts the same token with a large margin
    struct FavoriteToken(u32);

    impl CausalLm for FavoriteToken {
        fn forward(&self, input_ids: &Tensor, _attention_mask: &Tensor) -> Result<Tensor> {
            let (batch, seq) = input_ids.dims2()?;
            let mut data = vec![0f32; batch * seq * VOCAB];
            for pos in 0..batch * seq {
                data[pos * VOCAB + self.0 as usize] = 10.0;
            }
            Ok(Tensor::from_vec(data, (batch, seq, VOCAB), input_ids.device())?)
        }
    }

    struct Uniform;

    impl CausalLm for Uniform {
        fn forward(&self, input_ids: &Tensor, _attention_mask: &Tensor) -> Result<Tensor> {
            let (batch, seq) = input_ids.dims2()?;
            Ok(Tensor::zeros((batch, seq, VOCAB), DType::F32, input_ids.device())?)
        }
    }

    fn table(rows: Vec<(Vec<u32>, Vec<u32>)>, max_length: usize) -> TensorTable {
        let rows = rows
            .into_iter()
            .map(|(ctx, cont)| pack(&ctx, &cont, max_length, false).unwrap())
            .collect();
        TensorTable::from_rows(max_length, rows).unwrap()
    }

    #[test]
    fn test_uniform_model_loss_is_log_vocab() {
        let t = table(vec![(vec![1, 2], vec![3, 4]), (vec![1], vec![5])], 6);
        let losses = run_inference(&Uniform, &t, 4, &Device::Cpu).unwrap();
        assert_eq!(losses.len(), 2);
        for loss in losses {
            assert!((loss - (VOCAB as f32).ln()).abs() < 1e-4);
        }
    }

    #[test]
    fn test_lower_loss_for_predicted_continuation() {
        let t = table(vec![(vec![1, 2], vec![5, 5]), (vec![1, 2], vec![6, 6])], 6);
        let losses = run_inference(&FavoriteToken(5), &t, 1, &Device::Cpu).unwrap();
        assert!(losses[0] < losses[1]);
        assert!(losses[0] < 0.01);
    }

    #[test]
    fn test_loss_ignores_context_tokens() {
        // Same continuation, different context: the favorite token only
        // appears in the context of the second row.
        let t = table(vec![(vec![1, 2], vec![5]), (vec![5, 5], vec![5])], 4);
        let losses = run_inference(&FavoriteToken(5), &t, 2, &Device::Cpu).unwrap();
        assert!((losses[0] - losses[1]).abs() < 1e-5);
    }

    #[test]
    fn test_label_smoothing_raises_confident_loss() {
        let t = table(vec![(vec![1], vec![5, 5])], 4);
        let batch = &t.batches(1, &Device::Cpu).unwrap()[0];
        let logits = FavoriteToken(5)
            .forward(&batch.input_ids, &batch.attention_mask)
            .unwrap();
        let plain = per_row_loss(&logits, &batch.input_ids, &batch.segment_mask, 0.0)
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        let smoothed = per_row_loss(&logits, &batch.input_ids, &batch.segment_mask, 0.1)
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert!(smoothed[0] > plain[0]);
        assert!(per_row_loss(&logits, &batch.input_ids, &batch.segment_mask, 1.5).is_err());
    }

    #[test]
    fn test_batches_keep_row_order() {
        let t = table(
            (1..=5).map(|i| (vec![i], vec![i + 1])).collect(),
            3,
        );
        let batches = t.batches(2, &Device::Cpu).unwrap();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2].len(), 1);
        let first: Vec<Vec<u32>> = batches[0].input_ids.to_vec2().unwrap();
        assert_eq!(first, vec![vec![1, 2, 0], vec![2, 3, 0]]);
        assert!(t.batches(0, &Device::Cpu).is_err());
    }

    #[test]
    fn test_shuffled_batches_cover_all_rows() {
        let t = table((1..=6).map(|i| (vec![i], vec![7])).collect(), 2);
        let mut rng = StdRng::seed_from_u64(3);
        let batches = t.shuffled_batches(4, &mut rng, &Device::Cpu).unwrap();
        let mut firsts: Vec<u32> = batches
            .iter()
            .flat_map(|b| b.input_ids.to_vec2::<u32>().unwrap())
            .map(|row| row[0])
            .collect();
        firsts.sort();
        assert_eq!(firsts, vec![1, 2, 3, 4, 5, 6]);
    }
}
