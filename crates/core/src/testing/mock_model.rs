use candle_core::{Device, Tensor};

use crate::engine::{ForwardBatch, ModelRunner};

/// Deterministic mock: every position's argmax is `last_token + 1`
/// (mod vocab), so a greedy run over prompt `[1,2,3]` yields `4,5,6,...`.
/// The hot logit is large enough that its softmax probability rounds to 1.
pub struct NextTokenModel {
    vocab_size: usize,
}

impl NextTokenModel {
    pub fn new(vocab_size: usize) -> Self {
        Self { vocab_size }
    }
}

impl ModelRunner for NextTokenModel {
    fn forward(&mut self, batch: &ForwardBatch) -> candle_core::Result<Tensor> {
        let vocab = self.vocab_size;
        let mut flat = Vec::new();
        let mut num_rows = 0;
        for seq in &batch.sequences {
            for &token in &seq.input_ids {
                let mut row = vec![0.0f32; vocab];
                let next = (token + 1).max(0) as usize % vocab;
                row[next] = 50.0;
                flat.extend(row);
                num_rows += 1;
            }
        }
        Tensor::from_vec(flat, (num_rows, vocab), &Device::Cpu)
    }
}

/// Returns the same fixed logits row for every scheduled position. Handy
/// for beam-search and stop-condition tests where the distribution is the
/// fixture.
pub struct ConstLogitsModel {
    row: Vec<f32>,
}

impl ConstLogitsModel {
    pub fn new(row: Vec<f32>) -> Self {
        Self { row }
    }
}

impl ModelRunner for ConstLogitsModel {
    fn forward(&mut self, batch: &ForwardBatch) -> candle_core::Result<Tensor> {
        let vocab = self.row.len();
        let num_rows = batch.num_rows();
        let mut flat = Vec::with_capacity(num_rows * vocab);
        for _ in 0..num_rows {
            flat.extend_from_slice(&self.row);
        }
        Tensor::from_vec(flat, (num_rows, vocab), &Device::Cpu)
    }
}

/// Plays a per-iteration script: the i-th forward call answers every
/// scheduled position with `steps[i]`, and the last step repeats once the
/// script runs out. Lets a test shift the distribution between decode
/// steps, e.g. a stop token or EOS only becoming likely later in the
/// generation.
pub struct ScriptedModel {
    steps: Vec<Vec<f32>>,
    num_calls: usize,
}

impl ScriptedModel {
    pub fn new(steps: Vec<Vec<f32>>) -> Self {
        assert!(!steps.is_empty(), "script needs at least one step");
        Self {
            steps,
            num_calls: 0,
        }
    }
}

impl ModelRunner for ScriptedModel {
    fn forward(&mut self, batch: &ForwardBatch) -> candle_core::Result<Tensor> {
        let step = self.num_calls.min(self.steps.len() - 1);
        self.num_calls += 1;
        let row = &self.steps[step];
        let vocab = row.len();
        let num_rows = batch.num_rows();
        let mut flat = Vec::with_capacity(num_rows * vocab);
        for _ in 0..num_rows {
            flat.extend_from_slice(row);
        }
        Tensor::from_vec(flat, (num_rows, vocab), &Device::Cpu)
    }
}

/// Always fails, for exercising the model-runtime-error path.
pub struct FailingModel;

impl ModelRunner for FailingModel {
    fn forward(&mut self, _batch: &ForwardBatch) -> candle_core::Result<Tensor> {
        Err(candle_core::Error::Msg("injected model failure".to_string()))
    }
}
