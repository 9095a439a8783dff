use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

use crate::TokenId;

/// Decoding policy for a request.
#[derive(Debug, Clone, PartialEq)]
pub enum SamplingMode {
    /// Argmax decoding, single sequence.
    Greedy,
    /// Stochastic decoding, single sequence.
    Multinomial {
        temperature: f32,
        /// 0 disables top-k filtering.
        top_k: usize,
        /// 1.0 disables nucleus filtering.
        top_p: f32,
        /// 1.0 disables the penalty.
        repetition_penalty: f32,
    },
    /// Beam search over up to `beam_width` sibling sequences.
    BeamSearch {
        beam_width: usize,
        length_penalty: f32,
        early_stopping: bool,
    },
    /// `n` independent stochastic sequences sharing the prompt cache.
    Parallel {
        n: usize,
        temperature: f32,
        top_k: usize,
        top_p: f32,
        repetition_penalty: f32,
    },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum InvalidParams {
    #[error("max_new_tokens must be at least 1")]
    ZeroMaxNewTokens,

    #[error("temperature must be non-negative")]
    NegativeTemperature,

    #[error("top_p must be in (0, 1]")]
    BadTopP,

    #[error("repetition_penalty must be positive")]
    BadRepetitionPenalty,

    #[error("beam_width must be at least 2")]
    BadBeamWidth,

    #[error("length_penalty must be non-negative")]
    BadLengthPenalty,

    #[error("parallel sampling requires n >= 2")]
    BadParallelN,
}

/// Per-request sampling parameters.
#[derive(Debug, Clone)]
pub struct SamplingParams {
    pub mode: SamplingMode,
    pub max_new_tokens: usize,
    pub stop_token_ids: Vec<TokenId>,
    /// When true, EOS does not terminate generation.
    pub ignore_eos: bool,
    /// Optional seed for deterministic stochastic decoding.
    pub seed: Option<u64>,
}

impl SamplingParams {
    pub fn greedy(max_new_tokens: usize) -> Self {
        Self {
            mode: SamplingMode::Greedy,
            max_new_tokens,
            stop_token_ids: Vec::new(),
            ignore_eos: false,
            seed: None,
        }
    }

    pub fn multinomial(max_new_tokens: usize, temperature: f32) -> Self {
        Self {
            mode: SamplingMode::Multinomial {
                temperature,
                top_k: 0,
                top_p: 1.0,
                repetition_penalty: 1.0,
            },
            ..Self::greedy(max_new_tokens)
        }
    }

    pub fn beam_search(max_new_tokens: usize, beam_width: usize, length_penalty: f32) -> Self {
        Self {
            mode: SamplingMode::BeamSearch {
                beam_width,
                length_penalty,
                early_stopping: false,
            },
            ..Self::greedy(max_new_tokens)
        }
    }

    pub fn parallel(max_new_tokens: usize, n: usize, temperature: f32) -> Self {
        Self {
            mode: SamplingMode::Parallel {
                n,
                temperature,
                top_k: 0,
                top_p: 1.0,
                repetition_penalty: 1.0,
            },
            ..Self::greedy(max_new_tokens)
        }
    }

    /// Widest number of sibling sequences this request can fan out to.
    pub fn max_num_seqs(&self) -> usize {
        match self.mode {
            SamplingMode::Greedy | SamplingMode::Multinomial { .. } => 1,
            SamplingMode::BeamSearch { beam_width, .. } => beam_width,
            SamplingMode::Parallel { n, .. } => n,
        }
    }

    pub fn is_beam_search(&self) -> bool {
        matches!(self.mode, SamplingMode::BeamSearch { .. })
    }

    pub fn validate(&self) -> Result<(), InvalidParams> {
        if self.max_new_tokens == 0 {
            return Err(InvalidParams::ZeroMaxNewTokens);
        }
        match self.mode {
            SamplingMode::Greedy => Ok(()),
            SamplingMode::Multinomial {
                temperature,
                top_p,
                repetition_penalty,
                ..
            }
            | SamplingMode::Parallel {
                temperature,
                top_p,
                repetition_penalty,
                ..
            } => {
                if temperature < 0.0 {
                    return Err(InvalidParams::NegativeTemperature);
                }
                if !(top_p > 0.0 && top_p <= 1.0) {
                    return Err(InvalidParams::BadTopP);
                }
                if repetition_penalty <= 0.0 {
                    return Err(InvalidParams::BadRepetitionPenalty);
                }
                if let SamplingMode::Parallel { n, .. } = self.mode {
                    if n < 2 {
                        return Err(InvalidParams::BadParallelN);
                    }
                }
                Ok(())
            }
            SamplingMode::BeamSearch {
                beam_width,
                length_penalty,
                ..
            } => {
                if beam_width < 2 {
                    return Err(InvalidParams::BadBeamWidth);
                }
                if length_penalty < 0.0 {
                    return Err(InvalidParams::BadLengthPenalty);
                }
                Ok(())
            }
        }
    }
}

/// Mutable sampling state, one per sequence group.
pub struct SamplerState {
    rng: StdRng,
}

impl SamplerState {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }
}

/// Compute log-softmax in a numerically stable way.
pub fn log_softmax(logits: &[f32]) -> Vec<f32> {
    let max_logit = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp_sum_ln = logits
        .iter()
        .map(|&x| (x - max_logit).exp())
        .sum::<f32>()
        .ln();
    logits.iter().map(|&x| x - max_logit - exp_sum_ln).collect()
}

pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max_logit = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut probs: Vec<f32> = logits.iter().map(|&l| (l - max_logit).exp()).collect();
    let sum: f32 = probs.iter().sum();
    if sum > 0.0 {
        let inv_sum = 1.0 / sum;
        for p in probs.iter_mut() {
            *p *= inv_sum;
        }
    }
    probs
}

/// Index of the largest value. Ties resolve to the smallest index for
/// determinism.
pub fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate().skip(1) {
        if v > values[best] {
            best = i;
        }
    }
    best
}

/// Discourage tokens that already appear in the context: positive logits
/// are divided by the penalty, negative ones multiplied.
pub fn apply_repetition_penalty(logits: &mut [f32], context: &[TokenId], penalty: f32) {
    for &token_id in context {
        let idx = token_id as usize;
        if token_id >= 0 && idx < logits.len() {
            if logits[idx] > 0.0 {
                logits[idx] /= penalty;
            } else {
                logits[idx] *= penalty;
            }
        }
    }
}

/// Zero out everything below the k-th largest probability.
pub fn apply_top_k(probs: &mut [f32], k: usize) {
    if k == 0 || k >= probs.len() {
        return;
    }
    let mut sorted: Vec<f32> = probs.to_vec();
    sorted.sort_unstable_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    let threshold = sorted[k - 1];
    for p in probs.iter_mut() {
        if *p < threshold {
            *p = 0.0;
        }
    }
}

/// Nucleus filtering: keep the smallest prefix of the sorted distribution
/// whose cumulative mass exceeds `top_p`.
pub fn apply_top_p(probs: &mut [f32], top_p: f32) {
    let mut indexed: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
    indexed.sort_unstable_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut cumsum = 0.0f32;
    let mut cutoff_idx = indexed.len();
    for (i, &(_, p)) in indexed.iter().enumerate() {
        cumsum += p;
        if cumsum > top_p {
            cutoff_idx = i + 1;
            break;
        }
    }
    for &(idx, _) in &indexed[cutoff_idx..] {
        probs[idx] = 0.0;
    }
}

pub fn sample_from_probs(probs: &[f32], rng: &mut StdRng) -> usize {
    let r: f32 = rng.gen();
    let mut cumsum = 0.0f32;
    for (i, &p) in probs.iter().enumerate() {
        cumsum += p;
        if r < cumsum {
            return i;
        }
    }
    // numeric fallout: fall back to the last non-zero entry
    probs
        .iter()
        .rposition(|&p| p > 0.0)
        .unwrap_or(probs.len() - 1)
}

/// Top `k` (token index, log-prob) pairs, highest first; ties resolve to
/// the smaller token index.
pub fn top_log_probs(log_probs: &[f32], k: usize) -> Vec<(usize, f32)> {
    let mut indexed: Vec<(usize, f32)> = log_probs.iter().copied().enumerate().collect();
    indexed.sort_unstable_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
    indexed.truncate(k);
    indexed
}

/// One full stochastic draw: penalty, temperature, filtering, sampling.
/// Returns the chosen token index and its log-prob under the adjusted
/// distribution. A (near-)zero temperature collapses to argmax.
pub fn sample_multinomial(
    logits: &[f32],
    temperature: f32,
    top_k: usize,
    top_p: f32,
    repetition_penalty: f32,
    context: &[TokenId],
    rng: &mut StdRng,
) -> (usize, f32) {
    let mut logits = logits.to_vec();

    if repetition_penalty != 1.0 {
        apply_repetition_penalty(&mut logits, context, repetition_penalty);
    }

    if temperature < 1e-6 {
        let log_probs = log_softmax(&logits);
        let idx = argmax(&logits);
        return (idx, log_probs[idx]);
    }

    if temperature != 1.0 {
        let inv_temp = 1.0 / temperature;
        for logit in logits.iter_mut() {
            *logit *= inv_temp;
        }
    }

    let log_probs = log_softmax(&logits);
    let mut probs = softmax(&logits);

    if top_k > 0 {
        apply_top_k(&mut probs, top_k);
    }
    if top_p < 1.0 {
        apply_top_p(&mut probs, top_p);
    }

    let sum: f32 = probs.iter().sum();
    if sum > 0.0 && sum != 1.0 {
        let inv_sum = 1.0 / sum;
        for p in probs.iter_mut() {
            *p *= inv_sum;
        }
    }

    let idx = sample_from_probs(&probs, rng);
    (idx, log_probs[idx])
}
