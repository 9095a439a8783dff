use crate::kv_cache::BlockManager;
use crate::request::{FinishReason, SequenceGroup, SequenceIdGen};
use crate::sampling::{self, SamplingMode};
use crate::{SeqId, TokenId};

/// A beam-search continuation candidate.
#[derive(Debug, Clone)]
struct BeamCandidate {
    parent: SeqId,
    token: TokenId,
    log_prob: f32,
    cumulative_log_prob: f32,
    score: f32,
}

/// Turns the last logits row of every running sibling into appended
/// tokens, forks, and finish transitions.
///
/// The sampler borrows the scheduled groups for exactly one call and
/// stores nothing across iterations; all durable state lives on the groups
/// and the block manager.
pub struct Sampler {
    eos_token_id: TokenId,
}

impl Sampler {
    pub fn new(eos_token_id: TokenId) -> Self {
        Self { eos_token_id }
    }

    /// Advance one scheduled group by one sampling step.
    ///
    /// `sibling_rows` holds each running sibling's last scheduled logits
    /// row, in the batch's sibling order. Returns the seq ids that
    /// appended a token this iteration (the stream notification set).
    pub fn sample_group(
        &self,
        group: &mut SequenceGroup,
        ids: &mut SequenceIdGen,
        blocks: &mut BlockManager,
        sibling_rows: &[(SeqId, &[f32])],
    ) -> Vec<SeqId> {
        debug_assert!(group.requires_sampling());
        match group.sampling_params().mode.clone() {
            SamplingMode::Greedy => self.sample_greedy(group, blocks, sibling_rows),
            SamplingMode::Multinomial {
                temperature,
                top_k,
                top_p,
                repetition_penalty,
            } => self.sample_multinomial_siblings(
                group,
                blocks,
                sibling_rows,
                temperature,
                top_k,
                top_p,
                repetition_penalty,
            ),
            SamplingMode::Parallel {
                n,
                temperature,
                top_k,
                top_p,
                repetition_penalty,
            } => {
                let rows = self.fan_out(group, ids, blocks, sibling_rows, n);
                self.sample_multinomial_siblings(
                    group,
                    blocks,
                    &rows,
                    temperature,
                    top_k,
                    top_p,
                    repetition_penalty,
                )
            }
            SamplingMode::BeamSearch {
                beam_width,
                length_penalty,
                early_stopping,
            } => self.beam_step(
                group,
                ids,
                blocks,
                sibling_rows,
                beam_width,
                length_penalty,
                early_stopping,
            ),
        }
    }

    fn sample_greedy(
        &self,
        group: &mut SequenceGroup,
        blocks: &mut BlockManager,
        sibling_rows: &[(SeqId, &[f32])],
    ) -> Vec<SeqId> {
        let mut appended = Vec::new();
        for &(seq_id, row) in sibling_rows {
            let log_probs = sampling::log_softmax(row);
            let idx = sampling::argmax(row);
            let token = idx as TokenId;
            if self.append_or_finish(group, blocks, seq_id, token, log_probs[idx]) {
                appended.push(seq_id);
            }
        }
        appended
    }

    #[allow(clippy::too_many_arguments)]
    fn sample_multinomial_siblings(
        &self,
        group: &mut SequenceGroup,
        blocks: &mut BlockManager,
        sibling_rows: &[(SeqId, &[f32])],
        temperature: f32,
        top_k: usize,
        top_p: f32,
        repetition_penalty: f32,
    ) -> Vec<SeqId> {
        let mut appended = Vec::new();
        for &(seq_id, row) in sibling_rows {
            let context: Vec<TokenId> = group
                .prompt_ids()
                .iter()
                .chain(
                    group
                        .sequence(seq_id)
                        .expect("scheduled sibling exists")
                        .generated_ids(),
                )
                .copied()
                .collect();
            let (idx, log_prob) = sampling::sample_multinomial(
                row,
                temperature,
                top_k,
                top_p,
                repetition_penalty,
                &context,
                group.sampler_state_mut().rng(),
            );
            let token = idx as TokenId;
            if self.append_or_finish(group, blocks, seq_id, token, log_prob) {
                appended.push(seq_id);
            }
        }
        appended
    }

    /// Parallel sampling: on the group's first sampling step, fork the
    /// seed into `n` siblings that all draw from the seed's logits row.
    fn fan_out<'a>(
        &self,
        group: &mut SequenceGroup,
        ids: &mut SequenceIdGen,
        blocks: &mut BlockManager,
        sibling_rows: &'a [(SeqId, &'a [f32])],
        n: usize,
    ) -> Vec<(SeqId, &'a [f32])> {
        if group.num_total_seqs() > 1 || sibling_rows.len() != 1 {
            return sibling_rows.to_vec();
        }
        let (seed, row) = sibling_rows[0];
        let mut rows = vec![(seed, row)];
        for _ in 1..n {
            let child = group.fork_sequence(seed, ids);
            blocks
                .fork_sequence(seed, child)
                .expect("seed holds a block table");
            rows.push((child, row));
        }
        rows
    }

    /// Append `token` to a non-beam sibling or finish it, freeing its
    /// cache on any terminal transition. Returns whether a token was
    /// appended.
    fn append_or_finish(
        &self,
        group: &mut SequenceGroup,
        blocks: &mut BlockManager,
        seq_id: SeqId,
        token: TokenId,
        log_prob: f32,
    ) -> bool {
        let params = group.sampling_params();
        let max_new_tokens = params.max_new_tokens;
        let is_stop = params.stop_token_ids.contains(&token);
        let is_eos = token == self.eos_token_id && !params.ignore_eos;

        let seq = group
            .sequence_mut(seq_id)
            .expect("scheduled sibling exists");
        if is_eos {
            seq.finish(FinishReason::Eos);
            free_finished(blocks, seq_id);
            return false;
        }
        seq.append_token(token, log_prob);
        if is_stop {
            seq.finish(FinishReason::Stop);
            free_finished(blocks, seq_id);
        } else if seq.generated_len() >= max_new_tokens {
            seq.finish(FinishReason::Length);
            free_finished(blocks, seq_id);
        }
        true
    }

    /// One beam-search step: expand every running sibling by its top-2B
    /// continuations, rank the pool by `cum_log_prob / len^alpha`, keep
    /// the best B, and finish everyone else.
    #[allow(clippy::too_many_arguments)]
    fn beam_step(
        &self,
        group: &mut SequenceGroup,
        ids: &mut SequenceIdGen,
        blocks: &mut BlockManager,
        sibling_rows: &[(SeqId, &[f32])],
        beam_width: usize,
        length_penalty: f32,
        early_stopping: bool,
    ) -> Vec<SeqId> {
        let params = group.sampling_params().clone();
        let mut candidates: Vec<BeamCandidate> = Vec::new();
        for &(seq_id, row) in sibling_rows {
            let seq = group.sequence(seq_id).expect("scheduled sibling exists");
            let parent_cum = seq.cumulative_log_prob();
            // a kept continuation gains a token; an EOS completion keeps
            // the parent's length because EOS is never emitted, so its
            // selection score must match `beam_score` on the hypothesis
            let kept_len = (seq.generated_len() + 1) as f32;
            let completed_len = seq.generated_len().max(1) as f32;
            let log_probs = sampling::log_softmax(row);
            for (idx, log_prob) in sampling::top_log_probs(&log_probs, 2 * beam_width) {
                let token = idx as TokenId;
                let len = if token == self.eos_token_id && !params.ignore_eos {
                    completed_len
                } else {
                    kept_len
                };
                let cumulative_log_prob = parent_cum + log_prob;
                candidates.push(BeamCandidate {
                    parent: seq_id,
                    token,
                    log_prob,
                    cumulative_log_prob,
                    score: cumulative_log_prob / len.powf(length_penalty),
                });
            }
        }
        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.parent.cmp(&b.parent))
                .then(a.token.cmp(&b.token))
        });

        // Split the ranked pool: EOS candidates complete hypotheses, the
        // best B others continue the beam.
        let mut kept: Vec<BeamCandidate> = Vec::new();
        let mut completed: Vec<BeamCandidate> = Vec::new();
        for cand in candidates {
            if kept.len() == beam_width {
                break;
            }
            if cand.token == self.eos_token_id && !params.ignore_eos {
                completed.push(cand);
            } else {
                kept.push(cand);
            }
        }

        // Materialize completed hypotheses before any parent mutates: the
        // fork copies the parent's tokens as of this step, EOS excluded.
        for cand in &completed {
            let child = group.fork_sequence(cand.parent, ids);
            let seq = group.sequence_mut(child).expect("just forked");
            seq.accumulate_log_prob(cand.log_prob);
            seq.finish(FinishReason::Eos);
        }

        let parents: Vec<SeqId> = sibling_rows.iter().map(|&(id, _)| id).collect();
        let mut appended = Vec::new();
        for &parent in &parents {
            let chosen: Vec<BeamCandidate> = kept
                .iter()
                .filter(|c| c.parent == parent)
                .cloned()
                .collect();
            if chosen.is_empty() {
                group
                    .sequence_mut(parent)
                    .expect("scheduled sibling exists")
                    .finish(FinishReason::Pruned);
                free_finished(blocks, parent);
                continue;
            }
            // extra children fork before the parent takes its own token
            for cand in chosen.iter().skip(1) {
                let child = group.fork_sequence(parent, ids);
                blocks
                    .fork_sequence(parent, child)
                    .expect("parent holds a block table");
                self.beam_append(group, blocks, child, cand, &params.stop_token_ids);
                appended.push(child);
            }
            self.beam_append(group, blocks, parent, &chosen[0], &params.stop_token_ids);
            appended.push(parent);
        }

        if self.beam_search_done(group, beam_width, length_penalty, early_stopping) {
            for seq_id in group.running_seq_ids() {
                group
                    .sequence_mut(seq_id)
                    .expect("running sibling exists")
                    .finish(FinishReason::Pruned);
                free_finished(blocks, seq_id);
            }
        }
        appended
    }

    fn beam_append(
        &self,
        group: &mut SequenceGroup,
        blocks: &mut BlockManager,
        seq_id: SeqId,
        cand: &BeamCandidate,
        stop_token_ids: &[TokenId],
    ) {
        let max_new_tokens = group.sampling_params().max_new_tokens;
        let seq = group
            .sequence_mut(seq_id)
            .expect("beam sibling exists");
        seq.append_token(cand.token, cand.log_prob);
        if stop_token_ids.contains(&cand.token) {
            seq.finish(FinishReason::Stop);
            free_finished(blocks, seq_id);
        } else if seq.generated_len() >= max_new_tokens {
            seq.finish(FinishReason::Length);
            free_finished(blocks, seq_id);
        }
    }

    /// Termination test after a beam step: enough hypotheses have
    /// completed and no running beam can still beat the worst of them.
    fn beam_search_done(
        &self,
        group: &SequenceGroup,
        beam_width: usize,
        length_penalty: f32,
        early_stopping: bool,
    ) -> bool {
        let mut completed_scores: Vec<f32> = group
            .sequences()
            .iter()
            .filter(|s| s.finish_reason() == Some(FinishReason::Eos))
            .map(|s| s.beam_score(length_penalty))
            .collect();
        if completed_scores.len() < beam_width {
            return false;
        }
        if early_stopping {
            return true;
        }
        completed_scores.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
        let worst_kept = completed_scores[beam_width - 1];
        let best_running = group
            .running_sequences()
            .map(|s| s.beam_score(length_penalty))
            .fold(f32::NEG_INFINITY, f32::max);
        best_running <= worst_kept
    }
}

fn free_finished(blocks: &mut BlockManager, seq_id: SeqId) {
    blocks
        .free_sequence(seq_id)
        .expect("freeing a live table cannot fail");
}
