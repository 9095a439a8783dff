use std::sync::Arc;

use crate::sampling::{SamplerState, SamplingParams};
use crate::stream::{GenerationOutput, GenerationOutputs, GenerationStream, SequenceOutput};
use crate::{RequestId, SeqId, TokenId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceStatus {
    Running,
    Finished,
}

/// Why a sibling stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// EOS token sampled.
    Eos,
    /// `max_new_tokens` reached.
    Length,
    /// A configured stop token was sampled.
    Stop,
    /// Dropped out of the kept beam set.
    Pruned,
    /// Client dropped the handle.
    Cancelled,
    /// The scheduler could not place the request even after preemption.
    Capacity,
    /// The model runner failed while this request was in flight.
    ModelError,
}

/// A single generation branch: one running or finished continuation of the
/// group's prompt. Siblings arise from beam search or parallel sampling.
pub struct Sequence {
    seq_id: SeqId,
    parent_id: SeqId,
    status: SequenceStatus,
    finish_reason: Option<FinishReason>,
    generated_ids: Vec<TokenId>,
    cumulative_log_prob: f32,
}

impl Sequence {
    fn new(seq_id: SeqId) -> Self {
        Self {
            seq_id,
            parent_id: 0,
            status: SequenceStatus::Running,
            finish_reason: None,
            generated_ids: Vec::new(),
            cumulative_log_prob: 0.0,
        }
    }

    /// A copy of this branch under a fresh id, remembering its parent.
    fn fork(&self, seq_id: SeqId) -> Self {
        Self {
            seq_id,
            parent_id: self.seq_id,
            status: self.status,
            finish_reason: self.finish_reason,
            generated_ids: self.generated_ids.clone(),
            cumulative_log_prob: self.cumulative_log_prob,
        }
    }

    pub fn seq_id(&self) -> SeqId {
        self.seq_id
    }

    pub fn parent_id(&self) -> SeqId {
        self.parent_id
    }

    pub fn status(&self) -> SequenceStatus {
        self.status
    }

    pub fn is_running(&self) -> bool {
        self.status == SequenceStatus::Running
    }

    pub fn has_finished(&self) -> bool {
        self.status == SequenceStatus::Finished
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    pub fn finish(&mut self, reason: FinishReason) {
        self.status = SequenceStatus::Finished;
        self.finish_reason = Some(reason);
    }

    pub fn append_token(&mut self, token_id: TokenId, log_prob: f32) {
        self.cumulative_log_prob += log_prob;
        self.generated_ids.push(token_id);
    }

    /// Fold a log-prob into the score without storing a token. Used for a
    /// beam hypothesis completed by EOS, which is never emitted.
    pub fn accumulate_log_prob(&mut self, log_prob: f32) {
        self.cumulative_log_prob += log_prob;
    }

    pub fn generated_ids(&self) -> &[TokenId] {
        &self.generated_ids
    }

    pub fn generated_len(&self) -> usize {
        self.generated_ids.len()
    }

    pub fn last_token(&self) -> Option<TokenId> {
        self.generated_ids.last().copied()
    }

    pub fn cumulative_log_prob(&self) -> f32 {
        self.cumulative_log_prob
    }

    /// Beam-search ranking score: `cum_log_prob / len^alpha`.
    pub fn beam_score(&self, length_penalty: f32) -> f32 {
        let len = self.generated_len().max(1) as f32;
        self.cumulative_log_prob / len.powf(length_penalty)
    }

    pub fn last_generation_output(&self) -> Option<GenerationOutput> {
        self.last_token().map(|token_id| GenerationOutput {
            parent_id: self.parent_id,
            token_id,
            cumulative_log_prob: self.cumulative_log_prob,
        })
    }
}

/// The unit of a client request: a non-empty set of sibling sequences over
/// one immutable prompt, plus the iteration counters the scheduler drives.
pub struct SequenceGroup {
    request_id: RequestId,
    prompt_ids: Vec<TokenId>,
    sampling_params: SamplingParams,
    block_size: usize,
    sequences: Vec<Sequence>,
    stream: Arc<GenerationStream>,
    sampler_state: SamplerState,

    /// Tokens whose KV has been written to cache. The prompt may be
    /// processed across several iterations, so this can trail the prompt.
    num_processed_tokens: usize,
    /// Set only while this iteration's schedule is in flight.
    num_scheduled_tokens: usize,
    /// High-water mark of processed context; reset when the group's cache
    /// is evicted.
    max_content_len: usize,
}

impl SequenceGroup {
    pub fn new(
        request_id: RequestId,
        prompt_ids: Vec<TokenId>,
        sampling_params: SamplingParams,
        block_size: usize,
        stream: Arc<GenerationStream>,
        ids: &mut SequenceIdGen,
    ) -> Self {
        let sampler_state = SamplerState::new(sampling_params.seed);
        let seed = Sequence::new(ids.next_id());
        Self {
            request_id,
            prompt_ids,
            sampling_params,
            block_size,
            sequences: vec![seed],
            stream,
            sampler_state,
            num_processed_tokens: 0,
            num_scheduled_tokens: 0,
            max_content_len: 0,
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn prompt_ids(&self) -> &[TokenId] {
        &self.prompt_ids
    }

    pub fn prompt_len(&self) -> usize {
        self.prompt_ids.len()
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn sampling_params(&self) -> &SamplingParams {
        &self.sampling_params
    }

    pub fn sampler_state_mut(&mut self) -> &mut SamplerState {
        &mut self.sampler_state
    }

    pub fn stream(&self) -> &Arc<GenerationStream> {
        &self.stream
    }

    // ── sibling access ──────────────────────────────────────────────────

    pub fn sequences(&self) -> &[Sequence] {
        &self.sequences
    }

    pub fn sequence(&self, seq_id: SeqId) -> Option<&Sequence> {
        self.sequences.iter().find(|s| s.seq_id() == seq_id)
    }

    pub fn sequence_mut(&mut self, seq_id: SeqId) -> Option<&mut Sequence> {
        self.sequences.iter_mut().find(|s| s.seq_id() == seq_id)
    }

    pub fn running_sequences(&self) -> impl Iterator<Item = &Sequence> {
        self.sequences.iter().filter(|s| s.is_running())
    }

    pub fn running_seq_ids(&self) -> Vec<SeqId> {
        self.running_sequences().map(|s| s.seq_id()).collect()
    }

    pub fn num_running_seqs(&self) -> usize {
        self.running_sequences().count()
    }

    pub fn num_total_seqs(&self) -> usize {
        self.sequences.len()
    }

    pub fn has_finished(&self) -> bool {
        self.num_running_seqs() == 0
    }

    /// Fork `parent` into a new sibling. The caller owns the block-table
    /// fork that must accompany this.
    pub fn fork_sequence(&mut self, parent: SeqId, ids: &mut SequenceIdGen) -> SeqId {
        let parent_seq = self
            .sequence(parent)
            .expect("fork of unknown sequence is a sampler bug");
        let child = parent_seq.fork(ids.next_id());
        let child_id = child.seq_id();
        self.sequences.push(child);
        child_id
    }

    // ── iteration counters ──────────────────────────────────────────────

    pub fn num_processed_tokens(&self) -> usize {
        self.num_processed_tokens
    }

    pub fn num_scheduled_tokens(&self) -> usize {
        self.num_scheduled_tokens
    }

    pub fn max_content_len(&self) -> usize {
        self.max_content_len
    }

    /// Context length including tokens scheduled this iteration.
    pub fn context_len(&self) -> usize {
        self.num_processed_tokens + self.num_scheduled_tokens
    }

    /// Full known content of a running branch: prompt plus generated.
    /// All running siblings share one generated length (forks copy it and
    /// every sampling step appends exactly one per running sibling).
    pub fn full_content_len(&self) -> usize {
        let generated = self
            .running_sequences()
            .next()
            .map(|s| s.generated_len())
            .unwrap_or(0);
        debug_assert!(
            self.running_sequences().all(|s| s.generated_len() == generated),
            "running siblings diverged in length"
        );
        self.prompt_len() + generated
    }

    /// Tokens this group could process right now, per running sibling.
    pub fn num_available_tokens(&self) -> usize {
        debug_assert_eq!(self.num_scheduled_tokens, 0);
        self.full_content_len()
            .saturating_sub(self.num_processed_tokens)
            .max(1)
    }

    /// Generation phase: everything but the newest token is in cache, so
    /// each running sibling advances by exactly one token per iteration.
    /// False until (re-)prefill catches up with the full known content;
    /// a group with nothing in cache always prefills first.
    pub fn can_generate_tokens(&self) -> bool {
        self.num_processed_tokens > 0
            && self.full_content_len() <= self.num_processed_tokens + 1
    }

    /// Whether this iteration's scheduled slice reaches the end of the
    /// known content, i.e. the forward pass must be followed by sampling.
    pub fn requires_sampling(&self) -> bool {
        self.num_scheduled_tokens > 0 && self.context_len() >= self.full_content_len()
    }

    pub fn schedule_tokens(&mut self, num_tokens: usize) {
        self.num_scheduled_tokens = num_tokens;
    }

    pub fn clear_scheduled_tokens(&mut self) {
        self.num_scheduled_tokens = 0;
    }

    pub fn is_scheduled(&self) -> bool {
        self.num_scheduled_tokens > 0
    }

    /// Close out the schedule phase: fold scheduled tokens into processed
    /// and advance the content high-water mark.
    pub fn finish_iteration(&mut self) {
        self.num_processed_tokens += self.num_scheduled_tokens;
        self.max_content_len = self.max_content_len.max(self.num_processed_tokens);
        self.clear_scheduled_tokens();
    }

    /// Recompute preemption: the KV cache is gone, so both counters reset
    /// and the next admission re-prefills prompt plus generated in one
    /// pass. Generated tokens stay on every sibling.
    pub fn preempt(&mut self) {
        self.num_processed_tokens = 0;
        self.max_content_len = 0;
        self.num_scheduled_tokens = 0;
    }

    /// Logical blocks needed to hold the scheduled context.
    pub fn num_logical_blocks(&self) -> usize {
        self.context_len().div_ceil(self.block_size)
    }

    // ── stream handoff ──────────────────────────────────────────────────

    /// Iteration outputs for the siblings that appended a token this
    /// iteration.
    pub fn iteration_outputs(&self, appended: &[SeqId]) -> GenerationOutputs {
        let mut outputs = GenerationOutputs::new();
        for &seq_id in appended {
            if let Some(output) = self.sequence(seq_id).and_then(|s| s.last_generation_output()) {
                outputs.insert(seq_id, output);
            }
        }
        outputs
    }

    /// One aggregate per sibling for the terminal stream event: beam
    /// search sorted by score descending, everything else by seq id.
    pub fn final_outputs(&self) -> Vec<SequenceOutput> {
        let mut results: Vec<SequenceOutput> = self
            .sequences
            .iter()
            .map(|s| SequenceOutput {
                seq_id: s.seq_id(),
                generated_token_ids: s.generated_ids().to_vec(),
                cumulative_log_prob: s.cumulative_log_prob(),
                finish_reason: s.finish_reason(),
            })
            .collect();
        if let crate::sampling::SamplingMode::BeamSearch { length_penalty, .. } =
            self.sampling_params.mode
        {
            let score = |r: &SequenceOutput| {
                let len = r.generated_token_ids.len().max(1) as f32;
                r.cumulative_log_prob / len.powf(length_penalty)
            };
            results.sort_by(|a, b| {
                score(b)
                    .partial_cmp(&score(a))
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.seq_id.cmp(&b.seq_id))
            });
        } else {
            results.sort_by_key(|r| r.seq_id);
        }
        results
    }
}

/// Process-wide monotonic sequence-id source. 0 is reserved for "no
/// parent", so ids start at 1 and are never reused within a run.
pub struct SequenceIdGen {
    next: SeqId,
}

impl SequenceIdGen {
    fn new() -> Self {
        Self { next: 1 }
    }

    pub fn next_id(&mut self) -> SeqId {
        let id = self.next;
        self.next += 1;
        id
    }
}

/// All live groups in insertion order, plus the sequence-id counter they
/// draw from.
pub struct SequenceGroupStore {
    groups: Vec<SequenceGroup>,
    ids: SequenceIdGen,
}

impl Default for SequenceGroupStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceGroupStore {
    pub fn new() -> Self {
        Self {
            groups: Vec::new(),
            ids: SequenceIdGen::new(),
        }
    }

    pub fn add_group(
        &mut self,
        request_id: RequestId,
        prompt_ids: Vec<TokenId>,
        params: SamplingParams,
        block_size: usize,
    ) -> &SequenceGroup {
        self.add_group_with_stream(
            request_id,
            prompt_ids,
            params,
            block_size,
            GenerationStream::new(),
        )
    }

    /// Engine entry point: the stream was already handed to the caller as
    /// a [`crate::stream::GenerationHandle`].
    pub fn add_group_with_stream(
        &mut self,
        request_id: RequestId,
        prompt_ids: Vec<TokenId>,
        params: SamplingParams,
        block_size: usize,
        stream: Arc<GenerationStream>,
    ) -> &SequenceGroup {
        let group = SequenceGroup::new(
            request_id,
            prompt_ids,
            params,
            block_size,
            stream,
            &mut self.ids,
        );
        self.groups.push(group);
        self.groups.last().expect("just pushed")
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SequenceGroup> {
        self.groups.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut SequenceGroup> {
        self.groups.iter_mut()
    }

    pub fn get(&self, request_id: RequestId) -> Option<&SequenceGroup> {
        self.groups.iter().find(|g| g.request_id() == request_id)
    }

    pub fn get_mut(&mut self, request_id: RequestId) -> Option<&mut SequenceGroup> {
        self.groups.iter_mut().find(|g| g.request_id() == request_id)
    }

    pub fn contains(&self, request_id: RequestId) -> bool {
        self.get(request_id).is_some()
    }

    /// Split borrow for callers that mutate groups while minting ids.
    pub fn split_mut(&mut self) -> (&mut [SequenceGroup], &mut SequenceIdGen) {
        (&mut self.groups, &mut self.ids)
    }

    /// Remove and return groups whose siblings have all finished, actually
    /// erasing them while preserving the order of survivors.
    pub fn take_finished(&mut self) -> Vec<SequenceGroup> {
        let mut finished = Vec::new();
        let mut i = 0;
        while i < self.groups.len() {
            if self.groups[i].has_finished() {
                finished.push(self.groups.remove(i));
            } else {
                i += 1;
            }
        }
        finished
    }

    /// Remove specific groups by request id (cancellation, capacity
    /// rejection), same erasure contract as [`take_finished`].
    pub fn take_by_ids(&mut self, request_ids: &[RequestId]) -> Vec<SequenceGroup> {
        let mut taken = Vec::new();
        let mut i = 0;
        while i < self.groups.len() {
            if request_ids.contains(&self.groups[i].request_id()) {
                taken.push(self.groups.remove(i));
            } else {
                i += 1;
            }
        }
        taken
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampling::SamplingParams;

    fn group(store: &mut SequenceGroupStore, id: RequestId, prompt: usize) -> &mut SequenceGroup {
        store.add_group(id, vec![1; prompt], SamplingParams::greedy(8), 16);
        store.get_mut(id).unwrap()
    }

    #[test]
    fn seq_ids_are_monotonic_and_nonzero() {
        let mut store = SequenceGroupStore::new();
        let a = group(&mut store, 0, 4).sequences()[0].seq_id();
        let b = group(&mut store, 1, 4).sequences()[0].seq_id();
        assert!(a >= 1);
        assert!(b > a);
    }

    #[test]
    fn new_group_is_prefill_phase() {
        let mut store = SequenceGroupStore::new();
        let g = group(&mut store, 0, 5);
        assert!(!g.can_generate_tokens());
        assert_eq!(g.num_available_tokens(), 5);
        assert_eq!(g.full_content_len(), 5);
    }

    #[test]
    fn single_token_prompt_still_prefills_first() {
        let mut store = SequenceGroupStore::new();
        let g = group(&mut store, 0, 1);
        assert!(!g.can_generate_tokens());
        assert_eq!(g.num_available_tokens(), 1);

        g.schedule_tokens(1);
        assert!(g.requires_sampling());
        let seed = g.sequences()[0].seq_id();
        g.sequence_mut(seed).unwrap().append_token(2, 0.0);
        g.finish_iteration();
        assert!(g.can_generate_tokens());
    }

    #[test]
    fn counters_through_prefill_and_decode() {
        let mut store = SequenceGroupStore::new();
        let g = group(&mut store, 0, 5);

        g.schedule_tokens(5);
        assert_eq!(g.context_len(), 5);
        assert!(g.requires_sampling());

        let seed = g.sequences()[0].seq_id();
        g.sequence_mut(seed).unwrap().append_token(42, -0.1);
        g.finish_iteration();

        assert_eq!(g.num_processed_tokens(), 5);
        assert_eq!(g.max_content_len(), 5);
        assert_eq!(g.num_scheduled_tokens(), 0);
        assert!(g.can_generate_tokens());
        assert_eq!(g.num_available_tokens(), 1);
    }

    #[test]
    fn partial_prefill_does_not_sample() {
        let mut store = SequenceGroupStore::new();
        let g = group(&mut store, 0, 10);
        g.schedule_tokens(4);
        assert!(!g.requires_sampling());
        g.finish_iteration();
        assert_eq!(g.num_processed_tokens(), 4);
        assert!(!g.can_generate_tokens());
        assert_eq!(g.num_available_tokens(), 6);
    }

    #[test]
    fn preempt_resets_counters_but_keeps_tokens() {
        let mut store = SequenceGroupStore::new();
        let g = group(&mut store, 0, 3);
        let seed = g.sequences()[0].seq_id();

        g.schedule_tokens(3);
        g.sequence_mut(seed).unwrap().append_token(4, 0.0);
        g.finish_iteration();
        g.schedule_tokens(1);
        g.sequence_mut(seed).unwrap().append_token(5, 0.0);
        g.finish_iteration();

        g.preempt();
        assert_eq!(g.num_processed_tokens(), 0);
        assert_eq!(g.max_content_len(), 0);
        assert!(!g.can_generate_tokens());
        // prompt(3) + generated(2) comes back as one prefill pass
        assert_eq!(g.num_available_tokens(), 5);
        assert_eq!(g.sequence(seed).unwrap().generated_ids(), &[4, 5]);
    }

    #[test]
    fn fork_copies_tokens_and_diverges_after() {
        let mut store = SequenceGroupStore::new();
        store.add_group(0, vec![1, 2, 3], SamplingParams::parallel(8, 2, 1.0), 16);
        let (groups, ids) = store.split_mut();
        let g = &mut groups[0];
        let parent = g.sequences()[0].seq_id();
        g.sequence_mut(parent).unwrap().append_token(7, -0.5);

        let child = g.fork_sequence(parent, ids);
        assert_ne!(child, parent);
        assert_eq!(g.sequence(child).unwrap().parent_id(), parent);
        assert_eq!(g.sequence(child).unwrap().generated_ids(), &[7]);
        assert_eq!(g.sequence(child).unwrap().cumulative_log_prob(), -0.5);

        g.sequence_mut(child).unwrap().append_token(9, -0.1);
        assert_eq!(g.sequence(parent).unwrap().generated_ids(), &[7]);
        assert_eq!(g.sequence(child).unwrap().generated_ids(), &[7, 9]);
    }

    #[test]
    fn group_finishes_when_all_siblings_finish() {
        let mut store = SequenceGroupStore::new();
        store.add_group(0, vec![1], SamplingParams::parallel(8, 2, 1.0), 16);
        let (groups, ids) = store.split_mut();
        let g = &mut groups[0];
        let parent = g.sequences()[0].seq_id();
        let child = g.fork_sequence(parent, ids);

        assert!(!g.has_finished());
        g.sequence_mut(parent).unwrap().finish(FinishReason::Eos);
        assert!(!g.has_finished());
        assert_eq!(g.num_running_seqs(), 1);
        g.sequence_mut(child).unwrap().finish(FinishReason::Length);
        assert!(g.has_finished());
    }

    #[test]
    fn iteration_outputs_only_cover_appended() {
        let mut store = SequenceGroupStore::new();
        store.add_group(0, vec![1], SamplingParams::parallel(8, 2, 1.0), 16);
        let (groups, ids) = store.split_mut();
        let g = &mut groups[0];
        let parent = g.sequences()[0].seq_id();
        let child = g.fork_sequence(parent, ids);
        g.sequence_mut(parent).unwrap().append_token(5, -0.2);

        let outputs = g.iteration_outputs(&[parent]);
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[&parent].token_id, 5);
        assert!(!outputs.contains_key(&child));
    }

    #[test]
    fn final_outputs_sorted_by_seq_id_for_parallel() {
        let mut store = SequenceGroupStore::new();
        store.add_group(0, vec![1], SamplingParams::parallel(8, 2, 1.0), 16);
        let (groups, ids) = store.split_mut();
        let g = &mut groups[0];
        let parent = g.sequences()[0].seq_id();
        let child = g.fork_sequence(parent, ids);
        g.sequence_mut(child).unwrap().append_token(9, -0.9);
        g.sequence_mut(parent).unwrap().append_token(5, -0.1);

        let results = g.final_outputs();
        assert_eq!(results[0].seq_id, parent);
        assert_eq!(results[1].seq_id, child);
    }

    #[test]
    fn final_outputs_sorted_by_score_for_beam() {
        let mut store = SequenceGroupStore::new();
        store.add_group(0, vec![1], SamplingParams::beam_search(8, 2, 1.0), 16);
        let (groups, ids) = store.split_mut();
        let g = &mut groups[0];
        let parent = g.sequences()[0].seq_id();
        let child = g.fork_sequence(parent, ids);
        // child scores better despite the larger seq id
        g.sequence_mut(parent).unwrap().append_token(5, -2.0);
        g.sequence_mut(child).unwrap().append_token(9, -0.5);

        let results = g.final_outputs();
        assert_eq!(results[0].seq_id, child);
        assert_eq!(results[1].seq_id, parent);
    }

    #[test]
    fn take_finished_erases_and_preserves_order() {
        let mut store = SequenceGroupStore::new();
        for id in 0..4 {
            store.add_group(id, vec![1], SamplingParams::greedy(8), 16);
        }
        let seed1 = store.get(1).unwrap().sequences()[0].seq_id();
        let seed2 = store.get(2).unwrap().sequences()[0].seq_id();
        store
            .get_mut(1)
            .unwrap()
            .sequence_mut(seed1)
            .unwrap()
            .finish(FinishReason::Eos);
        store
            .get_mut(2)
            .unwrap()
            .sequence_mut(seed2)
            .unwrap()
            .finish(FinishReason::Eos);

        let finished = store.take_finished();
        let finished_ids: Vec<_> = finished.iter().map(|g| g.request_id()).collect();
        assert_eq!(finished_ids, vec![1, 2]);

        let remaining: Vec<_> = store.iter().map(|g| g.request_id()).collect();
        assert_eq!(remaining, vec![0, 3]);
    }

    #[test]
    fn beam_score_divides_by_length_power() {
        let mut store = SequenceGroupStore::new();
        store.add_group(0, vec![1], SamplingParams::beam_search(8, 2, 2.0), 16);
        let g = store.get_mut(0).unwrap();
        let seed = g.sequences()[0].seq_id();
        let seq = g.sequence_mut(seed).unwrap();
        seq.append_token(1, -1.0);
        seq.append_token(2, -1.0);
        // cum = -2.0, len = 2, alpha = 2 → -2 / 4
        assert!((seq.beam_score(2.0) + 0.5).abs() < 1e-6);
    }
}
