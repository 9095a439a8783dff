use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use candle_core::Tensor;
use serde::Serialize;
use thiserror::Error;

use crate::config::{ConfigError, EngineConfig};
use crate::kv_cache::{BlockId, BlockManager};
use crate::request::{FinishReason, SequenceGroup, SequenceGroupStore};
use crate::sampler::Sampler;
use crate::sampling::SamplingParams;
use crate::scheduler::{Scheduler, SchedulerConfig, SchedulerOutput};
use crate::stream::{GenerationHandle, GenerationStatus, GenerationStream, SequenceOutput};
use crate::tokenizer::Tokenizer;
use crate::{RequestId, SeqId, TokenId};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("model runtime error: {0}")]
    ModelRuntime(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Prompt input: pre-tokenized ids, or raw text for engines with an
/// attached tokenizer.
pub enum RequestInput {
    Tokens(Vec<TokenId>),
    Text(String),
}

impl From<Vec<TokenId>> for RequestInput {
    fn from(ids: Vec<TokenId>) -> Self {
        Self::Tokens(ids)
    }
}

impl From<&str> for RequestInput {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for RequestInput {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

/// Per-sibling slice of one iteration's forward pass.
pub struct SequenceBatchMetadata {
    pub request_id: RequestId,
    pub seq_id: SeqId,
    /// The scheduled token slice of `prompt + generated`.
    pub input_ids: Vec<TokenId>,
    /// Position of `input_ids[0]` in the sequence.
    pub start_pos: usize,
    /// Physical cache slot per input position.
    pub slot_mapping: Vec<usize>,
    /// This sibling's full block table, for attention over prior context.
    pub block_ids: Vec<BlockId>,
}

/// Everything the model runner needs for one iteration.
pub struct ForwardBatch {
    pub sequences: Vec<SequenceBatchMetadata>,
    /// Physical copies to perform before the pass (copy-on-write).
    pub block_copy_ops: Vec<(BlockId, BlockId)>,
}

impl ForwardBatch {
    pub fn num_rows(&self) -> usize {
        self.sequences.iter().map(|s| s.input_ids.len()).sum()
    }
}

/// External model execution. The runner consumes the copy list, builds its
/// input tensors from the batch metadata, writes new KV into the addressed
/// slots, and returns logits of shape `[num_rows, vocab]` in batch order.
pub trait ModelRunner {
    fn forward(&mut self, batch: &ForwardBatch) -> candle_core::Result<Tensor>;
}

/// Terminal result for one request.
#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub request_id: RequestId,
    pub status: GenerationStatus,
    pub outputs: Vec<SequenceOutput>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub num_live_requests: usize,
    pub num_pending_requests: usize,
    pub num_free_blocks: usize,
    pub num_total_blocks: usize,
    pub block_size: usize,
}

struct PendingRequest {
    request_id: RequestId,
    prompt_ids: Vec<TokenId>,
    params: SamplingParams,
    stream: Arc<GenerationStream>,
}

struct PendingState {
    queue: VecDeque<PendingRequest>,
    seen_request_ids: HashSet<RequestId>,
    next_auto_id: RequestId,
}

/// The continuous-batching engine core.
///
/// One cooperative loop drives `schedule → forward → sample → notify`; a
/// call to [`step`](Self::step) runs exactly one iteration. The only
/// cross-thread seams are [`add_request`](Self::add_request) (a
/// mutex-guarded input queue drained at the top of the next iteration) and
/// the per-request generation streams.
pub struct LlmEngine<R: ModelRunner> {
    config: EngineConfig,
    scheduler: Scheduler,
    blocks: BlockManager,
    store: SequenceGroupStore,
    runner: R,
    tokenizer: Option<Box<dyn Tokenizer>>,
    eos_token_id: TokenId,
    pending: Mutex<PendingState>,
}

impl<R: ModelRunner> LlmEngine<R> {
    pub fn new(config: EngineConfig, runner: R) -> Result<Self, EngineError> {
        config.validate()?;
        let scheduler = Scheduler::new(SchedulerConfig::from_engine(&config));
        let blocks = BlockManager::new(config.cache_size_blocks, config.block_size);
        let eos_token_id = config.eos_token_id;
        Ok(Self {
            config,
            scheduler,
            blocks,
            store: SequenceGroupStore::new(),
            runner,
            tokenizer: None,
            eos_token_id,
            pending: Mutex::new(PendingState {
                queue: VecDeque::new(),
                seen_request_ids: HashSet::new(),
                next_auto_id: 0,
            }),
        })
    }

    pub fn with_tokenizer(mut self, tokenizer: Box<dyn Tokenizer>) -> Self {
        self.eos_token_id = tokenizer.eos_token_id();
        self.tokenizer = Some(tokenizer);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Cache-level bookkeeping, exposed for monitoring and tests.
    pub fn block_manager(&self) -> &BlockManager {
        &self.blocks
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            num_live_requests: self.store.len(),
            num_pending_requests: self.pending_state().queue.len(),
            num_free_blocks: self.blocks.num_free_blocks(),
            num_total_blocks: self.blocks.num_total_blocks(),
            block_size: self.blocks.block_size(),
        }
    }

    fn pending_state(&self) -> MutexGuard<'_, PendingState> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a request. Thread-safe; the request becomes visible to the
    /// next iteration's schedule.
    pub fn add_request(
        &self,
        request_id: RequestId,
        input: impl Into<RequestInput>,
        params: SamplingParams,
    ) -> Result<GenerationHandle, EngineError> {
        params
            .validate()
            .map_err(|e| EngineError::InvalidRequest(e.to_string()))?;
        let prompt_ids = match input.into() {
            RequestInput::Tokens(ids) => ids,
            RequestInput::Text(text) => match &self.tokenizer {
                Some(tokenizer) => tokenizer
                    .encode(&text)
                    .map_err(|e| EngineError::InvalidRequest(e.to_string()))?,
                None => {
                    return Err(EngineError::InvalidRequest(
                        "text input requires a tokenizer".to_string(),
                    ))
                }
            },
        };
        if prompt_ids.is_empty() {
            return Err(EngineError::InvalidRequest("empty prompt".to_string()));
        }

        let mut pending = self.pending_state();
        if !pending.seen_request_ids.insert(request_id) {
            return Err(EngineError::InvalidRequest(format!(
                "duplicate request_id {request_id}"
            )));
        }
        let stream = GenerationStream::new();
        pending.queue.push_back(PendingRequest {
            request_id,
            prompt_ids,
            params,
            stream: Arc::clone(&stream),
        });
        tracing::debug!(request_id, "request queued");
        Ok(GenerationHandle::new(stream))
    }

    /// Cancel a request by id. Pending requests terminate immediately;
    /// live ones are reaped at the next iteration.
    pub fn abort(&mut self, request_id: RequestId) {
        let mut pending = self.pending_state();
        if let Some(pos) = pending
            .queue
            .iter()
            .position(|p| p.request_id == request_id)
        {
            let request = pending.queue.remove(pos).expect("position just found");
            request
                .stream
                .finish(GenerationStatus::Cancelled, Vec::new());
            return;
        }
        drop(pending);
        if let Some(group) = self.store.get(request_id) {
            group.stream().cancel();
        }
    }

    pub fn has_unfinished_requests(&self) -> bool {
        !self.store.is_empty() || !self.pending_state().queue.is_empty()
    }

    /// Run exactly one iteration. Returns the requests that reached a
    /// terminal state during it.
    pub fn step(&mut self) -> Result<Vec<GenerationResult>, EngineError> {
        let mut results = Vec::new();
        self.drain_pending();
        self.reap_cancelled(&mut results);

        let plan = {
            let (groups, _) = self.store.split_mut();
            self.scheduler.schedule(groups, &mut self.blocks)
        };
        self.reap_rejected(&plan.rejected, &mut results);

        if !plan.scheduled.is_empty() {
            let batch = self.build_batch(&plan);
            let rows = match self.forward_rows(&batch) {
                Ok(rows) => rows,
                Err(message) => {
                    self.fail_scheduled(&plan, &message);
                    return Err(EngineError::ModelRuntime(message));
                }
            };
            self.apply_sampling(&plan, &rows);
        }

        results.extend(self.reap_finished());
        debug_assert!(self.blocks.check_ref_integrity());
        Ok(results)
    }

    /// Drive [`step`](Self::step) until every submitted prompt finishes;
    /// results come back sorted by ascending request id.
    pub fn generate(
        &mut self,
        prompts: Vec<Vec<TokenId>>,
        params: Vec<SamplingParams>,
    ) -> Result<Vec<GenerationResult>, EngineError> {
        if prompts.len() != params.len() {
            return Err(EngineError::InvalidRequest(
                "prompts and params length mismatch".to_string(),
            ));
        }
        let mut submitted = HashSet::new();
        let mut handles = Vec::new();
        for (prompt, p) in prompts.into_iter().zip(params) {
            let request_id = self.next_auto_request_id();
            handles.push(self.add_request(request_id, RequestInput::Tokens(prompt), p)?);
            submitted.insert(request_id);
        }

        let mut results = Vec::new();
        while self.has_unfinished_requests() {
            let step_results = self.step()?;
            results.extend(
                step_results
                    .into_iter()
                    .filter(|r| submitted.contains(&r.request_id)),
            );
        }
        // streams are finished by now, so dropping the handles is inert
        drop(handles);
        results.sort_by_key(|r| r.request_id);
        Ok(results)
    }

    fn next_auto_request_id(&self) -> RequestId {
        let mut pending = self.pending_state();
        loop {
            let id = pending.next_auto_id;
            pending.next_auto_id += 1;
            if !pending.seen_request_ids.contains(&id) {
                return id;
            }
        }
    }

    fn drain_pending(&mut self) {
        let requests: Vec<PendingRequest> = self.pending_state().queue.drain(..).collect();
        for request in requests {
            self.store.add_group_with_stream(
                request.request_id,
                request.prompt_ids,
                request.params,
                self.config.block_size,
                request.stream,
            );
        }
    }

    fn reap_cancelled(&mut self, results: &mut Vec<GenerationResult>) {
        let cancelled: Vec<RequestId> = self
            .store
            .iter()
            .filter(|g| g.stream().is_cancelled())
            .map(|g| g.request_id())
            .collect();
        if cancelled.is_empty() {
            return;
        }
        for mut group in self.store.take_by_ids(&cancelled) {
            tracing::debug!(request_id = group.request_id(), "request cancelled");
            self.terminate_group(&mut group, FinishReason::Cancelled);
            let outputs = group.final_outputs();
            group
                .stream()
                .finish(GenerationStatus::Cancelled, outputs.clone());
            results.push(GenerationResult {
                request_id: group.request_id(),
                status: GenerationStatus::Cancelled,
                outputs,
            });
        }
    }

    fn reap_rejected(&mut self, rejected: &[RequestId], results: &mut Vec<GenerationResult>) {
        if rejected.is_empty() {
            return;
        }
        for mut group in self.store.take_by_ids(rejected) {
            self.terminate_group(&mut group, FinishReason::Capacity);
            let outputs = group.final_outputs();
            group
                .stream()
                .finish(GenerationStatus::OutOfCapacity, outputs.clone());
            results.push(GenerationResult {
                request_id: group.request_id(),
                status: GenerationStatus::OutOfCapacity,
                outputs,
            });
        }
    }

    fn fail_scheduled(&mut self, plan: &SchedulerOutput, message: &str) {
        tracing::error!(error = message, "model runner failed, terminating in-flight batch");
        let scheduled: Vec<RequestId> = plan.scheduled.iter().map(|s| s.request_id).collect();
        for mut group in self.store.take_by_ids(&scheduled) {
            group.clear_scheduled_tokens();
            self.terminate_group(&mut group, FinishReason::ModelError);
            let outputs = group.final_outputs();
            group.stream().finish(
                GenerationStatus::ModelError(message.to_string()),
                outputs.clone(),
            );
        }
    }

    /// Finish every running sibling with `reason` and release all cache.
    fn terminate_group(&mut self, group: &mut SequenceGroup, reason: FinishReason) {
        for seq_id in group.running_seq_ids() {
            group
                .sequence_mut(seq_id)
                .expect("running sibling exists")
                .finish(reason);
        }
        for seq in group.sequences() {
            self.blocks
                .free_sequence(seq.seq_id())
                .expect("freeing a live table cannot fail");
        }
    }

    fn build_batch(&self, plan: &SchedulerOutput) -> ForwardBatch {
        let mut sequences = Vec::new();
        for item in &plan.scheduled {
            let group = self
                .store
                .get(item.request_id)
                .expect("scheduled group exists");
            let start_pos = group.num_processed_tokens();
            let n = item.num_tokens;
            for seq in group.running_sequences() {
                let input_ids: Vec<TokenId> = (start_pos..start_pos + n)
                    .map(|pos| token_at(group, seq.generated_ids(), pos))
                    .collect();
                let table = self
                    .blocks
                    .table(seq.seq_id())
                    .expect("scheduled sibling has a block table");
                sequences.push(SequenceBatchMetadata {
                    request_id: item.request_id,
                    seq_id: seq.seq_id(),
                    input_ids,
                    start_pos,
                    slot_mapping: table.slot_mapping(start_pos, n),
                    block_ids: table.block_ids().to_vec(),
                });
            }
        }
        ForwardBatch {
            sequences,
            block_copy_ops: plan.block_copy_ops.clone(),
        }
    }

    /// Run the model and pull the logits back as one row per scheduled
    /// position. Any failure (including a shape mismatch) is a model
    /// runtime error.
    fn forward_rows(&mut self, batch: &ForwardBatch) -> Result<Vec<Vec<f32>>, String> {
        let logits = self.runner.forward(batch).map_err(|e| e.to_string())?;
        let rows: Vec<Vec<f32>> = logits.to_vec2().map_err(|e| e.to_string())?;
        if rows.len() != batch.num_rows() {
            return Err(format!(
                "logits row count {} does not match scheduled tokens {}",
                rows.len(),
                batch.num_rows()
            ));
        }
        Ok(rows)
    }

    fn apply_sampling(&mut self, plan: &SchedulerOutput, rows: &[Vec<f32>]) {
        let sampler = Sampler::new(self.eos_token_id);
        let (groups, ids) = self.store.split_mut();
        let mut base = 0usize;
        for item in &plan.scheduled {
            let group = groups
                .iter_mut()
                .find(|g| g.request_id() == item.request_id)
                .expect("scheduled group exists");
            let sibling_ids = group.running_seq_ids();
            let n = item.num_tokens;

            // the forward pass wrote KV for every scheduled position
            for &seq_id in &sibling_ids {
                self.blocks
                    .advance(seq_id, n)
                    .expect("scheduled sibling has a block table");
            }

            let appended = if group.requires_sampling() {
                let sibling_rows: Vec<(SeqId, &[f32])> = sibling_ids
                    .iter()
                    .enumerate()
                    .map(|(j, &seq_id)| (seq_id, rows[base + j * n + (n - 1)].as_slice()))
                    .collect();
                sampler.sample_group(group, ids, &mut self.blocks, &sibling_rows)
            } else {
                Vec::new()
            };
            group.finish_iteration();
            let outputs = group.iteration_outputs(&appended);
            if !outputs.is_empty() {
                group.stream().push(outputs);
            }
            base += n * sibling_ids.len();
        }
    }

    fn reap_finished(&mut self) -> Vec<GenerationResult> {
        let finished = self.store.take_finished();
        let mut results = Vec::new();
        for group in finished {
            // finished siblings freed their tables as they stopped; this
            // sweep only covers defensive leftovers
            for seq in group.sequences() {
                self.blocks
                    .free_sequence(seq.seq_id())
                    .expect("freeing a live table cannot fail");
            }
            let outputs = group.final_outputs();
            group
                .stream()
                .finish(GenerationStatus::Finished, outputs.clone());
            tracing::debug!(request_id = group.request_id(), "request finished");
            results.push(GenerationResult {
                request_id: group.request_id(),
                status: GenerationStatus::Finished,
                outputs,
            });
        }
        results
    }
}

fn token_at(group: &SequenceGroup, generated: &[TokenId], pos: usize) -> TokenId {
    if pos < group.prompt_len() {
        group.prompt_ids()[pos]
    } else {
        generated[pos - group.prompt_len()]
    }
}
