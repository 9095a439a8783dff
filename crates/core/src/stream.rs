use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use crate::request::FinishReason;
use crate::{SeqId, TokenId};

/// One sibling's contribution to an iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutput {
    pub parent_id: SeqId,
    pub token_id: TokenId,
    pub cumulative_log_prob: f32,
}

/// Everything a group produced in one iteration, keyed by sibling id.
pub type GenerationOutputs = HashMap<SeqId, GenerationOutput>;

/// Terminal state of a request as seen by its stream.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationStatus {
    Running,
    Finished,
    /// The scheduler could not satisfy the request even after preemption.
    OutOfCapacity,
    ModelError(String),
    Cancelled,
}

/// Aggregated result for one sibling, available once the group finishes.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceOutput {
    pub seq_id: SeqId,
    pub generated_token_ids: Vec<TokenId>,
    pub cumulative_log_prob: f32,
    pub finish_reason: Option<FinishReason>,
}

#[derive(Debug)]
struct StreamState {
    queue: VecDeque<GenerationOutputs>,
    status: GenerationStatus,
    results: Vec<SequenceOutput>,
    cancelled: bool,
}

/// SPSC channel between the engine loop (producer) and one
/// [`GenerationHandle`] (consumer). A mutex plus condvar is enough: the
/// producer never blocks, and iteration outputs are delivered in order.
#[derive(Debug)]
pub struct GenerationStream {
    state: Mutex<StreamState>,
    readable: Condvar,
}

impl GenerationStream {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(StreamState {
                queue: VecDeque::new(),
                status: GenerationStatus::Running,
                results: Vec::new(),
                cancelled: false,
            }),
            readable: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Engine side: enqueue one iteration's outputs. At most once per
    /// iteration per group.
    pub fn push(&self, outputs: GenerationOutputs) {
        let mut state = self.lock();
        state.queue.push_back(outputs);
        self.readable.notify_one();
    }

    /// Engine side: close the stream with the terminal status and the
    /// per-sibling aggregates. Idempotent against a racing cancel.
    pub fn finish(&self, status: GenerationStatus, results: Vec<SequenceOutput>) {
        let mut state = self.lock();
        if state.status == GenerationStatus::Running {
            state.status = status;
            state.results = results;
        }
        self.readable.notify_all();
    }

    /// Client side (via handle drop): ask the engine to reap this group at
    /// its next scheduler entry.
    pub fn cancel(&self) {
        let mut state = self.lock();
        if state.status == GenerationStatus::Running {
            state.cancelled = true;
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    pub fn is_finished(&self) -> bool {
        self.lock().status != GenerationStatus::Running
    }
}

/// Client end of a generation stream.
///
/// Dropping an unfinished handle cancels the request; the engine frees its
/// blocks and delivers a terminal [`GenerationStatus::Cancelled`].
#[derive(Debug)]
pub struct GenerationHandle {
    stream: Arc<GenerationStream>,
}

impl GenerationHandle {
    pub(crate) fn new(stream: Arc<GenerationStream>) -> Self {
        Self { stream }
    }

    /// True iff at least one unread iteration output is queued.
    pub fn can_read(&self) -> bool {
        !self.stream.lock().queue.is_empty()
    }

    /// True iff the group has pushed its final output and the stream is
    /// drained.
    pub fn generation_finished(&self) -> bool {
        let state = self.stream.lock();
        state.status != GenerationStatus::Running && state.queue.is_empty()
    }

    pub fn status(&self) -> GenerationStatus {
        self.stream.lock().status.clone()
    }

    /// Next iteration's outputs, blocking while the request is still
    /// running. Returns `None` once the stream is finished and drained.
    pub fn read(&self) -> Option<GenerationOutputs> {
        let mut state = self.stream.lock();
        loop {
            if let Some(outputs) = state.queue.pop_front() {
                return Some(outputs);
            }
            if state.status != GenerationStatus::Running {
                return None;
            }
            state = self
                .stream
                .readable
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until the group finishes, then return one aggregate per
    /// sibling: beam-search results sorted by score descending, others by
    /// ascending `seq_id`. Drains any unread iteration outputs.
    pub fn read_all(&self) -> Vec<SequenceOutput> {
        let mut state = self.stream.lock();
        while state.status == GenerationStatus::Running {
            state = self
                .stream
                .readable
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.queue.clear();
        state.results.clone()
    }
}

impl Drop for GenerationHandle {
    fn drop(&mut self) {
        self.stream.cancel();
    }
}
