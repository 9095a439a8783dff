use std::collections::HashSet;

use crate::config::EngineConfig;
use crate::kv_cache::{BlockId, BlockManager};
use crate::request::SequenceGroup;
use crate::RequestId;

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Upper bound on logits rows per iteration (scheduled tokens summed
    /// over running siblings).
    pub max_num_batched_tokens: usize,
    /// Upper bound on concurrently running siblings.
    pub max_num_seqs: usize,
    /// Allow partially scheduled prefills.
    pub dynamic_split_fuse: bool,
    /// Per-iteration preemption cap; hitting it yields a partial plan.
    pub max_num_preemptions: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_num_batched_tokens: 2048,
            max_num_seqs: 256,
            dynamic_split_fuse: false,
            max_num_preemptions: 8,
        }
    }
}

impl SchedulerConfig {
    pub fn from_engine(config: &EngineConfig) -> Self {
        Self {
            max_num_batched_tokens: config.max_num_batched_tokens,
            max_num_seqs: config.max_num_seqs,
            dynamic_split_fuse: config.dynamic_split_fuse,
            max_num_preemptions: config.max_num_preemptions,
        }
    }
}

/// One admitted group: how many tokens each running sibling processes this
/// iteration (decode groups always get 1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledGroup {
    pub request_id: RequestId,
    pub num_tokens: usize,
}

/// The batch plan for one iteration.
#[derive(Debug, Default)]
pub struct SchedulerOutput {
    /// Admission order; the model runner consumes rows in this order.
    pub scheduled: Vec<ScheduledGroup>,
    /// Physical copies the runner must perform before the pass (CoW).
    pub block_copy_ops: Vec<(BlockId, BlockId)>,
    /// Groups evicted this iteration; they re-prefill on re-admission.
    pub preempted: Vec<RequestId>,
    /// Groups that cannot be satisfied even by preemption.
    pub rejected: Vec<RequestId>,
}

/// Per-iteration batch composition: decide which groups run, how many
/// tokens each processes, and which cache blocks move to make that true.
///
/// Generation-phase groups are admitted first (their per-iteration demand
/// is small and they hold the most cache), then prefills, both FIFO by
/// request id. Allocation failure for a generation group triggers
/// recompute preemption, newest victims first.
pub struct Scheduler {
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn schedule(
        &self,
        groups: &mut [SequenceGroup],
        blocks: &mut BlockManager,
    ) -> SchedulerOutput {
        let mut out = SchedulerOutput::default();
        let mut token_budget = self.config.max_num_batched_tokens;
        let mut seq_budget = self.config.max_num_seqs;
        let mut preemptions_left = self.config.max_num_preemptions;

        let mut decode_order: Vec<usize> = Vec::new();
        let mut prefill_order: Vec<usize> = Vec::new();
        for (i, group) in groups.iter().enumerate() {
            if group.has_finished() {
                continue;
            }
            if group.can_generate_tokens() {
                decode_order.push(i);
            } else {
                prefill_order.push(i);
            }
        }
        decode_order.sort_by_key(|&i| groups[i].request_id());
        prefill_order.sort_by_key(|&i| groups[i].request_id());

        let mut preempted: HashSet<usize> = HashSet::new();
        let mut scheduled: HashSet<usize> = HashSet::new();

        // Phase 1: generation-phase groups, one token per running sibling.
        'decode: for &i in &decode_order {
            if preempted.contains(&i) {
                continue;
            }
            let num_seqs = groups[i].num_running_seqs();
            if num_seqs > seq_budget || num_seqs > token_budget {
                break;
            }
            loop {
                let demand = decode_block_demand(&groups[i], blocks);
                if demand <= blocks.num_free_blocks() {
                    let pos = groups[i].num_processed_tokens();
                    for seq_id in groups[i].running_seq_ids() {
                        blocks
                            .allocate_slots(seq_id, 1)
                            .expect("decode demand was precomputed");
                        let ops = blocks
                            .copy_on_write_range(seq_id, pos, 1)
                            .expect("running sequence has a block table");
                        out.block_copy_ops.extend(ops);
                    }
                    groups[i].schedule_tokens(1);
                    out.scheduled.push(ScheduledGroup {
                        request_id: groups[i].request_id(),
                        num_tokens: 1,
                    });
                    scheduled.insert(i);
                    token_budget -= num_seqs;
                    seq_budget -= num_seqs;
                    continue 'decode;
                }
                if demand > blocks.num_total_blocks() {
                    // can never fit, even with the whole pool
                    tracing::warn!(
                        request_id = groups[i].request_id(),
                        demand,
                        "rejecting request larger than the cache"
                    );
                    out.rejected.push(groups[i].request_id());
                    continue 'decode;
                }
                if preemptions_left == 0 {
                    tracing::warn!(
                        request_id = groups[i].request_id(),
                        "preemption cap reached, yielding partial plan"
                    );
                    break 'decode;
                }
                match pick_victim(groups, i, &preempted, &scheduled, blocks) {
                    Some(victim) => {
                        tracing::debug!(
                            victim = groups[victim].request_id(),
                            requester = groups[i].request_id(),
                            "preempting for cache space"
                        );
                        preempt_group(&mut groups[victim], blocks);
                        out.preempted.push(groups[victim].request_id());
                        preempted.insert(victim);
                        preemptions_left -= 1;
                        if victim == i {
                            // the requester was the only block holder; it
                            // restarts as a prefill on a later iteration
                            continue 'decode;
                        }
                    }
                    None => {
                        tracing::warn!(
                            request_id = groups[i].request_id(),
                            "no preemption victim left, rejecting"
                        );
                        out.rejected.push(groups[i].request_id());
                        continue 'decode;
                    }
                }
            }
        }

        // Phase 2: prefills, FIFO, until a budget would be exceeded.
        for &i in &prefill_order {
            if preempted.contains(&i) {
                continue;
            }
            let group = &groups[i];
            // reserve the group's full fan-out so later forks cannot push
            // the running-sibling count past the limit
            let seq_cost = group
                .sampling_params()
                .max_num_seqs()
                .max(group.num_running_seqs());
            if seq_cost > seq_budget {
                break;
            }
            let num_seqs = group.num_running_seqs();
            let remaining = group.num_available_tokens();
            let chunk = if self.config.dynamic_split_fuse {
                remaining.min(token_budget / num_seqs)
            } else {
                remaining
            };
            if chunk == 0 || chunk * num_seqs > token_budget {
                break;
            }

            let mut demand = 0;
            for seq_id in group.running_seq_ids() {
                ensure_table(blocks, seq_id);
                demand += blocks
                    .blocks_needed(seq_id, chunk)
                    .expect("table ensured above");
            }
            if demand > blocks.num_free_blocks() {
                if demand > blocks.num_total_blocks() {
                    tracing::warn!(
                        request_id = group.request_id(),
                        demand,
                        "rejecting prompt larger than the cache"
                    );
                    out.rejected.push(group.request_id());
                    continue;
                }
                break;
            }

            let pos = group.num_processed_tokens();
            for seq_id in groups[i].running_seq_ids() {
                blocks
                    .allocate_slots(seq_id, chunk)
                    .expect("prefill demand was precomputed");
                let ops = blocks
                    .copy_on_write_range(seq_id, pos, chunk)
                    .expect("running sequence has a block table");
                out.block_copy_ops.extend(ops);
            }
            groups[i].schedule_tokens(chunk);
            out.scheduled.push(ScheduledGroup {
                request_id: groups[i].request_id(),
                num_tokens: chunk,
            });
            scheduled.insert(i);
            token_budget -= chunk * num_seqs;
            seq_budget -= seq_cost;
        }

        tracing::debug!(
            scheduled = out.scheduled.len(),
            preempted = out.preempted.len(),
            rejected = out.rejected.len(),
            free_blocks = blocks.num_free_blocks(),
            "schedule composed"
        );
        out
    }
}

/// Blocks a generation step needs: room for one more token per running
/// sibling, plus a detach copy wherever the written slot sits in a shared
/// block.
fn decode_block_demand(group: &SequenceGroup, blocks: &BlockManager) -> usize {
    let pos = group.num_processed_tokens();
    let mut demand = 0;
    for seq in group.running_sequences() {
        let table = blocks
            .table(seq.seq_id())
            .expect("running sequence has a block table");
        demand += table.blocks_needed(1);
        let logical_idx = pos / table.block_size();
        if let Some(&block_id) = table.block_ids().get(logical_idx) {
            if blocks.refcount(block_id) > 1 {
                demand += 1;
            }
        }
    }
    demand
}

fn ensure_table(blocks: &mut BlockManager, seq_id: crate::SeqId) {
    if blocks.table(seq_id).is_err() {
        blocks
            .register_sequence(seq_id)
            .expect("table absence was just checked");
    }
}

/// Free every sibling's cache and reset the group to re-prefill.
fn preempt_group(group: &mut SequenceGroup, blocks: &mut BlockManager) {
    for seq_id in group.sequences().iter().map(|s| s.seq_id()).collect::<Vec<_>>() {
        blocks
            .free_sequence(seq_id)
            .expect("freeing a live table cannot fail");
    }
    group.preempt();
}

/// LIFO victim choice: the youngest block-holding group that is neither
/// already scheduled nor already evicted this iteration. The requester
/// itself is eligible only when nothing else holds blocks.
fn pick_victim(
    groups: &[SequenceGroup],
    requester: usize,
    preempted: &HashSet<usize>,
    scheduled: &HashSet<usize>,
    blocks: &BlockManager,
) -> Option<usize> {
    let holds_blocks = |i: usize| {
        groups[i].sequences().iter().any(|s| {
            blocks
                .table(s.seq_id())
                .map(|t| !t.block_ids().is_empty())
                .unwrap_or(false)
        })
    };
    let candidate = groups
        .iter()
        .enumerate()
        .filter(|(i, g)| {
            *i != requester
                && !g.has_finished()
                && !preempted.contains(i)
                && !scheduled.contains(i)
                && holds_blocks(*i)
        })
        .max_by_key(|(_, g)| g.request_id())
        .map(|(i, _)| i);
    candidate.or_else(|| holds_blocks(requester).then_some(requester))
}
