//! End-to-end engine scenarios: batching shape, preemption round trips,
//! sibling fan-out, beam search, and cancellation.

use batchflow_core::config::EngineConfig;
use batchflow_core::engine::LlmEngine;
use batchflow_core::request::FinishReason;
use batchflow_core::sampling::SamplingParams;
use batchflow_core::stream::GenerationStatus;
use batchflow_core::testing::{ConstLogitsModel, NextTokenModel, ScriptedModel};
use batchflow_core::tokenizer::{Tokenizer, TokenizerError};
use batchflow_core::TokenId;

fn config(max_tokens: usize, cache_blocks: usize) -> EngineConfig {
    EngineConfig {
        max_num_batched_tokens: max_tokens,
        max_num_seqs: 8,
        block_size: 16,
        cache_size_blocks: cache_blocks,
        eos_token_id: 0,
        ..EngineConfig::default()
    }
}

fn one_hot(vocab: usize, hot: usize) -> Vec<f32> {
    let mut row = vec![0.0; vocab];
    row[hot] = 50.0;
    row
}

#[test]
fn single_greedy_request_counts_up() {
    let mut engine = LlmEngine::new(config(64, 16), NextTokenModel::new(32)).unwrap();
    let handle = engine
        .add_request(0, vec![1, 2, 3], SamplingParams::greedy(5))
        .unwrap();

    while engine.has_unfinished_requests() {
        engine.step().unwrap();
    }

    let results = handle.read_all();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].generated_token_ids, vec![4, 5, 6, 7, 8]);
    assert_eq!(results[0].finish_reason, Some(FinishReason::Length));
    // the mock's one-hot logits put probability 1 on every chosen token
    assert_eq!(results[0].cumulative_log_prob, 0.0);
    assert_eq!(handle.status(), GenerationStatus::Finished);
}

#[test]
fn two_requests_share_the_batch() {
    // K = 8 fits exactly both 4-token prefills in iteration 1; the last
    // prefill row of each group samples its first token, then decode
    // iterations carry 2 rows each.
    let mut engine = LlmEngine::new(config(8, 16), NextTokenModel::new(64)).unwrap();
    let handle_a = engine
        .add_request(0, vec![1, 2, 3, 4], SamplingParams::greedy(3))
        .unwrap();
    let handle_b = engine
        .add_request(1, vec![11, 12, 13, 14], SamplingParams::greedy(3))
        .unwrap();

    let mut iterations = 0;
    while engine.has_unfinished_requests() {
        engine.step().unwrap();
        iterations += 1;
        assert!(iterations < 16, "engine failed to converge");
    }
    // prefill+first-token, then one decode iteration per remaining token
    assert_eq!(iterations, 3);
    assert_eq!(handle_a.read_all()[0].generated_token_ids, vec![5, 6, 7]);
    assert_eq!(handle_b.read_all()[0].generated_token_ids, vec![15, 16, 17]);
}

#[test]
fn preempted_request_recomputes_identically() {
    // The pool holds exactly two 16-token blocks: both groups prefill, and
    // the first decode iteration forces the younger request out.
    let prompt_a: Vec<TokenId> = (1..=16).collect();
    let prompt_b: Vec<TokenId> = (101..=116).collect();

    let mut engine = LlmEngine::new(config(64, 2), NextTokenModel::new(256)).unwrap();
    let handle_a = engine
        .add_request(0, prompt_a, SamplingParams::greedy(4))
        .unwrap();
    let handle_b = engine
        .add_request(1, prompt_b.clone(), SamplingParams::greedy(4))
        .unwrap();

    while engine.has_unfinished_requests() {
        engine.step().unwrap();
    }

    assert_eq!(
        handle_a.read_all()[0].generated_token_ids,
        vec![17, 18, 19, 20]
    );
    let preempted = handle_b.read_all();
    assert_eq!(
        preempted[0].generated_token_ids,
        vec![117, 118, 119, 120]
    );

    // identical to an uncontended run of the same request
    let mut solo = LlmEngine::new(config(64, 2), NextTokenModel::new(256)).unwrap();
    let solo_handle = solo
        .add_request(0, prompt_b, SamplingParams::greedy(4))
        .unwrap();
    while solo.has_unfinished_requests() {
        solo.step().unwrap();
    }
    assert_eq!(
        solo_handle.read_all()[0].generated_token_ids,
        preempted[0].generated_token_ids
    );
}

#[test]
fn parallel_sampling_shares_prompt_blocks() {
    let mut engine = LlmEngine::new(config(64, 16), NextTokenModel::new(32)).unwrap();
    let handle = engine
        .add_request(0, vec![1, 2, 3, 4], SamplingParams::parallel(3, 3, 0.0))
        .unwrap();

    // prefill + first sampling step: the seed forks into 3 siblings
    engine.step().unwrap();
    let outputs = handle.read().unwrap();
    assert_eq!(outputs.len(), 3);

    // every sibling maps the same physical prompt block, refcounted 3 ways
    let blocks = engine.block_manager();
    for &seq_id in outputs.keys() {
        let table = blocks.table(seq_id).unwrap();
        assert_eq!(table.block_ids().len(), 1);
        assert_eq!(blocks.refcount(table.block_ids()[0]), 3);
    }
    assert!(blocks.check_ref_integrity());

    while engine.has_unfinished_requests() {
        engine.step().unwrap();
    }
    let results = handle.read_all();
    assert_eq!(results.len(), 3);
    // temperature 0 collapses every sibling to the same greedy path
    for result in &results {
        assert_eq!(result.generated_token_ids, vec![5, 6, 7]);
    }
    assert_eq!(engine.stats().num_free_blocks, 16);
}

#[test]
fn beam_search_ranks_and_keeps_losers() {
    // log-softmax of [2, 0, -30, -30] puts roughly -0.127 on token 0 and
    // -2.127 on token 1; EOS (3) never reaches the kept set
    let mut cfg = config(64, 16);
    cfg.eos_token_id = 3;
    let model = ConstLogitsModel::new(vec![2.0, 0.0, -30.0, -30.0]);
    let mut engine = LlmEngine::new(cfg, model).unwrap();
    let handle = engine
        .add_request(0, vec![1, 2], SamplingParams::beam_search(2, 2, 1.0))
        .unwrap();

    while engine.has_unfinished_requests() {
        engine.step().unwrap();
    }

    let results = handle.read_all();
    // two surviving beams plus the step-one loser, best score first
    assert_eq!(results.len(), 3);
    assert_eq!(results[0].generated_token_ids, vec![0, 0]);
    assert_eq!(results[1].generated_token_ids, vec![0, 1]);
    assert_eq!(results[2].generated_token_ids, vec![1]);
    assert_eq!(results[2].finish_reason, Some(FinishReason::Pruned));

    let score = |r: &batchflow_core::stream::SequenceOutput| {
        r.cumulative_log_prob / r.generated_token_ids.len().max(1) as f32
    };
    assert!(score(&results[0]) > score(&results[1]));
    assert!(score(&results[1]) > score(&results[2]));
    assert_eq!(engine.stats().num_free_blocks, 16);
}

#[test]
fn beam_search_scores_late_eos_at_its_real_length() {
    // Step one splits the beam on tokens 0/1 with EOS nowhere in sight;
    // step two puts EOS (3) between the two best continuations by raw
    // log-prob. An EOS completion keeps the parent's length, so its score
    // divides by 1 where the kept pair divides by 2, and it must lose to
    // both instead of being diverted into a finished hypothesis.
    let mut cfg = config(64, 16);
    cfg.eos_token_id = 3;
    let model = ScriptedModel::new(vec![
        vec![2.0, 0.0, -30.0, -30.0],
        vec![2.0, 1.9, -8.0, 1.95],
    ]);
    let mut engine = LlmEngine::new(cfg, model).unwrap();
    let handle = engine
        .add_request(0, vec![1, 2], SamplingParams::beam_search(2, 2, 1.0))
        .unwrap();

    while engine.has_unfinished_requests() {
        engine.step().unwrap();
    }

    let results = handle.read_all();
    // two surviving beams plus the step-one loser, and nothing completed
    assert_eq!(results.len(), 3);
    assert!(results
        .iter()
        .all(|r| r.finish_reason != Some(FinishReason::Eos)));
    assert_eq!(results[0].generated_token_ids, vec![0, 0]);
    assert_eq!(results[1].generated_token_ids, vec![0, 1]);
    assert_eq!(results[2].generated_token_ids, vec![1]);
    assert_eq!(engine.stats().num_free_blocks, 16);
}

#[test]
fn scripted_stop_token_ends_generation() {
    // the stop token only becomes the argmax on the second decode step
    let model = ScriptedModel::new(vec![one_hot(8, 4), one_hot(8, 6)]);
    let mut engine = LlmEngine::new(config(64, 16), model).unwrap();
    let mut params = SamplingParams::greedy(10);
    params.stop_token_ids = vec![6];
    let handle = engine.add_request(0, vec![1, 2], params).unwrap();

    while engine.has_unfinished_requests() {
        engine.step().unwrap();
    }

    let results = handle.read_all();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].generated_token_ids, vec![4, 6]);
    assert_eq!(results[0].finish_reason, Some(FinishReason::Stop));
}

#[test]
fn dropping_handle_cancels_and_frees() {
    let mut engine = LlmEngine::new(config(64, 16), NextTokenModel::new(32)).unwrap();
    let handle = engine
        .add_request(0, vec![1, 2, 3], SamplingParams::greedy(50))
        .unwrap();

    engine.step().unwrap();
    assert_eq!(engine.stats().num_live_requests, 1);
    drop(handle);

    let results = engine.step().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, GenerationStatus::Cancelled);
    assert_eq!(results[0].outputs[0].finish_reason, Some(FinishReason::Cancelled));
    assert_eq!(engine.stats().num_live_requests, 0);
    assert_eq!(engine.stats().num_free_blocks, 16);

    // subsequent iterations no longer mention the request
    assert!(engine.step().unwrap().is_empty());
    assert!(!engine.has_unfinished_requests());
}

#[test]
fn generate_returns_results_sorted_by_request_id() {
    let mut engine = LlmEngine::new(config(64, 32), NextTokenModel::new(128)).unwrap();
    let prompts: Vec<Vec<TokenId>> = (0..5).map(|i| vec![10 * i + 1, 10 * i + 2]).collect();
    let params = vec![SamplingParams::greedy(2); 5];

    let results = engine.generate(prompts, params).unwrap();
    let ids: Vec<_> = results.iter().map(|r| r.request_id).collect();
    assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    for (i, result) in results.iter().enumerate() {
        let base = 10 * i as TokenId + 2;
        assert_eq!(
            result.outputs[0].generated_token_ids,
            vec![base + 1, base + 2]
        );
    }
}

#[test]
fn seeded_multinomial_is_reproducible() {
    let run = || {
        let mut engine = LlmEngine::new(config(64, 16), NextTokenModel::new(32)).unwrap();
        let mut params = SamplingParams::multinomial(6, 0.8);
        params.seed = Some(42);
        let handle = engine.add_request(0, vec![1, 2, 3], params).unwrap();
        while engine.has_unfinished_requests() {
            engine.step().unwrap();
        }
        handle.read_all()[0].generated_token_ids.clone()
    };
    assert_eq!(run(), run());
}

#[test]
fn oversized_request_fails_with_out_of_capacity() {
    // 3 blocks of demand against a 2-block pool can never be satisfied
    let mut engine = LlmEngine::new(config(64, 2), NextTokenModel::new(64)).unwrap();
    let prompt: Vec<TokenId> = (1..=40).collect();
    let handle = engine
        .add_request(0, prompt, SamplingParams::greedy(4))
        .unwrap();

    let results = engine.step().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, GenerationStatus::OutOfCapacity);
    assert_eq!(handle.status(), GenerationStatus::OutOfCapacity);
    assert!(!engine.has_unfinished_requests());
    assert_eq!(engine.stats().num_free_blocks, 2);
}

#[test]
fn chunked_prefill_matches_single_pass() {
    let prompt: Vec<TokenId> = (1..=40).collect();

    let mut chunked_cfg = config(16, 16);
    chunked_cfg.dynamic_split_fuse = true;
    let mut chunked = LlmEngine::new(chunked_cfg, NextTokenModel::new(64)).unwrap();
    let chunked_handle = chunked
        .add_request(0, prompt.clone(), SamplingParams::greedy(3))
        .unwrap();
    while chunked.has_unfinished_requests() {
        chunked.step().unwrap();
    }

    let mut whole = LlmEngine::new(config(64, 16), NextTokenModel::new(64)).unwrap();
    let whole_handle = whole
        .add_request(0, prompt, SamplingParams::greedy(3))
        .unwrap();
    while whole.has_unfinished_requests() {
        whole.step().unwrap();
    }

    assert_eq!(
        chunked_handle.read_all()[0].generated_token_ids,
        whole_handle.read_all()[0].generated_token_ids
    );
}

/// Toy tokenizer for the text-input path: whitespace-separated decimal
/// literals, one token each.
struct NumberTokenizer;

impl Tokenizer for NumberTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<TokenId>, TokenizerError> {
        text.split_whitespace()
            .map(|w| {
                w.parse::<TokenId>()
                    .map_err(|e| TokenizerError(e.to_string()))
            })
            .collect()
    }

    fn decode(&self, token_ids: &[TokenId]) -> Result<String, TokenizerError> {
        Ok(token_ids
            .iter()
            .map(|t| t.to_string())
            .collect::<Vec<_>>()
            .join(" "))
    }

    fn eos_token_id(&self) -> TokenId {
        0
    }
}

#[test]
fn text_input_goes_through_the_tokenizer() {
    let mut engine = LlmEngine::new(config(64, 16), NextTokenModel::new(32))
        .unwrap()
        .with_tokenizer(Box::new(NumberTokenizer));
    let handle = engine
        .add_request(0, "1 2 3", SamplingParams::greedy(2))
        .unwrap();
    while engine.has_unfinished_requests() {
        engine.step().unwrap();
    }
    assert_eq!(handle.read_all()[0].generated_token_ids, vec![4, 5]);

    let err = engine
        .add_request(1, "not numbers", SamplingParams::greedy(2))
        .unwrap_err();
    assert!(err.to_string().contains("invalid request"));
}
