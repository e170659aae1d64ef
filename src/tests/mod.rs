use std::{path::Path, sync::Arc, time::Duration};

use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::info;

use crate::{
    config::{CacheConfig, ExecutorConfig, SchedulerConfig, SchedulerPolicy},
    coordination::LocalCoordinator,
    engine::DeltaPayload,
    executor::{ExecutorError, GenerationExecutor},
    model_executor::{
        EngineLoader, EngineLoaderError, ExecuteStepRequest, StepModel, StepModelError,
    },
    sequence::{FinishReason, SequenceMetadata, StepOutput},
    types::{GenerateParameters, GenerateRequest, Prompt},
};

const BLOCK_SIZE: usize = 4;
const MAX_NUM_SEQUENCES: usize = 8;
const STEP_POLL_PERIOD: Duration = Duration::from_millis(5);

/// Deterministic stand-in for the compiled artifact: the token generated for
/// position `p` of request `r` is `(r % 1000) * 1000 + p`, so tests can
/// predict every output exactly.
struct MockModel {
    fail: bool,
}

fn mock_token(metadata: &SequenceMetadata) -> u32 {
    let position_generated = metadata.position + metadata.input_token_ids.len();
    (metadata.request_id % 1000) as u32 * 1000 + position_generated as u32
}

impl EngineLoader for MockModel {
    fn load(engine_dir: &Path, _max_beam_width: usize) -> Result<Self, EngineLoaderError> {
        Ok(Self {
            fail: engine_dir.ends_with("fail"),
        })
    }
}

impl StepModel for MockModel {
    fn execute_step(
        &mut self,
        request: &ExecuteStepRequest,
    ) -> Result<Vec<StepOutput>, StepModelError> {
        if self.fail {
            return Err(StepModelError::ExecutionFailed(
                "mock artifact failure".into(),
            ));
        }
        Ok(request
            .sequences
            .iter()
            .map(|metadata| StepOutput {
                request_id: metadata.request_id,
                token_ids: vec![mock_token(metadata)],
                finished: false,
            })
            .collect())
    }
}

fn start_executor(
    engine_dir: &str,
    num_blocks: usize,
    policy: SchedulerPolicy,
) -> GenerationExecutor {
    let config = ExecutorConfig::new(engine_dir, 1, Some(STEP_POLL_PERIOD))
        .expect("Failed to generate `ExecutorConfig`");
    let cache_config =
        CacheConfig::new(BLOCK_SIZE, num_blocks).expect("Failed to generate `CacheConfig`");
    let scheduler_config = SchedulerConfig::new(MAX_NUM_SEQUENCES, policy)
        .expect("Failed to generate `SchedulerConfig`");
    GenerationExecutor::start::<MockModel, LocalCoordinator>(
        config,
        cache_config,
        scheduler_config,
        None,
        LocalCoordinator,
    )
    .expect("Failed to start executor")
}

fn request(
    prompt_len: usize,
    max_new_tokens: usize,
    end_id: Option<u32>,
    streaming: bool,
) -> GenerateRequest {
    GenerateRequest {
        prompt: Prompt::Tokens((0..prompt_len as u32).collect()),
        parameters: GenerateParameters {
            max_new_tokens: Some(max_new_tokens),
            end_id,
            ..Default::default()
        },
        streaming,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_streaming_generation_delivers_per_step() {
    init_tracing();
    let executor = start_executor("mock-artifacts/engine", 16, SchedulerPolicy::MaxUtilization);
    let mut handle = executor
        .submit(request(4, 3, None, true))
        .expect("Failed to submit request");

    let mut deltas = Vec::new();
    while !handle.is_done() {
        deltas.push(handle.await_step().await.expect("Failed to receive delta"));
    }

    // One delta per step, one token each; only the last is final.
    assert_eq!(deltas.len(), 3);
    for (idx, delta) in deltas.iter().enumerate() {
        assert!(matches!(&delta.payload, DeltaPayload::Tokens(t) if t.len() == 1));
        assert_eq!(delta.is_final, idx == 2);
    }
    assert_eq!(handle.token_ids(), &[1004, 1005, 1006]);
    assert_eq!(handle.finish_reason(), Some(FinishReason::LengthCapped));

    executor.shutdown().await.expect("Failed to shut down");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_non_streaming_single_final_delivery() {
    init_tracing();
    let executor = start_executor("mock-artifacts/engine", 16, SchedulerPolicy::MaxUtilization);

    let result = executor
        .generate_async(request(4, 3, None, false))
        .await
        .expect("Failed to generate");
    assert_eq!(result.request_id, 1);
    assert_eq!(result.token_ids, vec![1004, 1005, 1006]);
    assert_eq!(result.finish_reason, FinishReason::LengthCapped);

    // The first request's blocks went back to the pool; a second request
    // runs through the same capacity.
    let result = executor
        .generate_async(request(4, 2, None, false))
        .await
        .expect("Failed to generate");
    assert_eq!(result.request_id, 2);
    assert_eq!(result.token_ids, vec![2004, 2005]);

    executor.shutdown().await.expect("Failed to shut down");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_end_token_stops_generation() {
    init_tracing();
    let executor = start_executor("mock-artifacts/engine", 16, SchedulerPolicy::MaxUtilization);

    // The mock produces 1005 as request 1's second token.
    let result = executor
        .generate_async(request(4, 8, Some(1005), false))
        .await
        .expect("Failed to generate");
    assert_eq!(result.token_ids, vec![1004, 1005]);
    assert_eq!(result.finish_reason, FinishReason::Stopped);

    executor.shutdown().await.expect("Failed to shut down");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancellation_releases_capacity() {
    init_tracing();
    let executor = start_executor("mock-artifacts/engine", 64, SchedulerPolicy::MaxUtilization);
    let mut handle = executor
        .submit(request(4, 1_000_000, None, true))
        .expect("Failed to submit request");

    // Generation is underway.
    for _ in 0..3 {
        handle.await_step().await.expect("Failed to receive delta");
    }
    executor
        .cancel(handle.request_id())
        .expect("Failed to cancel");

    // Deltas buffered before the cancellation took effect drain first, then
    // the synthesized final one arrives.
    while !handle.is_done() {
        handle.await_step().await.expect("Failed to receive delta");
    }
    assert_eq!(handle.finish_reason(), Some(FinishReason::Cancelled));
    info!("cancelled after {} tokens", handle.token_ids().len());

    // The cancelled request's blocks are reusable.
    let result = executor
        .generate_async(request(4, 2, None, false))
        .await
        .expect("Failed to generate");
    assert_eq!(result.token_ids.len(), 2);

    executor.shutdown().await.expect("Failed to shut down");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_step_failure_fails_batched_requests() {
    init_tracing();
    let executor = start_executor("mock-artifacts/fail", 16, SchedulerPolicy::MaxUtilization);

    let result = executor.generate_async(request(4, 3, None, false)).await;
    match result {
        Err(ExecutorError::GenerationFailed {
            request_id,
            message,
        }) => {
            assert_eq!(request_id, 1);
            assert!(message.contains("mock artifact failure"));
        }
        other => panic!("expected a generation failure, got {other:?}"),
    }

    executor.shutdown().await.expect("Failed to shut down");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_wait_first_completed_reports_finish_order() {
    init_tracing();
    let executor = start_executor("mock-artifacts/engine", 16, SchedulerPolicy::MaxUtilization);

    let handles = executor
        .submit_batch(vec![request(4, 2, None, false), request(4, 5, None, false)])
        .expect("Failed to submit batch");

    // The shorter generation finishes first; waiting again on the same set
    // moves on to the next completion rather than repeating the first.
    assert_eq!(
        executor
            .await_first_completed(&handles)
            .await
            .expect("Failed to await completion"),
        handles[0].request_id()
    );
    assert_eq!(
        executor
            .await_first_completed(&handles)
            .await
            .expect("Failed to await completion"),
        handles[1].request_id()
    );

    for (mut handle, expected_len) in handles.into_iter().zip([2usize, 5]) {
        let result = handle.aresult().await.expect("Failed to generate");
        assert_eq!(result.token_ids.len(), expected_len);
    }

    executor.shutdown().await.expect("Failed to shut down");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_wait_first_completed_respects_wait_set() {
    init_tracing();
    let executor = start_executor("mock-artifacts/engine", 16, SchedulerPolicy::MaxUtilization);

    let short = executor
        .submit(request(4, 1, None, false))
        .expect("Failed to submit request");
    let long = executor
        .submit(request(4, 6, None, false))
        .expect("Failed to submit request");

    // The short request finishes well before the long one; a waiter
    // restricted to the long request must not be handed its completion.
    let first = executor
        .await_first_completed(std::slice::from_ref(&long))
        .await
        .expect("Failed to await completion");
    assert_eq!(first, long.request_id());

    // The short request's completion was held, not swallowed.
    let second = executor
        .await_first_completed(std::slice::from_ref(&short))
        .await
        .expect("Failed to await completion");
    assert_eq!(second, short.request_id());

    executor.shutdown().await.expect("Failed to shut down");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_flag_set_before_request_is_visible() {
    init_tracing();
    let executor = start_executor("mock-artifacts/engine", 64, SchedulerPolicy::MaxUtilization);

    // Flag the id the next submission will receive, before the engine can
    // know anything about it. The flag must survive until the request
    // reaches the scheduler and then take effect at a step boundary.
    executor.cancel(1).expect("Failed to cancel");
    let mut handle = executor
        .submit(request(4, 1_000_000, None, true))
        .expect("Failed to submit request");
    assert_eq!(handle.request_id(), 1);

    while !handle.is_done() {
        handle.await_step().await.expect("Failed to receive delta");
    }
    assert_eq!(handle.finish_reason(), Some(FinishReason::Cancelled));

    executor.shutdown().await.expect("Failed to shut down");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unread_stats_collapse_to_latest() {
    init_tracing();
    let executor = start_executor("mock-artifacts/engine", 16, SchedulerPolicy::MaxUtilization);

    executor
        .generate_async(request(4, 2, None, false))
        .await
        .expect("Failed to generate");

    let first = executor.await_stats().await.expect("Failed to get stats");

    // Many idle steps pass with no reader; their snapshots must replace one
    // another rather than queue up, so a single read lands far ahead.
    tokio::time::sleep(STEP_POLL_PERIOD * 60).await;
    let second = executor.await_stats().await.expect("Failed to get stats");
    assert!(second.iteration > first.iteration + 5);

    // And there is no backlog behind it: the next read is newer still.
    let third = executor.await_stats().await.expect("Failed to get stats");
    assert!(third.iteration > second.iteration);

    executor.shutdown().await.expect("Failed to shut down");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_wait_timeout_is_distinct_error() {
    init_tracing();
    let executor = Arc::new(start_executor(
        "mock-artifacts/engine",
        64,
        SchedulerPolicy::MaxUtilization,
    ));

    let cloned = executor.clone();
    tokio::task::spawn_blocking(move || {
        // Non-streaming: nothing is delivered until the (distant) final
        // token, so a short wait must expire.
        let mut handle = cloned
            .submit(request(4, 1_000_000, None, false))
            .expect("Failed to submit request");
        assert!(matches!(
            handle.wait_step(Some(Duration::from_millis(50))),
            Err(ExecutorError::Timeout)
        ));
        assert!(matches!(
            cloned.wait_first_completed(
                std::slice::from_ref(&handle),
                Some(Duration::from_millis(50))
            ),
            Err(ExecutorError::Timeout)
        ));
    })
    .await
    .expect("Failed to join blocking task");

    executor.shutdown().await.expect("Failed to shut down");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stats_snapshots_are_latest_wins() {
    init_tracing();
    let executor = start_executor("mock-artifacts/engine", 16, SchedulerPolicy::MaxUtilization);

    executor
        .generate_async(request(4, 3, None, false))
        .await
        .expect("Failed to generate");

    // Idle steps keep publishing; an unconsumed snapshot is replaced, never
    // queued, so successive reads move strictly forward.
    let mut last_iteration = None;
    loop {
        let snapshot = executor.await_stats().await.expect("Failed to get stats");
        if let Some(last) = last_iteration {
            assert!(snapshot.iteration > last);
        }
        last_iteration = Some(snapshot.iteration);
        if snapshot.num_active == 0 && snapshot.num_pending == 0 {
            break;
        }
    }

    executor.shutdown().await.expect("Failed to shut down");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_fails_inflight_requests() {
    init_tracing();
    let executor = start_executor("mock-artifacts/engine", 64, SchedulerPolicy::MaxUtilization);
    let mut handle = executor
        .submit(request(4, 1_000_000, None, true))
        .expect("Failed to submit request");
    handle.await_step().await.expect("Failed to receive delta");

    executor.shutdown().await.expect("Failed to shut down");

    // The unfinished request got a final error payload rather than a
    // silently closed channel.
    let result = handle.aresult().await;
    assert!(matches!(
        result,
        Err(ExecutorError::GenerationFailed { request_id: 1, .. })
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_request_churn_under_guaranteed_no_evict() {
    init_tracing();
    let executor = Arc::new(start_executor(
        "mock-artifacts/engine",
        128,
        SchedulerPolicy::GuaranteedNoEvict,
    ));

    let mut rng = StdRng::seed_from_u64(42);
    let requests: Vec<GenerateRequest> = (0..32)
        .map(|_| {
            request(
                rng.gen_range(1..=12),
                rng.gen_range(1..=6),
                None,
                false,
            )
        })
        .collect();
    let expected_lens: Vec<usize> = requests
        .iter()
        .map(|r| r.parameters.max_new_tokens.unwrap_or_default())
        .collect();

    let handles = executor
        .submit_batch(requests)
        .expect("Failed to submit batch");
    for (mut handle, expected_len) in handles.into_iter().zip(expected_lens) {
        let result = handle.aresult().await.expect("Failed to generate");
        assert_eq!(result.token_ids.len(), expected_len);
        assert_eq!(result.finish_reason, FinishReason::LengthCapped);
    }

    executor.shutdown().await.expect("Failed to shut down");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_blocking_api_from_worker_thread() {
    init_tracing();
    let executor = Arc::new(start_executor(
        "mock-artifacts/engine",
        16,
        SchedulerPolicy::MaxUtilization,
    ));

    let cloned = executor.clone();
    let result = tokio::task::spawn_blocking(move || cloned.generate(request(4, 2, None, false)))
        .await
        .expect("Failed to join blocking task")
        .expect("Failed to generate");
    assert_eq!(result.token_ids, vec![1004, 1005]);

    executor.shutdown().await.expect("Failed to shut down");
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt::try_init();
}
