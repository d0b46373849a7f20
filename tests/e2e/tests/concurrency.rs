//! Concurrency tests: deduplication, admission control and shutdown

use futures::future::join_all;
use reverie_core::{
    AnalysisOutcome, AnalysisParameters, CacheHitClass, EngineError, StreamingOutcome,
};
use reverie_e2e_tests::harness::{TestEngine, TestEngineBuilder};
use reverie_e2e_tests::mocks::{ResponseBuilder, ScriptedInference, TestDataFactory};

/// Two users, a gated service and the given limits
fn gated_engine(max_in_flight: usize, max_queue: usize) -> TestEngine {
    TestEngineBuilder::new()
        .config(|c| {
            c.concurrency.max_in_flight = max_in_flight;
            c.concurrency.max_queue = max_queue;
            c.concurrency.retry_after_secs = 7;
        })
        .records("u1", TestDataFactory::journal(8))
        .records("u2", TestDataFactory::journal(7))
        .records("u3", TestDataFactory::journal(6))
        .inference(ScriptedInference::replying(ResponseBuilder::standard().build()).gated())
        .build()
}

fn is_completed(outcome: &AnalysisOutcome) -> bool {
    matches!(outcome, AnalysisOutcome::Completed(_))
}

#[tokio::test]
async fn test_identical_requests_share_one_computation() {
    let t = gated_engine(1, 0);
    let params = AnalysisParameters::default();

    let requests = (0..10).map(|_| t.engine.request_analysis("u1", &params));
    let (outcomes, _) = tokio::join!(join_all(requests), async {
        t.inference.wait_for_calls(1).await;
        t.inference.release(1);
    });

    // Followers never count against capacity
    assert_eq!(outcomes.len(), 10);
    for outcome in &outcomes {
        let result = outcome.as_ref().unwrap().result().unwrap();
        assert_eq!(result.metadata.cache_hit, CacheHitClass::Miss);
        assert_eq!(result.connections.len(), 2);
    }
    assert_eq!(t.inference.calls(), 1);

    let stats = t.engine.stats().controller;
    assert_eq!(stats.computations_started, 1);
    assert_eq!(stats.followers_attached, 9);
    assert_eq!(stats.rejected, 0);
}

#[tokio::test]
async fn test_overflow_is_rejected_immediately() {
    let t = gated_engine(1, 0);
    let params = AnalysisParameters::default();

    let (first, second) = tokio::join!(t.engine.request_analysis("u1", &params), async {
        t.inference.wait_for_calls(1).await;
        let rejected = t.engine.request_analysis("u2", &params).await;
        t.inference.release(1);
        rejected
    });

    assert!(is_completed(&first.unwrap()));
    match second.unwrap() {
        AnalysisOutcome::CapacityExceeded(busy) => {
            assert_eq!(busy.retry_after_secs, 7);
            assert_eq!(busy.in_flight, 1);
            assert_eq!(busy.queued, 0);
        }
        other => panic!("expected capacity exceeded, got {:?}", other),
    }
    assert_eq!(t.metrics.snapshot().rejected, 1);

    // Capacity is back once the first computation finished
    t.inference.release(1);
    let retried = t.engine.request_analysis("u2", &params).await.unwrap();
    assert!(is_completed(&retried));
    assert_eq!(t.inference.calls(), 2);
}

#[tokio::test]
async fn test_queue_admits_up_to_its_bound() {
    let t = gated_engine(1, 1);
    let params = AnalysisParameters::default();

    let (a, b, c) = tokio::join!(
        t.engine.request_analysis("u1", &params),
        t.engine.request_analysis("u2", &params),
        async {
            t.inference.wait_for_calls(1).await;
            let stats = t.engine.stats().controller;
            assert_eq!(stats.in_flight, 1);
            assert_eq!(stats.queued, 1);
            let rejected = t.engine.request_analysis("u3", &params).await;
            t.inference.release(2);
            rejected
        }
    );

    assert!(is_completed(&a.unwrap()));
    assert!(is_completed(&b.unwrap()));
    assert!(matches!(c.unwrap(), AnalysisOutcome::CapacityExceeded(_)));
    assert_eq!(t.inference.calls(), 2);
    assert_eq!(t.metrics.snapshot().max_queue_depth, 1);
}

#[tokio::test]
async fn test_shutdown_finishes_running_work_then_refuses() {
    let t = gated_engine(2, 2);
    let params = AnalysisParameters::default();

    let (running, _) = tokio::join!(t.engine.request_analysis("u1", &params), async {
        t.inference.wait_for_calls(1).await;
        tokio::join!(t.engine.shutdown(), async { t.inference.release(1) });
    });
    assert!(is_completed(&running.unwrap()));

    let err = t.engine.request_analysis("u2", &params).await.unwrap_err();
    assert!(matches!(err, EngineError::ShuttingDown));

    match t.engine.request_analysis_streaming("u2", &params).await {
        Err(EngineError::ShuttingDown) => {}
        Err(other) => panic!("expected shutting down, got {:?}", other),
        Ok(StreamingOutcome::Streaming(_)) => panic!("stream opened after shutdown"),
        Ok(_) => panic!("unexpected outcome after shutdown"),
    }
}
