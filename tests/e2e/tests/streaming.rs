//! Streaming tests: partial results, terminal events and fallbacks

use futures::StreamExt;
use reverie_core::{
    AnalysisEvent, AnalysisParameters, AnalysisStream, CacheHitClass, EngineError,
    InferenceError, PartialInsights, StreamingOutcome,
};
use reverie_e2e_tests::harness::{TestEngine, TestEngineBuilder};
use reverie_e2e_tests::mocks::{ResponseBuilder, ScriptedInference, Step, TestDataFactory};

fn streaming_engine(inference: ScriptedInference) -> TestEngine {
    TestEngineBuilder::new()
        .records("u1", TestDataFactory::journal(8))
        .records("thin", TestDataFactory::sparse())
        .inference(inference)
        .build()
}

fn expect_stream(outcome: StreamingOutcome) -> AnalysisStream {
    match outcome {
        StreamingOutcome::Streaming(stream) => stream,
        StreamingOutcome::InsufficientData(data) => panic!("insufficient data: {}", data.message),
        StreamingOutcome::CapacityExceeded(busy) => panic!("busy: {}", busy.message),
    }
}

/// Split events into partials and the single terminal event
fn split(events: Vec<AnalysisEvent>) -> (Vec<PartialInsights>, AnalysisEvent) {
    let mut partials = Vec::new();
    let mut terminal = None;
    for event in events {
        assert!(terminal.is_none(), "event after the terminal event");
        match event {
            AnalysisEvent::Partial(p) => partials.push(p),
            other => terminal = Some(other),
        }
    }
    (partials, terminal.expect("stream ended without a terminal event"))
}

#[tokio::test]
async fn test_partials_refine_towards_final_result() {
    let t = streaming_engine(
        ScriptedInference::replying(ResponseBuilder::standard().build()).streaming(24),
    );

    let stream = expect_stream(
        t.engine
            .request_analysis_streaming("u1", &AnalysisParameters::default())
            .await
            .unwrap(),
    );
    let (partials, terminal) = split(stream.collect().await);

    assert!(!partials.is_empty());
    for pair in partials.windows(2) {
        let (before, after) = (&pair[0], &pair[1]);
        assert!(after.connections.len() >= before.connections.len());
        assert!(after.meta_patterns.len() >= before.meta_patterns.len());
        assert!(after.recommendations.len() >= before.recommendations.len());
        assert!(after.summary.is_some() || before.summary.is_none());
        // Earlier items never change once emitted
        assert_eq!(
            &after.connections[..before.connections.len()],
            &before.connections[..]
        );
    }
    assert!(partials.iter().all(|p| p.chunk_count == 1));

    match terminal {
        AnalysisEvent::Final(result) => {
            assert_eq!(result.connections.len(), 2);
            assert_eq!(result.meta_patterns.len(), 1);
            assert_eq!(result.metadata.cache_hit, CacheHitClass::Miss);
            let last = partials.last().unwrap();
            assert!(last.connections.len() <= result.connections.len());
        }
        other => panic!("expected final result, got {:?}", other),
    }
    assert_eq!(t.inference.calls(), 1);
}

#[tokio::test]
async fn test_service_without_streaming_yields_only_final() {
    let t = streaming_engine(ScriptedInference::replying(
        ResponseBuilder::standard().build(),
    ));

    let stream = expect_stream(
        t.engine
            .request_analysis_streaming("u1", &AnalysisParameters::default())
            .await
            .unwrap(),
    );
    let (partials, terminal) = split(stream.collect().await);
    assert!(partials.is_empty());
    assert!(matches!(terminal, AnalysisEvent::Final(_)));
}

#[tokio::test]
async fn test_cached_result_streams_immediately() {
    let t = streaming_engine(
        ScriptedInference::replying(ResponseBuilder::standard().build()).streaming(16),
    );
    let params = AnalysisParameters::default();

    t.engine.request_analysis("u1", &params).await.unwrap();

    let stream = expect_stream(
        t.engine
            .request_analysis_streaming("u1", &params)
            .await
            .unwrap(),
    );
    let (partials, terminal) = split(stream.collect().await);
    assert!(partials.is_empty());
    match terminal {
        AnalysisEvent::Final(result) => {
            assert_eq!(result.metadata.cache_hit, CacheHitClass::ResultHit);
        }
        other => panic!("expected cached final, got {:?}", other),
    }
    assert_eq!(t.inference.calls(), 1);
}

#[tokio::test]
async fn test_streamed_result_is_cached_for_later_requests() {
    let t = streaming_engine(
        ScriptedInference::replying(ResponseBuilder::standard().build()).streaming(32),
    );
    let params = AnalysisParameters::default();

    let streamed = expect_stream(
        t.engine
            .request_analysis_streaming("u1", &params)
            .await
            .unwrap(),
    )
    .into_final()
    .await
    .unwrap();

    let again = t
        .engine
        .request_analysis("u1", &params)
        .await
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(again.metadata.cache_hit, CacheHitClass::ResultHit);
    assert_eq!(again.connections, streamed.connections);
    assert_eq!(t.inference.calls(), 1);
}

#[tokio::test]
async fn test_thin_history_is_reported_before_streaming() {
    let t = streaming_engine(
        ScriptedInference::replying(ResponseBuilder::standard().build()).streaming(16),
    );

    let outcome = t
        .engine
        .request_analysis_streaming("thin", &AnalysisParameters::default())
        .await
        .unwrap();
    assert!(matches!(outcome, StreamingOutcome::InsufficientData(_)));
    assert_eq!(t.inference.calls(), 0);
}

#[tokio::test]
async fn test_hard_error_ends_stream_with_failure() {
    let t = streaming_engine(
        ScriptedInference::new([Step::Fail(InferenceError::Rejected {
            status: 400,
            message: "context length exceeded".into(),
        })])
        .streaming(16),
    );

    let stream = expect_stream(
        t.engine
            .request_analysis_streaming("u1", &AnalysisParameters::default())
            .await
            .unwrap(),
    );
    let (partials, terminal) = split(stream.collect().await);
    assert!(partials.is_empty());
    match terminal {
        AnalysisEvent::Failed(EngineError::UpstreamUnavailable { message }) => {
            assert!(message.contains("400"));
        }
        other => panic!("expected upstream failure, got {:?}", other),
    }
    assert_eq!(t.inference.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stream_recovers_after_timeout() {
    let t = streaming_engine(
        ScriptedInference::new([
            Step::Hang,
            Step::Reply(ResponseBuilder::standard().build()),
        ])
        .streaming(20),
    );

    let result = expect_stream(
        t.engine
            .request_analysis_streaming("u1", &AnalysisParameters::default())
            .await
            .unwrap(),
    )
    .into_final()
    .await
    .unwrap();

    assert_eq!(result.metadata.retry_count, 1);
    assert_eq!(result.metadata.cache_hit, CacheHitClass::Miss);
    assert_eq!(result.connections.len(), 2);
    assert_eq!(t.inference.calls(), 2);

    // Retries belong to the computation, not to later cache hits
    let cached = t
        .engine
        .request_analysis("u1", &AnalysisParameters::default())
        .await
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(cached.metadata.cache_hit, CacheHitClass::ResultHit);
    assert_eq!(cached.metadata.retry_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_non_streaming_service_reports_retries_in_final() {
    let t = streaming_engine(ScriptedInference::new([
        Step::Hang,
        Step::Fail(InferenceError::Transport("connection reset".into())),
        Step::Reply(ResponseBuilder::standard().build()),
    ]));

    let stream = expect_stream(
        t.engine
            .request_analysis_streaming("u1", &AnalysisParameters::default())
            .await
            .unwrap(),
    );
    let (partials, terminal) = split(stream.collect().await);
    assert!(partials.is_empty());
    match terminal {
        AnalysisEvent::Final(result) => {
            assert_eq!(result.metadata.retry_count, 2);
            assert!(!result.metadata.degraded);
            assert_eq!(result.metadata.model, "scripted-model");
        }
        other => panic!("expected final result, got {:?}", other),
    }
    assert_eq!(t.inference.calls(), 3);
}

#[tokio::test]
async fn test_streaming_respects_admission_limits() {
    let t = TestEngineBuilder::new()
        .config(|c| {
            c.concurrency.max_in_flight = 1;
            c.concurrency.max_queue = 0;
        })
        .records("u1", TestDataFactory::journal(8))
        .inference(
            ScriptedInference::replying(ResponseBuilder::standard().build())
                .streaming(16)
                .gated(),
        )
        .build();
    let params = AnalysisParameters::default();

    let first = expect_stream(
        t.engine
            .request_analysis_streaming("u1", &params)
            .await
            .unwrap(),
    );
    t.inference.wait_for_calls(1).await;

    // Streaming requests are never merged, so the same user is turned away
    let second = t
        .engine
        .request_analysis_streaming("u1", &params)
        .await
        .unwrap();
    assert!(matches!(second, StreamingOutcome::CapacityExceeded(_)));

    t.inference.release(1);
    let result = first.into_final().await.unwrap();
    assert_eq!(result.connections.len(), 2);
}
