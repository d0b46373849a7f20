//! Journey tests: complete analysis requests from history to result

use reverie_core::{
    AnalysisOutcome, AnalysisParameters, AnalysisResult, CacheHitClass, ConnectionCategory,
    EngineError, InferenceError, ResponseFormat,
};
use reverie_e2e_tests::harness::{TestDatabaseManager, TestEngineBuilder};
use reverie_e2e_tests::mocks::{ResponseBuilder, ScriptedInference, Step, TestDataFactory};

fn completed(outcome: AnalysisOutcome) -> AnalysisResult {
    match outcome {
        AnalysisOutcome::Completed(result) => result,
        other => panic!("expected a completed analysis, got {:?}", other),
    }
}

// ============================================================================
// HAPPY PATH
// ============================================================================

#[tokio::test]
async fn test_imported_history_is_analysed_then_served_from_cache() {
    let db = TestDatabaseManager::new_temp();
    assert_eq!(db.seed("u1", &TestDataFactory::journal(8)), 8);

    let t = TestEngineBuilder::new()
        .history(db.store.clone())
        .inference(ScriptedInference::replying(
            ResponseBuilder::standard().chatty().build(),
        ))
        .build();
    let params = AnalysisParameters::default();

    let first = completed(t.engine.request_analysis("u1", &params).await.unwrap());
    assert_eq!(first.connections.len(), 2);
    assert_eq!(first.meta_patterns.len(), 1);
    assert_eq!(
        first.summary,
        "Your routines outside work shape how your workdays go."
    );
    assert_eq!(first.connections[0].entry_ids, vec!["j2", "j6"]);
    assert_eq!(first.connections[0].category, ConnectionCategory::Behavioral);
    assert_eq!(first.recommendations.len(), 1);
    assert_eq!(first.metadata.cache_hit, CacheHitClass::Miss);
    assert_eq!(first.metadata.retry_count, 0);
    assert_eq!(first.metadata.model, "scripted-model");
    assert_eq!(first.metadata.entry_count, 8);
    assert!(!first.metadata.degraded);
    assert_eq!(t.inference.calls(), 1);

    let second = completed(t.engine.request_analysis("u1", &params).await.unwrap());
    assert_eq!(second.metadata.cache_hit, CacheHitClass::ResultHit);
    assert_eq!(second.connections, first.connections);
    assert_eq!(second.summary, first.summary);
    assert_eq!(t.inference.calls(), 1);

    // The metadata hook landed in the run log
    db.wait_for_runs("u1", 1).await;
    let runs = db.reopen().recent_runs(Some("u1"), 10).unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].metadata.model, "scripted-model");
    assert_eq!(runs[0].metadata.cache_hit, CacheHitClass::Miss);

    t.engine.shutdown().await;
}

#[tokio::test]
async fn test_new_history_triggers_fresh_analysis() {
    let db = TestDatabaseManager::new_temp();
    db.seed("u1", &TestDataFactory::journal(6));

    let t = TestEngineBuilder::new()
        .history(db.store.clone())
        .inference(ScriptedInference::replying(ResponseBuilder::standard().build()))
        .build();
    let params = AnalysisParameters::default();

    completed(t.engine.request_analysis("u1", &params).await.unwrap());
    assert_eq!(t.inference.calls(), 1);

    // Re-importing the same records changes nothing
    assert_eq!(db.seed("u1", &TestDataFactory::journal(6)), 0);
    let cached = completed(t.engine.request_analysis("u1", &params).await.unwrap());
    assert_eq!(cached.metadata.cache_hit, CacheHitClass::ResultHit);

    // Two more days of history make a different payload
    assert_eq!(db.seed("u1", &TestDataFactory::journal(8)), 2);
    let fresh = completed(t.engine.request_analysis("u1", &params).await.unwrap());
    assert_eq!(fresh.metadata.cache_hit, CacheHitClass::Miss);
    assert_eq!(fresh.metadata.entry_count, 8);
    assert_eq!(t.inference.calls(), 2);
}

#[tokio::test]
async fn test_users_do_not_share_results() {
    let t = TestEngineBuilder::new()
        .records("u1", TestDataFactory::journal(8))
        .records("u2", TestDataFactory::journal(7))
        .inference(ScriptedInference::replying(ResponseBuilder::standard().build()))
        .build();
    let params = AnalysisParameters::default();

    let a = completed(t.engine.request_analysis("u1", &params).await.unwrap());
    let b = completed(t.engine.request_analysis("u2", &params).await.unwrap());
    assert_eq!(a.metadata.cache_hit, CacheHitClass::Miss);
    assert_eq!(b.metadata.cache_hit, CacheHitClass::Miss);
    assert_ne!(a.metadata.payload_digest, b.metadata.payload_digest);
    assert_eq!(t.inference.calls(), 2);
}

// ============================================================================
// PARAMETERS
// ============================================================================

#[tokio::test]
async fn test_force_refresh_skips_result_cache_only() {
    let t = TestEngineBuilder::new()
        .records("u1", TestDataFactory::journal(8))
        .inference(ScriptedInference::replying(ResponseBuilder::standard().build()))
        .build();

    completed(
        t.engine
            .request_analysis("u1", &AnalysisParameters::default())
            .await
            .unwrap(),
    );

    let refresh = AnalysisParameters {
        force_refresh: true,
        ..AnalysisParameters::default()
    };
    let refreshed = completed(t.engine.request_analysis("u1", &refresh).await.unwrap());
    assert_eq!(refreshed.metadata.cache_hit, CacheHitClass::ResponseHit);
    assert_eq!(t.inference.calls(), 1);
}

#[tokio::test]
async fn test_format_and_focus_reach_the_prompt() {
    let t = TestEngineBuilder::new()
        .records("u1", TestDataFactory::journal(8))
        .inference(ScriptedInference::replying(ResponseBuilder::standard().build()))
        .build();

    completed(
        t.engine
            .request_analysis("u1", &AnalysisParameters::default())
            .await
            .unwrap(),
    );
    let concise = AnalysisParameters {
        response_format: ResponseFormat::Concise,
        focus: Some("sleep".to_string()),
        ..AnalysisParameters::default()
    };
    let result = completed(t.engine.request_analysis("u1", &concise).await.unwrap());

    // Different parameters are a different result and a different prompt
    assert_eq!(result.metadata.cache_hit, CacheHitClass::Miss);
    assert_eq!(t.inference.calls(), 2);
    let prompts = t.inference.prompts();
    assert_ne!(prompts[0], prompts[1]);
    assert!(prompts[1].contains("sleep"));
    assert!(prompts.iter().all(|p| p.contains("j1") && p.contains("j8")));
}

// ============================================================================
// MODEL OUTPUT
// ============================================================================

#[tokio::test]
async fn test_untrusted_output_is_repaired() {
    let response = ResponseBuilder::new("Mixed signals.")
        .connection(&["j1", "j3", "ghost"], "Coffee and sleep", 1.4, -0.2, "causal")
        .connection(&["j2", "ghost"], "Only one real entry", 0.5, 0.5, "behavioral")
        .connection(&["j4", "j7"], "Evening habits", 0.5, 0.6, "not-a-category")
        .pattern("Late caffeine hurts", 0.9, &["j1", "j8", "nope"])
        .build();

    let t = TestEngineBuilder::new()
        .records("u1", TestDataFactory::journal(8))
        .inference(ScriptedInference::replying(response))
        .build();

    let result = completed(
        t.engine
            .request_analysis("u1", &AnalysisParameters::default())
            .await
            .unwrap(),
    );

    assert_eq!(result.connections.len(), 2);
    let first = &result.connections[0];
    assert_eq!(first.entry_ids, vec!["j1", "j3"]);
    assert_eq!(first.surprise, 1.0);
    assert_eq!(first.relevance, 0.0);
    // Unknown category labels fall back to `other`
    assert_eq!(result.connections[1].category, ConnectionCategory::Other);
    assert_eq!(
        result.meta_patterns[0].supporting_entry_ids,
        vec!["j1", "j8"]
    );
    assert!(!result.is_degraded());
}

#[tokio::test(start_paused = true)]
async fn test_two_timeouts_then_success() {
    let t = TestEngineBuilder::new()
        .records("u1", TestDataFactory::journal(8))
        .inference(ScriptedInference::new([
            Step::Hang,
            Step::Hang,
            Step::Reply(ResponseBuilder::standard().build()),
        ]))
        .build();

    let result = completed(
        t.engine
            .request_analysis("u1", &AnalysisParameters::default())
            .await
            .unwrap(),
    );
    assert_eq!(result.metadata.retry_count, 2);
    assert_eq!(result.connections.len(), 2);
    assert_eq!(t.inference.calls(), 3);
    assert_eq!(t.metrics.snapshot().retries, 2);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_output_degrades_and_is_not_cached() {
    let t = TestEngineBuilder::new()
        .records("u1", TestDataFactory::journal(8))
        .inference(ScriptedInference::replying(
            "I found many interesting things but cannot format them.",
        ))
        .build();
    let params = AnalysisParameters::default();

    let result = completed(t.engine.request_analysis("u1", &params).await.unwrap());
    assert!(result.is_degraded());
    assert!(result.metadata.degraded);
    assert!(result.connections.is_empty());
    assert!(!result.summary.is_empty());
    // First attempt plus two retries
    assert_eq!(t.inference.calls(), 3);

    // A reduced result is never served from cache
    let again = completed(t.engine.request_analysis("u1", &params).await.unwrap());
    assert_eq!(again.metadata.cache_hit, CacheHitClass::Miss);
    assert_eq!(t.inference.calls(), 6);
    assert_eq!(t.metrics.snapshot().degraded_chunks, 2);
}

#[tokio::test]
async fn test_oversized_history_is_chunked_and_merged() {
    let t = TestEngineBuilder::new()
        .config(|c| c.validator.chunk_budget_chars = 250)
        .records("u1", TestDataFactory::journal(8))
        .inference(ScriptedInference::replying(
            ResponseBuilder::new("Part summary.")
                .pattern("Movement precedes calm", 0.7, &["j2", "j4"])
                .build(),
        ))
        .build();

    let result = completed(
        t.engine
            .request_analysis("u1", &AnalysisParameters::default())
            .await
            .unwrap(),
    );
    let chunks = result.metadata.chunk_count;
    assert!(chunks > 1, "expected several chunks, got {}", chunks);
    assert_eq!(t.inference.calls(), chunks);
    // Identical patterns from every chunk collapse into one
    assert!(result.meta_patterns.len() <= 1);
}

// ============================================================================
// FAILURES
// ============================================================================

#[tokio::test]
async fn test_insufficient_history_makes_no_call() {
    let t = TestEngineBuilder::new()
        .records("u1", TestDataFactory::sparse())
        .inference(ScriptedInference::replying(ResponseBuilder::standard().build()))
        .build();

    match t
        .engine
        .request_analysis("u1", &AnalysisParameters::default())
        .await
        .unwrap()
    {
        AnalysisOutcome::InsufficientData(data) => {
            assert_eq!(data.record_count, 1);
            assert!(data.required_records > data.record_count);
            assert!(!data.message.is_empty());
        }
        other => panic!("expected insufficient data, got {:?}", other),
    }
    assert_eq!(t.inference.calls(), 0);
    assert_eq!(t.metrics.snapshot().insufficient, 1);
}

#[tokio::test]
async fn test_unauthorized_service_is_a_hard_error() {
    let t = TestEngineBuilder::new()
        .records("u1", TestDataFactory::journal(8))
        .inference(ScriptedInference::new([Step::Fail(
            InferenceError::Unauthorized("bad key".into()),
        )]))
        .build();

    let err = t
        .engine
        .request_analysis("u1", &AnalysisParameters::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::UpstreamUnavailable { .. }));
    assert!(!err.user_message().contains("bad key"));
    assert_eq!(t.inference.calls(), 1);
    assert_eq!(t.metrics.snapshot().failed, 1);
}

#[tokio::test]
async fn test_history_outage_is_reported() {
    let t = TestEngineBuilder::new()
        .records("u1", TestDataFactory::journal(8))
        .inference(ScriptedInference::replying(ResponseBuilder::standard().build()))
        .build();
    t.history.set_unavailable(true);

    let err = t
        .engine
        .request_analysis("u1", &AnalysisParameters::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::DataUnavailable { .. }));
    assert_eq!(t.inference.calls(), 0);

    t.history.set_unavailable(false);
    completed(
        t.engine
            .request_analysis("u1", &AnalysisParameters::default())
            .await
            .unwrap(),
    );
}

#[tokio::test]
async fn test_in_memory_hook_records_each_computation() {
    let t = TestEngineBuilder::new()
        .records("u1", TestDataFactory::journal(8))
        .inference(ScriptedInference::replying(ResponseBuilder::standard().build()))
        .build();
    let params = AnalysisParameters::default();

    completed(t.engine.request_analysis("u1", &params).await.unwrap());
    completed(t.engine.request_analysis("u1", &params).await.unwrap());

    // The hook runs detached from the request
    for _ in 0..100 {
        if !t.history.recorded_analyses().is_empty() {
            break;
        }
        tokio::task::yield_now().await;
    }
    let recorded = t.history.recorded_analyses();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].0, "u1");
    assert_eq!(recorded[0].1.cache_hit, CacheHitClass::Miss);
}
