mod common;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use serde_json::json;
use tower::ServiceExt;

use common::*;

#[tokio::test]
async fn test_root_and_health_are_public() {
    let TestApp { app, .. } = test_app();

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["health"], "/health");

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["ollama_status"], "connected");
}

#[tokio::test]
async fn test_missing_api_key_is_rejected() {
    let TestApp { app, .. } = test_app();

    let response = app
        .oneshot(Request::builder().uri("/models").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(response.headers()[header::WWW_AUTHENTICATE], "ApiKey");
    let body = json_body(response).await;
    assert!(body["detail"].as_str().unwrap().starts_with("Missing API Key"));
}

#[tokio::test]
async fn test_wrong_api_key_is_rejected() {
    let TestApp { app, .. } = test_app();

    let request = Request::builder()
        .uri("/models")
        .header("x-api-key", "not-a-key")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(response).await["detail"], "Invalid API Key");
}

#[tokio::test]
async fn test_any_configured_key_is_accepted() {
    let TestApp { app, .. } = test_app();

    let request = Request::builder()
        .uri("/models")
        .header("x-api-key", "second-key")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["models"][0]["name"], "qwen2.5:7b");
}

#[tokio::test]
async fn test_repeated_generation_is_served_from_cache() {
    let TestApp { app, llm, .. } = test_app();
    let body = json!({"prompt": "Why is the sky blue?", "max_tokens": 32});

    let first = app
        .clone()
        .oneshot(post_json("/inference/generate", body.clone()))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    let first = json_body(first).await;

    let second = app
        .oneshot(post_json("/inference/generate", body))
        .await
        .unwrap();
    let second = json_body(second).await;

    assert_eq!(first, second);
    assert_eq!(first["response"], "answer #1");
    assert_eq!(FakeLlm::count(&llm.generate_calls), 1);
}

#[tokio::test]
async fn test_different_parameters_miss_the_cache() {
    let TestApp { app, llm, .. } = test_app();

    for temperature in [0.1, 0.9] {
        let response = app
            .clone()
            .oneshot(post_json(
                "/inference/generate",
                json!({"prompt": "hello", "temperature": temperature}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    assert_eq!(FakeLlm::count(&llm.generate_calls), 2);
}

#[tokio::test]
async fn test_streamed_generation_is_event_stream_and_never_cached() {
    let TestApp { app, llm, .. } = test_app();
    let body = json!({"prompt": "count to three", "stream": true});

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(post_json("/inference/generate", body.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");
        let text = String::from_utf8(body_bytes(response).await.to_vec()).unwrap();
        assert!(text.starts_with("data: "));
        assert!(text.ends_with("\n\n"));
    }
    assert_eq!(FakeLlm::count(&llm.stream_calls), 2);
    assert_eq!(FakeLlm::count(&llm.generate_calls), 0);
}

#[tokio::test]
async fn test_chat_is_cached() {
    let TestApp { app, llm, .. } = test_app();
    let body = json!({"messages": [{"role": "user", "content": "Capital of France?"}]});

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(post_json("/inference/chat", body.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["message"]["content"], "Paris");
    }
    assert_eq!(FakeLlm::count(&llm.chat_calls), 1);
}

#[tokio::test]
async fn test_invalid_temperature_is_bad_request() {
    let TestApp { app, llm, .. } = test_app();

    let response = app
        .oneshot(post_json(
            "/inference/generate",
            json!({"prompt": "hi", "temperature": 3.0}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(FakeLlm::count(&llm.generate_calls), 0);
}

#[tokio::test]
async fn test_embeddings_single_and_batch() {
    let TestApp { app, llm, .. } = test_app();

    let response = app
        .clone()
        .oneshot(post_json("/embeddings", json!({"input": ["alpha", "beta"]})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["model"], "nomic-embed-text");
    assert_eq!(body["embeddings"].as_array().unwrap().len(), 2);
    assert_eq!(body["embeddings"][0].as_array().unwrap().len(), DIMENSIONS);

    // "alpha" is now cached per text
    let response = app
        .oneshot(post_json("/embeddings", json!({"input": "alpha"})))
        .await
        .unwrap();
    assert_eq!(json_body(response).await["embeddings"].as_array().unwrap().len(), 1);
    assert_eq!(FakeLlm::count(&llm.embed_calls), 2);
}

async fn ingest(app: &axum::Router, collection: &str, content: &str, source: &str) {
    let response = app
        .clone()
        .oneshot(post_json(
            "/rag/ingest",
            json!({
                "content": content,
                "collection": collection,
                "metadata": {"source": source},
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["chunks_created"], 1);
}

#[tokio::test]
async fn test_ingest_then_search_ranks_relevant_chunk_first() {
    let TestApp { app, .. } = test_app();
    ingest(&app, "kb", "The sky is blue. On a clear day the sky looks bright blue.", "sky.txt").await;
    ingest(&app, "kb", "Rust is a systems programming language with strong types.", "rust.txt").await;
    ingest(&app, "kb", "Bread needs flour, water, salt and yeast.", "bread.txt").await;

    let response = app
        .oneshot(post_json(
            "/rag/search",
            json!({"query": "What color is the sky?", "collection": "kb", "top_k": 2}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["total_results"], 2);
    let top = &body["results"][0];
    assert!(top["content"].as_str().unwrap().contains("sky"));
    assert_eq!(top["metadata"]["source"], "sky.txt");
    assert_eq!(top["metadata"]["chunk_index"], 0);
    assert!(top["score"].as_f64().unwrap() >= body["results"][1]["score"].as_f64().unwrap());
}

#[tokio::test]
async fn test_rag_query_answers_with_sources() {
    let TestApp { app, llm, .. } = test_app();
    ingest(&app, "kb", "The sky is blue because of Rayleigh scattering.", "sky.txt").await;

    let response = app
        .oneshot(post_json(
            "/rag/query",
            json!({"query": "Why is the sky blue?", "collection": "kb"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["answer"], "answer #1");
    assert_eq!(body["collection"], "kb");
    assert_eq!(body["sources"].as_array().unwrap().len(), 1);
    assert_eq!(FakeLlm::count(&llm.generate_calls), 1);
}

#[tokio::test]
async fn test_rag_on_missing_collection_is_not_found() {
    let TestApp { app, llm, .. } = test_app();

    for path in ["/rag/query", "/rag/search"] {
        let response = app
            .clone()
            .oneshot(post_json(path, json!({"query": "anything", "collection": "nope"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
    assert_eq!(FakeLlm::count(&llm.generate_calls), 0);
}

#[tokio::test]
async fn test_empty_document_is_rejected_before_embedding() {
    let TestApp { app, llm, .. } = test_app();

    let response = app
        .oneshot(post_json("/rag/ingest", json!({"content": "   \n\n  "})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(FakeLlm::count(&llm.embed_calls), 0);
}

#[tokio::test]
async fn test_collections_list_and_delete() {
    let TestApp { app, .. } = test_app();
    ingest(&app, "scratch", "Temporary notes about nothing in particular.", "notes.txt").await;

    let response = app.clone().oneshot(get("/rag/collections")).await.unwrap();
    let body = json_body(response).await;
    assert_eq!(body["collections"][0]["name"], "scratch");
    assert_eq!(body["collections"][0]["points_count"], 1);

    let response = app
        .clone()
        .oneshot(delete("/rag/collections/scratch"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["success"], true);

    let response = app.oneshot(delete("/rag/collections/scratch")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_analytics_reflect_recorded_requests() {
    let TestApp { app, .. } = test_app();

    app.clone()
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    app.clone().oneshot(get("/models")).await.unwrap();
    app.clone()
        .oneshot(
            Request::builder()
                .uri("/models")
                .header("x-api-key", "wrong")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    let response = app.clone().oneshot(get("/analytics/stats")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["period"], "all time");
    assert_eq!(body["metrics"]["total_requests"], 3);
    assert_eq!(body["metrics"]["total_errors"], 1);
    assert_eq!(body["metrics"]["endpoint_breakdown"]["GET /models"]["requests"], 2);

    let response = app.oneshot(get("/analytics/errors?limit=5")).await.unwrap();
    let body = json_body(response).await;
    assert_eq!(body["count"], 1);
    assert_eq!(body["errors"][0]["status"], 401);
    assert_eq!(body["errors"][0]["error"], "Invalid API Key");
}

#[tokio::test]
async fn test_metrics_endpoint_is_not_recorded() {
    let TestApp { app, state, .. } = test_app();

    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(state.metrics.stats(None).total_requests, 0);
}

#[tokio::test]
async fn test_alerts_report_thresholds() {
    let TestApp { app, .. } = test_app();

    let response = app.oneshot(get("/analytics/alerts")).await.unwrap();
    let body = json_body(response).await;
    assert_eq!(body["status"], "success");
    assert_eq!(body["alert_count"], 0);
    assert_eq!(body["thresholds"]["error_rate"], 0.1);
    assert_eq!(body["thresholds"]["response_time"], 5.0);
}

#[tokio::test]
async fn test_cache_stats_and_prefix_clear() {
    let TestApp { app, llm, .. } = test_app();
    let body = json!({"prompt": "cache me"});

    app.clone()
        .oneshot(post_json("/inference/generate", body.clone()))
        .await
        .unwrap();

    let response = app.clone().oneshot(get("/analytics/cache")).await.unwrap();
    let stats = json_body(response).await;
    assert_eq!(stats["cache"]["enabled"], true);
    assert_eq!(stats["cache"]["key_count"], 1);

    let response = app
        .clone()
        .oneshot(delete("/analytics/cache?prefix=inference"))
        .await
        .unwrap();
    assert_eq!(json_body(response).await["deleted"], 1);

    app.clone()
        .oneshot(post_json("/inference/generate", body))
        .await
        .unwrap();
    assert_eq!(FakeLlm::count(&llm.generate_calls), 2);

    let response = app.clone().oneshot(delete("/analytics/cache")).await.unwrap();
    assert_eq!(json_body(response).await["status"], "success");

    let response = app.oneshot(get("/analytics/health")).await.unwrap();
    let health = json_body(response).await;
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["components"]["cache"]["status"], "healthy");
    assert_eq!(health["components"]["monitoring"]["status"], "healthy");
}

#[tokio::test]
async fn test_unreachable_backend_is_service_unavailable() {
    let TestApp { app, llm, state } = test_app();
    llm.fail_generate(Outage::Unreachable);

    let response = app
        .oneshot(post_json("/inference/generate", json!({"prompt": "hello"})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(
        json_body(response).await["detail"],
        "Could not connect to inference backend: connection refused"
    );
    let errors = state.metrics.recent_errors(1);
    assert_eq!(errors[0].status, 503);
    assert_eq!(errors[0].error, "inference backend unavailable: connection refused");
}

#[tokio::test]
async fn test_rejected_backend_call_is_bad_gateway_and_not_cached() {
    let TestApp { app, llm, .. } = test_app();
    llm.fail_generate(Outage::Rejected);
    let body = json!({"prompt": "hello"});

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(post_json("/inference/generate", body.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            json_body(response).await["detail"],
            "inference backend API error: model not loaded"
        );
    }
    assert_eq!(FakeLlm::count(&llm.generate_calls), 2);
}

#[tokio::test]
async fn test_ingest_embedding_outage_is_service_unavailable() {
    let TestApp { app, llm, .. } = test_app();
    llm.fail_embed_after(0, Outage::Unreachable);

    let response = app
        .clone()
        .oneshot(post_json(
            "/rag/ingest",
            json!({"content": "Nothing will be stored.", "collection": "kb"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let response = app.oneshot(get("/rag/collections")).await.unwrap();
    assert_eq!(json_body(response).await["collections"], json!([]));
}

#[tokio::test]
async fn test_stats_window_out_of_range_covers_everything() {
    let TestApp { app, .. } = test_app();
    app.clone().oneshot(get("/models")).await.unwrap();

    let uri = format!("/analytics/stats?since_minutes={}", i64::MAX);
    let response = app.oneshot(get(&uri)).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["metrics"]["total_requests"], 1);
}

#[tokio::test]
async fn test_endpoint_breakdown_uses_route_templates() {
    let TestApp { app, state, .. } = test_app();

    for i in 0..20 {
        let uri = format!("/rag/collections/missing-{}", i);
        let response = app.clone().oneshot(delete(&uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    let stats = state.metrics.stats(None);
    assert_eq!(stats.endpoint_breakdown.len(), 1);
    assert_eq!(
        stats.endpoint_breakdown["DELETE /rag/collections/:name"].errors,
        20
    );
    assert_eq!(state.metrics.recent_errors(1)[0].path, "/rag/collections/missing-19");
}

#[tokio::test]
async fn test_request_counters_and_in_progress_gauge_are_exported() {
    let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    // The default test runtime is single-threaded, so the middleware sees this recorder
    let _guard = metrics::set_default_local_recorder(&recorder);

    let TestApp { app, .. } = test_app();
    app.oneshot(get("/models")).await.unwrap();

    let rendered = handle.render();
    let line = |name: &str| {
        rendered
            .lines()
            .find(|l| l.starts_with(name) && l.contains("path=\"/models\""))
            .map(str::to_string)
    };
    let in_progress = line("gateway_requests_in_progress{").unwrap();
    assert!(in_progress.ends_with(" 0"), "{}", in_progress);
    let total = line("gateway_requests_total{").unwrap();
    assert!(total.contains("status=\"200\""));
    assert!(total.ends_with(" 1"), "{}", total);
}
