use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

use memtap_core::config::{
    IdentityConfig, InterceptConfig, MemtapConfig, ReflectionConfig, ServiceConfig, StoreConfig,
    SyncConfig,
};
use memtap_core::ipc::{ExchangeEvent, MemtapRequest};
use memtap_core::store::{HttpMemoryStoreClient, MemoryStore, RetryPolicy};
use memtap_server::router;
use memtap_server::subsystems::intercept::Interceptor;
use memtap_server::subsystems::reflect::{run_reflection_loop, ReflectionEngine, ReflectionHandle};
use memtap_server::subsystems::sync::{run_sync_loop, SyncHandle};

fn store_config(base_url: &str) -> StoreConfig {
    StoreConfig {
        base_url: base_url.to_string(),
        api_key: "test-key".to_string(),
        timeout_seconds: 5,
        max_retries: 1,
        retry_base_ms: 5,
        retry_cap_ms: 20,
    }
}

fn intercept_config() -> InterceptConfig {
    InterceptConfig {
        listen_host: "127.0.0.1".to_string(),
        listen_port: 0,
        match_host: "api.example.com".to_string(),
        match_path_prefix: "/v1/messages".to_string(),
        queue_capacity: 64,
    }
}

fn full_config(base_url: &str, reflection: ReflectionConfig) -> MemtapConfig {
    MemtapConfig {
        service: ServiceConfig {
            socket_path: "/tmp/memtap-test.sock".to_string(),
            log_level: "info".to_string(),
        },
        intercept: intercept_config(),
        store: store_config(base_url),
        sync: SyncConfig::default(),
        identity: IdentityConfig::default(),
        reflection,
    }
}

struct Pipeline {
    interceptor: Interceptor,
    reflection: ReflectionHandle,
    store: Arc<dyn MemoryStore>,
    _shutdown: broadcast::Sender<()>,
}

/// Wire the real subsystems together against a wiremock store, the same
/// way main assembles them.
fn build_pipeline(base_url: &str, reflection_config: ReflectionConfig) -> Pipeline {
    let store_cfg = store_config(base_url);
    let client =
        HttpMemoryStoreClient::with_base_url(&store_cfg, base_url.to_string()).unwrap();
    let store: Arc<dyn MemoryStore> = Arc::new(client);

    let (sync_handle, sync_rx) = SyncHandle::channel(64);
    let (reflection_handle, reflection_rx) = ReflectionHandle::channel(64);
    let (shutdown_tx, _) = broadcast::channel(1);

    tokio::spawn(run_sync_loop(
        sync_rx,
        sync_handle.clone(),
        store.clone(),
        RetryPolicy::from_config(&store_cfg),
        SyncConfig::default(),
        reflection_handle.clone(),
        shutdown_tx.subscribe(),
    ));
    let engine = ReflectionEngine::new(store.clone(), sync_handle.clone(), reflection_config);
    tokio::spawn(run_reflection_loop(
        engine,
        reflection_rx,
        shutdown_tx.subscribe(),
    ));

    Pipeline {
        interceptor: Interceptor::new(&intercept_config(), "u1", sync_handle),
        reflection: reflection_handle,
        store,
        _shutdown: shutdown_tx,
    }
}

fn request_event(connection_id: u64, question: &str) -> ExchangeEvent {
    ExchangeEvent::RequestCaptured {
        connection_id,
        host: "api.example.com".to_string(),
        path: "/v1/messages".to_string(),
        body: json!({"messages": [{"role": "user", "content": question}]})
            .to_string()
            .into_bytes(),
    }
}

fn direct_response(connection_id: u64, text: &str) -> ExchangeEvent {
    ExchangeEvent::ResponseComplete {
        connection_id,
        content_type: "application/json".to_string(),
        body: json!({"model": "claude-3", "content": [{"type": "text", "text": text}]})
            .to_string()
            .into_bytes(),
    }
}

async fn add_requests(server: &MockServer) -> Vec<Request> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.method.to_string() == "POST" && r.url.path() == "/v1/memories/")
        .collect()
}

/// Poll until the store has seen `expected` add calls or the deadline hits.
async fn wait_for_adds(server: &MockServer, expected: usize) -> Vec<Request> {
    for _ in 0..200 {
        let adds = add_requests(server).await;
        if adds.len() >= expected {
            return adds;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    add_requests(server).await
}

async fn mount_add(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/v1/memories/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "mem-1"})))
        .mount(server)
        .await;
}

fn record_json(id: &str, content: &str, created_at: &str) -> serde_json::Value {
    json!({
        "id": id,
        "memory": content,
        "user_id": "u1",
        "metadata": {"turn_id": format!("t-{}", id)},
        "created_at": created_at
    })
}

#[tokio::test]
async fn intercepted_exchange_lands_in_store_with_metadata() {
    let server = MockServer::start().await;
    mount_add(&server).await;

    let mut pipeline = build_pipeline(&server.uri(), ReflectionConfig::default());
    pipeline.interceptor.observe(request_event(1, "what is a lifetime?"));
    pipeline
        .interceptor
        .observe(direct_response(1, "the scope a borrow is valid for"));

    let adds = wait_for_adds(&server, 1).await;
    assert_eq!(adds.len(), 1);

    let body: serde_json::Value = serde_json::from_slice(&adds[0].body).unwrap();
    assert_eq!(body["user_id"], "u1");
    assert_eq!(body["metadata"]["source"], "direct");
    assert_eq!(body["metadata"]["model"], "claude-3");
    assert!(body["metadata"]["turn_id"].is_string());
    assert_eq!(body["messages"][0]["role"], "user");
    assert_eq!(body["messages"][1]["role"], "assistant");
}

#[tokio::test]
async fn duplicate_exchanges_are_submitted_once() {
    let server = MockServer::start().await;
    mount_add(&server).await;

    let mut pipeline = build_pipeline(&server.uri(), ReflectionConfig::default());
    for connection_id in [1, 2] {
        pipeline
            .interceptor
            .observe(request_event(connection_id, "same question"));
        pipeline
            .interceptor
            .observe(direct_response(connection_id, "same answer"));
    }

    let adds = wait_for_adds(&server, 1).await;
    // Replayed content is suppressed before its first attempt.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(add_requests(&server).await.len(), adds.len());
    assert_eq!(adds.len(), 1);
}

#[tokio::test]
async fn transient_store_failure_is_retried_to_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/memories/"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_add(&server).await;

    let mut pipeline = build_pipeline(&server.uri(), ReflectionConfig::default());
    pipeline.interceptor.observe(request_event(1, "retry me"));
    pipeline.interceptor.observe(direct_response(1, "done"));

    let adds = wait_for_adds(&server, 2).await;
    // First attempt failed with 503, the scheduled retry succeeded.
    assert_eq!(adds.len(), 2);
}

#[tokio::test]
async fn turn_threshold_produces_reflection_insight() {
    let server = MockServer::start().await;
    mount_add(&server).await;
    Mock::given(method("GET"))
        .and(path("/v1/memories/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [
                record_json("a", "how do I implement this trait?", "2024-05-01T12:02:00Z"),
                record_json("b", "debug the function please", "2024-05-01T12:01:00Z"),
                record_json("c", "explain the borrow checker code", "2024-05-01T12:00:00Z")
            ]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/memories/search/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"results": []})))
        .mount(&server)
        .await;

    let config = ReflectionConfig {
        turn_threshold: 3,
        error_threshold: 100,
        action_threshold: 100,
        recency_window: 20,
        relevance_window: 10,
    };
    let mut pipeline = build_pipeline(&server.uri(), config);

    for connection_id in 1..=3u64 {
        pipeline.interceptor.observe(request_event(
            connection_id,
            &format!("question number {}", connection_id),
        ));
        pipeline
            .interceptor
            .observe(direct_response(connection_id, "an answer"));
    }

    // 3 turns + 1 insight.
    let adds = wait_for_adds(&server, 4).await;
    assert_eq!(adds.len(), 4);

    let insight: serde_json::Value = serde_json::from_slice(&adds[3].body).unwrap();
    assert_eq!(insight["metadata"]["kind"], "reflection");
    assert_eq!(insight["metadata"]["trigger_reason"], "turn_count");
    let evidence = insight["metadata"]["evidence_turn_ids"].as_array().unwrap();
    for id in evidence {
        assert!(["t-a", "t-b", "t-c"].contains(&id.as_str().unwrap()));
    }
    let summary = insight["messages"][1]["content"].as_str().unwrap();
    assert!(summary.contains("Conversation Analysis"));

    // The durable insight reset the turn counter: two more turns stay
    // below the threshold and produce no second insight.
    for connection_id in 4..=5u64 {
        pipeline.interceptor.observe(request_event(
            connection_id,
            &format!("question number {}", connection_id),
        ));
        pipeline
            .interceptor
            .observe(direct_response(connection_id, "an answer"));
    }
    let adds = wait_for_adds(&server, 6).await;
    assert_eq!(adds.len(), 6);
    for request in &adds[4..] {
        let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
        assert_eq!(body["metadata"]["source"], "direct");
    }
}

#[tokio::test]
async fn facade_serves_store_operations() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/memories/search/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [record_json("m1", "a stored memory", "2024-05-01T12:00:00Z")]
        })))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/v1/memories/missing/"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let pipeline = build_pipeline(&server.uri(), ReflectionConfig::default());
    let config = full_config(&server.uri(), ReflectionConfig::default());

    let response = router::handle_request(
        MemtapRequest::Ping,
        &pipeline.store,
        &pipeline.reflection,
        &config,
    )
    .await;
    assert_eq!(response.status, "ok");

    let response = router::handle_request(
        MemtapRequest::Search {
            query: "memory".to_string(),
            user_id: None,
            limit: None,
        },
        &pipeline.store,
        &pipeline.reflection,
        &config,
    )
    .await;
    assert_eq!(response.status, "ok");
    let data = response.data.unwrap();
    assert_eq!(data["count"], 1);
    assert_eq!(data["results"][0]["id"], "m1");

    let response = router::handle_request(
        MemtapRequest::Delete {
            memory_id: "missing".to_string(),
        },
        &pipeline.store,
        &pipeline.reflection,
        &config,
    )
    .await;
    assert_eq!(response.status, "ok");
    assert_eq!(response.data.unwrap()["deleted"], false);

    let response = router::handle_request(
        MemtapRequest::Add {
            messages: vec![],
            user_id: None,
            metadata: None,
        },
        &pipeline.store,
        &pipeline.reflection,
        &config,
    )
    .await;
    assert_eq!(response.status, "error");
}

#[tokio::test]
async fn manual_reflect_request_runs_a_pass() {
    let server = MockServer::start().await;
    mount_add(&server).await;
    Mock::given(method("GET"))
        .and(path("/v1/memories/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [record_json("a", "deploy the server config", "2024-05-01T12:00:00Z")]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/memories/search/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"results": []})))
        .mount(&server)
        .await;

    let pipeline = build_pipeline(&server.uri(), ReflectionConfig::default());
    let config = full_config(&server.uri(), ReflectionConfig::default());

    let response = router::handle_request(
        MemtapRequest::Reflect {
            user_id: Some("u1".to_string()),
            reason: Some("operator request".to_string()),
        },
        &pipeline.store,
        &pipeline.reflection,
        &config,
    )
    .await;
    assert_eq!(response.status, "ok");
    assert_eq!(response.data.unwrap()["triggered"], true);

    let adds = wait_for_adds(&server, 1).await;
    let body: serde_json::Value = serde_json::from_slice(&adds[0].body).unwrap();
    assert_eq!(body["metadata"]["kind"], "reflection");
    assert_eq!(body["metadata"]["trigger_reason"], "manual");
}
