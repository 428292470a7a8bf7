//! End-to-end exercise of `Engine::complete` against a mocked generation
//! endpoint: config loading, prompt assembly, reply parsing, and the
//! quote-aware post-processing all run together here instead of in
//! isolation.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use ashlet_core::config::Config;
use ashlet_core::engine::Engine;
use ashlet_core::engine::EngineInner;
use ashlet_core::protocol::Request;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::method;
use wiremock::matchers::path;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::ResponseTemplate;

#[tokio::test]
async fn complete_returns_ranked_candidates_from_a_mocked_model() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "choices": [{"message": {"content":
                "<candidate type=\"replace\"><command>git status</command></candidate>\
                 <candidate type=\"replace\"><command>git stash</command></candidate>"
            }}]
        })))
        .mount(&server)
        .await;

    let mut config = Config::defaults();
    config.generation.base_url = server.uri();
    config.generation.api_key = "test-key".to_string();

    let engine = Engine::new(EngineInner::build(config).await.expect("build engine"), None);
    let request = Request {
        request_id: 42,
        input: "git sta".to_string(),
        cursor_pos: 7,
        cwd: "/tmp".to_string(),
        session_id: String::new(),
        max_candidates: Some(2),
    };

    let response = engine
        .complete(&request, &CancellationToken::new())
        .await
        .expect("a reply");

    assert_eq!(response.request_id, 42);
    assert!(response.error.is_none());
    assert_eq!(response.candidates.len(), 2);
    assert!(response.candidates.iter().any(|c| c.completion == "git status"));
    assert!(response.candidates.iter().any(|c| c.completion == "git stash"));
}

#[tokio::test]
async fn complete_reports_api_error_on_upstream_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let mut config = Config::defaults();
    config.generation.base_url = server.uri();
    config.generation.api_key = "test-key".to_string();

    let engine = Engine::new(EngineInner::build(config).await.expect("build engine"), None);
    let request = Request {
        request_id: 1,
        input: "git sta".to_string(),
        cursor_pos: 7,
        cwd: "/tmp".to_string(),
        session_id: String::new(),
        max_candidates: None,
    };

    let response = engine
        .complete(&request, &CancellationToken::new())
        .await
        .expect("a reply");

    assert_eq!(response.error.expect("error").code, "api_error");
}

#[tokio::test]
async fn reload_picks_up_a_rewritten_config_file() {
    let dir = TempDir::new().expect("tempdir");
    tokio::fs::write(dir.path().join("config.toml"), "[generation]\napi_key = \"first\"\n")
        .await
        .expect("write");

    let config = Config::load(Some(dir.path())).await.expect("load");
    let engine = Engine::new(
        EngineInner::build(config).await.expect("build engine"),
        Some(dir.path().to_path_buf()),
    );
    assert_eq!(engine.config_snapshot().await.generation.api_key, "first");

    tokio::fs::write(dir.path().join("config.toml"), "[generation]\napi_key = \"second\"\n")
        .await
        .expect("write");
    engine.reload().await.expect("reload");

    assert_eq!(engine.config_snapshot().await.generation.api_key, "second");
}
