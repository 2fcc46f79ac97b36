//! Integration tests for the /generate relay, driven through the router
//! against scripted backends.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower::ServiceExt;

use token_relay::backend::{
    BackendError, ChatBackend, ChatRequest, Chunk, ChunkStream, Message, Role,
};
use token_relay::config::Config;
use token_relay::server::api::{build_router, AppState};

/// What a scripted backend does when called.
#[derive(Clone)]
enum Script {
    /// Stream these fragments, then optionally fail with the given message.
    Chunks(Vec<&'static str>, Option<&'static str>),
    /// Fail before any stream exists.
    SetupStatus(u16),
    /// Never answer.
    Hang,
    /// Split the prompt into words and stream them slowly.
    EchoWords,
}

struct ScriptedBackend {
    script: Script,
    calls: Mutex<Vec<ChatRequest>>,
}

impl ScriptedBackend {
    fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<ChatRequest> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn stream_chat(&self, request: ChatRequest) -> Result<ChunkStream, BackendError> {
        self.calls.lock().unwrap().push(request.clone());

        match self.script.clone() {
            Script::Chunks(parts, failure) => {
                let mut items: Vec<Result<Chunk, BackendError>> =
                    parts.into_iter().map(|p| Ok(Chunk::new(p))).collect();
                if let Some(msg) = failure {
                    items.push(Err(BackendError::Model(msg.to_string())));
                }
                Ok(stream::iter(items).boxed())
            }
            Script::SetupStatus(status) => Err(BackendError::Status {
                status,
                body: "oops".to_string(),
            }),
            Script::Hang => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(stream::empty().boxed())
            }
            Script::EchoWords => {
                let words: Vec<String> = request.messages[0]
                    .content
                    .split(' ')
                    .map(|w| format!("{w} "))
                    .collect();
                Ok(stream::iter(words)
                    .then(|w| async move {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        Ok(Chunk::new(w))
                    })
                    .boxed())
            }
        }
    }
}

/// Backend whose single stream is fed by the test.
struct ChannelBackend {
    rx: Mutex<Option<mpsc::UnboundedReceiver<Result<Chunk, BackendError>>>>,
}

#[async_trait]
impl ChatBackend for ChannelBackend {
    fn name(&self) -> &'static str {
        "channel"
    }

    async fn stream_chat(&self, _request: ChatRequest) -> Result<ChunkStream, BackendError> {
        let rx = self.rx.lock().unwrap().take().expect("backend called twice");
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}

fn app_with(backend: Arc<dyn ChatBackend>, config: Config) -> Router {
    let state = Arc::new(AppState::new(config, backend).unwrap());
    build_router(state)
}

fn generate_request(body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/generate")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_text(body: Body) -> String {
    let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_missing_or_empty_prompt_is_rejected_without_backend_call() {
    let backend = ScriptedBackend::new(Script::Chunks(vec!["never"], None));
    let app = app_with(backend.clone(), Config::default());

    for body in [r#"{}"#, r#"{"prompt": ""}"#, r#"{"prompt": null}"#, "not json"] {
        let response = app.clone().oneshot(generate_request(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body: {body}");
    }

    let response = app.oneshot(generate_request(r#"{}"#)).await.unwrap();
    assert_eq!(body_text(response.into_body()).await, "No prompt provided");
    assert!(backend.calls().is_empty());
}

#[tokio::test]
async fn test_single_backend_call_with_user_message() {
    let backend = ScriptedBackend::new(Script::Chunks(vec!["hi"], None));
    let app = app_with(backend.clone(), Config::default());

    let response = app
        .oneshot(generate_request(r#"{"prompt": "hello"}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    body_text(response.into_body()).await;

    let calls = backend.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].model, "llama2:7b");
    assert_eq!(
        calls[0].messages,
        vec![Message {
            role: Role::User,
            content: "hello".to_string()
        }]
    );
}

#[tokio::test]
async fn test_chunks_concatenated_in_order() {
    let backend = ScriptedBackend::new(Script::Chunks(vec!["Hel", "lo", " world"], None));
    let app = app_with(backend, Config::default());

    let response = app
        .oneshot(generate_request(r#"{"prompt": "hi"}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()["content-type"].to_str().unwrap();
    assert!(content_type.starts_with("text/plain"));
    assert_eq!(body_text(response.into_body()).await, "Hello world");
}

#[tokio::test]
async fn test_chunks_are_written_progressively() {
    let (tx, rx) = mpsc::unbounded_channel();
    let backend = Arc::new(ChannelBackend {
        rx: Mutex::new(Some(rx)),
    });
    let app = app_with(backend, Config::default());

    let response = app
        .oneshot(generate_request(r#"{"prompt": "hi"}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let mut frames = response.into_body().into_data_stream();

    for part in ["Hel", "lo", " world"] {
        tx.send(Ok(Chunk::new(part))).unwrap();
        let frame = frames.next().await.unwrap().unwrap();
        assert_eq!(&frame[..], part.as_bytes());
    }

    drop(tx);
    assert!(frames.next().await.is_none());
}

#[tokio::test]
async fn test_mid_stream_error_is_final_fragment() {
    let backend = ScriptedBackend::new(Script::Chunks(vec!["a", "b"], Some("backend exploded")));
    let app = app_with(backend, Config::default());

    let response = app
        .oneshot(generate_request(r#"{"prompt": "hi"}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response.into_body()).await, "abbackend exploded");
}

#[tokio::test]
async fn test_error_before_first_chunk_still_streams() {
    let backend = ScriptedBackend::new(Script::Chunks(vec![], Some("model not loaded")));
    let app = app_with(backend, Config::default());

    let response = app
        .oneshot(generate_request(r#"{"prompt": "hi"}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response.into_body()).await, "model not loaded");
}

#[tokio::test]
async fn test_setup_failure_is_bad_gateway() {
    let backend = ScriptedBackend::new(Script::SetupStatus(500));
    let app = app_with(backend, Config::default());

    let response = app
        .oneshot(generate_request(r#"{"prompt": "hi"}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(
        body_text(response.into_body()).await,
        "backend unavailable: backend returned HTTP 500: oops"
    );
}

#[tokio::test]
async fn test_setup_timeout_is_gateway_timeout() {
    let backend = ScriptedBackend::new(Script::Hang);
    let mut config = Config::default();
    config.backend.chunk_timeout_secs = 1;
    let app = app_with(backend, config);

    let response = app
        .oneshot(generate_request(r#"{"prompt": "hi"}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_requests_do_not_interleave() {
    let backend = ScriptedBackend::new(Script::EchoWords);
    let app = app_with(backend.clone(), Config::default());

    let first = "one two three four five six";
    let second = "alpha beta gamma delta epsilon zeta";

    let run = |prompt: &'static str| {
        let app = app.clone();
        async move {
            let body = format!(r#"{{"prompt": "{prompt}"}}"#);
            let response = app.oneshot(generate_request(&body)).await.unwrap();
            body_text(response.into_body()).await
        }
    };

    let (a, b) = tokio::join!(run(first), run(second));

    assert_eq!(a, format!("{first} "));
    assert_eq!(b, format!("{second} "));
    assert_eq!(backend.calls().len(), 2);
}

#[tokio::test]
async fn test_metrics_endpoint_is_well_formed() {
    let backend = ScriptedBackend::new(Script::Chunks(vec!["x"], None));
    let app = app_with(backend, Config::default());

    let response = app
        .clone()
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()["content-type"].to_str().unwrap();
    assert!(content_type.starts_with("text/plain; version=0.0.4"));
    let text = body_text(response.into_body()).await;
    assert!(text.contains("# TYPE app_info gauge"));

    let response = app
        .clone()
        .oneshot(generate_request(r#"{"prompt": "hi"}"#))
        .await
        .unwrap();
    body_text(response.into_body()).await;

    let response = app
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let text = body_text(response.into_body()).await;
    assert!(text.contains(
        r#"http_requests_total{handler="/generate",method="POST",status="200"} 1"#
    ));
    assert!(text.contains(
        r#"http_requests_total{handler="/metrics",method="GET",status="200"} 1"#
    ));
}

#[tokio::test]
async fn test_abandoned_request_is_counted_and_released() {
    let backend = ScriptedBackend::new(Script::Hang);
    let app = app_with(backend.clone(), Config::default());

    // The client gives up while the backend is still silent.
    let abandoned = tokio::time::timeout(
        Duration::from_millis(100),
        app.clone().oneshot(generate_request(r#"{"prompt": "hi"}"#)),
    )
    .await;
    assert!(abandoned.is_err());
    assert_eq!(backend.calls().len(), 1);

    let response = app
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let text = body_text(response.into_body()).await;

    // Only the scrape itself is in flight.
    assert!(text.contains("http_requests_in_flight 1"));
    assert!(text.contains(
        r#"http_requests_total{handler="/generate",method="POST",status="499"} 1"#
    ));
}

#[tokio::test]
async fn test_unknown_route_is_counted_as_unmatched() {
    let backend = ScriptedBackend::new(Script::Chunks(vec![], None));
    let app = app_with(backend, Config::default());

    let response = app
        .clone()
        .oneshot(Request::get("/nope").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let text = body_text(response.into_body()).await;
    assert!(text.contains(
        r#"http_requests_total{handler="unmatched",method="GET",status="404"} 1"#
    ));
}

#[tokio::test]
async fn test_health_reports_model() {
    let backend = ScriptedBackend::new(Script::Chunks(vec![], None));
    let app = app_with(backend, Config::default());

    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let health: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["model"], "llama2:7b");
    assert_eq!(health["backend"], "scripted");
}
