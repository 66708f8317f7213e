//! Shared fixtures: a scripted OpenAI-compatible endpoint and temp layouts.
#![allow(dead_code)]

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use image::{ImageFormat, Rgb, RgbImage};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use vlm_inspector::config::Config;

/// One scripted answer from the fake endpoint, consumed in order.
#[derive(Debug, Clone)]
pub enum Reply {
    /// 200 with a chat completion whose message content is this text.
    Content(String),
    /// Bare status code with a short text body.
    Status(u16),
    /// Sleep, then answer like `Content`. Longer than the client timeout
    /// this is seen as a timeout.
    Delayed(Duration, String),
    /// 200 with this exact body.
    Body(String),
}

impl Reply {
    pub fn content(text: impl Into<String>) -> Self {
        Reply::Content(text.into())
    }

    pub fn hang() -> Self {
        Reply::Delayed(Duration::from_secs(3), r#"{"detections": []}"#.to_string())
    }
}

#[derive(Default)]
struct FakeState {
    script: Mutex<VecDeque<Reply>>,
    attempts: AtomicUsize,
    requests: Mutex<Vec<Value>>,
    authorization: Mutex<Vec<Option<String>>>,
    cancel_on_request: Mutex<Option<Arc<AtomicBool>>>,
}

pub struct FakeEndpoint {
    pub base_url: String,
    state: Arc<FakeState>,
}

impl FakeEndpoint {
    pub async fn start(script: Vec<Reply>) -> Self {
        let state = Arc::new(FakeState {
            script: Mutex::new(script.into()),
            ..Default::default()
        });

        let app = Router::new()
            .route("/v1/chat/completions", post(completions))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{}/v1", addr),
            state,
        }
    }

    pub fn attempts(&self) -> usize {
        self.state.attempts.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<Value> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn authorization_headers(&self) -> Vec<Option<String>> {
        self.state.authorization.lock().unwrap().clone()
    }

    pub fn push(&self, reply: Reply) {
        self.state.script.lock().unwrap().push_back(reply);
    }

    /// Set `flag` as soon as the next request arrives.
    pub fn cancel_on_request(&self, flag: Arc<AtomicBool>) {
        *self.state.cancel_on_request.lock().unwrap() = Some(flag);
    }
}

async fn completions(
    State(state): State<Arc<FakeState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    state.attempts.fetch_add(1, Ordering::SeqCst);
    state.requests.lock().unwrap().push(body);
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.authorization.lock().unwrap().push(auth);
    if let Some(flag) = state.cancel_on_request.lock().unwrap().take() {
        flag.store(true, Ordering::SeqCst);
    }

    let reply = state.script.lock().unwrap().pop_front();
    match reply {
        Some(Reply::Content(text)) => Json(completion(&text)).into_response(),
        Some(Reply::Status(code)) => {
            let status = StatusCode::from_u16(code).unwrap();
            (status, "scripted failure").into_response()
        }
        Some(Reply::Delayed(delay, text)) => {
            tokio::time::sleep(delay).await;
            Json(completion(&text)).into_response()
        }
        Some(Reply::Body(raw)) => (StatusCode::OK, raw).into_response(),
        None => (StatusCode::INTERNAL_SERVER_ERROR, "script exhausted").into_response(),
    }
}

pub fn completion(content: &str) -> Value {
    json!({
        "id": "chatcmpl-test",
        "object": "chat.completion",
        "model": "fake-vl",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }]
    })
}

/// Temp directory with `in/` created and outputs under `out/`.
pub struct Workspace {
    pub dir: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("in")).unwrap();
        Self { dir }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn input(&self, name: &str) -> PathBuf {
        self.root().join("in").join(name)
    }

    pub fn json(&self, stem: &str) -> PathBuf {
        self.root().join("out/json").join(format!("{}.json", stem))
    }

    pub fn positive(&self, name: &str) -> PathBuf {
        self.root().join("out/true").join(name)
    }

    pub fn negative(&self, name: &str) -> PathBuf {
        self.root().join("out/false").join(name)
    }

    /// Write a flat gray test image with a small dark patch.
    pub fn write_image(&self, name: &str, width: u32, height: u32) -> PathBuf {
        let mut img = RgbImage::from_pixel(width, height, Rgb([128, 128, 128]));
        for y in 0..height.min(4) {
            for x in 0..width.min(4) {
                img.put_pixel(x, y, Rgb([10, 20, 30]));
            }
        }
        let path = self.input(name);
        let format = ImageFormat::from_path(&path).unwrap();
        img.save_with_format(&path, format).unwrap();
        path
    }

    pub fn read_result(&self, stem: &str) -> Value {
        serde_json::from_slice(&std::fs::read(self.json(stem)).unwrap()).unwrap()
    }

    /// Config against `endpoint` with fast retries and a short timeout.
    pub fn config(&self, endpoint: &FakeEndpoint) -> Config {
        let yaml = format!(
            r#"
endpoint: {endpoint}
model: fake-vl
labels: [defective, scratch]
prompt: "Inspect the part. Allowed labels: {{labels}}. Reply with JSON."
max_attempts: 3
backoff_base_ms: 10
backoff_max_ms: 40
request_timeout_secs: 0.5
extensions: [png, jpg]
paths:
  input_dir: in
  json_dir: out/json
  positive_dir: out/true
  negative_dir: out/false
"#,
            endpoint = endpoint.base_url
        );
        let mut config = Config::from_yaml(&yaml).unwrap();
        config.resolve_paths(self.root());
        config.validate().unwrap();
        config
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("vlm_inspector=debug")
        .with_test_writer()
        .try_init();
}
