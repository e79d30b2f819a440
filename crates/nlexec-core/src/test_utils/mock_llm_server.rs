// src/test_utils/mock_llm_server.rs
use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

/// A queued reply: response text, or an HTTP status to fail with.
pub type MockReply = Result<String, u16>;

#[derive(Clone)]
struct MockServerState {
    responses: Arc<Mutex<VecDeque<MockReply>>>,
    requests: Arc<Mutex<Vec<Value>>>,
}

impl MockServerState {
    fn new(responses: Vec<MockReply>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn next(&self, payload: Value) -> Result<String, StatusCode> {
        log::debug!("Mock LLM server received request: {}", payload);
        self.requests.lock().unwrap().push(payload);
        match self.responses.lock().unwrap().pop_front() {
            Some(Ok(text)) => Ok(text),
            Some(Err(code)) => {
                log::error!("Mock LLM server simulating status {}", code);
                Err(StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
            }
            None => {
                log::error!("Mock LLM server ran out of responses!");
                Err(StatusCode::SERVICE_UNAVAILABLE)
            }
        }
    }
}

async fn chat_completions_handler(
    State(state): State<MockServerState>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, StatusCode> {
    let text = state.next(payload)?;
    Ok(Json(json!({
        "choices": [{ "index": 0, "message": { "role": "assistant", "content": text } }]
    })))
}

async fn generate_handler(
    State(state): State<MockServerState>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, StatusCode> {
    let text = state.next(payload)?;
    Ok(Json(json!({ "response": text, "done": true })))
}

pub struct MockLLMServer {
    addr: SocketAddr,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
    pub recorded_requests: Arc<Mutex<Vec<Value>>>,
}

impl MockLLMServer {
    /// Serves both the chat completions and the Ollama generate routes.
    pub async fn start(responses: Vec<MockReply>) -> Self {
        let state = MockServerState::new(responses);
        let recorded_requests = state.requests.clone();

        let app = Router::new()
            .route("/v1/chat/completions", post(chat_completions_handler))
            .route("/api/generate", post(generate_handler))
            .with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap_or_else(|e| {
            panic!("Failed to bind mock server to 127.0.0.1:0. Error: {}", e);
        });
        let addr = listener.local_addr().unwrap();
        log::info!("Mock LLM server listening on {}", addr);

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .unwrap_or_else(|e| log::error!("Mock LLM server error: {}", e));
        });

        MockLLMServer {
            addr,
            shutdown_tx,
            recorded_requests,
        }
    }

    pub fn address(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub async fn shutdown(self) {
        if self.shutdown_tx.send(()).is_err() {
            log::warn!("Mock LLM server shutdown signal already sent or receiver dropped.");
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
    }
}
