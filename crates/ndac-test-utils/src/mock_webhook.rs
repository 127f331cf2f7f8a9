// mock_webhook: Records JSON bodies posted to any path.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::{Json, Router};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::Mutex;

struct WebhookState {
    messages: Mutex<Vec<Value>>,
    status: Mutex<StatusCode>,
}

/// A webhook receiver bound to `127.0.0.1:0`.
pub struct MockWebhook {
    addr: SocketAddr,
    state: Arc<WebhookState>,
    _task: tokio::task::JoinHandle<()>,
}

impl MockWebhook {
    pub async fn start() -> Result<Self, Box<dyn std::error::Error>> {
        let state = Arc::new(WebhookState {
            messages: Mutex::new(Vec::new()),
            status: Mutex::new(StatusCode::OK),
        });
        let router = Router::new()
            .fallback(receive)
            .with_state(Arc::clone(&state));
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        Ok(Self {
            addr,
            state,
            _task: task,
        })
    }

    pub fn url(&self) -> String {
        format!("http://{}/hook", self.addr)
    }

    /// Status returned to every subsequent post. Bodies are still recorded.
    pub async fn respond_with(&self, status: StatusCode) {
        *self.state.status.lock().await = status;
    }

    pub async fn messages(&self) -> Vec<Value> {
        self.state.messages.lock().await.clone()
    }
}

async fn receive(State(state): State<Arc<WebhookState>>, Json(body): Json<Value>) -> StatusCode {
    state.messages.lock().await.push(body);
    *state.status.lock().await
}
