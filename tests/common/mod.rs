#![allow(dead_code)]

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::{
    net::TcpListener,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};
use tokio::task::JoinHandle;

type Updates = Arc<Mutex<Vec<Value>>>;

#[derive(Clone, Default)]
struct ControlState {
    updates: Updates,
    metrics_broken: Arc<AtomicBool>,
}

/// Stands in for a media server: a bound data port and an HTTP control surface that records
/// every network update it receives.
pub struct FakeServer {
    pub data_port: u16,
    pub control_port: u16,
    state: ControlState,
    _data: Option<TcpListener>,
    task: JoinHandle<()>,
}

impl FakeServer {
    pub async fn spawn() -> anyhow::Result<Self> {
        Self::build(true).await
    }

    /// Control surface only. The data port was bound once for a free number and then closed,
    /// so nothing ever accepts on it.
    pub async fn spawn_without_data_port() -> anyhow::Result<Self> {
        Self::build(false).await
    }

    async fn build(serve_data: bool) -> anyhow::Result<Self> {
        let data = TcpListener::bind("127.0.0.1:0")?;
        let data_port = data.local_addr()?.port();
        let data = serve_data.then_some(data);

        let state = ControlState::default();
        let app = Router::new()
            .route("/api/status", get(|| async { Json(json!({ "status": "ok" })) }))
            .route("/api/metrics", get(metrics))
            .route("/api/network/update", post(record_update))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let control_port = listener.local_addr()?.port();
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Ok(Self {
            data_port,
            control_port,
            state,
            _data: data,
            task,
        })
    }

    pub fn updates(&self) -> Vec<Value> {
        self.state.updates.lock().unwrap().clone()
    }

    /// Makes `/api/metrics` answer 500 from now on.
    pub fn break_metrics(&self) {
        self.state.metrics_broken.store(true, Ordering::SeqCst);
    }

    /// `[server]` table that launches a long sleep in place of the real server binary.
    pub fn server_toml(&self) -> String {
        server_toml_running("sleep 60", 10.0)
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// `[server]` table whose "binary" runs `script` under `sh`, ignoring the server arguments.
pub fn server_toml_running(script: &str, ready_timeout: f64) -> String {
    format!(
        r#"
        [server]
        binary = "sh"
        args = ["-c", {}, "fake-server"]
        ready_timeout = {:?}
        metrics_interval = 0.1
        stop_timeout = 1.0
        "#,
        Value::String(script.to_string()),
        ready_timeout
    )
}

async fn metrics(State(state): State<ControlState>) -> Result<Json<Value>, StatusCode> {
    if state.metrics_broken.load(Ordering::SeqCst) {
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }
    Ok(Json(json!({
        "streams": 1,
        "clients": 2,
        "bytes_sent": 4096,
        "errors": 0,
        "uptime": 3.5
    })))
}

async fn record_update(State(state): State<ControlState>, Json(body): Json<Value>) -> StatusCode {
    state.updates.lock().unwrap().push(body);
    StatusCode::OK
}

/// Creates an empty file to serve as a stream source.
pub fn touch(dir: &Path, name: &str) -> anyhow::Result<()> {
    std::fs::write(dir.join(name), b"")?;
    Ok(())
}

/// TOML string literal for a path.
pub fn toml_path(path: &Path) -> String {
    Value::String(path.display().to_string()).to_string()
}
