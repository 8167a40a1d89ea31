use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use inferport_core::{
    AccelStrategy, Backend, ExecError, ExecMode, ModelDescriptor, ResultEnvelope,
};
use inferport_runtime::{ExecutionRouter, Task};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

pub struct AppState<B: Backend> {
    pub router: ExecutionRouter<B>,
    pub delegate: RwLock<AccelStrategy>,
    pub top_k: usize,
}

impl<B: Backend> AppState<B> {
    pub fn new(router: ExecutionRouter<B>, delegate: AccelStrategy, top_k: usize) -> Self {
        Self {
            router,
            delegate: RwLock::new(delegate),
            top_k,
        }
    }
}

pub fn router<B: Backend>(state: Arc<AppState<B>>) -> Router {
    Router::new()
        .route("/health", get(health::<B>))
        .route("/set_delegate", get(set_delegate::<B>))
        .route("/set_model", get(set_model::<B>))
        .route("/models", get(models))
        .route("/infer", post(infer::<B>))
        .route("/offload", post(offload::<B>))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Every failure answers 400 `{ok: false, error}`.
pub struct ApiError(String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "ok": false, "error": self.0 })),
        )
            .into_response()
    }
}

impl From<ExecError> for ApiError {
    fn from(err: ExecError) -> Self {
        Self(err.to_string())
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Deserialize)]
pub struct InferBody {
    pub image_b64: String,
    pub topk: Option<usize>,
    /// `cpu`, `gpu`, `nnapi`/`npu`; anything else means CPU.
    pub delegate: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OffloadBody {
    pub image_b64: String,
    pub topk: Option<usize>,
    pub model: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct InferReply {
    /// `[label, prob]` pairs, best first.
    pub topk: Vec<(String, f32)>,
    pub timing_ms: BTreeMap<String, f64>,
    pub model: String,
    pub backend: ExecMode,
}

impl From<ResultEnvelope> for InferReply {
    fn from(env: ResultEnvelope) -> Self {
        Self {
            topk: env.ranking.into_iter().map(|r| (r.label, r.prob)).collect(),
            timing_ms: env.timing_ms.0,
            model: env.model,
            backend: env.backend,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DelegateQuery {
    pub mode: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ModelQuery {
    pub m: Option<String>,
}

async fn health<B: Backend>(State(state): State<Arc<AppState<B>>>) -> Json<Value> {
    let manager = state.router.manager();
    Json(json!({
        "ok": true,
        "backend": manager.backend_name(),
        "model": manager.current_model().name,
        "delegate": state.delegate.read().as_str(),
        "offload_connected": state.router.offload().map(|c| c.is_connected()),
    }))
}

async fn set_delegate<B: Backend>(
    State(state): State<Arc<AppState<B>>>,
    Query(q): Query<DelegateQuery>,
) -> Json<Value> {
    let strategy = AccelStrategy::from_name(q.mode.as_deref().unwrap_or("cpu"));
    *state.delegate.write() = strategy;
    info!(%strategy, "default delegate set");
    Json(json!({ "ok": true, "delegate": strategy.as_str() }))
}

async fn set_model<B: Backend>(
    State(state): State<Arc<AppState<B>>>,
    Query(q): Query<ModelQuery>,
) -> ApiResult<Value> {
    let model = ModelDescriptor::from_name(q.m.as_deref().unwrap_or("mv3"));
    let manager = state.router.manager().clone();
    // The manager lock may be held by a running inference.
    tokio::task::spawn_blocking(move || manager.switch_model(model))
        .await
        .map_err(|e| ApiError(format!("model switch failed: {e}")))?;
    Ok(Json(json!({ "ok": true, "model": model.name, "input": model.input_size })))
}

async fn models() -> Json<Value> {
    let list: Vec<Value> = ModelDescriptor::all()
        .iter()
        .map(|m| json!({ "name": m.name, "file": m.file, "input": m.input_size }))
        .collect();
    Json(Value::Array(list))
}

async fn infer<B: Backend>(
    State(state): State<Arc<AppState<B>>>,
    body: Result<Json<InferBody>, JsonRejection>,
) -> ApiResult<InferReply> {
    let Json(body) = body.map_err(|e| ApiError(e.body_text()))?;
    let image = decode_image(&body.image_b64)?;
    let strategy = match body.delegate.as_deref() {
        Some(name) => AccelStrategy::from_name(name),
        None => *state.delegate.read(),
    };
    let model = state.router.manager().current_model();
    let task = Task::new(image, model, body.topk.unwrap_or(state.top_k));

    let env = state
        .router
        .run(ExecMode::from(strategy), task)
        .await
        .inspect_err(|err| warn!(error = %err, "infer failed"))?;
    Ok(Json(env.into()))
}

async fn offload<B: Backend>(
    State(state): State<Arc<AppState<B>>>,
    body: Result<Json<OffloadBody>, JsonRejection>,
) -> ApiResult<InferReply> {
    let Json(body) = body.map_err(|e| ApiError(e.body_text()))?;
    let image = decode_image(&body.image_b64)?;
    let model = match body.model.as_deref() {
        Some(name) => ModelDescriptor::from_name(name),
        None => state.router.manager().current_model(),
    };
    let task = Task::new(image, model, body.topk.unwrap_or(state.top_k));

    let env = state
        .router
        .run(ExecMode::Offload, task)
        .await
        .inspect_err(|err| warn!(error = %err, "offload failed"))?;
    Ok(Json(env.into()))
}

fn decode_image(b64: &str) -> Result<Vec<u8>, ApiError> {
    STANDARD
        .decode(b64.trim())
        .map_err(|e| ApiError(format!("invalid image_b64: {e}")))
}
