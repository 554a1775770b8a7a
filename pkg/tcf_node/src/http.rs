use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tcf_consensus::{AppendEntriesRequest, AppendEntriesResponse, ConsensusNode, RequestVoteRequest, RequestVoteResponse};
use tcf_kv::{ErrorBody, Fsm, KvError, KvStore};

use crate::transport::HttpTransport;

/// Shared state for the KV REST surface. Grounded on
/// `examples/original_source/rafty/http/service.go`'s `Service` (one store,
/// routed through `gorilla/mux`) translated onto `axum::Router` + `State`.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<KvStore<HttpTransport>>,
}

/// Lets [`KvError`] convert directly into an `axum` response at the
/// handler boundary: component errors flow up unchanged until this
/// boundary, where they are formatted into the external JSON schema.
struct ApiError(KvError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorBody::from(&self.0);
        (status, Json(body)).into_response()
    }
}

impl From<KvError> for ApiError {
    fn from(err: KvError) -> Self {
        Self(err)
    }
}

#[derive(Debug, Deserialize)]
struct CreateOrUpdateForm {
    value: String,
    #[serde(default)]
    ttl: i64,
}

#[derive(Debug, Deserialize)]
struct SetAddForm {
    value: String,
}

#[derive(Debug, Deserialize)]
struct LPushForm {
    /// JSON-encoded array of strings to push.
    value: String,
}

#[derive(Debug, Deserialize)]
struct LRemForm {
    value: String,
    count: i64,
}

#[derive(Debug, Deserialize)]
struct ZAddForm {
    value: String,
    score: f64,
}

#[derive(Debug, Deserialize)]
struct ZRemRangeForm {
    min: f64,
    max: f64,
}

#[derive(Debug, Serialize)]
struct LeaderResponse {
    is_leader: bool,
    leader_is: String,
}

#[derive(Debug, Deserialize)]
struct AddrBody {
    addr: String,
}

async fn get_leader(State(state): State<AppState>) -> impl IntoResponse {
    let is_leader = state.store.is_leader().await;
    let leader_is = state.store.leader().await.unwrap_or_default();
    Json(LeaderResponse { is_leader, leader_is })
}

async fn post_join(State(state): State<AppState>, Json(body): Json<AddrBody>) -> Result<StatusCode, ApiError> {
    state.store.cluster().join(body.addr).await.map_err(ApiError)?;
    Ok(StatusCode::OK)
}

async fn post_remove(State(state): State<AppState>, Json(body): Json<AddrBody>) -> Result<StatusCode, ApiError> {
    state.store.cluster().remove_peer(&body.addr).await.map_err(ApiError)?;
    Ok(StatusCode::OK)
}

async fn post_setpeers(State(state): State<AppState>, Json(peers): Json<Vec<String>>) -> Result<StatusCode, ApiError> {
    state.store.cluster().set_peers(peers).await.map_err(ApiError)?;
    Ok(StatusCode::OK)
}

async fn get_key(State(state): State<AppState>, Path(name): Path<String>) -> Result<Response, ApiError> {
    let resp = state.store.get_key(&name).map_err(ApiError)?;
    Ok((StatusCode::OK, Json(resp)).into_response())
}

async fn create_key(
    State(state): State<AppState>,
    Path(name): Path<String>,
    axum::Form(form): axum::Form<CreateOrUpdateForm>,
) -> Result<Response, ApiError> {
    let resp = state.store.create_key(&name, &form.value, form.ttl).await.map_err(ApiError)?;
    Ok((StatusCode::CREATED, Json(resp)).into_response())
}

async fn update_key(
    State(state): State<AppState>,
    Path(name): Path<String>,
    axum::Form(form): axum::Form<CreateOrUpdateForm>,
) -> Result<Response, ApiError> {
    let resp = state.store.update_key(&name, &form.value, form.ttl).await.map_err(ApiError)?;
    Ok((StatusCode::OK, Json(resp)).into_response())
}

async fn delete_key(State(state): State<AppState>, Path(name): Path<String>) -> Result<Response, ApiError> {
    let resp = state.store.delete_key(&name).await.map_err(ApiError)?;
    Ok((StatusCode::OK, Json(resp)).into_response())
}

async fn sadd(
    State(state): State<AppState>,
    Path(name): Path<String>,
    axum::Form(form): axum::Form<SetAddForm>,
) -> Result<Response, ApiError> {
    let resp = state.store.add_to_set(&name, &form.value).await.map_err(ApiError)?;
    Ok((StatusCode::OK, Json(resp)).into_response())
}

async fn lpush(
    State(state): State<AppState>,
    Path(name): Path<String>,
    axum::Form(form): axum::Form<LPushForm>,
) -> Result<Response, ApiError> {
    let values: Vec<String> = serde_json::from_str(&form.value)
        .map_err(|e| ApiError(KvError::DecodeError(e.to_string())))?;
    let resp = state.store.lpush(&name, values).await.map_err(ApiError)?;
    Ok((StatusCode::OK, Json(resp)).into_response())
}

async fn lrem(
    State(state): State<AppState>,
    Path(name): Path<String>,
    axum::Form(form): axum::Form<LRemForm>,
) -> Result<Response, ApiError> {
    let resp = state.store.lrem(&name, form.count, &form.value).await.map_err(ApiError)?;
    Ok((StatusCode::OK, Json(resp)).into_response())
}

async fn zadd(
    State(state): State<AppState>,
    Path(name): Path<String>,
    axum::Form(form): axum::Form<ZAddForm>,
) -> Result<Response, ApiError> {
    let resp = state.store.zadd(&name, form.score, &form.value).await.map_err(ApiError)?;
    Ok((StatusCode::OK, Json(resp)).into_response())
}

async fn zremrangebyscore(
    State(state): State<AppState>,
    Path(name): Path<String>,
    axum::Form(form): axum::Form<ZRemRangeForm>,
) -> Result<Response, ApiError> {
    let resp = state.store.zrem_range_by_score(&name, form.min, form.max).await.map_err(ApiError)?;
    Ok((StatusCode::OK, Json(resp)).into_response())
}

/// The KV REST surface, served on a node's derived HTTP address (consensus
/// port minus 100).
pub fn kv_router(state: AppState) -> Router {
    Router::new()
        .route("/leader", get(get_leader))
        .route("/join", post(post_join))
        .route("/remove", post(post_remove))
        .route("/setpeers", post(post_setpeers))
        .route("/key/{name}", get(get_key).post(create_key).put(update_key).delete(delete_key))
        .route("/key/sadd/{name}", put(sadd))
        .route("/key/lpush/{name}", put(lpush))
        .route("/key/lrem/{name}", delete(lrem))
        .route("/key/zadd/{name}", put(zadd))
        .route("/key/zremrangebyscore/{name}", put(zremrangebyscore))
        .with_state(state)
}

async fn raft_request_vote(
    State(node): State<Arc<ConsensusNode<HttpTransport, Fsm>>>,
    Json(request): Json<RequestVoteRequest>,
) -> Json<RequestVoteResponse> {
    Json(node.handle_request_vote(request).await)
}

async fn raft_append_entries(
    State(node): State<Arc<ConsensusNode<HttpTransport, Fsm>>>,
    Json(request): Json<AppendEntriesRequest>,
) -> Json<AppendEntriesResponse> {
    Json(node.handle_append_entries(request).await)
}

/// Internal consensus RPC surface, served on a node's raft bind address:
/// plain HTTP carrying the `tcf_consensus::Transport` RPCs.
pub fn consensus_router(node: Arc<ConsensusNode<HttpTransport, Fsm>>) -> Router {
    Router::new()
        .route("/raft/request-vote", post(raft_request_vote))
        .route("/raft/append-entries", post(raft_append_entries))
        .with_state(node)
}
