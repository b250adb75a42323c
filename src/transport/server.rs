//! HTTP routes
//!
//! - `/internal/...`: bincode RPCs between nodes
//! - `/write`, `/query`, `/databases`, `/ping`: JSON for clients

use crate::common::{parse_duration, Error, Result, RpcError};
use crate::metadata::{ShardSpace, DEFAULT_SPACE};
use crate::raft::{AppendRequest, InstallSnapshotRequest, ProposeRequest, VoteRequest};
use crate::router::{QueryRequest, WriteRequest};
use crate::storage::{FieldValue, Fields, SeriesPoint};
use crate::transport::handler::RpcHandler;
use crate::transport::{JoinRequest, ShardScanRequest, ShardWriteRequest};
use crate::transport::http::{
    BINCODE_CONTENT_TYPE, PATH_APPEND, PATH_JOIN, PATH_PROPOSE, PATH_SHARD_SCAN, PATH_SHARD_WRITE,
    PATH_SNAPSHOT, PATH_VOTE,
};
use axum::{
    body::Bytes,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;

/// Largest accepted request body
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

fn bincode_reply<T: Serialize>(result: Result<T>) -> Response {
    let reply: std::result::Result<T, RpcError> = result.map_err(|e| RpcError::from(&e));
    match bincode::serialize(&reply) {
        Ok(body) => ([(header::CONTENT_TYPE, BINCODE_CONTENT_TYPE)], body).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

fn decode<T: DeserializeOwned>(body: &Bytes) -> Result<T> {
    bincode::deserialize(body).map_err(|e| Error::InvalidRequest(format!("bad rpc body: {}", e)))
}

async fn rpc<Req, Resp, F, Fut>(handler: RpcHandler, body: Bytes, f: F) -> Response
where
    Req: DeserializeOwned,
    Resp: Serialize,
    F: FnOnce(RpcHandler, Req) -> Fut,
    Fut: Future<Output = Result<Resp>>,
{
    match decode::<Req>(&body) {
        Ok(request) => bincode_reply(f(handler, request).await),
        Err(e) => bincode_reply::<Resp>(Err(e)),
    }
}

async fn vote(State(h): State<RpcHandler>, body: Bytes) -> Response {
    rpc(h, body, |h, req: VoteRequest| async move { h.request_vote(req) }).await
}

async fn append(State(h): State<RpcHandler>, body: Bytes) -> Response {
    rpc(h, body, |h, req: AppendRequest| async move { h.append_entries(req) }).await
}

async fn snapshot(State(h): State<RpcHandler>, body: Bytes) -> Response {
    rpc(h, body, |h, req: InstallSnapshotRequest| async move {
        h.install_snapshot(req)
    })
    .await
}

async fn propose(State(h): State<RpcHandler>, body: Bytes) -> Response {
    rpc(h, body, |h, req: ProposeRequest| async move { h.propose(req).await }).await
}

async fn join(State(h): State<RpcHandler>, body: Bytes) -> Response {
    rpc(h, body, |h, req: JoinRequest| async move { h.join(req).await }).await
}

async fn shard_write(State(h): State<RpcHandler>, body: Bytes) -> Response {
    rpc(h, body, |h, req: ShardWriteRequest| async move {
        h.shard_write(req).await
    })
    .await
}

async fn shard_scan(State(h): State<RpcHandler>, body: Bytes) -> Response {
    rpc(h, body, |h, req: ShardScanRequest| async move {
        h.shard_scan(req).await
    })
    .await
}

/// Routes peers call
pub fn internal_routes(handler: RpcHandler) -> Router {
    Router::new()
        .route(PATH_VOTE, post(vote))
        .route(PATH_APPEND, post(append))
        .route(PATH_SNAPSHOT, post(snapshot))
        .route(PATH_PROPOSE, post(propose))
        .route(PATH_JOIN, post(join))
        .route(PATH_SHARD_WRITE, post(shard_write))
        .route(PATH_SHARD_SCAN, post(shard_scan))
        .with_state(handler)
}

// ============================================================================
// Client endpoints
// ============================================================================

fn json_error(e: Error) -> Response {
    (e.to_http_status(), Json(json!({ "error": e.to_string() }))).into_response()
}

#[derive(Debug, Deserialize)]
struct JsonPoint {
    series: String,
    timestamp: i64,
    fields: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct JsonWrite {
    database: String,
    points: Vec<JsonPoint>,
}

impl JsonPoint {
    fn into_point(self) -> Result<SeriesPoint> {
        let mut fields = Fields::new();
        for (name, value) in &self.fields {
            let value = FieldValue::from_json(value).ok_or_else(|| {
                Error::InvalidRequest(format!("field {} must be a scalar", name))
            })?;
            fields.insert(name.clone(), value);
        }
        Ok(SeriesPoint::new(self.series, self.timestamp, fields))
    }
}

fn point_json(point: &SeriesPoint) -> serde_json::Value {
    let fields: serde_json::Map<String, serde_json::Value> = point
        .fields
        .iter()
        .map(|(k, v)| (k.clone(), v.to_json()))
        .collect();
    json!({ "timestamp": point.timestamp, "fields": fields })
}

async fn client_write(State(h): State<RpcHandler>, Json(body): Json<JsonWrite>) -> Response {
    let points = match body
        .points
        .into_iter()
        .map(JsonPoint::into_point)
        .collect::<Result<Vec<_>>>()
    {
        Ok(points) => points,
        Err(e) => return json_error(e),
    };
    let request = WriteRequest {
        database: body.database,
        points,
    };
    match h.router().write(request).await {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => json_error(e),
    }
}

async fn client_query(State(h): State<RpcHandler>, Json(request): Json<QueryRequest>) -> Response {
    match h.router().query(request).await {
        Ok(response) => {
            let series: serde_json::Map<String, serde_json::Value> = response
                .series
                .iter()
                .map(|(name, points)| {
                    (
                        name.clone(),
                        serde_json::Value::Array(points.iter().map(point_json).collect()),
                    )
                })
                .collect();
            Json(json!({ "series": series })).into_response()
        }
        Err(e) => json_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct CreateDatabase {
    name: String,
    /// e.g. "1h", "7d"
    shard_duration: String,
    #[serde(default = "default_replication")]
    replication_factor: usize,
    #[serde(default)]
    retention: Option<String>,
}

fn default_replication() -> usize {
    1
}

async fn create_database(State(h): State<RpcHandler>, Json(body): Json<CreateDatabase>) -> Response {
    let space = match parse_duration(&body.shard_duration) {
        Ok(duration) => ShardSpace::new(DEFAULT_SPACE, duration, body.replication_factor),
        Err(e) => return json_error(e),
    };
    let space = match body.retention.as_deref().map(parse_duration).transpose() {
        Ok(Some(retention)) => space.with_retention(retention),
        Ok(None) => space,
        Err(e) => return json_error(e),
    };
    match h.meta().create_database(&body.name, space).await {
        Ok(committed) => (
            StatusCode::CREATED,
            Json(json!({ "database": body.name, "index": committed.index })),
        )
            .into_response(),
        Err(e) => json_error(e),
    }
}

async fn ping(State(h): State<RpcHandler>) -> Response {
    let status = h.raft().status();
    Json(json!({
        "node_id": status.id,
        "role": status.role.to_string(),
        "term": status.term,
        "leader": status.leader,
        "commit_index": status.commit_index,
        "version": crate::VERSION,
    }))
    .into_response()
}

/// Routes clients call
pub fn client_routes(handler: RpcHandler) -> Router {
    Router::new()
        .route("/write", post(client_write))
        .route("/query", post(client_query))
        .route("/databases", post(create_database))
        .route("/ping", get(ping))
        .with_state(handler)
}

/// Everything a node serves, with tracing and a body limit
pub fn app(handler: RpcHandler) -> Router {
    let layers = tower::ServiceBuilder::new()
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::limit::RequestBodyLimitLayer::new(MAX_BODY_BYTES));
    internal_routes(handler.clone())
        .merge(client_routes(handler))
        .layer(axum::extract::DefaultBodyLimit::disable())
        .layer(layers)
}
