//! API route definitions.

use std::collections::BTreeMap;
use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::routing::get;
use axum::{Json, Router};
use futures::stream::{self, Stream};
use serde::Deserialize;
use serde_json::{json, Value};

use super::error::ApiError;
use super::state::AppState;
use crate::runner::RunOptions;
use crate::storage::{CasePatch, NewTestCase};
use crate::stream::StreamEvent;

type ApiResult<T> = Result<T, ApiError>;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/cases", get(list_cases).post(create_case))
        .route(
            "/cases/{id}",
            get(get_case).put(update_case).delete(delete_case),
        )
        .route("/runs", get(list_runs).post(start_run))
        .route("/runs/{id}", get(get_run))
        .route("/runs/{id}/stream", get(stream_run))
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": {
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

// ---------------------------------------------------------------------------
// Cases
// ---------------------------------------------------------------------------

async fn list_cases(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let cases = state.cases.blocking(|cases| cases.list()).await?;
    Ok(Json(json!({ "data": cases, "meta": { "total": cases.len() } })))
}

async fn create_case(
    State(state): State<AppState>,
    Json(new): Json<NewTestCase>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    if new.name.trim().is_empty() {
        return Err(ApiError::BadRequest("name must not be empty".to_string()));
    }
    if new.command.spec.trim().is_empty() {
        return Err(ApiError::BadRequest("command.spec must not be empty".to_string()));
    }

    let case = state.cases.blocking(move |cases| cases.create(new)).await?;
    Ok((StatusCode::CREATED, Json(json!({ "data": case }))))
}

async fn get_case(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    let case = state
        .cases
        .blocking({
            let id = id.clone();
            move |cases| cases.get(&id)
        })
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("test case '{id}' not found")))?;
    Ok(Json(json!({ "data": case })))
}

async fn update_case(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<CasePatch>,
) -> ApiResult<Json<Value>> {
    let case = state
        .cases
        .blocking(move |cases| cases.update(&id, patch))
        .await?;
    Ok(Json(json!({ "data": case })))
}

async fn delete_case(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    state
        .cases
        .blocking({
            let id = id.clone();
            move |cases| cases.delete(&id)
        })
        .await?;
    Ok(Json(json!({ "data": { "deleted": id } })))
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartRunRequest {
    test_case_id: String,
    #[serde(default = "default_headed")]
    headed: bool,
    #[serde(default)]
    env: BTreeMap<String, String>,
}

fn default_headed() -> bool {
    true
}

async fn list_runs(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let runs = state.runs.blocking(|runs| runs.list()).await?;
    Ok(Json(json!({ "data": runs, "meta": { "total": runs.len() } })))
}

async fn get_run(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    let run = state
        .runs
        .blocking({
            let id = id.clone();
            move |runs| runs.get(&id)
        })
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("run '{id}' not found")))?;
    Ok(Json(json!({ "data": run })))
}

async fn start_run(
    State(state): State<AppState>,
    Json(req): Json<StartRunRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let options = RunOptions {
        headed: req.headed,
        env: req.env,
    };
    // The supervisor task is detached; the run outlives this request.
    let (ticket, _completion) = state.launcher.start_run(&req.test_case_id, options).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "data": ticket }))))
}

/// Server-sent events for one run. Lines go out as unnamed events; status
/// heartbeats, completion and errors use the `status`, `done` and `error`
/// event names.
async fn stream_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.publisher.subscribe(id);
    let events = stream::unfold(rx, |mut rx| async move {
        let event = rx.recv().await?;
        Some((Ok(to_sse(&event)), rx))
    });
    Sse::new(events)
}

fn to_sse(event: &StreamEvent) -> Event {
    let (name, data) = match event {
        StreamEvent::Line { line } => (None, json!({ "line": line })),
        StreamEvent::Status { status, exit_code } => (
            Some("status"),
            json!({ "status": status, "exitCode": exit_code }),
        ),
        StreamEvent::Done { run } => (Some("done"), json!(run)),
        StreamEvent::Error { error } => (Some("error"), json!({ "error": error })),
    };

    let sse = Event::default().data(data.to_string());
    match name {
        Some(name) => sse.event(name),
        None => sse,
    }
}
