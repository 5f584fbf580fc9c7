//! HTTP API over the [`Engine`].
//!
//! Every handler delegates to one engine operation; errors render through
//! [`crate::error::EngineError`]'s `IntoResponse` as `{ "error": .. }` with a mapped status.

use anyhow::Context;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;

use crate::engine::{EngineStats, IngestReceipt};
use crate::error::EngineResult;
use crate::graph::reason::Reasoning;
use crate::index::{IndexHealth, PartitionStat};
use crate::memory::types::{MemoryRecord, NewMemory};
use crate::retrieval::{RetrieveRequest, RetrieveResponse};
use crate::scheduler::Task;
use crate::Engine;

pub fn router(engine: Engine) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/stats", get(stats))
        .route("/memories", post(create_memory))
        .route("/memories/{id}", get(get_memory).delete(delete_memory))
        .route("/memories/{id}/importance", put(set_importance))
        .route("/retrieve", post(retrieve))
        .route("/entities/{id}/reason", get(reason))
        .route("/tasks/{id}", get(task_status).delete(cancel_task))
        .route("/index/health", get(index_health))
        .route("/index/rebuild", post(rebuild_index))
        .route("/partitions", get(partitions))
        .with_state(engine)
}

/// Bind, start background work, serve until Ctrl-C or SIGTERM, then shut the
/// engine down cleanly.
pub async fn serve(engine: Engine) -> anyhow::Result<()> {
    let addr = format!("{}:{}", engine.config().server.host, engine.config().server.port);
    engine.start();

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(addr = %addr, "memoria listening");

    let result = axum::serve(listener, router(engine.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await;
    engine.shutdown().await;
    result.context("server error")
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    tracing::info!("shutting down");
}

async fn health(State(engine): State<Engine>) -> Json<serde_json::Value> {
    let index = engine.index_health();
    Json(serde_json::json!({
        "name": "memoria",
        "version": env!("CARGO_PKG_VERSION"),
        "queue_depth": engine.scheduler().queue_depth(),
        "shards": index.shard_count,
        "stale_shards": index.stale_shards,
    }))
}

async fn stats(State(engine): State<Engine>) -> EngineResult<Json<EngineStats>> {
    Ok(Json(engine.stats().await?))
}

async fn create_memory(
    State(engine): State<Engine>,
    Json(new): Json<NewMemory>,
) -> EngineResult<(StatusCode, Json<IngestReceipt>)> {
    let receipt = engine.ingest(new).await?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

async fn get_memory(
    State(engine): State<Engine>,
    Path(id): Path<String>,
) -> EngineResult<Json<MemoryRecord>> {
    Ok(Json(engine.get(&id).await?))
}

async fn delete_memory(
    State(engine): State<Engine>,
    Path(id): Path<String>,
) -> EngineResult<Json<MemoryRecord>> {
    Ok(Json(engine.soft_delete(&id).await?))
}

#[derive(Debug, Deserialize)]
struct ImportanceBody {
    importance: f64,
}

async fn set_importance(
    State(engine): State<Engine>,
    Path(id): Path<String>,
    Json(body): Json<ImportanceBody>,
) -> EngineResult<Json<MemoryRecord>> {
    Ok(Json(engine.update_importance(&id, body.importance).await?))
}

async fn retrieve(
    State(engine): State<Engine>,
    Json(request): Json<RetrieveRequest>,
) -> EngineResult<Json<RetrieveResponse>> {
    Ok(Json(engine.retrieve(request).await?))
}

async fn reason(
    State(engine): State<Engine>,
    Path(id): Path<String>,
) -> EngineResult<Json<Reasoning>> {
    Ok(Json(engine.reason(&id).await?))
}

async fn task_status(
    State(engine): State<Engine>,
    Path(id): Path<String>,
) -> EngineResult<Json<Task>> {
    Ok(Json(engine.task_status(&id)?))
}

async fn cancel_task(
    State(engine): State<Engine>,
    Path(id): Path<String>,
) -> EngineResult<Json<Task>> {
    Ok(Json(engine.cancel_task(&id)?))
}

async fn index_health(State(engine): State<Engine>) -> Json<IndexHealth> {
    Json(engine.index_health())
}

async fn rebuild_index(State(engine): State<Engine>) -> EngineResult<Json<serde_json::Value>> {
    let rebuilt = engine.rebuild_index().await?;
    Ok(Json(serde_json::json!({ "rebuilt_shards": rebuilt })))
}

async fn partitions(State(engine): State<Engine>) -> EngineResult<Json<Vec<PartitionStat>>> {
    Ok(Json(engine.partition_stats().await?))
}
