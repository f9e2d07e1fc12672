use std::path::PathBuf;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::spawn;
use tracing::{error, info};
use url::Url;

use crate::{
    app_state::{AppState, Status},
    cancel::CancelSignal,
    dispatcher::DispatchReport,
    materializer::ConsumerStats,
    models::NodeKind,
    pipeline::{self, RunSummary},
    reconciler::{ReconcileReport, ReconcileScope},
    tree::TreeReport,
};

type ApiError = (StatusCode, Json<serde_json::Value>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

// --- Payloads y Respuestas de la API ---

#[derive(Deserialize)]
pub struct SelectDirPayload {
    path: String,
}

#[derive(Deserialize, Default)]
pub struct IngestPayload {
    /// Por defecto, el nombre del directorio seleccionado.
    #[serde(default)]
    project: Option<String>,
}

#[derive(Deserialize)]
pub struct TreePayload {
    project: String,
}

#[derive(Deserialize, Default)]
pub struct ReconcilePayload {
    /// `all` o un nombre de proyecto; por defecto, `RECONCILE_SCOPE`.
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Serialize)]
pub struct ProjectInfo {
    name: String,
    directories: u64,
    files: u64,
    entities: u64,
}

// --- Router ---

pub fn create_router(app_state: AppState) -> Router {
    Router::new()
        .route("/api/select-directory", post(select_directory_handler))
        .route("/api/ingest", post(ingest_handler))
        .route("/api/cancel", post(cancel_handler))
        .route("/api/tree", post(tree_handler))
        .route("/api/reconcile", post(reconcile_handler))
        .route("/api/dead-letters/replay", post(replay_dead_letters_handler))
        .route("/api/status", get(status_handler))
        .route("/api/last-run", get(last_run_handler))
        .route("/api/last-reconcile", get(last_reconcile_handler))
        .route("/api/consumers", get(consumers_handler))
        .route("/api/projects", get(projects_handler))
        .route("/api/neo4j-info", get(neo4j_info_handler))
        .route("/api/shutdown", post(shutdown_handler))
        .with_state(app_state)
}

// --- Handlers de ingesta ---

#[axum::debug_handler]
async fn select_directory_handler(
    State(state): State<AppState>,
    Json(payload): Json<SelectDirPayload>,
) -> Result<impl IntoResponse, ApiError> {
    let path = PathBuf::from(&payload.path);
    if !path.is_dir() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "La ruta proporcionada no es un directorio válido.",
        ));
    }

    *state.current_dir.lock().unwrap() = Some(path);
    Ok((StatusCode::OK, Json(json!({ "message": "Directorio fijado para la ingesta." }))))
}

#[axum::debug_handler]
async fn ingest_handler(
    State(state): State<AppState>,
    Json(payload): Json<IngestPayload>,
) -> Result<impl IntoResponse, ApiError> {
    let root_dir = match state.current_dir.lock().unwrap().clone() {
        Some(dir) => dir,
        None => {
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                "Primero debe seleccionar un directorio.",
            ));
        }
    };
    let project = payload
        .project
        .filter(|p| !p.trim().is_empty())
        .unwrap_or_else(|| pipeline::project_name_for(&root_dir));

    {
        let mut status = state.status.lock().unwrap();
        if status.is_busy {
            return Err(api_error(StatusCode::CONFLICT, "Ya hay una ingesta en curso."));
        }
        status.is_busy = true;
        status.message = format!("Iniciando ingesta de '{project}'...");
        status.progress = 0.0;
    }

    let cancel = CancelSignal::new();
    *state.run_cancel.lock().unwrap() = cancel.clone();

    spawn(async move {
        let result = pipeline::ingest_directory(
            &state.pipeline,
            &root_dir,
            &project,
            &cancel,
            &state.status,
        )
        .await;

        let mut status = state.status.lock().unwrap();
        status.is_busy = false;
        status.progress = 0.0;
        match result {
            Ok(summary) => {
                status.message = format!("¡Ingesta completada! {}", summary);
                *state.last_run.lock().unwrap() = Some(summary);
            }
            Err(err) => {
                status.message = format!("Error en la ingesta: {}", err);
                error!("Error de ingesta: {}", err);
            }
        }
    });

    Ok(StatusCode::ACCEPTED)
}

#[axum::debug_handler]
async fn cancel_handler(State(state): State<AppState>) -> impl IntoResponse {
    info!("Petición de cancelación recibida.");
    state.run_cancel.lock().unwrap().cancel();
    Status::set(&state.status, "Cancelando la ingesta en curso...", 0.0);
    StatusCode::ACCEPTED
}

// --- Handlers de estructura ---

#[axum::debug_handler]
async fn tree_handler(
    State(state): State<AppState>,
    Json(payload): Json<TreePayload>,
) -> Result<Json<TreeReport>, ApiError> {
    state
        .pipeline
        .tree_builder()
        .build(&payload.project)
        .await
        .map(Json)
        .map_err(|e| {
            error!(project = %payload.project, "Error construyendo el árbol: {}", e);
            api_error(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        })
}

#[axum::debug_handler]
async fn reconcile_handler(
    State(state): State<AppState>,
    Json(payload): Json<ReconcilePayload>,
) -> Result<Json<ReconcileReport>, ApiError> {
    let scope = payload
        .scope
        .as_deref()
        .map(ReconcileScope::parse)
        .unwrap_or_else(|| state.config.reconcile_scope.clone());

    let report = state.pipeline.reconcile(&scope).await.map_err(|e| {
        error!("Error en la reconciliación: {}", e);
        api_error(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
    })?;
    *state.last_reconcile.lock().unwrap() = Some(report);
    Ok(Json(report))
}

#[axum::debug_handler]
async fn replay_dead_letters_handler(State(state): State<AppState>) -> Json<DispatchReport> {
    let report = state.dispatcher().replay_dead_letters().await;
    info!(
        published = report.batches_published,
        dead_lettered = report.batches_dead_lettered,
        "Dead-letters re-publicadas"
    );
    Json(report)
}

// --- Handlers de consulta ---

#[axum::debug_handler]
async fn status_handler(State(state): State<AppState>) -> Json<Status> {
    let status = state.status.lock().unwrap().clone();
    Json(status)
}

#[axum::debug_handler]
async fn last_run_handler(
    State(state): State<AppState>,
) -> Result<Json<RunSummary>, StatusCode> {
    let last = state.last_run.lock().unwrap().clone();
    last.map(Json).ok_or(StatusCode::NO_CONTENT)
}

#[axum::debug_handler]
async fn last_reconcile_handler(
    State(state): State<AppState>,
) -> Result<Json<ReconcileReport>, StatusCode> {
    let last = *state.last_reconcile.lock().unwrap();
    last.map(Json).ok_or(StatusCode::NO_CONTENT)
}

#[axum::debug_handler]
async fn consumers_handler(State(state): State<AppState>) -> Json<ConsumerStats> {
    Json(state.consumers.stats())
}

#[axum::debug_handler]
async fn projects_handler(
    State(state): State<AppState>,
) -> Result<Json<Vec<ProjectInfo>>, ApiError> {
    let unavailable = |e: crate::error::StoreError| {
        error!("Error consultando proyectos: {}", e);
        api_error(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
    };

    let mut projects = Vec::new();
    for name in state.store.projects().await.map_err(unavailable)? {
        let directories = state
            .store
            .count_nodes(NodeKind::Directory, &name)
            .await
            .map_err(unavailable)?;
        let files = state
            .store
            .count_nodes(NodeKind::File, &name)
            .await
            .map_err(unavailable)?;
        let entities = state
            .store
            .count_nodes(NodeKind::Entity, &name)
            .await
            .map_err(unavailable)?;
        projects.push(ProjectInfo {
            name,
            directories,
            files,
            entities,
        });
    }
    Ok(Json(projects))
}

#[axum::debug_handler]
async fn neo4j_info_handler(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let browser_url = match Url::parse(&state.config.neo4j_uri) {
        Ok(mut url) => {
            let _ = url.set_scheme("http");
            let _ = url.set_port(Some(7474));
            url.to_string()
        }
        Err(_) => "http://localhost:7474".to_string(),
    };

    match state.store.projects().await {
        Ok(projects) => Ok(Json(json!({
            "status": "ok",
            "browser_url": browser_url,
            "projects": projects.len(),
        }))),
        Err(e) => {
            error!("Error en el health check de Neo4j: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

// --- Handler de Apagado ---

#[axum::debug_handler]
async fn shutdown_handler(State(state): State<AppState>) -> impl IntoResponse {
    info!("Petición de apagado recibida.");
    if let Some(sender) = state.shutdown_sender.lock().unwrap().take() {
        let _ = sender.send(());
    }
    StatusCode::OK
}
