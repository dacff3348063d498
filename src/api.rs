use axum::{
    extract::{rejection::JsonRejection, Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    agents::AgentResult,
    app_state::AppState,
    error::{AgentError, OrchestratorError},
    ingest::IngestionSummary,
    intent::Intent,
    models::{ColumnType, EntityKind},
    orchestrator::{AgentInfo, OrchestratorMetrics},
    taxonomy::TaxonomyStats,
};

type ApiError = (StatusCode, Json<serde_json::Value>);

// --- Payloads y Respuestas de la API ---

#[derive(Deserialize)]
pub struct ChatPayload {
    query: String,
    #[serde(default)]
    context: Option<serde_json::Value>,
}

#[derive(Serialize)]
pub struct ChatResponse {
    success: bool,
    result: AgentResult,
    answer: String,
    request_id: Uuid,
    intent: Intent,
    confidence: f64,
}

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    agents: Vec<AgentInfo>,
    in_flight: usize,
    metrics: OrchestratorMetrics,
    success_rate: f64,
    average_response_time_ms: f64,
    taxonomy: TaxonomyStats,
    ingestion: IngestionSummary,
}

#[derive(Serialize)]
pub struct ColumnInfo {
    name: String,
    #[serde(rename = "type")]
    column_type: ColumnType,
    nullable: bool,
}

#[derive(Serialize)]
pub struct TableInfo {
    name: String,
    records: usize,
    columns: Vec<ColumnInfo>,
}

#[derive(Serialize)]
pub struct DataSourceInfo {
    name: String,
    path: String,
    tables: Vec<TableInfo>,
}

#[derive(Serialize)]
pub struct EntityInfo {
    kind: EntityKind,
    canonical_form: String,
    name: String,
    aliases: Vec<String>,
}

// --- Router ---

pub fn create_router(app_state: AppState) -> Router {
    Router::new()
        .route("/chat", post(chat_handler))
        .route("/api/chat", post(chat_handler))
        .route("/health", get(health_handler))
        .route("/api/status", get(health_handler))
        .route("/api/data-sources", get(data_sources_handler))
        .route("/api/entities", get(list_entities_handler))
        .route("/api/shutdown", post(shutdown_handler))
        .with_state(app_state)
}

// --- Handlers ---

fn error_body(status: StatusCode, message: impl Into<String>, code: &str) -> ApiError {
    (status, Json(json!({"error": message.into(), "code": code})))
}

fn step_status(source: &AgentError) -> StatusCode {
    match source {
        AgentError::UnsupportedAction { .. } => StatusCode::BAD_REQUEST,
        AgentError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        AgentError::MissingParameter(_) | AgentError::Execution(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn orchestrator_error(err: OrchestratorError) -> ApiError {
    let code = err.code();
    match &err {
        OrchestratorError::EmptyQuery => error_body(StatusCode::BAD_REQUEST, err.to_string(), code),
        OrchestratorError::ShuttingDown => error_body(StatusCode::SERVICE_UNAVAILABLE, err.to_string(), code),
        OrchestratorError::MalformedPlan(_) => {
            error_body(StatusCode::INTERNAL_SERVER_ERROR, err.to_string(), code)
        }
        OrchestratorError::StepFailed { result, source, .. } => (
            step_status(source),
            Json(json!({
                "error": err.to_string(),
                "code": code,
                "result": result,
            })),
        ),
    }
}

#[axum::debug_handler]
async fn chat_handler(
    State(state): State<AppState>,
    payload: Result<Json<ChatPayload>, JsonRejection>,
) -> Result<Json<ChatResponse>, ApiError> {
    let Json(payload) = payload.map_err(|rejection| {
        warn!("Cuerpo de la petición inválido: {}", rejection.body_text());
        error_body(
            StatusCode::BAD_REQUEST,
            format!("Cuerpo de la petición inválido: {}", rejection.body_text()),
            "INVALID_REQUEST",
        )
    })?;
    if !state.is_accepting() {
        return Err(orchestrator_error(OrchestratorError::ShuttingDown));
    }

    match state.orchestrator.handle(&payload.query, payload.context).await {
        Ok(outcome) => Ok(Json(ChatResponse {
            success: true,
            result: outcome.result,
            answer: outcome.answer,
            request_id: outcome.request_id,
            intent: outcome.intent,
            confidence: outcome.confidence,
        })),
        Err(err) => {
            warn!("Consulta fallida: {}", err);
            Err(orchestrator_error(err))
        }
    }
}

#[axum::debug_handler]
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let status = state.orchestrator.status();
    Json(HealthResponse {
        status: if state.is_accepting() { "ok" } else { "shutting_down" },
        agents: status.agents,
        in_flight: status.in_flight,
        average_response_time_ms: status.metrics.average_response_time_ms,
        metrics: status.metrics,
        success_rate: status.success_rate,
        taxonomy: state.taxonomy.stats(),
        ingestion: state.corpus.summary.clone(),
    })
}

#[axum::debug_handler]
async fn data_sources_handler(State(state): State<AppState>) -> Json<Vec<DataSourceInfo>> {
    let sources = state
        .corpus
        .sources
        .iter()
        .map(|source| DataSourceInfo {
            name: source.name.clone(),
            path: source.path.to_string_lossy().to_string(),
            tables: source
                .tables
                .iter()
                .map(|table| TableInfo {
                    name: table.name.clone(),
                    records: table.rows.len(),
                    columns: state
                        .corpus
                        .schema(&table.name)
                        .map(|schema| {
                            schema
                                .columns
                                .iter()
                                .map(|p| ColumnInfo {
                                    name: p.name.clone(),
                                    column_type: p.column_type,
                                    nullable: p.nullable,
                                })
                                .collect()
                        })
                        .unwrap_or_default(),
                })
                .collect(),
        })
        .collect();
    Json(sources)
}

#[axum::debug_handler]
async fn list_entities_handler(State(state): State<AppState>) -> Json<Vec<EntityInfo>> {
    let entities = state
        .taxonomy
        .entities
        .values()
        .map(|e| EntityInfo {
            kind: e.kind,
            canonical_form: e.canonical_form.clone(),
            name: e.name.clone(),
            aliases: e.aliases.clone(),
        })
        .collect();
    Json(entities)
}

// --- Handler de Apagado ---

#[axum::debug_handler]
async fn shutdown_handler(State(state): State<AppState>) -> impl IntoResponse {
    info!("Petición de apagado recibida.");
    state.begin_shutdown();
    (StatusCode::OK, Json(json!({ "message": "Apagado en curso." })))
}
