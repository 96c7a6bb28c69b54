use std::{collections::HashMap, sync::Arc};

use axum::{
    Extension, Json, Router,
    extract::{Path, Query},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};

use crate::{
    config::HTTP_PORT,
    engine::{CommitEngine, SetupJobRequest, TaskPartition},
    errors::{ErrorCodes, Errors},
    ledger::LoadMetadataDetails,
};

pub fn router(engine: Arc<CommitEngine>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/tables", get(list_tables))
        .route(
            "/tables/{table}",
            get(get_table).post(create_table).delete(delete_table),
        )
        .route("/tables/{table}/status", get(table_status))
        .route("/tables/{table}/jobs", post(setup_job))
        .route("/jobs/{job}/tasks/{task}", post(write_task))
        .route("/jobs/{job}/commit", post(commit_job))
        .route("/jobs/{job}/abort", post(abort_job))
        .route("/transactions/{tx}/commit", post(commit_transaction))
        .route("/transactions/{tx}/rollback", post(rollback_transaction))
        .layer(Extension(engine))
}

pub async fn run_server(engine: Arc<CommitEngine>) -> std::io::Result<()> {
    let app = router(engine);

    let addr = format!("0.0.0.0:{}", *HTTP_PORT);

    log::info!("HTTP Server is running on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}

fn status_code(code: ErrorCodes) -> StatusCode {
    match code {
        ErrorCodes::TableNotFound | ErrorCodes::JobNotFound | ErrorCodes::TransactionNotFound => {
            StatusCode::NOT_FOUND
        }
        ErrorCodes::TableNameIsEmpty
        | ErrorCodes::TableNameTooLong
        | ErrorCodes::TableNameIsInvalid
        | ErrorCodes::SegmentIdIsInvalid
        | ErrorCodes::PartitionIsInvalid
        | ErrorCodes::TaskIdIsInvalid => StatusCode::BAD_REQUEST,
        ErrorCodes::TableAlreadyExists
        | ErrorCodes::LockTimeout
        | ErrorCodes::InvalidJobState
        | ErrorCodes::InvalidTransactionState
        | ErrorCodes::CommitIntegrityError => StatusCode::CONFLICT,
        ErrorCodes::PreStatusUpdateRejected => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: Errors) -> Response {
    let status = status_code(error.code);
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        log::error!("Request failed: {}", error);
    }

    (status, error.to_string()).into_response()
}

fn json_response<T: serde::Serialize>(value: &T) -> Response {
    match serde_json::to_string(value) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode response: {}", e),
        )
            .into_response(),
    }
}

#[derive(serde::Serialize)]
pub struct MessageResponse {
    pub message: String,
}

fn message_response(message: String) -> Response {
    json_response(&MessageResponse { message })
}

async fn root() -> &'static str {
    "OK"
}

#[derive(serde::Serialize)]
pub struct ListTablesResponse {
    pub tables: Vec<ListTablesResponseItem>,
}

#[derive(serde::Serialize)]
pub struct ListTablesResponseItem {
    pub table_name: String,
}

async fn list_tables(Extension(engine): Extension<Arc<CommitEngine>>) -> impl IntoResponse {
    match engine.list_tables().await {
        Ok(tables) => json_response(&ListTablesResponse {
            tables: tables
                .into_iter()
                .map(|table_name| ListTablesResponseItem { table_name })
                .collect(),
        }),
        Err(e) => error_response(e),
    }
}

#[derive(serde::Serialize)]
pub struct GetTableResponse {
    pub table_name: String,
    pub partition_columns: Vec<String>,
}

async fn get_table(
    Extension(engine): Extension<Arc<CommitEngine>>,
    Path(table): Path<String>,
) -> impl IntoResponse {
    match engine.get_table(&table).await {
        Ok(info) => json_response(&GetTableResponse {
            table_name: info.name,
            partition_columns: info.partition_columns,
        }),
        Err(e) => error_response(e),
    }
}

#[derive(serde::Deserialize)]
pub struct CreateTableRequest {
    #[serde(default)]
    pub partition_columns: Vec<String>,
}

async fn create_table(
    Extension(engine): Extension<Arc<CommitEngine>>,
    Path(table): Path<String>,
    Json(req): Json<CreateTableRequest>,
) -> impl IntoResponse {
    match engine.create_table(&table, req.partition_columns).await {
        Ok(_) => message_response(format!("Table '{}' created successfully", table)),
        Err(e) => error_response(e),
    }
}

async fn delete_table(
    Extension(engine): Extension<Arc<CommitEngine>>,
    Path(table): Path<String>,
) -> impl IntoResponse {
    match engine.delete_table(&table).await {
        Ok(_) => message_response(format!("Table '{}' deleted successfully", table)),
        Err(e) => error_response(e),
    }
}

#[derive(serde::Serialize)]
pub struct TableStatusResponse {
    pub table_name: String,
    pub segments: Vec<LoadMetadataDetails>,
}

async fn table_status(
    Extension(engine): Extension<Arc<CommitEngine>>,
    Path(table): Path<String>,
) -> impl IntoResponse {
    match engine.table_status(&table).await {
        Ok(segments) => json_response(&TableStatusResponse {
            table_name: table,
            segments,
        }),
        Err(e) => error_response(e),
    }
}

async fn setup_job(
    Extension(engine): Extension<Arc<CommitEngine>>,
    Path(table): Path<String>,
    Json(req): Json<SetupJobRequest>,
) -> impl IntoResponse {
    match engine.setup_job(&table, req).await {
        Ok(summary) => json_response(&summary),
        Err(e) => error_response(e),
    }
}

#[derive(serde::Deserialize)]
pub struct WriteTaskRequest {
    pub partitions: Vec<TaskPartition>,
}

#[derive(serde::Serialize)]
pub struct WriteTaskResponse {
    pub files: Vec<String>,
}

async fn write_task(
    Extension(engine): Extension<Arc<CommitEngine>>,
    Path((job, task)): Path<(String, String)>,
    Json(req): Json<WriteTaskRequest>,
) -> impl IntoResponse {
    match engine.write_task(&job, &task, req.partitions).await {
        Ok(files) => json_response(&WriteTaskResponse { files }),
        Err(e) => error_response(e),
    }
}

async fn commit_job(
    Extension(engine): Extension<Arc<CommitEngine>>,
    Path(job): Path<String>,
) -> impl IntoResponse {
    match engine.commit_job(&job).await {
        Ok(outcome) => json_response(&outcome),
        Err(e) => error_response(e),
    }
}

async fn abort_job(
    Extension(engine): Extension<Arc<CommitEngine>>,
    Path(job): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let reason = params
        .get("reason")
        .map(String::as_str)
        .unwrap_or("aborted by client");

    match engine.abort_job(&job, reason).await {
        Ok(_) => message_response(format!("Job '{}' aborted", job)),
        Err(e) => error_response(e),
    }
}

async fn commit_transaction(
    Extension(engine): Extension<Arc<CommitEngine>>,
    Path(tx): Path<String>,
) -> impl IntoResponse {
    match engine.commit_transaction(&tx).await {
        Ok(_) => message_response(format!("Transaction '{}' committed", tx)),
        Err(e) => error_response(e),
    }
}

async fn rollback_transaction(
    Extension(engine): Extension<Arc<CommitEngine>>,
    Path(tx): Path<String>,
) -> impl IntoResponse {
    match engine.rollback_transaction(&tx).await {
        Ok(_) => message_response(format!("Transaction '{}' rolled back", tx)),
        Err(e) => error_response(e),
    }
}
