//! HTTP surface for ragchat.
//!
//! This module exposes a compact Axum router with three endpoints:
//!
//! - `POST /upload-pdf` – Accept a multipart PDF upload, stage it under a scratch name,
//!   hand it to the pipeline service for ingestion, and return the minted `doc_id`.
//!   The scratch file is removed whether ingestion succeeds or fails.
//! - `POST /chat` – Answer a question about a previously ingested document. Prior turns
//!   are flattened into a single prompt, the chain is invoked, and the exchange is
//!   appended to the interaction journal on a best-effort basis.
//! - `GET /metrics` – Observe ingestion and chat counters.
//!
//! The router carries a permissive CORS layer so browser frontends on any origin can
//! reach the API directly.

use crate::config::get_config;
use crate::journal::InteractionJournal;
use crate::metrics::{GatewayMetrics, MetricsSnapshot};
use crate::pipeline::{PipelineError, QaChain, RagPipeline, SourceDocument};
use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

/// Uploads larger than this are rejected before the handler runs.
const MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

/// Characters of source text carried into a response snippet.
const SNIPPET_CHARS: usize = 200;

/// Shared state handed to every handler.
pub struct AppState<P> {
    /// Collaborator boundary used for ingestion and question answering.
    pub pipeline: P,
    /// Journal appended to after each answered question.
    pub journal: InteractionJournal,
    /// Request counters served at `/metrics`.
    pub metrics: GatewayMetrics,
}

impl<P> AppState<P> {
    /// Build state around the given pipeline, with the journal placed per configuration.
    pub fn new(pipeline: P) -> Self {
        Self {
            pipeline,
            journal: InteractionJournal::new(get_config().conversations_file()),
            metrics: GatewayMetrics::new(),
        }
    }
}

/// Build the HTTP router exposing the gateway API surface.
pub fn create_router<P>(state: Arc<AppState<P>>) -> Router
where
    P: RagPipeline + 'static,
{
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/upload-pdf", post(upload_pdf::<P>))
        .route("/chat", post(chat_with_doc::<P>))
        .route("/metrics", get(get_metrics::<P>))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(cors)
        .with_state(state)
}

/// Success response for the `POST /upload-pdf` endpoint.
#[derive(Serialize)]
struct UploadResponse {
    /// Opaque document identifier minted by the pipeline.
    doc_id: String,
    /// Fixed confirmation message.
    message: &'static str,
}

/// Upload and ingest a PDF.
///
/// The declared content type of the `file` part must be exactly `application/pdf`; the
/// client-supplied filename is logged as metadata but never used as a filesystem path.
/// The staged bytes live under a UUID name until the pipeline call returns, then the
/// scratch file is removed regardless of the outcome.
async fn upload_pdf<P>(
    State(state): State<Arc<AppState<P>>>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError>
where
    P: RagPipeline,
{
    let mut upload: Option<(Option<String>, Bytes)> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::BadRequest(format!("Failed to read multipart field: {err}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        if field.content_type() != Some("application/pdf") {
            return Err(AppError::BadRequest("File must be a PDF.".into()));
        }
        let original_name = field.file_name().map(str::to_string);
        let bytes = field
            .bytes()
            .await
            .map_err(|err| AppError::BadRequest(format!("Failed to read file contents: {err}")))?;
        upload = Some((original_name, bytes));
    }

    let Some((original_name, bytes)) = upload else {
        return Err(AppError::BadRequest("No file uploaded.".into()));
    };
    if bytes.is_empty() {
        return Err(AppError::BadRequest("No file uploaded.".into()));
    }

    let config = get_config();
    tokio::fs::create_dir_all(&config.upload_dir).await?;
    let scratch_path = config.upload_dir.join(format!("{}.pdf", Uuid::new_v4()));
    tokio::fs::write(&scratch_path, &bytes).await?;
    tracing::info!(
        scratch = %scratch_path.display(),
        original = original_name.as_deref().unwrap_or("unknown"),
        size = bytes.len(),
        "Staged upload for ingestion"
    );

    let outcome = state.pipeline.ingest_pdf(&scratch_path).await;
    if let Err(err) = tokio::fs::remove_file(&scratch_path).await {
        tracing::warn!(
            scratch = %scratch_path.display(),
            error = %err,
            "Failed to remove scratch file"
        );
    }
    let doc_id = outcome?;

    state.metrics.record_ingest();
    tracing::info!(doc_id = %doc_id, "PDF ingested");
    Ok(Json(UploadResponse {
        doc_id,
        message: "PDF processed successfully",
    }))
}

/// One prior turn of the conversation.
#[derive(Debug, Clone, Deserialize)]
struct ChatMessage {
    /// `"user"` for turns authored by the asker; any other value renders as the assistant.
    role: String,
    /// Turn text.
    content: String,
}

/// Request body for the `POST /chat` endpoint.
#[derive(Deserialize)]
struct ChatRequest {
    /// Document to answer against, as returned by `/upload-pdf`.
    doc_id: String,
    /// Question for the current turn.
    question: String,
    /// Prior turns, oldest first.
    #[serde(default)]
    history: Option<Vec<ChatMessage>>,
}

/// Supporting fragment returned alongside an answer.
#[derive(Serialize)]
struct ChatSource {
    /// Page the fragment came from, when the pipeline recorded one.
    page_number: Option<i64>,
    /// Leading text of the fragment, truncated with an ellipsis marker.
    snippet: String,
}

/// Response body for the `POST /chat` endpoint.
#[derive(Serialize)]
struct ChatResponse {
    /// Answer produced by the chain.
    answer: String,
    /// Fragments supporting the answer, in retrieval order.
    sources: Option<Vec<ChatSource>>,
}

/// Ask a question about a previously ingested document.
async fn chat_with_doc<P>(
    State(state): State<Arc<AppState<P>>>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, AppError>
where
    P: RagPipeline,
{
    let chain = state
        .pipeline
        .build_qa_chain(&request.doc_id)
        .await
        .map_err(AppError::ChainBuild)?;

    let history = request.history.as_deref().unwrap_or(&[]);
    let prompt = flatten_history(history, &request.question);
    let output = chain.invoke(&prompt).await?;

    let sources: Vec<ChatSource> = output
        .source_documents
        .iter()
        .map(source_from_document)
        .collect();

    if let Err(err) = state
        .journal
        .append(&request.doc_id, &request.question, &output.answer)
        .await
    {
        tracing::error!(error = %err, "Failed to record interaction");
    }

    state.metrics.record_chat();
    tracing::info!(
        doc_id = %request.doc_id,
        sources = sources.len(),
        "Chat completed"
    );
    Ok(Json(ChatResponse {
        answer: output.answer,
        sources: Some(sources),
    }))
}

/// Return a concise snapshot of the gateway counters.
async fn get_metrics<P>(State(state): State<Arc<AppState<P>>>) -> Json<MetricsSnapshot>
where
    P: RagPipeline,
{
    Json(state.metrics.snapshot())
}

/// Flatten prior turns and the current question into the chain prompt.
///
/// Each prior turn contributes one `User:`/`Assistant:` line in given order; the current
/// question is always the final `User:` line.
fn flatten_history(history: &[ChatMessage], question: &str) -> String {
    let mut prompt = String::new();
    for message in history {
        let prefix = if message.role == "user" {
            "User"
        } else {
            "Assistant"
        };
        prompt.push_str(prefix);
        prompt.push_str(": ");
        prompt.push_str(&message.content);
        prompt.push('\n');
    }
    prompt.push_str("User: ");
    prompt.push_str(question);
    prompt
}

/// Map a retrieved fragment to its response shape.
///
/// The ellipsis suffix is appended whether or not the text was actually truncated.
fn source_from_document(document: &SourceDocument) -> ChatSource {
    let page_number = document
        .metadata
        .get("page_number")
        .and_then(serde_json::Value::as_i64);
    let mut snippet: String = document.page_content.chars().take(SNIPPET_CHARS).collect();
    snippet.push_str("...");
    ChatSource {
        page_number,
        snippet,
    }
}

/// Failures surfaced to HTTP clients as a status code with plain-text detail.
enum AppError {
    /// Request was malformed; maps to 400.
    BadRequest(String),
    /// Pipeline ingestion or chain invocation failed; maps to 500.
    Pipeline(PipelineError),
    /// Chain construction failed for the requested document; maps to 500.
    ChainBuild(PipelineError),
    /// Local filesystem operation failed; maps to 500.
    Io(std::io::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::BadRequest(detail) => (StatusCode::BAD_REQUEST, detail).into_response(),
            AppError::Pipeline(err) => {
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
            }
            AppError::ChainBuild(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error building QA chain: {err}"),
            )
                .into_response(),
            AppError::Io(err) => {
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
            }
        }
    }
}

impl From<PipelineError> for AppError {
    fn from(inner: PipelineError) -> Self {
        Self::Pipeline(inner)
    }
}

impl From<std::io::Error> for AppError {
    fn from(inner: std::io::Error) -> Self {
        Self::Io(inner)
    }
}
