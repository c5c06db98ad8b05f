//! Boundary to the external RAG pipeline service.
//!
//! Ingestion (parsing, chunking, embedding, vector storage) and chain construction run
//! in a separately deployed pipeline service; this module only speaks its HTTP API. The
//! [`RagPipeline`] and [`QaChain`] traits keep the HTTP surface testable without a live
//! pipeline behind it.

use crate::config::get_config;
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Url};
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use thiserror::Error;

/// Errors returned while interacting with the pipeline service.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Base URL failed to parse or normalize.
    #[error("Invalid pipeline URL: {0}")]
    InvalidUrl(String),
    /// HTTP layer failed before receiving a response.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// Pipeline responded with an unexpected status code.
    #[error("Pipeline request failed ({status}): {body}")]
    Rejected {
        /// HTTP status returned by the pipeline service.
        status: StatusCode,
        /// Error text carried in the failing response body.
        body: String,
    },
}

/// Ingestion and chain-construction operations offered by the pipeline.
#[async_trait]
pub trait RagPipeline: Send + Sync {
    /// Ingest the PDF at `file_path`, returning the opaque document id minted for it.
    async fn ingest_pdf(&self, file_path: &Path) -> Result<String, PipelineError>;

    /// Build a question-answering chain over a previously ingested document.
    async fn build_qa_chain(&self, doc_id: &str) -> Result<Box<dyn QaChain>, PipelineError>;
}

/// A question-answering chain bound to one ingested document.
#[async_trait]
pub trait QaChain: Send + Sync + std::fmt::Debug {
    /// Run the chain against a flattened conversation prompt.
    async fn invoke(&self, prompt: &str) -> Result<ChainOutput, PipelineError>;
}

/// Result of one chain invocation.
#[derive(Debug, Clone, Deserialize)]
pub struct ChainOutput {
    /// Answer text produced by the chain.
    pub answer: String,
    /// Fragments retrieved in support of the answer.
    #[serde(default)]
    pub source_documents: Vec<SourceDocument>,
}

/// One retrieved fragment supporting an answer.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceDocument {
    /// Raw text of the fragment.
    pub page_content: String,
    /// Metadata attached by the pipeline; `page_number` is carried through when present.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// HTTP client for the deployed pipeline service.
pub struct HttpRagPipeline {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpRagPipeline {
    /// Construct a new client using configuration derived from the environment.
    pub fn new() -> Result<Self, PipelineError> {
        let config = get_config();
        let client = Client::builder().user_agent("ragchat/0.1").build()?;

        let base_url =
            normalize_base_url(&config.rag_pipeline_url).map_err(PipelineError::InvalidUrl)?;
        tracing::debug!(
            url = %base_url,
            has_api_key = config.rag_pipeline_api_key.is_some(),
            "Initialized pipeline HTTP client"
        );

        Ok(Self {
            client,
            base_url,
            api_key: config.rag_pipeline_api_key.clone(),
        })
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        build_request(
            &self.client,
            &self.base_url,
            self.api_key.as_deref(),
            method,
            path,
        )
    }
}

#[async_trait]
impl RagPipeline for HttpRagPipeline {
    async fn ingest_pdf(&self, file_path: &Path) -> Result<String, PipelineError> {
        let response = self
            .request(Method::POST, "ingest")
            .json(&json!({ "file_path": file_path.display().to_string() }))
            .send()
            .await?;
        let response = ensure_success(response).await?;
        let payload: IngestResponse = response.json().await?;
        tracing::debug!(doc_id = %payload.doc_id, "Pipeline ingested document");
        Ok(payload.doc_id)
    }

    async fn build_qa_chain(&self, doc_id: &str) -> Result<Box<dyn QaChain>, PipelineError> {
        let response = self
            .request(Method::POST, "chains")
            .json(&json!({ "doc_id": doc_id }))
            .send()
            .await?;
        let response = ensure_success(response).await?;
        let payload: ChainHandle = response.json().await?;
        tracing::debug!(doc_id, chain_id = %payload.chain_id, "Pipeline built QA chain");
        Ok(Box::new(HttpQaChain {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            chain_id: payload.chain_id,
        }))
    }
}

/// Chain handle that forwards invocations to the pipeline service.
#[derive(Debug)]
struct HttpQaChain {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    chain_id: String,
}

#[async_trait]
impl QaChain for HttpQaChain {
    async fn invoke(&self, prompt: &str) -> Result<ChainOutput, PipelineError> {
        let path = format!("chains/{}/query", self.chain_id);
        let response = build_request(
            &self.client,
            &self.base_url,
            self.api_key.as_deref(),
            Method::POST,
            &path,
        )
        .json(&json!({ "prompt": prompt }))
        .send()
        .await?;
        let response = ensure_success(response).await?;
        Ok(response.json().await?)
    }
}

fn build_request(
    client: &Client,
    base_url: &str,
    api_key: Option<&str>,
    method: Method,
    path: &str,
) -> reqwest::RequestBuilder {
    let url = format_endpoint(base_url, path);
    let mut request = client.request(method, url);
    if let Some(api_key) = api_key
        && !api_key.is_empty()
    {
        request = request.header("api-key", api_key);
    }
    request
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, PipelineError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let error = PipelineError::Rejected { status, body };
        tracing::error!(error = %error, "Pipeline request failed");
        Err(error)
    }
}

fn normalize_base_url(url: &str) -> Result<String, String> {
    let mut parsed = Url::parse(url).map_err(|err| err.to_string())?;
    let path = parsed.path().trim_end_matches('/').to_string();
    parsed.set_path(&path);
    Ok(parsed.to_string())
}

fn format_endpoint(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    format!("{base}/{path}")
}

#[derive(Deserialize)]
struct IngestResponse {
    doc_id: String,
}

#[derive(Deserialize)]
struct ChainHandle {
    chain_id: String,
}
