use httpmock::{Method::POST, MockServer};
use ragchat::config;
use ragchat::pipeline::{HttpRagPipeline, QaChain, RagPipeline};
use serde_json::json;
use std::path::Path;
use tokio::sync::OnceCell;

static INIT: OnceCell<()> = OnceCell::const_new();
static MOCK_SERVER: OnceCell<&'static MockServer> = OnceCell::const_new();

fn set_env(key: &str, value: &str) {
    // SAFETY: Tests run in a single process and establish deterministic configuration upfront.
    unsafe { std::env::set_var(key, value) }
}

async fn harness() -> &'static MockServer {
    INIT.get_or_init(|| async {
        let mock_server: &'static MockServer = Box::leak(Box::new(MockServer::start_async().await));
        let scratch = std::env::temp_dir().join(format!("ragchat-it-{}", uuid::Uuid::new_v4()));

        set_env("RAG_PIPELINE_URL", &mock_server.base_url());
        set_env("RAG_PIPELINE_API_KEY", "secret-key");
        set_env("DATA_DIR", scratch.join("data").to_str().unwrap());
        set_env("UPLOAD_DIR", scratch.join("uploads").to_str().unwrap());

        MOCK_SERVER.set(mock_server).ok();
        config::init_config();
    })
    .await;

    MOCK_SERVER.get().expect("mock server initialized")
}

#[tokio::test]
async fn ingest_posts_file_path_and_returns_doc_id() {
    let server = harness().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/ingest")
                .header("api-key", "secret-key")
                .json_body(json!({ "file_path": "/tmp/upload.pdf" }));
            then.status(200).json_body(json!({ "doc_id": "doc-abc" }));
        })
        .await;

    let pipeline = HttpRagPipeline::new().expect("pipeline client");
    let doc_id = pipeline
        .ingest_pdf(Path::new("/tmp/upload.pdf"))
        .await
        .expect("ingest");

    assert_eq!(doc_id, "doc-abc");
    mock.assert_async().await;
}

#[tokio::test]
async fn chain_build_and_invoke_round_trip() {
    let server = harness().await;
    let chains_mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/chains")
                .header("api-key", "secret-key")
                .json_body(json!({ "doc_id": "doc-abc" }));
            then.status(200).json_body(json!({ "chain_id": "chain-1" }));
        })
        .await;
    let query_mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/chains/chain-1/query")
                .json_body(json!({ "prompt": "User: Hi\nUser: What is X?" }));
            then.status(200).json_body(json!({
                "answer": "X is a placeholder.",
                "source_documents": [
                    {
                        "page_content": "X denotes the unknown quantity.",
                        "metadata": { "page_number": 2 }
                    }
                ]
            }));
        })
        .await;

    let pipeline = HttpRagPipeline::new().expect("pipeline client");
    let chain = pipeline.build_qa_chain("doc-abc").await.expect("chain");
    let output = chain
        .invoke("User: Hi\nUser: What is X?")
        .await
        .expect("invoke");

    assert_eq!(output.answer, "X is a placeholder.");
    assert_eq!(output.source_documents.len(), 1);
    assert_eq!(
        output.source_documents[0].page_content,
        "X denotes the unknown quantity."
    );
    assert_eq!(
        output.source_documents[0]
            .metadata
            .get("page_number")
            .and_then(|value| value.as_i64()),
        Some(2)
    );

    chains_mock.assert_async().await;
    query_mock.assert_async().await;
}

#[tokio::test]
async fn pipeline_error_text_is_preserved() {
    let server = harness().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/chains")
                .json_body(json!({ "doc_id": "missing-doc" }));
            then.status(404).body("unknown document: missing-doc");
        })
        .await;

    let pipeline = HttpRagPipeline::new().expect("pipeline client");
    let err = pipeline
        .build_qa_chain("missing-doc")
        .await
        .expect_err("build should fail");

    assert!(err.to_string().contains("unknown document: missing-doc"));
    mock.assert_async().await;
}

#[tokio::test]
async fn invoke_defaults_missing_sources_to_empty() {
    let server = harness().await;
    let chains_mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/chains")
                .json_body(json!({ "doc_id": "doc-bare" }));
            then.status(200).json_body(json!({ "chain_id": "chain-2" }));
        })
        .await;
    let query_mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/chains/chain-2/query")
                .json_body(json!({ "prompt": "User: Anything?" }));
            then.status(200).json_body(json!({ "answer": "Nothing cited." }));
        })
        .await;

    let pipeline = HttpRagPipeline::new().expect("pipeline client");
    let chain = pipeline.build_qa_chain("doc-bare").await.expect("chain");
    let output = chain.invoke("User: Anything?").await.expect("invoke");

    assert_eq!(output.answer, "Nothing cited.");
    assert!(output.source_documents.is_empty());

    chains_mock.assert_async().await;
    query_mock.assert_async().await;
}
