#![expect(
    clippy::tests_outside_test_module,
    reason = "integration tests are only compiled in test mode"
)]

use anyhow::Result;
use schema_mcp::config::{DatabaseConfig, EmbeddingConfig, VectorConfig};
use schema_mcp::database::SqliteSource;
use schema_mcp::embeddings::EmbeddingClient;
use schema_mcp::mcp::{McpServer, register_query_tools};
use schema_mcp::query::QueryService;
use schema_mcp::vector::milvus::MilvusClient;
use serde_json::{Value, json};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const USERS_DDL: &str = "CREATE TABLE users (id INTEGER PRIMARY KEY AUTOINCREMENT, email TEXT)";
const ORDERS_DDL: &str = "CREATE TABLE orders (id INTEGER PRIMARY KEY, user_id INTEGER)";

async fn milvus_ok(server: &MockServer, endpoint: &str, data: Value) {
    Mock::given(method("POST"))
        .and(path(endpoint))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "code": 0, "data": data })))
        .mount(server)
        .await;
}

/// MCP server over SQLite, with the embedding and vector services mocked
async fn build_server(
    temp_dir: &TempDir,
    embedding_server: &MockServer,
    milvus_server: &MockServer,
) -> Result<Arc<McpServer>> {
    let url = format!(
        "sqlite://{}?mode=rwc",
        temp_dir.path().join("shop.db").display()
    );
    let source = SqliteSource::connect(&url, &DatabaseConfig::default()).await?;
    sqlx::raw_sql(USERS_DDL).execute(source.pool()).await?;

    let embedder = EmbeddingClient::new(&EmbeddingConfig {
        url: Some(format!("{}/v1/embeddings", embedding_server.uri())),
        token: Some("sk-test".to_string()),
        dimension: 3,
        ..EmbeddingConfig::default()
    })?;

    let address = milvus_server.address();
    let index = MilvusClient::new(
        &VectorConfig {
            host: Some(address.ip().to_string()),
            port: address.port(),
            collection: Some("shop_schemas".to_string()),
            ..VectorConfig::default()
        },
        3,
    )?;

    let service = QueryService::new(Arc::new(source), Arc::new(embedder), Arc::new(index));
    let server = McpServer::new("schema-mcp".to_string(), "test".to_string());
    register_query_tools(&server, service).await;
    Ok(Arc::new(server))
}

async fn run_session(server: Arc<McpServer>, requests: &[Value]) -> Result<Vec<Value>> {
    let mut input = requests
        .iter()
        .map(Value::to_string)
        .collect::<Vec<_>>()
        .join("\n");
    input.push('\n');

    let mut output = Vec::new();
    server
        .serve(input.as_bytes(), &mut output, CancellationToken::new())
        .await?;

    let replies = String::from_utf8(output)?
        .lines()
        .map(serde_json::from_str)
        .collect::<Result<Vec<Value>, _>>()?;
    Ok(replies)
}

fn tool_call(id: i64, name: &str, query: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "tools/call",
        "params": { "name": name, "arguments": { "query": query } }
    })
}

fn text_of(reply: &Value) -> &str {
    reply["result"]["content"][0]["text"].as_str().unwrap_or_default()
}

#[tokio::test(flavor = "multi_thread")]
async fn full_session_over_sqlite() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let embedding_server = MockServer::start().await;
    let milvus_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .and(body_partial_json(json!({ "input": "who placed which order" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{ "embedding": [0.5, 0.1, 0.9] }]
        })))
        .expect(1)
        .mount(&embedding_server)
        .await;
    milvus_ok(
        &milvus_server,
        "/v2/vectordb/collections/get_stats",
        json!({ "rowCount": "2" }),
    )
    .await;
    Mock::given(method("POST"))
        .and(path("/v2/vectordb/entities/search"))
        .and(body_partial_json(json!({ "limit": 3, "data": [[0.5, 0.1, 0.9]] })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 0,
            "data": [
                { "distance": 0.91, "my_id": 2, "schema": ORDERS_DDL },
                { "distance": 0.72, "my_id": 1, "schema": USERS_DDL }
            ]
        })))
        .expect(1)
        .mount(&milvus_server)
        .await;

    let server = build_server(&temp_dir, &embedding_server, &milvus_server).await?;
    let replies = run_session(
        server,
        &[
            json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "initialize",
                "params": { "protocolVersion": "2025-03-26", "capabilities": {} }
            }),
            json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }),
            json!({ "jsonrpc": "2.0", "id": 2, "method": "tools/list" }),
            tool_call(3, "get_can_use_table", "who placed which order"),
            tool_call(4, "execute_sql", "INSERT INTO users(email) VALUES ('a@example.com')"),
            tool_call(5, "execute_sql", "SELECT id, email FROM users"),
            tool_call(6, "execute_sql", "SELECT * FROM no_such_table"),
        ],
    )
    .await?;

    // One reply per request, none for the notification
    assert_eq!(replies.len(), 6);
    assert_eq!(replies[0]["result"]["protocolVersion"], "2025-03-26");
    assert_eq!(
        replies[1]["result"]["tools"].as_array().map(Vec::len),
        Some(2)
    );

    assert_eq!(text_of(&replies[2]), format!("{ORDERS_DDL}\n\n{USERS_DDL}"));
    assert_eq!(
        text_of(&replies[3]),
        "Query executed successfully. Rows affected: 1, Last insert ID: 1"
    );

    let rows: Value = serde_json::from_str(text_of(&replies[4]))?;
    assert_eq!(rows, json!([{ "id": 1, "email": "a@example.com" }]));

    assert_eq!(replies[5]["result"]["isError"], true);
    assert!(text_of(&replies[5]).contains("no_such_table"));

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn embedding_outage_is_a_tool_error() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let embedding_server = MockServer::start().await;
    let milvus_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
        .mount(&embedding_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/vectordb/entities/search"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&milvus_server)
        .await;

    let server = build_server(&temp_dir, &embedding_server, &milvus_server).await?;
    let replies = run_session(server, &[tool_call(1, "get_can_use_table", "users")]).await?;

    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0]["result"]["isError"], true);
    assert!(text_of(&replies[0]).contains("502"));

    Ok(())
}
