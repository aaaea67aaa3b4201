use super::*;
use anyhow::Result;
use serde_json::json;
use tempfile::TempDir;

async fn create_test_source() -> Result<(TempDir, SqliteSource)> {
    let temp_dir = TempDir::new()?;
    let url = format!("sqlite://{}?mode=rwc", temp_dir.path().join("shop.db").display());
    let source = SqliteSource::connect(&url, &DatabaseConfig::default()).await?;

    sqlx::raw_sql(
        "CREATE TABLE users (id INTEGER PRIMARY KEY AUTOINCREMENT, email TEXT NOT NULL, score REAL, avatar BLOB);
         CREATE TABLE orders (id INTEGER PRIMARY KEY, user_id INTEGER REFERENCES users(id), total REAL);",
    )
    .execute(source.pool())
    .await?;

    Ok((temp_dir, source))
}

#[tokio::test]
async fn lists_user_tables_only() -> Result<()> {
    let (_temp_dir, source) = create_test_source().await?;

    let tables = source.list_tables().await?;
    assert_eq!(tables, vec!["orders", "users"]);

    Ok(())
}

#[tokio::test]
async fn describe_returns_create_statement() -> Result<()> {
    let (_temp_dir, source) = create_test_source().await?;

    let definition = source.describe_table("users").await?;
    assert!(definition.starts_with("CREATE TABLE users"));
    assert!(definition.contains("email TEXT NOT NULL"));

    assert!(matches!(
        source.describe_table("missing").await,
        Err(SourceError::TableNotFound(name)) if name == "missing"
    ));

    Ok(())
}

#[tokio::test]
async fn rows_keep_native_json_types() -> Result<()> {
    let (_temp_dir, source) = create_test_source().await?;
    source
        .execute("INSERT INTO users (email, score, avatar) VALUES ('a@example.com', 4.5, X'6869')")
        .await?;
    source
        .execute("INSERT INTO users (email, score) VALUES ('b@example.com', NULL)")
        .await?;

    let rows = source
        .query_rows("SELECT id, email, score, avatar FROM users ORDER BY id")
        .await?;

    assert_eq!(rows.len(), 2);
    assert_eq!(
        Value::Object(rows[0].clone()),
        json!({"id": 1, "email": "a@example.com", "score": 4.5, "avatar": "hi"})
    );
    assert_eq!(rows[1]["score"], Value::Null);

    let keys: Vec<&str> = rows[0].keys().map(String::as_str).collect();
    assert_eq!(keys, vec!["id", "email", "score", "avatar"]);

    Ok(())
}

#[tokio::test]
async fn execute_reports_affected_rows_and_insert_id() -> Result<()> {
    let (_temp_dir, source) = create_test_source().await?;

    let inserted = source
        .execute("INSERT INTO users (email) VALUES ('a@example.com'), ('b@example.com')")
        .await?;
    assert_eq!(inserted.rows_affected, 2);
    assert_eq!(inserted.last_insert_id, 2);

    let updated = source
        .execute("UPDATE users SET score = 1.0 WHERE email = 'a@example.com'")
        .await?;
    assert_eq!(
        updated,
        ExecOutcome {
            rows_affected: 1,
            last_insert_id: 0
        }
    );

    Ok(())
}

#[tokio::test]
async fn invalid_sql_is_query_error() -> Result<()> {
    let (_temp_dir, source) = create_test_source().await?;

    assert!(matches!(
        source.query_rows("SELEC nonsense").await,
        Err(SourceError::Query(_))
    ));
    assert!(matches!(
        source.execute("DROP TABLE nowhere").await,
        Err(SourceError::Query(_))
    ));

    Ok(())
}
