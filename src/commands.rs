use anyhow::{Context, Result};
use console::style;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::database::{self, RelationalSource};
use crate::embeddings::{Embedder, EmbeddingClient};
use crate::indexer::{Indexer, PassOutcome, StartupOutcome};
use crate::ledger::DedupLedger;
use crate::mcp::{McpServer, register_query_tools};
use crate::query::QueryService;
use crate::schema::SchemaFetcher;
use crate::vector::VectorIndex;
use crate::vector::milvus::MilvusClient;

const SERVER_NAME: &str = "schema-mcp";
const RECENT_ENTRIES_SHOWN: u32 = 5;

const SERVER_INSTRUCTIONS: &str = "Call get_can_use_table with a description of the data you need to find relevant tables and their definitions, then call execute_sql to run statements against them.";

/// External collaborators shared by every command
pub struct Services {
    pub source: Arc<dyn RelationalSource>,
    pub embedder: Arc<dyn Embedder>,
    pub index: Arc<dyn VectorIndex>,
    pub ledger: Arc<DedupLedger>,
}

impl Services {
    /// Connect to the relational source and build the service clients.
    /// Any failure here is fatal.
    #[inline]
    pub async fn connect(config: &Config) -> Result<Self> {
        let url = config
            .connection_url()
            .context("Failed to build database connection string")?;
        let source = database::connect(&url, &config.database)
            .await
            .context("Failed to connect to the relational database")?;

        let embedder =
            EmbeddingClient::new(&config.embedding).context("Failed to create embedding client")?;
        let index = MilvusClient::new(&config.vector, embedder.dimension())
            .context("Failed to create vector service client")?;
        info!(
            "Using embedding model {} and vector collection {}",
            embedder.model(),
            index.collection()
        );

        Ok(Self {
            source,
            embedder: Arc::new(embedder),
            index: Arc::new(index),
            ledger: Arc::new(DedupLedger::new(config.ledger_path())),
        })
    }

    #[inline]
    pub fn indexer(&self, config: &Config) -> Indexer {
        Indexer::new(
            SchemaFetcher::new(Arc::clone(&self.source)),
            Arc::clone(&self.embedder),
            Arc::clone(&self.index),
            Arc::clone(&self.ledger),
            &config.indexer,
        )
    }

    #[inline]
    pub fn query_service(&self) -> QueryService {
        QueryService::new(
            Arc::clone(&self.source),
            Arc::clone(&self.embedder),
            Arc::clone(&self.index),
        )
    }

    /// Release the ledger and relational connections
    #[inline]
    pub async fn close(&self) {
        self.ledger.close().await;
        self.source.close().await;
    }
}

/// Index the schema, then serve the MCP tools on stdio until EOF or a shutdown signal
#[inline]
pub async fn serve(config: Config) -> Result<()> {
    info!("Starting {} server", SERVER_NAME);

    let services = Services::connect(&config).await?;
    let cancel = CancellationToken::new();
    let listener = spawn_shutdown_listener(cancel.clone());

    let result = run_server(&config, &services, &cancel).await;

    cancel.cancel();
    if let Err(e) = listener.await {
        warn!("Shutdown listener ended abnormally: {}", e);
    }
    services.close().await;

    if let Err(e) = &result {
        error!("Server stopped with error: {:#}", e);
    }
    result
}

async fn run_server(
    config: &Config,
    services: &Services,
    cancel: &CancellationToken,
) -> Result<()> {
    let indexer = services.indexer(config);

    match indexer
        .startup(cancel.clone())
        .await
        .context("Startup indexing failed")?
    {
        StartupOutcome::CollectionExisted => {}
        StartupOutcome::Indexed(outcome) => log_pass(&outcome),
    }

    let periodic = config
        .reindex_interval()
        .map(|interval| indexer.spawn_periodic(interval, cancel.clone()));

    let server = McpServer::new(
        SERVER_NAME.to_string(),
        env!("CARGO_PKG_VERSION").to_string(),
    )
    .with_instructions(SERVER_INSTRUCTIONS);
    register_query_tools(&server, services.query_service()).await;

    let result = Arc::new(server)
        .serve_stdio(cancel.clone())
        .await
        .context("MCP server failed");

    // EOF on stdin also ends the periodic re-indexer
    cancel.cancel();
    if let Some(handle) = periodic {
        if let Err(e) = handle.await {
            warn!("Periodic re-indexer ended abnormally: {}", e);
        }
    }

    result
}

/// Ensure the collection exists, run one ledger-filtered pass and exit
#[inline]
pub async fn index(config: Config) -> Result<()> {
    let services = Services::connect(&config).await?;
    let cancel = CancellationToken::new();
    let listener = spawn_shutdown_listener(cancel.clone());

    let indexer = services.indexer(&config);
    let result = async {
        if indexer
            .ensure_collection()
            .await
            .context("Failed to prepare the vector collection")?
        {
            println!(
                "Created vector collection {}",
                config.vector.collection.as_deref().unwrap_or_default()
            );
        }
        indexer
            .try_index_pass(cancel.clone())
            .await
            .context("Indexing pass failed")
    }
    .await;

    cancel.cancel();
    if let Err(e) = listener.await {
        warn!("Shutdown listener ended abnormally: {}", e);
    }
    services.close().await;

    match result? {
        PassOutcome::Completed(stats) => {
            println!("{}", style("Indexing pass complete").green().bold());
            println!("  Tables seen:            {}", stats.tables_seen);
            println!("  Already indexed:        {}", stats.tables_already_indexed);
            println!("  Newly indexed:          {}", stats.tables_indexed);
            if stats.errors_encountered > 0 {
                println!(
                    "  {}",
                    style(format!("Errors: {}", stats.errors_encountered)).red()
                );
            }
        }
        PassOutcome::Skipped => {
            println!("{}", style("Another indexing pass is running").yellow());
        }
    }
    Ok(())
}

/// Report on the relational source, the vector collection and the ledger
#[inline]
pub async fn show_status() -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;

    println!("{}", style("Schema-MCP Status").bold());
    println!("{}", "=".repeat(40));

    println!();
    println!("{}", style("Relational source").cyan());
    let url = config.connection_url()?;
    match database::connect(&url, &config.database).await {
        Ok(source) => {
            match source.list_tables().await {
                Ok(tables) => println!("   Connected, {} tables", tables.len()),
                Err(e) => println!("   {} {}", style("Connected, listing failed:").yellow(), e),
            }
            source.close().await;
        }
        Err(e) => println!("   {} {}", style("Unreachable:").red(), e),
    }

    println!();
    println!("{}", style("Vector collection").cyan());
    let client = MilvusClient::new(&config.vector, config.embedding.dimension as usize)
        .context("Failed to create vector service client")?;
    match client.collection_exists().await {
        Ok(true) => match client.row_count().await {
            Ok(rows) => println!("   {}: {} schemas indexed", client.collection(), rows),
            Err(e) => println!("   {}: row count unavailable ({})", client.collection(), e),
        },
        Ok(false) => println!("   {}: not created yet", client.collection()),
        Err(e) => println!("   {} {}", style("Unreachable:").red(), e),
    }

    println!();
    println!("{}", style("Ledger").cyan());
    let ledger = DedupLedger::new(config.ledger_path());
    println!("   Path: {}", ledger.path().display());
    if ledger.path().exists() {
        let count = ledger.count().await.context("Failed to read ledger")?;
        println!("   Tables recorded: {}", count);
        for entry in ledger.recent(RECENT_ENTRIES_SHOWN).await? {
            println!("   - {} ({})", entry.table_name, entry.indexed_at);
        }
        ledger.close().await;
    } else {
        println!("   No tables indexed yet");
    }

    Ok(())
}

/// Print where configuration lives, and with `show` the effective values
#[inline]
pub fn show_config(show: bool) -> Result<()> {
    let config_dir = Config::config_dir()?;
    println!(
        "Configuration file: {}",
        config_dir.join("config.toml").display()
    );
    if !show {
        println!("Environment variables override file values. Use --show to print them.");
        return Ok(());
    }

    let config = Config::load().context("Failed to load configuration")?;
    println!();
    println!("{}", config.redacted().to_toml()?);
    Ok(())
}

fn log_pass(outcome: &PassOutcome) {
    match outcome {
        PassOutcome::Completed(stats) => info!(
            "Startup indexing indexed {} of {} tables",
            stats.tables_indexed, stats.tables_seen
        ),
        PassOutcome::Skipped => warn!("Startup indexing was skipped"),
    }
}

/// Cancel `cancel` on Ctrl-C or SIGTERM. Ends quietly once `cancel` fires for
/// any other reason.
fn spawn_shutdown_listener(cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            () = wait_for_signal() => {
                info!("Shutdown signal received");
                cancel.cancel();
            }
            () = cancel.cancelled() => {}
        }
    })
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}
