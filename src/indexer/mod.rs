// Indexer module
// Coordinates schema fetching, embedding, vector inserts and the dedup ledger

#[cfg(test)]
mod tests;

use futures::StreamExt;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{Result, SchemaMcpError};
use crate::config::IndexerConfig;
use crate::embeddings::Embedder;
use crate::ledger::DedupLedger;
use crate::schema::SchemaFetcher;
use crate::vector::{CollectionState, VectorIndex};

/// Statistics about one indexing pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexingStats {
    pub tables_seen: usize,
    pub tables_already_indexed: usize,
    pub tables_indexed: usize,
    pub errors_encountered: usize,
}

/// Result of asking for a pass while another may be running
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    Completed(IndexingStats),
    /// Another pass held the lock; nothing was done
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupOutcome {
    /// The collection was already present, so startup indexing did not run
    CollectionExisted,
    Indexed(PassOutcome),
}

/// Owns the collection lifecycle and the dedup ledger while indexing.
/// Cheap to clone; clones share the pass lock.
#[derive(Clone)]
pub struct Indexer {
    fetcher: SchemaFetcher,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    ledger: Arc<DedupLedger>,
    concurrency: usize,
    batch_size: usize,
    pass_lock: Arc<tokio::sync::Mutex<()>>,
    state: Arc<Mutex<CollectionState>>,
}

impl Indexer {
    #[inline]
    pub fn new(
        fetcher: SchemaFetcher,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        ledger: Arc<DedupLedger>,
        config: &IndexerConfig,
    ) -> Self {
        Self {
            fetcher,
            embedder,
            index,
            ledger,
            concurrency: config.concurrency.max(1),
            batch_size: config.batch_size.max(1),
            pass_lock: Arc::new(tokio::sync::Mutex::new(())),
            state: Arc::new(Mutex::new(CollectionState::Absent)),
        }
    }

    #[inline]
    pub fn collection_state(&self) -> CollectionState {
        self.state
            .lock()
            .map_or(CollectionState::Absent, |state| *state)
    }

    fn set_state(&self, next: CollectionState) {
        if let Ok(mut state) = self.state.lock() {
            *state = next;
        }
        debug!("Collection state: {}", next);
    }

    /// Startup sequence: if the collection already exists nothing else happens;
    /// otherwise it is created, indexed, loaded, and a full pass populates it.
    #[inline]
    pub async fn startup(&self, cancel: CancellationToken) -> Result<StartupOutcome> {
        if !self.ensure_collection().await? {
            info!("Vector collection already exists, skipping startup indexing");
            return Ok(StartupOutcome::CollectionExisted);
        }

        let outcome = self.try_index_pass(cancel).await?;
        Ok(StartupOutcome::Indexed(outcome))
    }

    /// Create the collection if it is missing. Returns true when it was created.
    #[inline]
    pub async fn ensure_collection(&self) -> Result<bool> {
        if self.index.collection_exists().await? {
            self.set_state(CollectionState::Loaded);
            return Ok(false);
        }

        self.set_state(CollectionState::Creating);
        self.index.create_collection().await?;

        self.set_state(CollectionState::IndexBuilding);
        self.index.create_index().await?;
        self.index.load_collection().await?;

        self.set_state(CollectionState::Loaded);
        info!("Vector collection created and loaded");
        Ok(true)
    }

    /// Run one pass unless another is already in progress
    #[inline]
    pub async fn try_index_pass(&self, cancel: CancellationToken) -> Result<PassOutcome> {
        let Ok(_guard) = self.pass_lock.try_lock() else {
            warn!("Previous indexing pass is still running, skipping this one");
            return Ok(PassOutcome::Skipped);
        };

        let stats = self.index_pass(cancel).await?;
        info!(
            "Indexing pass finished: {} tables seen, {} already indexed, {} indexed, {} errors",
            stats.tables_seen,
            stats.tables_already_indexed,
            stats.tables_indexed,
            stats.errors_encountered
        );
        Ok(PassOutcome::Completed(stats))
    }

    /// Stream schemas, drop those already in the ledger, and embed and insert the
    /// rest on a bounded worker pool. Waits for every dispatched worker.
    async fn index_pass(&self, cancel: CancellationToken) -> Result<IndexingStats> {
        let mut batches = self
            .fetcher
            .fetch_all(cancel.clone())
            .ready_chunks(self.batch_size);
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut workers = JoinSet::new();
        let mut stats = IndexingStats::default();
        let mut fatal: Option<SchemaMcpError> = None;

        'batches: while let Some(batch) = batches.next().await {
            let mut definitions = BTreeMap::new();
            for item in batch {
                match item {
                    Ok(schema) => {
                        definitions.insert(schema.name, schema.definition);
                    }
                    Err(e) => {
                        fatal = Some(e.into());
                        break 'batches;
                    }
                }
            }

            let names: BTreeSet<String> = definitions.keys().cloned().collect();
            let unseen = match self.ledger.filter_unseen(&names).await {
                Ok(unseen) => unseen,
                Err(e) => {
                    fatal = Some(e.into());
                    break 'batches;
                }
            };
            stats.tables_seen += names.len();
            stats.tables_already_indexed += names.len() - unseen.len();

            for name in unseen {
                let Some(definition) = definitions.remove(&name) else {
                    continue;
                };

                let permit = tokio::select! {
                    biased;
                    () = cancel.cancelled() => None,
                    permit = Arc::clone(&permits).acquire_owned() => permit.ok(),
                };
                let Some(permit) = permit else {
                    info!("Indexing cancelled, no further tables will be dispatched");
                    break 'batches;
                };

                let embedder = Arc::clone(&self.embedder);
                let index = Arc::clone(&self.index);
                let ledger = Arc::clone(&self.ledger);
                workers.spawn(async move {
                    let indexed = index_table(embedder, index, ledger, &name, definition).await;
                    drop(permit);
                    indexed
                });
            }
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(true) => stats.tables_indexed += 1,
                Ok(false) => stats.errors_encountered += 1,
                Err(e) => {
                    error!("Indexing worker failed: {}", e);
                    stats.errors_encountered += 1;
                }
            }
        }

        match fatal {
            Some(e) => Err(e),
            None => Ok(stats),
        }
    }

    /// Re-run ledger-filtered passes every `interval` until `cancel` fires.
    /// Each tick runs in its own task so a slow pass makes later ticks skip.
    /// The returned handle resolves only after every pass it started has
    /// finished, so in-flight workers still reach the ledger.
    #[inline]
    pub fn spawn_periodic(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let indexer = self.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; startup already covered it
            ticker.tick().await;
            info!("Periodic re-indexing every {}s", interval.as_secs());

            let mut passes = JoinSet::new();
            loop {
                let stopped = tokio::select! {
                    biased;
                    () = cancel.cancelled() => true,
                    _ = ticker.tick() => false,
                };
                if stopped {
                    break;
                }

                while let Some(joined) = passes.try_join_next() {
                    if let Err(e) = joined {
                        error!("Periodic indexing task failed: {}", e);
                    }
                }

                let pass = indexer.clone();
                let token = cancel.clone();
                passes.spawn(async move {
                    if let Err(e) = pass.try_index_pass(token).await {
                        error!("Periodic indexing pass failed: {}", e);
                    }
                });
            }

            if !passes.is_empty() {
                debug!("Waiting for {} periodic pass(es) to finish", passes.len());
            }
            while let Some(joined) = passes.join_next().await {
                if let Err(e) = joined {
                    error!("Periodic indexing task failed: {}", e);
                }
            }
            info!("Periodic re-indexing stopped");
        })
    }
}

/// Embed one table, store it, then record it. The ledger write only happens
/// after the vector insert succeeded.
async fn index_table(
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    ledger: Arc<DedupLedger>,
    name: &str,
    definition: String,
) -> bool {
    let vector = match embedder.embed(&definition).await {
        Ok(vector) => vector,
        Err(e) => {
            warn!("Failed to embed schema for table {}: {}", name, e);
            return false;
        }
    };

    if let Err(e) = index
        .insert(std::slice::from_ref(&definition), std::slice::from_ref(&vector))
        .await
    {
        warn!("Failed to insert schema for table {}: {}", name, e);
        return false;
    }

    if let Err(e) = ledger.insert(&BTreeSet::from([name.to_string()])).await {
        warn!("Table {} was indexed but could not be recorded: {}", name, e);
    }

    debug!("Indexed table {}", name);
    true
}
