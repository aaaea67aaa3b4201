use super::*;
use crate::test_support::{EmbedGate, FakeSource, KeywordEmbedder, MemoryIndex, ddl};
use std::sync::atomic::Ordering;
use tempfile::TempDir;

struct Harness {
    _temp_dir: TempDir,
    source: Arc<FakeSource>,
    embedder: Arc<KeywordEmbedder>,
    index: Arc<MemoryIndex>,
    ledger: Arc<DedupLedger>,
    indexer: Indexer,
}

fn harness(source: FakeSource, embedder: KeywordEmbedder, index: MemoryIndex) -> Harness {
    harness_with(source, embedder, index, IndexerConfig::default())
}

fn harness_with(
    source: FakeSource,
    embedder: KeywordEmbedder,
    index: MemoryIndex,
    config: IndexerConfig,
) -> Harness {
    let temp_dir = TempDir::new().expect("temp dir");
    let source = Arc::new(source);
    let embedder = Arc::new(embedder);
    let index = Arc::new(index);
    let ledger = Arc::new(DedupLedger::new(temp_dir.path().join("schema.db")));

    let indexer = Indexer::new(
        SchemaFetcher::new(source.clone()),
        embedder.clone(),
        index.clone(),
        ledger.clone(),
        &config,
    );

    Harness {
        _temp_dir: temp_dir,
        source,
        embedder,
        index,
        ledger,
        indexer,
    }
}

fn shop_source() -> FakeSource {
    let users = ddl("users");
    let orders = ddl("orders");
    let products = ddl("products");
    FakeSource::with_tables(&[
        ("users", users.as_str()),
        ("orders", orders.as_str()),
        ("products", products.as_str()),
    ])
}

fn names(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

fn completed(outcome: PassOutcome) -> IndexingStats {
    match outcome {
        PassOutcome::Completed(stats) => stats,
        PassOutcome::Skipped => panic!("pass was unexpectedly skipped"),
    }
}

#[tokio::test]
async fn startup_creates_collection_and_indexes_every_table() {
    let h = harness(shop_source(), KeywordEmbedder::new(), MemoryIndex::new());
    assert_eq!(h.indexer.collection_state(), CollectionState::Absent);

    let outcome = h
        .indexer
        .startup(CancellationToken::new())
        .await
        .expect("startup succeeds");

    let StartupOutcome::Indexed(PassOutcome::Completed(stats)) = outcome else {
        panic!("expected a completed pass, got {outcome:?}");
    };
    assert_eq!(stats.tables_seen, 3);
    assert_eq!(stats.tables_indexed, 3);
    assert_eq!(stats.errors_encountered, 0);

    assert_eq!(h.indexer.collection_state(), CollectionState::Loaded);
    assert_eq!(h.index.create_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.index.row_count().await.expect("count"), 3);
    assert!(
        h.ledger
            .filter_unseen(&names(&["users", "orders", "products"]))
            .await
            .expect("ledger open")
            .is_empty()
    );
}

#[tokio::test]
async fn startup_skips_when_collection_exists() {
    let h = harness(shop_source(), KeywordEmbedder::new(), MemoryIndex::existing());

    let outcome = h
        .indexer
        .startup(CancellationToken::new())
        .await
        .expect("startup succeeds");

    assert_eq!(outcome, StartupOutcome::CollectionExisted);
    assert_eq!(h.indexer.collection_state(), CollectionState::Loaded);
    assert_eq!(h.embedder.call_count(), 0);
    assert_eq!(h.source.describes(), 0);
    assert_eq!(h.index.create_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn ledger_entries_are_never_embedded_again() {
    let h = harness(shop_source(), KeywordEmbedder::new(), MemoryIndex::existing());
    h.ledger
        .insert(&names(&["users"]))
        .await
        .expect("ledger insert");

    let stats = completed(
        h.indexer
            .try_index_pass(CancellationToken::new())
            .await
            .expect("pass succeeds"),
    );
    assert_eq!(stats.tables_already_indexed, 1);
    assert_eq!(stats.tables_indexed, 2);
    assert!(!h.embedder.seen_texts().contains(&ddl("users")));

    let calls_after_first = h.embedder.call_count();
    let stats = completed(
        h.indexer
            .try_index_pass(CancellationToken::new())
            .await
            .expect("pass succeeds"),
    );
    assert_eq!(stats.tables_already_indexed, 3);
    assert_eq!(h.embedder.call_count(), calls_after_first);
}

#[tokio::test]
async fn failed_insert_leaves_ledger_untouched() {
    let h = harness(shop_source(), KeywordEmbedder::new(), MemoryIndex::existing());
    h.index.fail_inserts(true);

    let stats = completed(
        h.indexer
            .try_index_pass(CancellationToken::new())
            .await
            .expect("per-table failures are not fatal"),
    );
    assert_eq!(stats.tables_indexed, 0);
    assert_eq!(stats.errors_encountered, 3);
    assert_eq!(h.ledger.count().await.expect("count"), 0);

    // The next pass retries everything
    h.index.fail_inserts(false);
    let stats = completed(
        h.indexer
            .try_index_pass(CancellationToken::new())
            .await
            .expect("pass succeeds"),
    );
    assert_eq!(stats.tables_indexed, 3);
    assert_eq!(h.ledger.count().await.expect("count"), 3);
}

#[tokio::test]
async fn embedding_failure_is_isolated_to_its_table() {
    let h = harness(
        shop_source(),
        KeywordEmbedder::new().failing_on("orders"),
        MemoryIndex::existing(),
    );

    let stats = completed(
        h.indexer
            .try_index_pass(CancellationToken::new())
            .await
            .expect("pass succeeds"),
    );
    assert_eq!(stats.tables_indexed, 2);
    assert_eq!(stats.errors_encountered, 1);

    let unseen = h
        .ledger
        .filter_unseen(&names(&["users", "orders", "products"]))
        .await
        .expect("ledger open");
    assert_eq!(unseen, names(&["orders"]));
    assert!(!h.index.texts().contains(&ddl("orders")));
}

#[tokio::test]
async fn overlapping_pass_is_skipped() {
    let gate = EmbedGate::new();
    let h = harness(
        shop_source(),
        KeywordEmbedder::new().gated(gate.clone()),
        MemoryIndex::existing(),
    );

    let first = {
        let indexer = h.indexer.clone();
        tokio::spawn(async move { indexer.try_index_pass(CancellationToken::new()).await })
    };
    gate.started.notified().await;
    let calls_while_running = h.embedder.call_count();

    let second = h
        .indexer
        .try_index_pass(CancellationToken::new())
        .await
        .expect("skip is not an error");
    assert_eq!(second, PassOutcome::Skipped);
    assert_eq!(h.embedder.call_count(), calls_while_running);

    gate.open();
    let first = first
        .await
        .expect("task joins")
        .expect("first pass succeeds");
    assert_eq!(completed(first).tables_indexed, 3);
}

#[tokio::test]
async fn cancellation_stops_dispatch_but_finishes_in_flight_work() {
    let cancel = CancellationToken::new();
    let config = IndexerConfig {
        concurrency: 1,
        batch_size: 1,
        ..IndexerConfig::default()
    };
    let h = harness_with(
        shop_source().cancel_after(2, cancel.clone()),
        KeywordEmbedder::new(),
        MemoryIndex::existing(),
        config,
    );

    let stats = completed(
        h.indexer
            .try_index_pass(cancel.clone())
            .await
            .expect("cancelled pass still completes"),
    );

    assert_eq!(h.source.describes(), 2);
    assert_eq!(stats.tables_indexed, 1);
    assert_eq!(h.embedder.seen_texts(), vec![ddl("users")]);
    assert_eq!(h.ledger.count().await.expect("count"), 1);
}

#[tokio::test]
async fn pre_cancelled_pass_does_nothing() {
    let h = harness(shop_source(), KeywordEmbedder::new(), MemoryIndex::existing());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let stats = completed(
        h.indexer
            .try_index_pass(cancel)
            .await
            .expect("pass succeeds"),
    );
    assert_eq!(stats, IndexingStats::default());
    assert_eq!(h.embedder.call_count(), 0);
}

#[tokio::test]
async fn unopenable_ledger_is_fatal() {
    let temp_dir = TempDir::new().expect("temp dir");
    let indexer = Indexer::new(
        SchemaFetcher::new(Arc::new(shop_source())),
        Arc::new(KeywordEmbedder::new()),
        Arc::new(MemoryIndex::existing()),
        Arc::new(DedupLedger::new(temp_dir.path())),
        &IndexerConfig::default(),
    );

    assert!(matches!(
        indexer.try_index_pass(CancellationToken::new()).await,
        Err(SchemaMcpError::Database(_))
    ));
}

#[tokio::test]
async fn periodic_pass_picks_up_new_tables() {
    let h = harness(shop_source(), KeywordEmbedder::new(), MemoryIndex::new());
    let cancel = CancellationToken::new();

    h.indexer
        .startup(cancel.clone())
        .await
        .expect("startup succeeds");
    let handle = h
        .indexer
        .spawn_periodic(Duration::from_millis(50), cancel.clone());

    let payments = ddl("payments");
    h.source.add_table("payments", &payments);

    tokio::time::timeout(Duration::from_secs(5), async {
        while !h.index.texts().contains(&payments) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("new table indexed");

    cancel.cancel();
    handle.await.expect("periodic task stops");

    // Existing tables were not embedded twice
    let embedded_users = h
        .embedder
        .seen_texts()
        .iter()
        .filter(|text| **text == ddl("users"))
        .count();
    assert_eq!(embedded_users, 1);
}

#[tokio::test]
async fn periodic_shutdown_waits_for_running_pass() {
    let gate = EmbedGate::new();
    let h = harness(
        shop_source(),
        KeywordEmbedder::new().gated(gate.clone()),
        MemoryIndex::existing(),
    );
    let cancel = CancellationToken::new();
    let handle = h
        .indexer
        .spawn_periodic(Duration::from_millis(20), cancel.clone());

    gate.started.notified().await;
    cancel.cancel();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!handle.is_finished(), "periodic task returned mid-pass");

    gate.open();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("periodic task stops")
        .expect("task joins");

    // Every inserted table was recorded before the handle resolved
    let inserted = h.index.texts().len();
    assert!(inserted > 0);
    assert_eq!(h.ledger.count().await.expect("count"), inserted as i64);

    let stats = completed(
        h.indexer
            .try_index_pass(CancellationToken::new())
            .await
            .expect("pass succeeds"),
    );
    assert_eq!(stats.tables_indexed + inserted, 3);
    assert_eq!(h.index.texts().len(), 3);
}
