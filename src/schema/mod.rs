// Schema module
// Lazy, cancellable enumeration of table definitions from the relational source


use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::database::{RelationalSource, SourceError, TableSchema};

pub type SchemaStream =
    Pin<Box<dyn Stream<Item = Result<TableSchema, SourceError>> + Send + 'static>>;

#[derive(Clone)]
pub struct SchemaFetcher {
    source: Arc<dyn RelationalSource>,
}

impl SchemaFetcher {
    #[inline]
    pub fn new(source: Arc<dyn RelationalSource>) -> Self {
        Self { source }
    }

    /// Stream every table's definition in catalog order.
    ///
    /// A failure to list tables is yielded once and ends the stream. A failure to
    /// describe one table is logged and that table is skipped. Cancellation is
    /// checked before each table, and aborts an in-flight lookup.
    #[inline]
    pub fn fetch_all(&self, cancel: CancellationToken) -> SchemaStream {
        let source = Arc::clone(&self.source);

        Box::pin(async_stream::stream! {
            let listed = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                result = source.list_tables() => Some(result),
            };

            let tables = match listed {
                None => {
                    debug!("Schema enumeration cancelled before listing tables");
                    return;
                }
                Some(Err(e)) => {
                    yield Err(e);
                    return;
                }
                Some(Ok(tables)) => tables,
            };
            info!("Found {} tables in source", tables.len());

            let mut fetched = 0_usize;
            for name in tables {
                if cancel.is_cancelled() {
                    info!("Schema enumeration cancelled after {} tables", fetched);
                    break;
                }

                let described = tokio::select! {
                    biased;
                    () = cancel.cancelled() => None,
                    result = source.describe_table(&name) => Some(result),
                };

                match described {
                    None => {
                        info!("Schema enumeration cancelled while describing {}", name);
                        break;
                    }
                    Some(Ok(definition)) => {
                        fetched += 1;
                        yield Ok(TableSchema { name, definition });
                    }
                    Some(Err(e)) => warn!("Skipping table {}: {}", name, e),
                }
            }
        })
    }
}
