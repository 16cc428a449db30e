//! Paged table scans shared by every adapter.
//!
//! Each driver supplies a closure that fetches one [`Page`]; this module owns
//! the loop that advances the cursor and feeds batches into a bounded
//! channel, so the reader stays at most a few batches ahead of the writer.

use std::future::Future;

use tokio::sync::mpsc;
use tracing::debug;

use crate::core::{Batch, Page, Row, Table};
use crate::error::{MigrateError, Result};

/// Batches buffered between a reader task and its consumer.
pub const READ_AHEAD: usize = 4;

/// Spawn a task that scans `table` page by page through `fetch`.
///
/// A page shorter than `batch_size` ends the scan. An empty table (or one
/// whose size is an exact multiple of `batch_size`) ends with an empty final
/// batch. The first error is sent in-band and stops the task.
pub fn spawn_paged_reader<F, Fut>(
    table: Table,
    batch_size: usize,
    mut fetch: F,
) -> mpsc::Receiver<Result<Batch>>
where
    F: FnMut(Page) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Vec<Row>>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(READ_AHEAD);
    let batch_size = batch_size.max(1);

    tokio::spawn(async move {
        let mut page = Page::first(&table);
        let key_index = match &page {
            Page::Keyset { column, .. } => table
                .columns
                .iter()
                .position(|c| c.name.eq_ignore_ascii_case(column)),
            Page::Offset { .. } => None,
        };
        let mut pages = 0u64;

        loop {
            let rows = match fetch(page.clone()).await {
                Ok(rows) => rows,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };
            pages += 1;
            let is_last = rows.len() < batch_size;

            if !is_last {
                match advance(&page, &rows, key_index) {
                    Ok(next) => page = next,
                    Err(e) => {
                        let _ = tx.send(Err(MigrateError::read(
                            table.full_name(),
                            e,
                            false,
                        )))
                        .await;
                        return;
                    }
                }
            }

            let batch = if is_last {
                Batch::new(rows).mark_final()
            } else {
                Batch::new(rows)
            };
            if tx.send(Ok(batch)).await.is_err() {
                debug!("{}: reader dropped after {} pages", table.full_name(), pages);
                return;
            }
            if is_last {
                debug!("{}: scan finished after {} pages", table.full_name(), pages);
                return;
            }
        }
    });

    rx
}

/// Cursor position after `rows` were read from `page`.
fn advance(page: &Page, rows: &[Row], key_index: Option<usize>) -> std::result::Result<Page, String> {
    match page {
        Page::Keyset { column, .. } => {
            let idx = key_index.ok_or_else(|| format!("key column {} not selected", column))?;
            let last = rows
                .last()
                .and_then(|r| r.get(idx))
                .and_then(|v| v.as_i64())
                .ok_or_else(|| format!("key column {} returned a non-integer value", column))?;
            Ok(Page::Keyset {
                column: column.clone(),
                after: Some(last),
            })
        }
        Page::Offset { order_by, offset } => Ok(Page::Offset {
            order_by: order_by.clone(),
            offset: offset + rows.len() as u64,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Column, SqlValue};
    use crate::dialect::CanonicalType;

    fn numbered(n: i64) -> (Table, Vec<Row>) {
        let mut t = Table::new("app", "events");
        t.columns
            .push(Column::new("id", "bigint", CanonicalType::BigInteger).not_null());
        t.primary_key = vec!["id".into()];
        let rows = (1..=n).map(|i| vec![SqlValue::I64(i)]).collect();
        (t, rows)
    }

    fn keyset_source(rows: Vec<Row>, limit: usize) -> impl FnMut(Page) -> futures::future::Ready<Result<Vec<Row>>> {
        move |page| {
            let after = match page {
                Page::Keyset { after, .. } => after.unwrap_or(i64::MIN),
                Page::Offset { .. } => unreachable!(),
            };
            let out = rows
                .iter()
                .filter(|r| r[0].as_i64().unwrap_or(0) > after)
                .take(limit)
                .cloned()
                .collect();
            futures::future::ready(Ok(out))
        }
    }

    #[tokio::test]
    async fn test_keyset_scan_ends_with_short_page() {
        let (table, rows) = numbered(1050);
        let mut rx = spawn_paged_reader(table, 500, keyset_source(rows, 500));
        let mut sizes = Vec::new();
        while let Some(batch) = rx.recv().await {
            let batch = batch.unwrap();
            sizes.push(batch.len());
            if batch.is_last {
                break;
            }
        }
        assert_eq!(sizes, vec![500, 500, 50]);
    }

    #[tokio::test]
    async fn test_exact_multiple_ends_with_empty_batch() {
        let (table, rows) = numbered(1000);
        let mut rx = spawn_paged_reader(table, 500, keyset_source(rows, 500));
        let mut batches = Vec::new();
        while let Some(batch) = rx.recv().await {
            batches.push(batch.unwrap());
        }
        assert_eq!(batches.len(), 3);
        assert!(batches[2].is_empty() && batches[2].is_last);
    }

    #[tokio::test]
    async fn test_fetch_error_is_delivered() {
        let (table, _) = numbered(0);
        let mut rx = spawn_paged_reader(table, 10, |_| async {
            Err(MigrateError::read("app.events", "connection reset", true))
        });
        let err = rx.recv().await.unwrap().unwrap_err();
        assert!(err.is_transient());
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_offset_advance() {
        let page = Page::Offset {
            order_by: vec!["name".into()],
            offset: 100,
        };
        let rows = vec![vec![SqlValue::Null]; 25];
        assert_eq!(
            advance(&page, &rows, None).unwrap(),
            Page::Offset {
                order_by: vec!["name".into()],
                offset: 125
            }
        );
    }
}
