//! Background compaction.
//!
//! The write path compacts inline under the table's write lock, which is
//! fine while segments are small; a long-lived node runs this task instead
//! so aging segments are converted off the write path.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::table::table::Table;

/// Handle to a table's background compaction loop.
///
/// The loop calls [`Table::compact`] every `compaction_interval`, competing
/// for the same write lock as inline compaction, so conversions of a given
/// segment name stay mutually exclusive with writes to it.
pub struct CompactionTask {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl CompactionTask {
    /// Spawns the compaction loop for `table`.
    pub fn spawn(table: Arc<Table>) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(table.config().compaction_interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = table.compact().await {
                            tracing::error!(
                                table = table.name(),
                                error = %e,
                                "Background compaction failed"
                            );
                        }
                    }

                    _ = shutdown_rx.changed() => {
                        tracing::info!(table = table.name(), "Compaction loop stopping");
                        break;
                    }
                }
            }
        });

        Self {
            handle,
            shutdown_tx,
        }
    }

    /// Signals the loop to stop and waits for the in-flight pass, if any,
    /// to finish.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown_tx.send(true).ok();
        self.handle.await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableConfig;
    use crate::table::partition::Partitioner;
    use std::time::Duration;
    use tempfile::tempdir;

    fn first_byte_partitioner() -> impl Partitioner + 'static {
        |key: &[u8]| format!("{:02x}", key.first().copied().unwrap_or(0))
    }

    #[tokio::test]
    async fn test_background_compaction_converts_aged_segments() {
        let dir = tempdir().expect("tempdir");

        // Two mutable segments written with inline compaction disabled.
        {
            let keep = TableConfig::default().min_mutable_segments(8);
            let staging =
                Table::open("blocks", dir.path(), first_byte_partitioner(), keep).expect("open");
            staging.put(b"\x01a", b"1").await.expect("put");
            staging.put(b"\x02b", b"2").await.expect("put");
            staging.close().await.expect("close");
        }

        let config = TableConfig::default()
            .min_mutable_segments(1)
            .min_compaction_age(Duration::ZERO)
            .compaction_interval(Duration::from_millis(10));
        let table = Arc::new(
            Table::open("blocks", dir.path(), first_byte_partitioner(), config).expect("reopen"),
        );
        assert_eq!(table.immutable_segment_count(), 0);

        let task = CompactionTask::spawn(table.clone());

        // The oldest segment becomes immutable without any write arriving.
        let mut compacted = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if table.immutable_segment_count() == 1 {
                compacted = true;
                break;
            }
        }
        assert!(compacted, "background loop never compacted");

        // The active segment stays mutable and data survives the conversion.
        assert!(table.active_segment().await.is_some());
        assert_eq!(table.get(b"\x01a").await.unwrap(), Some(b"1".to_vec()));
        assert_eq!(table.get(b"\x02b").await.unwrap(), Some(b"2".to_vec()));

        task.shutdown().await.expect("shutdown");
        table.close().await.expect("close");
    }

    #[tokio::test]
    async fn test_loop_skips_young_segments_and_shuts_down() {
        let dir = tempdir().expect("tempdir");

        // Freshly written segments stay under the age gate, so every pass
        // skips them.
        let config = TableConfig::default()
            .min_mutable_segments(1)
            .min_compaction_age(Duration::from_secs(3600))
            .compaction_interval(Duration::from_millis(10));
        let table = Arc::new(
            Table::open("blocks", dir.path(), first_byte_partitioner(), config).expect("open"),
        );
        table.put(b"\x01a", b"1").await.expect("put");
        table.put(b"\x02b", b"2").await.expect("put");

        let task = CompactionTask::spawn(table.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(table.immutable_segment_count(), 0);

        // Returning from shutdown means the loop task exited.
        task.shutdown().await.expect("shutdown");
        assert_eq!(table.immutable_segment_count(), 0);

        table.close().await.expect("close");
    }
}
