//! Batched writes across a table's segments.

use std::collections::HashMap;

use crate::error::Result;
use crate::table::ldb::LdbBatch;
use crate::table::table::Table;

/// Groups puts and deletes into per-segment sub-batches. `write` commits
/// each sub-batch in turn; there is no atomicity across segments, and a
/// failing sub-batch aborts the rest.
pub struct TableBatch<'a> {
    table: &'a Table,
    batches: HashMap<String, LdbBatch>,
    size: usize,
}

impl<'a> TableBatch<'a> {
    pub(crate) fn new(table: &'a Table) -> Self {
        Self {
            table,
            batches: HashMap::new(),
            size: 0,
        }
    }

    pub async fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        // Ignore if the stored value is the same.
        if let Some(current) = self.table.get(key).await? {
            if current == value {
                return Ok(());
            }
        }

        let name = self.table.partition(key);
        let segment = match self.table.create_segment_if_not_exists(&name).await {
            Ok(segment) => segment,
            Err(e) => {
                tracing::error!(
                    table = self.table.name(),
                    segment = %name,
                    error = %e,
                    "Batch put failed to resolve segment"
                );
                return Err(e);
            }
        };

        self.batches
            .entry(name)
            .or_insert_with(|| LdbBatch::new(segment))
            .put(key, value);
        self.size += value.len();
        Ok(())
    }

    pub async fn delete(&mut self, key: &[u8]) -> Result<()> {
        // Ignore if the key doesn't exist.
        if !self.table.has(key).await? {
            return Ok(());
        }

        let name = self.table.partition(key);
        let segment = match self.table.create_segment_if_not_exists(&name).await {
            Ok(segment) => segment,
            Err(e) => {
                tracing::error!(
                    table = self.table.name(),
                    segment = %name,
                    error = %e,
                    "Batch delete failed to resolve segment"
                );
                return Err(e);
            }
        };

        self.batches
            .entry(name)
            .or_insert_with(|| LdbBatch::new(segment))
            .delete(key);
        Ok(())
    }

    /// Total bytes of values accumulated so far.
    pub fn value_size(&self) -> usize {
        self.size
    }

    /// Commits every sub-batch. A failure aborts the remaining sub-batches.
    pub fn write(&mut self) -> Result<()> {
        for batch in self.batches.values_mut() {
            batch.write()?;
        }
        Ok(())
    }

    pub fn reset(&mut self) {
        for batch in self.batches.values_mut() {
            batch.reset();
        }
        self.size = 0;
    }
}
