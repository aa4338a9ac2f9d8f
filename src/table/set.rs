//! Bounded-concurrency cache over the universe of immutable segments.
//!
//! The set tracks two populations: the *universe* of every known immutable
//! segment, opened or not, and a bounded LRU cache of the segments currently
//! open. A weighted semaphore with the same capacity as the cache bounds the
//! number of simultaneously held acquisitions, so callers can never pin more
//! segments than the cache can hold and eviction never runs on a segment
//! with outstanding holders.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::ops::Deref;
use std::sync::{Arc, Mutex, RwLock};

use lru::LruCache;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::Result;
use crate::table::segment::Segment;
use crate::Error;

/// A successfully acquired segment. Holds one semaphore permit, returned
/// when the handle is dropped.
pub struct SegmentHandle {
    segment: Arc<Segment>,
    _permit: OwnedSemaphorePermit,
}

impl SegmentHandle {
    pub fn segment(&self) -> &Arc<Segment> {
        &self.segment
    }
}

impl Deref for SegmentHandle {
    type Target = Segment;

    fn deref(&self) -> &Segment {
        &self.segment
    }
}

pub struct SegmentSet {
    segments: RwLock<HashMap<String, Arc<Segment>>>,
    cache: Mutex<LruCache<String, Arc<Segment>>>,
    semaphore: Arc<Semaphore>,
}

impl SegmentSet {
    pub fn new(max_open: usize) -> Self {
        let max_open = max_open.max(1);
        Self {
            segments: RwLock::new(HashMap::new()),
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(max_open).expect("max_open >= 1"),
            )),
            semaphore: Arc::new(Semaphore::new(max_open)),
        }
    }

    /// Number of segments in the universe.
    pub fn len(&self) -> usize {
        self.segments.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Adds a segment to the universe without opening or caching it.
    pub fn add(&self, segment: Segment) -> Result<()> {
        self.segments
            .write()?
            .insert(segment.name().to_string(), Arc::new(segment));
        Ok(())
    }

    pub fn contains(&self, name: &str) -> Result<bool> {
        Ok(self.segments.read()?.contains_key(name))
    }

    /// All segments in the universe, sorted by name.
    pub fn slice(&self) -> Result<Vec<Arc<Segment>>> {
        let mut segments: Vec<_> = self.segments.read()?.values().cloned().collect();
        segments.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(segments)
    }

    /// Acquires the named segment, opening it if necessary. Blocks while
    /// the full complement of permits is outstanding. Returns `None` if the
    /// name is not in the universe.
    pub async fn acquire(&self, name: &str) -> Result<Option<SegmentHandle>> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Closed)?;

        if let Some(segment) = self.cache.lock()?.get(name).cloned() {
            return Ok(Some(SegmentHandle {
                segment,
                _permit: permit,
            }));
        }

        let segment = match self.segments.read()?.get(name).cloned() {
            Some(segment) => segment,
            // Permit released by drop.
            None => return Ok(None),
        };

        // Open errors release the permit the same way.
        segment.open()?;

        let displaced = self
            .cache
            .lock()?
            .push(name.to_string(), segment.clone());
        if let Some((displaced_name, _)) = displaced {
            if displaced_name != name {
                self.on_evicted(&displaced_name);
            }
        }

        Ok(Some(SegmentHandle {
            segment,
            _permit: permit,
        }))
    }

    /// Removes the named segment from the universe and evicts any cached
    /// instance. Dropping the future while it waits for a permit is the
    /// cancellation path: the name is already gone from the universe and the
    /// stale cache entry is reclaimed at the next eviction or close.
    pub async fn remove(&self, name: &str) -> Result<()> {
        self.segments.write()?.remove(name);

        let _permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Closed)?;
        let popped = self.cache.lock()?.pop(name);
        if popped.is_some() {
            // The universe entry is already gone, so this never closes the
            // instance; the caller has repurposed its backing resource.
            self.on_evicted(name);
        }
        Ok(())
    }

    /// Eviction callback: purge where the variant supports it, close
    /// otherwise. Failures are logged, never propagated.
    fn on_evicted(&self, name: &str) {
        let segment = match self
            .segments
            .read()
            .ok()
            .and_then(|segments| segments.get(name).cloned())
        {
            Some(segment) => segment,
            None => return,
        };

        if segment.is_purgeable() {
            tracing::info!(name, path = %segment.path().display(), "Purging evicted segment");
            if let Err(e) = segment.purge() {
                tracing::error!(name, error = %e, "Failed to purge segment");
            }
        } else if let Err(e) = segment.close() {
            tracing::error!(name, error = %e, "Failed to close segment");
        }
    }

    /// Clears the universe and closes every cached segment. Pending and
    /// future acquisitions fail with `Closed`.
    pub fn close(&self) -> Result<()> {
        self.semaphore.close();
        self.segments.write()?.clear();

        // Cached entries are the only ones holding resources (acquire is the
        // sole opener), so closing the drained instances directly leaks
        // nothing. Data-bearing files are not purged at shutdown.
        let mut cache = self.cache.lock()?;
        while let Some((name, segment)) = cache.pop_lru() {
            if let Err(e) = segment.close() {
                tracing::error!(name = %name, error = %e, "Failed to close cached segment");
            }
        }
        Ok(())
    }

    /// Permits currently available, i.e. `max_open` minus outstanding
    /// acquisitions.
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}
