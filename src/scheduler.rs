//! TTL expiration scheduler.
//!
//! Tracks one entry per canonical reference with an absolute expiry and a
//! per-entry timer task.  When a timer fires the entry is removed and the
//! registered expiry callback for its kind (blob or manifest) runs; callback
//! failures are logged and never retried, because the next client request
//! regenerates whatever state the callback failed to clean up.
//!
//! State is durable: the full entry set is serialized as one JSON snapshot
//! at a fixed path on the storage driver, written by a debounced background
//! flusher while dirty and once more on shutdown.  On start the snapshot is
//! reloaded; entries whose expiry has already passed fire immediately.  An
//! unparseable snapshot is treated as empty state with a warning.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::reference::CanonicalReference;
use crate::storage::{StorageDriver, StorageError};

/// How often the background flusher writes a dirty snapshot.
const FLUSH_INTERVAL: Duration = Duration::from_secs(10);

/// Async callback invoked with the reference of an expired entry.
pub type ExpiryCallback =
    Arc<dyn Fn(CanonicalReference) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// What kind of artifact a scheduler entry tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Blob,
    Manifest,
}

/// One scheduled expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerEntry {
    pub key: String,
    pub kind: EntryKind,
    pub expiry: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    entries: Vec<SchedulerEntry>,
}

struct State {
    entries: HashMap<String, SchedulerEntry>,
    timers: HashMap<String, AbortHandle>,
    dirty: bool,
    started: bool,
}

struct Inner {
    driver: Arc<dyn StorageDriver>,
    state_path: String,
    on_blob_expire: ExpiryCallback,
    on_manifest_expire: ExpiryCallback,
    state: Mutex<State>,
    stop: CancellationToken,
}

/// Persistent TTL scheduler shared by every proxied repository.
#[derive(Clone)]
pub struct TtlScheduler {
    inner: Arc<Inner>,
}

impl TtlScheduler {
    pub fn new(
        driver: Arc<dyn StorageDriver>,
        state_path: impl Into<String>,
        on_blob_expire: ExpiryCallback,
        on_manifest_expire: ExpiryCallback,
    ) -> Self {
        TtlScheduler {
            inner: Arc::new(Inner {
                driver,
                state_path: state_path.into(),
                on_blob_expire,
                on_manifest_expire,
                state: Mutex::new(State {
                    entries: HashMap::new(),
                    timers: HashMap::new(),
                    dirty: false,
                    started: false,
                }),
                stop: CancellationToken::new(),
            }),
        }
    }

    /// Schedule (or reschedule) a blob expiry.
    pub fn add_blob(&self, reference: &CanonicalReference, ttl: Duration) {
        self.add(reference, EntryKind::Blob, ttl);
    }

    /// Schedule (or reschedule) a manifest expiry.
    pub fn add_manifest(&self, reference: &CanonicalReference, ttl: Duration) {
        self.add(reference, EntryKind::Manifest, ttl);
    }

    fn add(&self, reference: &CanonicalReference, kind: EntryKind, ttl: Duration) {
        let key = reference.to_string();
        let expiry = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default();
        let entry = SchedulerEntry {
            key: key.clone(),
            kind,
            expiry,
        };

        let mut state = self.inner.state.lock().unwrap();
        if let Some(old) = state.timers.remove(&key) {
            old.abort();
        }
        state.entries.insert(key.clone(), entry);
        state.dirty = true;
        if state.started {
            let handle = Inner::arm(&self.inner, key.clone(), ttl);
            state.timers.insert(key, handle);
        }
        debug!(reference = %reference, kind = ?kind, ttl_secs = ttl.as_secs(), "scheduled expiry");
    }

    /// Load the snapshot, arm timers, and begin the background flusher.
    pub async fn start(&self) -> Result<()> {
        let loaded = self.load_snapshot().await?;
        let now = Utc::now();

        {
            let mut state = self.inner.state.lock().unwrap();
            state.started = true;
            for entry in loaded {
                // Entries added in-memory before start are newer than the
                // snapshot and win.
                state.entries.entry(entry.key.clone()).or_insert(entry);
            }
            let unarmed: Vec<(String, DateTime<Utc>)> = state
                .entries
                .iter()
                .filter(|(key, _)| !state.timers.contains_key(*key))
                .map(|(key, entry)| (key.clone(), entry.expiry))
                .collect();
            for (key, expiry) in unarmed {
                let delay = (expiry - now).to_std().unwrap_or(Duration::ZERO);
                let handle = Inner::arm(&self.inner, key.clone(), delay);
                state.timers.insert(key, handle);
            }
            info!(entries = state.entries.len(), "ttl scheduler started");
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = inner.stop.cancelled() => break,
                    _ = tokio::time::sleep(FLUSH_INTERVAL) => {}
                }
                if inner.take_dirty() {
                    if let Err(e) = inner.flush().await {
                        inner.mark_dirty();
                        warn!(error = %e, "scheduler snapshot write failed; will retry");
                    }
                }
            }
        });

        Ok(())
    }

    /// Stop all timers and flush the final snapshot before returning.
    pub async fn stop(&self) {
        self.inner.stop.cancel();
        {
            let mut state = self.inner.state.lock().unwrap();
            for (_, handle) in state.timers.drain() {
                handle.abort();
            }
        }
        if let Err(e) = self.inner.flush().await {
            error!(error = %e, "final scheduler snapshot write failed");
        }
        info!("ttl scheduler stopped");
    }

    /// Current entries, sorted by key.  Used by tests and the metrics gauge.
    pub fn pending(&self) -> Vec<SchedulerEntry> {
        let state = self.inner.state.lock().unwrap();
        let mut entries: Vec<SchedulerEntry> = state.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    async fn load_snapshot(&self) -> Result<Vec<SchedulerEntry>> {
        let raw = match self.inner.driver.get_content(&self.inner.state_path).await {
            Ok(raw) => raw,
            Err(StorageError::NotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice::<Snapshot>(&raw) {
            Ok(snapshot) => Ok(snapshot.entries),
            Err(e) => {
                warn!(
                    path = %self.inner.state_path,
                    error = %e,
                    "unparseable scheduler snapshot; starting with empty state"
                );
                Ok(Vec::new())
            }
        }
    }
}

impl Inner {
    /// Spawn the timer task for one entry.
    fn arm(inner: &Arc<Inner>, key: String, delay: Duration) -> AbortHandle {
        let inner = Arc::clone(inner);
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = inner.stop.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            inner.fire(&key).await;
        });
        handle.abort_handle()
    }

    async fn fire(&self, key: &str) {
        let entry = {
            let mut state = self.state.lock().unwrap();
            state.timers.remove(key);
            match state.entries.remove(key) {
                Some(entry) => {
                    state.dirty = true;
                    entry
                }
                // Rescheduled or removed while this timer was firing.
                None => return,
            }
        };

        let reference: CanonicalReference = match entry.key.parse() {
            Ok(reference) => reference,
            Err(e) => {
                error!(key = %entry.key, error = %e, "scheduler entry key is not a canonical reference");
                return;
            }
        };

        debug!(key = %entry.key, kind = ?entry.kind, "expiry fired");
        let callback = match entry.kind {
            EntryKind::Blob => Arc::clone(&self.on_blob_expire),
            EntryKind::Manifest => Arc::clone(&self.on_manifest_expire),
        };

        match std::panic::AssertUnwindSafe(callback(reference)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(key = %entry.key, error = %e, "expiry callback failed");
            }
            Err(_) => {
                error!(key = %entry.key, "expiry callback panicked");
            }
        }
    }

    fn take_dirty(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        std::mem::take(&mut state.dirty)
    }

    fn mark_dirty(&self) {
        self.state.lock().unwrap().dirty = true;
    }

    /// Serialize the entry set and write it through the driver's atomic
    /// whole-object write.  The map is copied under the lock; the write
    /// happens outside it.
    async fn flush(&self) -> Result<()> {
        let snapshot = {
            let state = self.state.lock().unwrap();
            let mut entries: Vec<SchedulerEntry> = state.entries.values().cloned().collect();
            entries.sort_by(|a, b| a.key.cmp(&b.key));
            Snapshot { entries }
        };
        let raw = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| StorageError::Io(std::io::Error::other(e)))?;
        self.driver.put_content(&self.state_path, raw.into()).await?;
        debug!(entries = snapshot.entries.len(), "scheduler snapshot written");
        Ok(())
    }
}
