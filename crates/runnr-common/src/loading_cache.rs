//! A keyed cache whose entries load themselves.
//!
//! Each key owns a loader function. [`LoadingCache::put`] registers it and
//! starts the first load in the background; readers calling
//! [`LoadingCache::get`] while an entry is `Loading` park until it settles.
//!
//! Per-entry state machine:
//!
//! ```text
//!            put / refresh
//!                 │
//!                 ▼
//!   ┌──────── Loading ────────┐
//!   │ ok          │ err       │ cancel / drop
//!   ▼             ▼           ▼
//! Ready         Error      Canceled ── put / refresh ──▶ Loading
//! ```
//!
//! A refresh of an entry that already holds a value keeps serving that value
//! until the new load succeeds. Only one loader runs per key at a time: a new
//! load started after a cancel waits for the aborted task to finish first.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::CacheError;

type Loader<V> = Arc<dyn Fn() -> BoxFuture<'static, Result<V, String>> + Send + Sync>;

/// Lifecycle state of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Loading,
    Ready,
    Error,
    Canceled,
}

/// A snapshot of an entry returned by [`LoadingCache::get`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Value<V> {
    pub state: EntryState,
    /// The last successfully loaded value, if any.
    pub value: Option<V>,
    pub error: Option<CacheError>,
}

struct Slot<V> {
    state: EntryState,
    value: Option<V>,
    error: Option<CacheError>,
    generation: u64,
    in_flight: bool,
    task: Option<JoinHandle<()>>,
}

struct Entry<V> {
    slot: Mutex<Slot<V>>,
    loader: Loader<V>,
    settled: Notify,
}

/// Shared keyed store with per-entry load coordination.
///
/// Cloning is cheap and clones share the same entries.
pub struct LoadingCache<V> {
    entries: Arc<Mutex<HashMap<String, Arc<Entry<V>>>>>,
}

impl<V> Clone for LoadingCache<V> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<V> Default for LoadingCache<V> {
    fn default() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<V> std::fmt::Debug for LoadingCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadingCache")
            .field("entries", &self.entries.lock().len())
            .finish_non_exhaustive()
    }
}

impl<V: Clone + Send + Sync + 'static> LoadingCache<V> {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `loader` for `key` and start loading it.
    ///
    /// A canceled entry may be replaced; any other existing entry is kept and
    /// `Exists` is returned, so the first writer wins.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Exists`] if the key is present and not canceled.
    pub fn put<F, Fut, E>(&self, key: impl Into<String>, loader: F) -> Result<(), CacheError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let key = key.into();
        let loader: Loader<V> = Arc::new(move || -> BoxFuture<'static, Result<V, String>> {
            let fut = loader();
            Box::pin(async move { fut.await.map_err(|e| e.to_string()) })
        });

        let mut entries = self.entries.lock();
        let previous_task = match entries.get(&key) {
            Some(existing) => {
                let mut slot = existing.slot.lock();
                if slot.state != EntryState::Canceled {
                    return Err(CacheError::Exists { key });
                }
                slot.task.take()
            }
            None => None,
        };

        let entry = Arc::new(Entry {
            slot: Mutex::new(Slot {
                state: EntryState::Loading,
                value: None,
                error: None,
                generation: 0,
                in_flight: false,
                task: previous_task,
            }),
            loader,
            settled: Notify::new(),
        });
        entries.insert(key.clone(), Arc::clone(&entry));
        drop(entries);

        debug!(key = %key, "loading cache entry added");
        start_load(&entry);
        Ok(())
    }

    /// Get the entry for `key`, waiting while it is `Loading`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::NotExists`] if the key was never added or was dropped.
    pub async fn get(&self, key: &str) -> Result<Value<V>, CacheError> {
        let entry = self.entry(key)?;

        loop {
            let settled = entry.settled.notified();
            {
                let slot = entry.slot.lock();
                if slot.state != EntryState::Loading {
                    return Ok(Value {
                        state: slot.state,
                        value: slot.value.clone(),
                        error: slot.error.clone(),
                    });
                }
            }
            settled.await;
        }
    }

    /// Run the loader again for an existing entry.
    ///
    /// Does nothing if a load is already running for the key.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::NotExists`] if the key is absent.
    pub fn refresh(&self, key: &str) -> Result<(), CacheError> {
        let entry = self.entry(key)?;
        if entry.slot.lock().in_flight {
            return Ok(());
        }
        start_load(&entry);
        Ok(())
    }

    /// Abort the running load for `key`.
    ///
    /// A `Loading` entry becomes `Canceled` and its waiters are released; an
    /// entry being refreshed keeps its current value and state.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::NotExists`] if the key is absent.
    pub fn cancel(&self, key: &str) -> Result<(), CacheError> {
        let entry = self.entry(key)?;
        {
            let mut slot = entry.slot.lock();
            if !slot.in_flight {
                return Ok(());
            }
            slot.in_flight = false;
            slot.generation += 1;
            if let Some(task) = &slot.task {
                task.abort();
            }
            if slot.state == EntryState::Loading {
                slot.state = EntryState::Canceled;
                slot.error = Some(CacheError::Canceled);
            }
        }
        entry.settled.notify_waiters();
        debug!(key = %key, "loading cache entry canceled");
        Ok(())
    }

    /// Remove `key` entirely. Waiters observe `Canceled`.
    ///
    /// Returns `false` if the key was not present.
    pub fn drop_key(&self, key: &str) -> bool {
        let Some(entry) = self.entries.lock().remove(key) else {
            return false;
        };
        {
            let mut slot = entry.slot.lock();
            slot.in_flight = false;
            slot.generation += 1;
            if let Some(task) = slot.task.take() {
                task.abort();
            }
            slot.state = EntryState::Canceled;
            slot.error = Some(CacheError::Canceled);
        }
        entry.settled.notify_waiters();
        true
    }

    /// Returns `true` if the key has an entry in any state.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns `true` if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry(&self, key: &str) -> Result<Arc<Entry<V>>, CacheError> {
        self.entries
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| CacheError::NotExists { key: key.into() })
    }
}

/// Start a load for `entry`, chained after any previous task.
fn start_load<V: Clone + Send + Sync + 'static>(entry: &Arc<Entry<V>>) {
    let mut slot = entry.slot.lock();
    slot.generation += 1;
    slot.in_flight = true;
    if slot.value.is_none() || slot.state == EntryState::Canceled {
        slot.state = EntryState::Loading;
        slot.error = None;
    }

    let generation = slot.generation;
    let previous = slot.task.take();
    let task_entry = Arc::clone(entry);

    slot.task = Some(tokio::spawn(async move {
        if let Some(previous) = previous {
            let _ = previous.await;
        }
        let result = (task_entry.loader)().await;
        finish_load(&task_entry, generation, result);
    }));
}

fn finish_load<V>(entry: &Entry<V>, generation: u64, result: Result<V, String>) {
    {
        let mut slot = entry.slot.lock();
        if slot.generation != generation || slot.state == EntryState::Canceled {
            return;
        }
        slot.in_flight = false;
        match result {
            Ok(value) => {
                slot.state = EntryState::Ready;
                slot.value = Some(value);
                slot.error = None;
            }
            Err(reason) => {
                slot.state = EntryState::Error;
                slot.error = Some(CacheError::Load { reason });
            }
        }
    }
    entry.settled.notify_waiters();
}
