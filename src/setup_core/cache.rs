//! Shared result cache and single-flight coordination
//!
//! Two layers that compose in the engine: a read-through cache over an
//! expiring key-value store, and a single-flight slot so concurrent
//! callers share one in-progress detection cycle.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

pub const SETUPS_CACHE_KEY: &str = "spx_command_center:setups";
pub const SETUPS_CACHE_TTL_SECONDS: u64 = 10;
pub const PREVIOUS_SETUPS_KEY: &str = "spx_command_center:setups:previous";
pub const PREVIOUS_SETUPS_TTL_SECONDS: u64 = 30 * 60;

/// Key-value store with expiring entries
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: String, ttl_seconds: u64) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: RwLock<HashMap<String, (String, Instant)>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|(_, expires_at)| Instant::now() < *expires_at)
            .map(|(value, _)| value.clone()))
    }

    async fn set(&self, key: &str, value: String, ttl_seconds: u64) -> Result<()> {
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        entries.retain(|_, (_, expires_at)| now < *expires_at);
        entries.insert(key.to_string(), (value, now + Duration::from_secs(ttl_seconds)));
        Ok(())
    }
}

/// Cache-aside view of one key holding a JSON value. Store errors and
/// undecodable entries read as a miss; write errors are logged.
pub struct ReadThroughCache<T> {
    store: Arc<dyn KvStore>,
    key: &'static str,
    ttl_seconds: u64,
    _value: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> ReadThroughCache<T> {
    pub fn new(store: Arc<dyn KvStore>, key: &'static str, ttl_seconds: u64) -> Self {
        Self { store, key, ttl_seconds, _value: PhantomData }
    }

    pub fn key(&self) -> &'static str {
        self.key
    }

    pub async fn get(&self) -> Option<T> {
        let raw = match self.store.get(self.key).await {
            Ok(raw) => raw?,
            Err(e) => {
                warn!("Cache read failed for {}: {:#}", self.key, e);
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Discarding undecodable cache entry {}: {}", self.key, e);
                None
            }
        }
    }

    pub async fn set(&self, value: &T) {
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Failed to encode cache entry {}: {}", self.key, e);
                return;
            }
        };
        if let Err(e) = self.store.set(self.key, raw, self.ttl_seconds).await {
            warn!("Cache write failed for {}: {:#}", self.key, e);
        }
    }
}

pub type SharedResult<T> = Result<T, Arc<anyhow::Error>>;
type InFlight<T> = Shared<BoxFuture<'static, SharedResult<T>>>;

/// One in-flight computation at a time. Callers arriving while it runs
/// await the same outcome, failures included. The slot clears once the
/// computation finishes.
pub struct SingleFlight<T: Clone> {
    slot: Mutex<Option<(u64, InFlight<T>)>>,
    generation: AtomicU64,
}

impl<T: Clone + Send + Sync + 'static> Default for SingleFlight<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> SingleFlight<T> {
    pub fn new() -> Self {
        Self { slot: Mutex::new(None), generation: AtomicU64::new(0) }
    }

    pub fn is_running(&self) -> bool {
        self.slot.lock().map(|slot| slot.is_some()).unwrap_or(false)
    }

    /// Join the running computation, or start `start()` if none is running.
    pub async fn run<F>(&self, start: F) -> SharedResult<T>
    where
        F: FnOnce() -> BoxFuture<'static, Result<T>>,
    {
        let (generation, flight) = {
            let mut slot = self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            match slot.as_ref() {
                Some((generation, flight)) => {
                    debug!("Joining in-flight computation {}", generation);
                    (*generation, flight.clone())
                }
                None => {
                    let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
                    let flight = start().map(|result| result.map_err(Arc::new)).boxed().shared();
                    *slot = Some((generation, flight.clone()));
                    (generation, flight)
                }
            }
        };

        let result = flight.await;

        let mut slot = self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if matches!(slot.as_ref(), Some((current, _)) if *current == generation) {
            *slot = None;
        }
        result
    }
}
