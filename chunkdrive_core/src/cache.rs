//! Bounded in-memory cache of decrypted chunk envelopes with
//! at-most-one-in-flight request coalescing.
//!
//! Lock discipline: take the mutex, check for a hit; on a miss,
//! register a pending slot and release the mutex before fetching; on
//! completion, re-take it to install the result and wake waiters. No
//! lock is ever held across a fetch, and hits never block on pending
//! misses for other addresses.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::trace;

use crate::{
    address::Address,
    envelope::{self, ChunkKey, Envelope},
    error::{ChunkError, ChunkResult},
    store::BlobStore,
};

type FetchResult = Result<Arc<Envelope>, Arc<ChunkError>>;

pub struct ChunkCache {
    store: Arc<dyn BlobStore>,
    repo_secret: [u8; 32],
    /// Maximum resident entries; 0 disables retention entirely while
    /// keeping the coalescing behavior.
    capacity: usize,
    inner: Mutex<CacheInner>,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<Address, CacheEntry>,
    pending: HashMap<Address, watch::Receiver<Option<FetchResult>>>,
    tick: u64,
}

struct CacheEntry {
    envelope: Arc<Envelope>,
    last_used: u64,
}

enum Action {
    Hit(Arc<Envelope>),
    Wait(watch::Receiver<Option<FetchResult>>),
    Lead(watch::Sender<Option<FetchResult>>),
}

impl ChunkCache {
    pub fn new(store: Arc<dyn BlobStore>, repo_secret: [u8; 32], capacity: usize) -> Self {
        Self {
            store,
            repo_secret,
            capacity,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Returns the decrypted envelope for `address`, fetching it at
    /// most once no matter how many callers ask concurrently. A
    /// failed fetch does not poison the slot; later callers retry.
    pub async fn get(&self, address: Address) -> ChunkResult<Arc<Envelope>> {
        loop {
            let action = {
                let mut inner = self.inner.lock().expect("cache mutex poisoned");
                inner.tick += 1;
                let tick = inner.tick;
                if let Some(entry) = inner.entries.get_mut(&address) {
                    entry.last_used = tick;
                    Action::Hit(entry.envelope.clone())
                } else if let Some(rx) = inner.pending.get(&address) {
                    Action::Wait(rx.clone())
                } else {
                    let (tx, rx) = watch::channel(None);
                    inner.pending.insert(address, rx);
                    Action::Lead(tx)
                }
            };

            match action {
                Action::Hit(envelope) => return Ok(envelope),
                Action::Wait(mut rx) => {
                    match rx.wait_for(|slot| slot.is_some()).await {
                        Ok(slot) => match slot.clone().expect("slot checked above") {
                            Ok(envelope) => return Ok(envelope),
                            Err(shared) => return Err(ChunkError::Shared(shared)),
                        },
                        // The leader went away without a result. Clear
                        // the dead slot (unless a new leader already
                        // replaced it) and start over.
                        Err(_) => {
                            let mut inner = self.inner.lock().expect("cache mutex poisoned");
                            if let Some(stale) = inner.pending.get(&address) {
                                if stale.has_changed().is_err() {
                                    inner.pending.remove(&address);
                                }
                            }
                            continue;
                        }
                    }
                }
                Action::Lead(tx) => {
                    let result = self.fetch(address).await;
                    let shared: FetchResult = match result {
                        Ok(envelope) => Ok(Arc::new(envelope)),
                        Err(err) => Err(Arc::new(err)),
                    };
                    let mut inner = self.inner.lock().expect("cache mutex poisoned");
                    inner.pending.remove(&address);
                    if let Ok(envelope) = &shared {
                        inner.insert(address, envelope.clone(), self.capacity);
                    }
                    let _ = tx.send(Some(shared.clone()));
                    return match shared {
                        Ok(envelope) => Ok(envelope),
                        Err(err) => Err(ChunkError::Shared(err)),
                    };
                }
            }
        }
    }

    async fn fetch(&self, address: Address) -> ChunkResult<Envelope> {
        trace!(chunk = %address.fmt_short(), "fetching chunk");
        let bytes = self
            .store
            .get(&address.to_hex())
            .await
            .map_err(|e| ChunkError::from_store(address, e))?;
        envelope::open(address, &bytes, ChunkKey::Repo(&self.repo_secret))
    }
}

impl CacheInner {
    fn insert(&mut self, address: Address, envelope: Arc<Envelope>, capacity: usize) {
        if capacity == 0 {
            return;
        }
        while self.entries.len() >= capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(a, _)| *a)
                .expect("entries is non-empty");
            self.entries.remove(&oldest);
        }
        let tick = self.tick;
        self.entries.insert(
            address,
            CacheEntry {
                envelope,
                last_used: tick,
            },
        );
    }
}

impl std::fmt::Debug for ChunkCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkCache")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}
