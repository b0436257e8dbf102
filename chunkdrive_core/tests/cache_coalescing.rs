//! Cache behavior tests: request coalescing, LRU eviction, and
//! recovery after failed fetches, driven through a counting store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use chunkdrive_core::store::StoreResult;
use chunkdrive_core::{BlobStore, ChunkError, ImportOptions, ImportReceipt, Section, TreeReader, import};
use chunkdrive_store_memory::MemoryStore;

const REPO_KEY: &[u8] = b"repo";
const UNLOCK_KEY: &[u8] = b"unlock";

/// Wraps a populated memory store, counting `get` calls per name and
/// optionally slowing them down so concurrent readers overlap.
#[derive(Debug)]
struct CountingStore {
    inner: Arc<MemoryStore>,
    gets: Mutex<HashMap<String, u64>>,
    delay: Duration,
    fail_next: AtomicBool,
}

impl CountingStore {
    fn new(inner: Arc<MemoryStore>, delay: Duration) -> Self {
        Self {
            inner,
            gets: Mutex::new(HashMap::new()),
            delay,
            fail_next: AtomicBool::new(false),
        }
    }

    fn gets_for(&self, name: &str) -> u64 {
        *self.gets.lock().unwrap().get(name).unwrap_or(&0)
    }

    fn total_gets(&self) -> u64 {
        self.gets.lock().unwrap().values().sum()
    }
}

#[async_trait::async_trait]
impl BlobStore for CountingStore {
    async fn put(&self, name: &str, bytes: Bytes) -> StoreResult<()> {
        self.inner.put(name, bytes).await
    }

    async fn get(&self, name: &str) -> StoreResult<Bytes> {
        *self
            .gets
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert(0) += 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(anyhow::anyhow!("injected store failure"));
        }
        self.inner.get(name).await
    }

    async fn exists(&self, name: &str) -> StoreResult<bool> {
        self.inner.exists(name).await
    }
}

/// Imports a two-leaf device (chunk_size 10: 1024-byte leaves, first
/// leaf 0x11, second 0x22) and wraps its store in a counter.
async fn two_leaf_device(delay: Duration) -> (Arc<CountingStore>, ImportReceipt) {
    let memory = Arc::new(MemoryStore::new());
    let mut content = vec![0x11u8; 1024];
    content.extend_from_slice(&[0x22u8; 1024]);
    let receipt = import(
        memory.clone() as Arc<dyn BlobStore>,
        REPO_KEY,
        UNLOCK_KEY,
        ImportOptions {
            chunk_size: 10,
            block_size: 512,
            compress: true,
        },
        vec![Ok(Section::Data(content.into()))],
        |_| {},
    )
    .await
    .unwrap();
    (Arc::new(CountingStore::new(memory, delay)), receipt)
}

async fn open_reader(
    store: &Arc<CountingStore>,
    receipt: &ImportReceipt,
    cache_size: usize,
) -> TreeReader {
    TreeReader::open(
        store.clone() as Arc<dyn BlobStore>,
        receipt.intro_address,
        UNLOCK_KEY,
        cache_size,
    )
    .await
    .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_cold_reads_fetch_each_chunk_once() {
    let (store, receipt) = two_leaf_device(Duration::from_millis(30)).await;
    let reader = Arc::new(open_reader(&store, &receipt, 32).await);
    let intro_name = receipt.intro_address.to_hex();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let reader = reader.clone();
        tasks.push(tokio::spawn(
            async move { reader.read_at(1500, 100).await.unwrap() },
        ));
    }
    for task in tasks {
        let bytes = task.await.unwrap();
        assert_eq!(bytes.as_ref(), &[0x22u8; 100]);
    }

    // One intro fetch at open, then exactly one fetch for the top
    // interior and one for the touched leaf, no matter how many
    // readers raced.
    assert_eq!(store.gets_for(&intro_name), 1);
    assert_eq!(store.total_gets(), 3);
}

#[tokio::test]
async fn warm_cache_serves_repeat_reads_without_fetching() {
    let (store, receipt) = two_leaf_device(Duration::ZERO).await;
    let reader = open_reader(&store, &receipt, 32).await;

    reader.read_at(0, 2048).await.unwrap();
    let cold = store.total_gets();
    reader.read_at(0, 2048).await.unwrap();
    reader.read_at(512, 1024).await.unwrap();
    assert_eq!(store.total_gets(), cold);
}

#[tokio::test]
async fn tiny_cache_evicts_least_recently_used() {
    let (store, receipt) = two_leaf_device(Duration::ZERO).await;
    let reader = open_reader(&store, &receipt, 1).await;

    reader.read_at(0, 64).await.unwrap();
    let after_first = store.total_gets();
    // With a single entry the top interior is evicted by the leaf on
    // every descent, so a repeat read fetches again.
    reader.read_at(0, 64).await.unwrap();
    assert!(store.total_gets() > after_first);
}

#[tokio::test]
async fn failed_fetch_does_not_poison_the_slot() {
    let (store, receipt) = two_leaf_device(Duration::ZERO).await;
    let reader = open_reader(&store, &receipt, 32).await;

    store.fail_next.store(true, Ordering::SeqCst);
    let err = reader.read_at(0, 64).await.unwrap_err();
    assert!(matches!(err, ChunkError::Store(_) | ChunkError::Shared(_)));

    // The failure is not cached; the retry succeeds.
    let bytes = reader.read_at(0, 64).await.unwrap();
    assert_eq!(bytes.as_ref(), &[0x11u8; 64]);
}
