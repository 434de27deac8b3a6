//! Degraded-Mode Caches
//!
//! Two fallback stores keyed by the same fingerprint: a value cache for the
//! last successful structured response, and a blob cache that persists
//! streamed payloads to disk. Both are written only on success and read only
//! when the live call path is blocked or failing, so a stale answer beats no
//! answer without ever shadowing a healthy upstream.
//!
//! The fingerprint hashes `(method, logical path)` and deliberately excludes
//! host and port: the entry written after a call to one instance is found
//! again after failover to another.

use bytes::Bytes;
use dashmap::DashMap;
use futures::Stream;
use hyper::Method;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::ByteStream;
use stitch_common::time::unix_now;

/// Stable cache key for `(method, logical path)`.
pub fn fingerprint(method: &Method, path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.as_str().as_bytes());
    hasher.update(b" ");
    hasher.update(path.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Tracks the last issued tick so concurrent lookups still get strictly
/// increasing access stamps; wall-clock ms alone can collide within one
/// millisecond and break the eviction order.
static LAST_TICK: AtomicU64 = AtomicU64::new(0);

fn monotonic_ms() -> u64 {
    let wall = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);

    let mut last = LAST_TICK.load(Ordering::Acquire);
    loop {
        let next = wall.max(last + 1);
        match LAST_TICK.compare_exchange_weak(last, next, Ordering::SeqCst, Ordering::Acquire) {
            Ok(_) => return next,
            Err(observed) => last = observed,
        }
    }
}

// ============================================================================
// Value Cache
// ============================================================================

/// Bounds for [`ValueCache`].
#[derive(Debug, Clone)]
pub struct ValueCacheConfig {
    /// Entries beyond this are evicted least-recently-used first.
    pub max_entries: usize,
    /// Entries older than this are dropped on lookup. `None` keeps entries
    /// until evicted by capacity; a fallback cache usually wants old data
    /// over no data.
    pub max_age_secs: Option<u64>,
}

impl Default for ValueCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 256,
            max_age_secs: None,
        }
    }
}

struct ValueEntry {
    value: serde_json::Value,
    stored_at: u64,
    last_access_ms: AtomicU64,
}

/// Last successful structured response per fingerprint.
pub struct ValueCache {
    entries: DashMap<String, ValueEntry>,
    config: ValueCacheConfig,
}

impl ValueCache {
    pub fn new(config: ValueCacheConfig) -> Self {
        ValueCache {
            entries: DashMap::new(),
            config,
        }
    }

    /// Records the latest successful response for `fingerprint`, evicting the
    /// least-recently-used entries once over capacity.
    pub fn store(&self, fingerprint: &str, value: serde_json::Value) {
        self.entries.insert(
            fingerprint.to_string(),
            ValueEntry {
                value,
                stored_at: unix_now(),
                last_access_ms: AtomicU64::new(monotonic_ms()),
            },
        );
        self.enforce_capacity();
    }

    /// The cached response and its age in seconds, if present and not past
    /// the configured age bound.
    pub fn lookup(&self, fingerprint: &str) -> Option<(serde_json::Value, u64)> {
        {
            let entry = self.entries.get(fingerprint)?;
            let age = unix_now().saturating_sub(entry.stored_at);
            let expired = matches!(self.config.max_age_secs, Some(max) if age >= max);
            if !expired {
                entry.last_access_ms.store(monotonic_ms(), Ordering::Relaxed);
                return Some((entry.value.clone(), age));
            }
            // Guard must drop before the remove below touches the same shard.
        }
        self.entries.remove(fingerprint);
        None
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn enforce_capacity(&self) {
        if self.entries.len() <= self.config.max_entries {
            return;
        }

        let mut stamps: Vec<(String, u64)> = self
            .entries
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    entry.last_access_ms.load(Ordering::Relaxed),
                )
            })
            .collect();
        stamps.sort_by_key(|&(_, last_access)| last_access);

        let to_remove = stamps.len().saturating_sub(self.config.max_entries);
        for (key, _) in stamps.into_iter().take(to_remove) {
            self.entries.remove(&key);
        }
    }
}

// ============================================================================
// Blob Cache
// ============================================================================

/// Bounds and location for [`BlobCache`].
#[derive(Debug, Clone)]
pub struct BlobCacheConfig {
    /// Directory the persisted payloads live in. Created on first write.
    pub dir: PathBuf,
    /// Completed blobs beyond this total are evicted oldest first.
    pub max_bytes: u64,
}

impl BlobCacheConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        BlobCacheConfig {
            dir: dir.into(),
            ..Default::default()
        }
    }
}

impl Default for BlobCacheConfig {
    fn default() -> Self {
        Self {
            dir: std::env::temp_dir().join("stitch-blob-cache"),
            max_bytes: 256 * 1024 * 1024,
        }
    }
}

enum TeeFrame {
    Chunk(Bytes),
    End,
}

/// On-disk copies of streamed payloads, one file per fingerprint.
///
/// `store_streaming` copies the live stream to disk while forwarding it to
/// the caller; the caller-visible bytes are identical to the uncached stream
/// and never wait on the disk. A blob only appears under its final name after
/// the source stream completed cleanly, so readers never observe a truncated
/// payload.
pub struct BlobCache {
    dir: PathBuf,
    max_bytes: u64,
    writing: Arc<DashMap<String, ()>>,
}

impl BlobCache {
    pub fn new(config: BlobCacheConfig) -> Self {
        BlobCache {
            dir: config.dir,
            max_bytes: config.max_bytes,
            writing: Arc::new(DashMap::new()),
        }
    }

    /// Tees `upstream` into the cache file for `fingerprint` and returns the
    /// forwarded stream.
    ///
    /// Writes are exclusive per fingerprint: when another write for the same
    /// fingerprint is still in flight, the stream is forwarded untouched and
    /// nothing is persisted. A source stream that ends early or with an error
    /// abandons the write and leaves no file behind.
    pub fn store_streaming(&self, fingerprint: &str, upstream: ByteStream) -> ByteStream {
        use dashmap::mapref::entry::Entry;

        match self.writing.entry(fingerprint.to_string()) {
            Entry::Occupied(_) => return upstream,
            Entry::Vacant(slot) => {
                slot.insert(());
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let dir = self.dir.clone();
        let max_bytes = self.max_bytes;
        let writing = self.writing.clone();
        let fingerprint = fingerprint.to_string();

        tokio::spawn(async move {
            match write_blob(&dir, &fingerprint, rx).await {
                Ok(true) => {
                    debug!(fingerprint = %fingerprint, "blob cached");
                    if let Err(e) = enforce_size_bound(&dir, max_bytes).await {
                        warn!(error = %e, "blob cache eviction failed");
                    }
                }
                Ok(false) => {
                    debug!(fingerprint = %fingerprint, "blob write abandoned");
                }
                Err(e) => {
                    warn!(fingerprint = %fingerprint, error = %e, "blob write failed");
                    let partial = dir.join(format!("{}.partial", fingerprint));
                    let _ = tokio::fs::remove_file(partial).await;
                }
            }
            writing.remove(&fingerprint);
        });

        Box::pin(TeeStream {
            inner: upstream,
            tx: Some(tx),
        })
    }

    /// Opens a fresh read of the persisted payload for `fingerprint`.
    pub async fn open(&self, fingerprint: &str) -> Option<ByteStream> {
        let path = self.dir.join(fingerprint);
        let file = tokio::fs::File::open(&path).await.ok()?;
        Some(Box::pin(ReaderStream::new(file)))
    }
}

/// Forwards the inner stream while copying each chunk to the blob writer.
/// The `End` frame is sent only after a clean end of stream; dropping the
/// sender without it tells the writer to abandon the file.
struct TeeStream {
    inner: ByteStream,
    tx: Option<mpsc::UnboundedSender<TeeFrame>>,
}

impl Stream for TeeStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(bytes))) => {
                if let Some(tx) = &this.tx {
                    if tx.send(TeeFrame::Chunk(bytes.clone())).is_err() {
                        // Writer died; keep serving the caller without copying.
                        this.tx = None;
                    }
                }
                Poll::Ready(Some(Ok(bytes)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.tx = None;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                if let Some(tx) = this.tx.take() {
                    let _ = tx.send(TeeFrame::End);
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Drains the tee channel into `<fingerprint>.partial`, renaming to the final
/// name only on a clean `End`. Returns whether the blob was completed.
async fn write_blob(
    dir: &Path,
    fingerprint: &str,
    mut rx: mpsc::UnboundedReceiver<TeeFrame>,
) -> std::io::Result<bool> {
    tokio::fs::create_dir_all(dir).await?;
    let partial = dir.join(format!("{}.partial", fingerprint));

    let mut file = tokio::fs::File::create(&partial).await?;
    let mut completed = false;
    while let Some(frame) = rx.recv().await {
        match frame {
            TeeFrame::Chunk(bytes) => file.write_all(&bytes).await?,
            TeeFrame::End => {
                completed = true;
                break;
            }
        }
    }

    if completed {
        file.flush().await?;
        drop(file);
        tokio::fs::rename(&partial, dir.join(fingerprint)).await?;
    } else {
        drop(file);
        let _ = tokio::fs::remove_file(&partial).await;
    }
    Ok(completed)
}

/// Removes completed blobs, oldest modification time first, until the total
/// fits under `max_bytes`. In-flight `.partial` files are left alone.
async fn enforce_size_bound(dir: &Path, max_bytes: u64) -> std::io::Result<()> {
    let mut blobs = Vec::new();
    let mut read_dir = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = read_dir.next_entry().await? {
        let meta = entry.metadata().await?;
        if !meta.is_file() || entry.file_name().to_string_lossy().ends_with(".partial") {
            continue;
        }
        let modified = meta.modified().unwrap_or(UNIX_EPOCH);
        blobs.push((entry.path(), meta.len(), modified));
    }

    let total: u64 = blobs.iter().map(|(_, len, _)| len).sum();
    if total <= max_bytes {
        return Ok(());
    }

    blobs.sort_by_key(|&(_, _, modified)| modified);
    let mut excess = total - max_bytes;
    for (path, len, _) in blobs {
        if excess == 0 {
            break;
        }
        if tokio::fs::remove_file(&path).await.is_ok() {
            debug!(path = %path.display(), "evicted blob");
            excess = excess.saturating_sub(len);
        }
    }
    Ok(())
}
