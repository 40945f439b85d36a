//! The cache collaborator interface.
//!
//! This is the boundary the protocol front end is built against. Everything
//! on the other side of it -- storage, eviction, persistence -- is someone
//! else's problem (see spec §1/§6); `linecached` only needs `Cache`,
//! `CacheItem` and `SetTxn` to hold.
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tokio::io::AsyncWrite;

/// A cache-backend error that is not a miss and not a would-block. Per the
/// protocol design these are always fatal: they signal backend corruption
/// or a bug, not a condition the protocol layer can recover from.
#[derive(Debug)]
pub struct CacheError(pub Box<dyn std::error::Error + Send + Sync>);

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for CacheError {}

impl CacheError {
    pub fn new<E: std::error::Error + Send + Sync + 'static>(e: E) -> Self {
        CacheError(Box::new(e))
    }
}

/// Outcome of `getde`'s dogpile-suppressing async get.
pub enum GetDeOutcome<I> {
    Hit(I),
    Miss,
    WouldBlock,
}

/// A read-side handle over a single cache entry's payload bytes.
///
/// Must be released (dropped) exactly once on every exit path; callers never
/// need to do anything explicit beyond letting it go out of scope.
#[async_trait]
pub trait CacheItem: Send {
    /// Remaining unread bytes.
    fn available(&self) -> u64;

    /// Time until this entry expires.
    fn ttl(&self) -> Duration;

    /// Read exactly `buf.len()` bytes from the front of the item. Used to
    /// pull the in-payload header (flags, or etag+validate_ttl_ms) off
    /// before streaming the remaining user bytes.
    async fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()>;

    /// Stream all remaining bytes directly into `dst`, without
    /// materializing them in an intermediate buffer. Returns the number of
    /// bytes copied.
    async fn copy_to(&mut self, dst: &mut (dyn AsyncWrite + Unpin + Send)) -> std::io::Result<u64>;
}

/// A staged write into the cache of a pre-declared total size, made visible
/// atomically on commit.
///
/// Invariant: total bytes written on the commit path must equal the
/// declared size, or the backend is free to reject the commit.
#[async_trait]
pub trait SetTxn: Send {
    /// Write the next chunk of the declared payload. May be called any
    /// number of times; the backend is responsible for tracking how many
    /// bytes have been written so far.
    async fn write(&mut self, buf: &[u8]) -> std::io::Result<()>;

    /// Make the entry visible atomically. Consumes the transaction.
    async fn commit(self) -> std::io::Result<()>;

    /// Discard the transaction; no entry is created, no visible state
    /// changes. Consumes the transaction.
    async fn rollback(self) -> std::io::Result<()>;
}

/// The pluggable content cache.
///
/// A committed `Txn` must become visible to concurrent readers as a unit: a
/// reader either sees the whole new entry, the previous one, or nothing.
/// The cache is the server's sole synchronization authority; the protocol
/// layer never takes a per-key lock of its own.
#[async_trait]
pub trait Cache: Send + Sync + 'static {
    type Item: CacheItem;
    type Txn: SetTxn;

    /// Plain lookup. `Ok(None)` is a miss, not an error.
    async fn get_item(&self, key: &[u8]) -> Result<Option<Self::Item>, CacheError>;

    /// Dogpile-suppressing lookup: at most one caller per key, per grace
    /// window, is told `Miss` (and is expected to recompute and `set`); the
    /// rest see `WouldBlock` until either the grace window lapses or a
    /// fresh value is committed.
    async fn get_de_async_item(
        &self,
        key: &[u8],
        grace: Duration,
    ) -> Result<GetDeOutcome<Self::Item>, CacheError>;

    /// Open a write transaction of exactly `size` bytes, expiring after
    /// `expiration` (zero means no expiration).
    async fn new_set_txn(
        &self,
        key: &[u8],
        size: u64,
        expiration: Duration,
    ) -> Result<Self::Txn, CacheError>;

    /// Remove an entry. Returns whether it was present.
    async fn delete(&self, key: &[u8]) -> Result<bool, CacheError>;

    /// Drop every entry.
    async fn clear(&self) -> Result<(), CacheError>;
}
