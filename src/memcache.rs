//! `MemoryCache`: the in-process reference implementation of the `Cache`
//! trait.
//!
//! Not a performance-oriented store -- no sharding, no eviction thread, one
//! mutex guarding the whole keyspace. Its only job is to exercise the
//! protocol layer faithfully, including the `getde` would-block/grace-window
//! behavior, which is the one place the server relies on backend semantics
//! beyond "get/set/delete".
use crate::cache::{Cache, CacheError, CacheItem, GetDeOutcome, SetTxn};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncWrite, AsyncWriteExt};

struct Entry {
    bytes: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        matches!(self.expires_at, Some(at) if Instant::now() >= at)
    }

    fn ttl(&self) -> Duration {
        match self.expires_at {
            None => Duration::MAX,
            Some(at) => at.saturating_duration_since(Instant::now()),
        }
    }
}

struct Pending {
    expires_at: Instant,
}

#[derive(Default)]
struct Shared {
    entries: HashMap<Vec<u8>, Entry>,
    pending: HashMap<Vec<u8>, Pending>,
}

pub struct MemoryCache {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        MemoryCache {
            shared: Arc::new(Mutex::new(Shared::default())),
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MemoryItem {
    data: Vec<u8>,
    pos: usize,
    ttl: Duration,
}

#[async_trait]
impl CacheItem for MemoryItem {
    fn available(&self) -> u64 {
        (self.data.len() - self.pos) as u64
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        if self.data.len() - self.pos < buf.len() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "short item header"));
        }
        let end = self.pos + buf.len();
        buf.copy_from_slice(&self.data[self.pos..end]);
        self.pos = end;
        Ok(())
    }

    async fn copy_to(&mut self, dst: &mut (dyn AsyncWrite + Unpin + Send)) -> io::Result<u64> {
        let remaining = &self.data[self.pos..];
        dst.write_all(remaining).await?;
        let n = remaining.len() as u64;
        self.pos = self.data.len();
        Ok(n)
    }
}

pub struct MemoryTxn {
    shared: Arc<Mutex<Shared>>,
    key: Vec<u8>,
    expires_at: Option<Instant>,
    declared_size: u64,
    buf: Vec<u8>,
}

#[async_trait]
impl SetTxn for MemoryTxn {
    async fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        self.buf.extend_from_slice(buf);
        Ok(())
    }

    async fn commit(self) -> io::Result<()> {
        if self.buf.len() as u64 != self.declared_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "txn committed with wrong number of bytes written",
            ));
        }
        let mut shared = self.shared.lock();
        shared.pending.remove(&self.key);
        shared.entries.insert(
            self.key,
            Entry {
                bytes: self.buf,
                expires_at: self.expires_at,
            },
        );
        Ok(())
    }

    async fn rollback(self) -> io::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Cache for MemoryCache {
    type Item = MemoryItem;
    type Txn = MemoryTxn;

    async fn get_item(&self, key: &[u8]) -> Result<Option<Self::Item>, CacheError> {
        let mut shared = self.shared.lock();
        if let Some(entry) = shared.entries.get(key) {
            if entry.is_expired() {
                shared.entries.remove(key);
                return Ok(None);
            }
            let ttl = entry.ttl();
            let data = entry.bytes.clone();
            return Ok(Some(MemoryItem { data, pos: 0, ttl }));
        }
        Ok(None)
    }

    async fn get_de_async_item(
        &self,
        key: &[u8],
        grace: Duration,
    ) -> Result<GetDeOutcome<Self::Item>, CacheError> {
        let mut shared = self.shared.lock();

        if let Some(entry) = shared.entries.get(key) {
            if !entry.is_expired() {
                let ttl = entry.ttl();
                let data = entry.bytes.clone();
                return Ok(GetDeOutcome::Hit(MemoryItem { data, pos: 0, ttl }));
            }
            shared.entries.remove(key);
        }

        let now = Instant::now();
        if let Some(pending) = shared.pending.get(key) {
            if pending.expires_at > now {
                return Ok(GetDeOutcome::WouldBlock);
            }
        }
        shared
            .pending
            .insert(key.to_vec(), Pending { expires_at: now + grace });
        Ok(GetDeOutcome::Miss)
    }

    async fn new_set_txn(
        &self,
        key: &[u8],
        size: u64,
        expiration: Duration,
    ) -> Result<Self::Txn, CacheError> {
        let expires_at = if expiration == Duration::MAX {
            None
        } else {
            Some(Instant::now() + expiration)
        };
        Ok(MemoryTxn {
            shared: self.shared.clone(),
            key: key.to_vec(),
            expires_at,
            declared_size: size,
            buf: Vec::with_capacity(size.min(1 << 20) as usize),
        })
    }

    async fn delete(&self, key: &[u8]) -> Result<bool, CacheError> {
        let mut shared = self.shared.lock();
        shared.pending.remove(key);
        Ok(shared.entries.remove(key).is_some())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        let mut shared = self.shared.lock();
        shared.entries.clear();
        shared.pending.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let cache = MemoryCache::new();
        let mut txn = cache
            .new_set_txn(b"k", 3, Duration::from_secs(60))
            .await
            .unwrap();
        txn.write(b"abc").await.unwrap();
        txn.commit().await.unwrap();

        let mut item = cache.get_item(b"k").await.unwrap().unwrap();
        assert_eq!(item.available(), 3);
        let mut out = Vec::new();
        item.copy_to(&mut out).await.unwrap();
        assert_eq!(out, b"abc");
    }

    #[tokio::test]
    async fn commit_rejects_short_write() {
        let cache = MemoryCache::new();
        let mut txn = cache
            .new_set_txn(b"k", 3, Duration::from_secs(60))
            .await
            .unwrap();
        txn.write(b"ab").await.unwrap();
        assert!(txn.commit().await.is_err());
    }

    #[tokio::test]
    async fn delete_reports_presence() {
        let cache = MemoryCache::new();
        assert!(!cache.delete(b"missing").await.unwrap());

        let mut txn = cache
            .new_set_txn(b"k", 1, Duration::MAX)
            .await
            .unwrap();
        txn.write(b"x").await.unwrap();
        txn.commit().await.unwrap();

        assert!(cache.delete(b"k").await.unwrap());
        assert!(cache.get_item(b"k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn getde_first_caller_gets_miss_then_others_would_block() {
        let cache = MemoryCache::new();
        match cache
            .get_de_async_item(b"k", Duration::from_millis(500))
            .await
            .unwrap()
        {
            GetDeOutcome::Miss => {}
            _ => panic!("expected miss"),
        }
        match cache
            .get_de_async_item(b"k", Duration::from_millis(500))
            .await
            .unwrap()
        {
            GetDeOutcome::WouldBlock => {}
            _ => panic!("expected would-block"),
        }
    }

    #[tokio::test]
    async fn getde_hits_a_fresh_value() {
        let cache = MemoryCache::new();
        let mut txn = cache.new_set_txn(b"k", 1, Duration::MAX).await.unwrap();
        txn.write(b"x").await.unwrap();
        txn.commit().await.unwrap();

        match cache
            .get_de_async_item(b"k", Duration::from_millis(500))
            .await
            .unwrap()
        {
            GetDeOutcome::Hit(mut item) => {
                let mut out = Vec::new();
                item.copy_to(&mut out).await.unwrap();
                assert_eq!(out, b"x");
            }
            _ => panic!("expected hit"),
        }
    }

    #[tokio::test]
    async fn clear_removes_everything() {
        let cache = MemoryCache::new();
        let mut txn = cache.new_set_txn(b"k", 1, Duration::MAX).await.unwrap();
        txn.write(b"x").await.unwrap();
        txn.commit().await.unwrap();

        cache.clear().await.unwrap();
        assert!(cache.get_item(b"k").await.unwrap().is_none());
    }
}
