//! Request-line tokenizing (C1) and payload framing (C2).
//!
//! Mirrors the shape of `messages.rs` in spirit: a grab-bag of small,
//! independently testable helpers that sit directly on top of the wire,
//! with no knowledge of what a "connection" or a "command" is.
use crate::cache::{CacheItem, SetTxn};
use crate::errors::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// memcached's classic cutoff between "relative seconds" and "absolute unix
/// epoch seconds" for expirations: 30 days.
pub const RELATIVE_EXPIRATION_LIMIT: u64 = 30 * 24 * 3600;

/// Chunk size used to shuttle payload bytes between the socket and the
/// cache. Payloads are never buffered in full.
pub const CHUNK_SIZE: usize = 16 * 1024;

pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Decode the wire's dual-form expiration into a duration offset from now.
/// `0` means "no expiration", represented as `Duration::MAX` the same way
/// a zero/absent TTL is represented in other caching front ends.
pub fn decode_expiration(raw: u64, now: i64) -> std::time::Duration {
    use std::time::Duration;
    if raw == 0 {
        Duration::MAX
    } else if raw <= RELATIVE_EXPIRATION_LIMIT {
        Duration::from_secs(raw)
    } else {
        let delta = raw as i64 - now;
        Duration::from_secs(delta.max(0) as u64)
    }
}

/// Re-encode a remaining item TTL using the same dual form, for `cget`'s
/// response. The inverse is not exact (a relative value round-trips to a
/// different absolute one) by design: the wire only ever carries one of the
/// two forms at a time.
pub fn encode_expiration(ttl: std::time::Duration, now: i64) -> u64 {
    if ttl == std::time::Duration::MAX {
        return 0;
    }
    let secs = ttl.as_secs();
    if secs <= RELATIVE_EXPIRATION_LIMIT {
        secs
    } else {
        (now as u64).saturating_add(secs)
    }
}

/// In-payload binary layouts (§3, §6). Pure byte twiddling, independent of
/// any particular cache backend.
pub mod layout {
    pub const CLASSIC_HEADER_LEN: u64 = 4;
    pub const VALIDATOR_HEADER_LEN: u64 = 12;

    pub fn encode_flags(flags: u32) -> [u8; 4] {
        flags.to_le_bytes()
    }

    pub fn decode_flags(buf: &[u8; 4]) -> u32 {
        u32::from_le_bytes(*buf)
    }

    pub fn encode_validator(etag: u64, validate_ttl_ms: i32) -> [u8; 12] {
        let mut out = [0u8; 12];
        out[0..8].copy_from_slice(&etag.to_le_bytes());
        out[8..12].copy_from_slice(&validate_ttl_ms.to_le_bytes());
        out
    }

    pub fn decode_validator(buf: &[u8; 12]) -> (u64, i32) {
        let etag = u64::from_le_bytes(buf[0..8].try_into().expect("8 bytes"));
        let validate_ttl_ms = i32::from_le_bytes(buf[8..12].try_into().expect("4 bytes"));
        (etag, validate_ttl_ms)
    }
}

/// Splits a request line into whitespace-separated tokens.
///
/// Operates on the tail of the line (everything after the command verb).
/// The cursor starts "before" the first token, so every call to
/// `next_token` first consumes exactly one separating space -- which is why
/// handlers are invoked with a tail that still carries its leading space.
pub struct Tokenizer<'a> {
    line: &'a [u8],
    pos: usize,
    started: bool,
}

impl<'a> Tokenizer<'a> {
    pub fn new(tail: &'a [u8]) -> Self {
        Tokenizer {
            line: tail,
            pos: 0,
            started: true,
        }
    }

    fn bad(label: &'static str) -> Error {
        Error::Protocol { label }
    }

    /// Whether any bytes remain to be consumed (including a pending
    /// separator). Used by optional trailing fields to decide whether to
    /// even attempt a parse.
    pub fn has_more(&self) -> bool {
        self.pos < self.line.len()
    }

    /// Consume one separator then one non-empty, space-delimited token.
    pub fn next_token(&mut self, label: &'static str) -> Result<&'a [u8], Error> {
        if self.started {
            if self.pos >= self.line.len() || self.line[self.pos] != b' ' {
                return Err(Self::bad(label));
            }
            self.pos += 1;
        }
        self.started = true;

        let start = self.pos;
        while self.pos < self.line.len() && self.line[self.pos] != b' ' {
            self.pos += 1;
        }
        let token = &self.line[start..self.pos];
        if token.is_empty() {
            return Err(Self::bad(label));
        }
        Ok(token)
    }

    /// Like `next_token`, but for a repeating tail of keys: returns `None`
    /// once nothing is left instead of erroring.
    pub fn next_key_opt(&mut self) -> Result<Option<&'a [u8]>, Error> {
        if !self.has_more() {
            return Ok(None);
        }
        Ok(Some(self.next_token("key")?))
    }

    pub fn key(&mut self) -> Result<&'a [u8], Error> {
        self.next_token("key")
    }

    pub fn flags(&mut self) -> Result<u32, Error> {
        parse_decimal(self.next_token("flags")?, "flags").map(|v| v as u32)
    }

    pub fn size(&mut self) -> Result<u64, Error> {
        parse_decimal(self.next_token("size")?, "size")
    }

    pub fn etag(&mut self) -> Result<u64, Error> {
        parse_decimal(self.next_token("etag")?, "etag")
    }

    /// Raw milliseconds field (`validateTtl`, `graceDuration`), not yet
    /// truncated to any particular wire-header width.
    pub fn milliseconds(&mut self) -> Result<u64, Error> {
        parse_decimal(self.next_token("milliseconds")?, "milliseconds")
    }

    pub fn expiration(&mut self, now: i64) -> Result<std::time::Duration, Error> {
        let raw = parse_decimal(self.next_token("expiration")?, "expiration")?;
        Ok(decode_expiration(raw, now))
    }

    /// Optional trailing `noreply` literal. `Ok(false)` if nothing is left;
    /// any other trailing token is a parse error.
    pub fn noreply(&mut self) -> Result<bool, Error> {
        if !self.has_more() {
            return Ok(false);
        }
        let token = self.next_token("noreply")?;
        if token == b"noreply" {
            Ok(true)
        } else {
            Err(Self::bad("noreply"))
        }
    }

    /// Asserts the cursor has reached end-of-line.
    pub fn eof(&mut self) -> Result<(), Error> {
        if self.pos != self.line.len() {
            Err(Self::bad("trailing garbage"))
        } else {
            Ok(())
        }
    }
}

pub(crate) fn parse_decimal(token: &[u8], label: &'static str) -> Result<u64, Error> {
    std::str::from_utf8(token)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or(Error::Protocol { label })
}

/// Stream exactly `remaining` bytes from `reader` into `txn`, then require a
/// literal CRLF. `chunk` is scratch space reused across calls so no
/// allocation happens per request on the steady-state path.
pub async fn stream_payload_in<R, T>(
    reader: &mut R,
    txn: &mut T,
    mut remaining: u64,
    chunk: &mut Vec<u8>,
) -> Result<(), Error>
where
    R: AsyncRead + Unpin,
    T: SetTxn,
{
    let cap = CHUNK_SIZE.min(remaining as usize).max(CHUNK_SIZE.min(4096));
    if chunk.len() < cap {
        chunk.resize(cap, 0);
    }

    while remaining > 0 {
        let want = CHUNK_SIZE.min(remaining as usize);
        let buf = &mut chunk[..want];
        reader.read_exact(buf).await.map_err(|_| Error::SocketError)?;
        txn.write(buf).await.map_err(|_| Error::SocketError)?;
        remaining -= want as u64;
    }

    let mut crlf = [0u8; 2];
    reader
        .read_exact(&mut crlf)
        .await
        .map_err(|_| Error::SocketError)?;
    if &crlf != b"\r\n" {
        return Err(Error::MissingTerminator);
    }
    Ok(())
}

/// Stream all remaining bytes of `item` directly into `writer`, then emit
/// the trailing CRLF.
pub async fn stream_payload_out<W, I>(item: &mut I, writer: &mut W) -> Result<(), Error>
where
    W: AsyncWrite + Unpin + Send,
    I: CacheItem,
{
    item.copy_to(writer).await.map_err(|_| Error::SocketError)?;
    writer
        .write_all(b"\r\n")
        .await
        .map_err(|_| Error::SocketError)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizer_reads_plain_fields() {
        let mut t = Tokenizer::new(b" foo 17 0 5");
        assert_eq!(t.key().unwrap(), b"foo");
        assert_eq!(t.flags().unwrap(), 17);
        assert_eq!(t.expiration(0).unwrap(), std::time::Duration::MAX);
        assert_eq!(t.size().unwrap(), 5);
        assert!(t.eof().is_ok());
    }

    #[test]
    fn tokenizer_rejects_empty_token() {
        let mut t = Tokenizer::new(b"  foo");
        assert!(t.key().is_err());
    }

    #[test]
    fn tokenizer_noreply_optional() {
        let mut t = Tokenizer::new(b" foo");
        assert_eq!(t.key().unwrap(), b"foo");
        assert_eq!(t.noreply().unwrap(), false);

        let mut t = Tokenizer::new(b" foo noreply");
        assert_eq!(t.key().unwrap(), b"foo");
        assert_eq!(t.noreply().unwrap(), true);
        assert!(t.eof().is_ok());
    }

    #[test]
    fn tokenizer_rejects_garbage_after_noreply_slot() {
        let mut t = Tokenizer::new(b" foo bogus");
        assert_eq!(t.key().unwrap(), b"foo");
        assert!(t.noreply().is_err());
    }

    #[test]
    fn tokenizer_repeating_keys() {
        let mut t = Tokenizer::new(b" a b c");
        let mut keys = Vec::new();
        while let Some(k) = t.next_key_opt().unwrap() {
            keys.push(k.to_vec());
        }
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn expiration_dual_form_round_trips_relative() {
        let now = 1_700_000_000;
        let d = decode_expiration(120, now);
        assert_eq!(d, std::time::Duration::from_secs(120));
        assert_eq!(encode_expiration(d, now), 120);
    }

    #[test]
    fn expiration_zero_means_never() {
        let now = 1_700_000_000;
        assert_eq!(decode_expiration(0, now), std::time::Duration::MAX);
        assert_eq!(encode_expiration(std::time::Duration::MAX, now), 0);
    }

    #[test]
    fn expiration_absolute_converts_to_offset() {
        let now = 1_700_000_000;
        let absolute = now as u64 + 3_000_000; // well past the relative limit
        let d = decode_expiration(absolute, now);
        assert_eq!(d, std::time::Duration::from_secs(3_000_000));
    }

    #[test]
    fn layout_classic_round_trips() {
        let buf = layout::encode_flags(0xdead_beef);
        assert_eq!(layout::decode_flags(&buf), 0xdead_beef);
    }

    #[test]
    fn layout_validator_round_trips() {
        let buf = layout::encode_validator(42, -7);
        assert_eq!(layout::decode_validator(&buf), (42, -7));
    }
}
