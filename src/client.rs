//! Per-connection dispatch loop (C3) and command handlers (C4).
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::task::JoinHandle;

use crate::cache::{Cache, GetDeOutcome, SetTxn};
use crate::errors::Error;
use crate::protocol::{self, layout, Tokenizer};
use crate::stats::STATS;

/// One accepted socket, serialized end to end: the next request line is not
/// read until the current handler returns, which lets a client pipeline
/// requests while preserving response order (spec §5).
pub struct Connection<C: Cache> {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
    scratch: Vec<u8>,
    chunk: Vec<u8>,
    flush_timer: Option<JoinHandle<()>>,
    cache: Arc<C>,
}

const INITIAL_SCRATCH_CAPACITY: usize = 1024;

impl<C: Cache> Connection<C> {
    pub fn new(
        read_half: OwnedReadHalf,
        write_half: OwnedWriteHalf,
        read_buffer: usize,
        write_buffer: usize,
        cache: Arc<C>,
    ) -> Self {
        Connection {
            reader: BufReader::with_capacity(read_buffer, read_half),
            writer: BufWriter::with_capacity(write_buffer, write_half),
            scratch: Vec::with_capacity(INITIAL_SCRATCH_CAPACITY),
            chunk: Vec::new(),
            flush_timer: None,
            cache,
        }
    }

    /// Drive the connection until the peer closes it or a handler fails.
    pub async fn serve(mut self) {
        STATS.connection_opened();

        loop {
            match self.read_line().await {
                Ok(true) => {}
                Ok(false) => break,
                Err(_) => break,
            }

            match self.dispatch().await {
                Ok(()) => {
                    STATS.command_processed();
                }
                Err(Error::Fatal(e)) => {
                    // Unrecoverable: the storage backend is assumed sound,
                    // so an unexpected error here signals corruption or a
                    // bug and must not be masked by carrying on.
                    log::error!("fatal cache error, terminating process: {e}");
                    let _ = self.writer.flush().await;
                    std::process::exit(1);
                }
                Err(e) => {
                    log::warn!("closing connection after protocol error: {e}");
                    break;
                }
            }

            if self.reader.buffer().is_empty() {
                if self.writer.flush().await.is_err() {
                    break;
                }
            }
        }

        self.teardown().await;
    }

    async fn teardown(&mut self) {
        self.cancel_flush_timer();
        let _ = self.writer.flush().await;
        STATS.connection_closed();
    }

    /// Read one CRLF-terminated (or bare-LF-terminated) line into `scratch`,
    /// stripping the terminator. Returns `false` on EOF or an empty line,
    /// either of which ends the connection.
    async fn read_line(&mut self) -> Result<bool, Error> {
        self.scratch.clear();
        let n = self
            .reader
            .read_until(b'\n', &mut self.scratch)
            .await
            .map_err(|_| Error::SocketError)?;
        if n == 0 {
            return Ok(false);
        }
        if self.scratch.last() == Some(&b'\n') {
            self.scratch.pop();
        }
        if self.scratch.last() == Some(&b'\r') {
            self.scratch.pop();
        }
        Ok(!self.scratch.is_empty())
    }

    /// Split the verb out of `scratch` and route to its handler. `scratch`
    /// is handed off as an owned buffer for the duration of the call so
    /// command handlers can hold plain `&[u8]` slices into it across
    /// `.await` points without fighting the borrow checker over `self`.
    async fn dispatch(&mut self) -> Result<(), Error> {
        let line = std::mem::take(&mut self.scratch);
        let result = self.dispatch_line(&line).await;
        self.scratch = line;
        result
    }

    async fn dispatch_line(&mut self, line: &[u8]) -> Result<(), Error> {
        let split = line.iter().position(|&b| b == b' ').unwrap_or(line.len());
        let (verb, tail) = line.split_at(split);

        match verb {
            b"get" => self.cmd_get(tail, false).await,
            b"gets" => self.cmd_get(tail, true).await,
            b"getde" => self.cmd_getde(tail).await,
            b"cget" => self.cmd_cget(tail).await,
            b"set" => self.cmd_set(tail).await,
            b"cset" => self.cmd_cset(tail).await,
            b"delete" => self.cmd_delete(tail).await,
            b"flush_all" => self.cmd_flush_all(tail).await,
            _ => Err(Error::Protocol { label: "command" }),
        }
    }

    async fn write_value_line(
        &mut self,
        key: &[u8],
        flags: u32,
        size: u64,
        cas: bool,
    ) -> Result<(), Error> {
        self.writer.write_all(b"VALUE ").await?;
        self.writer.write_all(key).await?;
        if cas {
            self.writer
                .write_all(format!(" {flags} {size} 0\r\n").as_bytes())
                .await?;
        } else {
            self.writer
                .write_all(format!(" {flags} {size}\r\n").as_bytes())
                .await?;
        }
        Ok(())
    }

    /// `get`/`gets`.
    async fn cmd_get(&mut self, tail: &[u8], with_cas: bool) -> Result<(), Error> {
        let mut t = Tokenizer::new(tail);
        while let Some(key) = t.next_key_opt()? {
            let key = key.to_vec();
            match self.cache.get_item(&key).await? {
                Some(mut item) => {
                    STATS.hit();
                    if item.available() < layout::CLASSIC_HEADER_LEN {
                        return Err(Error::ShortItemHeader);
                    }
                    let mut header = [0u8; 4];
                    item.read_exact(&mut header)
                        .await
                        .map_err(|_| Error::ShortItemHeader)?;
                    let flags = layout::decode_flags(&header);
                    let size = item.available();
                    self.write_value_line(&key, flags, size, with_cas).await?;
                    protocol::stream_payload_out(&mut item, &mut self.writer).await?;
                }
                None => {
                    STATS.miss();
                }
            }
        }
        self.writer.write_all(b"END\r\n").await?;
        Ok(())
    }

    /// `getde <key> <graceMs>`.
    async fn cmd_getde(&mut self, tail: &[u8]) -> Result<(), Error> {
        let mut t = Tokenizer::new(tail);
        let key = t.key()?.to_vec();
        let grace_ms = t.milliseconds()?;
        t.eof()?;

        let grace = Duration::from_millis(grace_ms);
        match self.cache.get_de_async_item(&key, grace).await? {
            GetDeOutcome::WouldBlock => {
                self.writer.write_all(b"WOULDBLOCK\r\n").await?;
            }
            GetDeOutcome::Miss => {
                STATS.miss();
                self.writer.write_all(b"END\r\n").await?;
            }
            GetDeOutcome::Hit(mut item) => {
                STATS.hit();
                if item.available() < layout::CLASSIC_HEADER_LEN {
                    return Err(Error::ShortItemHeader);
                }
                let mut header = [0u8; 4];
                item.read_exact(&mut header)
                    .await
                    .map_err(|_| Error::ShortItemHeader)?;
                let flags = layout::decode_flags(&header);
                let size = item.available();
                self.write_value_line(&key, flags, size, false).await?;
                protocol::stream_payload_out(&mut item, &mut self.writer).await?;
                self.writer.write_all(b"END\r\n").await?;
            }
        }
        Ok(())
    }

    /// `cget <key> <etag>`.
    async fn cmd_cget(&mut self, tail: &[u8]) -> Result<(), Error> {
        let mut t = Tokenizer::new(tail);
        let key = t.key()?.to_vec();
        let client_etag = t.etag()?;
        t.eof()?;

        match self.cache.get_item(&key).await? {
            None => {
                STATS.miss();
                self.writer.write_all(b"NOT_FOUND\r\n").await?;
            }
            Some(mut item) => {
                STATS.hit();
                if item.available() < layout::VALIDATOR_HEADER_LEN {
                    return Err(Error::ShortItemHeader);
                }
                let ttl = item.ttl();
                let mut header = [0u8; 12];
                item.read_exact(&mut header)
                    .await
                    .map_err(|_| Error::ShortItemHeader)?;
                let (stored_etag, validate_ttl_ms) = layout::decode_validator(&header);

                if stored_etag == client_etag {
                    self.writer.write_all(b"NOT_MODIFIED\r\n").await?;
                } else {
                    let size = item.available();
                    let expiration_s = protocol::encode_expiration(ttl, protocol::now_unix());
                    self.writer
                        .write_all(
                            format!("VALUE {size} {expiration_s} {stored_etag} {validate_ttl_ms}\r\n")
                                .as_bytes(),
                        )
                        .await?;
                    protocol::stream_payload_out(&mut item, &mut self.writer).await?;
                }
            }
        }
        Ok(())
    }

    /// `set <key> <flags> <expiration> <size>[ noreply]`.
    async fn cmd_set(&mut self, tail: &[u8]) -> Result<(), Error> {
        let mut t = Tokenizer::new(tail);
        let key = t.key()?.to_vec();
        let flags = t.flags()?;
        let expiration = t.expiration(protocol::now_unix())?;
        let size = t.size()?;
        let noreply = t.noreply()?;
        t.eof()?;

        let total = size + layout::CLASSIC_HEADER_LEN;
        let mut txn = self.cache.new_set_txn(&key, total, expiration).await?;
        txn.write(&layout::encode_flags(flags))
            .await
            .map_err(|_| Error::SocketError)?;

        if let Err(e) =
            protocol::stream_payload_in(&mut self.reader, &mut txn, size, &mut self.chunk).await
        {
            let _ = txn.rollback().await;
            return Err(e);
        }
        txn.commit().await.map_err(|_| Error::SocketError)?;

        if !noreply {
            self.writer.write_all(b"STORED\r\n").await?;
        }
        Ok(())
    }

    /// `cset <key> <expiration> <size> <etag> <validateTtlMs>[ noreply]`.
    async fn cmd_cset(&mut self, tail: &[u8]) -> Result<(), Error> {
        let mut t = Tokenizer::new(tail);
        let key = t.key()?.to_vec();
        let expiration = t.expiration(protocol::now_unix())?;
        let size = t.size()?;
        let etag = t.etag()?;
        let validate_ttl_ms = t.milliseconds()? as i32;
        let noreply = t.noreply()?;
        t.eof()?;

        let total = size + layout::VALIDATOR_HEADER_LEN;
        let mut txn = self.cache.new_set_txn(&key, total, expiration).await?;
        txn.write(&layout::encode_validator(etag, validate_ttl_ms))
            .await
            .map_err(|_| Error::SocketError)?;

        if let Err(e) =
            protocol::stream_payload_in(&mut self.reader, &mut txn, size, &mut self.chunk).await
        {
            let _ = txn.rollback().await;
            return Err(e);
        }
        txn.commit().await.map_err(|_| Error::SocketError)?;

        if !noreply {
            self.writer.write_all(b"STORED\r\n").await?;
        }
        Ok(())
    }

    /// `delete <key>[ noreply]`.
    async fn cmd_delete(&mut self, tail: &[u8]) -> Result<(), Error> {
        let mut t = Tokenizer::new(tail);
        let key = t.key()?.to_vec();
        let noreply = t.noreply()?;
        t.eof()?;

        let existed = self.cache.delete(&key).await?;
        if !noreply {
            if existed {
                self.writer.write_all(b"DELETED\r\n").await?;
            } else {
                self.writer.write_all(b"NOT_FOUND\r\n").await?;
            }
        }
        Ok(())
    }

    /// `flush_all [<expiration>][ noreply]`. The expiration and noreply
    /// slots are each independently optional, so `flush_all noreply` (no
    /// expiration) must parse too -- that's the one place this handler
    /// can't just chain `Tokenizer` calls blindly.
    async fn cmd_flush_all(&mut self, tail: &[u8]) -> Result<(), Error> {
        let mut t = Tokenizer::new(tail);
        let mut expiration_secs: u64 = 0;
        let mut noreply = false;

        if t.has_more() {
            let first = t.next_token("expiration")?;
            if first == b"noreply" {
                noreply = true;
            } else {
                expiration_secs = protocol::parse_decimal(first, "expiration")?;
                noreply = t.noreply()?;
            }
        }
        t.eof()?;

        if expiration_secs == 0 {
            self.cache.clear().await?;
            self.cancel_flush_timer();
        } else {
            self.schedule_flush_all(Duration::from_secs(expiration_secs));
        }

        if !noreply {
            self.writer.write_all(b"OK\r\n").await?;
        }
        Ok(())
    }

    fn cancel_flush_timer(&mut self) {
        if let Some(handle) = self.flush_timer.take() {
            handle.abort();
        }
    }

    /// A disconnected client cancels its own pending flush: the timer is a
    /// task owned by this connection, aborted on teardown or replaced by a
    /// later `flush_all` on the same connection. This is documented
    /// behavior (spec §9), not a bug.
    fn schedule_flush_all(&mut self, delay: Duration) {
        self.cancel_flush_timer();
        let cache = self.cache.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = cache.clear().await {
                log::error!("fatal cache error during scheduled flush_all: {e}");
                std::process::exit(1);
            }
        });
        self.flush_timer = Some(handle);
    }
}
