//! Connection acceptor (C5): bind, configure per-socket buffers, spawn one
//! task per connection, and support an orderly `Stop` that drains
//! in-flight handlers.
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

use crate::cache::Cache;
use crate::client::Connection;
use crate::config::Config;

/// A bound listener, not yet accepting connections. Splitting bind from
/// serve lets a caller learn the actual local address before the accept
/// loop starts -- useful when `config.port` is `0`.
pub struct Server {
    listener: TcpListener,
    running: AtomicBool,
    shutdown: Arc<Notify>,
    outstanding: Arc<AtomicUsize>,
}

impl Server {
    pub async fn bind(config: &Config) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind(config.addr()).await?;
        Ok(Server {
            listener,
            running: AtomicBool::new(false),
            shutdown: Arc::new(Notify::new()),
            outstanding: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// A cheap, cloneable handle for stopping the server from outside the
    /// task that's awaiting `serve`.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shutdown: self.shutdown.clone(),
            outstanding: self.outstanding.clone(),
        }
    }

    /// Accept and serve connections until `stop` is called on a handle.
    /// Calling `serve` while already running is a programming error, not a
    /// recoverable condition.
    pub async fn serve<C: Cache>(&self, config: &Config, cache: Arc<C>) {
        if self.running.swap(true, Ordering::SeqCst) {
            panic!("Server::serve called while already running");
        }

        log::info!(
            "listening on {}",
            self.local_addr().unwrap_or_else(|_| config.addr())
        );

        let read_buffer = config.read_buffer;
        let write_buffer = config.write_buffer;
        let os_recv_buffer = config.os_recv_buffer;
        let os_send_buffer = config.os_send_buffer;

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    break;
                }
                accepted = self.listener.accept() => {
                    let (socket, peer) = match accepted {
                        Ok(v) => v,
                        Err(e) => {
                            log::warn!("accept failed: {e}");
                            continue;
                        }
                    };

                    if let Err(e) = configure_socket(&socket, os_recv_buffer, os_send_buffer) {
                        log::warn!("could not configure socket buffers for {peer}: {e}");
                    }

                    let cache = cache.clone();
                    let outstanding = self.outstanding.clone();
                    outstanding.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(async move {
                        let (read_half, write_half) = socket.into_split();
                        let connection =
                            Connection::new(read_half, write_half, read_buffer, write_buffer, cache);
                        connection.serve().await;
                        outstanding.fetch_sub(1, Ordering::SeqCst);
                    });
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
    }
}

/// Stops a `Server` from another task. Cheap to clone; all clones share the
/// same underlying shutdown signal and outstanding-connection count.
#[derive(Clone)]
pub struct ServerHandle {
    shutdown: Arc<Notify>,
    outstanding: Arc<AtomicUsize>,
}

impl ServerHandle {
    /// Close the listener and wait for every in-flight connection handler
    /// to finish.
    pub async fn stop(&self) {
        self.shutdown.notify_one();
        while self.outstanding.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }
}

/// Set kernel `SO_RCVBUF`/`SO_SNDBUF` on an accepted socket. Tokio's
/// `TcpStream` doesn't expose these, so we reach for the raw fd the same
/// way a `setsockopt` call has to anywhere in this corpus.
fn configure_socket(
    socket: &TcpStream,
    recv_buffer: usize,
    send_buffer: usize,
) -> std::io::Result<()> {
    use std::os::fd::AsRawFd;
    let fd = socket.as_raw_fd();

    let set = |name: libc::c_int, size: usize| -> std::io::Result<()> {
        let size = size as libc::c_int;
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                name,
                &size as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(())
        }
    };

    set(libc::SO_RCVBUF, recv_buffer)?;
    set(libc::SO_SNDBUF, send_buffer)?;
    Ok(())
}
