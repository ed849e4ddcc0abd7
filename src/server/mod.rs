//! The accept loop: a single-threaded server on a local stream socket,
//! reading framed search requests and writing framed replies.

pub mod wire;

use std::fs;
use std::io::{self, BufReader, BufWriter, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::engine::Engine;
use crate::error::{Result, SimError};
use wire::{SearchRequest, SearchResponse};

pub struct SimServer {
    engine: Engine,
    config: ServerConfig,
    total_requests: AtomicU64,
    shutdown: Arc<AtomicBool>,
}

impl SimServer {
    pub fn new(engine: Engine, config: ServerConfig) -> Self {
        Self {
            engine,
            config,
            total_requests: AtomicU64::new(0),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Flag another thread can set to stop the accept loop.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Bind the socket and serve until shutdown. Requests are serialized
    /// through the engine; each connection may carry several in sequence.
    pub fn run(&self) -> Result<()> {
        let listener = bind_socket(&self.config.socket_path)?;
        listener.set_nonblocking(true)?;
        info!(socket = %self.config.socket_path.display(), "ready for searches");

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                info!("shutdown requested, stopping server");
                break;
            }
            match listener.accept() {
                Ok((stream, _addr)) => {
                    if let Err(err) = self.handle_connection(stream) {
                        debug!(error = %err, "connection error");
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(err) => {
                    error!(error = %err, "accept error");
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
        }

        if self.config.socket_path.exists() {
            let _ = fs::remove_file(&self.config.socket_path);
        }
        info!(
            requests = self.total_requests.load(Ordering::Relaxed),
            "server stopped"
        );
        Ok(())
    }

    fn handle_connection(&self, stream: UnixStream) -> io::Result<()> {
        stream.set_read_timeout(Some(self.config.request_timeout))?;
        stream.set_write_timeout(Some(self.config.request_timeout))?;
        let mut reader = BufReader::new(stream.try_clone()?);
        let mut writer = BufWriter::new(stream);

        loop {
            let request = match SearchRequest::read_from(&mut reader) {
                Ok(Some(request)) => request,
                Ok(None) => return Ok(()), // client closed between requests
                Err(SimError::Io(err))
                    if matches!(
                        err.kind(),
                        io::ErrorKind::UnexpectedEof
                            | io::ErrorKind::TimedOut
                            | io::ErrorKind::WouldBlock
                    ) =>
                {
                    debug!("client went away mid-frame");
                    return Ok(());
                }
                Err(SimError::Io(err)) => return Err(err),
                Err(err) => {
                    // Malformed framing: close without a reply.
                    warn!(error = %err, "malformed request, closing connection");
                    return Ok(());
                }
            };

            self.total_requests.fetch_add(1, Ordering::Relaxed);
            debug!(
                request_id = request.request_id,
                databases = request.selections.len(),
                k = request.return_count,
                cutoff = request.cutoff,
                "search request"
            );

            let results = match self.engine.query(
                &request.selections,
                request.request_id,
                request.return_count as usize,
                request.cutoff,
                &request.query_words,
            ) {
                Ok(results) => results,
                Err(err @ SimError::Protocol(_)) => {
                    warn!(error = %err, "rejecting request, closing connection");
                    return Ok(());
                }
                Err(err) => {
                    warn!(error = %err, "query failed, closing connection");
                    return Ok(());
                }
            };

            let response = SearchResponse::from_results(request.request_id, results);
            if let Err(err) = response
                .write_to(&mut writer)
                .and_then(|()| writer.flush())
            {
                // In-flight work is already done; just drop the results.
                debug!(error = %err, "client disconnected during write");
                return Ok(());
            }
        }
    }
}

/// Bind the listener, clearing a stale socket file once before giving up.
fn bind_socket(path: &Path) -> Result<UnixListener> {
    match UnixListener::bind(path) {
        Ok(listener) => Ok(listener),
        Err(first) => {
            warn!(
                socket = %path.display(),
                error = %first,
                "bind failed, removing stale socket and retrying"
            );
            let _ = fs::remove_file(path);
            UnixListener::bind(path).map_err(|err| {
                SimError::Config(format!("cannot bind socket {}: {err}", path.display()))
            })
        }
    }
}
