use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tarsrpc_codec::{Codec, FrameConfig, TarsCodec};
use tarsrpc_transport::TcpTransport;
use tracing::{debug, info, warn};

use crate::dispatch::{Dispatcher, Inbound};
use crate::endpoint::Endpoint;
use crate::error::{Result, RpcError};
use crate::servant::ServantHost;
use crate::session::{TcpSession, TransportSession};
use crate::worker::WorkerPool;

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Delay between failed accepts, doubling per consecutive failure.
#[derive(Debug, Default)]
struct AcceptBackoff {
    failures: u32,
}

impl AcceptBackoff {
    /// Record a failure and return how long to wait before retrying.
    fn fail(&mut self) -> Duration {
        let delay = ACCEPT_BACKOFF_MIN
            .saturating_mul(1 << self.failures.min(7))
            .min(ACCEPT_BACKOFF_MAX);
        self.failures = self.failures.saturating_add(1);
        delay
    }

    fn reset(&mut self) {
        self.failures = 0;
    }
}

/// Server-side settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Threads running servant methods.
    pub worker_threads: usize,
    pub frame: FrameConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            frame: FrameConfig {
                write_timeout: Some(Duration::from_secs(5)),
                ..FrameConfig::default()
            },
        }
    }
}

/// Hosts servants on a TCP listener.
pub struct RpcServer {
    transport: TcpTransport,
    host: Arc<ServantHost>,
    codec: Arc<dyn Codec>,
    config: ServerConfig,
}

impl RpcServer {
    pub fn bind(addr: &str, host: Arc<ServantHost>) -> Result<Self> {
        let transport = TcpTransport::bind(addr)?;
        info!(addr = %transport.local_addr(), "server listening");
        Ok(Self {
            transport,
            host,
            codec: Arc::new(TarsCodec::new()),
            config: ServerConfig::default(),
        })
    }

    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// Accept connections until `stop` is set. Blocks the calling thread.
    pub fn serve_until(self, stop: &AtomicBool) -> Result<()> {
        let workers = Arc::new(WorkerPool::new("tarsrpc-server", self.config.worker_threads)?);
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&self.codec),
            Inbound::Requests(Arc::clone(&self.host)),
            Arc::clone(&workers),
        ));
        let mut sessions: Vec<Arc<TcpSession>> = Vec::new();
        let mut backoff = AcceptBackoff::default();

        while !stop.load(Ordering::Acquire) {
            let stream = match self.transport.accept() {
                Ok(stream) => {
                    backoff.reset();
                    stream
                }
                Err(err) => {
                    if stop.load(Ordering::Acquire) {
                        break;
                    }
                    let delay = backoff.fail();
                    if backoff.failures == 1 {
                        warn!(error = %err, "accept failed");
                    } else {
                        debug!(error = %err, failures = backoff.failures, "accept still failing");
                    }
                    thread::sleep(delay);
                    continue;
                }
            };
            if stop.load(Ordering::Acquire) {
                break;
            }

            let peer = match stream.peer_addr() {
                Ok(addr) => Endpoint::tcp(addr.ip().to_string(), addr.port()),
                Err(_) => Endpoint::tcp("unknown", 0),
            };
            info!(peer = %peer.address(), "accepted connection");
            match TcpSession::start(stream, peer, &self.config.frame, Arc::clone(&dispatcher)) {
                Ok(session) => {
                    sessions.retain(|s| s.is_open());
                    sessions.push(session);
                }
                Err(err) => warn!(error = %err, "failed to start session"),
            }
        }

        debug!(open = sessions.len(), "server stopping");
        for session in &sessions {
            session.close();
        }
        workers.shutdown();
        info!(addr = %self.transport.local_addr(), "server stopped");
        Ok(())
    }

    /// Accept connections forever.
    pub fn serve(self) -> Result<()> {
        self.serve_until(&AtomicBool::new(false))
    }

    /// Run the accept loop on a background thread.
    pub fn spawn(self) -> Result<ServerHandle> {
        let addr = self.local_addr();
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name("tarsrpc-accept".into())
            .spawn(move || self.serve_until(&flag))?;
        Ok(ServerHandle {
            addr,
            stop,
            thread: Some(thread),
        })
    }
}

/// Handle on a spawned server. Shuts it down on drop.
pub struct ServerHandle {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<Result<()>>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Endpoint clients can connect to.
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::tcp(self.addr.ip().to_string(), self.addr.port())
    }

    /// Stop accepting, close every connection and wait for the accept loop.
    pub fn shutdown(&mut self) -> Result<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        self.stop.store(true, Ordering::Release);
        // Wake the blocking accept.
        let _ = TcpTransport::connect(&self.addr.to_string(), Some(Duration::from_secs(1)));
        thread
            .join()
            .map_err(|_| RpcError::Disconnected("accept thread panicked".to_string()))?
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}
