use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tarsrpc_codec::{CodecError, FrameConfig, FrameReader, FrameWriter};
use tarsrpc_transport::{RpcStream, TcpTransport};
use tracing::{debug, info, warn};

use crate::dispatch::Dispatcher;
use crate::endpoint::{Endpoint, Protocol};
use crate::error::{Result, RpcError};
use crate::sync::lock_ignore_poison;

/// One connection that can carry framed packages to a peer.
///
/// Inbound packages are delivered to the [`Dispatcher`] the session was
/// opened with, never returned from `send`.
pub trait TransportSession: Send + Sync + fmt::Debug {
    fn endpoint(&self) -> &Endpoint;

    /// Write one framed package (length header included).
    fn send(&self, package: &[u8]) -> Result<()>;

    fn is_open(&self) -> bool;

    fn close(&self);
}

/// Opens sessions to endpoints.
pub trait Connector: Send + Sync + fmt::Debug {
    fn connect(
        &self,
        endpoint: &Endpoint,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<Arc<dyn TransportSession>>;
}

/// A TCP connection with its own reactor thread.
///
/// The reactor blocks on the socket, cuts the byte stream into packages and
/// hands each one to the dispatcher. Writes from any thread are serialized
/// through the writer lock. A protocol violation closes the session.
pub struct TcpSession {
    endpoint: Endpoint,
    writer: Mutex<FrameWriter<RpcStream>>,
    control: RpcStream,
    open: AtomicBool,
}

impl TcpSession {
    pub fn start(
        stream: RpcStream,
        endpoint: Endpoint,
        frame: &FrameConfig,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<Arc<Self>> {
        let reader_stream = stream.try_clone()?;
        let control = stream.try_clone()?;

        // The reactor waits indefinitely; idle connections are not errors.
        let reader = FrameReader::with_config_tcp(
            reader_stream,
            FrameConfig {
                read_timeout: None,
                ..frame.clone()
            },
        )?;
        let writer = FrameWriter::with_config_tcp(stream, frame.clone())?;

        let session = Arc::new(Self {
            endpoint,
            writer: Mutex::new(writer),
            control,
            open: AtomicBool::new(true),
        });

        let reactor = Arc::clone(&session);
        thread::Builder::new()
            .name(format!("tarsrpc-reactor-{}", session.endpoint.address()))
            .spawn(move || reactor.run(reader, &dispatcher))?;
        Ok(session)
    }

    fn run(self: Arc<Self>, mut reader: FrameReader<RpcStream>, dispatcher: &Dispatcher) {
        let peer = self.endpoint.address();
        let session: Arc<dyn TransportSession> = Arc::clone(&self) as Arc<dyn TransportSession>;
        loop {
            match reader.read_frame() {
                Ok(frame) => dispatcher.dispatch(frame, &session),
                Err(CodecError::ConnectionClosed) => {
                    debug!(peer = %peer, "connection closed by peer");
                    break;
                }
                Err(err @ CodecError::InvalidLength { .. }) => {
                    warn!(peer = %peer, error = %err, "protocol violation, closing session");
                    break;
                }
                Err(err) => {
                    if self.is_open() {
                        debug!(peer = %peer, error = %err, "session read failed");
                    }
                    break;
                }
            }
        }
        self.close();
    }
}

impl TransportSession for TcpSession {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn send(&self, package: &[u8]) -> Result<()> {
        if !self.is_open() {
            return Err(RpcError::Disconnected(self.endpoint.address()));
        }
        let written = lock_ignore_poison(&self.writer).write_packet(package);
        if let Err(err) = written {
            if matches!(err, CodecError::Io(_) | CodecError::ConnectionClosed) {
                self.close();
            }
            return Err(err.into());
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            let _ = self.control.shutdown();
            debug!(peer = %self.endpoint.address(), "session closed");
        }
    }
}

impl fmt::Debug for TcpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpSession")
            .field("endpoint", &self.endpoint.address())
            .field("open", &self.is_open())
            .finish()
    }
}

/// Connects over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    pub frame: FrameConfig,
    pub connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(frame: FrameConfig, connect_timeout: Duration) -> Self {
        Self {
            frame,
            connect_timeout,
        }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(FrameConfig::default(), Duration::from_secs(3))
    }
}

impl Connector for TcpConnector {
    fn connect(
        &self,
        endpoint: &Endpoint,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<Arc<dyn TransportSession>> {
        if endpoint.protocol != Protocol::Tcp {
            return Err(RpcError::invalid_endpoint(
                &endpoint.to_string(),
                "only tcp sessions are supported",
            ));
        }
        let stream = TcpTransport::connect(&endpoint.address(), Some(self.connect_timeout))?;
        info!(endpoint = %endpoint.address(), "connected");
        let session = TcpSession::start(stream, endpoint.clone(), &self.frame, dispatcher)?;
        Ok(session)
    }
}

/// Lazily opened sessions, up to `per_endpoint` per endpoint, handed out
/// round-robin.
///
/// Connecting happens outside the table lock.
pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    dispatcher: Arc<Dispatcher>,
    per_endpoint: usize,
    sessions: Mutex<HashMap<String, Vec<Arc<dyn TransportSession>>>>,
    cursor: AtomicUsize,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>, dispatcher: Arc<Dispatcher>, per_endpoint: usize) -> Self {
        Self {
            connector,
            dispatcher,
            per_endpoint: per_endpoint.max(1),
            sessions: Mutex::new(HashMap::new()),
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn get(&self, endpoint: &Endpoint) -> Result<Arc<dyn TransportSession>> {
        let key = endpoint.address();
        if let Some(session) = self.pooled(&key, true) {
            return Ok(session);
        }

        let session = self.connector.connect(endpoint, Arc::clone(&self.dispatcher))?;

        let mut sessions = lock_ignore_poison(&self.sessions);
        let slot = sessions.entry(key.clone()).or_default();
        if slot.len() < self.per_endpoint {
            slot.push(Arc::clone(&session));
            return Ok(session);
        }
        drop(sessions);

        // Another caller filled the slot while we were connecting.
        session.close();
        self.pooled(&key, false)
            .ok_or_else(|| RpcError::Disconnected(key))
    }

    fn pooled(&self, key: &str, only_if_full: bool) -> Option<Arc<dyn TransportSession>> {
        let mut sessions = lock_ignore_poison(&self.sessions);
        let slot = sessions.get_mut(key)?;
        slot.retain(|s| s.is_open());
        if slot.is_empty() || (only_if_full && slot.len() < self.per_endpoint) {
            return None;
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % slot.len();
        Some(Arc::clone(&slot[index]))
    }

    /// Open sessions across all endpoints.
    pub fn len(&self) -> usize {
        lock_ignore_poison(&self.sessions)
            .values()
            .map(|slot| slot.iter().filter(|s| s.is_open()).count())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn close_all(&self) {
        let drained: Vec<_> = lock_ignore_poison(&self.sessions).drain().collect();
        for (_, slot) in drained {
            for session in slot {
                session.close();
            }
        }
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("per_endpoint", &self.per_endpoint)
            .field("open", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlator::Correlator;
    use crate::dispatch::Inbound;
    use crate::worker::WorkerPool;

    #[derive(Debug, Default)]
    struct CountingConnector {
        opened: AtomicUsize,
    }

    #[derive(Debug)]
    struct NullSession {
        endpoint: Endpoint,
        open: AtomicBool,
    }

    impl TransportSession for NullSession {
        fn endpoint(&self) -> &Endpoint {
            &self.endpoint
        }
        fn send(&self, _package: &[u8]) -> Result<()> {
            Ok(())
        }
        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
        fn close(&self) {
            self.open.store(false, Ordering::SeqCst);
        }
    }

    impl Connector for CountingConnector {
        fn connect(
            &self,
            endpoint: &Endpoint,
            _dispatcher: Arc<Dispatcher>,
        ) -> Result<Arc<dyn TransportSession>> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(NullSession {
                endpoint: endpoint.clone(),
                open: AtomicBool::new(true),
            }))
        }
    }

    fn dispatcher() -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(
            Arc::new(tarsrpc_codec::TarsCodec::new()),
            Inbound::Responses(Arc::new(Correlator::new())),
            Arc::new(WorkerPool::new("test-dispatch", 1).expect("pool should start")),
        ))
    }

    #[test]
    fn pool_opens_up_to_limit_then_rotates() {
        let connector = Arc::new(CountingConnector::default());
        let pool = ConnectionPool::new(connector.clone(), dispatcher(), 2);
        let endpoint = Endpoint::tcp("a", 1);

        let first = pool.get(&endpoint).expect("first session");
        let second = pool.get(&endpoint).expect("second session");
        assert!(!Arc::ptr_eq(&first, &second));
        for _ in 0..4 {
            pool.get(&endpoint).expect("pooled session");
        }
        assert_eq!(connector.opened.load(Ordering::SeqCst), 2);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn closed_sessions_are_replaced() {
        let connector = Arc::new(CountingConnector::default());
        let pool = ConnectionPool::new(connector.clone(), dispatcher(), 1);
        let endpoint = Endpoint::tcp("a", 1);

        pool.get(&endpoint).expect("session").close();
        let replacement = pool.get(&endpoint).expect("replacement");
        assert!(replacement.is_open());
        assert_eq!(connector.opened.load(Ordering::SeqCst), 2);

        pool.close_all();
        assert!(!replacement.is_open());
        assert!(pool.is_empty());
    }

    #[test]
    fn tcp_connector_refuses_udp() {
        let mut endpoint = Endpoint::tcp("127.0.0.1", 1);
        endpoint.protocol = Protocol::Udp;
        assert!(matches!(
            TcpConnector::default().connect(&endpoint, dispatcher()),
            Err(RpcError::InvalidEndpoint { .. })
        ));
    }
}
