use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};

use bytes::BytesMut;
use tarsrpc_transport::TransportError;
use tracing::debug;

use crate::dispatch::Dispatcher;
use crate::endpoint::Endpoint;
use crate::error::{Result, RpcError};
use crate::session::{Connector, TransportSession};
use crate::sync::{read_ignore_poison, write_ignore_poison};

#[derive(Clone)]
enum Listener {
    Serve(Arc<Dispatcher>),
    Blackhole,
}

/// In-process network of listening endpoints.
///
/// Sessions deliver packages synchronously into the remote dispatcher, which
/// queues request handling onto its own worker pool. A black-hole endpoint
/// accepts connections and swallows every package, so calls to it time out.
#[derive(Default)]
pub struct MemoryNetwork {
    listeners: RwLock<HashMap<String, Listener>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Accept connections on `endpoint`, handing requests to `dispatcher`.
    pub fn serve(&self, endpoint: &Endpoint, dispatcher: Arc<Dispatcher>) {
        write_ignore_poison(&self.listeners).insert(endpoint.address(), Listener::Serve(dispatcher));
    }

    pub fn blackhole(&self, endpoint: &Endpoint) {
        write_ignore_poison(&self.listeners).insert(endpoint.address(), Listener::Blackhole);
    }

    /// Stop listening on `endpoint`. Open sessions are unaffected.
    pub fn unlisten(&self, endpoint: &Endpoint) {
        write_ignore_poison(&self.listeners).remove(&endpoint.address());
    }
}

impl Connector for MemoryNetwork {
    fn connect(
        &self,
        endpoint: &Endpoint,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<Arc<dyn TransportSession>> {
        let listener = read_ignore_poison(&self.listeners)
            .get(&endpoint.address())
            .cloned();
        let open = Arc::new(AtomicBool::new(true));

        let session = match listener {
            None => {
                return Err(RpcError::Transport(TransportError::Connect {
                    addr: endpoint.address(),
                    source: io::Error::new(io::ErrorKind::ConnectionRefused, "nothing listening"),
                }))
            }
            Some(Listener::Blackhole) => Arc::new(MemorySession {
                endpoint: endpoint.clone(),
                open,
                link: PeerLink::None,
            }),
            Some(Listener::Serve(server)) => {
                let client_endpoint = endpoint.clone();
                Arc::new_cyclic(|client: &Weak<MemorySession>| {
                    let server_half = Arc::new(MemorySession {
                        endpoint: Endpoint::tcp("memory-client", 0),
                        open: Arc::clone(&open),
                        link: PeerLink::Back {
                            peer: client.clone(),
                            dispatcher,
                        },
                    });
                    MemorySession {
                        endpoint: client_endpoint,
                        open,
                        link: PeerLink::Owned {
                            peer: server_half,
                            dispatcher: server,
                        },
                    }
                })
            }
        };
        debug!(endpoint = %endpoint.address(), "memory session opened");
        Ok(session)
    }
}

impl fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut endpoints: Vec<String> = read_ignore_poison(&self.listeners).keys().cloned().collect();
        endpoints.sort();
        f.debug_struct("MemoryNetwork")
            .field("listening", &endpoints)
            .finish()
    }
}

/// Each half delivers into the dispatcher of the other side, naming the
/// other half as the session to answer on. The client half owns the server
/// half; the server half points back weakly.
enum PeerLink {
    Owned {
        peer: Arc<MemorySession>,
        dispatcher: Arc<Dispatcher>,
    },
    Back {
        peer: Weak<MemorySession>,
        dispatcher: Arc<Dispatcher>,
    },
    None,
}

struct MemorySession {
    endpoint: Endpoint,
    open: Arc<AtomicBool>,
    link: PeerLink,
}

impl TransportSession for MemorySession {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn send(&self, package: &[u8]) -> Result<()> {
        if !self.is_open() {
            return Err(RpcError::Disconnected(self.endpoint.address()));
        }
        let (peer, dispatcher): (Arc<MemorySession>, &Arc<Dispatcher>) = match &self.link {
            PeerLink::Owned { peer, dispatcher } => (Arc::clone(peer), dispatcher),
            PeerLink::Back { peer, dispatcher } => match peer.upgrade() {
                Some(peer) => (peer, dispatcher),
                None => return Err(RpcError::Disconnected(self.endpoint.address())),
            },
            PeerLink::None => return Ok(()),
        };

        let peer: Arc<dyn TransportSession> = peer;
        let mut buf = BytesMut::from(package);
        if let Err(err) = dispatcher.dispatch_buffer(&mut buf, &peer) {
            self.close();
            return Err(err);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}

impl fmt::Debug for MemorySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySession")
            .field("endpoint", &self.endpoint.address())
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlator::Correlator;
    use crate::dispatch::Inbound;
    use crate::worker::WorkerPool;

    fn client_dispatcher() -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(
            Arc::new(tarsrpc_codec::TarsCodec::new()),
            Inbound::Responses(Arc::new(Correlator::new())),
            Arc::new(WorkerPool::new("test-memory", 1).expect("pool should start")),
        ))
    }

    #[test]
    fn connect_to_nothing_is_refused() {
        let network = MemoryNetwork::new();
        assert!(matches!(
            network.connect(&Endpoint::tcp("nowhere", 1), client_dispatcher()),
            Err(RpcError::Transport(TransportError::Connect { .. }))
        ));
    }

    #[test]
    fn blackhole_swallows_packages() {
        let network = MemoryNetwork::new();
        let endpoint = Endpoint::tcp("void", 1);
        network.blackhole(&endpoint);
        let session = network
            .connect(&endpoint, client_dispatcher())
            .expect("blackhole accepts");
        session.send(&[0, 0, 0, 5, 0]).expect("send is swallowed");

        session.close();
        assert!(matches!(session.send(&[0, 0, 0, 5, 0]), Err(RpcError::Disconnected(_))));
    }

    #[test]
    fn malformed_package_closes_session() {
        let network = MemoryNetwork::new();
        let endpoint = Endpoint::tcp("server", 1);
        network.serve(&endpoint, client_dispatcher());
        let session = network
            .connect(&endpoint, client_dispatcher())
            .expect("server accepts");

        assert!(session.send(&[0, 0, 0, 2]).is_err());
        assert!(!session.is_open());
    }
}
