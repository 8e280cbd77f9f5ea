//! Calls over the tarsrpc wire protocol.
//!
//! Client side: a [`Communicator`] hands out [`ServantProxy`] stubs. Each
//! call is balanced across the servant's endpoints, encoded, correlated by
//! request id in the shared [`Correlator`] and completed either on the
//! calling thread or through a callback.
//!
//! Server side: [`RpcServer`] hosts [`Servant`]s behind a [`ServantHost`],
//! with optional [`ServerFilter`] hooks around every dispatch.

pub mod balance;
pub mod communicator;
pub mod config;
pub mod correlator;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod memory;
pub mod proxy;
pub mod registry;
pub mod servant;
pub mod server;
pub mod session;
pub mod sweeper;
pub mod worker;

mod sync;

pub use balance::{
    BalanceStrategy, ConsistentHash, LoadBalancer, RoundRobin, WeightedRoundRobin,
};
pub use communicator::{Communicator, CommunicatorBuilder};
pub use config::{CommunicatorConfig, ProxyOptions, ServantProxyConfig};
pub use correlator::{Correlator, TicketCallback, TicketHandle, TicketOutcome, TicketStatus};
pub use dispatch::{Dispatcher, Inbound};
pub use endpoint::{
    format_endpoint_list, parse_endpoint_list, split_object_name, Endpoint, Protocol,
};
pub use error::{RegistryError, Result, RpcError, ServantError};
pub use memory::MemoryNetwork;
pub use proxy::{CallOptions, ServantProxy};
pub use registry::{
    EndpointCache, EndpointResolver, FileEndpointCache, MemoryEndpointCache, RegistryClient,
    StaticRegistry,
};
pub use servant::{CallContext, Servant, ServantHost, ServerFilter};
pub use server::{RpcServer, ServerConfig, ServerHandle};
pub use session::{ConnectionPool, Connector, TcpConnector, TcpSession, TransportSession};
pub use sweeper::TimeoutSweeper;
pub use worker::WorkerPool;
