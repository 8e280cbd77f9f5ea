//! Client invocation pipeline.
//!
//! Per call: refresh endpoints if due, pick an endpoint, encode the
//! envelope, take a session from the pool, register a ticket, send, then
//! wait (sync) or return (async) and decode the reply.
//!
//! Nothing is registered until the envelope is encoded and a session is in
//! hand, so failures before the send never leave a pending ticket behind.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tarsrpc_codec::{
    CallArgs, CallReply, Codec, InterfaceDescriptor, MethodDescriptor, PacketType,
    ProtocolVersion, RequestPacket, ResponsePacket,
};
use tracing::{debug, warn};

use crate::balance::LoadBalancer;
use crate::config::ServantProxyConfig;
use crate::correlator::{Correlator, TicketHandle, TicketOutcome};
use crate::endpoint::Endpoint;
use crate::error::{Result, RpcError};
use crate::registry::EndpointResolver;
use crate::session::{ConnectionPool, TransportSession};
use crate::worker::WorkerPool;

const MAX_ID_ATTEMPTS: usize = 16;

/// Per-call overrides.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Propagated call metadata.
    pub context: BTreeMap<String, String>,
    /// Routing and diagnostic hints.
    pub status: BTreeMap<String, String>,
    /// Envelope version; defaults to the proxy's.
    pub version: Option<ProtocolVersion>,
    /// Routing key for hashing balancers.
    pub hash_code: Option<u64>,
    /// Deadline; defaults to the proxy's sync or async timeout.
    pub timeout: Option<Duration>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_version(mut self, version: ProtocolVersion) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_hash(mut self, hash_code: u64) -> Self {
        self.hash_code = Some(hash_code);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

struct Prepared {
    method: Arc<MethodDescriptor>,
    request: RequestPacket,
    session: Arc<dyn TransportSession>,
}

/// Client stub for one servant: every call through it shares one
/// configuration, balancer cursor and session pool.
pub struct ServantProxy {
    config: Arc<ServantProxyConfig>,
    interface: Arc<InterfaceDescriptor>,
    codec: Arc<dyn Codec>,
    balancer: Box<dyn LoadBalancer>,
    resolver: EndpointResolver,
    pool: ConnectionPool,
    correlator: Arc<Correlator>,
    workers: Arc<WorkerPool>,
}

impl ServantProxy {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: Arc<ServantProxyConfig>,
        interface: Arc<InterfaceDescriptor>,
        codec: Arc<dyn Codec>,
        balancer: Box<dyn LoadBalancer>,
        resolver: EndpointResolver,
        pool: ConnectionPool,
        correlator: Arc<Correlator>,
        workers: Arc<WorkerPool>,
    ) -> Self {
        Self {
            config,
            interface,
            codec,
            balancer,
            resolver,
            pool,
            correlator,
            workers,
        }
    }

    pub fn config(&self) -> &ServantProxyConfig {
        &self.config
    }

    pub fn interface(&self) -> &InterfaceDescriptor {
        &self.interface
    }

    pub fn codec(&self) -> &Arc<dyn Codec> {
        &self.codec
    }

    pub fn endpoints(&self) -> Arc<Vec<Endpoint>> {
        self.config.endpoints()
    }

    /// Synchronous call with default options.
    pub fn invoke(&self, method: &str, args: CallArgs) -> Result<CallReply> {
        self.invoke_with(method, args, &CallOptions::default())
    }

    /// Synchronous call: blocks until the reply arrives or the deadline
    /// passes. Methods declared with a callback parameter must go through
    /// [`ServantProxy::invoke_async`].
    pub fn invoke_with(&self, method: &str, args: CallArgs, options: &CallOptions) -> Result<CallReply> {
        let method = self.lookup(method)?;
        if method.is_async() {
            return Err(RpcError::UnknownMethod(format!(
                "{} (declared async, use invoke_async)",
                method.name
            )));
        }
        self.call(method, &args, options)
    }

    /// Liveness probe.
    pub fn ping(&self) -> Result<()> {
        self.call(Arc::new(MethodDescriptor::ping()), &CallArgs::new(), &CallOptions::default())
            .map(|_| ())
    }

    fn call(&self, method: Arc<MethodDescriptor>, args: &CallArgs, options: &CallOptions) -> Result<CallReply> {
        let timeout = options.timeout.unwrap_or(self.config.sync_timeout);
        let prepared = self.prepare(method, args, options, PacketType::Normal, timeout)?;
        let method = Arc::clone(&prepared.method);
        let handle = self.submit(prepared, timeout)?;

        let response = self.correlator.wait(&handle, timeout)?;
        finish(self.codec.as_ref(), &method, response)
    }

    /// Asynchronous call. Returns once the request is sent; `callback` runs
    /// exactly once on a worker thread with the decoded reply or the failure
    /// (including timeouts).
    ///
    /// Failures before the send are returned directly and `callback` is not
    /// invoked.
    pub fn invoke_async<F>(&self, method: &str, args: CallArgs, options: &CallOptions, callback: F) -> Result<()>
    where
        F: FnOnce(Result<CallReply>) + Send + 'static,
    {
        let method = self.lookup(method)?;
        let timeout = options.timeout.unwrap_or(self.config.async_timeout);
        let prepared = self.prepare(method, &args, options, PacketType::Normal, timeout)?;

        let method = Arc::clone(&prepared.method);
        let codec = Arc::clone(&self.codec);
        let workers = Arc::clone(&self.workers);
        let handle = self.submit(prepared, timeout)?;

        let request_id = handle.request_id();
        let continuation = Box::new(move |outcome: TicketOutcome| {
            let queued = workers.execute(move || {
                let result = match outcome {
                    TicketOutcome::Completed(response) => finish(codec.as_ref(), &method, response),
                    TicketOutcome::Expired => Err(RpcError::Timeout(timeout)),
                };
                callback(result);
            });
            if queued.is_err() {
                warn!(request_id, "async reply dropped, worker pool is shut down");
            }
        });
        self.correlator.register_callback(&handle, continuation);
        Ok(())
    }

    /// Fire-and-forget call: no ticket, no reply.
    pub fn invoke_oneway(&self, method: &str, args: CallArgs, options: &CallOptions) -> Result<()> {
        let method = self.lookup(method)?;
        let timeout = options.timeout.unwrap_or(self.config.sync_timeout);
        let mut prepared = self.prepare(method, &args, options, PacketType::OneWay, timeout)?;
        prepared.request.request_id = self.correlator.next_request_id();
        let package = self.codec.encode_request(&prepared.request)?;
        prepared.session.send(&package)?;
        debug!(
            request_id = prepared.request.request_id,
            servant = %self.config.simple_object_name,
            method = %prepared.request.method,
            "one-way request sent"
        );
        Ok(())
    }

    /// Re-resolve the endpoint list now. Keeps the current list on failure.
    pub fn refresh_endpoints(&self) -> Result<()> {
        match self.resolver.resolve(&self.config) {
            Ok(endpoints) => {
                debug!(
                    servant = %self.config.simple_object_name,
                    endpoints = endpoints.len(),
                    "endpoints refreshed"
                );
                self.config.set_endpoints(endpoints);
                Ok(())
            }
            Err(err) => {
                self.config.touch_refresh();
                Err(err)
            }
        }
    }

    fn refresh_if_due(&self) {
        if !self.config.refresh_due(Instant::now()) {
            return;
        }
        let Some(_refreshing) = self.config.try_begin_refresh() else {
            return;
        };
        if !self.config.refresh_due(Instant::now()) {
            return;
        }
        if let Err(err) = self.refresh_endpoints() {
            warn!(
                servant = %self.config.simple_object_name,
                error = %err,
                "endpoint refresh failed, keeping previous list"
            );
        }
    }

    fn lookup(&self, method: &str) -> Result<Arc<MethodDescriptor>> {
        self.interface
            .lookup(method)
            .ok_or_else(|| RpcError::UnknownMethod(method.to_string()))
    }

    fn prepare(
        &self,
        method: Arc<MethodDescriptor>,
        args: &CallArgs,
        options: &CallOptions,
        packet_type: PacketType,
        timeout: Duration,
    ) -> Result<Prepared> {
        self.refresh_if_due();
        let endpoints = self.config.endpoints();
        let endpoint = self
            .balancer
            .pick(&self.config, &endpoints, options.hash_code)?;

        let version = options.version.unwrap_or(self.config.version);
        let mut request = RequestPacket::new(self.config.simple_object_name.as_str(), method.name.as_str());
        request.version = version;
        request.packet_type = packet_type;
        request.timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        request.context = options.context.clone();
        request.status = options.status.clone();
        request.body = self.codec.encode_request_body(version, &method, args)?;

        let session = self.pool.get(&endpoint)?;
        Ok(Prepared {
            method,
            request,
            session,
        })
    }

    /// Assign a free request id, register its ticket and send.
    fn submit(&self, prepared: Prepared, timeout: Duration) -> Result<TicketHandle> {
        let Prepared {
            mut request,
            session,
            ..
        } = prepared;

        for _ in 0..MAX_ID_ATTEMPTS {
            request.request_id = self.correlator.next_request_id();
            let package: Bytes = self.codec.encode_request(&request)?;
            let handle = match self.correlator.register(request.request_id, timeout) {
                Ok(handle) => handle,
                Err(RpcError::DuplicateTicket(_)) => continue,
                Err(err) => return Err(err),
            };

            if let Err(err) = session.send(&package) {
                self.correlator.cancel(request.request_id);
                return Err(err);
            }
            debug!(
                request_id = request.request_id,
                servant = %request.servant,
                method = %request.method,
                endpoint = %session.endpoint().address(),
                "request sent"
            );
            return Ok(handle);
        }
        Err(RpcError::DuplicateTicket(request.request_id))
    }

    /// Close every pooled session.
    pub fn close(&self) {
        self.pool.close_all();
    }
}

/// Turn a matched response into the caller's result.
fn finish(codec: &dyn Codec, method: &MethodDescriptor, response: ResponsePacket) -> Result<CallReply> {
    if !response.result.is_success() {
        return Err(RpcError::Remote {
            code: response.result,
            message: response.description,
        });
    }
    let mut reply = codec.decode_response_body(response.version, method, &response.body)?;
    reply.status = response.status;
    Ok(reply)
}

impl fmt::Debug for ServantProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServantProxy")
            .field("object_name", &self.config.object_name)
            .field("interface", &self.interface.name())
            .field("codec", &self.codec.name())
            .field("balancer", &self.balancer)
            .field("pool", &self.pool)
            .finish()
    }
}
