//! Routing of complete inbound packages.
//!
//! A session's reactor calls [`Dispatcher::dispatch`] once per package.
//! Requests are decoded on the reactor and then run on the worker pool;
//! responses are parsed and resolved against the correlator right away,
//! since completing a ticket never runs user code on the reactor (async
//! continuations are queued onto the workers by the proxy).

use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tarsrpc_codec::{decode_frame, Codec};
use tracing::{debug, warn};

use crate::correlator::Correlator;
use crate::error::Result;
use crate::servant::ServantHost;
use crate::session::TransportSession;
use crate::worker::WorkerPool;

/// What a connection carries inbound.
#[derive(Debug, Clone)]
pub enum Inbound {
    /// Server side: requests for the hosted servants.
    Requests(Arc<ServantHost>),
    /// Client side: responses to outstanding calls.
    Responses(Arc<Correlator>),
}

pub struct Dispatcher {
    codec: Arc<dyn Codec>,
    inbound: Inbound,
    workers: Arc<WorkerPool>,
}

impl Dispatcher {
    pub fn new(codec: Arc<dyn Codec>, inbound: Inbound, workers: Arc<WorkerPool>) -> Self {
        Self {
            codec,
            inbound,
            workers,
        }
    }

    pub fn codec(&self) -> &Arc<dyn Codec> {
        &self.codec
    }

    /// Route one envelope (length header already stripped) that arrived on
    /// `session`.
    pub fn dispatch(&self, frame: Bytes, session: &Arc<dyn TransportSession>) {
        match &self.inbound {
            Inbound::Requests(host) => self.dispatch_request(host, frame, session),
            Inbound::Responses(correlator) => self.dispatch_response(correlator, &frame),
        }
    }

    /// Dispatch every complete package in `buf`, leaving any partial tail.
    ///
    /// Fails on an out-of-range length header; the connection is unusable
    /// after that.
    pub fn dispatch_buffer(
        &self,
        buf: &mut BytesMut,
        session: &Arc<dyn TransportSession>,
    ) -> Result<usize> {
        let mut dispatched = 0;
        while let Some(frame) = decode_frame(buf, self.codec.max_package_size())? {
            self.dispatch(frame, session);
            dispatched += 1;
        }
        Ok(dispatched)
    }

    fn dispatch_request(
        &self,
        host: &Arc<ServantHost>,
        frame: Bytes,
        session: &Arc<dyn TransportSession>,
    ) {
        let request = self.codec.parse_request(&frame);
        let request_id = request.packet.request_id;
        debug!(
            request_id,
            servant = %request.packet.servant,
            method = %request.packet.method,
            "inbound request"
        );

        let host = Arc::clone(host);
        let codec = Arc::clone(&self.codec);
        let session = Arc::clone(session);
        let queued = self.workers.execute(move || {
            let Some(package) = host.process(codec.as_ref(), request) else {
                return;
            };
            if let Err(err) = session.send(&package) {
                warn!(
                    request_id,
                    peer = %session.endpoint().address(),
                    error = %err,
                    "failed to write response"
                );
            }
        });
        if let Err(err) = queued {
            warn!(request_id, error = %err, "dropping request, worker pool is shut down");
        }
    }

    fn dispatch_response(&self, correlator: &Correlator, frame: &[u8]) {
        let response = match self.codec.parse_response(frame) {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "dropping response without a readable request id");
                return;
            }
        };

        let request_id = response.request_id;
        let result = response.result;
        if correlator.complete(request_id, response) {
            debug!(request_id, %result, "response matched");
        } else {
            warn!(request_id, "dropping late or unknown response");
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inbound = match self.inbound {
            Inbound::Requests(_) => "requests",
            Inbound::Responses(_) => "responses",
        };
        f.debug_struct("Dispatcher")
            .field("codec", &self.codec.name())
            .field("inbound", &inbound)
            .finish()
    }
}
