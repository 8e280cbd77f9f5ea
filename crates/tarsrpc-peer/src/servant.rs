use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use bytes::Bytes;
use tarsrpc_codec::{
    CallArgs, Codec, InterfaceDescriptor, MethodDescriptor, MethodLookup, MethodRegistry,
    ProtocolVersion, ResponsePacket, ResultCode, ServantRequest, Value,
};
use tracing::{debug, warn};

use crate::error::ServantError;

/// Request metadata visible to a servant method.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub servant: String,
    pub method: String,
    pub request_id: i32,
    pub version: ProtocolVersion,
    pub context: BTreeMap<String, String>,
    pub status: BTreeMap<String, String>,
}

/// A hosted service object.
///
/// `invoke` receives decoded inputs in `args.inputs` and writes results for
/// out parameters into `args.outputs`.
pub trait Servant: Send + Sync {
    fn interface(&self) -> Arc<InterfaceDescriptor>;

    fn invoke(
        &self,
        method: &MethodDescriptor,
        args: &mut CallArgs,
        ctx: &CallContext,
    ) -> Result<Option<Value>, ServantError>;
}

/// Hook around servant dispatch.
///
/// `before` hooks run in registration order and may reject the call; the
/// `after` hooks of every filter whose `before` ran then run in reverse.
pub trait ServerFilter: Send + Sync {
    fn before(&self, _request: &ServantRequest) -> Result<(), ServantError> {
        Ok(())
    }

    fn after(&self, _request: &ServantRequest, _response: &mut ResponsePacket) {}
}

struct Hosted {
    servant: Arc<dyn Servant>,
    interface: Arc<InterfaceDescriptor>,
}

/// Servants by object name, plus the filter chain.
///
/// Also serves as the method registry used to decode request bodies.
#[derive(Default)]
pub struct ServantHost {
    servants: HashMap<String, Hosted>,
    filters: Vec<Arc<dyn ServerFilter>>,
}

impl ServantHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_servant(mut self, name: impl Into<String>, servant: Arc<dyn Servant>) -> Self {
        self.add_servant(name, servant);
        self
    }

    pub fn add_servant(&mut self, name: impl Into<String>, servant: Arc<dyn Servant>) {
        let interface = servant.interface();
        self.servants.insert(name.into(), Hosted { servant, interface });
    }

    pub fn with_filter(mut self, filter: Arc<dyn ServerFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn servant_names(&self) -> impl Iterator<Item = &str> {
        self.servants.keys().map(String::as_str)
    }

    /// Decode, invoke and encode one request.
    ///
    /// Returns the framed response, or `None` for one-way requests and for
    /// responses that could not be encoded at all.
    pub fn process(&self, codec: &dyn Codec, mut request: ServantRequest) -> Option<Bytes> {
        codec.decode_request_body(&mut request, self);
        let response = self.respond(codec, &request);

        match codec.encode_response(&response) {
            Ok(package) => package,
            Err(err) => {
                warn!(
                    request_id = request.packet.request_id,
                    method = %request.packet.method,
                    error = %err,
                    "response encode failed"
                );
                let fallback = ResponsePacket::for_request(&request.packet)
                    .with_result(ResultCode::ServerEncodeError, err.to_string());
                codec.encode_response(&fallback).ok().flatten()
            }
        }
    }

    fn respond(&self, codec: &dyn Codec, request: &ServantRequest) -> ResponsePacket {
        let mut response = ResponsePacket::for_request(&request.packet);
        if !request.is_routable() {
            return response.with_result(request.result, request.description.clone());
        }
        let Some(method) = request.method.as_ref() else {
            return response.with_result(ResultCode::ServerDecodeError, "method not resolved");
        };

        let mut entered = 0;
        let mut rejected = None;
        for filter in &self.filters {
            entered += 1;
            if let Err(err) = filter.before(request) {
                rejected = Some(err);
                break;
            }
        }

        response = match rejected {
            Some(err) => response.with_result(err.code, err.message),
            None if method.is_ping() => response,
            None => self.invoke(codec, request, method, response),
        };

        for filter in self.filters[..entered].iter().rev() {
            filter.after(request, &mut response);
        }
        response
    }

    fn invoke(
        &self,
        codec: &dyn Codec,
        request: &ServantRequest,
        method: &MethodDescriptor,
        mut response: ResponsePacket,
    ) -> ResponsePacket {
        let packet = &request.packet;
        let Some(hosted) = self.servants.get(&packet.servant) else {
            return response.with_result(
                ResultCode::NoSuchServant,
                format!("no servant '{}'", packet.servant),
            );
        };

        let ctx = CallContext {
            servant: packet.servant.clone(),
            method: packet.method.clone(),
            request_id: packet.request_id,
            version: packet.version,
            context: packet.context.clone(),
            status: packet.status.clone(),
        };
        let mut args = request.args.clone();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            hosted.servant.invoke(method, &mut args, &ctx)
        }));

        match outcome {
            Ok(Ok(ret)) => {
                match codec.encode_response_body(packet.version, method, ret.as_ref(), &args) {
                    Ok(body) => response.body = body,
                    Err(err) => {
                        return response.with_result(ResultCode::ServerEncodeError, err.to_string())
                    }
                }
                debug!(request_id = packet.request_id, method = %packet.method, "invoked");
                response
            }
            Ok(Err(err)) => {
                debug!(
                    request_id = packet.request_id,
                    method = %packet.method,
                    error = %err,
                    "servant returned an error"
                );
                response.with_result(err.code, err.message)
            }
            Err(_) => {
                warn!(request_id = packet.request_id, method = %packet.method, "servant panicked");
                response.with_result(ResultCode::Unknown, "servant panicked")
            }
        }
    }
}

impl MethodRegistry for ServantHost {
    fn lookup(&self, servant: &str, method: &str) -> MethodLookup {
        match self.servants.get(servant) {
            None => MethodLookup::NoSuchServant,
            Some(hosted) => hosted
                .interface
                .lookup(method)
                .map_or(MethodLookup::NoSuchMethod, MethodLookup::Found),
        }
    }
}

impl fmt::Debug for ServantHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.servant_names().collect();
        names.sort_unstable();
        f.debug_struct("ServantHost")
            .field("servants", &names)
            .field("filters", &self.filters.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tarsrpc_codec::{PacketType, RequestPacket, Stamp, TarsCodec, HEADER_SIZE};

    use super::*;

    struct Calculator;

    impl Servant for Calculator {
        fn interface(&self) -> Arc<InterfaceDescriptor> {
            Arc::new(
                InterfaceDescriptor::new("Test.Calculator")
                    .method(
                        MethodDescriptor::new("add")
                            .input("a", Stamp::Int)
                            .input("b", Stamp::Int)
                            .output("sum", Stamp::Int)
                            .returns(Stamp::Int),
                    )
                    .method(MethodDescriptor::new("fail"))
                    .method(MethodDescriptor::new("explode")),
            )
        }

        fn invoke(
            &self,
            method: &MethodDescriptor,
            args: &mut CallArgs,
            _ctx: &CallContext,
        ) -> Result<Option<Value>, ServantError> {
            match method.name.as_str() {
                "add" => {
                    let a = args.input("a").and_then(Value::as_i64).unwrap_or(0);
                    let b = args.input("b").and_then(Value::as_i64).unwrap_or(0);
                    args.set_output("sum", Value::Int((a + b) as i32));
                    Ok(Some(Value::Int(0)))
                }
                "fail" => Err(ServantError::new(ResultCode::Overload, "too busy")),
                _ => panic!("boom"),
            }
        }
    }

    struct Recording {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        reject: bool,
    }

    impl ServerFilter for Recording {
        fn before(&self, _request: &ServantRequest) -> Result<(), ServantError> {
            self.log.lock().expect("lock").push(format!("before {}", self.name));
            if self.reject {
                Err(ServantError::new(ResultCode::InvalidSet, "rejected"))
            } else {
                Ok(())
            }
        }

        fn after(&self, _request: &ServantRequest, _response: &mut ResponsePacket) {
            self.log.lock().expect("lock").push(format!("after {}", self.name));
        }
    }

    fn call(host: &ServantHost, method: &str, args: &CallArgs) -> Option<ResponsePacket> {
        let codec = TarsCodec::new();
        let mut packet = RequestPacket::new("Test.CalcObj", method);
        packet.request_id = 5;
        if let MethodLookup::Found(desc) = host.lookup("Test.CalcObj", method) {
            packet.body = codec
                .encode_request_body(packet.version, &desc, args)
                .expect("body should encode");
        }
        let wire = codec.encode_request(&packet).expect("request should encode");
        let request = codec.parse_request(&wire[HEADER_SIZE..]);
        host.process(&codec, request).map(|package| {
            codec
                .parse_response(&package[HEADER_SIZE..])
                .expect("response should parse")
        })
    }

    fn host() -> ServantHost {
        ServantHost::new().with_servant("Test.CalcObj", Arc::new(Calculator))
    }

    #[test]
    fn invoke_writes_return_and_outputs() {
        let host = host();
        let response = call(&host, "add", &CallArgs::new().with_input("a", 40).with_input("b", 2))
            .expect("response expected");
        assert_eq!(response.result, ResultCode::Success);

        let desc = match host.lookup("Test.CalcObj", "add") {
            MethodLookup::Found(desc) => desc,
            other => panic!("unexpected lookup {other:?}"),
        };
        let reply = TarsCodec::new()
            .decode_response_body(response.version, &desc, &response.body)
            .expect("body should decode");
        assert_eq!(reply.ret, Some(Value::Int(0)));
        assert_eq!(reply.output("sum"), Some(&Value::Int(42)));
    }

    #[test]
    fn servant_error_and_panic_become_result_codes() {
        let host = host();
        let failed = call(&host, "fail", &CallArgs::new()).expect("response expected");
        assert_eq!(failed.result, ResultCode::Overload);
        assert_eq!(failed.description, "too busy");

        let exploded = call(&host, "explode", &CallArgs::new()).expect("response expected");
        assert_eq!(exploded.result, ResultCode::Unknown);
    }

    #[test]
    fn lookup_distinguishes_servant_and_method() {
        let host = host();
        assert!(matches!(host.lookup("Nope.Obj", "add"), MethodLookup::NoSuchServant));
        assert!(matches!(host.lookup("Test.CalcObj", "nope"), MethodLookup::NoSuchMethod));
        assert!(matches!(host.lookup("Test.CalcObj", "tars_ping"), MethodLookup::Found(_)));

        let response = call(&host, "nope", &CallArgs::new()).expect("response expected");
        assert_eq!(response.result, ResultCode::NoSuchMethod);
    }

    #[test]
    fn filters_wrap_dispatch_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let host = host()
            .with_filter(Arc::new(Recording { name: "outer", log: Arc::clone(&log), reject: false }))
            .with_filter(Arc::new(Recording { name: "inner", log: Arc::clone(&log), reject: false }));

        call(&host, "fail", &CallArgs::new()).expect("response expected");
        assert_eq!(
            *log.lock().expect("lock"),
            vec!["before outer", "before inner", "after inner", "after outer"]
        );
    }

    #[test]
    fn rejecting_filter_skips_servant_and_later_filters() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let host = host()
            .with_filter(Arc::new(Recording { name: "gate", log: Arc::clone(&log), reject: true }))
            .with_filter(Arc::new(Recording { name: "never", log: Arc::clone(&log), reject: false }));

        let response = call(&host, "add", &CallArgs::new().with_input("a", 1).with_input("b", 1))
            .expect("response expected");
        assert_eq!(response.result, ResultCode::InvalidSet);
        assert_eq!(*log.lock().expect("lock"), vec!["before gate", "after gate"]);
    }

    #[test]
    fn one_way_gets_no_package() {
        let host = host();
        let codec = TarsCodec::new();
        let mut packet = RequestPacket::new("Test.CalcObj", "fail");
        packet.packet_type = PacketType::OneWay;
        let wire = codec.encode_request(&packet).expect("request should encode");
        assert!(host.process(&codec, codec.parse_request(&wire[HEADER_SIZE..])).is_none());
    }
}
