use std::sync::Arc;
use std::time::Duration;

use tarsrpc_codec::{
    CallArgs, InterfaceDescriptor, MethodDescriptor, ProtocolVersion, Stamp, Value,
};
use tarsrpc_peer::{
    CallContext, CallOptions, Communicator, CommunicatorConfig, ProxyOptions, RpcError,
    RpcServer, Servant, ServantError, ServantHost,
};

const OBJ: &str = "Test.KvServer.KvObj";

fn kv_interface() -> Arc<InterfaceDescriptor> {
    Arc::new(
        InterfaceDescriptor::new("Test.Kv")
            .method(
                MethodDescriptor::new("concat")
                    .input("parts", Stamp::list(Stamp::String))
                    .output("count", Stamp::Int)
                    .returns(Stamp::String),
            )
            .method(
                MethodDescriptor::new("stall")
                    .input("ms", Stamp::Long)
                    .returns(Stamp::Long),
            ),
    )
}

struct Kv;

impl Servant for Kv {
    fn interface(&self) -> Arc<InterfaceDescriptor> {
        kv_interface()
    }

    fn invoke(
        &self,
        method: &MethodDescriptor,
        args: &mut CallArgs,
        _ctx: &CallContext,
    ) -> Result<Option<Value>, ServantError> {
        match method.name.as_str() {
            "concat" => {
                let Some(Value::List(parts)) = args.input("parts") else {
                    return Err(ServantError::failed("parts missing"));
                };
                let joined: String = parts.iter().filter_map(Value::as_str).collect();
                let count = parts.len() as i32;
                args.set_output("count", count);
                Ok(Some(Value::from(joined)))
            }
            "stall" => {
                let ms = args.input("ms").and_then(Value::as_i64).unwrap_or(0);
                std::thread::sleep(Duration::from_millis(ms as u64));
                Ok(Some(Value::Long(ms)))
            }
            _ => Ok(None),
        }
    }
}

fn parts(items: &[&str]) -> Value {
    Value::List(items.iter().map(|s| Value::from(*s)).collect())
}

#[test]
fn tcp_calls_round_trip_in_every_version() {
    let host = Arc::new(ServantHost::new().with_servant(OBJ, Arc::new(Kv)));
    let mut server = RpcServer::bind("127.0.0.1:0", host)
        .expect("server should bind")
        .spawn()
        .expect("server should spawn");

    let communicator = Communicator::new(CommunicatorConfig::default())
        .expect("communicator should build");
    let name = format!("{OBJ}@{}", server.endpoint());

    for version in [
        ProtocolVersion::Binary,
        ProtocolVersion::Attribute,
        ProtocolVersion::CompactAttribute,
    ] {
        let proxy = communicator
            .proxy_with(
                &name,
                kv_interface(),
                ProxyOptions {
                    version,
                    ..ProxyOptions::default()
                },
            )
            .expect("proxy should resolve");
        assert_eq!(proxy.config().version, version);

        let reply = proxy
            .invoke(
                "concat",
                CallArgs::new().with_input("parts", parts(&["a", "b", "c"])),
            )
            .expect("call should succeed");
        assert_eq!(reply.ret, Some(Value::from("abc")), "version {version}");
        assert_eq!(reply.output("count"), Some(&Value::Int(3)), "version {version}");
    }

    let proxy = communicator
        .proxy(&name, kv_interface())
        .expect("proxy should resolve");
    proxy.ping().expect("ping should succeed");

    drop(communicator);
    server.shutdown().expect("server should stop");
}

#[test]
fn tcp_call_times_out_when_server_stalls() {
    let host = Arc::new(ServantHost::new().with_servant(OBJ, Arc::new(Kv)));
    let server = RpcServer::bind("127.0.0.1:0", host)
        .expect("server should bind")
        .spawn()
        .expect("server should spawn");

    let communicator = Communicator::new(CommunicatorConfig::default())
        .expect("communicator should build");
    let proxy = communicator
        .proxy(&format!("{OBJ}@{}", server.endpoint()), kv_interface())
        .expect("proxy should resolve");

    let err = proxy
        .invoke_with(
            "stall",
            CallArgs::new().with_input("ms", 300i64),
            &CallOptions::new().with_timeout(Duration::from_millis(50)),
        )
        .expect_err("call should time out");
    assert!(matches!(err, RpcError::Timeout(_)), "{err}");
    assert_eq!(communicator.correlator().pending(), 0);

    // The connection survives the late reply.
    let reply = proxy
        .invoke_with(
            "stall",
            CallArgs::new().with_input("ms", 1i64),
            &CallOptions::new().with_timeout(Duration::from_secs(3)),
        )
        .expect("next call should succeed");
    assert_eq!(reply.ret, Some(Value::Long(1)));
}

#[test]
fn refused_connection_is_a_transport_error() {
    let communicator = Communicator::new(CommunicatorConfig::default())
        .expect("communicator should build");
    // Bind then drop to get a port nothing listens on.
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|l| l.local_addr())
        .expect("probe bind")
        .port();
    let proxy = communicator
        .proxy(&format!("{OBJ}@tcp -h 127.0.0.1 -p {port}"), kv_interface())
        .expect("proxy should resolve");

    let err = proxy
        .invoke(
            "concat",
            CallArgs::new().with_input("parts", parts(&["x"])),
        )
        .expect_err("connect should fail");
    assert!(matches!(err, RpcError::Transport(_)), "{err}");
}
