//! Servant hosted by `tarsrpc serve` and targeted by `tarsrpc call`.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tarsrpc_codec::{CallArgs, InterfaceDescriptor, MethodDescriptor, Stamp, Value};
use tarsrpc_peer::{CallContext, Servant, ServantError};
use tracing::debug;

pub const OBJECT_NAME: &str = "Demo.EchoServer.EchoObj";

/// Upper bound on `sleep` so a stray call cannot pin a worker.
const MAX_SLEEP_MS: i64 = 60_000;

pub fn interface() -> Arc<InterfaceDescriptor> {
    Arc::new(
        InterfaceDescriptor::new("Demo.Echo")
            .method(
                MethodDescriptor::new("echo")
                    .input("msg", Stamp::String)
                    .returns(Stamp::String),
            )
            .method(
                MethodDescriptor::new("add")
                    .input("a", Stamp::Int)
                    .input("b", Stamp::Int)
                    .output("sum", Stamp::Int)
                    .returns(Stamp::Int),
            )
            .method(
                MethodDescriptor::new("sleep")
                    .input("ms", Stamp::Int)
                    .returns(Stamp::Int),
            ),
    )
}

#[derive(Debug, Default)]
pub struct DemoServant;

impl Servant for DemoServant {
    fn interface(&self) -> Arc<InterfaceDescriptor> {
        interface()
    }

    fn invoke(
        &self,
        method: &MethodDescriptor,
        args: &mut CallArgs,
        ctx: &CallContext,
    ) -> Result<Option<Value>, ServantError> {
        debug!(request_id = ctx.request_id, method = %method.name, "demo call");
        match method.name.as_str() {
            "echo" => {
                let msg = args
                    .input("msg")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ServantError::failed("msg must be a string"))?;
                Ok(Some(Value::from(msg)))
            }
            "add" => {
                let a = int_arg(args, "a")?;
                let b = int_arg(args, "b")?;
                // Return code 0; the sum travels as the out-parameter.
                args.set_output("sum", a.wrapping_add(b));
                Ok(Some(Value::Int(0)))
            }
            "sleep" => {
                let ms = i64::from(int_arg(args, "ms")?).clamp(0, MAX_SLEEP_MS);
                thread::sleep(Duration::from_millis(ms as u64));
                Ok(Some(Value::Int(ms as i32)))
            }
            other => Err(ServantError::failed(format!("unhandled method {other}"))),
        }
    }
}

fn int_arg(args: &CallArgs, name: &str) -> Result<i32, ServantError> {
    args.input(name)
        .and_then(Value::as_i64)
        .and_then(|v| i32::try_from(v).ok())
        .ok_or_else(|| ServantError::failed(format!("{name} must be an int")))
}

/// Parse command-line text into the value `stamp` expects.
pub fn parse_arg(text: &str, stamp: &Stamp) -> Result<Value, String> {
    let invalid = |kind: &str| format!("'{text}' is not a valid {kind}");
    Ok(match stamp {
        Stamp::Bool => Value::Bool(text.parse().map_err(|_| invalid("bool"))?),
        Stamp::Byte => Value::Byte(text.parse().map_err(|_| invalid("byte"))?),
        Stamp::Short => Value::Short(text.parse().map_err(|_| invalid("short"))?),
        Stamp::Int => Value::Int(text.parse().map_err(|_| invalid("int"))?),
        Stamp::Long => Value::Long(text.parse().map_err(|_| invalid("long"))?),
        Stamp::Float => Value::Float(text.parse().map_err(|_| invalid("float"))?),
        Stamp::Double => Value::Double(text.parse().map_err(|_| invalid("double"))?),
        Stamp::String => Value::from(text),
        Stamp::Bytes => Value::from(text.as_bytes().to_vec()),
        other => return Err(format!("{other:?} arguments are not supported from the command line")),
    })
}
