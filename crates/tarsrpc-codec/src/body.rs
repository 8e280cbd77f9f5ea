//! Method bodies: the encoded arguments and results inside an envelope.
//!
//! Version 1 writes each wire parameter at its ordinal tag and the return
//! value at tag 0. Versions 2 and 3 put them into an [`AttributeBag`] by
//! name, with the return value under the empty name. The liveness method
//! always has an empty body.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::attribute::AttributeBag;
use crate::descriptor::{MethodDescriptor, MAX_WIRE_PARAMS};
use crate::envelope::{CallArgs, CallReply, ProtocolVersion};
use crate::error::{CodecError, Result};
use crate::input::TarsInput;
use crate::output::TarsOutput;
use crate::stamp::Stamp;
use crate::value::Value;

/// Attribute name of the return value in versions 2 and 3.
pub const RETURN_ATTRIBUTE: &str = "";

fn new_bag(version: ProtocolVersion) -> AttributeBag {
    match version {
        ProtocolVersion::CompactAttribute => AttributeBag::compact(),
        _ => AttributeBag::new(),
    }
}

fn decode_bag(version: ProtocolVersion, body: &[u8]) -> Result<AttributeBag> {
    AttributeBag::decode(body, version == ProtocolVersion::CompactAttribute)
}

fn checked<'v>(name: &str, stamp: &Stamp, value: &'v Value) -> Result<&'v Value> {
    if value.conforms_to(stamp) {
        Ok(value)
    } else {
        Err(CodecError::ArgumentMismatch(format!(
            "'{name}' expects {stamp}, got {}",
            value.kind()
        )))
    }
}

fn check_tags(version: ProtocolVersion, method: &MethodDescriptor) -> Result<()> {
    if !version.uses_attributes() && method.tags_overflow() {
        return Err(CodecError::ArgumentMismatch(format!(
            "'{}' has more than {MAX_WIRE_PARAMS} wire parameters",
            method.name
        )));
    }
    Ok(())
}

/// Encode the arguments of an outgoing call.
///
/// Every input must be present. Outputs are written only when the caller
/// supplied an initial value.
pub fn encode_request_body(
    version: ProtocolVersion,
    method: &MethodDescriptor,
    args: &CallArgs,
) -> Result<Bytes> {
    if method.is_ping() {
        return Ok(Bytes::new());
    }
    check_tags(version, method)?;

    let mut out = TarsOutput::new();
    let mut bag = new_bag(version);
    for (param, stamp) in method.wire_params() {
        let value = if param.is_out() {
            match args.output(&param.name) {
                Some(value) => value,
                None => continue,
            }
        } else {
            args.input(&param.name).ok_or_else(|| {
                CodecError::ArgumentMismatch(format!("missing input '{}'", param.name))
            })?
        };
        let value = checked(&param.name, stamp, value)?;
        if version.uses_attributes() {
            bag.put(param.name.as_str(), stamp, value);
        } else {
            out.write_value(value, param.tag);
        }
    }

    Ok(if version.uses_attributes() {
        bag.encode()
    } else {
        out.into_bytes()
    })
}

/// Decode the arguments of an inbound call.
///
/// Absent outputs get their stamp default so the servant always has a slot
/// to write.
pub fn decode_request_body(
    version: ProtocolVersion,
    method: &MethodDescriptor,
    body: &[u8],
) -> Result<CallArgs> {
    let mut args = CallArgs::default();
    if method.is_ping() {
        return Ok(args);
    }
    check_tags(version, method)?;

    if version.uses_attributes() {
        let bag = decode_bag(version, body)?;
        for (param, stamp) in method.wire_params() {
            if param.is_out() {
                let value = bag
                    .get(&param.name, stamp)?
                    .unwrap_or_else(|| stamp.default_value());
                args.outputs.insert(param.name.clone(), value);
            } else {
                args.inputs
                    .insert(param.name.clone(), bag.require(&param.name, stamp)?);
            }
        }
    } else {
        let mut input = TarsInput::new(body);
        for (param, stamp) in method.wire_params() {
            let value = input.read(param.tag, stamp, !param.is_out())?;
            if param.is_out() {
                args.outputs.insert(param.name.clone(), value);
            } else {
                args.inputs.insert(param.name.clone(), value);
            }
        }
    }
    Ok(args)
}

/// Encode the result of a completed call: return value, then outputs.
pub fn encode_response_body(
    version: ProtocolVersion,
    method: &MethodDescriptor,
    ret: Option<&Value>,
    outputs: &BTreeMap<String, Value>,
) -> Result<Bytes> {
    if method.is_ping() {
        return Ok(Bytes::new());
    }
    check_tags(version, method)?;

    let mut out = TarsOutput::new();
    let mut bag = new_bag(version);

    if let Some(ret_desc) = &method.ret {
        let value = ret.ok_or_else(|| {
            CodecError::ArgumentMismatch(format!("'{}' returned no value", method.name))
        })?;
        let value = checked("return value", &ret_desc.stamp, value)?;
        if version.uses_attributes() {
            bag.put(RETURN_ATTRIBUTE, &ret_desc.stamp, value);
        } else {
            out.write_value(value, ret_desc.tag);
        }
    }

    for (param, stamp) in method.outputs() {
        let default = stamp.default_value();
        let value = checked(
            &param.name,
            stamp,
            outputs.get(&param.name).unwrap_or(&default),
        )?;
        if version.uses_attributes() {
            bag.put(param.name.as_str(), stamp, value);
        } else {
            out.write_value(value, param.tag);
        }
    }

    Ok(if version.uses_attributes() {
        bag.encode()
    } else {
        out.into_bytes()
    })
}

/// Decode the result of a call. A declared return value is required.
pub fn decode_response_body(
    version: ProtocolVersion,
    method: &MethodDescriptor,
    body: &[u8],
) -> Result<CallReply> {
    let mut reply = CallReply::default();
    if method.is_ping() {
        return Ok(reply);
    }
    check_tags(version, method)?;

    if version.uses_attributes() {
        let bag = decode_bag(version, body)?;
        if let Some(ret_desc) = &method.ret {
            reply.ret = Some(bag.require(RETURN_ATTRIBUTE, &ret_desc.stamp)?);
        }
        for (param, stamp) in method.outputs() {
            let value = bag
                .get(&param.name, stamp)?
                .unwrap_or_else(|| stamp.default_value());
            reply.outputs.insert(param.name.clone(), value);
        }
    } else {
        let mut input = TarsInput::new(body);
        if let Some(ret_desc) = &method.ret {
            reply.ret = Some(input.read(ret_desc.tag, &ret_desc.stamp, true)?);
        }
        for (param, stamp) in method.outputs() {
            reply
                .outputs
                .insert(param.name.clone(), input.read(param.tag, stamp, false)?);
        }
    }
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_VERSIONS: [ProtocolVersion; 3] = [
        ProtocolVersion::Binary,
        ProtocolVersion::Attribute,
        ProtocolVersion::CompactAttribute,
    ];

    fn add() -> MethodDescriptor {
        MethodDescriptor::new("add")
            .input("a", Stamp::Long)
            .context("ctx")
            .input("b", Stamp::Long)
            .output("sum", Stamp::Long)
            .returns(Stamp::Int)
    }

    #[test]
    fn too_many_params_only_fail_tagged_bodies() {
        let mut method = MethodDescriptor::new("wide");
        let mut args = CallArgs::new();
        for i in 0..=MAX_WIRE_PARAMS {
            method = method.input(format!("p{i}"), Stamp::Int);
            args = args.with_input(format!("p{i}"), i as i32);
        }

        assert!(matches!(
            encode_request_body(ProtocolVersion::Binary, &method, &args),
            Err(CodecError::ArgumentMismatch(_))
        ));
        assert!(matches!(
            decode_request_body(ProtocolVersion::Binary, &method, &[]),
            Err(CodecError::ArgumentMismatch(_))
        ));
        let body = encode_request_body(ProtocolVersion::Attribute, &method, &args).unwrap();
        let decoded = decode_request_body(ProtocolVersion::Attribute, &method, &body).unwrap();
        assert_eq!(decoded.inputs.len(), MAX_WIRE_PARAMS + 1);
    }

    #[test]
    fn request_body_roundtrip_every_version() {
        let method = add();
        let args = CallArgs::new()
            .with_input("a", 40i64)
            .with_input("b", 2i64);

        for version in ALL_VERSIONS {
            let body = encode_request_body(version, &method, &args).unwrap();
            let decoded = decode_request_body(version, &method, &body).unwrap();
            assert_eq!(decoded.inputs, args.inputs, "version {version}");
            assert_eq!(decoded.output("sum"), Some(&Value::Long(0)));
        }
    }

    #[test]
    fn inout_initial_value_is_sent() {
        let method = add();
        let args = CallArgs::new()
            .with_input("a", 1i64)
            .with_input("b", 2i64)
            .with_output("sum", 99i64);

        for version in ALL_VERSIONS {
            let body = encode_request_body(version, &method, &args).unwrap();
            let decoded = decode_request_body(version, &method, &body).unwrap();
            assert_eq!(decoded.output("sum"), Some(&Value::Long(99)));
        }
    }

    #[test]
    fn response_body_roundtrip_every_version() {
        let method = add();
        let outputs = BTreeMap::from([("sum".to_string(), Value::Long(42))]);

        for version in ALL_VERSIONS {
            let body =
                encode_response_body(version, &method, Some(&Value::Int(0)), &outputs).unwrap();
            let reply = decode_response_body(version, &method, &body).unwrap();
            assert_eq!(reply.ret, Some(Value::Int(0)));
            assert_eq!(reply.output("sum"), Some(&Value::Long(42)));
        }
    }

    #[test]
    fn missing_input_is_rejected_before_encoding() {
        let method = add();
        let args = CallArgs::new().with_input("a", 1i64);
        let err = encode_request_body(ProtocolVersion::Binary, &method, &args).unwrap_err();
        assert!(matches!(err, CodecError::ArgumentMismatch(msg) if msg.contains("'b'")));
    }

    #[test]
    fn wrong_argument_type_is_rejected() {
        let method = add();
        let args = CallArgs::new()
            .with_input("a", "forty")
            .with_input("b", 2i64);
        assert!(matches!(
            encode_request_body(ProtocolVersion::Attribute, &method, &args),
            Err(CodecError::ArgumentMismatch(_))
        ));
    }

    #[test]
    fn missing_return_value_fails_decode() {
        let method = add();
        for version in ALL_VERSIONS {
            assert!(decode_response_body(version, &method, &[]).is_err());
        }
    }

    #[test]
    fn ping_body_is_always_empty() {
        let ping = MethodDescriptor::ping();
        for version in ALL_VERSIONS {
            let body = encode_request_body(version, &ping, &CallArgs::new()).unwrap();
            assert!(body.is_empty());
            let reply = decode_response_body(version, &ping, b"garbage").unwrap();
            assert!(reply.ret.is_none());
        }
    }

    #[test]
    fn positional_body_uses_ordinal_tags() {
        let method = MethodDescriptor::new("echo")
            .input("msg", Stamp::String)
            .returns(Stamp::String);
        let body = encode_request_body(
            ProtocolVersion::Binary,
            &method,
            &CallArgs::new().with_input("msg", "hi"),
        )
        .unwrap();
        assert_eq!(body.as_ref(), &[0x16, 2, b'h', b'i']);
    }
}
