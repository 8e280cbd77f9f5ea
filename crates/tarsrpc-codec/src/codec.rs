use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tracing::debug;

use crate::body;
use crate::descriptor::{MethodDescriptor, MethodLookup, MethodRegistry};
use crate::envelope::{
    CallArgs, CallReply, PacketType, ProtocolVersion, RequestPacket, ResponsePacket, ResultCode,
    ServantRequest, STATUS_RESULT_CODE, STATUS_RESULT_DESC,
};
use crate::error::Result;
use crate::frame::{begin_frame, decode_frame, finish_frame, MAX_PACKAGE_SIZE};
use crate::input::TarsInput;
use crate::output::TarsOutput;
use crate::value::Value;

/// Envelope codec selected per service interface.
///
/// Packages produced by the `encode_*` methods carry their length header;
/// `parse_*` take a single envelope without it. The `decode_*` methods
/// combine framing and parsing over an accumulation buffer and return
/// `Ok(None)` until a whole package is buffered.
pub trait Codec: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn max_package_size(&self) -> usize {
        MAX_PACKAGE_SIZE
    }

    fn encode_request(&self, request: &RequestPacket) -> Result<Bytes>;

    /// Parse a request envelope. Never fails: a header that cannot be read
    /// yields a request whose result is `ServerDecodeError`.
    fn parse_request(&self, frame: &[u8]) -> ServantRequest;

    fn decode_request(&self, src: &mut BytesMut) -> Result<Option<ServantRequest>> {
        Ok(decode_frame(src, self.max_package_size())?.map(|frame| self.parse_request(&frame)))
    }

    /// Encode a response; `None` for one-way requests, which get no reply.
    fn encode_response(&self, response: &ResponsePacket) -> Result<Option<Bytes>>;

    /// Parse a response envelope.
    ///
    /// Fails only when the request id cannot be read. Any later field
    /// failure yields a response with result `ClientDecodeError`.
    fn parse_response(&self, frame: &[u8]) -> Result<ResponsePacket>;

    fn decode_response(&self, src: &mut BytesMut) -> Result<Option<ResponsePacket>> {
        match decode_frame(src, self.max_package_size())? {
            Some(frame) => self.parse_response(&frame).map(Some),
            None => Ok(None),
        }
    }

    /// Route `request` through `registry` and decode its arguments.
    ///
    /// Failures downgrade `request.result` in place; the header stays usable.
    fn decode_request_body(&self, request: &mut ServantRequest, registry: &dyn MethodRegistry) {
        if !request.result.is_success() {
            return;
        }

        let method = if request.packet.packet_type == PacketType::Control {
            Arc::new(MethodDescriptor::ping())
        } else {
            match registry.lookup(&request.packet.servant, &request.packet.method) {
                MethodLookup::Found(method) => method,
                MethodLookup::NoSuchServant => {
                    let servant = request.packet.servant.clone();
                    request.fail(ResultCode::NoSuchServant, format!("no servant '{servant}'"));
                    return;
                }
                MethodLookup::NoSuchMethod => {
                    let method = request.packet.method.clone();
                    request.fail(ResultCode::NoSuchMethod, format!("no method '{method}'"));
                    return;
                }
            }
        };

        match body::decode_request_body(request.packet.version, &method, &request.packet.body) {
            Ok(args) => request.args = args,
            Err(err) => {
                debug!(
                    request_id = request.packet.request_id,
                    method = %request.packet.method,
                    error = %err,
                    "request body decode failed"
                );
                request.fail(ResultCode::ServerDecodeError, err.to_string());
            }
        }
        request.method = Some(method);
    }

    fn encode_request_body(
        &self,
        version: ProtocolVersion,
        method: &MethodDescriptor,
        args: &CallArgs,
    ) -> Result<Bytes> {
        body::encode_request_body(version, method, args)
    }

    fn encode_response_body(
        &self,
        version: ProtocolVersion,
        method: &MethodDescriptor,
        ret: Option<&Value>,
        args: &CallArgs,
    ) -> Result<Bytes> {
        body::encode_response_body(version, method, ret, &args.outputs)
    }

    fn decode_response_body(
        &self,
        version: ProtocolVersion,
        method: &MethodDescriptor,
        body: &[u8],
    ) -> Result<CallReply> {
        body::decode_response_body(version, method, body)
    }
}

/// The default binary codec: versions 1, 2 and 3 of the tagged envelope.
#[derive(Debug, Clone)]
pub struct TarsCodec {
    max_package_size: usize,
}

impl TarsCodec {
    pub fn new() -> Self {
        Self {
            max_package_size: MAX_PACKAGE_SIZE,
        }
    }

    pub fn with_max_package_size(mut self, max_package_size: usize) -> Self {
        self.max_package_size = max_package_size;
        self
    }

    fn finish(&self, out: TarsOutput, start: usize) -> Result<Bytes> {
        let mut buf = out.into_inner();
        finish_frame(&mut buf, start, self.max_package_size)?;
        Ok(buf.freeze())
    }
}

impl Default for TarsCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn write_request_layout(out: &mut TarsOutput, packet: &RequestPacket) {
    out.write_i16(packet.version.as_i16(), 1);
    out.write_i8(packet.packet_type.as_i8(), 2);
    out.write_i32(packet.message_type, 3);
    out.write_i32(packet.request_id, 4);
    out.write_str(&packet.servant, 5);
    out.write_str(&packet.method, 6);
    out.write_bytes(&packet.body, 7);
    out.write_i32(packet.timeout_ms, 8);
    out.write_string_map(&packet.context, 9);
    out.write_string_map(&packet.status, 10);
}

fn read_request_layout(input: &mut TarsInput<'_>, packet: &mut RequestPacket) -> Result<()> {
    // An unsupported version is reported only after the request id is
    // read, so the failure reply can still be correlated.
    let version = ProtocolVersion::from_i16(input.read_i16(1, true)?);
    if let Ok(version) = version {
        packet.version = version;
    }
    packet.request_id = input.read_i32(4, true)?;
    version?;
    packet.packet_type = PacketType::from_i8(input.read_i8(2, false)?);
    packet.message_type = input.read_i32(3, false)?;
    packet.servant = input.read_string(5, true)?;
    packet.method = input.read_string(6, true)?;
    packet.body = input.read_bytes(7, false)?;
    packet.timeout_ms = input.read_i32(8, false)?;
    packet.context = input.read_string_map(9, false)?;
    packet.status = input.read_string_map(10, false)?;
    Ok(())
}

fn read_binary_response(input: &mut TarsInput<'_>, response: &mut ResponsePacket) -> Result<()> {
    response.packet_type = PacketType::from_i8(input.read_i8(2, false)?);
    response.message_type = input.read_i32(4, false)?;
    response.result = ResultCode::from_code(input.read_i32(5, true)?);
    response.body = input.read_bytes(6, false)?;
    response.status = input.read_string_map(7, false)?;
    response.description = input.read_string(8, false)?;
    Ok(())
}

fn read_attribute_response(
    input: &mut TarsInput<'_>,
    response: &mut ResponsePacket,
) -> Result<()> {
    let mut packet = RequestPacket::default();
    read_request_layout(input, &mut packet)?;

    response.packet_type = packet.packet_type;
    response.message_type = packet.message_type;
    response.servant = packet.servant;
    response.method = packet.method;
    response.body = packet.body;
    response.status = packet.status;

    if let Some(code) = response.status.remove(STATUS_RESULT_CODE) {
        let code = code.trim().parse::<i32>().map_err(|_| {
            crate::error::CodecError::ArgumentMismatch(format!(
                "{STATUS_RESULT_CODE} is not an integer: '{code}'"
            ))
        })?;
        response.result = ResultCode::from_code(code);
    }
    response.description = response.status.remove(STATUS_RESULT_DESC).unwrap_or_default();
    Ok(())
}

impl Codec for TarsCodec {
    fn name(&self) -> &str {
        "tars"
    }

    fn max_package_size(&self) -> usize {
        self.max_package_size
    }

    fn encode_request(&self, request: &RequestPacket) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(64 + request.body.len());
        let start = begin_frame(&mut buf);
        let mut out = TarsOutput::with_buffer(buf);
        write_request_layout(&mut out, request);
        self.finish(out, start)
    }

    fn parse_request(&self, frame: &[u8]) -> ServantRequest {
        let mut input = TarsInput::new(frame);
        let mut packet = RequestPacket::default();
        match read_request_layout(&mut input, &mut packet) {
            Ok(()) => ServantRequest::new(packet),
            Err(err) => {
                debug!(
                    request_id = packet.request_id,
                    error = %err,
                    "request header decode failed"
                );
                let mut request = ServantRequest::new(packet);
                request.fail(ResultCode::ServerDecodeError, err.to_string());
                request
            }
        }
    }

    fn encode_response(&self, response: &ResponsePacket) -> Result<Option<Bytes>> {
        if response.packet_type == PacketType::OneWay {
            return Ok(None);
        }

        let mut buf = BytesMut::with_capacity(64 + response.body.len());
        let start = begin_frame(&mut buf);
        let mut out = TarsOutput::with_buffer(buf);

        match response.version {
            ProtocolVersion::Binary => {
                out.write_i16(response.version.as_i16(), 1);
                out.write_i8(response.packet_type.as_i8(), 2);
                out.write_i32(response.request_id, 3);
                out.write_i32(response.message_type, 4);
                out.write_i32(response.result.code(), 5);
                out.write_bytes(&response.body, 6);
                if !response.status.is_empty() {
                    out.write_string_map(&response.status, 7);
                }
                if !response.result.is_success() {
                    out.write_str(&response.description, 8);
                }
            }
            ProtocolVersion::Attribute | ProtocolVersion::CompactAttribute => {
                let mut status = response.status.clone();
                status.insert(
                    STATUS_RESULT_CODE.to_string(),
                    response.result.code().to_string(),
                );
                if !response.description.is_empty() {
                    status.insert(STATUS_RESULT_DESC.to_string(), response.description.clone());
                }
                let packet = RequestPacket {
                    version: response.version,
                    packet_type: response.packet_type,
                    message_type: response.message_type,
                    request_id: response.request_id,
                    servant: response.servant.clone(),
                    method: response.method.clone(),
                    body: response.body.clone(),
                    timeout_ms: 0,
                    context: Default::default(),
                    status,
                };
                write_request_layout(&mut out, &packet);
            }
        }

        self.finish(out, start).map(Some)
    }

    fn parse_response(&self, frame: &[u8]) -> Result<ResponsePacket> {
        let mut input = TarsInput::new(frame);
        let version = ProtocolVersion::from_i16(input.read_i16(1, true)?)?;
        let id_tag = if version.uses_attributes() { 4 } else { 3 };
        let request_id = input.read_i32(id_tag, true)?;

        let mut response = ResponsePacket {
            version,
            request_id,
            ..ResponsePacket::default()
        };
        let rest = if version.uses_attributes() {
            read_attribute_response(&mut input, &mut response)
        } else {
            read_binary_response(&mut input, &mut response)
        };
        if let Err(err) = rest {
            debug!(request_id, error = %err, "response decode failed");
            response.result = ResultCode::ClientDecodeError;
            response.description = err.to_string();
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{InterfaceDescriptor, MethodTable};
    use crate::error::CodecError;
    use crate::frame::HEADER_SIZE;
    use crate::stamp::Stamp;

    fn echo() -> MethodDescriptor {
        MethodDescriptor::new("echo")
            .input("msg", Stamp::String)
            .returns(Stamp::String)
    }

    fn registry() -> MethodTable {
        MethodTable::new().with(
            "Demo.EchoServer.EchoObj",
            Arc::new(InterfaceDescriptor::new("Demo.Echo").method(echo())),
        )
    }

    fn request(version: ProtocolVersion) -> RequestPacket {
        let codec = TarsCodec::new();
        let mut packet = RequestPacket::new("Demo.EchoServer.EchoObj", "echo");
        packet.version = version;
        packet.request_id = 7;
        packet.timeout_ms = 3000;
        packet.context.insert("trace".into(), "abc".into());
        packet.body = codec
            .encode_request_body(version, &echo(), &CallArgs::new().with_input("msg", "hi"))
            .unwrap();
        packet
    }

    #[test]
    fn request_envelope_roundtrip() {
        let codec = TarsCodec::new();
        for version in [
            ProtocolVersion::Binary,
            ProtocolVersion::Attribute,
            ProtocolVersion::CompactAttribute,
        ] {
            let packet = request(version);
            let mut wire = BytesMut::from(codec.encode_request(&packet).unwrap().as_ref());
            let mut decoded = codec.decode_request(&mut wire).unwrap().unwrap();
            assert_eq!(decoded.packet, packet);

            codec.decode_request_body(&mut decoded, &registry());
            assert!(decoded.is_routable());
            assert_eq!(decoded.args.input("msg"), Some(&Value::from("hi")));
        }
    }

    #[test]
    fn binary_response_layout() {
        let codec = TarsCodec::new();
        let packet = request(ProtocolVersion::Binary);
        let response = ResponsePacket::for_request(&packet);
        let wire = codec.encode_response(&response).unwrap().unwrap();
        // version 1 at tag 1, packet type 0 at tag 2, request id 7 at tag 3.
        assert_eq!(&wire[HEADER_SIZE..HEADER_SIZE + 5], &[0x10, 0x01, 0x2C, 0x30, 0x07]);
    }

    #[test]
    fn response_roundtrip_carries_result_and_description() {
        let codec = TarsCodec::new();
        for version in [
            ProtocolVersion::Binary,
            ProtocolVersion::Attribute,
            ProtocolVersion::CompactAttribute,
        ] {
            let packet = request(version);
            let mut response = ResponsePacket::for_request(&packet)
                .with_result(ResultCode::Other(17), "servant said no");
            response.status.insert("hint".into(), "retry".into());

            let mut wire = BytesMut::from(codec.encode_response(&response).unwrap().unwrap().as_ref());
            let decoded = codec.decode_response(&mut wire).unwrap().unwrap();
            assert_eq!(decoded.request_id, 7);
            assert_eq!(decoded.result, ResultCode::Other(17));
            assert_eq!(decoded.description, "servant said no");
            assert_eq!(decoded.status.get("hint").map(String::as_str), Some("retry"));
            assert!(!decoded.status.contains_key(STATUS_RESULT_CODE));
        }
    }

    #[test]
    fn oneway_requests_get_no_response() {
        let mut packet = request(ProtocolVersion::Binary);
        packet.packet_type = PacketType::OneWay;
        let response = ResponsePacket::for_request(&packet);
        assert!(TarsCodec::new().encode_response(&response).unwrap().is_none());
    }

    #[test]
    fn unroutable_request_is_kept_with_code() {
        let codec = TarsCodec::new();
        let mut packet = request(ProtocolVersion::Binary);
        packet.servant = "Demo.Nobody.Obj".into();
        let wire = codec.encode_request(&packet).unwrap();
        let mut decoded = codec.parse_request(&wire[HEADER_SIZE..]);
        codec.decode_request_body(&mut decoded, &registry());
        assert_eq!(decoded.result, ResultCode::NoSuchServant);
        assert_eq!(decoded.packet.request_id, 7);

        let mut packet = request(ProtocolVersion::Binary);
        packet.method = "shout".into();
        let wire = codec.encode_request(&packet).unwrap();
        let mut decoded = codec.parse_request(&wire[HEADER_SIZE..]);
        codec.decode_request_body(&mut decoded, &registry());
        assert_eq!(decoded.result, ResultCode::NoSuchMethod);
    }

    #[test]
    fn bad_body_downgrades_result_but_keeps_header() {
        let codec = TarsCodec::new();
        let mut packet = request(ProtocolVersion::Binary);
        packet.body = Bytes::from_static(&[0x16, 9, b'x']);
        let wire = codec.encode_request(&packet).unwrap();
        let mut decoded = codec.parse_request(&wire[HEADER_SIZE..]);
        codec.decode_request_body(&mut decoded, &registry());
        assert_eq!(decoded.result, ResultCode::ServerDecodeError);
        assert_eq!(decoded.packet.method, "echo");
        assert_eq!(decoded.packet.request_id, 7);
    }

    #[test]
    fn control_packet_skips_lookup() {
        let codec = TarsCodec::new();
        let mut packet = request(ProtocolVersion::Binary);
        packet.servant = "Demo.Nobody.Obj".into();
        packet.packet_type = PacketType::Control;
        let mut decoded = ServantRequest::new(packet);
        codec.decode_request_body(&mut decoded, &registry());
        assert!(decoded.is_routable());
        assert!(decoded.method.unwrap().is_ping());
    }

    #[test]
    fn truncated_request_header_fails_soft() {
        let codec = TarsCodec::new();
        // Version 1 and packet type, then nothing.
        let decoded = codec.parse_request(&[0x10, 0x01, 0x2C]);
        assert_eq!(decoded.result, ResultCode::ServerDecodeError);
        assert_eq!(decoded.packet.version, ProtocolVersion::Binary);
    }

    #[test]
    fn unsupported_request_version_keeps_request_id() {
        let codec = TarsCodec::new();
        // version 9, request id 42.
        let decoded = codec.parse_request(&[0x10, 0x09, 0x40, 42]);
        assert_eq!(decoded.result, ResultCode::ServerDecodeError);
        assert_eq!(decoded.packet.request_id, 42);
    }

    #[test]
    fn deeply_nested_request_fails_soft() {
        let codec = TarsCodec::new();
        let frame = vec![0x0Au8; 200_000];
        let handle = std::thread::Builder::new()
            .stack_size(256 * 1024)
            .spawn(move || codec.parse_request(&frame).result)
            .unwrap();
        assert_eq!(handle.join().unwrap(), ResultCode::ServerDecodeError);
    }

    #[test]
    fn deeply_nested_response_is_an_error() {
        let codec = TarsCodec::new();
        let frame = vec![0x0Au8; 200_000];
        assert!(matches!(
            codec.parse_response(&frame),
            Err(CodecError::TooDeep(_))
        ));
    }

    #[test]
    fn response_without_request_id_is_an_error() {
        let codec = TarsCodec::new();
        assert!(matches!(
            codec.parse_response(&[0x10, 0x01]),
            Err(CodecError::MissingField(3))
        ));
        assert!(matches!(
            codec.parse_response(&[0x10, 0x09]),
            Err(CodecError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn damaged_response_body_fields_become_client_decode_error() {
        let codec = TarsCodec::new();
        // version 1, request id 7, result code field has a string wire type.
        let frame = [0x10, 0x01, 0x30, 0x07, 0x56, 0x01, b'x'];
        let response = codec.parse_response(&frame).unwrap();
        assert_eq!(response.request_id, 7);
        assert_eq!(response.result, ResultCode::ClientDecodeError);
    }

    #[test]
    fn attribute_response_with_bad_result_code() {
        let codec = TarsCodec::new();
        let packet = request(ProtocolVersion::Attribute);
        let mut response = ResponsePacket::for_request(&packet);
        response.status.insert(STATUS_RESULT_CODE.into(), "x".into());
        // Same layout as a request, so build the envelope by hand.
        let raw = RequestPacket {
            version: response.version,
            request_id: response.request_id,
            servant: response.servant.clone(),
            status: response.status.clone(),
            ..RequestPacket::default()
        };
        let wire = codec.encode_request(&raw).unwrap();
        let decoded = codec.parse_response(&wire[HEADER_SIZE..]).unwrap();
        assert_eq!(decoded.result, ResultCode::ClientDecodeError);
    }
}
