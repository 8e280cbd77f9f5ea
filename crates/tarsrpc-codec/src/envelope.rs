use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::descriptor::{MethodDescriptor, PING_METHOD};
use crate::error::{CodecError, Result};
use crate::value::Value;

/// Status-map key carrying the result code in version 2/3 responses.
pub const STATUS_RESULT_CODE: &str = "STATUS_RESULT_CODE";
/// Status-map key carrying the result description in version 2/3 responses.
pub const STATUS_RESULT_DESC: &str = "STATUS_RESULT_DESC";

/// Envelope layout, selected per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProtocolVersion {
    /// Positional body, tagged by parameter ordinal.
    #[default]
    Binary,
    /// Name-keyed attribute bag with type names.
    Attribute,
    /// Name-keyed attribute bag without type names.
    CompactAttribute,
}

impl ProtocolVersion {
    pub fn as_i16(self) -> i16 {
        match self {
            Self::Binary => 1,
            Self::Attribute => 2,
            Self::CompactAttribute => 3,
        }
    }

    pub fn from_i16(raw: i16) -> Result<Self> {
        match raw {
            1 => Ok(Self::Binary),
            2 => Ok(Self::Attribute),
            3 => Ok(Self::CompactAttribute),
            other => Err(CodecError::UnsupportedVersion(i64::from(other))),
        }
    }

    pub fn uses_attributes(self) -> bool {
        self != Self::Binary
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_i16())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PacketType {
    #[default]
    Normal,
    /// No response is sent or expected.
    OneWay,
    /// Answered like a liveness probe, never routed to a servant.
    Control,
}

impl PacketType {
    pub fn as_i8(self) -> i8 {
        match self {
            Self::Normal => 0,
            Self::OneWay => 1,
            Self::Control => 2,
        }
    }

    /// Unknown packet types are treated as normal calls.
    pub fn from_i8(raw: i8) -> Self {
        match raw {
            1 => Self::OneWay,
            2 => Self::Control,
            _ => Self::Normal,
        }
    }
}

/// Result code carried in every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ResultCode {
    #[default]
    Success,
    ServerDecodeError,
    ServerEncodeError,
    NoSuchMethod,
    NoSuchServant,
    QueueTimeout,
    InvokeTimeout,
    ConnectError,
    Overload,
    InvalidSet,
    ClientDecodeError,
    Unknown,
    Other(i32),
}

impl ResultCode {
    pub fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::ServerDecodeError => -1,
            Self::ServerEncodeError => -2,
            Self::NoSuchMethod => -3,
            Self::NoSuchServant => -4,
            Self::QueueTimeout => -6,
            Self::InvokeTimeout => -7,
            Self::ConnectError => -8,
            Self::Overload => -9,
            Self::InvalidSet => -11,
            Self::ClientDecodeError => -12,
            Self::Unknown => -99,
            Self::Other(code) => code,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Success,
            -1 => Self::ServerDecodeError,
            -2 => Self::ServerEncodeError,
            -3 => Self::NoSuchMethod,
            -4 => Self::NoSuchServant,
            -6 => Self::QueueTimeout,
            -7 => Self::InvokeTimeout,
            -8 => Self::ConnectError,
            -9 => Self::Overload,
            -11 => Self::InvalidSet,
            -12 => Self::ClientDecodeError,
            -99 => Self::Unknown,
            other => Self::Other(other),
        }
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "success",
            Self::ServerDecodeError => "server decode error",
            Self::ServerEncodeError => "server encode error",
            Self::NoSuchMethod => "no such method",
            Self::NoSuchServant => "no such servant",
            Self::QueueTimeout => "queue timeout",
            Self::InvokeTimeout => "invoke timeout",
            Self::ConnectError => "connect error",
            Self::Overload => "server overload",
            Self::InvalidSet => "invalid set",
            Self::ClientDecodeError => "client decode error",
            Self::Unknown => "unknown error",
            Self::Other(_) => "servant error",
        };
        write!(f, "{name} ({})", self.code())
    }
}

/// Request envelope. The body is kept encoded until a descriptor is known.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RequestPacket {
    pub version: ProtocolVersion,
    pub packet_type: PacketType,
    pub message_type: i32,
    pub request_id: i32,
    pub servant: String,
    pub method: String,
    pub body: Bytes,
    /// Call deadline in milliseconds, as seen by the caller.
    pub timeout_ms: i32,
    pub context: BTreeMap<String, String>,
    pub status: BTreeMap<String, String>,
}

impl RequestPacket {
    pub fn new(servant: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            servant: servant.into(),
            method: method.into(),
            ..Self::default()
        }
    }

    pub fn is_oneway(&self) -> bool {
        self.packet_type == PacketType::OneWay
    }

    /// Control packets and the liveness method carry no arguments.
    pub fn is_ping(&self) -> bool {
        self.packet_type == PacketType::Control || self.method == PING_METHOD
    }
}

/// Response envelope.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResponsePacket {
    pub version: ProtocolVersion,
    pub packet_type: PacketType,
    pub message_type: i32,
    pub request_id: i32,
    pub servant: String,
    pub method: String,
    pub result: ResultCode,
    pub description: String,
    pub body: Bytes,
    pub status: BTreeMap<String, String>,
}

impl ResponsePacket {
    /// Empty successful response echoing the identity of `request`.
    pub fn for_request(request: &RequestPacket) -> Self {
        Self {
            version: request.version,
            packet_type: request.packet_type,
            message_type: request.message_type,
            request_id: request.request_id,
            servant: request.servant.clone(),
            method: request.method.clone(),
            ..Self::default()
        }
    }

    pub fn with_result(mut self, result: ResultCode, description: impl Into<String>) -> Self {
        self.result = result;
        self.description = description.into();
        self
    }
}

/// Named in and out argument slots of one call.
///
/// Outputs set before a call are sent as in/out initial values; after the
/// call they hold what the servant wrote.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CallArgs {
    pub inputs: BTreeMap<String, Value>,
    pub outputs: BTreeMap<String, Value>,
}

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.inputs.insert(name.into(), value.into());
        self
    }

    pub fn with_output(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.outputs.insert(name.into(), value.into());
        self
    }

    pub fn input(&self, name: &str) -> Option<&Value> {
        self.inputs.get(name)
    }

    pub fn output(&self, name: &str) -> Option<&Value> {
        self.outputs.get(name)
    }

    pub fn set_output(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.outputs.insert(name.into(), value.into());
    }
}

/// A server-side decoded request.
///
/// `result` is downgraded in place when routing or body decoding fails;
/// the header fields in `packet` stay valid either way.
#[derive(Debug, Clone, PartialEq)]
pub struct ServantRequest {
    pub packet: RequestPacket,
    pub result: ResultCode,
    pub description: String,
    pub method: Option<Arc<MethodDescriptor>>,
    pub args: CallArgs,
}

impl ServantRequest {
    pub fn new(packet: RequestPacket) -> Self {
        Self {
            packet,
            result: ResultCode::Success,
            description: String::new(),
            method: None,
            args: CallArgs::default(),
        }
    }

    pub fn fail(&mut self, result: ResultCode, description: impl Into<String>) {
        self.result = result;
        self.description = description.into();
    }

    pub fn is_routable(&self) -> bool {
        self.result.is_success() && self.method.is_some()
    }
}

/// Decoded outcome of a successful call.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CallReply {
    pub ret: Option<Value>,
    pub outputs: BTreeMap<String, Value>,
    pub status: BTreeMap<String, String>,
}

impl CallReply {
    pub fn output(&self, name: &str) -> Option<&Value> {
        self.outputs.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_codes_roundtrip_and_preserve_unknown() {
        for code in [0, -1, -2, -3, -4, -6, -7, -8, -9, -11, -12, -99, 17, -5] {
            assert_eq!(ResultCode::from_code(code).code(), code);
        }
        assert_eq!(ResultCode::from_code(-5), ResultCode::Other(-5));
        assert_eq!(ResultCode::NoSuchServant.to_string(), "no such servant (-4)");
    }

    #[test]
    fn versions_outside_range_are_rejected() {
        assert_eq!(ProtocolVersion::from_i16(3).unwrap(), ProtocolVersion::CompactAttribute);
        assert!(matches!(
            ProtocolVersion::from_i16(4),
            Err(CodecError::UnsupportedVersion(4))
        ));
    }

    #[test]
    fn response_echoes_request_identity() {
        let mut request = RequestPacket::new("App.Server.Obj", "echo");
        request.request_id = 7;
        request.version = ProtocolVersion::Attribute;
        request.packet_type = PacketType::OneWay;

        let response = ResponsePacket::for_request(&request);
        assert_eq!(response.request_id, 7);
        assert_eq!(response.version, ProtocolVersion::Attribute);
        assert_eq!(response.method, "echo");
        assert!(response.result.is_success());
    }

    #[test]
    fn control_packets_count_as_ping() {
        let mut request = RequestPacket::new("App.Server.Obj", "anything");
        assert!(!request.is_ping());
        request.packet_type = PacketType::Control;
        assert!(request.is_ping());
    }
}
