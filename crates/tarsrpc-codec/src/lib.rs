//! Tagged binary wire codec for tarsrpc.
//!
//! Every package is a 4-byte big-endian total length followed by an
//! envelope of tagged fields. Each field header carries a small ordinal tag
//! and a wire type; decoding matches fields by tag, so order within a
//! struct does not matter and unknown fields are skipped.
//!
//! Envelopes come in three versions:
//! - 1: positional body, arguments tagged by ordinal
//! - 2: name-keyed attribute bag with type names
//! - 3: name-keyed attribute bag without type names

pub mod attribute;
pub mod body;
pub mod codec;
pub mod descriptor;
pub mod envelope;
pub mod error;
pub mod frame;
pub mod input;
pub mod output;
pub mod reader;
pub mod stamp;
pub mod value;
pub mod writer;

#[cfg(feature = "async")]
pub mod framed;

pub use attribute::AttributeBag;
pub use codec::{Codec, TarsCodec};
pub use descriptor::{
    Direction, InterfaceDescriptor, MethodDescriptor, MethodLookup, MethodRegistry, MethodTable,
    ParamDescriptor, ParamRole, ReturnDescriptor, MAX_WIRE_PARAMS, PING_METHOD,
};
pub use envelope::{
    CallArgs, CallReply, PacketType, ProtocolVersion, RequestPacket, ResponsePacket, ResultCode,
    ServantRequest, STATUS_RESULT_CODE, STATUS_RESULT_DESC,
};
pub use error::{CodecError, Result};
pub use frame::{decode_frame, encode_frame, FrameConfig, HEADER_SIZE, MAX_PACKAGE_SIZE};
pub use input::{TarsInput, MAX_DEPTH};
pub use output::TarsOutput;
pub use reader::FrameReader;
pub use stamp::{FieldDef, Stamp, StructDef, WireType};
pub use value::Value;
pub use writer::FrameWriter;

#[cfg(feature = "async")]
pub use framed::TarsFrameCodec;
