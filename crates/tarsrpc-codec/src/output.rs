use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};

use crate::stamp::WireType;
use crate::value::Value;

const INITIAL_BUFFER_CAPACITY: usize = 256;

/// Tagged field encoder.
///
/// Every `write_*` call appends one field: a header carrying the tag and
/// wire type, then the value body. Integers use the narrowest wire type
/// that holds them, with zero written as a bare `ZeroTag` header.
#[derive(Debug, Default)]
pub struct TarsOutput {
    buf: BytesMut,
}

impl TarsOutput {
    pub fn new() -> Self {
        Self::with_buffer(BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY))
    }

    /// Append to an existing buffer (e.g. after a reserved frame header).
    pub fn with_buffer(buf: BytesMut) -> Self {
        Self { buf }
    }

    pub fn write_head(&mut self, wire: WireType, tag: u8) {
        if tag < 15 {
            self.buf.put_u8((tag << 4) | wire as u8);
        } else {
            self.buf.put_u8(0xF0 | wire as u8);
            self.buf.put_u8(tag);
        }
    }

    pub fn write_bool(&mut self, value: bool, tag: u8) {
        self.write_i8(i8::from(value), tag);
    }

    pub fn write_i8(&mut self, value: i8, tag: u8) {
        if value == 0 {
            self.write_head(WireType::ZeroTag, tag);
        } else {
            self.write_head(WireType::Int1, tag);
            self.buf.put_i8(value);
        }
    }

    pub fn write_i16(&mut self, value: i16, tag: u8) {
        match i8::try_from(value) {
            Ok(narrow) => self.write_i8(narrow, tag),
            Err(_) => {
                self.write_head(WireType::Int2, tag);
                self.buf.put_i16(value);
            }
        }
    }

    pub fn write_i32(&mut self, value: i32, tag: u8) {
        match i16::try_from(value) {
            Ok(narrow) => self.write_i16(narrow, tag),
            Err(_) => {
                self.write_head(WireType::Int4, tag);
                self.buf.put_i32(value);
            }
        }
    }

    pub fn write_i64(&mut self, value: i64, tag: u8) {
        match i32::try_from(value) {
            Ok(narrow) => self.write_i32(narrow, tag),
            Err(_) => {
                self.write_head(WireType::Int8, tag);
                self.buf.put_i64(value);
            }
        }
    }

    pub fn write_f32(&mut self, value: f32, tag: u8) {
        self.write_head(WireType::Float, tag);
        self.buf.put_f32(value);
    }

    pub fn write_f64(&mut self, value: f64, tag: u8) {
        self.write_head(WireType::Double, tag);
        self.buf.put_f64(value);
    }

    pub fn write_str(&mut self, value: &str, tag: u8) {
        let bytes = value.as_bytes();
        match u8::try_from(bytes.len()) {
            Ok(len) => {
                self.write_head(WireType::String1, tag);
                self.buf.put_u8(len);
            }
            Err(_) => {
                self.write_head(WireType::String4, tag);
                self.buf.put_u32(bytes.len() as u32);
            }
        }
        self.buf.put_slice(bytes);
    }

    /// Byte arrays use the `SimpleList` layout: an `Int1` element header,
    /// the length as an int field, then the raw bytes.
    pub fn write_bytes(&mut self, value: &[u8], tag: u8) {
        self.write_head(WireType::SimpleList, tag);
        self.write_head(WireType::Int1, 0);
        self.write_i32(value.len() as i32, 0);
        self.buf.put_slice(value);
    }

    pub fn write_string_map(&mut self, map: &BTreeMap<String, String>, tag: u8) {
        self.write_head(WireType::Map, tag);
        self.write_i32(map.len() as i32, 0);
        for (key, value) in map {
            self.write_str(key, 0);
            self.write_str(value, 1);
        }
    }

    /// Write any value at `tag`, recursing into collections and structs.
    pub fn write_value(&mut self, value: &Value, tag: u8) {
        match value {
            Value::Bool(v) => self.write_bool(*v, tag),
            Value::Byte(v) => self.write_i8(*v, tag),
            Value::Short(v) => self.write_i16(*v, tag),
            Value::Int(v) => self.write_i32(*v, tag),
            Value::Long(v) => self.write_i64(*v, tag),
            Value::Float(v) => self.write_f32(*v, tag),
            Value::Double(v) => self.write_f64(*v, tag),
            Value::String(v) => self.write_str(v, tag),
            Value::Bytes(v) => self.write_bytes(v, tag),
            Value::List(items) => {
                self.write_head(WireType::List, tag);
                self.write_i32(items.len() as i32, 0);
                for item in items {
                    self.write_value(item, 0);
                }
            }
            Value::Map(entries) => {
                self.write_head(WireType::Map, tag);
                self.write_i32(entries.len() as i32, 0);
                for (key, value) in entries {
                    self.write_value(key, 0);
                    self.write_value(value, 1);
                }
            }
            Value::Struct(fields) => {
                self.write_head(WireType::StructBegin, tag);
                for (field_tag, field) in fields {
                    self.write_value(field, *field_tag);
                }
                self.write_head(WireType::StructEnd, 0);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_inner(self) -> BytesMut {
        self.buf
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Encode a single value at tag 0 into a standalone buffer.
pub fn encode_value(value: &Value) -> Bytes {
    let mut out = TarsOutput::new();
    out.write_value(value, 0);
    out.into_bytes()
}
