use std::collections::BTreeMap;

use bytes::Bytes;

use crate::error::{CodecError, Result};
use crate::stamp::{Stamp, WireType};
use crate::value::Value;

/// Deepest struct/list/map nesting accepted from the wire.
pub const MAX_DEPTH: usize = 64;

/// Parsed field header.
#[derive(Debug, Clone, Copy)]
struct Head {
    tag: u8,
    wire: WireType,
    len: usize,
}

/// Tagged field decoder over one scope (a whole buffer or a struct body).
///
/// Lookups are order independent: [`TarsInput::read`] scans forward from
/// the cursor for the requested tag, wraps around to the scope start, and
/// skips every non-matching field by its wire type. Nesting deeper than
/// [`MAX_DEPTH`] is [`CodecError::TooDeep`].
#[derive(Debug, Clone)]
pub struct TarsInput<'a> {
    buf: &'a [u8],
    start: usize,
    end: usize,
    pos: usize,
    depth: usize,
}

impl<'a> TarsInput<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self::scoped(buf, 0, buf.len(), 0)
    }

    fn scoped(buf: &'a [u8], start: usize, end: usize, depth: usize) -> Self {
        Self {
            buf,
            start,
            end,
            pos: start,
            depth,
        }
    }

    /// Read the field at `tag` as `stamp`.
    ///
    /// An absent optional field yields the stamp's default value; an absent
    /// required field is [`CodecError::MissingField`].
    pub fn read(&mut self, tag: u8, stamp: &Stamp, required: bool) -> Result<Value> {
        match self.seek(tag)? {
            Some(wire) => self.read_body(tag, wire, stamp),
            None if required => Err(CodecError::MissingField(tag)),
            None => Ok(stamp.default_value()),
        }
    }

    pub fn read_i8(&mut self, tag: u8, required: bool) -> Result<i8> {
        match self.read(tag, &Stamp::Byte, required)? {
            Value::Byte(v) => Ok(v),
            other => Err(unexpected(tag, &Stamp::Byte, &other)),
        }
    }

    pub fn read_i16(&mut self, tag: u8, required: bool) -> Result<i16> {
        match self.read(tag, &Stamp::Short, required)? {
            Value::Short(v) => Ok(v),
            other => Err(unexpected(tag, &Stamp::Short, &other)),
        }
    }

    pub fn read_i32(&mut self, tag: u8, required: bool) -> Result<i32> {
        match self.read(tag, &Stamp::Int, required)? {
            Value::Int(v) => Ok(v),
            other => Err(unexpected(tag, &Stamp::Int, &other)),
        }
    }

    pub fn read_i64(&mut self, tag: u8, required: bool) -> Result<i64> {
        match self.read(tag, &Stamp::Long, required)? {
            Value::Long(v) => Ok(v),
            other => Err(unexpected(tag, &Stamp::Long, &other)),
        }
    }

    pub fn read_string(&mut self, tag: u8, required: bool) -> Result<String> {
        match self.read(tag, &Stamp::String, required)? {
            Value::String(v) => Ok(v),
            other => Err(unexpected(tag, &Stamp::String, &other)),
        }
    }

    pub fn read_bytes(&mut self, tag: u8, required: bool) -> Result<Bytes> {
        match self.read(tag, &Stamp::Bytes, required)? {
            Value::Bytes(v) => Ok(v),
            other => Err(unexpected(tag, &Stamp::Bytes, &other)),
        }
    }

    pub fn read_string_map(
        &mut self,
        tag: u8,
        required: bool,
    ) -> Result<BTreeMap<String, String>> {
        let stamp = Stamp::map(Stamp::String, Stamp::String);
        let Value::Map(entries) = self.read(tag, &stamp, required)? else {
            return Err(CodecError::TypeMismatch {
                tag,
                expected: stamp.type_name(),
                found: "non-map value".to_string(),
            });
        };
        let mut map = BTreeMap::new();
        for (key, value) in entries {
            if let (Value::String(key), Value::String(value)) = (key, value) {
                map.insert(key, value);
            }
        }
        Ok(map)
    }

    /// Position the cursor on the body of the field at `tag`.
    fn seek(&mut self, tag: u8) -> Result<Option<WireType>> {
        let origin = self.pos;
        let found = match self.scan(origin, self.end, tag)? {
            Some(found) => Some(found),
            None => self.scan(self.start, origin, tag)?,
        };
        Ok(found.map(|(body, wire)| {
            self.pos = body;
            wire
        }))
    }

    fn scan(&self, from: usize, until: usize, tag: u8) -> Result<Option<(usize, WireType)>> {
        let mut at = from;
        while at < until {
            let head = self.peek_head(at)?;
            if head.tag == tag && head.wire != WireType::StructEnd {
                return Ok(Some((at + head.len, head.wire)));
            }
            at = self.skip_body(at + head.len, head.wire, self.depth)?;
        }
        Ok(None)
    }

    fn read_body(&mut self, tag: u8, wire: WireType, stamp: &Stamp) -> Result<Value> {
        if !matches!(stamp, Stamp::List(_) | Stamp::Map(..) | Stamp::Struct(_)) {
            return self.read_body_at(tag, wire, stamp);
        }
        if self.depth >= MAX_DEPTH {
            return Err(CodecError::TooDeep(MAX_DEPTH));
        }
        self.depth += 1;
        let value = self.read_body_at(tag, wire, stamp);
        self.depth -= 1;
        value
    }

    fn read_body_at(&mut self, tag: u8, wire: WireType, stamp: &Stamp) -> Result<Value> {
        let at = self.pos;
        let (value, next) = match stamp {
            Stamp::Bool => {
                let (v, next) = self.int_body(at, wire, tag, stamp, 1)?;
                (Value::Bool(v != 0), next)
            }
            Stamp::Byte => {
                let (v, next) = self.int_body(at, wire, tag, stamp, 1)?;
                (Value::Byte(v as i8), next)
            }
            Stamp::Short => {
                let (v, next) = self.int_body(at, wire, tag, stamp, 2)?;
                (Value::Short(v as i16), next)
            }
            Stamp::Int => {
                let (v, next) = self.int_body(at, wire, tag, stamp, 4)?;
                (Value::Int(v as i32), next)
            }
            Stamp::Long => {
                let (v, next) = self.int_body(at, wire, tag, stamp, 8)?;
                (Value::Long(v), next)
            }
            Stamp::Float => match wire {
                WireType::ZeroTag => (Value::Float(0.0), at),
                WireType::Float => (Value::Float(f32::from_be_bytes(self.array(at)?)), at + 4),
                _ => return Err(mismatch(tag, stamp, wire)),
            },
            Stamp::Double => match wire {
                WireType::ZeroTag => (Value::Double(0.0), at),
                WireType::Float => (
                    Value::Double(f64::from(f32::from_be_bytes(self.array(at)?))),
                    at + 4,
                ),
                WireType::Double => (Value::Double(f64::from_be_bytes(self.array(at)?)), at + 8),
                _ => return Err(mismatch(tag, stamp, wire)),
            },
            Stamp::String => {
                let (data, next) = match wire {
                    WireType::String1 => {
                        let [len] = self.array::<1>(at)?;
                        (self.slice(at + 1, usize::from(len))?, at + 1 + usize::from(len))
                    }
                    WireType::String4 => {
                        let len = u32::from_be_bytes(self.array(at)?) as usize;
                        (self.slice(at + 4, len)?, at + 4 + len)
                    }
                    _ => return Err(mismatch(tag, stamp, wire)),
                };
                let text = std::str::from_utf8(data).map_err(|_| CodecError::InvalidUtf8)?;
                (Value::String(text.to_string()), next)
            }
            Stamp::Bytes => match wire {
                WireType::SimpleList => {
                    let head = self.peek_head(at)?;
                    let (len, body) = self.size_at(at + head.len)?;
                    let data = self.slice(body, len)?;
                    (Value::Bytes(Bytes::copy_from_slice(data)), body + len)
                }
                WireType::List => {
                    let (len, body) = self.size_at(at)?;
                    self.pos = body;
                    let mut data = Vec::with_capacity(len);
                    for _ in 0..len {
                        let head = self.peek_head(self.pos)?;
                        let (v, next) = self.int_body(
                            self.pos + head.len,
                            head.wire,
                            head.tag,
                            &Stamp::Byte,
                            1,
                        )?;
                        data.push(v as u8);
                        self.pos = next;
                    }
                    (Value::Bytes(Bytes::from(data)), self.pos)
                }
                _ => return Err(mismatch(tag, stamp, wire)),
            },
            Stamp::List(element) => {
                if wire != WireType::List {
                    return Err(mismatch(tag, stamp, wire));
                }
                let (len, body) = self.size_at(at)?;
                self.pos = body;
                let mut items = Vec::with_capacity(len);
                for _ in 0..len {
                    items.push(self.read_next(element)?);
                }
                (Value::List(items), self.pos)
            }
            Stamp::Map(key, value) => {
                if wire != WireType::Map {
                    return Err(mismatch(tag, stamp, wire));
                }
                let (len, body) = self.size_at(at)?;
                self.pos = body;
                let mut entries = Vec::with_capacity(len);
                for _ in 0..len {
                    let k = self.read_next(key)?;
                    let v = self.read_next(value)?;
                    entries.push((k, v));
                }
                (Value::Map(entries), self.pos)
            }
            Stamp::Struct(def) => {
                if wire != WireType::StructBegin {
                    return Err(mismatch(tag, stamp, wire));
                }
                let (inner_end, after) = self.struct_extent(at, self.depth)?;
                let mut inner = TarsInput::scoped(self.buf, at, inner_end, self.depth);
                let mut fields = BTreeMap::new();
                for field in &def.fields {
                    fields.insert(field.tag, inner.read(field.tag, &field.stamp, field.required)?);
                }
                (Value::Struct(fields), after)
            }
        };
        self.pos = next;
        Ok(value)
    }

    /// Read the field under the cursor, whatever its tag (collection elements).
    fn read_next(&mut self, stamp: &Stamp) -> Result<Value> {
        let head = self.peek_head(self.pos)?;
        self.pos += head.len;
        self.read_body(head.tag, head.wire, stamp)
    }

    fn peek_head(&self, at: usize) -> Result<Head> {
        let [first] = self.array::<1>(at)?;
        let wire = WireType::from_u8(first & 0x0F)?;
        let tag = first >> 4;
        if tag == 15 {
            let [tag] = self.array::<1>(at + 1)?;
            Ok(Head { tag, wire, len: 2 })
        } else {
            Ok(Head { tag, wire, len: 1 })
        }
    }

    fn int_body(
        &self,
        at: usize,
        wire: WireType,
        tag: u8,
        stamp: &Stamp,
        max_width: usize,
    ) -> Result<(i64, usize)> {
        let width = wire
            .int_width()
            .filter(|width| *width <= max_width)
            .ok_or_else(|| mismatch(tag, stamp, wire))?;
        let value = match width {
            0 => 0,
            1 => i64::from(i8::from_be_bytes(self.array(at)?)),
            2 => i64::from(i16::from_be_bytes(self.array(at)?)),
            4 => i64::from(i32::from_be_bytes(self.array(at)?)),
            _ => i64::from_be_bytes(self.array(at)?),
        };
        Ok((value, at + width))
    }

    /// Collection size: an int field at tag 0, checked against the bytes left.
    fn size_at(&self, at: usize) -> Result<(usize, usize)> {
        let head = self.peek_head(at)?;
        let (size, next) = self.int_body(at + head.len, head.wire, head.tag, &Stamp::Int, 4)?;
        if size < 0 {
            return Err(CodecError::NegativeSize(size));
        }
        let size = size as usize;
        let available = self.end.saturating_sub(next);
        if size > available {
            return Err(CodecError::Truncated {
                needed: size,
                available,
            });
        }
        Ok((size, next))
    }

    /// Skip one value body of type `wire` starting at `at`, nested `depth`
    /// levels below the top of the buffer.
    fn skip_body(&self, at: usize, wire: WireType, depth: usize) -> Result<usize> {
        if matches!(wire, WireType::List | WireType::Map | WireType::StructBegin)
            && depth >= MAX_DEPTH
        {
            return Err(CodecError::TooDeep(MAX_DEPTH));
        }
        Ok(match wire {
            WireType::ZeroTag | WireType::StructEnd => at,
            WireType::Int1 => self.skip_fixed(at, 1)?,
            WireType::Int2 => self.skip_fixed(at, 2)?,
            WireType::Int4 | WireType::Float => self.skip_fixed(at, 4)?,
            WireType::Int8 | WireType::Double => self.skip_fixed(at, 8)?,
            WireType::String1 => {
                let [len] = self.array::<1>(at)?;
                self.skip_fixed(at + 1, usize::from(len))?
            }
            WireType::String4 => {
                let len = u32::from_be_bytes(self.array(at)?) as usize;
                self.skip_fixed(at + 4, len)?
            }
            WireType::List => {
                let (len, mut next) = self.size_at(at)?;
                for _ in 0..len {
                    next = self.skip_field(next, depth + 1)?;
                }
                next
            }
            WireType::Map => {
                let (len, mut next) = self.size_at(at)?;
                for _ in 0..len * 2 {
                    next = self.skip_field(next, depth + 1)?;
                }
                next
            }
            WireType::StructBegin => self.struct_extent(at, depth + 1)?.1,
            WireType::SimpleList => {
                let head = self.peek_head(at)?;
                let (len, body) = self.size_at(at + head.len)?;
                self.skip_fixed(body, len)?
            }
        })
    }

    fn skip_field(&self, at: usize, depth: usize) -> Result<usize> {
        let head = self.peek_head(at)?;
        self.skip_body(at + head.len, head.wire, depth)
    }

    /// Returns (position of the closing `StructEnd`, position after it).
    fn struct_extent(&self, body: usize, depth: usize) -> Result<(usize, usize)> {
        let mut at = body;
        loop {
            let head = self.peek_head(at)?;
            if head.wire == WireType::StructEnd {
                return Ok((at, at + head.len));
            }
            at = self.skip_body(at + head.len, head.wire, depth)?;
        }
    }

    fn skip_fixed(&self, at: usize, len: usize) -> Result<usize> {
        self.slice(at, len)?;
        Ok(at + len)
    }

    fn slice(&self, at: usize, len: usize) -> Result<&'a [u8]> {
        let available = self.end.saturating_sub(at);
        if len > available {
            return Err(CodecError::Truncated {
                needed: len,
                available,
            });
        }
        Ok(&self.buf[at..at + len])
    }

    fn array<const N: usize>(&self, at: usize) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.slice(at, N)?);
        Ok(out)
    }
}

/// Decode a single value written at tag 0.
pub fn decode_value(data: &[u8], stamp: &Stamp) -> Result<Value> {
    TarsInput::new(data).read(0, stamp, true)
}

fn mismatch(tag: u8, stamp: &Stamp, wire: WireType) -> CodecError {
    CodecError::TypeMismatch {
        tag,
        expected: stamp.type_name(),
        found: wire.to_string(),
    }
}

fn unexpected(tag: u8, stamp: &Stamp, value: &Value) -> CodecError {
    CodecError::TypeMismatch {
        tag,
        expected: stamp.type_name(),
        found: value.kind().to_string(),
    }
}
