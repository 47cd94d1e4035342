//! Matter TLV codec
//!
//! Little-endian tag-length-value encoding used by certificates, session
//! establishment payloads and the Interaction Model. Encoders emit
//! minimal-width integers and length fields, which keeps re-encoding a
//! parsed element byte-identical to its source.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

/// TLV errors
#[derive(Debug, Error)]
pub enum TlvError {
    #[error("unexpected end of input")]
    UnexpectedEnd,
    #[error("unknown element type: {0:#04x}")]
    UnknownElementType(u8),
    #[error("unsupported tag control: {0:#04x}")]
    UnsupportedTagControl(u8),
    #[error("unterminated container")]
    UnterminatedContainer,
    #[error("dangling end-of-container")]
    DanglingEndOfContainer,
    #[error("length out of range: {0}")]
    LengthOutOfRange(u64),
    #[error("invalid utf-8 string")]
    InvalidString,
    #[error("trailing bytes after element")]
    TrailingBytes,
    #[error("element is not a {0}")]
    WrongType(&'static str),
    #[error("missing field: context tag {0}")]
    MissingField(u8),
}

// Tag controls (upper 3 bits of the control byte).
const TAG_ANONYMOUS: u8 = 0x00;
const TAG_CONTEXT: u8 = 0x20;
const TAG_COMMON_2: u8 = 0x40;
const TAG_COMMON_4: u8 = 0x60;

// Element types (lower 5 bits of the control byte).
const TYPE_INT_1: u8 = 0x00;
const TYPE_UINT_1: u8 = 0x04;
const TYPE_BOOL_FALSE: u8 = 0x08;
const TYPE_BOOL_TRUE: u8 = 0x09;
const TYPE_FLOAT_32: u8 = 0x0A;
const TYPE_FLOAT_64: u8 = 0x0B;
const TYPE_UTF8_1: u8 = 0x0C;
const TYPE_BYTES_1: u8 = 0x10;
const TYPE_NULL: u8 = 0x14;
const TYPE_STRUCT: u8 = 0x15;
const TYPE_ARRAY: u8 = 0x16;
const TYPE_LIST: u8 = 0x17;
const TYPE_END: u8 = 0x18;

/// Element tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Tag {
    /// No tag; the only form allowed inside arrays.
    Anonymous,
    /// Context-specific tag, scoped to the enclosing struct/list.
    Context(u8),
    /// Common-profile tag.
    Common(u32),
}

/// Element value.
#[derive(Clone, Debug, PartialEq)]
pub enum TlvValue {
    Signed(i64),
    Unsigned(u64),
    Bool(bool),
    Float(f32),
    Double(f64),
    Utf8(String),
    Bytes(Vec<u8>),
    Null,
    Struct(Vec<TlvElement>),
    Array(Vec<TlvElement>),
    List(Vec<TlvElement>),
}

/// A decoded TLV element: tag plus value, with nested containers inline.
#[derive(Clone, Debug, PartialEq)]
pub struct TlvElement {
    pub tag: Tag,
    pub value: TlvValue,
}

impl TlvElement {
    pub fn new(tag: Tag, value: TlvValue) -> Self {
        Self { tag, value }
    }

    pub fn unsigned(tag: Tag, v: u64) -> Self {
        Self::new(tag, TlvValue::Unsigned(v))
    }

    pub fn signed(tag: Tag, v: i64) -> Self {
        Self::new(tag, TlvValue::Signed(v))
    }

    pub fn boolean(tag: Tag, v: bool) -> Self {
        Self::new(tag, TlvValue::Bool(v))
    }

    pub fn utf8(tag: Tag, v: impl Into<String>) -> Self {
        Self::new(tag, TlvValue::Utf8(v.into()))
    }

    pub fn bytes(tag: Tag, v: impl Into<Vec<u8>>) -> Self {
        Self::new(tag, TlvValue::Bytes(v.into()))
    }

    pub fn null(tag: Tag) -> Self {
        Self::new(tag, TlvValue::Null)
    }

    pub fn structure(tag: Tag, fields: Vec<TlvElement>) -> Self {
        Self::new(tag, TlvValue::Struct(fields))
    }

    pub fn array(tag: Tag, items: Vec<TlvElement>) -> Self {
        Self::new(tag, TlvValue::Array(items))
    }

    pub fn list(tag: Tag, items: Vec<TlvElement>) -> Self {
        Self::new(tag, TlvValue::List(items))
    }

    // ---- accessors -------------------------------------------------------

    pub fn as_unsigned(&self) -> Result<u64, TlvError> {
        match self.value {
            TlvValue::Unsigned(v) => Ok(v),
            _ => Err(TlvError::WrongType("unsigned")),
        }
    }

    pub fn as_signed(&self) -> Result<i64, TlvError> {
        match self.value {
            TlvValue::Signed(v) => Ok(v),
            TlvValue::Unsigned(v) if v <= i64::MAX as u64 => Ok(v as i64),
            _ => Err(TlvError::WrongType("signed")),
        }
    }

    pub fn as_bool(&self) -> Result<bool, TlvError> {
        match self.value {
            TlvValue::Bool(v) => Ok(v),
            _ => Err(TlvError::WrongType("bool")),
        }
    }

    pub fn as_utf8(&self) -> Result<&str, TlvError> {
        match &self.value {
            TlvValue::Utf8(v) => Ok(v),
            _ => Err(TlvError::WrongType("utf8 string")),
        }
    }

    pub fn as_bytes(&self) -> Result<&[u8], TlvError> {
        match &self.value {
            TlvValue::Bytes(v) => Ok(v),
            _ => Err(TlvError::WrongType("byte string")),
        }
    }

    pub fn as_struct(&self) -> Result<&[TlvElement], TlvError> {
        match &self.value {
            TlvValue::Struct(v) => Ok(v),
            _ => Err(TlvError::WrongType("struct")),
        }
    }

    pub fn as_array(&self) -> Result<&[TlvElement], TlvError> {
        match &self.value {
            TlvValue::Array(v) => Ok(v),
            _ => Err(TlvError::WrongType("array")),
        }
    }

    pub fn as_list(&self) -> Result<&[TlvElement], TlvError> {
        match &self.value {
            TlvValue::List(v) => Ok(v),
            _ => Err(TlvError::WrongType("list")),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self.value, TlvValue::Null)
    }

    /// Look up a context-tagged field of a struct or list.
    pub fn field(&self, context_tag: u8) -> Option<&TlvElement> {
        let items = match &self.value {
            TlvValue::Struct(v) | TlvValue::List(v) => v,
            _ => return None,
        };
        items.iter().find(|e| e.tag == Tag::Context(context_tag))
    }

    /// Like [`field`](Self::field) but missing fields are an error.
    pub fn expect_field(&self, context_tag: u8) -> Result<&TlvElement, TlvError> {
        self.field(context_tag)
            .ok_or(TlvError::MissingField(context_tag))
    }

    /// Encode this element to bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_element(self, &mut buf);
        buf.to_vec()
    }

    /// Decode a single element, rejecting trailing bytes.
    pub fn decode(data: &[u8]) -> Result<Self, TlvError> {
        let mut cursor = data;
        let element = decode_element(&mut cursor)?;
        if cursor.has_remaining() {
            return Err(TlvError::TrailingBytes);
        }
        Ok(element)
    }
}

// =============================================================================
// ENCODER
// =============================================================================

fn encode_tag(tag: &Tag, element_type: u8, buf: &mut BytesMut) {
    match tag {
        Tag::Anonymous => buf.put_u8(TAG_ANONYMOUS | element_type),
        Tag::Context(n) => {
            buf.put_u8(TAG_CONTEXT | element_type);
            buf.put_u8(*n);
        }
        Tag::Common(n) => {
            if *n <= u16::MAX as u32 {
                buf.put_u8(TAG_COMMON_2 | element_type);
                buf.put_u16_le(*n as u16);
            } else {
                buf.put_u8(TAG_COMMON_4 | element_type);
                buf.put_u32_le(*n);
            }
        }
    }
}

/// Width selector for minimal integer encoding: (size-class, bytes).
fn unsigned_width(v: u64) -> u8 {
    if v <= u8::MAX as u64 {
        0
    } else if v <= u16::MAX as u64 {
        1
    } else if v <= u32::MAX as u64 {
        2
    } else {
        3
    }
}

fn signed_width(v: i64) -> u8 {
    if v >= i8::MIN as i64 && v <= i8::MAX as i64 {
        0
    } else if v >= i16::MIN as i64 && v <= i16::MAX as i64 {
        1
    } else if v >= i32::MIN as i64 && v <= i32::MAX as i64 {
        2
    } else {
        3
    }
}

fn put_uint(v: u64, width: u8, buf: &mut BytesMut) {
    match width {
        0 => buf.put_u8(v as u8),
        1 => buf.put_u16_le(v as u16),
        2 => buf.put_u32_le(v as u32),
        _ => buf.put_u64_le(v),
    }
}

fn put_int(v: i64, width: u8, buf: &mut BytesMut) {
    match width {
        0 => buf.put_i8(v as i8),
        1 => buf.put_i16_le(v as i16),
        2 => buf.put_i32_le(v as i32),
        _ => buf.put_i64_le(v),
    }
}

fn length_width(len: usize) -> u8 {
    if len <= u8::MAX as usize {
        0
    } else if len <= u16::MAX as usize {
        1
    } else {
        2
    }
}

fn put_length(len: usize, width: u8, buf: &mut BytesMut) {
    match width {
        0 => buf.put_u8(len as u8),
        1 => buf.put_u16_le(len as u16),
        _ => buf.put_u32_le(len as u32),
    }
}

fn encode_element(element: &TlvElement, buf: &mut BytesMut) {
    match &element.value {
        TlvValue::Signed(v) => {
            let width = signed_width(*v);
            encode_tag(&element.tag, TYPE_INT_1 + width, buf);
            put_int(*v, width, buf);
        }
        TlvValue::Unsigned(v) => {
            let width = unsigned_width(*v);
            encode_tag(&element.tag, TYPE_UINT_1 + width, buf);
            put_uint(*v, width, buf);
        }
        TlvValue::Bool(v) => {
            let ty = if *v { TYPE_BOOL_TRUE } else { TYPE_BOOL_FALSE };
            encode_tag(&element.tag, ty, buf);
        }
        TlvValue::Float(v) => {
            encode_tag(&element.tag, TYPE_FLOAT_32, buf);
            buf.put_f32_le(*v);
        }
        TlvValue::Double(v) => {
            encode_tag(&element.tag, TYPE_FLOAT_64, buf);
            buf.put_f64_le(*v);
        }
        TlvValue::Utf8(v) => {
            let width = length_width(v.len());
            encode_tag(&element.tag, TYPE_UTF8_1 + width, buf);
            put_length(v.len(), width, buf);
            buf.put_slice(v.as_bytes());
        }
        TlvValue::Bytes(v) => {
            let width = length_width(v.len());
            encode_tag(&element.tag, TYPE_BYTES_1 + width, buf);
            put_length(v.len(), width, buf);
            buf.put_slice(v);
        }
        TlvValue::Null => encode_tag(&element.tag, TYPE_NULL, buf),
        TlvValue::Struct(items) => encode_container(element, TYPE_STRUCT, items, buf),
        TlvValue::Array(items) => encode_container(element, TYPE_ARRAY, items, buf),
        TlvValue::List(items) => encode_container(element, TYPE_LIST, items, buf),
    }
}

fn encode_container(element: &TlvElement, ty: u8, items: &[TlvElement], buf: &mut BytesMut) {
    encode_tag(&element.tag, ty, buf);
    for item in items {
        encode_element(item, buf);
    }
    buf.put_u8(TYPE_END);
}

// =============================================================================
// DECODER
// =============================================================================

fn take(cursor: &mut &[u8], n: usize) -> Result<Vec<u8>, TlvError> {
    if cursor.remaining() < n {
        return Err(TlvError::UnexpectedEnd);
    }
    let mut out = vec![0u8; n];
    cursor.copy_to_slice(&mut out);
    Ok(out)
}

fn get_u8(cursor: &mut &[u8]) -> Result<u8, TlvError> {
    if !cursor.has_remaining() {
        return Err(TlvError::UnexpectedEnd);
    }
    Ok(cursor.get_u8())
}

fn decode_tag(control: u8, cursor: &mut &[u8]) -> Result<Tag, TlvError> {
    match control & 0xE0 {
        TAG_ANONYMOUS => Ok(Tag::Anonymous),
        TAG_CONTEXT => Ok(Tag::Context(get_u8(cursor)?)),
        TAG_COMMON_2 => {
            if cursor.remaining() < 2 {
                return Err(TlvError::UnexpectedEnd);
            }
            Ok(Tag::Common(cursor.get_u16_le() as u32))
        }
        TAG_COMMON_4 => {
            if cursor.remaining() < 4 {
                return Err(TlvError::UnexpectedEnd);
            }
            Ok(Tag::Common(cursor.get_u32_le()))
        }
        other => Err(TlvError::UnsupportedTagControl(other)),
    }
}

fn decode_uint(cursor: &mut &[u8], width: u8) -> Result<u64, TlvError> {
    let n = 1usize << width;
    if cursor.remaining() < n {
        return Err(TlvError::UnexpectedEnd);
    }
    Ok(match width {
        0 => cursor.get_u8() as u64,
        1 => cursor.get_u16_le() as u64,
        2 => cursor.get_u32_le() as u64,
        _ => cursor.get_u64_le(),
    })
}

fn decode_int(cursor: &mut &[u8], width: u8) -> Result<i64, TlvError> {
    let n = 1usize << width;
    if cursor.remaining() < n {
        return Err(TlvError::UnexpectedEnd);
    }
    Ok(match width {
        0 => cursor.get_i8() as i64,
        1 => cursor.get_i16_le() as i64,
        2 => cursor.get_i32_le() as i64,
        _ => cursor.get_i64_le(),
    })
}

fn decode_length(cursor: &mut &[u8], width: u8) -> Result<usize, TlvError> {
    let raw = decode_uint(cursor, width)?;
    if raw > u32::MAX as u64 {
        return Err(TlvError::LengthOutOfRange(raw));
    }
    Ok(raw as usize)
}

fn decode_container(cursor: &mut &[u8]) -> Result<Vec<TlvElement>, TlvError> {
    let mut items = Vec::new();
    loop {
        if !cursor.has_remaining() {
            return Err(TlvError::UnterminatedContainer);
        }
        if cursor[0] == TYPE_END {
            cursor.advance(1);
            return Ok(items);
        }
        items.push(decode_element(cursor)?);
    }
}

fn decode_element(cursor: &mut &[u8]) -> Result<TlvElement, TlvError> {
    let control = get_u8(cursor)?;
    let element_type = control & 0x1F;
    if element_type == TYPE_END {
        return Err(TlvError::DanglingEndOfContainer);
    }
    let tag = decode_tag(control, cursor)?;

    let value = match element_type {
        t @ TYPE_INT_1..=0x03 => TlvValue::Signed(decode_int(cursor, t - TYPE_INT_1)?),
        t @ TYPE_UINT_1..=0x07 => TlvValue::Unsigned(decode_uint(cursor, t - TYPE_UINT_1)?),
        TYPE_BOOL_FALSE => TlvValue::Bool(false),
        TYPE_BOOL_TRUE => TlvValue::Bool(true),
        TYPE_FLOAT_32 => {
            if cursor.remaining() < 4 {
                return Err(TlvError::UnexpectedEnd);
            }
            TlvValue::Float(cursor.get_f32_le())
        }
        TYPE_FLOAT_64 => {
            if cursor.remaining() < 8 {
                return Err(TlvError::UnexpectedEnd);
            }
            TlvValue::Double(cursor.get_f64_le())
        }
        t @ TYPE_UTF8_1..=0x0F => {
            let len = decode_length(cursor, t - TYPE_UTF8_1)?;
            let raw = take(cursor, len)?;
            TlvValue::Utf8(String::from_utf8(raw).map_err(|_| TlvError::InvalidString)?)
        }
        t @ TYPE_BYTES_1..=0x13 => {
            let len = decode_length(cursor, t - TYPE_BYTES_1)?;
            TlvValue::Bytes(take(cursor, len)?)
        }
        TYPE_NULL => TlvValue::Null,
        TYPE_STRUCT => TlvValue::Struct(decode_container(cursor)?),
        TYPE_ARRAY => TlvValue::Array(decode_container(cursor)?),
        TYPE_LIST => TlvValue::List(decode_container(cursor)?),
        other => return Err(TlvError::UnknownElementType(other)),
    };

    Ok(TlvElement { tag, value })
}
