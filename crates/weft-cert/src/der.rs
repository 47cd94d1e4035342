//! Minimal ASN.1 DER writer and reader
//!
//! Covers exactly the subset X.509 certificates and PKCS#10 requests need:
//! definite lengths, minimal-form integers, bit strings with an unused-bits
//! octet, and the two time encodings.

use crate::error::CertificateError;

// Universal tags.
pub const TAG_BOOLEAN: u8 = 0x01;
pub const TAG_INTEGER: u8 = 0x02;
pub const TAG_BIT_STRING: u8 = 0x03;
pub const TAG_OCTET_STRING: u8 = 0x04;
pub const TAG_NULL: u8 = 0x05;
pub const TAG_OID: u8 = 0x06;
pub const TAG_UTF8_STRING: u8 = 0x0C;
pub const TAG_PRINTABLE_STRING: u8 = 0x13;
pub const TAG_IA5_STRING: u8 = 0x16;
pub const TAG_UTC_TIME: u8 = 0x17;
pub const TAG_GENERALIZED_TIME: u8 = 0x18;
pub const TAG_SEQUENCE: u8 = 0x30;
pub const TAG_SET: u8 = 0x31;

/// Context-specific constructed tag `[n]`.
pub fn tag_context(n: u8) -> u8 {
    0xA0 | n
}

/// Context-specific primitive tag `[n] IMPLICIT`.
pub fn tag_context_primitive(n: u8) -> u8 {
    0x80 | n
}

// =============================================================================
// WRITER
// =============================================================================

fn encode_length(len: usize, out: &mut Vec<u8>) {
    if len < 0x80 {
        out.push(len as u8);
    } else if len <= 0xFF {
        out.push(0x81);
        out.push(len as u8);
    } else if len <= 0xFFFF {
        out.push(0x82);
        out.push((len >> 8) as u8);
        out.push(len as u8);
    } else {
        out.push(0x83);
        out.push((len >> 16) as u8);
        out.push((len >> 8) as u8);
        out.push(len as u8);
    }
}

/// Wrap `content` in `tag` with a definite length.
pub fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len() + 4);
    out.push(tag);
    encode_length(content.len(), &mut out);
    out.extend_from_slice(content);
    out
}

/// SEQUENCE of pre-encoded children.
pub fn sequence(children: &[Vec<u8>]) -> Vec<u8> {
    let content: Vec<u8> = children.iter().flatten().copied().collect();
    tlv(TAG_SEQUENCE, &content)
}

/// SET of pre-encoded children.
pub fn set(children: &[Vec<u8>]) -> Vec<u8> {
    let content: Vec<u8> = children.iter().flatten().copied().collect();
    tlv(TAG_SET, &content)
}

/// Context-specific constructed `[n]` wrapper (EXPLICIT tagging).
pub fn context(n: u8, inner: &[u8]) -> Vec<u8> {
    tlv(tag_context(n), inner)
}

/// INTEGER from unsigned big-endian magnitude bytes.
pub fn integer(magnitude: &[u8]) -> Vec<u8> {
    let mut stripped: &[u8] = magnitude;
    while stripped.len() > 1 && stripped[0] == 0 {
        stripped = &stripped[1..];
    }
    let mut content = Vec::with_capacity(stripped.len() + 1);
    if stripped.is_empty() || stripped[0] & 0x80 != 0 {
        content.push(0);
    }
    content.extend_from_slice(stripped);
    tlv(TAG_INTEGER, &content)
}

/// INTEGER from a u64.
pub fn integer_u64(value: u64) -> Vec<u8> {
    integer(&value.to_be_bytes())
}

/// BOOLEAN.
pub fn boolean(value: bool) -> Vec<u8> {
    tlv(TAG_BOOLEAN, &[if value { 0xFF } else { 0x00 }])
}

/// OCTET STRING.
pub fn octet_string(content: &[u8]) -> Vec<u8> {
    tlv(TAG_OCTET_STRING, content)
}

/// BIT STRING with no unused bits.
pub fn bit_string(content: &[u8]) -> Vec<u8> {
    let mut inner = Vec::with_capacity(content.len() + 1);
    inner.push(0);
    inner.extend_from_slice(content);
    tlv(TAG_BIT_STRING, &inner)
}

/// BIT STRING carrying named bits, trailing zero bits trimmed.
pub fn bit_string_named(bits: &[bool]) -> Vec<u8> {
    let used = bits
        .iter()
        .rposition(|b| *b)
        .map(|i| i + 1)
        .unwrap_or(0);
    let mut bytes = vec![0u8; used.div_ceil(8)];
    for (i, bit) in bits.iter().take(used).enumerate() {
        if *bit {
            bytes[i / 8] |= 0x80 >> (i % 8);
        }
    }
    let unused = (8 - used % 8) % 8;
    let mut inner = Vec::with_capacity(bytes.len() + 1);
    inner.push(unused as u8);
    inner.extend_from_slice(&bytes);
    tlv(TAG_BIT_STRING, &inner)
}

/// OBJECT IDENTIFIER from its BER-encoded body.
pub fn oid(body: &[u8]) -> Vec<u8> {
    tlv(TAG_OID, body)
}

/// UTF8String.
pub fn utf8_string(value: &str) -> Vec<u8> {
    tlv(TAG_UTF8_STRING, value.as_bytes())
}

/// NULL.
pub fn null() -> Vec<u8> {
    tlv(TAG_NULL, &[])
}

/// Raw r||s ECDSA signature as the DER SEQUENCE { r INTEGER, s INTEGER }.
pub fn ecdsa_signature(raw: &[u8]) -> Result<Vec<u8>, CertificateError> {
    if raw.len() != 64 {
        return Err(CertificateError::Malformed(
            "raw ECDSA signature must be 64 bytes".into(),
        ));
    }
    Ok(sequence(&[integer(&raw[..32]), integer(&raw[32..])]))
}

// =============================================================================
// READER
// =============================================================================

/// Cursor over DER-encoded bytes.
pub struct DerReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> DerReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Tag of the next element without consuming it.
    pub fn peek_tag(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn malformed(msg: &str) -> CertificateError {
        CertificateError::MalformedDer(msg.into())
    }

    fn read_byte(&mut self) -> Result<u8, CertificateError> {
        let byte = *self
            .data
            .get(self.pos)
            .ok_or_else(|| Self::malformed("unexpected end"))?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_length(&mut self) -> Result<usize, CertificateError> {
        let first = self.read_byte()?;
        if first < 0x80 {
            return Ok(first as usize);
        }
        let count = (first & 0x7F) as usize;
        if count == 0 || count > 4 {
            return Err(Self::malformed("unsupported length form"));
        }
        let mut len = 0usize;
        for _ in 0..count {
            len = (len << 8) | self.read_byte()? as usize;
        }
        Ok(len)
    }

    /// Read the next element, returning (tag, content).
    pub fn read_any(&mut self) -> Result<(u8, &'a [u8]), CertificateError> {
        let tag = self.read_byte()?;
        let len = self.read_length()?;
        if self.pos + len > self.data.len() {
            return Err(Self::malformed("length exceeds input"));
        }
        let content = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok((tag, content))
    }

    /// Read an element and require its tag.
    pub fn expect(&mut self, expected: u8) -> Result<&'a [u8], CertificateError> {
        let (tag, content) = self.read_any()?;
        if tag != expected {
            return Err(Self::malformed(&format!(
                "expected tag {expected:#04x}, got {tag:#04x}"
            )));
        }
        Ok(content)
    }

    /// Read a SEQUENCE and return a reader over its content.
    pub fn expect_sequence(&mut self) -> Result<DerReader<'a>, CertificateError> {
        Ok(DerReader::new(self.expect(TAG_SEQUENCE)?))
    }

    /// Read an INTEGER as unsigned magnitude bytes (leading zero stripped).
    pub fn expect_integer(&mut self) -> Result<&'a [u8], CertificateError> {
        let mut content = self.expect(TAG_INTEGER)?;
        if content.is_empty() {
            return Err(Self::malformed("empty integer"));
        }
        if content[0] & 0x80 != 0 {
            return Err(Self::malformed("negative integer"));
        }
        while content.len() > 1 && content[0] == 0 {
            content = &content[1..];
        }
        Ok(content)
    }

    /// Read an INTEGER that must fit in a u64.
    pub fn expect_integer_u64(&mut self) -> Result<u64, CertificateError> {
        let magnitude = self.expect_integer()?;
        if magnitude.len() > 8 {
            return Err(Self::malformed("integer too large"));
        }
        let mut value = 0u64;
        for byte in magnitude {
            value = (value << 8) | *byte as u64;
        }
        Ok(value)
    }

    /// Read a BIT STRING, dropping the unused-bits octet.
    pub fn expect_bit_string(&mut self) -> Result<&'a [u8], CertificateError> {
        let content = self.expect(TAG_BIT_STRING)?;
        let (&unused, rest) = content
            .split_first()
            .ok_or_else(|| Self::malformed("empty bit string"))?;
        if unused > 7 {
            return Err(Self::malformed("invalid unused-bits count"));
        }
        Ok(rest)
    }

    /// Read an OID body.
    pub fn expect_oid(&mut self) -> Result<&'a [u8], CertificateError> {
        self.expect(TAG_OID)
    }

    /// Read an optional element with the given tag.
    pub fn read_optional(&mut self, tag: u8) -> Result<Option<&'a [u8]>, CertificateError> {
        if self.peek_tag() == Some(tag) {
            Ok(Some(self.expect(tag)?))
        } else {
            Ok(None)
        }
    }
}

/// Decode a named-bit BIT STRING content (unused octet already stripped by
/// the reader is NOT assumed here; pass the raw content) into a u16 bitset
/// with bit n set when named bit n is asserted.
pub fn decode_named_bits(content: &[u8]) -> Result<u16, CertificateError> {
    let (&unused, bytes) = content
        .split_first()
        .ok_or_else(|| CertificateError::MalformedDer("empty bit string".into()))?;
    if unused > 7 || (bytes.is_empty() && unused != 0) {
        return Err(CertificateError::MalformedDer(
            "invalid unused-bits count".into(),
        ));
    }
    let total_bits = bytes.len() * 8 - unused as usize;
    let mut out = 0u16;
    for bit in 0..total_bits.min(16) {
        if bytes[bit / 8] & (0x80 >> (bit % 8)) != 0 {
            out |= 1 << bit;
        }
    }
    Ok(out)
}

/// Encode a u16 named-bit set (bit n of the value = named bit n).
pub fn encode_named_bits(value: u16) -> Vec<u8> {
    let bits: Vec<bool> = (0..16).map(|i| value & (1 << i) != 0).collect();
    bit_string_named(&bits)
}
