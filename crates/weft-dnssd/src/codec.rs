//! DNS message codec
//!
//! Wire format:
//! - 12-byte header (transaction id, flags, four section counts)
//! - queries: QNAME, QTYPE, QCLASS
//! - records: NAME, TYPE, CLASS, TTL, RDLENGTH, RDATA
//!
//! Names are encoded without compression; decoding follows compression
//! pointers. Messages larger than the multicast budget are split into a
//! TC-flagged head plus continuation messages sharing the transaction id.

use bytes::{Buf, BufMut, BytesMut};
use std::net::{Ipv4Addr, Ipv6Addr};
use thiserror::Error;

/// Largest payload sent in a single multicast datagram.
pub const MAX_MDNS_MESSAGE_SIZE: usize = 1232;

const FLAG_RESPONSE: u16 = 0x8000;
const FLAG_AUTHORITATIVE: u16 = 0x0400;
const FLAG_TRUNCATED: u16 = 0x0200;

const CLASS_IN: u16 = 0x0001;
const CLASS_TOP_BIT: u16 = 0x8000;

/// DNS codec errors
#[derive(Debug, Error)]
pub enum DnsCodecError {
    #[error("unexpected end of message")]
    UnexpectedEnd,
    #[error("name compression loop")]
    CompressionLoop,
    #[error("label exceeds 63 bytes")]
    LabelTooLong,
    #[error("invalid label encoding")]
    InvalidLabel,
    #[error("unknown record type: {0}")]
    UnknownRecordType(u16),
    #[error("record data length mismatch")]
    BadRecordLength,
}

/// Resource record types used by DNS-SD.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum RecordType {
    A = 1,
    Ptr = 12,
    Txt = 16,
    Aaaa = 28,
    Srv = 33,
    Any = 255,
}

impl TryFrom<u16> for RecordType {
    type Error = DnsCodecError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::A),
            12 => Ok(Self::Ptr),
            16 => Ok(Self::Txt),
            28 => Ok(Self::Aaaa),
            33 => Ok(Self::Srv),
            255 => Ok(Self::Any),
            other => Err(DnsCodecError::UnknownRecordType(other)),
        }
    }
}

/// A question-section entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DnsQuery {
    pub name: String,
    pub record_type: RecordType,
    pub unicast_response: bool,
}

impl DnsQuery {
    pub fn new(name: impl Into<String>, record_type: RecordType) -> Self {
        Self {
            name: name.into(),
            record_type,
            unicast_response: false,
        }
    }
}

/// Typed record payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordValue {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Ptr(String),
    Srv {
        priority: u16,
        weight: u16,
        port: u16,
        target: String,
    },
    Txt(Vec<String>),
}

impl RecordValue {
    pub fn record_type(&self) -> RecordType {
        match self {
            RecordValue::A(_) => RecordType::A,
            RecordValue::Aaaa(_) => RecordType::Aaaa,
            RecordValue::Ptr(_) => RecordType::Ptr,
            RecordValue::Srv { .. } => RecordType::Srv,
            RecordValue::Txt(_) => RecordType::Txt,
        }
    }
}

/// A resource record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DnsRecord {
    pub name: String,
    pub ttl: u32,
    pub cache_flush: bool,
    pub value: RecordValue,
}

impl DnsRecord {
    pub fn new(name: impl Into<String>, ttl: u32, value: RecordValue) -> Self {
        Self {
            name: name.into(),
            ttl,
            cache_flush: false,
            value,
        }
    }

    pub fn record_type(&self) -> RecordType {
        self.value.record_type()
    }

    /// The same record announced with TTL zero.
    pub fn into_goodbye(mut self) -> Self {
        self.ttl = 0;
        self
    }
}

/// A full DNS message.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DnsMessage {
    pub transaction_id: u16,
    pub is_response: bool,
    pub authoritative: bool,
    pub truncated: bool,
    pub queries: Vec<DnsQuery>,
    pub answers: Vec<DnsRecord>,
    pub authorities: Vec<DnsRecord>,
    pub additionals: Vec<DnsRecord>,
}

impl DnsMessage {
    /// An empty authoritative response.
    pub fn response(transaction_id: u16) -> Self {
        Self {
            transaction_id,
            is_response: true,
            authoritative: true,
            ..Self::default()
        }
    }

    /// An empty query.
    pub fn query(transaction_id: u16) -> Self {
        Self {
            transaction_id,
            ..Self::default()
        }
    }
}

// =============================================================================
// ENCODER
// =============================================================================

fn encode_name(name: &str, buf: &mut BytesMut) -> Result<(), DnsCodecError> {
    for label in name.split('.') {
        if label.is_empty() {
            continue;
        }
        if label.len() > 63 {
            return Err(DnsCodecError::LabelTooLong);
        }
        buf.put_u8(label.len() as u8);
        buf.put_slice(label.as_bytes());
    }
    buf.put_u8(0);
    Ok(())
}

fn encode_record(record: &DnsRecord, buf: &mut BytesMut) -> Result<(), DnsCodecError> {
    encode_name(&record.name, buf)?;
    buf.put_u16(record.record_type() as u16);
    let class = if record.cache_flush {
        CLASS_IN | CLASS_TOP_BIT
    } else {
        CLASS_IN
    };
    buf.put_u16(class);
    buf.put_u32(record.ttl);

    let mut rdata = BytesMut::new();
    match &record.value {
        RecordValue::A(addr) => rdata.put_slice(&addr.octets()),
        RecordValue::Aaaa(addr) => rdata.put_slice(&addr.octets()),
        RecordValue::Ptr(target) => encode_name(target, &mut rdata)?,
        RecordValue::Srv {
            priority,
            weight,
            port,
            target,
        } => {
            rdata.put_u16(*priority);
            rdata.put_u16(*weight);
            rdata.put_u16(*port);
            encode_name(target, &mut rdata)?;
        }
        RecordValue::Txt(entries) => {
            if entries.is_empty() {
                rdata.put_u8(0);
            }
            for entry in entries {
                if entry.len() > 255 {
                    return Err(DnsCodecError::LabelTooLong);
                }
                rdata.put_u8(entry.len() as u8);
                rdata.put_slice(entry.as_bytes());
            }
        }
    }
    buf.put_u16(rdata.len() as u16);
    buf.put_slice(&rdata);
    Ok(())
}

/// Encode a message into a single datagram, ignoring the size budget.
pub fn encode(message: &DnsMessage) -> Result<Vec<u8>, DnsCodecError> {
    let mut buf = BytesMut::with_capacity(512);
    buf.put_u16(message.transaction_id);
    let mut flags = 0u16;
    if message.is_response {
        flags |= FLAG_RESPONSE;
    }
    if message.authoritative {
        flags |= FLAG_AUTHORITATIVE;
    }
    if message.truncated {
        flags |= FLAG_TRUNCATED;
    }
    buf.put_u16(flags);
    buf.put_u16(message.queries.len() as u16);
    buf.put_u16(message.answers.len() as u16);
    buf.put_u16(message.authorities.len() as u16);
    buf.put_u16(message.additionals.len() as u16);

    for query in &message.queries {
        encode_name(&query.name, &mut buf)?;
        buf.put_u16(query.record_type as u16);
        let class = if query.unicast_response {
            CLASS_IN | CLASS_TOP_BIT
        } else {
            CLASS_IN
        };
        buf.put_u16(class);
    }
    for record in &message.answers {
        encode_record(record, &mut buf)?;
    }
    for record in &message.authorities {
        encode_record(record, &mut buf)?;
    }
    for record in &message.additionals {
        encode_record(record, &mut buf)?;
    }
    Ok(buf.to_vec())
}

/// Encode a message, splitting into a TC-flagged head plus continuation
/// messages when the single-datagram budget is exceeded. Continuations
/// carry the same transaction id, an empty question section and the
/// remaining answers; additionals ride on the final message.
pub fn encode_with_truncation(message: &DnsMessage) -> Result<Vec<Vec<u8>>, DnsCodecError> {
    let whole = encode(message)?;
    if whole.len() <= MAX_MDNS_MESSAGE_SIZE {
        return Ok(vec![whole]);
    }

    let mut datagrams = Vec::new();
    let mut remaining: Vec<DnsRecord> = message.answers.clone();
    let mut first = true;

    while !remaining.is_empty() || first {
        let mut chunk = DnsMessage {
            transaction_id: message.transaction_id,
            is_response: message.is_response,
            authoritative: message.authoritative,
            truncated: false,
            queries: if first {
                message.queries.clone()
            } else {
                Vec::new()
            },
            answers: Vec::new(),
            authorities: Vec::new(),
            additionals: Vec::new(),
        };

        // Fill with answers while the encoding stays within budget. A
        // single oversized record still goes out alone rather than looping.
        while let Some(record) = remaining.first() {
            chunk.answers.push(record.clone());
            if encode(&chunk)?.len() > MAX_MDNS_MESSAGE_SIZE && !chunk.answers.is_empty() {
                if chunk.answers.len() == 1 {
                    remaining.remove(0);
                } else {
                    chunk.answers.pop();
                }
                break;
            }
            remaining.remove(0);
        }

        if remaining.is_empty() {
            chunk.authorities = message.authorities.clone();
            chunk.additionals = message.additionals.clone();
        } else {
            chunk.truncated = true;
        }
        datagrams.push(encode(&chunk)?);
        first = false;
    }
    Ok(datagrams)
}

/// Merge a continuation message into a TC-flagged head.
pub fn merge_continuation(head: &mut DnsMessage, continuation: DnsMessage) {
    head.answers.extend(continuation.answers);
    head.authorities.extend(continuation.authorities);
    head.additionals.extend(continuation.additionals);
    head.truncated = continuation.truncated;
}

// =============================================================================
// DECODER
// =============================================================================

fn decode_name(data: &[u8], pos: &mut usize) -> Result<String, DnsCodecError> {
    let mut labels: Vec<String> = Vec::new();
    let mut cursor = *pos;
    let mut jumped = false;
    let mut hops = 0;

    loop {
        let len = *data.get(cursor).ok_or(DnsCodecError::UnexpectedEnd)? as usize;
        if len & 0xC0 == 0xC0 {
            // Compression pointer.
            let low = *data.get(cursor + 1).ok_or(DnsCodecError::UnexpectedEnd)? as usize;
            let target = ((len & 0x3F) << 8) | low;
            if !jumped {
                *pos = cursor + 2;
                jumped = true;
            }
            hops += 1;
            if hops > 16 {
                return Err(DnsCodecError::CompressionLoop);
            }
            cursor = target;
            continue;
        }
        if len & 0xC0 != 0 {
            return Err(DnsCodecError::InvalidLabel);
        }
        if len == 0 {
            if !jumped {
                *pos = cursor + 1;
            }
            break;
        }
        let start = cursor + 1;
        let end = start + len;
        let label = data.get(start..end).ok_or(DnsCodecError::UnexpectedEnd)?;
        labels.push(String::from_utf8_lossy(label).into_owned());
        cursor = end;
    }
    Ok(labels.join("."))
}

fn decode_record(data: &[u8], pos: &mut usize) -> Result<DnsRecord, DnsCodecError> {
    let name = decode_name(data, pos)?;
    let mut rest = data.get(*pos..).ok_or(DnsCodecError::UnexpectedEnd)?;
    if rest.remaining() < 10 {
        return Err(DnsCodecError::UnexpectedEnd);
    }
    let record_type = RecordType::try_from(rest.get_u16())?;
    let class = rest.get_u16();
    let ttl = rest.get_u32();
    let rdlength = rest.get_u16() as usize;
    *pos += 10;

    let rdata_start = *pos;
    let rdata_end = rdata_start + rdlength;
    let rdata = data
        .get(rdata_start..rdata_end)
        .ok_or(DnsCodecError::UnexpectedEnd)?;
    *pos = rdata_end;

    let value = match record_type {
        RecordType::A => {
            let octets: [u8; 4] = rdata.try_into().map_err(|_| DnsCodecError::BadRecordLength)?;
            RecordValue::A(Ipv4Addr::from(octets))
        }
        RecordType::Aaaa => {
            let octets: [u8; 16] =
                rdata.try_into().map_err(|_| DnsCodecError::BadRecordLength)?;
            RecordValue::Aaaa(Ipv6Addr::from(octets))
        }
        RecordType::Ptr => {
            let mut rdata_pos = rdata_start;
            RecordValue::Ptr(decode_name(data, &mut rdata_pos)?)
        }
        RecordType::Srv => {
            if rdata.len() < 6 {
                return Err(DnsCodecError::BadRecordLength);
            }
            let mut fixed = rdata;
            let priority = fixed.get_u16();
            let weight = fixed.get_u16();
            let port = fixed.get_u16();
            let mut target_pos = rdata_start + 6;
            RecordValue::Srv {
                priority,
                weight,
                port,
                target: decode_name(data, &mut target_pos)?,
            }
        }
        RecordType::Txt => {
            let mut entries = Vec::new();
            let mut txt = rdata;
            while txt.has_remaining() {
                let len = txt.get_u8() as usize;
                if txt.remaining() < len {
                    return Err(DnsCodecError::BadRecordLength);
                }
                if len > 0 {
                    let mut entry = vec![0u8; len];
                    txt.copy_to_slice(&mut entry);
                    entries.push(String::from_utf8_lossy(&entry).into_owned());
                }
            }
            RecordValue::Txt(entries)
        }
        RecordType::Any => return Err(DnsCodecError::UnknownRecordType(255)),
    };

    Ok(DnsRecord {
        name,
        ttl,
        cache_flush: class & CLASS_TOP_BIT != 0,
        value,
    })
}

/// Decode a single DNS datagram.
pub fn decode(data: &[u8]) -> Result<DnsMessage, DnsCodecError> {
    let mut header = data;
    if header.remaining() < 12 {
        return Err(DnsCodecError::UnexpectedEnd);
    }
    let transaction_id = header.get_u16();
    let flags = header.get_u16();
    let query_count = header.get_u16();
    let answer_count = header.get_u16();
    let authority_count = header.get_u16();
    let additional_count = header.get_u16();

    let mut pos = 12usize;
    let mut queries = Vec::with_capacity(query_count as usize);
    for _ in 0..query_count {
        let name = decode_name(data, &mut pos)?;
        let mut rest = data.get(pos..).ok_or(DnsCodecError::UnexpectedEnd)?;
        if rest.remaining() < 4 {
            return Err(DnsCodecError::UnexpectedEnd);
        }
        let record_type = RecordType::try_from(rest.get_u16())?;
        let class = rest.get_u16();
        pos += 4;
        queries.push(DnsQuery {
            name,
            record_type,
            unicast_response: class & CLASS_TOP_BIT != 0,
        });
    }

    let mut read_records = |count: u16, pos: &mut usize| -> Result<Vec<DnsRecord>, DnsCodecError> {
        let mut records = Vec::with_capacity(count as usize);
        for _ in 0..count {
            records.push(decode_record(data, pos)?);
        }
        Ok(records)
    };

    let answers = read_records(answer_count, &mut pos)?;
    let authorities = read_records(authority_count, &mut pos)?;
    let additionals = read_records(additional_count, &mut pos)?;

    Ok(DnsMessage {
        transaction_id,
        is_response: flags & FLAG_RESPONSE != 0,
        authoritative: flags & FLAG_AUTHORITATIVE != 0,
        truncated: flags & FLAG_TRUNCATED != 0,
        queries,
        answers,
        authorities,
        additionals,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message() -> DnsMessage {
        let mut message = DnsMessage::response(0x1234);
        message.answers.push(DnsRecord::new(
            "_matter._tcp.local",
            120,
            RecordValue::Ptr("0000000000000018-0000000000000001._matter._tcp.local".into()),
        ));
        message.answers.push(DnsRecord::new(
            "0000000000000018-0000000000000001._matter._tcp.local",
            120,
            RecordValue::Srv {
                priority: 0,
                weight: 0,
                port: 5540,
                target: "00B0D063C2260000.local".into(),
            },
        ));
        message.answers.push(DnsRecord::new(
            "0000000000000018-0000000000000001._matter._tcp.local",
            120,
            RecordValue::Txt(vec!["SII=500".into(), "SAI=300".into()]),
        ));
        message.additionals.push(DnsRecord::new(
            "00B0D063C2260000.local",
            120,
            RecordValue::Aaaa("fe80::e777:4f5e:c61e:7314".parse().unwrap()),
        ));
        message
    }

    #[test]
    fn test_roundtrip() {
        let message = sample_message();
        let decoded = decode(&encode(&message).unwrap()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_query_roundtrip() {
        let mut message = DnsMessage::query(7);
        message
            .queries
            .push(DnsQuery::new("_matterc._udp.local", RecordType::Ptr));
        message.queries.push(DnsQuery {
            name: "_I0000000000000018._sub._matter._tcp.local".into(),
            record_type: RecordType::Ptr,
            unicast_response: true,
        });

        let decoded = decode(&encode(&message).unwrap()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_cache_flush_bit() {
        let mut message = DnsMessage::response(1);
        let mut record = DnsRecord::new("host.local", 120, RecordValue::A(Ipv4Addr::new(192, 168, 1, 5)));
        record.cache_flush = true;
        message.answers.push(record);

        let decoded = decode(&encode(&message).unwrap()).unwrap();
        assert!(decoded.answers[0].cache_flush);
    }

    #[test]
    fn test_compression_pointer_decode() {
        // Hand-built message: one PTR answer whose rdata points back at the
        // name at offset 12.
        let mut buf = BytesMut::new();
        buf.put_u16(0x0001); // id
        buf.put_u16(FLAG_RESPONSE);
        buf.put_u16(0); // queries
        buf.put_u16(1); // answers
        buf.put_u16(0);
        buf.put_u16(0);
        // name: "a.local"
        buf.put_u8(1);
        buf.put_slice(b"a");
        buf.put_u8(5);
        buf.put_slice(b"local");
        buf.put_u8(0);
        buf.put_u16(RecordType::Ptr as u16);
        buf.put_u16(CLASS_IN);
        buf.put_u32(120);
        buf.put_u16(2); // rdlength: pointer
        buf.put_u8(0xC0);
        buf.put_u8(12);

        let decoded = decode(&buf).unwrap();
        assert_eq!(decoded.answers[0].name, "a.local");
        assert_eq!(decoded.answers[0].value, RecordValue::Ptr("a.local".into()));
    }

    #[test]
    fn test_truncation_split_and_merge() {
        let mut message = DnsMessage::response(0x77);
        for i in 0..60 {
            message.answers.push(DnsRecord::new(
                format!("instance-{i:04}._matterc._udp.local"),
                120,
                RecordValue::Txt(vec![
                    "VP=65521+32768".into(),
                    "D=3840".into(),
                    "CM=1".into(),
                    "PH=33".into(),
                    format!("DN=Device number {i}"),
                ]),
            ));
        }
        message.additionals.push(DnsRecord::new(
            "host.local",
            120,
            RecordValue::A(Ipv4Addr::new(10, 0, 0, 1)),
        ));

        let datagrams = encode_with_truncation(&message).unwrap();
        assert!(datagrams.len() > 1);
        for datagram in &datagrams {
            assert!(datagram.len() <= MAX_MDNS_MESSAGE_SIZE);
        }

        // All but the last carry the TC flag; merge restores the message.
        let mut merged = decode(&datagrams[0]).unwrap();
        assert!(merged.truncated);
        assert_eq!(merged.transaction_id, 0x77);
        for datagram in &datagrams[1..] {
            let continuation = decode(datagram).unwrap();
            assert_eq!(continuation.transaction_id, 0x77);
            assert!(continuation.queries.is_empty());
            merge_continuation(&mut merged, continuation);
        }
        assert!(!merged.truncated);
        assert_eq!(merged.answers, message.answers);
        assert_eq!(merged.additionals, message.additionals);
    }

    #[test]
    fn test_compression_loop_detected() {
        let mut buf = BytesMut::new();
        buf.put_u16(1);
        buf.put_u16(FLAG_RESPONSE);
        buf.put_u16(1);
        buf.put_u16(0);
        buf.put_u16(0);
        buf.put_u16(0);
        // A name that points at itself.
        buf.put_u8(0xC0);
        buf.put_u8(12);
        buf.put_u16(RecordType::Ptr as u16);
        buf.put_u16(CLASS_IN);
        assert!(matches!(
            decode(&buf),
            Err(DnsCodecError::CompressionLoop)
        ));
    }

    #[test]
    fn test_empty_txt() {
        let mut message = DnsMessage::response(2);
        message.answers.push(DnsRecord::new(
            "x.local",
            120,
            RecordValue::Txt(Vec::new()),
        ));
        let decoded = decode(&encode(&message).unwrap()).unwrap();
        assert_eq!(decoded.answers[0].value, RecordValue::Txt(Vec::new()));
    }
}
