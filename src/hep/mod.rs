//! HEP (Homer Encapsulation Protocol) envelope codec.
//!
//! HEPv3 is a TLV format: a `HEP3` magic, the total length, then a list of
//! chunks each carrying `vendor`, `type` and `length` (header included).
//! HEPv1/v2 are fixed binary headers; v2 adds a timestamp block.
use crate::sip::SipMessage;
use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::io::{Cursor, Read};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;


const HEP3_MAGIC: &[u8; 4] = b"HEP3";
const CHUNK_HEADER_LEN: u16 = 6;

const AF_INET: u8 = 2;
const AF_INET6: u8 = 10;

pub const PROTO_TYPE_SIP: u8 = 1;

mod chunk {
    pub const IP_FAMILY: u16 = 0x0001;
    pub const IP_PROTO: u16 = 0x0002;
    pub const SRC_IP4: u16 = 0x0003;
    pub const DST_IP4: u16 = 0x0004;
    pub const SRC_IP6: u16 = 0x0005;
    pub const DST_IP6: u16 = 0x0006;
    pub const SRC_PORT: u16 = 0x0007;
    pub const DST_PORT: u16 = 0x0008;
    pub const TS_SEC: u16 = 0x0009;
    pub const TS_USEC: u16 = 0x000a;
    pub const PROTO_TYPE: u16 = 0x000b;
    pub const CAPTURE_ID: u16 = 0x000c;
    pub const PAYLOAD: u16 = 0x000f;
    pub const COMPRESSED_PAYLOAD: u16 = 0x0010;
    pub const CORRELATION_ID: u16 = 0x0011;
}

#[derive(Debug, Error)]
pub enum HepError {
    #[error("packet too short")]
    Truncated(#[from] std::io::Error),
    #[error("unknown HEP version byte {0:#04x}")]
    UnknownVersion(u8),
    #[error("invalid HEP length {0}")]
    InvalidLength(u16),
    #[error("unsupported ip family {0}")]
    UnsupportedFamily(u8),
    #[error("compressed payloads are not supported")]
    CompressedPayload,
    #[error("missing payload chunk")]
    MissingPayload,
    #[error("packet too large: {0} bytes")]
    TooLarge(usize),
}

/// Failure turning raw bytes into a [`SipMessage`].
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unable to decode the HEP packet: {0}")]
    Hep(#[from] HepError),
    #[error("unsupported HEP payload type {0}")]
    UnsupportedPayload(u8),
    #[error("unable to parse the SIP message: {0}")]
    Sip(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct HepPacket {
    pub version: u8,
    pub ip_family: u8,
    pub ip_protocol: u8,
    pub src: (IpAddr, u16),
    pub dst: (IpAddr, u16),
    pub timestamp: Option<DateTime<Utc>>,
    pub capture_id: u32,
    pub proto_type: u8,
    pub correlation_id: Option<String>,
    pub payload: Bytes,
}

impl Default for HepPacket {
    fn default() -> Self {
        Self {
            version: 3,
            ip_family: AF_INET,
            ip_protocol: 17,
            src: (IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            dst: (IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            timestamp: None,
            capture_id: 0,
            proto_type: PROTO_TYPE_SIP,
            correlation_id: None,
            payload: Bytes::new(),
        }
    }
}

/// Decode a HEP packet and parse its payload as a SIP message.
pub fn decode_message(data: &[u8]) -> Result<SipMessage, DecodeError> {
    let packet = decode(data)?;
    if packet.proto_type != PROTO_TYPE_SIP {
        return Err(DecodeError::UnsupportedPayload(packet.proto_type));
    }
    let timestamp = packet.timestamp.unwrap_or_else(Utc::now);
    SipMessage::parse(&packet.payload, timestamp).map_err(|e| DecodeError::Sip(e.to_string()))
}

pub fn decode(data: &[u8]) -> Result<HepPacket, HepError> {
    if data.len() >= 4 && &data[..4] == HEP3_MAGIC {
        return decode_v3(data);
    }
    match data.first() {
        Some(version @ (1 | 2)) => decode_v2(*version, data),
        Some(other) => Err(HepError::UnknownVersion(*other)),
        None => Err(HepError::Truncated(std::io::ErrorKind::UnexpectedEof.into())),
    }
}

fn decode_v3(data: &[u8]) -> Result<HepPacket, HepError> {
    let total_len = Cursor::new(&data[4..]).read_u16::<BigEndian>()?;
    if (total_len as usize) > data.len() || total_len < 6 {
        return Err(HepError::InvalidLength(total_len));
    }
    let data = &data[..total_len as usize];
    let mut cursor = Cursor::new(data);
    cursor.set_position(6);

    let mut packet = HepPacket::default();
    let mut ts_sec = None;
    let mut ts_usec = 0u32;
    let mut payload = None;

    while (cursor.position() as usize) < data.len() {
        let vendor = cursor.read_u16::<BigEndian>()?;
        let kind = cursor.read_u16::<BigEndian>()?;
        let len = cursor.read_u16::<BigEndian>()?;
        if len < CHUNK_HEADER_LEN {
            return Err(HepError::InvalidLength(len));
        }
        let mut body = vec![0u8; (len - CHUNK_HEADER_LEN) as usize];
        cursor.read_exact(&mut body)?;
        if vendor != 0 {
            continue;
        }
        let mut reader = Cursor::new(body.as_slice());
        match kind {
            chunk::IP_FAMILY => packet.ip_family = reader.read_u8()?,
            chunk::IP_PROTO => packet.ip_protocol = reader.read_u8()?,
            chunk::SRC_IP4 => packet.src.0 = read_ipv4(&mut reader)?,
            chunk::DST_IP4 => packet.dst.0 = read_ipv4(&mut reader)?,
            chunk::SRC_IP6 => packet.src.0 = read_ipv6(&mut reader)?,
            chunk::DST_IP6 => packet.dst.0 = read_ipv6(&mut reader)?,
            chunk::SRC_PORT => packet.src.1 = reader.read_u16::<BigEndian>()?,
            chunk::DST_PORT => packet.dst.1 = reader.read_u16::<BigEndian>()?,
            chunk::TS_SEC => ts_sec = Some(reader.read_u32::<BigEndian>()?),
            chunk::TS_USEC => ts_usec = reader.read_u32::<BigEndian>()?,
            chunk::PROTO_TYPE => packet.proto_type = reader.read_u8()?,
            chunk::CAPTURE_ID => packet.capture_id = reader.read_u32::<BigEndian>()?,
            chunk::PAYLOAD => payload = Some(Bytes::from(body)),
            chunk::COMPRESSED_PAYLOAD => return Err(HepError::CompressedPayload),
            chunk::CORRELATION_ID => {
                packet.correlation_id = Some(String::from_utf8_lossy(&body).to_string())
            }
            _ => {}
        }
    }

    packet.timestamp = ts_sec.and_then(|sec| to_datetime(sec, ts_usec));
    packet.payload = payload.ok_or(HepError::MissingPayload)?;
    Ok(packet)
}

fn decode_v2(version: u8, data: &[u8]) -> Result<HepPacket, HepError> {
    let mut cursor = Cursor::new(data);
    cursor.read_u8()?;
    let header_len = cursor.read_u8()?;
    if header_len < 16 {
        return Err(HepError::InvalidLength(header_len as u16));
    }
    let ip_family = cursor.read_u8()?;
    let ip_protocol = cursor.read_u8()?;
    let src_port = cursor.read_u16::<BigEndian>()?;
    let dst_port = cursor.read_u16::<BigEndian>()?;
    let (src_ip, dst_ip) = match ip_family {
        AF_INET => (read_ipv4(&mut cursor)?, read_ipv4(&mut cursor)?),
        AF_INET6 => (read_ipv6(&mut cursor)?, read_ipv6(&mut cursor)?),
        other => return Err(HepError::UnsupportedFamily(other)),
    };

    let mut packet = HepPacket {
        version,
        ip_family,
        ip_protocol,
        src: (src_ip, src_port),
        dst: (dst_ip, dst_port),
        ..Default::default()
    };

    // the v2 time block is written in host byte order by capture agents
    if version == 2 {
        let ts_sec = cursor.read_u32::<LittleEndian>()?;
        let ts_usec = cursor.read_u32::<LittleEndian>()?;
        packet.capture_id = cursor.read_u16::<LittleEndian>()? as u32;
        let _pad = cursor.read_u16::<LittleEndian>()?;
        packet.timestamp = to_datetime(ts_sec, ts_usec);
    }

    let offset = cursor.position() as usize;
    if offset >= data.len() {
        return Err(HepError::MissingPayload);
    }
    packet.payload = Bytes::copy_from_slice(&data[offset..]);
    Ok(packet)
}

/// Encode a packet as HEPv3.
pub fn encode(packet: &HepPacket) -> Result<Vec<u8>, HepError> {
    let mut chunks = Vec::new();
    let (src_kind, dst_kind) = match packet.src.0 {
        IpAddr::V4(_) => (chunk::SRC_IP4, chunk::DST_IP4),
        IpAddr::V6(_) => (chunk::SRC_IP6, chunk::DST_IP6),
    };
    write_chunk(&mut chunks, chunk::IP_FAMILY, &[packet.ip_family])?;
    write_chunk(&mut chunks, chunk::IP_PROTO, &[packet.ip_protocol])?;
    write_chunk(&mut chunks, src_kind, &ip_octets(&packet.src.0))?;
    write_chunk(&mut chunks, dst_kind, &ip_octets(&packet.dst.0))?;
    write_chunk(&mut chunks, chunk::SRC_PORT, &packet.src.1.to_be_bytes())?;
    write_chunk(&mut chunks, chunk::DST_PORT, &packet.dst.1.to_be_bytes())?;
    if let Some(ts) = packet.timestamp {
        write_chunk(&mut chunks, chunk::TS_SEC, &(ts.timestamp() as u32).to_be_bytes())?;
        write_chunk(
            &mut chunks,
            chunk::TS_USEC,
            &ts.timestamp_subsec_micros().to_be_bytes(),
        )?;
    }
    write_chunk(&mut chunks, chunk::PROTO_TYPE, &[packet.proto_type])?;
    write_chunk(&mut chunks, chunk::CAPTURE_ID, &packet.capture_id.to_be_bytes())?;
    if let Some(correlation_id) = &packet.correlation_id {
        write_chunk(&mut chunks, chunk::CORRELATION_ID, correlation_id.as_bytes())?;
    }
    write_chunk(&mut chunks, chunk::PAYLOAD, &packet.payload)?;

    let total = chunks.len() + 6;
    let total_len = u16::try_from(total).map_err(|_| HepError::TooLarge(total))?;
    let mut buf = Vec::with_capacity(total);
    buf.extend_from_slice(HEP3_MAGIC);
    buf.extend_from_slice(&total_len.to_be_bytes());
    buf.extend_from_slice(&chunks);
    Ok(buf)
}

fn write_chunk(buf: &mut Vec<u8>, kind: u16, body: &[u8]) -> Result<(), HepError> {
    let len = body.len() + CHUNK_HEADER_LEN as usize;
    let chunk_len = u16::try_from(len).map_err(|_| HepError::TooLarge(len))?;
    buf.extend_from_slice(&0u16.to_be_bytes());
    buf.extend_from_slice(&kind.to_be_bytes());
    buf.extend_from_slice(&chunk_len.to_be_bytes());
    buf.extend_from_slice(body);
    Ok(())
}

fn ip_octets(ip: &IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(ip) => ip.octets().to_vec(),
        IpAddr::V6(ip) => ip.octets().to_vec(),
    }
}

fn read_ipv4(cursor: &mut Cursor<&[u8]>) -> std::io::Result<IpAddr> {
    let mut addr = [0u8; 4];
    cursor.read_exact(&mut addr)?;
    Ok(IpAddr::V4(Ipv4Addr::from(addr)))
}

fn read_ipv6(cursor: &mut Cursor<&[u8]>) -> std::io::Result<IpAddr> {
    let mut addr = [0u8; 16];
    cursor.read_exact(&mut addr)?;
    Ok(IpAddr::V6(Ipv6Addr::from(addr)))
}

fn to_datetime(sec: u32, usec: u32) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(sec as i64, usec.saturating_mul(1000))
}
