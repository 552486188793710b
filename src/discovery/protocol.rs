// HDHomeRun discovery wire format.
//
// One request and one reply frame, both with the same shape:
//
//   2 bytes  packet type (big-endian)
//   2 bytes  payload length (big-endian)
//   N bytes  payload TLVs (tag, 1-byte length, value)
//   4 bytes  CRC-32 over all prior bytes (big-endian)
//
// The CRC is the reflected IEEE polynomial (0xEDB88320), init and final XOR
// 0xFFFFFFFF. Frames with a bad CRC are silently discarded by the receiver.

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_32_ISO_HDLC};
use thiserror::Error;

/// Port HDHomeRun devices listen on for discovery probes.
pub const DEFAULT_DISCOVERY_PORT: u16 = 65001;

pub const PACKET_TYPE_DISCOVER_REQUEST: u16 = 0x0002;
pub const PACKET_TYPE_DISCOVER_REPLY: u16 = 0x0003;

pub const TAG_DEVICE_TYPE: u8 = 0x01;
pub const TAG_DEVICE_ID: u8 = 0x02;
pub const TAG_TUNER_COUNT: u8 = 0x10;
pub const TAG_BASE_URL: u8 = 0x2A;

pub const DEVICE_TYPE_TUNER: u32 = 0x0000_0001;
pub const DEVICE_ID_WILDCARD: u32 = 0xFFFF_FFFF;

pub const FRAME_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("datagram too short ({0} bytes)")]
    Truncated(usize),

    #[error("frame checksum mismatch")]
    BadCrc,

    #[error("unexpected packet type 0x{0:04X}")]
    UnexpectedType(u16),

    #[error("malformed TLV payload")]
    BadTlv,
}

/// Builds the broadcast probe: discover request for any tuner, any device id.
pub fn encode_discover_request() -> Bytes {
    let mut payload = BytesMut::with_capacity(12);
    payload.put_u8(TAG_DEVICE_TYPE);
    payload.put_u8(4);
    payload.put_u32(DEVICE_TYPE_TUNER);
    payload.put_u8(TAG_DEVICE_ID);
    payload.put_u8(4);
    payload.put_u32(DEVICE_ID_WILDCARD);

    frame(PACKET_TYPE_DISCOVER_REQUEST, &payload)
}

/// Builds a discover reply. The bridge only receives these, but scripted
/// tuners in tests (and the loopback path) need to produce them.
pub fn encode_discover_reply(
    device_id: u32,
    tuner_count: Option<u8>,
    base_url: Option<&str>,
) -> Bytes {
    let mut payload = BytesMut::with_capacity(32);
    payload.put_u8(TAG_DEVICE_TYPE);
    payload.put_u8(4);
    payload.put_u32(DEVICE_TYPE_TUNER);
    payload.put_u8(TAG_DEVICE_ID);
    payload.put_u8(4);
    payload.put_u32(device_id);
    if let Some(count) = tuner_count {
        payload.put_u8(TAG_TUNER_COUNT);
        payload.put_u8(1);
        payload.put_u8(count);
    }
    if let Some(url) = base_url {
        let bytes = url.as_bytes();
        debug_assert!(bytes.len() <= u8::MAX as usize);
        payload.put_u8(TAG_BASE_URL);
        payload.put_u8(bytes.len() as u8);
        payload.put_slice(bytes);
    }

    frame(PACKET_TYPE_DISCOVER_REPLY, &payload)
}

fn frame(packet_type: u16, payload: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(payload.len() + 8);
    frame.put_u16(packet_type);
    frame.put_u16(payload.len() as u16);
    frame.put_slice(payload);
    let crc = FRAME_CRC.checksum(&frame);
    frame.put_u32(crc);
    frame.freeze()
}

/// Parsed discover reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoverReply {
    pub device_type: u32,
    pub device_id: u32,
    pub tuner_count: Option<u8>,
    pub base_url: Option<String>,
}

impl DiscoverReply {
    pub fn is_tuner(&self) -> bool {
        self.device_type == DEVICE_TYPE_TUNER
    }
}

/// Parses and validates a reply datagram. CRC failures come back as
/// [`ProtocolError::BadCrc`]; the receive loop drops those silently.
pub fn parse_reply(datagram: &[u8]) -> Result<DiscoverReply, ProtocolError> {
    if datagram.len() < 8 {
        return Err(ProtocolError::Truncated(datagram.len()));
    }
    let crc_offset = datagram.len() - 4;
    let advertised = BigEndian::read_u32(&datagram[crc_offset..]);
    if FRAME_CRC.checksum(&datagram[..crc_offset]) != advertised {
        return Err(ProtocolError::BadCrc);
    }

    let packet_type = BigEndian::read_u16(&datagram[0..2]);
    if packet_type != PACKET_TYPE_DISCOVER_REPLY {
        return Err(ProtocolError::UnexpectedType(packet_type));
    }
    let payload_len = BigEndian::read_u16(&datagram[2..4]) as usize;
    if 4 + payload_len != crc_offset {
        return Err(ProtocolError::BadTlv);
    }

    let mut device_type = None;
    let mut device_id = None;
    let mut tuner_count = None;
    let mut base_url = None;

    let payload = &datagram[4..crc_offset];
    let mut offset = 0;
    while offset < payload.len() {
        if offset + 2 > payload.len() {
            return Err(ProtocolError::BadTlv);
        }
        let tag = payload[offset];
        let len = payload[offset + 1] as usize;
        offset += 2;
        if offset + len > payload.len() {
            return Err(ProtocolError::BadTlv);
        }
        let value = &payload[offset..offset + len];
        offset += len;

        match tag {
            TAG_DEVICE_TYPE if len == 4 => device_type = Some(BigEndian::read_u32(value)),
            TAG_DEVICE_ID if len == 4 => device_id = Some(BigEndian::read_u32(value)),
            TAG_TUNER_COUNT if len == 1 => tuner_count = Some(value[0]),
            TAG_BASE_URL => base_url = Some(String::from_utf8_lossy(value).into_owned()),
            // unknown tags are legal and skipped
            _ => {}
        }
    }

    match (device_type, device_id) {
        (Some(device_type), Some(device_id)) => Ok(DiscoverReply {
            device_type,
            device_id,
            tuner_count,
            base_url,
        }),
        _ => Err(ProtocolError::BadTlv),
    }
}
