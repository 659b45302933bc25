//! Binary layout of all ULDP frames. All integers are little endian, IP addresses are in network
//!  byte order.
//!
//! Handshake (client → server, then server → client):
//! ```ascii
//! HELLO:             magic "ULDP" (u32) | min version (u16) | max version (u16)
//! VERSION ANSWER:    error code (i16) | negotiated version (i16)
//! NEGOTIATE REQUEST: [v3 only: domain length (u16) | domain bytes] | flags (u32) | reserved 0 (u32)
//! NEGOTIATE ANSWER:  flags low (u32) | flags high (u32)
//! ```
//!
//! Session frames start with the message magic `0xcafe` (u16) and the frame type (u16):
//! ```ascii
//! LOG MESSAGE:   see [frame_header::LogFrameHeader], followed by the message payload
//! FLUSH REQUEST: no body
//! FLUSH ACK:     ack sequence high (u32) | ack sequence low (u32)
//! ```

pub mod frame_header;
pub mod origin;
pub mod timestamp;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::error::UldpError;
use crate::safe_converter::PrecheckedCast;
use crate::sequence::SequenceId;

pub const HELLO_MAGIC: u32 = 0x5044_4c55; // "ULDP"
pub const MESSAGE_MAGIC: u16 = 0xcafe;

pub const MIN_VERSION: u16 = 1;
pub const MAX_VERSION: u16 = 3;

pub const FRAME_TYPE_LOG_MESSAGE: u16 = 0x1;
pub const FRAME_TYPE_FLUSH_REQUEST: u16 = 0x2;
pub const FRAME_TYPE_FLUSH_ACK: u16 = 0x3;

pub const LOG_TYPE_SYSLOG: u32 = 0x1;
pub const LOG_TYPE_WINSNARE: u32 = 0x3;

pub const ELEMENT_RAW_DATASTRING: u16 = 0x0;
pub const ELEMENT_ORIGIN_DATE: u16 = 0x1;

pub const SESSION_FLAG_COMPRESSED: u32 = 0x1;

/// A protocol version both sides agreed on, guaranteed to be in `MIN_VERSION..=MAX_VERSION`
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct ProtocolVersion(u16);

impl ProtocolVersion {
    pub fn try_from_raw(raw: u16) -> Result<ProtocolVersion, UldpError> {
        if !(MIN_VERSION..=MAX_VERSION).contains(&raw) {
            return Err(UldpError::protocol(format!("negotiated version is not supported: {}", raw)));
        }
        Ok(ProtocolVersion(raw))
    }

    pub fn raw(&self) -> u16 {
        self.0
    }

    /// version 3 sends IPv6 origin addresses and the collector domain
    pub fn has_ipv6_origin(&self) -> bool {
        self.0 >= 3
    }

    pub fn has_collector_domain(&self) -> bool {
        self.0 >= 3
    }

    pub fn origin_address_len(&self) -> usize {
        if self.has_ipv6_origin() { 16 } else { 4 }
    }
}

pub fn encode_hello(min_version: u16, max_version: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u32_le(HELLO_MAGIC);
    buf.put_u16_le(min_version);
    buf.put_u16_le(max_version);
    buf.freeze()
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VersionAnswer {
    pub error_code: i16,
    pub version: i16,
}
impl VersionAnswer {
    pub const SERIALIZED_LEN: usize = 4;
}

/// Returns `None` if the version answer is not complete yet. On success, the answer's bytes are
///  consumed from `buf`.
pub fn decode_version_answer(buf: &mut BytesMut) -> Result<Option<(VersionAnswer, ProtocolVersion)>, UldpError> {
    if buf.len() < VersionAnswer::SERIALIZED_LEN {
        return Ok(None);
    }
    let answer = VersionAnswer {
        error_code: buf.get_i16_le(),
        version: buf.get_i16_le(),
    };
    trace!("received version answer {:?}", answer);

    if answer.error_code != 0 {
        return Err(UldpError::protocol(format!("error returned by ULDP server during version negotiation: {}", answer.error_code)));
    }
    let version = u16::try_from(answer.version)
        .map_err(|_| UldpError::protocol(format!("negotiated version is not supported: {}", answer.version)))
        .and_then(ProtocolVersion::try_from_raw)?;
    Ok(Some((answer, version)))
}

pub fn encode_negotiate_request(version: ProtocolVersion, collector_domain: &[u8], compression_requested: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + 2 + collector_domain.len());
    if version.has_collector_domain() {
        buf.put_u16_le(collector_domain.len().prechecked_cast());
        buf.put_slice(collector_domain);
    }

    let flags = if compression_requested { SESSION_FLAG_COMPRESSED } else { 0 };
    buf.put_u32_le(flags);
    buf.put_u32_le(0); // reserved
    buf.freeze()
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NegotiateAnswer {
    pub flags_low: u32,
    pub flags_high: u32,
}
impl NegotiateAnswer {
    pub const SERIALIZED_LEN: usize = 8;

    pub fn is_compressed(&self) -> bool {
        self.flags_low & SESSION_FLAG_COMPRESSED != 0
    }
}

/// Returns `None` if the negotiate answer is not complete yet. Fails if compression was requested
///  but the peer did not grant it.
pub fn decode_negotiate_answer(buf: &mut BytesMut, compression_requested: bool) -> Result<Option<NegotiateAnswer>, UldpError> {
    if buf.len() < NegotiateAnswer::SERIALIZED_LEN {
        return Ok(None);
    }
    let answer = NegotiateAnswer {
        flags_low: buf.get_u32_le(),
        flags_high: buf.get_u32_le(),
    };
    trace!("received negotiate answer {:?}", answer);

    if compression_requested && !answer.is_compressed() {
        return Err(UldpError::protocol("compression flag not honored by peer"));
    }
    Ok(Some(answer))
}

pub fn encode_flush_request() -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u16_le(MESSAGE_MAGIC);
    buf.put_u16_le(FRAME_TYPE_FLUSH_REQUEST);
    buf.freeze()
}

pub const FLUSH_ACK_LEN: usize = 2 * size_of::<u16>() + SequenceId::SERIALIZED_LEN;

/// Decodes all complete flush ack frames in `buf`, leaving an incomplete trailing frame in place.
///  A malformed frame results in an `Err` entry for that frame, and decoding continues with the
///  next one.
pub fn decode_flush_ack_stream(buf: &mut BytesMut) -> Vec<Result<SequenceId, UldpError>> {
    let mut result = Vec::new();

    while buf.len() >= FLUSH_ACK_LEN {
        let mut frame = buf.split_to(FLUSH_ACK_LEN);
        let magic = frame.get_u16_le();
        let frame_type = frame.get_u16_le();

        if magic != MESSAGE_MAGIC {
            result.push(Err(UldpError::protocol(format!("unexpected message magic: {:#06x}", magic))));
            continue;
        }
        if frame_type != FRAME_TYPE_FLUSH_ACK {
            result.push(Err(UldpError::protocol(format!("unexpected frame type instead of FLUSH_ACK: {}", frame_type))));
            continue;
        }
        result.push(SequenceId::deser(&mut frame));
    }
    result
}
