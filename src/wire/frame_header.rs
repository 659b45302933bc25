use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::UldpError;
use crate::log_message::LogMessage;
use crate::safe_converter::PrecheckedCast;
use crate::sequence::SequenceId;
use crate::wire::timestamp::WireTimestamp;
use crate::wire::{ProtocolVersion, FRAME_TYPE_LOG_MESSAGE, MESSAGE_MAGIC};

/// Header of a log message frame. The payload follows immediately, there is never any padding
///  between header and payload.
///
/// ```ascii
///  0: message magic 0xcafe (u16)
///  2: frame type LOG_MESSAGE (u16)
///  4: flags (u16), always 0
///  6: timestamp (10 bytes, see [WireTimestamp])
/// 16: origin address: 4 bytes (v1, v2) or 16 bytes (v3), network byte order
///  *: sequence high (u32)
///  *: sequence low (u32)
///  *: log type (u32)
///  *: payload length (u32)
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LogFrameHeader {
    pub flags: u16,
    pub timestamp: WireTimestamp,
    pub origin: IpAddr,
    pub sequence: SequenceId,
    pub log_type: u32,
    pub payload_len: u32,
}

impl LogFrameHeader {
    pub fn serialized_len(version: ProtocolVersion) -> usize {
        3 * size_of::<u16>()
            + WireTimestamp::SERIALIZED_LEN
            + version.origin_address_len()
            + SequenceId::SERIALIZED_LEN
            + 2 * size_of::<u32>()
    }

    pub fn for_message(version: ProtocolVersion, local_addr: IpAddr, sequence: SequenceId, message: &LogMessage) -> LogFrameHeader {
        LogFrameHeader {
            flags: 0,
            timestamp: WireTimestamp::from_date_time(message.timestamp()),
            origin: message.origin().wire_addr(version, local_addr),
            sequence,
            log_type: message.log_type(),
            payload_len: message.encoded_len().prechecked_cast(),
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(MESSAGE_MAGIC);
        buf.put_u16_le(FRAME_TYPE_LOG_MESSAGE);
        buf.put_u16_le(self.flags);
        self.timestamp.ser(buf);
        match self.origin {
            IpAddr::V4(v4) => buf.put_slice(&v4.octets()),
            IpAddr::V6(v6) => buf.put_slice(&v6.octets()),
        }
        self.sequence.ser(buf);
        buf.put_u32_le(self.log_type);
        buf.put_u32_le(self.payload_len);
    }

    pub fn deser(buf: &mut impl Buf, version: ProtocolVersion) -> Result<LogFrameHeader, UldpError> {
        let magic = buf.try_get_u16_le()?;
        if magic != MESSAGE_MAGIC {
            return Err(UldpError::protocol(format!("unexpected message magic: {:#06x}", magic)));
        }
        let frame_type = buf.try_get_u16_le()?;
        if frame_type != FRAME_TYPE_LOG_MESSAGE {
            return Err(UldpError::protocol(format!("expected a log message frame, was frame type {}", frame_type)));
        }
        let flags = buf.try_get_u16_le()?;
        let timestamp = WireTimestamp::deser(buf)?;
        let origin = if version.has_ipv6_origin() {
            IpAddr::V6(Ipv6Addr::from(buf.try_get_u128()?))
        }
        else {
            IpAddr::V4(Ipv4Addr::from(buf.try_get_u32()?))
        };
        let sequence = SequenceId::deser(buf)?;
        let log_type = buf.try_get_u32_le()?;
        let payload_len = buf.try_get_u32_le()?;

        Ok(LogFrameHeader {
            flags,
            timestamp,
            origin,
            sequence,
            log_type,
            payload_len,
        })
    }
}

/// Encodes log message frames for one negotiated session. The frame length is exactly the
///  header length for the negotiated version plus the message's payload length.
#[derive(Clone, Debug)]
pub struct FrameEncoder {
    version: ProtocolVersion,
    local_addr: IpAddr,
}

impl FrameEncoder {
    pub fn new(version: ProtocolVersion, local_addr: IpAddr) -> FrameEncoder {
        FrameEncoder { version, local_addr }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn frame_len(&self, message: &LogMessage) -> usize {
        LogFrameHeader::serialized_len(self.version) + message.encoded_len()
    }

    pub fn encode_log_message_frame(&self, sequence: SequenceId, message: &LogMessage) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.frame_len(message));
        LogFrameHeader::for_message(self.version, self.local_addr, sequence, message)
            .ser(&mut buf);
        message.put_payload(&mut buf);

        debug_assert_eq!(buf.len(), self.frame_len(message));
        buf.freeze()
    }
}
