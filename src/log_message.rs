use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, FixedOffset};

use crate::safe_converter::PrecheckedCast;
use crate::wire::origin::OriginAddress;
use crate::wire::timestamp::WireTimestamp;
use crate::wire::{ELEMENT_ORIGIN_DATE, ELEMENT_RAW_DATASTRING, LOG_TYPE_SYSLOG, LOG_TYPE_WINSNARE};

/// A single log event, immutable once created. The payload encoding is a pure function of the
///  message, so a message can be re-encoded (e.g. with a different sequence number on a new
///  session) any number of times.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LogMessage {
    /// syslog-style message: a raw data string element
    RawText {
        timestamp: DateTime<FixedOffset>,
        origin: OriginAddress,
        text: Bytes,
    },
    /// an 'origin + date' element wrapping a raw data string element (legacy Windows 'snare' format)
    OriginDated {
        timestamp: DateTime<FixedOffset>,
        origin: OriginAddress,
        text: Bytes,
    },
}

const RAW_ELEMENT_HEADER_LEN: usize = 8;
const ORIGIN_DATE_ELEMENT_LEN: usize = 8 + 2 + WireTimestamp::SERIALIZED_LEN;
/// length of the origin+date element's body as announced in its header: reserved (i16) + timestamp
const ORIGIN_DATE_INNER_LEN: u32 = 0xc;

impl LogMessage {
    pub fn raw_text(timestamp: DateTime<FixedOffset>, origin: OriginAddress, text: impl Into<Bytes>) -> LogMessage {
        LogMessage::RawText { timestamp, origin, text: text.into() }
    }

    pub fn origin_dated(timestamp: DateTime<FixedOffset>, origin: OriginAddress, text: impl Into<Bytes>) -> LogMessage {
        LogMessage::OriginDated { timestamp, origin, text: text.into() }
    }

    pub fn timestamp(&self) -> &DateTime<FixedOffset> {
        match self {
            LogMessage::RawText { timestamp, .. } => timestamp,
            LogMessage::OriginDated { timestamp, .. } => timestamp,
        }
    }

    pub fn origin(&self) -> OriginAddress {
        match self {
            LogMessage::RawText { origin, .. } => *origin,
            LogMessage::OriginDated { origin, .. } => *origin,
        }
    }

    pub fn text(&self) -> &Bytes {
        match self {
            LogMessage::RawText { text, .. } => text,
            LogMessage::OriginDated { text, .. } => text,
        }
    }

    /// the log type tag that goes into the frame header
    pub fn log_type(&self) -> u32 {
        match self {
            LogMessage::RawText { .. } => LOG_TYPE_SYSLOG,
            LogMessage::OriginDated { .. } => LOG_TYPE_WINSNARE,
        }
    }

    /// number of bytes written by [LogMessage::put_payload]
    pub fn encoded_len(&self) -> usize {
        match self {
            LogMessage::RawText { text, .. } => text.len() + RAW_ELEMENT_HEADER_LEN,
            LogMessage::OriginDated { text, .. } => text.len() + RAW_ELEMENT_HEADER_LEN + ORIGIN_DATE_ELEMENT_LEN,
        }
    }

    pub fn put_payload(&self, buf: &mut impl BufMut) {
        match self {
            LogMessage::RawText { text, .. } => {
                put_raw_element(buf, text);
            }
            LogMessage::OriginDated { timestamp, text, .. } => {
                buf.put_u16_le(ELEMENT_ORIGIN_DATE);
                buf.put_u16_le(0); // reserved
                buf.put_u32_le(ORIGIN_DATE_INNER_LEN);
                buf.put_i16_le(0); // reserved
                WireTimestamp::from_date_time(timestamp).ser(buf);
                put_raw_element(buf, text);
            }
        }
    }

    pub fn payload(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.put_payload(&mut buf);
        buf.freeze()
    }
}

fn put_raw_element(buf: &mut impl BufMut, text: &[u8]) {
    buf.put_u16_le(ELEMENT_RAW_DATASTRING);
    buf.put_u16_le(0); // reserved
    buf.put_u32_le(text.len().prechecked_cast());
    buf.put_slice(text);
}
