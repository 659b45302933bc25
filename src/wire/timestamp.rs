use bytes::{Buf, BufMut};
use chrono::{DateTime, FixedOffset};

use crate::error::UldpError;
use crate::safe_converter::SaturatingCast;

/// On-the-wire representation of a point in time:
///
/// ```ascii
/// 0: timezone offset in minutes (i16 LE), "minutes west of UTC", i.e. UTC+01:00 is -60
/// 2: seconds since epoch (u32 LE)
/// 6: sub-second part in microseconds (u32 LE)
/// ```
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WireTimestamp {
    pub tz_offset_minutes: i16,
    pub secs: u32,
    pub micros: u32,
}

impl WireTimestamp {
    pub const SERIALIZED_LEN: usize = size_of::<i16>() + 2 * size_of::<u32>();

    pub fn from_date_time(ts: &DateTime<FixedOffset>) -> WireTimestamp {
        WireTimestamp {
            tz_offset_minutes: (-ts.offset().local_minus_utc() / 60).saturating_cast(),
            secs: ts.timestamp().saturating_cast(),
            // leap seconds are represented as micros >= 1_000_000 by chrono
            micros: ts.timestamp_subsec_micros().min(999_999),
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_i16_le(self.tz_offset_minutes);
        buf.put_u32_le(self.secs);
        buf.put_u32_le(self.micros);
    }

    pub fn deser(buf: &mut impl Buf) -> Result<WireTimestamp, UldpError> {
        let tz_offset_minutes = buf.try_get_i16_le()?;
        let secs = buf.try_get_u32_le()?;
        let micros = buf.try_get_u32_le()?;
        Ok(WireTimestamp { tz_offset_minutes, secs, micros })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::utc("2019-03-01T12:00:00.250Z", 0, 1551441600, 250_000)]
    #[case::east("2019-03-01T13:00:00.000001+01:00", -60, 1551441600, 1)]
    #[case::west("2019-03-01T07:30:00-04:30", 270, 1551441600, 0)]
    #[case::before_epoch("1969-12-31T23:59:59Z", 0, 0, 0)]
    fn test_from_date_time(#[case] ts: &str, #[case] tz: i16, #[case] secs: u32, #[case] micros: u32) {
        let ts = DateTime::parse_from_rfc3339(ts).unwrap();
        assert_eq!(WireTimestamp::from_date_time(&ts), WireTimestamp { tz_offset_minutes: tz, secs, micros });
    }

    #[test]
    fn test_ser() {
        let ts = WireTimestamp { tz_offset_minutes: -60, secs: 0x5c79_1e00, micros: 1000 };
        let mut buf = Vec::new();
        ts.ser(&mut buf);
        assert_eq!(buf, b"\xc4\xff\x00\x1e\x79\x5c\xe8\x03\0\0");
        assert_eq!(buf.len(), WireTimestamp::SERIALIZED_LEN);

        let mut b: &[u8] = &buf;
        assert_eq!(WireTimestamp::deser(&mut b).unwrap(), ts);
    }
}
