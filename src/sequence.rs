use std::fmt::{Debug, Formatter};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut};

use crate::error::UldpError;

/// Identity of a sent log message: `high` is the epoch second at which the sequence was assigned
///  (a coarse marker, not monotonic across clock changes), `low` is a per-session counter.
///
/// Acks are cumulative and compared by `low` only, `high` is used for estimating how long the
///  oldest unacknowledged message has been waiting.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct SequenceId {
    pub high: u32,
    pub low: u32,
}
impl Debug for SequenceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}@{}", self.low, self.high)
    }
}

impl SequenceId {
    pub const SERIALIZED_LEN: usize = 2 * size_of::<u32>();

    pub fn new(high: u32, low: u32) -> SequenceId {
        SequenceId { high, low }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.high);
        buf.put_u32_le(self.low);
    }

    pub fn deser(buf: &mut impl Buf) -> Result<SequenceId, UldpError> {
        let high = buf.try_get_u32_le()?;
        let low = buf.try_get_u32_le()?;
        Ok(SequenceId { high, low })
    }
}

/// Hands out sequence ids for one session. The counter starts at 0 for every session since the
///  peer's cumulative acks refer to the sequence space of the connection they arrive on.
#[derive(Debug, Default)]
pub struct SequenceGenerator {
    counter: u32,
}

impl SequenceGenerator {
    pub fn next(&mut self, epoch_secs: u32) -> SequenceId {
        let low = self.counter;
        self.counter = self.counter.wrapping_add(1);
        SequenceId { high: epoch_secs, low }
    }
}

pub fn epoch_secs_now() -> u32 {
    SystemTime::now().duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().min(u32::MAX as u64) as u32)
        .unwrap_or(0)
}
