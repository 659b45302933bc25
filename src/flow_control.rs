use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound::{Excluded, Included, Unbounded};

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::log_message::LogMessage;
use crate::sequence::{SequenceGenerator, SequenceId};
use crate::wire::encode_flush_request;
use crate::wire::frame_header::FrameEncoder;

pub const DEFAULT_ACK_PENDING_BUDGET: usize = 500 * 1024;

/// age (in whole seconds) of the oldest unacknowledged sequence that triggers a flush request
const MAX_ACK_DELAY_SECS: u32 = 1;

#[derive(Debug, Clone)]
struct InFlightEntry {
    message: LogMessage,
    frame_len: usize,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SendOutcome {
    Transmitted(SequenceId),
    Queued,
}

/// Sequence assignment, in-flight tracking and byte-budgeted flow control for one session.
///
/// This is pure state without any I/O: frames that are ready to go on the wire are collected in
///  an outbox that the session drains and writes to the transport, in order.
#[derive(Debug)]
pub struct FlowControl {
    budget: usize,
    sequence: SequenceGenerator,
    last_sent: Option<SequenceId>,
    last_acked: Option<SequenceId>,

    pending_send: VecDeque<LogMessage>,
    in_flight: BTreeMap<u32, InFlightEntry>,
    in_flight_bytes: usize,
    flush_request_outstanding: bool,

    outbox: Vec<Bytes>,

    num_sent: u64,
    num_acked: u64,
    num_ack_consistency_warnings: u64,
}

impl FlowControl {
    /// a budget of 0 means 'use the default'
    pub fn new(budget: usize) -> FlowControl {
        FlowControl {
            budget: if budget == 0 { DEFAULT_ACK_PENDING_BUDGET } else { budget },
            sequence: SequenceGenerator::default(),
            last_sent: None,
            last_acked: None,
            pending_send: VecDeque::new(),
            in_flight: BTreeMap::new(),
            in_flight_bytes: 0,
            flush_request_outstanding: false,
            outbox: Vec::new(),
            num_sent: 0,
            num_acked: 0,
            num_ack_consistency_warnings: 0,
        }
    }

    /// Registers a message for sending. `encoder` is `None` while the session can not transmit
    ///  (not negotiated yet, or the transport's write buffer is full), and the message is queued.
    ///
    /// Messages are transmitted in the order they are passed in, so a message is queued if there
    ///  are older messages waiting.
    pub fn send(&mut self, message: LogMessage, encoder: Option<&FrameEncoder>, now_secs: u32) -> SendOutcome {
        let Some(encoder) = encoder else {
            self.pending_send.push_back(message);
            return SendOutcome::Queued;
        };

        if !self.pending_send.is_empty() {
            self.pending_send.push_back(message);
            self.drain(encoder, now_secs);
            return match self.last_sent {
                Some(seq) if self.pending_send.is_empty() => SendOutcome::Transmitted(seq),
                _ => SendOutcome::Queued,
            };
        }

        match self.try_transmit(message, encoder, now_secs) {
            Ok(seq) => SendOutcome::Transmitted(seq),
            Err(message) => {
                self.pending_send.push_back(message);
                SendOutcome::Queued
            }
        }
    }

    /// Moves queued messages to the wire in FIFO order until the queue is empty or the budget
    ///  is exhausted. Returns the number of transmitted messages.
    pub fn drain(&mut self, encoder: &FrameEncoder, now_secs: u32) -> usize {
        let mut num_transmitted = 0;
        while let Some(message) = self.pending_send.pop_front() {
            match self.try_transmit(message, encoder, now_secs) {
                Ok(_) => num_transmitted += 1,
                Err(message) => {
                    self.pending_send.push_front(message);
                    break;
                }
            }
        }
        if num_transmitted > 0 {
            trace!("drained {} queued messages, {} still queued", num_transmitted, self.pending_send.len());
        }
        num_transmitted
    }

    fn try_transmit(&mut self, message: LogMessage, encoder: &FrameEncoder, now_secs: u32) -> Result<SequenceId, LogMessage> {
        let frame_len = encoder.frame_len(&message);

        // A frame that exceeds the whole budget on its own still goes out when nothing else is
        //  in flight
        if !self.in_flight.is_empty() && self.in_flight_bytes + frame_len > self.budget {
            trace!("in-flight budget exhausted ({} + {} > {}), holding back message", self.in_flight_bytes, frame_len, self.budget);
            self.request_flush();
            return Err(message);
        }

        let seq = self.sequence.next(now_secs);
        let frame = encoder.encode_log_message_frame(seq, &message);
        debug_assert_eq!(frame.len(), frame_len);
        trace!("sending log message {:?} ({} bytes)", seq, frame_len);

        self.outbox.push(frame);
        self.last_sent = Some(seq);
        if let Some(replaced) = self.in_flight.insert(seq.low, InFlightEntry { message, frame_len }) {
            warn!("sequence number {} wrapped around while still in flight", seq.low);
            self.in_flight_bytes -= replaced.frame_len;
        }
        self.in_flight_bytes += frame_len;
        self.num_sent += 1;

        self.check_needs_flush_request();
        Ok(seq)
    }

    fn ack_delay_secs(&self) -> u32 {
        match (self.last_sent, self.last_acked) {
            (Some(last_sent), Some(last_acked)) => last_sent.high.saturating_sub(last_acked.high),
            _ => 0,
        }
    }

    fn check_needs_flush_request(&mut self) {
        if self.in_flight_bytes > self.budget / 2 || self.ack_delay_secs() > MAX_ACK_DELAY_SECS {
            self.request_flush();
        }
    }

    /// Asks the peer to acknowledge everything sent so far - unless such a request is already
    ///  outstanding.
    pub fn request_flush(&mut self) {
        if self.flush_request_outstanding {
            return;
        }
        debug!("sending flush request with {} bytes in flight", self.in_flight_bytes);
        self.outbox.push(encode_flush_request());
        self.flush_request_outstanding = true;
    }

    /// Processes a cumulative ack: all in-flight messages with a sequence number after the
    ///  previously acknowledged one, up to and including `ack`, are done.
    pub fn on_flush_ack(&mut self, ack: SequenceId) {
        self.flush_request_outstanding = false;

        let lower_bound = match self.last_acked {
            Some(last) if ack.low <= last.low => {
                trace!("ignoring ack {:?}, already acknowledged up to {:?}", ack, last);
                return;
            }
            Some(last) => Excluded(last.low),
            None => Unbounded,
        };

        let acked_keys = self.in_flight.range((lower_bound, Included(ack.low)))
            .map(|(&k, _)| k)
            .collect::<Vec<_>>();
        for key in &acked_keys {
            if let Some(entry) = self.in_flight.remove(key) {
                self.in_flight_bytes -= entry.frame_len;
            }
        }

        let num_expected = match self.last_acked {
            Some(last) => (ack.low - last.low) as u64,
            None => ack.low as u64 + 1,
        };
        let num_missing = num_expected - acked_keys.len() as u64;
        if num_missing > 0 {
            warn!("ack {:?} covers {} sequence numbers that are not in flight - ignoring them", ack, num_missing);
            self.num_ack_consistency_warnings += num_missing;
        }

        trace!("ack {:?} removed {} messages, {} bytes still in flight", ack, acked_keys.len(), self.in_flight_bytes);
        self.num_acked += acked_keys.len() as u64;
        self.last_acked = Some(ack);
    }

    /// Moves all unacknowledged messages back to the front of the send queue (preserving their
    ///  order) and returns their number.
    pub fn requeue_in_flight(&mut self) -> usize {
        let in_flight = std::mem::take(&mut self.in_flight);
        let num_requeued = in_flight.len();

        let mut requeued = in_flight.into_values()
            .map(|e| e.message)
            .collect::<VecDeque<_>>();
        requeued.append(&mut self.pending_send);
        self.pending_send = requeued;

        self.in_flight_bytes = 0;
        self.flush_request_outstanding = false;
        num_requeued
    }

    pub fn take_outbox(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.outbox)
    }

    pub fn take_pending(&mut self) -> Vec<LogMessage> {
        self.pending_send.drain(..).collect()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending_send.is_empty()
    }

    pub fn has_in_flight(&self) -> bool {
        !self.in_flight.is_empty()
    }

    pub fn num_pending(&self) -> usize {
        self.pending_send.len()
    }

    pub fn num_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn in_flight_bytes(&self) -> usize {
        self.in_flight_bytes
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn flush_request_outstanding(&self) -> bool {
        self.flush_request_outstanding
    }

    pub fn last_acked(&self) -> Option<SequenceId> {
        self.last_acked
    }

    pub fn num_sent(&self) -> u64 {
        self.num_sent
    }

    pub fn num_acked(&self) -> u64 {
        self.num_acked
    }

    pub fn num_ack_consistency_warnings(&self) -> u64 {
        self.num_ack_consistency_warnings
    }

    #[cfg(test)]
    fn assert_invariants(&self) {
        assert_eq!(self.in_flight_bytes, self.in_flight.values().map(|e| e.frame_len).sum::<usize>());
    }

    #[cfg(test)]
    fn pending_texts(&self) -> Vec<String> {
        self.pending_send.iter()
            .map(|m| String::from_utf8_lossy(m.text()).to_string())
            .collect()
    }
}
