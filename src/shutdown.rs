use std::time::Duration;

use tracing::{debug, warn};

use crate::flow_control::FlowControl;
use crate::wire::frame_header::FrameEncoder;

pub const DEFAULT_CLOSING_BUDGET: Duration = Duration::from_millis(15_000);
pub const DEFAULT_CLOSING_STEP: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ShutdownStep {
    /// call [ShutdownSequencer::step] again after [ShutdownSequencer::step_interval]
    Retry,
    /// go ahead with the half-close. `unacknowledged` messages were moved back to the send queue.
    Finish { unacknowledged: usize },
}

/// Drains queued and in-flight work under a bounded time budget before the session half-closes
///  its transport. Every retry consumes one step of the budget; once the budget is used up,
///  unacknowledged messages are requeued and the session finishes regardless.
///
/// This is a pure step function. Scheduling the retries is up to the caller.
#[derive(Debug)]
pub struct ShutdownSequencer {
    remaining: Duration,
    step: Duration,
}

impl ShutdownSequencer {
    pub fn new(budget: Duration, step: Duration) -> ShutdownSequencer {
        ShutdownSequencer {
            remaining: budget,
            step,
        }
    }

    pub fn step_interval(&self) -> Duration {
        self.step
    }

    pub fn remaining(&self) -> Duration {
        self.remaining
    }

    /// returns `true` if there is budget left after consuming a step
    fn consume_step(&mut self) -> bool {
        self.remaining = self.remaining.saturating_sub(self.step);
        !self.remaining.is_zero()
    }

    /// `encoder` is `None` if the session can not transmit right now, `transport_open` is `false`
    ///  once the transport is gone (in which case there is no point in waiting for anything).
    pub fn step(&mut self, flow: &mut FlowControl, encoder: Option<&FrameEncoder>, transport_open: bool, now_secs: u32) -> ShutdownStep {
        if transport_open && flow.has_pending() {
            if let Some(encoder) = encoder {
                flow.drain(encoder, now_secs);
            }
            if self.consume_step() {
                debug!("{} messages not sent yet, delaying close", flow.num_pending());
                return ShutdownStep::Retry;
            }
        }

        if !flow.has_in_flight() {
            return ShutdownStep::Finish { unacknowledged: 0 };
        }

        if transport_open && self.consume_step() {
            flow.request_flush();
            debug!("{} messages not acknowledged yet, delaying close", flow.num_in_flight());
            return ShutdownStep::Retry;
        }

        let unacknowledged = flow.requeue_in_flight();
        warn!("{} events have not been acknowledged", unacknowledged);
        ShutdownStep::Finish { unacknowledged }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_message::LogMessage;
    use crate::sequence::SequenceId;
    use crate::wire::origin::OriginAddress;
    use crate::wire::{encode_flush_request, ProtocolVersion};
    use chrono::DateTime;
    use rstest::rstest;

    const NOW: u32 = 1_551_441_600;

    fn encoder() -> FrameEncoder {
        FrameEncoder::new(ProtocolVersion::try_from_raw(1).unwrap(), "10.0.0.1".parse().unwrap())
    }

    fn msg(text: &str) -> LogMessage {
        let ts = DateTime::parse_from_rfc3339("2019-03-01T12:00:00Z").unwrap();
        LogMessage::raw_text(ts, OriginAddress::Unspecified, text.to_string())
    }

    fn sequencer() -> ShutdownSequencer {
        ShutdownSequencer::new(DEFAULT_CLOSING_BUDGET, DEFAULT_CLOSING_STEP)
    }

    #[test]
    fn test_nothing_to_do() {
        let mut flow = FlowControl::new(0);
        let mut shutdown = sequencer();
        assert_eq!(shutdown.step(&mut flow, Some(&encoder()), true, NOW), ShutdownStep::Finish { unacknowledged: 0 });
        assert_eq!(shutdown.remaining(), DEFAULT_CLOSING_BUDGET);
    }

    #[test]
    fn test_unacknowledged_message_is_requeued_when_budget_is_exhausted() {
        let mut flow = FlowControl::new(0);
        flow.send(msg("a"), Some(&encoder()), NOW);
        flow.take_outbox();

        let mut shutdown = sequencer();
        for _ in 0..149 {
            assert_eq!(shutdown.step(&mut flow, Some(&encoder()), true, NOW), ShutdownStep::Retry);
        }
        // exactly one flush request, repeated steps do not pile them up
        let outbox = flow.take_outbox();
        assert_eq!(outbox, vec![encode_flush_request()]);

        assert_eq!(shutdown.step(&mut flow, Some(&encoder()), true, NOW), ShutdownStep::Finish { unacknowledged: 1 });
        assert!(!flow.has_in_flight());
        assert_eq!(flow.in_flight_bytes(), 0);
        assert_eq!(flow.take_pending(), vec![msg("a")]);
    }

    #[test]
    fn test_ack_during_shutdown_finishes_early() {
        let mut flow = FlowControl::new(0);
        flow.send(msg("a"), Some(&encoder()), NOW);
        flow.send(msg("b"), Some(&encoder()), NOW);

        let mut shutdown = sequencer();
        assert_eq!(shutdown.step(&mut flow, Some(&encoder()), true, NOW), ShutdownStep::Retry);
        flow.on_flush_ack(SequenceId::new(NOW, 1));
        assert_eq!(shutdown.step(&mut flow, Some(&encoder()), true, NOW), ShutdownStep::Finish { unacknowledged: 0 });
        assert!(!flow.has_pending());
    }

    #[test]
    fn test_pending_messages_are_drained_first() {
        let mut flow = FlowControl::new(0);
        flow.send(msg("a"), None, NOW);
        flow.send(msg("b"), None, NOW);

        let mut shutdown = sequencer();
        assert_eq!(shutdown.step(&mut flow, Some(&encoder()), true, NOW), ShutdownStep::Retry);
        assert!(!flow.has_pending());
        assert_eq!(flow.num_in_flight(), 2);
        assert_eq!(shutdown.remaining(), Duration::from_millis(14_900));

        flow.on_flush_ack(SequenceId::new(NOW, 1));
        assert_eq!(shutdown.step(&mut flow, Some(&encoder()), true, NOW), ShutdownStep::Finish { unacknowledged: 0 });
    }

    #[test]
    fn test_pending_messages_that_never_become_sendable() {
        let mut flow = FlowControl::new(0);
        flow.send(msg("a"), None, NOW);

        let mut shutdown = ShutdownSequencer::new(Duration::from_millis(1000), Duration::from_millis(100));
        for _ in 0..9 {
            assert_eq!(shutdown.step(&mut flow, None, true, NOW), ShutdownStep::Retry);
        }
        assert_eq!(shutdown.step(&mut flow, None, true, NOW), ShutdownStep::Finish { unacknowledged: 0 });
        assert_eq!(flow.num_pending(), 1);
    }

    #[rstest]
    #[case::with_encoder(true)]
    #[case::without_encoder(false)]
    fn test_closed_transport_requeues_immediately(#[case] with_encoder: bool) {
        let enc = encoder();
        let mut flow = FlowControl::new(0);
        flow.send(msg("a"), Some(&enc), NOW);
        flow.send(msg("b"), Some(&enc), NOW);

        let mut shutdown = sequencer();
        let encoder = if with_encoder { Some(&enc) } else { None };
        assert_eq!(shutdown.step(&mut flow, encoder, false, NOW), ShutdownStep::Finish { unacknowledged: 2 });
        assert_eq!(flow.take_pending(), vec![msg("a"), msg("b")]);
    }
}
