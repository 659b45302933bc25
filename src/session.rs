use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::client::{CloseReport, Command, SessionState, SessionStats};
use crate::config::UldpConfig;
use crate::error::UldpError;
use crate::flow_control::FlowControl;
use crate::sequence::epoch_secs_now;
use crate::shutdown::{ShutdownSequencer, ShutdownStep};
use crate::transport::compression::FrameCompressor;
use crate::transport::Connector;
use crate::wire::frame_header::FrameEncoder;
use crate::wire::{decode_flush_ack_stream, decode_negotiate_answer, decode_version_answer, encode_hello, encode_negotiate_request, ProtocolVersion, MAX_VERSION, MIN_VERSION};

const READ_BUFFER_CAPACITY: usize = 4096;

/// The state of a single ULDP session, owned by the session's task. All events (commands from
///  the client handle, inbound data, write readiness, timers) are processed sequentially by
///  [Session::run], so there is no shared mutable state.
pub(crate) struct Session {
    config: UldpConfig,
    state: SessionState,
    flow: FlowControl,

    version: Option<ProtocolVersion>,
    encoder: Option<FrameEncoder>,
    compressor: Option<FrameCompressor>,
    local_addr: IpAddr,

    inbound: BytesMut,
    /// encoded (and possibly compressed) bytes waiting to be written to the transport
    outbound: BytesMut,
    /// set when `outbound` exceeds the high water mark, cleared when it is fully written
    write_paused: bool,
    needs_flush: bool,

    connect_reply: Option<oneshot::Sender<Result<ProtocolVersion, UldpError>>>,
    close_replies: Vec<oneshot::Sender<Result<CloseReport, UldpError>>>,

    shutdown: Option<ShutdownSequencer>,
    next_shutdown_step: Option<Instant>,
    unacknowledged_on_close: usize,
    /// the shutdown sequencer finished, the transport is to be half-closed
    expecting_end: bool,
    /// deadline for the peer closing the connection after our half-close
    linger_deadline: Option<Instant>,
    peer_closed: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum WriteOp {
    Write,
    Flush,
    HalfClose,
    Idle,
}

/// Performs a single write-side operation, returning the number of bytes written for
///  [WriteOp::Write] and 0 otherwise. Each operation is cancellation safe, so this can be used
///  in a `select!` loop.
async fn perform_write<W: AsyncWrite + Unpin>(writer: &mut W, op: WriteOp, outbound: &[u8]) -> std::io::Result<usize> {
    match op {
        WriteOp::Write => writer.write(outbound).await,
        WriteOp::Flush => writer.flush().await.map(|_| 0),
        WriteOp::HalfClose => writer.shutdown().await.map(|_| 0),
        WriteOp::Idle => std::future::pending().await,
    }
}

/// What the event loop does after processing an event
enum Next {
    Continue,
    Finished,
    Failed(UldpError),
}

impl Session {
    pub(crate) fn new(config: UldpConfig, connect_reply: oneshot::Sender<Result<ProtocolVersion, UldpError>>) -> Session {
        let budget = config.effective_ack_pending_budget();
        Session {
            config,
            state: SessionState::Disconnected,
            flow: FlowControl::new(budget),
            version: None,
            encoder: None,
            compressor: None,
            local_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            inbound: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
            outbound: BytesMut::new(),
            write_paused: false,
            needs_flush: false,
            connect_reply: Some(connect_reply),
            close_replies: Vec::new(),
            shutdown: None,
            next_shutdown_step: None,
            unacknowledged_on_close: 0,
            expecting_end: false,
            linger_deadline: None,
            peer_closed: false,
        }
    }

    pub(crate) async fn run(mut self, connector: Arc<dyn Connector>, mut commands: mpsc::UnboundedReceiver<Command>) {
        if let Err(e) = self.config.validate() {
            self.fail(UldpError::Config(e.to_string()));
            return;
        }

        self.state = SessionState::Connecting;
        debug!("connecting to ULDP collector at {}", self.config.endpoint());

        // commands are accepted (and sends queued) while the connection is being established
        let mut commands_open = true;
        let connect_config = self.config.clone();
        let connection = {
            let connect = connector.connect(&connect_config);
            tokio::pin!(connect);
            loop {
                tokio::select! {
                    result = &mut connect => break result,
                    cmd = commands.recv(), if commands_open => match cmd {
                        Some(cmd) => self.on_command(cmd),
                        None => {
                            commands_open = false;
                            self.start_close();
                        }
                    },
                }
            }
        };

        let connection = match connection {
            Ok(c) => c,
            Err(e) => {
                self.fail(e);
                return;
            }
        };

        self.local_addr = connection.local_addr;
        let (mut reader, mut writer) = tokio::io::split(connection.stream);

        self.state = SessionState::AwaitingVersionAnswer;
        trace!("sending hello, versions {} to {}", MIN_VERSION, MAX_VERSION);
        self.outbound.extend_from_slice(&encode_hello(MIN_VERSION, MAX_VERSION));

        loop {
            let read_enabled = !self.peer_closed;
            let write_op = self.next_write_op();
            let shutdown_step_at = self.next_shutdown_step;
            let linger_deadline = self.linger_deadline;

            let next = tokio::select! {
                result = reader.read_buf(&mut self.inbound), if read_enabled => match result {
                    Ok(0) => self.on_peer_closed(),
                    Ok(n) => {
                        trace!("received {} bytes", n);
                        self.on_inbound()
                    }
                    Err(e) => Next::Failed(UldpError::Io(e)),
                },
                result = perform_write(&mut writer, write_op, &self.outbound), if write_op != WriteOp::Idle => match result {
                    Ok(n) => self.on_write_op_done(write_op, n),
                    Err(e) => Next::Failed(UldpError::Io(e)),
                },
                cmd = commands.recv(), if commands_open => match cmd {
                    Some(cmd) => {
                        self.on_command(cmd);
                        self.flush_outbox()
                    }
                    None => {
                        debug!("all client handles were dropped, closing the session");
                        commands_open = false;
                        self.start_close();
                        Next::Continue
                    }
                },
                _ = sleep_until(shutdown_step_at.unwrap_or_else(Instant::now)), if shutdown_step_at.is_some() => {
                    self.on_shutdown_step()
                },
                _ = sleep_until(linger_deadline.unwrap_or_else(Instant::now)), if linger_deadline.is_some() => {
                    debug!("collector did not close the connection within {:?}", self.config.peer_close_timeout);
                    Next::Finished
                },
            };

            match next {
                Next::Continue => {}
                Next::Finished => {
                    self.finish();
                    return;
                }
                Next::Failed(e) => {
                    self.fail(e);
                    return;
                }
            }
        }
    }

    fn next_write_op(&self) -> WriteOp {
        if !self.outbound.is_empty() {
            WriteOp::Write
        }
        else if self.needs_flush {
            WriteOp::Flush
        }
        else if self.expecting_end && self.linger_deadline.is_none() {
            WriteOp::HalfClose
        }
        else {
            WriteOp::Idle
        }
    }

    fn on_write_op_done(&mut self, op: WriteOp, num_written: usize) -> Next {
        match op {
            WriteOp::Write => self.on_written(num_written),
            WriteOp::Flush => {
                self.needs_flush = false;
                Next::Continue
            }
            WriteOp::HalfClose => {
                debug!("half-closed connection, waiting for the collector to close it");
                self.linger_deadline = Some(Instant::now() + self.config.peer_close_timeout);
                Next::Continue
            }
            WriteOp::Idle => Next::Continue,
        }
    }

    fn is_writable(&self) -> bool {
        self.state == SessionState::Ready && !self.write_paused && !self.expecting_end
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Send(message) => {
                if self.shutdown.is_some() {
                    warn!("message sent after close was requested");
                }
                let encoder = if self.is_writable() { self.encoder.as_ref() } else { None };
                self.flow.send(message, encoder, epoch_secs_now());
            }
            Command::Close(reply) => {
                self.close_replies.push(reply);
                self.start_close();
            }
            Command::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
        }
    }

    fn start_close(&mut self) {
        if self.shutdown.is_some() {
            debug!("close already in progress");
            return;
        }
        debug!("closing session");
        self.shutdown = Some(ShutdownSequencer::new(self.config.closing_budget, self.config.closing_step));
        self.next_shutdown_step = Some(Instant::now());
    }

    fn on_shutdown_step(&mut self) -> Next {
        let Some(shutdown) = self.shutdown.as_mut() else {
            self.next_shutdown_step = None;
            return Next::Continue;
        };

        let transport_open = !self.peer_closed;
        let writable = self.state == SessionState::Ready && !self.write_paused;
        let encoder = if writable { self.encoder.as_ref() } else { None };

        match shutdown.step(&mut self.flow, encoder, transport_open, epoch_secs_now()) {
            ShutdownStep::Retry => {
                self.next_shutdown_step = Some(Instant::now() + shutdown.step_interval());
            }
            ShutdownStep::Finish { unacknowledged } => {
                debug!("ending client connection");
                self.unacknowledged_on_close = unacknowledged;
                self.next_shutdown_step = None;
                self.expecting_end = true;
            }
        }
        self.flush_outbox()
    }

    /// moves frames produced by flow control to the outbound buffer, through the compressor if
    ///  compression was negotiated
    fn flush_outbox(&mut self) -> Next {
        for frame in self.flow.take_outbox() {
            if let Err(e) = self.write_frame(frame) {
                return Next::Failed(e);
            }
        }
        if self.outbound.len() > self.config.write_high_water_mark && !self.write_paused {
            trace!("outbound buffer above high water mark ({} bytes), pausing transmission", self.outbound.len());
            self.write_paused = true;
        }
        Next::Continue
    }

    fn write_frame(&mut self, frame: Bytes) -> Result<(), UldpError> {
        match self.compressor.as_mut() {
            Some(compressor) => {
                let compressed = compressor.compress(&frame)?;
                self.outbound.extend_from_slice(&compressed);
            }
            None => self.outbound.extend_from_slice(&frame),
        }
        Ok(())
    }

    fn on_written(&mut self, n: usize) -> Next {
        if n == 0 {
            return Next::Failed(UldpError::Io(std::io::ErrorKind::WriteZero.into()));
        }
        self.outbound.advance(n);
        self.needs_flush = true;

        if self.outbound.is_empty() && self.write_paused {
            trace!("outbound buffer drained, resuming transmission");
            self.write_paused = false;
            self.drain_pending();
            return self.flush_outbox();
        }
        Next::Continue
    }

    fn drain_pending(&mut self) {
        if !self.is_writable() {
            return;
        }
        if let Some(encoder) = self.encoder.as_ref() {
            self.flow.drain(encoder, epoch_secs_now());
        }
    }

    fn on_inbound(&mut self) -> Next {
        loop {
            match self.state {
                SessionState::AwaitingVersionAnswer => {
                    match decode_version_answer(&mut self.inbound) {
                        Ok(Some((_, version))) => self.on_version_answer(version),
                        Ok(None) => return Next::Continue,
                        Err(e) => return Next::Failed(e),
                    }
                }
                SessionState::AwaitingNegotiateAnswer => {
                    match decode_negotiate_answer(&mut self.inbound, self.config.use_compression) {
                        Ok(Some(answer)) => {
                            if answer.is_compressed() {
                                debug!("compression negotiated");
                                self.compressor = Some(FrameCompressor::new());
                            }
                            self.on_ready();
                        }
                        Ok(None) => return Next::Continue,
                        Err(e) => return Next::Failed(e),
                    }
                }
                SessionState::Ready => {
                    for ack in decode_flush_ack_stream(&mut self.inbound) {
                        match ack {
                            Ok(ack) => self.flow.on_flush_ack(ack),
                            Err(e) => warn!("skipping malformed flush ack: {}", e),
                        }
                    }
                    self.drain_pending();
                    return self.flush_outbox();
                }
                _ => {
                    warn!("discarding {} unexpected bytes in state {:?}", self.inbound.len(), self.state);
                    self.inbound.clear();
                    return Next::Continue;
                }
            }
        }
    }

    fn on_version_answer(&mut self, version: ProtocolVersion) {
        debug!("negotiated protocol version {}", version.raw());
        self.version = Some(version);
        self.state = SessionState::AwaitingNegotiateAnswer;

        let domain = self.config.collector_domain.as_deref().unwrap_or("");
        if !domain.is_empty() && !version.has_collector_domain() {
            debug!("protocol version {} does not support a collector domain, not sending it", version.raw());
        }
        let request = encode_negotiate_request(version, domain.as_bytes(), self.config.use_compression);
        self.outbound.extend_from_slice(&request);
    }

    fn on_ready(&mut self) {
        let Some(version) = self.version else {
            return;
        };
        self.encoder = Some(FrameEncoder::new(version, self.local_addr));
        self.state = SessionState::Ready;
        info!("ULDP session ready: version {}, compression {}", version.raw(), self.compressor.is_some());

        if let Some(reply) = self.connect_reply.take() {
            let _ = reply.send(Ok(version));
        }
        self.drain_pending();
    }

    fn on_peer_closed(&mut self) -> Next {
        self.peer_closed = true;
        if self.expecting_end {
            debug!("connection closed by collector");
            Next::Finished
        }
        else {
            Next::Failed(UldpError::UnexpectedClose)
        }
    }

    fn stats(&self) -> SessionStats {
        SessionStats {
            state: self.reported_state(),
            negotiated_version: self.version,
            sent: self.flow.num_sent(),
            acked: self.flow.num_acked(),
            queued: self.flow.num_pending(),
            in_flight: self.flow.num_in_flight(),
            in_flight_bytes: self.flow.in_flight_bytes(),
            ack_consistency_warnings: self.flow.num_ack_consistency_warnings(),
        }
    }

    fn reported_state(&self) -> SessionState {
        match self.state {
            SessionState::Closed => SessionState::Closed,
            _ if self.shutdown.is_some() => SessionState::Closing,
            s => s,
        }
    }

    fn finish(&mut self) {
        self.state = SessionState::Closed;
        let report = CloseReport {
            sent: self.flow.num_sent(),
            acked: self.flow.num_acked(),
            unacknowledged: self.unacknowledged_on_close,
            requeued: self.flow.take_pending(),
        };
        info!("ULDP session closed: {}", report);

        if let Some(reply) = self.connect_reply.take() {
            // closed before the handshake completed
            let _ = reply.send(Err(UldpError::SessionTerminated));
        }
        for reply in self.close_replies.drain(..) {
            let _ = reply.send(Ok(report.clone()));
        }
    }

    fn fail(&mut self, e: UldpError) {
        error!("ULDP session failed: {}", e);
        self.state = SessionState::Closed;

        if let Some(reply) = self.connect_reply.take() {
            let _ = reply.send(Err(e.duplicate()));
        }
        for reply in self.close_replies.drain(..) {
            let _ = reply.send(Err(e.duplicate()));
        }
    }
}
