use std::fmt::{Display, Formatter};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::config::UldpConfig;
use crate::error::UldpError;
use crate::log_message::LogMessage;
use crate::session::Session;
use crate::transport::{Connector, TcpConnector};
use crate::wire::ProtocolVersion;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    AwaitingVersionAnswer,
    AwaitingNegotiateAnswer,
    Ready,
    Closing,
    Closed,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionStats {
    pub state: SessionState,
    pub negotiated_version: Option<ProtocolVersion>,
    pub sent: u64,
    pub acked: u64,
    pub queued: usize,
    pub in_flight: usize,
    pub in_flight_bytes: usize,
    pub ack_consistency_warnings: u64,
}

/// Outcome of an orderly close. Messages that were never sent, and messages that were sent but
///  not acknowledged within the closing budget, are handed back in `requeued` (in their original
///  order) so that the caller can resend them on a new session.
#[derive(Clone, Debug)]
pub struct CloseReport {
    pub sent: u64,
    pub acked: u64,
    pub unacknowledged: usize,
    pub requeued: Vec<LogMessage>,
}

impl Display for CloseReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} sent, {} acknowledged, {} unacknowledged, {} requeued", self.sent, self.acked, self.unacknowledged, self.requeued.len())
    }
}

pub(crate) enum Command {
    Send(LogMessage),
    Close(oneshot::Sender<Result<CloseReport, UldpError>>),
    Stats(oneshot::Sender<SessionStats>),
}

/// Completion of the connect / handshake phase of a session. It can be waited for exactly once.
pub struct ConnectHandle {
    ready: oneshot::Receiver<Result<ProtocolVersion, UldpError>>,
}

impl ConnectHandle {
    /// Resolves with the negotiated protocol version once the session is ready to transmit, or
    ///  with the error that terminated the session before that.
    pub async fn wait(self) -> Result<ProtocolVersion, UldpError> {
        self.ready.await
            .unwrap_or(Err(UldpError::SessionTerminated))
    }
}

/// Handle to a ULDP session. The session itself runs in a dedicated task that owns the
///  connection and all delivery state; this handle talks to it through a channel, so it can be
///  cloned and used from any task.
#[derive(Clone)]
pub struct UldpClient {
    commands: mpsc::UnboundedSender<Command>,
}

impl UldpClient {
    /// Starts a session in a new task. Messages can be sent right away, they are queued until
    ///  the handshake is complete.
    pub fn spawn(config: UldpConfig, connector: Arc<dyn Connector>) -> (UldpClient, ConnectHandle) {
        let (commands, commands_recv) = mpsc::unbounded_channel();
        let (ready_send, ready) = oneshot::channel();

        let session = Session::new(config, ready_send);
        tokio::spawn(session.run(connector, commands_recv));

        (UldpClient { commands }, ConnectHandle { ready })
    }

    /// Connects via TCP (or TLS if configured) and waits for the handshake to complete
    pub async fn connect(config: UldpConfig) -> Result<UldpClient, UldpError> {
        config.validate()
            .map_err(|e| UldpError::Config(e.to_string()))?;

        let (client, connect_handle) = UldpClient::spawn(config, Arc::new(TcpConnector));
        let version = connect_handle.wait().await?;
        debug!("ULDP session ready with protocol version {}", version.raw());
        Ok(client)
    }

    pub fn send(&self, message: LogMessage) -> Result<(), UldpError> {
        self.commands.send(Command::Send(message))
            .map_err(|_| UldpError::SessionTerminated)
    }

    /// Initiates an orderly shutdown and waits for it to complete. Calling this again while the
    ///  session is closing resolves when the first close completes.
    pub async fn close(&self) -> Result<CloseReport, UldpError> {
        let (reply, result) = oneshot::channel();
        self.commands.send(Command::Close(reply))
            .map_err(|_| UldpError::SessionTerminated)?;
        result.await
            .unwrap_or(Err(UldpError::SessionTerminated))
    }

    pub async fn stats(&self) -> Result<SessionStats, UldpError> {
        let (reply, result) = oneshot::channel();
        self.commands.send(Command::Stats(reply))
            .map_err(|_| UldpError::SessionTerminated)?;
        result.await
            .map_err(|_| UldpError::SessionTerminated)
    }
}
