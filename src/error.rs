use std::io;

/// Errors surfaced by a ULDP session. Conditions the session recovers from on its own (acks for
///  unknown sequence numbers, messages left unacknowledged at close) are logged and counted
///  instead, see [crate::client::SessionStats] and [crate::client::CloseReport].
#[derive(Debug, thiserror::Error)]
pub enum UldpError {
    #[error("cannot connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("TLS setup or handshake failed: {0}")]
    Tls(String),

    #[error("ULDP protocol error: {0}")]
    Protocol(String),

    #[error("connection closed by peer without a close request")]
    UnexpectedClose,

    #[error("I/O error on ULDP connection: {0}")]
    Io(#[from] io::Error),

    #[error("invalid ULDP configuration: {0}")]
    Config(String),

    #[error("session task terminated")]
    SessionTerminated,
}

impl UldpError {
    pub fn protocol(msg: impl Into<String>) -> UldpError {
        UldpError::Protocol(msg.into())
    }

    /// A fatal session error is reported to every pending caller, but `io::Error` is not `Clone`.
    ///  This copies the error, preserving I/O error kinds and messages.
    pub fn duplicate(&self) -> UldpError {
        fn copy_io(e: &io::Error) -> io::Error {
            io::Error::new(e.kind(), e.to_string())
        }

        match self {
            UldpError::Connect { endpoint, source } => UldpError::Connect { endpoint: endpoint.clone(), source: copy_io(source) },
            UldpError::Tls(msg) => UldpError::Tls(msg.clone()),
            UldpError::Protocol(msg) => UldpError::Protocol(msg.clone()),
            UldpError::UnexpectedClose => UldpError::UnexpectedClose,
            UldpError::Io(e) => UldpError::Io(copy_io(e)),
            UldpError::Config(msg) => UldpError::Config(msg.clone()),
            UldpError::SessionTerminated => UldpError::SessionTerminated,
        }
    }
}

impl From<bytes::TryGetError> for UldpError {
    fn from(e: bytes::TryGetError) -> Self {
        UldpError::Protocol(format!("truncated frame: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = UldpError::protocol("unexpected message magic: 0x1234");
        assert_eq!(e.to_string(), "ULDP protocol error: unexpected message magic: 0x1234");

        let e = UldpError::Connect {
            endpoint: "lmi.example:5516".to_string(),
            source: io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        };
        assert_eq!(e.to_string(), "cannot connect to lmi.example:5516: refused");
    }

    #[test]
    fn test_duplicate() {
        let e = UldpError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"));
        match e.duplicate() {
            UldpError::Io(copy) => {
                assert_eq!(copy.kind(), io::ErrorKind::BrokenPipe);
                assert_eq!(copy.to_string(), "pipe closed");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(UldpError::UnexpectedClose.duplicate(), UldpError::UnexpectedClose));
    }
}
