//! An in-memory stand-in for a ULDP collector, speaking the server side of the protocol over a
//!  [tokio::io::duplex] stream. It is part of the regular code so that applications can test
//!  their forwarding logic against it.

use std::io::Write;
use std::net::IpAddr;
use std::sync::Mutex;

use anyhow::bail;
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use flate2::write::ZlibDecoder;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use crate::config::UldpConfig;
use crate::error::UldpError;
use crate::sequence::SequenceId;
use crate::transport::{Connection, Connector};
use crate::wire::frame_header::LogFrameHeader;
use crate::wire::{ProtocolVersion, FRAME_TYPE_FLUSH_ACK, FRAME_TYPE_FLUSH_REQUEST, FRAME_TYPE_LOG_MESSAGE, HELLO_MAGIC, MESSAGE_MAGIC, SESSION_FLAG_COMPRESSED};

const DUPLEX_BUFFER_SIZE: usize = 64*1024;

/// Hands out one end of a duplex stream, once
pub struct DuplexConnector {
    stream: Mutex<Option<DuplexStream>>,
    local_addr: IpAddr,
}

#[async_trait]
impl Connector for DuplexConnector {
    async fn connect(&self, config: &UldpConfig) -> Result<Connection, UldpError> {
        let stream = self.stream.lock()
            .ok()
            .and_then(|mut s| s.take());
        match stream {
            Some(stream) => Ok(Connection {
                stream: Box::new(stream),
                local_addr: self.local_addr,
                peer: config.endpoint(),
            }),
            None => Err(UldpError::Connect {
                endpoint: config.endpoint(),
                source: std::io::ErrorKind::ConnectionRefused.into(),
            }),
        }
    }
}

/// Creates a connector for a session and the collector at the other end of its connection
pub fn fake_collector(local_addr: IpAddr) -> (DuplexConnector, FakeCollector) {
    let (client, server) = tokio::io::duplex(DUPLEX_BUFFER_SIZE);
    let connector = DuplexConnector {
        stream: Mutex::new(Some(client)),
        local_addr,
    };
    (connector, FakeCollector::new(server))
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum CollectedFrame {
    LogMessage {
        header: LogFrameHeader,
        payload: Bytes,
    },
    FlushRequest,
}

pub struct FakeCollector {
    stream: DuplexStream,
    /// received bytes, decompressed if compression was negotiated
    inbound: BytesMut,
    decompressor: Option<ZlibDecoder<Vec<u8>>>,
    version: Option<ProtocolVersion>,
}

impl FakeCollector {
    fn new(stream: DuplexStream) -> FakeCollector {
        FakeCollector {
            stream,
            inbound: BytesMut::new(),
            decompressor: None,
            version: None,
        }
    }

    /// returns `false` on EOF
    async fn fill(&mut self) -> anyhow::Result<bool> {
        let mut buf = [0u8; 4096];
        let n = self.stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(false);
        }
        match &mut self.decompressor {
            Some(decompressor) => {
                decompressor.write_all(&buf[..n])?;
                decompressor.flush()?;
                self.inbound.extend_from_slice(decompressor.get_ref());
                decompressor.get_mut().clear();
            }
            None => self.inbound.extend_from_slice(&buf[..n]),
        }
        Ok(true)
    }

    async fn read_exact(&mut self, len: usize) -> anyhow::Result<BytesMut> {
        while self.inbound.len() < len {
            if !self.fill().await? {
                bail!("connection closed while waiting for {} bytes", len);
            }
        }
        Ok(self.inbound.split_to(len))
    }

    async fn write(&mut self, data: &[u8]) -> anyhow::Result<()> {
        self.stream.write_all(data).await?;
        Ok(())
    }

    /// returns the (min, max) versions offered by the client
    pub async fn expect_hello(&mut self) -> anyhow::Result<(u16, u16)> {
        let mut buf = self.read_exact(8).await?;
        let magic = buf.get_u32_le();
        if magic != HELLO_MAGIC {
            bail!("expected hello, got magic {:#x}", magic);
        }
        Ok((buf.get_u16_le(), buf.get_u16_le()))
    }

    pub async fn answer_version(&mut self, version: u16) -> anyhow::Result<()> {
        self.version = Some(ProtocolVersion::try_from_raw(version)?);
        let mut buf = BytesMut::new();
        buf.put_i16_le(0);
        buf.put_i16_le(version as i16);
        self.write(&buf).await
    }

    pub async fn answer_version_error(&mut self, error_code: i16) -> anyhow::Result<()> {
        let mut buf = BytesMut::new();
        buf.put_i16_le(error_code);
        buf.put_i16_le(0);
        self.write(&buf).await
    }

    /// returns the collector domain (empty for versions without domain) and the session flags
    pub async fn expect_negotiate_request(&mut self) -> anyhow::Result<(Vec<u8>, u32)> {
        let Some(version) = self.version else {
            bail!("no version answer was sent");
        };

        let domain = if version.has_collector_domain() {
            let len = self.read_exact(2).await?.get_u16_le();
            self.read_exact(len as usize).await?.to_vec()
        }
        else {
            Vec::new()
        };

        let mut buf = self.read_exact(8).await?;
        let flags = buf.get_u32_le();
        let reserved = buf.get_u32_le();
        if reserved != 0 {
            bail!("reserved negotiate field is {}", reserved);
        }
        Ok((domain, flags))
    }

    /// Sends the negotiate answer. All data received afterwards is decompressed if the answer
    ///  grants compression.
    pub async fn answer_negotiate(&mut self, flags: u32) -> anyhow::Result<()> {
        let mut buf = BytesMut::new();
        buf.put_u32_le(flags);
        buf.put_u32_le(0);
        self.write(&buf).await?;

        if flags & SESSION_FLAG_COMPRESSED != 0 {
            let mut decompressor = ZlibDecoder::new(Vec::new());
            decompressor.write_all(&self.inbound)?;
            decompressor.flush()?;
            self.inbound = BytesMut::from(decompressor.get_ref().as_slice());
            decompressor.get_mut().clear();
            self.decompressor = Some(decompressor);
        }
        Ok(())
    }

    /// the full handshake, accepting the given version and granting compression if it is requested
    pub async fn handshake(&mut self, version: u16) -> anyhow::Result<()> {
        self.expect_hello().await?;
        self.answer_version(version).await?;
        let (_, flags) = self.expect_negotiate_request().await?;
        self.answer_negotiate(flags & SESSION_FLAG_COMPRESSED).await
    }

    pub async fn read_frame(&mut self) -> anyhow::Result<CollectedFrame> {
        let Some(version) = self.version else {
            bail!("no version answer was sent");
        };

        let mut prefix = self.read_exact(4).await?;
        let magic = prefix.get_u16_le();
        let frame_type = prefix.get_u16_le();
        if magic != MESSAGE_MAGIC {
            bail!("unexpected message magic {:#x}", magic);
        }

        match frame_type {
            FRAME_TYPE_FLUSH_REQUEST => Ok(CollectedFrame::FlushRequest),
            FRAME_TYPE_LOG_MESSAGE => {
                let rest = self.read_exact(LogFrameHeader::serialized_len(version) - 4).await?;
                let mut header_buf = BytesMut::new();
                header_buf.put_u16_le(magic);
                header_buf.put_u16_le(frame_type);
                header_buf.put_slice(&rest);
                let header = LogFrameHeader::deser(&mut header_buf, version)?;

                let payload = self.read_exact(header.payload_len as usize).await?.freeze();
                Ok(CollectedFrame::LogMessage { header, payload })
            }
            other => bail!("unexpected frame type {}", other),
        }
    }

    /// reads frames until a log message arrives, skipping flush requests
    pub async fn read_log_message(&mut self) -> anyhow::Result<(LogFrameHeader, Bytes)> {
        loop {
            if let CollectedFrame::LogMessage { header, payload } = self.read_frame().await? {
                return Ok((header, payload));
            }
        }
    }

    pub async fn send_ack(&mut self, ack: SequenceId) -> anyhow::Result<()> {
        let mut buf = BytesMut::new();
        buf.put_u16_le(MESSAGE_MAGIC);
        buf.put_u16_le(FRAME_TYPE_FLUSH_ACK);
        ack.ser(&mut buf);
        self.write(&buf).await
    }

    pub async fn send_raw(&mut self, data: &[u8]) -> anyhow::Result<()> {
        self.write(data).await
    }

    /// Waits for the client's half-close, failing if any more data arrives
    pub async fn expect_eof(&mut self) -> anyhow::Result<()> {
        if !self.inbound.is_empty() {
            bail!("{} unread bytes before EOF", self.inbound.len());
        }
        if self.fill().await? {
            bail!("expected EOF, received {} bytes", self.inbound.len());
        }
        Ok(())
    }

    /// the next frame, or `None` if the client half-closed the connection
    pub async fn next_frame(&mut self) -> anyhow::Result<Option<CollectedFrame>> {
        if self.inbound.is_empty() && !self.fill().await? {
            return Ok(None);
        }
        Ok(Some(self.read_frame().await?))
    }

    /// Reads frames until the client half-closes the connection, returning all frames
    pub async fn read_until_eof(&mut self) -> anyhow::Result<Vec<CollectedFrame>> {
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame().await? {
            frames.push(frame);
        }
        Ok(frames)
    }
}
