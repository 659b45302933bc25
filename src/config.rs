use std::time::Duration;

use anyhow::bail;

use crate::flow_control::DEFAULT_ACK_PENDING_BUDGET;
use crate::shutdown::{DEFAULT_CLOSING_BUDGET, DEFAULT_CLOSING_STEP};

pub const DEFAULT_PORT: u16 = 5516;
pub const DEFAULT_TLS_PORT: u16 = 5515;

/// Certificate material for a TLS connection, all in PEM format.
#[derive(Clone)]
pub struct TlsMaterial {
    /// CA bundle the server's certificate chain is verified against
    pub ca_pem: Vec<u8>,
    /// client certificate (chain)
    pub cert_pem: Vec<u8>,
    /// client private key: PKCS#8, PKCS#1 or SEC1, or an encrypted PKCS#8 key if `key_passphrase`
    ///  is set
    pub key_pem: Vec<u8>,
    pub key_passphrase: Option<String>,
    /// If this is `false`, the server's certificate chain is still verified against the CA, but
    ///  the certificate need not match the host name.
    pub check_server_name: bool,
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("ca_pem", &format!("{} bytes", self.ca_pem.len()))
            .field("cert_pem", &format!("{} bytes", self.cert_pem.len()))
            .field("key_pem", &"***")
            .field("key_passphrase", &self.key_passphrase.as_ref().map(|_| "***"))
            .field("check_server_name", &self.check_server_name)
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct UldpConfig {
    pub host: String,
    pub port: u16,

    /// Sent to the collector during negotiation with protocol version 3, ignored for older versions
    pub collector_domain: Option<String>,

    /// TLS is used if and only if this is set
    pub tls: Option<TlsMaterial>,

    /// Compression is requested during negotiation. The collector refusing it is a protocol error.
    pub use_compression: bool,

    /// This is the maximum number of bytes (full frames) that are sent without having been
    ///  acknowledged by the collector. Sending more messages is delayed until acks arrive, and
    ///  a flush request is sent when half of this budget is in flight.
    ///
    /// 0 means 'use the default'.
    pub ack_pending_budget: usize,

    /// Upper bound for the time spent waiting for queued messages to go out and for in-flight
    ///  messages to be acknowledged when the session is closed
    pub closing_budget: Duration,
    pub closing_step: Duration,

    /// number of buffered outgoing bytes above which the transport counts as 'not writable'
    pub write_high_water_mark: usize,

    /// time to wait for the collector to close the connection after the half-close
    pub peer_close_timeout: Duration,
    pub connect_timeout: Duration,
}

impl UldpConfig {
    pub fn new(host: impl Into<String>) -> UldpConfig {
        UldpConfig {
            host: host.into(),
            port: DEFAULT_PORT,
            collector_domain: None,
            tls: None,
            use_compression: false,
            ack_pending_budget: DEFAULT_ACK_PENDING_BUDGET,
            closing_budget: DEFAULT_CLOSING_BUDGET,
            closing_step: DEFAULT_CLOSING_STEP,
            write_high_water_mark: 64*1024,
            peer_close_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// sets the TLS material and switches to the default TLS port
    pub fn with_tls(mut self, tls: TlsMaterial) -> UldpConfig {
        self.tls = Some(tls);
        self.port = DEFAULT_TLS_PORT;
        self
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.host.trim().is_empty() {
            bail!("ULDP host must not be empty");
        }
        if self.port == 0 {
            bail!("ULDP port must not be 0");
        }
        if let Some(domain) = &self.collector_domain {
            if domain.len() > u16::MAX as usize {
                bail!("collector domain is too long: {} bytes", domain.len());
            }
        }
        if self.closing_step.is_zero() {
            bail!("closing step must be positive");
        }
        if self.closing_step > self.closing_budget {
            bail!("closing step {:?} is bigger than the closing budget {:?}", self.closing_step, self.closing_budget);
        }
        if self.write_high_water_mark == 0 {
            bail!("write high water mark must be positive");
        }
        if let Some(tls) = &self.tls {
            if tls.ca_pem.is_empty() || tls.cert_pem.is_empty() || tls.key_pem.is_empty() {
                bail!("TLS requires CA, certificate and private key");
            }
        }
        Ok(())
    }

    pub fn effective_ack_pending_budget(&self) -> usize {
        if self.ack_pending_budget == 0 {
            DEFAULT_ACK_PENDING_BUDGET
        }
        else {
            self.ack_pending_budget
        }
    }
}
