//! Client for the ULDP log delivery protocol: a binary, little-endian protocol over TCP (optionally
//!  TLS, optionally zlib compressed) for delivering log messages to a log management collector.
//!
//! A session starts with a version handshake (hello / version answer) and a negotiation of
//!  session flags (negotiate request / answer). After that, log messages are sent as framed
//!  records carrying a 64 bit sequence id, and the collector acknowledges them cumulatively in
//!  response to flush requests.
//!
//! [client::UldpClient] is the entry point. The session runs in its own task, applying flow
//!  control based on the number of bytes sent but not yet acknowledged, and performs an orderly
//!  shutdown that hands back unacknowledged messages.
//!
//! The [forward] module contains converters from cloud log sources to log messages.

pub mod client;
pub mod config;
pub mod error;
pub mod flow_control;
pub mod forward;
pub mod log_message;
pub mod safe_converter;
pub mod sequence;
mod session;
pub mod shutdown;
pub mod test_util;
pub mod transport;
pub mod wire;
