//! Forwarding of cloud log sources to a collector: conversion of the sources' records to log
//!  messages, and running a session that delivers them.

pub mod checkpoint;
pub mod config;
pub mod event_hub;
pub mod flatten;
pub mod windows_events;

use std::sync::Arc;

use tracing::{info, warn};

use crate::client::{CloseReport, UldpClient};
use crate::forward::config::ForwarderConfig;
use crate::log_message::LogMessage;
use crate::transport::Connector;

#[derive(Debug)]
pub struct ForwardSummary {
    /// number of records that were handed to the session
    pub result_count: usize,
    pub report: CloseReport,
}

/// Delivers a batch of messages in a single session: connect, send all, close
pub async fn forward_batch(config: &ForwarderConfig, connector: Arc<dyn Connector>, messages: Vec<LogMessage>) -> anyhow::Result<ForwardSummary> {
    let (client, ready) = UldpClient::spawn(config.uldp.clone(), connector);
    let version = ready.wait().await?;
    info!("connected to {} with protocol version {}", config.uldp.endpoint(), version.raw());

    let result_count = messages.len();
    for message in messages {
        client.send(message)?;
    }

    let report = client.close().await?;
    if report.unacknowledged > 0 {
        warn!("{} events have not been acknowledged", report.unacknowledged);
    }
    info!("forwarding terminated, resultCount={} ({})", result_count, report);
    Ok(ForwardSummary { result_count, report })
}
