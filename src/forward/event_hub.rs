use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, trace};

use crate::forward::flatten::to_flat_text;
use crate::log_message::LogMessage;
use crate::wire::origin::OriginAddress;

/// One message of an event hub batch. The records are arbitrary JSON.
#[derive(Clone, Debug, Deserialize)]
pub struct EventHubMessage {
    #[serde(default)]
    pub records: Vec<Value>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EventHubSource {
    /// container cluster monitoring
    ContainerMonitoring,
    /// directory audit logs
    DirectoryAudit,
}

impl EventHubSource {
    pub fn prefix(&self) -> &'static str {
        match self {
            EventHubSource::ContainerMonitoring => "AKSmonitor ",
            EventHubSource::DirectoryAudit => "MSAzureAD ",
        }
    }
}

/// Converts all records of a batch to syslog style messages, in order
pub fn to_log_messages(source: EventHubSource, batch: &[EventHubMessage], origin: OriginAddress, flatten: bool) -> Vec<LogMessage> {
    let messages = batch.iter()
        .flat_map(|m| m.records.iter())
        .map(|record| {
            let text = format!("{}{}", source.prefix(), record_text(source, record, flatten));
            trace!("processed record: {}", text);
            LogMessage::raw_text(record_timestamp(record), origin, text)
        })
        .collect::<Vec<_>>();
    debug!("{} records in {} event hub messages", messages.len(), batch.len());
    messages
}

fn record_text(source: EventHubSource, record: &Value, flatten: bool) -> String {
    match record {
        Value::String(s) if source == EventHubSource::DirectoryAudit => s.clone(),
        Value::Object(_) | Value::Array(_) if flatten => to_flat_text(record),
        _ => record.to_string(),
    }
}

/// the record's `time` field, or now if there is none or it can not be parsed. Times without an
///  offset are UTC.
fn record_timestamp(record: &Value) -> DateTime<FixedOffset> {
    let Some(time) = record.get("time").and_then(Value::as_str) else {
        return Utc::now().fixed_offset();
    };
    match parse_time(time) {
        Some(timestamp) => timestamp,
        None => {
            debug!("record time {:?} is not a recognized timestamp, using the current time", time);
            Utc::now().fixed_offset()
        }
    }
}

fn parse_time(time: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(time).ok()
        .or_else(|| DateTime::parse_from_rfc2822(time).ok())
        .or_else(|| NaiveDateTime::parse_from_str(time, "%Y-%m-%dT%H:%M:%S%.f").ok()
            .map(|naive| naive.and_utc().fixed_offset()))
}
