use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use serde::{Deserialize, Deserializer};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

#[cfg(test)]
use mockall::automock;

use crate::client::UldpClient;
use crate::forward::checkpoint::CheckpointStore;
use crate::log_message::LogMessage;
use crate::wire::origin::OriginAddress;

/// .NET ticks (100ns units since 0001-01-01) at the Unix epoch
pub const TICKS_AT_UNIX_EPOCH: u64 = 621_355_968_000_000_000;
const TICKS_PER_MILLI: u64 = 10_000;

pub fn ticks_from_datetime<Tz: TimeZone>(t: &DateTime<Tz>) -> u64 {
    let millis = u64::try_from(t.timestamp_millis()).unwrap_or(0);
    millis * TICKS_PER_MILLI + TICKS_AT_UNIX_EPOCH
}

const KEYWORD_AUDIT_FAILURE: &str = "0x8010000000000000";
const KEYWORD_AUDIT_SUCCESS: &str = "0x8020000000000000";

/// A row of the diagnostics agent's Windows event table. Provider, keywords and computer are only
///  available inside the event's XML representation, see [EventSystem].
#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WindowsEventRow {
    #[serde(deserialize_with = "tick_count")]
    pub event_tick_count: u64,
    pub precise_time_stamp: DateTime<FixedOffset>,
    pub level: u32,
    pub channel: String,
    pub event_id: u32,
    #[serde(default)]
    pub description: String,
    pub raw_xml: String,
}

/// 64 bit values come as strings from the table service, but are accepted as numbers as well
fn tick_count<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

/// The parts of an event's `<System>` element that go into the snare line
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EventSystem {
    /// `Provider/@Name`
    pub provider: String,
    pub keywords: String,
    pub computer: String,
}

impl EventSystem {
    /// Extracts `Event/System` from an event's XML. Elements are matched by local name, so the
    ///  event schema's default namespace does not matter.
    pub fn from_raw_xml(raw_xml: &str) -> anyhow::Result<EventSystem> {
        let doc = roxmltree::Document::parse(raw_xml)
            .context("malformed event XML")?;

        let event = doc.root_element();
        if event.tag_name().name() != "Event" {
            bail!("event XML has root element <{}> instead of <Event>", event.tag_name().name());
        }
        let system = child(event, "System")?;

        let provider = child(system, "Provider")?
            .attribute("Name")
            .ok_or_else(|| anyhow!("event XML has no Provider/@Name"))?;

        Ok(EventSystem {
            provider: provider.to_string(),
            keywords: child_text(system, "Keywords")?,
            computer: child_text(system, "Computer")?,
        })
    }

    pub fn event_log_type(&self, level: u32) -> &str {
        match self.keywords.as_str() {
            KEYWORD_AUDIT_FAILURE => "audit failure",
            KEYWORD_AUDIT_SUCCESS => "audit success",
            _ => match level {
                1 => "Critical",
                2 => "Error",
                3 => "Warning",
                4 => "Information",
                5 => "Verbose",
                _ => self.keywords.as_str(),
            }
        }
    }
}

fn child<'a, 'input>(node: roxmltree::Node<'a, 'input>, name: &str) -> anyhow::Result<roxmltree::Node<'a, 'input>> {
    node.children()
        .find(|n| n.is_element() && n.tag_name().name() == name)
        .ok_or_else(|| anyhow!("event XML has no <{}> in <{}>", name, node.tag_name().name()))
}

fn child_text(node: roxmltree::Node, name: &str) -> anyhow::Result<String> {
    Ok(child(node, name)?
        .text()
        .unwrap_or("")
        .trim()
        .to_string())
}

impl WindowsEventRow {
    pub fn system(&self) -> anyhow::Result<EventSystem> {
        EventSystem::from_raw_xml(&self.raw_xml)
            .with_context(|| format!("event with tick count {}", self.event_tick_count))
    }

    /// The event as a tab separated 'snare' line with a syslog prefix
    pub fn snare_line(&self) -> anyhow::Result<String> {
        let system = self.system()?;
        let ts = &self.precise_time_stamp;
        let description = self.description
            .replace('\t', "   ")
            .replace('\n', " ");

        let fields = [
            self.level.to_string(),
            self.channel.clone(),
            "0".to_string(), // event counter
            ts.format("%a %b %d %H:%M:%S %Y").to_string(),
            self.event_id.to_string(),
            system.provider.clone(),
            "N/A".to_string(), // user name
            "N/A".to_string(), // SID type
            system.event_log_type(self.level).to_string(),
            system.computer.clone(),
            "unknown".to_string(), // category
            String::new(), // data
            description,
            "1234".to_string(), // checksum
        ];

        Ok(format!("<47>{} {} MSWinEventLog\t{}", ts.format("%b %d %H:%M:%S"), system.computer, fields.join("\t")))
    }

    pub fn to_log_message(&self, origin: OriginAddress) -> anyhow::Result<LogMessage> {
        Ok(LogMessage::raw_text(self.precise_time_stamp, origin, self.snare_line()?))
    }
}

#[derive(Clone, Debug, Default)]
pub struct EventPage {
    pub rows: Vec<WindowsEventRow>,
    /// present if there are more rows to query
    pub continuation: Option<String>,
}

/// Paged access to the event table
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventTable: Send + Sync {
    /// Returns a page of rows with a tick count greater than `after_tick_count`. The first page is
    ///  requested without continuation token, subsequent pages with the previous page's token.
    async fn query_page(&self, after_tick_count: u64, continuation: Option<String>) -> anyhow::Result<EventPage>;
}

/// An event table backed by a list of rows, e.g. an export of the actual table
pub struct InMemoryEventTable {
    rows: Vec<WindowsEventRow>,
    page_size: usize,
}

impl InMemoryEventTable {
    pub fn new(rows: Vec<WindowsEventRow>, page_size: usize) -> InMemoryEventTable {
        InMemoryEventTable {
            rows,
            page_size: page_size.max(1),
        }
    }
}

#[async_trait]
impl EventTable for InMemoryEventTable {
    async fn query_page(&self, after_tick_count: u64, continuation: Option<String>) -> anyhow::Result<EventPage> {
        let offset = match continuation {
            None => 0,
            Some(token) => token.parse::<usize>()?,
        };

        let mut matching = self.rows.iter()
            .filter(|r| r.event_tick_count > after_tick_count)
            .skip(offset);
        let rows = matching.by_ref()
            .take(self.page_size)
            .cloned()
            .collect::<Vec<_>>();
        let continuation = matching.next()
            .map(|_| (offset + rows.len()).to_string());

        Ok(EventPage { rows, continuation })
    }
}

/// Forwards all events that were added to the table since the stored checkpoint, page by page,
///  storing the new checkpoint after each page. Stops early when `deadline` has passed, leaving
///  the remaining rows for the next run. Returns the number of rows read from the table.
///
/// A row with malformed XML fails the scan. The checkpoint of its page is not stored, so the page
///  is read again by the next run.
///
/// Without a stored checkpoint, the scan starts at the current time.
pub async fn scan_table(
    table: &dyn EventTable,
    checkpoints: &mut dyn CheckpointStore,
    client: &UldpClient,
    origin: OriginAddress,
    deadline: Instant,
) -> anyhow::Result<usize> {
    let initial = match checkpoints.load().await? {
        Some(checkpoint) => {
            info!("checkpoint read: {}", checkpoint);
            checkpoint
        }
        None => {
            let checkpoint = ticks_from_datetime(&Utc::now());
            info!("no checkpoint found, starting at {}", checkpoint);
            checkpoints.store(checkpoint).await?;
            checkpoint
        }
    };

    let mut checkpoint = initial;
    let mut result_count = 0;
    let mut continuation = None;
    loop {
        let page = table.query_page(initial, continuation.take()).await?;
        let page_start = checkpoint;

        for row in &page.rows {
            result_count += 1;
            if row.event_tick_count < page_start {
                warn!("event tick count {} is smaller than the previous checkpoint {} - skipping", row.event_tick_count, page_start);
                continue;
            }
            checkpoint = checkpoint.max(row.event_tick_count);

            let message = row.to_log_message(origin)?;
            trace!("forwarding {:?}", message.text());
            client.send(message)?;
        }

        if checkpoint != page_start {
            checkpoints.store(checkpoint).await?;
        }

        continuation = page.continuation;
        if continuation.is_none() {
            break;
        }
        if Instant::now() >= deadline {
            warn!("running late, bailing out after collecting {} results", result_count);
            break;
        }
        debug!("continuing with next page, {} results so far", result_count);
    }
    Ok(result_count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use mockall::predicate::eq;
    use rstest::rstest;

    use crate::forward::checkpoint::InMemoryCheckpointStore;
    use crate::config::UldpConfig;
    use crate::test_util::{fake_collector, CollectedFrame};

    fn raw_xml(keywords: &str) -> String {
        format!("<Event xmlns='http://schemas.microsoft.com/win/2004/08/events/event'>\
            <System>\
                <Provider Name='Microsoft-Windows-Security-Auditing' Guid='{{54849625-5478-4994-A5BA-3E3B0328C30D}}'/>\
                <EventID>4624</EventID>\
                <Version>2</Version>\
                <Level>0</Level>\
                <Task>12544</Task>\
                <Opcode>0</Opcode>\
                <Keywords>{}</Keywords>\
                <TimeCreated SystemTime='2019-03-04T09:05:06.789012300Z'/>\
                <EventRecordID>28513</EventRecordID>\
                <Correlation/>\
                <Execution ProcessID='628' ThreadID='4412'/>\
                <Channel>Security</Channel>\
                <Computer>vm-01</Computer>\
                <Security/>\
            </System>\
            <EventData>\
                <Data Name='SubjectUserSid'>S-1-5-18</Data>\
                <Data Name='LogonType'>5</Data>\
            </EventData>\
        </Event>", keywords)
    }

    fn row(tick_count: u64, level: u32, keywords: &str) -> WindowsEventRow {
        WindowsEventRow {
            event_tick_count: tick_count,
            precise_time_stamp: DateTime::parse_from_rfc3339("2019-03-04T09:05:06.789Z").unwrap(),
            level,
            channel: "Security".to_string(),
            event_id: 4624,
            description: "An account was\tsuccessfully logged on.\nSubject:".to_string(),
            raw_xml: raw_xml(keywords),
        }
    }

    #[test]
    fn test_ticks() {
        let t = DateTime::parse_from_rfc3339("1970-01-01T00:00:00.001Z").unwrap();
        assert_eq!(ticks_from_datetime(&t), TICKS_AT_UNIX_EPOCH + 10_000);
    }

    #[test]
    fn test_snare_line() {
        assert_eq!(
            row(1, 0, KEYWORD_AUDIT_SUCCESS).snare_line().unwrap(),
            "<47>Mar 04 09:05:06 vm-01 MSWinEventLog\t0\tSecurity\t0\tMon Mar 04 09:05:06 2019\t4624\tMicrosoft-Windows-Security-Auditing\tN/A\tN/A\taudit success\tvm-01\tunknown\t\tAn account was   successfully logged on. Subject:\t1234"
        );
    }

    #[rstest]
    #[case::audit_failure(4, KEYWORD_AUDIT_FAILURE, "audit failure")]
    #[case::audit_success(4, KEYWORD_AUDIT_SUCCESS, "audit success")]
    #[case::critical(1, "0x80000000000000", "Critical")]
    #[case::error(2, "", "Error")]
    #[case::warning(3, "", "Warning")]
    #[case::information(4, "0x80000000000000", "Information")]
    #[case::verbose(5, "", "Verbose")]
    #[case::unknown_level(0, "0x80000000000000", "0x80000000000000")]
    fn test_event_log_type(#[case] level: u32, #[case] keywords: &str, #[case] expected: &str) {
        assert_eq!(row(1, level, keywords).system().unwrap().event_log_type(level), expected);
    }

    #[test]
    fn test_system_from_raw_xml() {
        let system = EventSystem::from_raw_xml(&raw_xml(KEYWORD_AUDIT_FAILURE)).unwrap();
        assert_eq!(system, EventSystem {
            provider: "Microsoft-Windows-Security-Auditing".to_string(),
            keywords: KEYWORD_AUDIT_FAILURE.to_string(),
            computer: "vm-01".to_string(),
        });
    }

    #[rstest]
    #[case::not_xml("this is not XML")]
    #[case::unclosed("<Event><System><Computer>vm-01</Computer></System>")]
    #[case::wrong_root("<Events><System/></Events>")]
    #[case::no_system("<Event><EventData/></Event>")]
    #[case::no_provider_name("<Event><System><Provider/><Keywords>0x80</Keywords><Computer>vm-01</Computer></System></Event>")]
    #[case::no_computer("<Event><System><Provider Name='p'/><Keywords>0x80</Keywords></System></Event>")]
    fn test_malformed_raw_xml(#[case] xml: &str) {
        assert!(EventSystem::from_raw_xml(xml).is_err());

        let mut row = row(1, 4, "");
        row.raw_xml = xml.to_string();
        assert!(row.snare_line().is_err());
        assert!(row.to_log_message(OriginAddress::Unspecified).is_err());
    }

    #[rstest]
    #[case::text(r#""636870000000000000""#)]
    #[case::number("636870000000000000")]
    fn test_deserialize_row(#[case] tick_count: &str) {
        let json = format!(r#"{{
            "PartitionKey": "0636870000000000000",
            "RowKey": "Microsoft-Windows-Security-Auditing___0000000000004624___0000000000000001",
            "PreciseTimeStamp": "2019-03-04T09:05:06.789Z",
            "EventTickCount": {},
            "DeploymentId": "c0ffee00-0000-0000-0000-000000000000",
            "Role": "IaaS",
            "RoleInstance": "_vm-01",
            "ProviderGuid": "{{54849625-5478-4994-A5BA-3E3B0328C30D}}",
            "ProviderName": "Microsoft-Windows-Security-Auditing",
            "EventId": 4624,
            "Level": 4,
            "Pid": 628,
            "Tid": 4412,
            "Opcode": 0,
            "Task": 12544,
            "Channel": "Security",
            "Description": "An account was successfully logged on.",
            "RawXml": {}
        }}"#, tick_count, serde_json::to_string(&raw_xml("0x8020000000000000")).unwrap());
        let row: WindowsEventRow = serde_json::from_str(&json).unwrap();
        assert_eq!(row.event_tick_count, 636_870_000_000_000_000);
        assert_eq!(row.channel, "Security");

        assert_eq!(
            row.snare_line().unwrap(),
            "<47>Mar 04 09:05:06 vm-01 MSWinEventLog\t4\tSecurity\t0\tMon Mar 04 09:05:06 2019\t4624\tMicrosoft-Windows-Security-Auditing\tN/A\tN/A\taudit success\tvm-01\tunknown\t\tAn account was successfully logged on.\t1234"
        );
    }

    #[test]
    fn test_row_without_raw_xml_is_rejected() {
        let json = r#"{
            "EventTickCount": "636870000000000000",
            "PreciseTimeStamp": "2019-03-04T09:05:06.789Z",
            "Level": 4,
            "Channel": "System",
            "EventId": 7036
        }"#;
        assert!(serde_json::from_str::<WindowsEventRow>(json).is_err());
    }

    #[tokio::test]
    async fn test_in_memory_paging() {
        let rows = (1..=5).map(|t| row(t, 4, "")).collect::<Vec<_>>();
        let table = InMemoryEventTable::new(rows, 2);

        let first = table.query_page(1, None).await.unwrap();
        assert_eq!(first.rows.iter().map(|r| r.event_tick_count).collect::<Vec<_>>(), vec![2, 3]);
        let second = table.query_page(1, first.continuation).await.unwrap();
        assert_eq!(second.rows.iter().map(|r| r.event_tick_count).collect::<Vec<_>>(), vec![4, 5]);
        assert!(second.continuation.is_none());
    }

    /// runs a scan against a fake collector that acknowledges every message, returning the
    ///  scan result and the number of forwarded messages
    async fn scan(table: &dyn EventTable, checkpoints: &mut InMemoryCheckpointStore, deadline: Instant) -> (usize, usize) {
        let (connector, mut collector) = fake_collector("10.0.0.5".parse().unwrap());
        let (client, ready) = UldpClient::spawn(UldpConfig::new("collector.test"), Arc::new(connector));
        collector.handshake(1).await.unwrap();
        ready.wait().await.unwrap();

        let acker = tokio::spawn(async move {
            let mut forwarded = 0;
            while let Some(frame) = collector.next_frame().await.unwrap() {
                if let CollectedFrame::LogMessage { header, .. } = frame {
                    forwarded += 1;
                    collector.send_ack(header.sequence).await.unwrap();
                }
            }
            forwarded
        });

        let result_count = scan_table(table, checkpoints, &client, OriginAddress::Unspecified, deadline).await.unwrap();
        let report = client.close().await.unwrap();
        let forwarded = acker.await.unwrap();
        assert_eq!(report.sent as usize, forwarded);
        assert_eq!(report.unacknowledged, 0);
        (result_count, forwarded)
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_stores_checkpoint_per_page() {
        let rows = vec![row(20, 4, ""), row(30, 4, ""), row(25, 4, ""), row(40, 4, "")];
        let table = InMemoryEventTable::new(rows, 2);
        let mut checkpoints = InMemoryCheckpointStore { value: Some(10), history: Vec::new() };

        let (result_count, forwarded) = scan(&table, &mut checkpoints, Instant::now() + Duration::from_secs(300)).await;

        assert_eq!(result_count, 4);
        // 25 is below the checkpoint at the start of the second page
        assert_eq!(forwarded, 3);
        assert_eq!(checkpoints.history, vec![30, 40]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_without_checkpoint_starts_now() {
        let before = ticks_from_datetime(&Utc::now());
        let table = InMemoryEventTable::new(vec![row(10, 4, "")], 10);
        let mut checkpoints = InMemoryCheckpointStore::default();

        let (result_count, forwarded) = scan(&table, &mut checkpoints, Instant::now() + Duration::from_secs(300)).await;

        assert_eq!((result_count, forwarded), (0, 0));
        assert_eq!(checkpoints.history.len(), 1);
        assert!(checkpoints.history[0] >= before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_stops_after_deadline() {
        let mut table = MockEventTable::new();
        table.expect_query_page()
            .with(eq(10), eq(None::<String>))
            .times(1)
            .returning(|_, _| Ok(EventPage {
                rows: vec![row(11, 4, "")],
                continuation: Some("more".to_string()),
            }));
        let mut checkpoints = InMemoryCheckpointStore { value: Some(10), history: Vec::new() };

        let (result_count, forwarded) = scan(&table, &mut checkpoints, Instant::now()).await;

        assert_eq!((result_count, forwarded), (1, 1));
        assert_eq!(checkpoints.history, vec![11]);
    }

    #[tokio::test]
    async fn test_scan_query_failure() {
        let mut table = MockEventTable::new();
        table.expect_query_page()
            .returning(|_, _| Err(anyhow::anyhow!("table service unavailable")));
        let mut checkpoints = InMemoryCheckpointStore { value: Some(10), history: Vec::new() };

        let (connector, _collector) = fake_collector("10.0.0.5".parse().unwrap());
        let (client, _ready) = UldpClient::spawn(UldpConfig::new("collector.test"), Arc::new(connector));

        let result = scan_table(&table, &mut checkpoints, &client, OriginAddress::Unspecified, Instant::now()).await;
        assert!(result.is_err());
        assert!(checkpoints.history.is_empty());
    }

    #[tokio::test]
    async fn test_scan_fails_on_malformed_xml() {
        let mut broken = row(30, 4, "");
        broken.raw_xml = "<Event>".to_string();
        let table = InMemoryEventTable::new(vec![row(20, 4, ""), broken], 10);
        let mut checkpoints = InMemoryCheckpointStore { value: Some(10), history: Vec::new() };

        let (connector, _collector) = fake_collector("10.0.0.5".parse().unwrap());
        let (client, _ready) = UldpClient::spawn(UldpConfig::new("collector.test"), Arc::new(connector));

        let result = scan_table(&table, &mut checkpoints, &client, OriginAddress::Unspecified, Instant::now()).await;
        assert!(result.is_err());
        assert!(checkpoints.history.is_empty());
    }

    #[test]
    fn test_message_is_raw_text() {
        let msg = row(1, 2, "").to_log_message(OriginAddress::Unspecified).unwrap();
        assert!(matches!(msg, LogMessage::RawText { .. }));
        assert_eq!(msg.timestamp().timestamp_subsec_millis(), 789);
    }
}
