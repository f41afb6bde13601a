//! Honeypot event-log tailing and threat-table maintenance

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::Arc;
use trustplane_bus::EventBus;
use trustplane_core::types::{Severity, Threat};
use trustplane_core::{Event, Result};
use trustplane_identity::IdentityStore;

/// One parsed honeypot log record
///
/// Unknown or incomplete records are skipped without error.
#[derive(Debug, Clone, Deserialize)]
pub struct HoneypotEvent {
    pub timestamp: DateTime<Utc>,
    pub eventid: String,
    pub src_ip: IpAddr,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Event kind → severity mapping
pub fn severity_for_eventid(eventid: &str) -> Option<Severity> {
    match eventid {
        "login_success" | "file_download" | "malware_exec" => Some(Severity::High),
        "command_execution" | "repeated_login_attempts" => Some(Severity::Medium),
        "login_attempt" | "port_probe" => Some(Severity::Low),
        _ => None,
    }
}

/// Tails the honeypot log and keeps the threat table current
pub struct HoneypotIngestor {
    store: Arc<IdentityStore>,
    bus: Arc<EventBus>,
    path: PathBuf,
    /// Byte offset already consumed; reset on truncation (log rotation)
    offset: Mutex<u64>,
    threat_ttl: ChronoDuration,
}

impl HoneypotIngestor {
    pub fn new(
        store: Arc<IdentityStore>,
        bus: Arc<EventBus>,
        path: impl Into<PathBuf>,
        threat_ttl_secs: u64,
    ) -> Self {
        Self {
            store,
            bus,
            path: path.into(),
            offset: Mutex::new(0),
            threat_ttl: ChronoDuration::seconds(threat_ttl_secs as i64),
        }
    }

    /// Read and process any log lines appended since the last poll
    ///
    /// Returns the number of events ingested. A missing log file is not an
    /// error; the honeypot may simply not have started yet.
    pub async fn poll_once(&self) -> usize {
        let lines = match self.read_new_lines() {
            Ok(lines) => lines,
            Err(e) => {
                tracing::debug!(path = %self.path.display(), error = %e, "honeypot log unreadable");
                return 0;
            }
        };

        let mut ingested = 0;
        for line in lines {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let event: HoneypotEvent = match serde_json::from_str(line) {
                Ok(event) => event,
                Err(_) => {
                    tracing::debug!("skipping unparseable honeypot record");
                    continue;
                }
            };
            if self.ingest_event(&event).await.is_ok() {
                ingested += 1;
            }
        }
        ingested
    }

    fn read_new_lines(&self) -> std::io::Result<Vec<String>> {
        let mut offset = self.offset.lock().unwrap();
        let file = std::fs::File::open(&self.path)?;
        let len = file.metadata()?.len();
        if len < *offset {
            // Rotated or truncated underneath us; start over
            *offset = 0;
        }

        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(*offset))?;

        let mut lines = Vec::new();
        let mut consumed = *offset;
        loop {
            let mut line = String::new();
            let n = reader.read_line(&mut line)?;
            if n == 0 {
                break;
            }
            // Only consume complete lines; a partial tail is re-read next poll
            if line.ends_with('\n') {
                consumed += n as u64;
                lines.push(line);
            } else {
                break;
            }
        }
        *offset = consumed;
        Ok(lines)
    }

    /// Upsert the threat for one event and announce the update
    pub async fn ingest_event(&self, event: &HoneypotEvent) -> Result<()> {
        let severity = match severity_for_eventid(&event.eventid) {
            Some(severity) => severity,
            None => {
                tracing::debug!(eventid = %event.eventid, "unknown honeypot event kind");
                return Ok(());
            }
        };

        let threat = match self.store.get_threat(event.src_ip).await? {
            Some(mut existing) => {
                existing.last_seen = event.timestamp.max(existing.last_seen);
                existing.event_kinds.insert(event.eventid.clone());
                existing.severity = existing.severity.max(severity);
                existing
            }
            None => Threat {
                source_ip: event.src_ip,
                first_seen: event.timestamp,
                last_seen: event.timestamp,
                event_kinds: BTreeSet::from([event.eventid.clone()]),
                severity,
            },
        };

        self.store.upsert_threat(&threat).await?;

        tracing::info!(
            src_ip = %event.src_ip,
            eventid = %event.eventid,
            severity = %threat.severity,
            "honeypot threat updated"
        );
        self.bus.publish(Event::ThreatUpdated {
            source_ip: event.src_ip,
            severity: threat.severity,
        });
        Ok(())
    }

    /// Age out threats with no events for `threat_ttl`
    pub async fn sweep_expired(&self) {
        let threats = match self.store.list_threats().await {
            Ok(threats) => threats,
            Err(e) => {
                tracing::error!(error = %e, "threat sweep could not list threats");
                return;
            }
        };

        let cutoff = Utc::now() - self.threat_ttl;
        for threat in threats {
            if threat.last_seen < cutoff {
                if let Err(e) = self.store.delete_threat(threat.source_ip).await {
                    tracing::error!(src_ip = %threat.source_ip, error = %e, "threat delete failed");
                    continue;
                }
                tracing::info!(src_ip = %threat.source_ip, "threat aged out");
                self.bus.publish(Event::ThreatExpired {
                    source_ip: threat.source_ip,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use trustplane_bus::BusReceiver;

    fn harness(path: &std::path::Path, ttl_secs: u64) -> (Arc<IdentityStore>, Arc<EventBus>, HoneypotIngestor, BusReceiver) {
        let store = Arc::new(IdentityStore::open_in_memory().unwrap());
        let bus = Arc::new(EventBus::new(256));
        let rx = bus.subscribe();
        let ingestor = HoneypotIngestor::new(Arc::clone(&store), Arc::clone(&bus), path, ttl_secs);
        (store, bus, ingestor, rx)
    }

    fn record(eventid: &str, src_ip: &str) -> String {
        format!(
            "{{\"timestamp\":\"{}\",\"eventid\":\"{}\",\"src_ip\":\"{}\"}}\n",
            Utc::now().to_rfc3339(),
            eventid,
            src_ip
        )
    }

    #[test]
    fn test_severity_mapping() {
        assert_eq!(severity_for_eventid("login_success"), Some(Severity::High));
        assert_eq!(severity_for_eventid("file_download"), Some(Severity::High));
        assert_eq!(severity_for_eventid("malware_exec"), Some(Severity::High));
        assert_eq!(
            severity_for_eventid("command_execution"),
            Some(Severity::Medium)
        );
        assert_eq!(
            severity_for_eventid("repeated_login_attempts"),
            Some(Severity::Medium)
        );
        assert_eq!(severity_for_eventid("login_attempt"), Some(Severity::Low));
        assert_eq!(severity_for_eventid("port_probe"), Some(Severity::Low));
        assert_eq!(severity_for_eventid("something_else"), None);
    }

    #[tokio::test]
    async fn test_tail_ingests_appended_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.json");
        std::fs::write(&path, record("login_attempt", "198.51.100.7")).unwrap();

        let (store, _bus, ingestor, mut rx) = harness(&path, 86_400);

        assert_eq!(ingestor.poll_once().await, 1);

        // Append a second, escalating event
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(record("login_success", "198.51.100.7").as_bytes())
            .unwrap();
        assert_eq!(ingestor.poll_once().await, 1);

        let threat = store
            .get_threat("198.51.100.7".parse().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(threat.severity, Severity::High);
        assert_eq!(threat.event_kinds.len(), 2);

        // Two ThreatUpdated events published, severity escalating
        let mut severities = Vec::new();
        while let Some(event) = rx.try_recv() {
            if let Event::ThreatUpdated { severity, .. } = event {
                severities.push(severity);
            }
        }
        assert_eq!(severities, vec![Severity::Low, Severity::High]);
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_records_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.json");
        let mut content = String::new();
        content.push_str("this is not json\n");
        content.push_str(&record("weird_event", "198.51.100.9"));
        content.push_str("{\"eventid\":\"login_attempt\"}\n"); // missing src_ip
        content.push_str(&record("port_probe", "198.51.100.8"));
        std::fs::write(&path, content).unwrap();

        let (store, _bus, ingestor, _rx) = harness(&path, 86_400);
        ingestor.poll_once().await;

        assert!(store
            .get_threat("198.51.100.9".parse().unwrap())
            .await
            .unwrap()
            .is_none());
        assert!(store
            .get_threat("198.51.100.8".parse().unwrap())
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_missing_log_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (_store, _bus, ingestor, _rx) = harness(&dir.path().join("absent.json"), 86_400);
        assert_eq!(ingestor.poll_once().await, 0);
    }

    #[tokio::test]
    async fn test_rotation_resets_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.json");
        std::fs::write(&path, record("login_attempt", "198.51.100.7")).unwrap();

        let (store, _bus, ingestor, _rx) = harness(&path, 86_400);
        ingestor.poll_once().await;

        // Rotate: shorter file with fresh content
        std::fs::write(&path, record("port_probe", "198.51.100.8")).unwrap();
        ingestor.poll_once().await;

        assert!(store
            .get_threat("198.51.100.8".parse().unwrap())
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_ttl_sweep_expires_idle_threats() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.json");
        let (store, _bus, ingestor, mut rx) = harness(&path, 3600);

        let old_event = HoneypotEvent {
            timestamp: Utc::now() - ChronoDuration::hours(5),
            eventid: "login_attempt".to_string(),
            src_ip: "198.51.100.7".parse().unwrap(),
            command: None,
            username: None,
            password: None,
        };
        ingestor.ingest_event(&old_event).await.unwrap();

        let fresh_event = HoneypotEvent {
            timestamp: Utc::now(),
            eventid: "port_probe".to_string(),
            src_ip: "198.51.100.8".parse().unwrap(),
            command: None,
            username: None,
            password: None,
        };
        ingestor.ingest_event(&fresh_event).await.unwrap();
        while rx.try_recv().is_some() {}

        ingestor.sweep_expired().await;

        assert!(store
            .get_threat("198.51.100.7".parse().unwrap())
            .await
            .unwrap()
            .is_none());
        assert!(store
            .get_threat("198.51.100.8".parse().unwrap())
            .await
            .unwrap()
            .is_some());

        let mut expired = Vec::new();
        while let Some(event) = rx.try_recv() {
            if let Event::ThreatExpired { source_ip } = event {
                expired.push(source_ip);
            }
        }
        assert_eq!(expired, vec!["198.51.100.7".parse::<IpAddr>().unwrap()]);
    }
}
