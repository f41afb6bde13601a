//! The identity store proper
//!
//! A thin async facade over a single rusqlite connection. Reads never
//! observe a partial write: every state-changing operation runs in one
//! transaction, and writers to the same device are serialized by a
//! per-device lock. No component may hold two device locks at once.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rusqlite::{params, Connection, OptionalExtension};
use std::net::IpAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use trustplane_core::types::{
    AuditRecord, Baseline, Decision, Device, DeviceId, DeviceStatus, MacAddr, MitigationRule,
    Policy, Severity, Threat, TrustEvent,
};
use trustplane_core::{Error, Result};

use crate::migrations;

/// A discovered device awaiting administrator approval
#[derive(Debug, Clone)]
pub struct PendingDevice {
    pub id: DeviceId,
    pub mac: MacAddr,
    pub device_type: String,
    pub first_seen: DateTime<Utc>,
}

/// Durable store for device identity and derived state
pub struct IdentityStore {
    conn: Mutex<Connection>,
    device_locks: DashMap<DeviceId, Arc<tokio::sync::Mutex<()>>>,
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(Error::storage)
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.map(|s| parse_ts(&s)).transpose()
}

/// Raw device row, converted outside the rusqlite closure
struct RawDevice {
    device_id: String,
    mac: String,
    device_type: String,
    fingerprint: String,
    cert_serial: Option<String>,
    status: String,
    first_seen: String,
    onboarded_at: Option<String>,
    last_seen: Option<String>,
    profiling_started_at: Option<String>,
    heartbeat_expected: i64,
}

const DEVICE_COLUMNS: &str = "device_id, mac, device_type, fingerprint, cert_serial, status, \
     first_seen, onboarded_at, last_seen, profiling_started_at, heartbeat_expected";

fn read_raw_device(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawDevice> {
    Ok(RawDevice {
        device_id: row.get(0)?,
        mac: row.get(1)?,
        device_type: row.get(2)?,
        fingerprint: row.get(3)?,
        cert_serial: row.get(4)?,
        status: row.get(5)?,
        first_seen: row.get(6)?,
        onboarded_at: row.get(7)?,
        last_seen: row.get(8)?,
        profiling_started_at: row.get(9)?,
        heartbeat_expected: row.get(10)?,
    })
}

impl RawDevice {
    fn into_device(self) -> Result<Device> {
        Ok(Device {
            id: DeviceId::new(self.device_id).map_err(Error::storage)?,
            mac: self.mac.parse().map_err(Error::storage)?,
            device_type: self.device_type,
            fingerprint: self.fingerprint,
            cert_serial: self.cert_serial,
            status: self.status.parse().map_err(Error::storage)?,
            first_seen: parse_ts(&self.first_seen)?,
            onboarded_at: parse_opt_ts(self.onboarded_at)?,
            last_seen: parse_opt_ts(self.last_seen)?,
            profiling_started_at: parse_opt_ts(self.profiling_started_at)?,
            heartbeat_expected: self.heartbeat_expected != 0,
        })
    }
}

impl IdentityStore {
    /// Open (or create) the identity database and run migrations
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path).map_err(Error::storage)?;
        Self::init(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            device_locks: DashMap::new(),
        })
    }

    /// In-memory store for tests
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory().map_err(Error::storage)?;
        Self::init(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            device_locks: DashMap::new(),
        })
    }

    fn init(conn: &mut Connection) -> Result<()> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(Error::storage)?;
        migrations::run(conn)
    }

    /// Per-device write lock; callers must never hold two at once
    pub fn device_lock(&self, id: &DeviceId) -> Arc<tokio::sync::Mutex<()>> {
        self.device_locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned lock means a panic mid-statement; propagating the
        // poison would wedge every later caller.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ---- onboarding ----------------------------------------------------

    /// Record a newly discovered device, pending approval
    ///
    /// Fails with `DuplicateMac` if the MAC is already known to a
    /// non-revoked device, or `DuplicateDeviceId` on an id collision.
    pub async fn register_pending(
        &self,
        mac: MacAddr,
        device_type: &str,
        suggested_id: Option<DeviceId>,
    ) -> Result<DeviceId> {
        let device_id = suggested_id.unwrap_or_else(|| DeviceId::generate(&mac));
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(Error::storage)?;

        let mac_str = mac.to_string();
        let mac_in_use: i64 = tx
            .query_row(
                "SELECT (SELECT COUNT(*) FROM devices WHERE mac = ?1 AND status != 'revoked')
                      + (SELECT COUNT(*) FROM pending_devices WHERE mac = ?1)",
                [&mac_str],
                |r| r.get(0),
            )
            .map_err(Error::storage)?;
        if mac_in_use > 0 {
            return Err(Error::DuplicateMac(mac_str));
        }

        let id_in_use: i64 = tx
            .query_row(
                "SELECT (SELECT COUNT(*) FROM devices WHERE device_id = ?1)
                      + (SELECT COUNT(*) FROM pending_devices WHERE device_id = ?1)",
                [device_id.as_str()],
                |r| r.get(0),
            )
            .map_err(Error::storage)?;
        if id_in_use > 0 {
            return Err(Error::DuplicateDeviceId(device_id.to_string()));
        }

        tx.execute(
            "INSERT INTO pending_devices (device_id, mac, device_type, first_seen)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                device_id.as_str(),
                mac_str,
                device_type,
                Utc::now().to_rfc3339()
            ],
        )
        .map_err(Error::storage)?;
        tx.commit().map_err(Error::storage)?;

        tracing::info!(device_id = %device_id, mac = %mac, "device registered pending approval");
        Ok(device_id)
    }

    /// Devices awaiting approval
    pub async fn list_pending(&self) -> Result<Vec<PendingDevice>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT device_id, mac, device_type, first_seen FROM pending_devices ORDER BY first_seen")
            .map_err(Error::storage)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(Error::storage)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::storage)?;

        rows.into_iter()
            .map(|(id, mac, device_type, first_seen)| {
                Ok(PendingDevice {
                    id: DeviceId::new(id).map_err(Error::storage)?,
                    mac: mac.parse().map_err(Error::storage)?,
                    device_type,
                    first_seen: parse_ts(&first_seen)?,
                })
            })
            .collect()
    }

    /// Approve a pending device: pending → profiling
    pub async fn approve(&self, device_id: &DeviceId, note: &str) -> Result<Device> {
        let lock = self.device_lock(device_id);
        let _guard = lock.lock().await;

        let mut conn = self.conn();
        let tx = conn.transaction().map_err(Error::storage)?;

        let pending = tx
            .query_row(
                "SELECT mac, device_type, first_seen FROM pending_devices WHERE device_id = ?1",
                [device_id.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(Error::storage)?;

        let (mac_str, device_type, first_seen_str) = match pending {
            Some(p) => p,
            None => {
                // Approving twice is a state violation, not a read miss
                let onboarded: i64 = tx
                    .query_row(
                        "SELECT COUNT(*) FROM devices WHERE device_id = ?1",
                        [device_id.as_str()],
                        |r| r.get(0),
                    )
                    .map_err(Error::storage)?;
                if onboarded > 0 {
                    return Err(Error::conflict(format!(
                        "device {} is not pending",
                        device_id
                    )));
                }
                return Err(Error::not_found("pending device", device_id.as_str()));
            }
        };

        let mac: MacAddr = mac_str.parse().map_err(Error::storage)?;
        let first_seen = parse_ts(&first_seen_str)?;
        let now = Utc::now();
        let fingerprint = Device::compute_fingerprint(&mac, &device_type, first_seen);

        tx.execute(
            "INSERT INTO devices (device_id, mac, device_type, fingerprint, status,
                                  first_seen, onboarded_at, profiling_started_at)
             VALUES (?1, ?2, ?3, ?4, 'profiling', ?5, ?6, ?6)",
            params![
                device_id.as_str(),
                mac_str,
                device_type,
                fingerprint,
                first_seen.to_rfc3339(),
                now.to_rfc3339()
            ],
        )
        .map_err(Error::storage)?;
        tx.execute(
            "DELETE FROM pending_devices WHERE device_id = ?1",
            [device_id.as_str()],
        )
        .map_err(Error::storage)?;
        tx.execute(
            "INSERT INTO device_history (device_id, event, detail, created_at)
             VALUES (?1, 'approved', ?2, ?3)",
            params![device_id.as_str(), note, now.to_rfc3339()],
        )
        .map_err(Error::storage)?;
        tx.commit().map_err(Error::storage)?;

        drop(conn);
        self.get_device_sync(device_id)
    }

    /// Reject a pending device: pending → revoked, no certificate issued
    pub async fn reject(&self, device_id: &DeviceId, note: &str) -> Result<()> {
        let lock = self.device_lock(device_id);
        let _guard = lock.lock().await;

        let mut conn = self.conn();
        let tx = conn.transaction().map_err(Error::storage)?;

        let pending = tx
            .query_row(
                "SELECT mac, device_type, first_seen FROM pending_devices WHERE device_id = ?1",
                [device_id.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(Error::storage)?;

        let (mac_str, device_type, first_seen_str) = match pending {
            Some(p) => p,
            None => return Err(Error::not_found("pending device", device_id.as_str())),
        };

        let mac: MacAddr = mac_str.parse().map_err(Error::storage)?;
        let first_seen = parse_ts(&first_seen_str)?;
        let fingerprint = Device::compute_fingerprint(&mac, &device_type, first_seen);
        let now = Utc::now().to_rfc3339();

        tx.execute(
            "INSERT INTO devices (device_id, mac, device_type, fingerprint, status, first_seen)
             VALUES (?1, ?2, ?3, ?4, 'revoked', ?5)",
            params![
                device_id.as_str(),
                mac_str,
                device_type,
                fingerprint,
                first_seen.to_rfc3339()
            ],
        )
        .map_err(Error::storage)?;
        tx.execute(
            "DELETE FROM pending_devices WHERE device_id = ?1",
            [device_id.as_str()],
        )
        .map_err(Error::storage)?;
        tx.execute(
            "INSERT INTO device_history (device_id, event, detail, created_at)
             VALUES (?1, 'rejected', ?2, ?3)",
            params![device_id.as_str(), note, now],
        )
        .map_err(Error::storage)?;
        tx.commit().map_err(Error::storage)?;
        Ok(())
    }

    /// Undo an approval: move the device row back to the pending table
    ///
    /// Used when certificate issuance fails mid-onboarding.
    pub async fn return_to_pending(&self, device_id: &DeviceId) -> Result<()> {
        let lock = self.device_lock(device_id);
        let _guard = lock.lock().await;

        let mut conn = self.conn();
        let tx = conn.transaction().map_err(Error::storage)?;

        let row = tx
            .query_row(
                "SELECT mac, device_type, first_seen FROM devices WHERE device_id = ?1",
                [device_id.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(Error::storage)?;

        let (mac, device_type, first_seen) = match row {
            Some(r) => r,
            None => return Err(Error::not_found("device", device_id.as_str())),
        };

        tx.execute(
            "INSERT INTO pending_devices (device_id, mac, device_type, first_seen)
             VALUES (?1, ?2, ?3, ?4)",
            params![device_id.as_str(), mac, device_type, first_seen],
        )
        .map_err(Error::storage)?;
        tx.execute(
            "DELETE FROM devices WHERE device_id = ?1",
            [device_id.as_str()],
        )
        .map_err(Error::storage)?;
        tx.commit().map_err(Error::storage)?;
        Ok(())
    }

    // ---- device reads and updates --------------------------------------

    fn get_device_sync(&self, device_id: &DeviceId) -> Result<Device> {
        let conn = self.conn();
        let raw = conn
            .query_row(
                &format!("SELECT {} FROM devices WHERE device_id = ?1", DEVICE_COLUMNS),
                [device_id.as_str()],
                read_raw_device,
            )
            .optional()
            .map_err(Error::storage)?;
        match raw {
            Some(raw) => raw.into_device(),
            None => Err(Error::not_found("device", device_id.as_str())),
        }
    }

    pub async fn get_device(&self, device_id: &DeviceId) -> Result<Device> {
        self.get_device_sync(device_id)
    }

    pub async fn get_device_by_mac(&self, mac: &MacAddr) -> Result<Option<Device>> {
        let conn = self.conn();
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {} FROM devices WHERE mac = ?1 AND status != 'revoked'",
                    DEVICE_COLUMNS
                ),
                [mac.to_string()],
                read_raw_device,
            )
            .optional()
            .map_err(Error::storage)?;
        raw.map(RawDevice::into_device).transpose()
    }

    pub async fn list_devices(&self) -> Result<Vec<Device>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM devices ORDER BY device_id",
                DEVICE_COLUMNS
            ))
            .map_err(Error::storage)?;
        let raws = stmt
            .query_map([], read_raw_device)
            .map_err(Error::storage)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::storage)?;
        raws.into_iter().map(RawDevice::into_device).collect()
    }

    pub async fn list_by_status(&self, status: DeviceStatus) -> Result<Vec<Device>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM devices WHERE status = ?1 ORDER BY device_id",
                DEVICE_COLUMNS
            ))
            .map_err(Error::storage)?;
        let raws = stmt
            .query_map([status.as_str()], read_raw_device)
            .map_err(Error::storage)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::storage)?;
        raws.into_iter().map(RawDevice::into_device).collect()
    }

    /// Flip a device's status, recording history; returns the old status
    pub async fn set_status(
        &self,
        device_id: &DeviceId,
        new_status: DeviceStatus,
        detail: &str,
    ) -> Result<DeviceStatus> {
        let lock = self.device_lock(device_id);
        let _guard = lock.lock().await;

        let mut conn = self.conn();
        let tx = conn.transaction().map_err(Error::storage)?;

        let old: Option<String> = tx
            .query_row(
                "SELECT status FROM devices WHERE device_id = ?1",
                [device_id.as_str()],
                |r| r.get(0),
            )
            .optional()
            .map_err(Error::storage)?;
        let old: DeviceStatus = match old {
            Some(s) => s.parse().map_err(Error::storage)?,
            None => return Err(Error::not_found("device", device_id.as_str())),
        };

        tx.execute(
            "UPDATE devices SET status = ?1 WHERE device_id = ?2",
            params![new_status.as_str(), device_id.as_str()],
        )
        .map_err(Error::storage)?;

        // Revocation destroys derived state but keeps the row for audit
        if new_status == DeviceStatus::Revoked {
            tx.execute(
                "DELETE FROM baselines WHERE device_id = ?1",
                [device_id.as_str()],
            )
            .map_err(Error::storage)?;
            tx.execute(
                "DELETE FROM policies WHERE device_id = ?1",
                [device_id.as_str()],
            )
            .map_err(Error::storage)?;
        }

        tx.execute(
            "INSERT INTO device_history (device_id, event, detail, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                device_id.as_str(),
                format!("status:{}", new_status),
                detail,
                Utc::now().to_rfc3339()
            ],
        )
        .map_err(Error::storage)?;
        tx.commit().map_err(Error::storage)?;
        Ok(old)
    }

    pub async fn set_last_seen(&self, device_id: &DeviceId, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn();
        let updated = conn
            .execute(
                "UPDATE devices SET last_seen = ?1 WHERE device_id = ?2",
                params![at.to_rfc3339(), device_id.as_str()],
            )
            .map_err(Error::storage)?;
        if updated == 0 {
            return Err(Error::not_found("device", device_id.as_str()));
        }
        Ok(())
    }

    pub async fn set_cert_serial(
        &self,
        device_id: &DeviceId,
        serial: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn();
        let updated = conn
            .execute(
                "UPDATE devices SET cert_serial = ?1 WHERE device_id = ?2",
                params![serial, device_id.as_str()],
            )
            .map_err(Error::storage)?;
        if updated == 0 {
            return Err(Error::not_found("device", device_id.as_str()));
        }
        Ok(())
    }

    pub async fn set_heartbeat_expected(&self, device_id: &DeviceId, expected: bool) -> Result<()> {
        let conn = self.conn();
        let updated = conn
            .execute(
                "UPDATE devices SET heartbeat_expected = ?1 WHERE device_id = ?2",
                params![expected as i64, device_id.as_str()],
            )
            .map_err(Error::storage)?;
        if updated == 0 {
            return Err(Error::not_found("device", device_id.as_str()));
        }
        Ok(())
    }

    /// Clear the profiling timer once a device has been finalized
    pub async fn clear_profiling_started(&self, device_id: &DeviceId) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE devices SET profiling_started_at = NULL WHERE device_id = ?1",
            [device_id.as_str()],
        )
        .map_err(Error::storage)?;
        Ok(())
    }

    // ---- baselines and policies ----------------------------------------

    pub async fn put_baseline(&self, device_id: &DeviceId, baseline: &Baseline) -> Result<()> {
        let json = serde_json::to_string(baseline).map_err(Error::storage)?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO baselines (device_id, baseline) VALUES (?1, ?2)
             ON CONFLICT(device_id) DO UPDATE SET baseline = excluded.baseline",
            params![device_id.as_str(), json],
        )
        .map_err(Error::storage)?;
        Ok(())
    }

    pub async fn get_baseline(&self, device_id: &DeviceId) -> Result<Option<Baseline>> {
        let conn = self.conn();
        let json: Option<String> = conn
            .query_row(
                "SELECT baseline FROM baselines WHERE device_id = ?1",
                [device_id.as_str()],
                |r| r.get(0),
            )
            .optional()
            .map_err(Error::storage)?;
        json.map(|j| serde_json::from_str(&j).map_err(Error::storage))
            .transpose()
    }

    pub async fn put_policy(&self, device_id: &DeviceId, policy: &Policy) -> Result<()> {
        let json = serde_json::to_string(policy).map_err(Error::storage)?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO policies (device_id, policy, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(device_id) DO UPDATE SET policy = excluded.policy,
                                                  updated_at = excluded.updated_at",
            params![device_id.as_str(), json, Utc::now().to_rfc3339()],
        )
        .map_err(Error::storage)?;
        Ok(())
    }

    pub async fn get_policy(&self, device_id: &DeviceId) -> Result<Option<Policy>> {
        let conn = self.conn();
        let json: Option<String> = conn
            .query_row(
                "SELECT policy FROM policies WHERE device_id = ?1",
                [device_id.as_str()],
                |r| r.get(0),
            )
            .optional()
            .map_err(Error::storage)?;
        json.map(|j| serde_json::from_str(&j).map_err(Error::storage))
            .transpose()
    }

    // ---- trust ---------------------------------------------------------

    /// Set the stored score without a history row (initialization only)
    pub async fn init_trust_score(&self, device_id: &DeviceId, score: i64) -> Result<()> {
        let conn = self.conn();
        let updated = conn
            .execute(
                "UPDATE devices SET trust_score = ?1 WHERE device_id = ?2",
                params![score, device_id.as_str()],
            )
            .map_err(Error::storage)?;
        if updated == 0 {
            return Err(Error::not_found("device", device_id.as_str()));
        }
        Ok(())
    }

    /// Append a trust history row and update the current score atomically
    pub async fn append_trust_event(&self, event: &TrustEvent) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(Error::storage)?;
        let updated = tx
            .execute(
                "UPDATE devices SET trust_score = ?1 WHERE device_id = ?2",
                params![event.score_after, event.device_id.as_str()],
            )
            .map_err(Error::storage)?;
        if updated == 0 {
            return Err(Error::not_found("device", event.device_id.as_str()));
        }
        tx.execute(
            "INSERT INTO trust_score_history (device_id, score_after, delta, reason, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.device_id.as_str(),
                event.score_after,
                event.delta,
                event.reason,
                event.timestamp.to_rfc3339()
            ],
        )
        .map_err(Error::storage)?;
        tx.commit().map_err(Error::storage)?;
        Ok(())
    }

    pub async fn current_trust(&self, device_id: &DeviceId) -> Result<i64> {
        let conn = self.conn();
        conn.query_row(
            "SELECT trust_score FROM devices WHERE device_id = ?1",
            [device_id.as_str()],
            |r| r.get(0),
        )
        .optional()
        .map_err(Error::storage)?
        .ok_or_else(|| Error::not_found("device", device_id.as_str()))
    }

    /// Most recent trust events, newest first
    pub async fn trust_history(
        &self,
        device_id: &DeviceId,
        limit: usize,
    ) -> Result<Vec<TrustEvent>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT score_after, delta, reason, created_at FROM trust_score_history
                 WHERE device_id = ?1 ORDER BY id DESC LIMIT ?2",
            )
            .map_err(Error::storage)?;
        let rows = stmt
            .query_map(params![device_id.as_str(), limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(Error::storage)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::storage)?;

        rows.into_iter()
            .map(|(score_after, delta, reason, created_at)| {
                Ok(TrustEvent {
                    device_id: device_id.clone(),
                    score_after,
                    delta,
                    reason,
                    timestamp: parse_ts(&created_at)?,
                })
            })
            .collect()
    }

    // ---- threats -------------------------------------------------------

    pub async fn upsert_threat(&self, threat: &Threat) -> Result<()> {
        let kinds = serde_json::to_string(&threat.event_kinds).map_err(Error::storage)?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO threats (source_ip, first_seen, last_seen, event_kinds, severity)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(source_ip) DO UPDATE SET last_seen = excluded.last_seen,
                                                  event_kinds = excluded.event_kinds,
                                                  severity = excluded.severity",
            params![
                threat.source_ip.to_string(),
                threat.first_seen.to_rfc3339(),
                threat.last_seen.to_rfc3339(),
                kinds,
                threat.severity.as_str()
            ],
        )
        .map_err(Error::storage)?;
        Ok(())
    }

    pub async fn get_threat(&self, source_ip: IpAddr) -> Result<Option<Threat>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT first_seen, last_seen, event_kinds, severity FROM threats WHERE source_ip = ?1",
                [source_ip.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(Error::storage)?;

        row.map(|(first_seen, last_seen, kinds, severity)| {
            Ok(Threat {
                source_ip,
                first_seen: parse_ts(&first_seen)?,
                last_seen: parse_ts(&last_seen)?,
                event_kinds: serde_json::from_str(&kinds).map_err(Error::storage)?,
                severity: severity.parse().map_err(Error::storage)?,
            })
        })
        .transpose()
    }

    pub async fn list_threats(&self) -> Result<Vec<Threat>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT source_ip, first_seen, last_seen, event_kinds, severity FROM threats")
            .map_err(Error::storage)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .map_err(Error::storage)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::storage)?;

        rows.into_iter()
            .map(|(ip, first_seen, last_seen, kinds, severity)| {
                Ok(Threat {
                    source_ip: ip.parse().map_err(Error::storage)?,
                    first_seen: parse_ts(&first_seen)?,
                    last_seen: parse_ts(&last_seen)?,
                    event_kinds: serde_json::from_str(&kinds).map_err(Error::storage)?,
                    severity: severity.parse().map_err(Error::storage)?,
                })
            })
            .collect()
    }

    pub async fn delete_threat(&self, source_ip: IpAddr) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "DELETE FROM threats WHERE source_ip = ?1",
            [source_ip.to_string()],
        )
        .map_err(Error::storage)?;
        Ok(())
    }

    // ---- mitigation rules ----------------------------------------------

    /// Store a mitigation rule keyed by source IP; idempotent upsert
    pub async fn put_mitigation(&self, rule: &MitigationRule) -> Result<()> {
        let json = serde_json::to_string(rule).map_err(Error::storage)?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO mitigation_rules (source_ip, rule, permanent, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(source_ip) DO UPDATE SET rule = excluded.rule,
                                                  permanent = excluded.permanent",
            params![
                rule.source_ip.to_string(),
                json,
                rule.permanent as i64,
                Utc::now().to_rfc3339()
            ],
        )
        .map_err(Error::storage)?;
        Ok(())
    }

    pub async fn delete_mitigation(&self, source_ip: IpAddr) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "DELETE FROM mitigation_rules WHERE source_ip = ?1",
            [source_ip.to_string()],
        )
        .map_err(Error::storage)?;
        Ok(())
    }

    pub async fn list_mitigations(&self) -> Result<Vec<MitigationRule>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT rule FROM mitigation_rules")
            .map_err(Error::storage)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(Error::storage)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::storage)?;
        rows.into_iter()
            .map(|j| serde_json::from_str(&j).map_err(Error::storage))
            .collect()
    }

    // ---- decision audit ------------------------------------------------

    pub async fn append_audit(&self, record: &AuditRecord) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO decision_audit (created_at, device_id, trust, threat_level,
                                         decision, reason, prev_decision, correlation_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.timestamp.to_rfc3339(),
                record.device_id.as_str(),
                record.trust,
                record.threat_level.map(|s| s.as_str()),
                record.decision.as_str(),
                record.reason,
                record.prev_decision.map(|d| d.as_str()),
                record.correlation_id
            ],
        )
        .map_err(Error::storage)?;
        Ok(())
    }

    /// Audit records at or after `since`, oldest first
    pub async fn audit_since(&self, since: DateTime<Utc>) -> Result<Vec<AuditRecord>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT created_at, device_id, trust, threat_level, decision, reason,
                        prev_decision, correlation_id
                 FROM decision_audit WHERE created_at >= ?1 ORDER BY id",
            )
            .map_err(Error::storage)?;
        let rows = stmt
            .query_map([since.to_rfc3339()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })
            .map_err(Error::storage)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::storage)?;

        rows.into_iter()
            .map(
                |(ts, id, trust, threat, decision, reason, prev, correlation_id)| {
                    Ok(AuditRecord {
                        timestamp: parse_ts(&ts)?,
                        device_id: DeviceId::new(id).map_err(Error::storage)?,
                        trust,
                        threat_level: threat
                            .map(|s| s.parse::<Severity>().map_err(Error::storage))
                            .transpose()?,
                        decision: decision.parse::<Decision>().map_err(Error::storage)?,
                        reason,
                        prev_decision: prev
                            .map(|s| s.parse::<Decision>().map_err(Error::storage))
                            .transpose()?,
                        correlation_id,
                    })
                },
            )
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use trustplane_core::types::{PolicyRule, RuleAction, RuleMatch};

    fn mac(s: &str) -> MacAddr {
        s.parse().unwrap()
    }

    async fn approved_device(store: &IdentityStore) -> DeviceId {
        let id = store
            .register_pending(mac("aa:bb:cc:00:00:01"), "camera", None)
            .await
            .unwrap();
        store.approve(&id, "test approval").await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_register_and_list_pending() {
        let store = IdentityStore::open_in_memory().unwrap();
        let id = store
            .register_pending(mac("aa:bb:cc:00:00:01"), "camera", None)
            .await
            .unwrap();

        let pending = store.list_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
        assert_eq!(pending[0].device_type, "camera");
    }

    #[tokio::test]
    async fn test_duplicate_mac_rejected() {
        let store = IdentityStore::open_in_memory().unwrap();
        store
            .register_pending(mac("aa:bb:cc:00:00:01"), "camera", None)
            .await
            .unwrap();
        let err = store
            .register_pending(mac("aa:bb:cc:00:00:01"), "sensor", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateMac(_)));
    }

    #[tokio::test]
    async fn test_revoked_mac_can_be_reused() {
        let store = IdentityStore::open_in_memory().unwrap();
        let id = approved_device(&store).await;
        store
            .set_status(&id, DeviceStatus::Revoked, "compromised")
            .await
            .unwrap();

        // Same MAC may onboard again once the old device is revoked
        store
            .register_pending(mac("aa:bb:cc:00:00:01"), "camera", None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_device_id_rejected() {
        let store = IdentityStore::open_in_memory().unwrap();
        let chosen = DeviceId::new("iot-cam-01").unwrap();
        store
            .register_pending(mac("aa:bb:cc:00:00:01"), "camera", Some(chosen.clone()))
            .await
            .unwrap();
        let err = store
            .register_pending(mac("aa:bb:cc:00:00:02"), "camera", Some(chosen))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateDeviceId(_)));
    }

    #[tokio::test]
    async fn test_approve_transitions_to_profiling() {
        let store = IdentityStore::open_in_memory().unwrap();
        let id = store
            .register_pending(mac("aa:bb:cc:00:00:01"), "camera", None)
            .await
            .unwrap();

        let device = store.approve(&id, "looks fine").await.unwrap();
        assert_eq!(device.status, DeviceStatus::Profiling);
        assert!(device.profiling_started_at.is_some());
        assert_eq!(device.fingerprint.len(), 64);
        assert!(store.list_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_approve_unknown_device() {
        let store = IdentityStore::open_in_memory().unwrap();
        let err = store
            .approve(&DeviceId::new("dev-none").unwrap(), "")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_reject_keeps_row_for_audit() {
        let store = IdentityStore::open_in_memory().unwrap();
        let id = store
            .register_pending(mac("aa:bb:cc:00:00:01"), "camera", None)
            .await
            .unwrap();
        store.reject(&id, "unknown vendor").await.unwrap();

        let device = store.get_device(&id).await.unwrap();
        assert_eq!(device.status, DeviceStatus::Revoked);
        assert!(device.cert_serial.is_none());
    }

    #[tokio::test]
    async fn test_set_status_records_old() {
        let store = IdentityStore::open_in_memory().unwrap();
        let id = approved_device(&store).await;
        let old = store
            .set_status(&id, DeviceStatus::Active, "window elapsed")
            .await
            .unwrap();
        assert_eq!(old, DeviceStatus::Profiling);
        assert_eq!(
            store.get_device(&id).await.unwrap().status,
            DeviceStatus::Active
        );
    }

    #[tokio::test]
    async fn test_revoke_destroys_baseline_and_policy() {
        let store = IdentityStore::open_in_memory().unwrap();
        let id = approved_device(&store).await;

        let baseline = Baseline {
            avg_pps: 1.0,
            avg_bps: 100.0,
            dst_ips: BTreeSet::new(),
            dst_ports: BTreeSet::new(),
            protocols: BTreeSet::new(),
            sparse: false,
            finalized_at: Utc::now(),
        };
        store.put_baseline(&id, &baseline).await.unwrap();
        store
            .put_policy(&id, &Policy::deny_all())
            .await
            .unwrap();

        store
            .set_status(&id, DeviceStatus::Revoked, "admin")
            .await
            .unwrap();

        assert!(store.get_baseline(&id).await.unwrap().is_none());
        assert!(store.get_policy(&id).await.unwrap().is_none());
        // Row itself survives
        assert!(store.get_device(&id).await.is_ok());
    }

    #[tokio::test]
    async fn test_baseline_roundtrip() {
        let store = IdentityStore::open_in_memory().unwrap();
        let id = approved_device(&store).await;

        assert!(store.get_baseline(&id).await.unwrap().is_none());

        let mut dst_ips = BTreeSet::new();
        dst_ips.insert("10.0.0.10".parse().unwrap());
        let baseline = Baseline {
            avg_pps: 3.5,
            avg_bps: 420.0,
            dst_ips,
            dst_ports: BTreeSet::from([443]),
            protocols: BTreeSet::from([trustplane_core::types::Protocol::Tcp]),
            sparse: false,
            finalized_at: Utc::now(),
        };
        store.put_baseline(&id, &baseline).await.unwrap();
        let loaded = store.get_baseline(&id).await.unwrap().unwrap();
        assert_eq!(loaded.dst_ports, baseline.dst_ports);
        assert!((loaded.avg_pps - 3.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_policy_roundtrip() {
        let store = IdentityStore::open_in_memory().unwrap();
        let id = approved_device(&store).await;

        let policy = Policy::with_default_deny(vec![PolicyRule {
            matches: RuleMatch::dst_port(443),
            action: RuleAction::Allow,
            priority: 100,
        }]);
        store.put_policy(&id, &policy).await.unwrap();
        let loaded = store.get_policy(&id).await.unwrap().unwrap();
        assert_eq!(loaded, policy);
        assert!(loaded.ends_with_default_deny());
    }

    #[tokio::test]
    async fn test_trust_event_append_and_history() {
        let store = IdentityStore::open_in_memory().unwrap();
        let id = approved_device(&store).await;

        store.init_trust_score(&id, 70).await.unwrap();
        assert_eq!(store.current_trust(&id).await.unwrap(), 70);

        store
            .append_trust_event(&TrustEvent {
                device_id: id.clone(),
                score_after: 50,
                delta: -20,
                reason: "behavioral_anomaly:medium".to_string(),
                timestamp: Utc::now(),
            })
            .await
            .unwrap();

        assert_eq!(store.current_trust(&id).await.unwrap(), 50);
        let history = store.trust_history(&id, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].delta, -20);
        assert_eq!(history[0].score_after, 50);
    }

    #[tokio::test]
    async fn test_threat_upsert_and_delete() {
        let store = IdentityStore::open_in_memory().unwrap();
        let ip: IpAddr = "198.51.100.7".parse().unwrap();
        let now = Utc::now();

        let mut threat = Threat {
            source_ip: ip,
            first_seen: now,
            last_seen: now,
            event_kinds: BTreeSet::from(["login_success".to_string()]),
            severity: Severity::High,
        };
        store.upsert_threat(&threat).await.unwrap();

        threat.event_kinds.insert("command_execution".to_string());
        threat.last_seen = now + chrono::Duration::seconds(30);
        store.upsert_threat(&threat).await.unwrap();

        let loaded = store.get_threat(ip).await.unwrap().unwrap();
        assert_eq!(loaded.event_kinds.len(), 2);
        assert_eq!(loaded.first_seen.timestamp(), now.timestamp());

        store.delete_threat(ip).await.unwrap();
        assert!(store.get_threat(ip).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mitigation_upsert_is_idempotent() {
        let store = IdentityStore::open_in_memory().unwrap();
        let ip: IpAddr = "198.51.100.7".parse().unwrap();
        let rule = MitigationRule {
            source_ip: ip,
            action: RuleAction::Deny,
            priority: 200,
            reason: "honeypot login_success".to_string(),
            origin_threat: ip,
            permanent: true,
        };

        for _ in 0..5 {
            store.put_mitigation(&rule).await.unwrap();
        }
        let rules = store.list_mitigations().await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0], rule);
    }

    #[tokio::test]
    async fn test_audit_since_filters() {
        let store = IdentityStore::open_in_memory().unwrap();
        let id = approved_device(&store).await;
        let early = Utc::now() - chrono::Duration::hours(2);

        store
            .append_audit(&AuditRecord {
                timestamp: early,
                device_id: id.clone(),
                trust: 70,
                threat_level: None,
                decision: Decision::Allow,
                reason: "trust >= 70".to_string(),
                prev_decision: None,
                correlation_id: AuditRecord::new_correlation_id(),
            })
            .await
            .unwrap();
        store
            .append_audit(&AuditRecord {
                timestamp: Utc::now(),
                device_id: id.clone(),
                trust: 40,
                threat_level: Some(Severity::Medium),
                decision: Decision::Deny,
                reason: "trust < 50".to_string(),
                prev_decision: Some(Decision::Allow),
                correlation_id: AuditRecord::new_correlation_id(),
            })
            .await
            .unwrap();

        let all = store.audit_since(early - chrono::Duration::hours(1)).await.unwrap();
        assert_eq!(all.len(), 2);

        let recent = store
            .audit_since(Utc::now() - chrono::Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].decision, Decision::Deny);
        assert_eq!(recent[0].prev_decision, Some(Decision::Allow));
    }

    #[tokio::test]
    async fn test_restart_recovers_state() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("identity.db");

        let id;
        {
            let store = IdentityStore::open(&db_path).unwrap();
            id = store
                .register_pending(mac("aa:bb:cc:00:00:01"), "camera", None)
                .await
                .unwrap();
            store.approve(&id, "ok").await.unwrap();
            store.init_trust_score(&id, 70).await.unwrap();
            store
                .append_trust_event(&TrustEvent {
                    device_id: id.clone(),
                    score_after: 55,
                    delta: -15,
                    reason: "behavioral_anomaly:medium".to_string(),
                    timestamp: Utc::now(),
                })
                .await
                .unwrap();
            store
                .put_policy(&id, &Policy::deny_all())
                .await
                .unwrap();
        }

        let store = IdentityStore::open(&db_path).unwrap();
        assert_eq!(store.current_trust(&id).await.unwrap(), 55);
        assert_eq!(
            store.get_device(&id).await.unwrap().status,
            DeviceStatus::Profiling
        );
        assert!(store.get_policy(&id).await.unwrap().is_some());
        assert_eq!(store.trust_history(&id, 10).await.unwrap().len(), 1);
    }
}
