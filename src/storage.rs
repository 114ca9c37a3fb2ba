use anyhow::{anyhow, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::time::Duration;

use crate::alert::{AlertEvent, Severity};
use crate::Detection;

/// Persistence for detections and alert records. Rows come back in the
/// order they were appended.
pub trait DetectionStore: Send {
    fn append_detection(&mut self, detection: &Detection) -> Result<i64>;

    fn record_alert(&mut self, alert: &AlertEvent) -> Result<i64>;

    /// The `limit` most recent detections, oldest first.
    fn recent_detections(&mut self, limit: usize) -> Result<Vec<Detection>>;

    /// The `limit` most recent alerts, oldest first.
    fn list_alerts(&mut self, limit: usize) -> Result<Vec<StoredAlert>>;

    /// Returns false when no alert has that id.
    fn acknowledge_alert(&mut self, id: i64) -> Result<bool>;

    /// Delete detections and alerts older than `retention`. Returns the
    /// number of rows removed.
    fn enforce_retention(&mut self, retention: Duration) -> Result<usize>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct StoredAlert {
    pub id: i64,
    pub acknowledged: bool,
    pub event: AlertEvent,
}

fn retention_cutoff_ms(retention: Duration) -> Result<i64> {
    let span = i64::try_from(retention.as_millis())
        .map_err(|_| anyhow!("retention exceeds i64 range"))?;
    Ok(Utc::now().timestamp_millis().saturating_sub(span))
}

pub struct SqliteDetectionStore {
    conn: Connection,
}

impl SqliteDetectionStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS detections (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              created_at_ms INTEGER NOT NULL,
              source TEXT NOT NULL,
              label TEXT NOT NULL,
              confidence REAL NOT NULL,
              payload_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS alerts (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              created_at_ms INTEGER NOT NULL,
              source TEXT NOT NULL,
              alert_type TEXT NOT NULL,
              severity TEXT NOT NULL,
              confidence REAL NOT NULL,
              acknowledged INTEGER NOT NULL DEFAULT 0,
              payload_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_detections_created ON detections(created_at_ms);
            CREATE INDEX IF NOT EXISTS idx_alerts_created ON alerts(created_at_ms);
            "#,
        )?;
        Ok(())
    }
}

impl DetectionStore for SqliteDetectionStore {
    fn append_detection(&mut self, detection: &Detection) -> Result<i64> {
        let payload_json = serde_json::to_string(detection)?;
        self.conn.execute(
            r#"
            INSERT INTO detections(created_at_ms, source, label, confidence, payload_json)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                detection.timestamp().timestamp_millis(),
                detection.source(),
                detection.label(),
                detection.confidence() as f64,
                payload_json
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn record_alert(&mut self, alert: &AlertEvent) -> Result<i64> {
        let payload_json = serde_json::to_string(alert)?;
        self.conn.execute(
            r#"
            INSERT INTO alerts(created_at_ms, source, alert_type, severity, confidence, payload_json)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                alert.created_at.timestamp_millis(),
                alert.source,
                alert.alert_type,
                alert.severity.as_str(),
                alert.confidence as f64,
                payload_json
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn recent_detections(&mut self, limit: usize) -> Result<Vec<Detection>> {
        let payloads = {
            let mut stmt = self.conn.prepare(
                "SELECT payload_json FROM (SELECT id, payload_json FROM detections ORDER BY id DESC LIMIT ?1) ORDER BY id ASC",
            )?;
            let mut rows = stmt.query(params![limit as i64])?;
            let mut payloads = Vec::new();
            while let Some(row) = rows.next()? {
                let payload: String = row.get(0)?;
                payloads.push(payload);
            }
            payloads
        };

        payloads
            .iter()
            .map(|p| serde_json::from_str(p).map_err(|e| anyhow!("corrupt detection row: {}", e)))
            .collect()
    }

    fn list_alerts(&mut self, limit: usize) -> Result<Vec<StoredAlert>> {
        let rows = {
            let mut stmt = self.conn.prepare(
                "SELECT id, acknowledged, severity, payload_json FROM (SELECT * FROM alerts ORDER BY id DESC LIMIT ?1) ORDER BY id ASC",
            )?;
            let mut rows = stmt.query(params![limit as i64])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let id: i64 = row.get(0)?;
                let acknowledged: i64 = row.get(1)?;
                let severity: String = row.get(2)?;
                let payload: String = row.get(3)?;
                out.push((id, acknowledged != 0, severity, payload));
            }
            out
        };

        let mut alerts = Vec::with_capacity(rows.len());
        for (id, acknowledged, severity, payload) in rows {
            let mut event: AlertEvent = serde_json::from_str(&payload)
                .map_err(|e| anyhow!("corrupt alert row {}: {}", id, e))?;
            event.severity = Severity::parse(&severity)?;
            alerts.push(StoredAlert {
                id,
                acknowledged,
                event,
            });
        }
        Ok(alerts)
    }

    fn acknowledge_alert(&mut self, id: i64) -> Result<bool> {
        let exists: Option<i64> = self
            .conn
            .query_row("SELECT id FROM alerts WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()?;
        if exists.is_none() {
            return Ok(false);
        }
        self.conn.execute(
            "UPDATE alerts SET acknowledged = 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(true)
    }

    fn enforce_retention(&mut self, retention: Duration) -> Result<usize> {
        let cutoff = retention_cutoff_ms(retention)?;
        let tx = self.conn.transaction()?;
        let detections = tx.execute(
            "DELETE FROM detections WHERE created_at_ms < ?1",
            params![cutoff],
        )?;
        let alerts = tx.execute(
            "DELETE FROM alerts WHERE created_at_ms < ?1",
            params![cutoff],
        )?;
        tx.commit()?;
        Ok(detections + alerts)
    }
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryDetectionStore {
    detections: Vec<Detection>,
    alerts: Vec<StoredAlert>,
    next_alert_id: i64,
    next_detection_id: i64,
}

impl InMemoryDetectionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn tail<T: Clone>(items: &[T], limit: usize) -> Vec<T> {
    items[items.len().saturating_sub(limit)..].to_vec()
}

impl DetectionStore for InMemoryDetectionStore {
    fn append_detection(&mut self, detection: &Detection) -> Result<i64> {
        self.next_detection_id += 1;
        self.detections.push(detection.clone());
        Ok(self.next_detection_id)
    }

    fn record_alert(&mut self, alert: &AlertEvent) -> Result<i64> {
        self.next_alert_id += 1;
        self.alerts.push(StoredAlert {
            id: self.next_alert_id,
            acknowledged: false,
            event: alert.clone(),
        });
        Ok(self.next_alert_id)
    }

    fn recent_detections(&mut self, limit: usize) -> Result<Vec<Detection>> {
        Ok(tail(&self.detections, limit))
    }

    fn list_alerts(&mut self, limit: usize) -> Result<Vec<StoredAlert>> {
        Ok(tail(&self.alerts, limit))
    }

    fn acknowledge_alert(&mut self, id: i64) -> Result<bool> {
        match self.alerts.iter_mut().find(|a| a.id == id) {
            Some(alert) => {
                alert.acknowledged = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn enforce_retention(&mut self, retention: Duration) -> Result<usize> {
        let cutoff = retention_cutoff_ms(retention)?;
        let before = self.detections.len() + self.alerts.len();
        self.detections
            .retain(|d| d.timestamp().timestamp_millis() >= cutoff);
        self.alerts
            .retain(|a| a.event.created_at.timestamp_millis() >= cutoff);
        Ok(before - self.detections.len() - self.alerts.len())
    }
}
