//! Device registry
//!
//! Two views of paired devices:
//! - authorization state, persisted in `paired_devices` so pairing survives
//!   restarts (only a SHA-256 digest of each identifier is stored)
//! - live connections, in memory only, each holding a kick channel so that
//!   revoking a device also drops its open channels

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::Result;

/// A device with a live channel, as reported to the operator
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedDevice {
    pub device_id: String,
    pub connected_at: DateTime<Utc>,
    pub last_sync: Option<DateTime<Utc>>,
}

/// Durable authorization record
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PairedDeviceRow {
    pub device_hash: String,
    pub authorized_at: String,
    pub last_sync: Option<String>,
}

struct LiveConnection {
    device_id: String,
    connected_at: DateTime<Utc>,
    kick: Option<oneshot::Sender<()>>,
}

/// Shared registry of authorized devices and live connections
#[derive(Clone)]
pub struct DeviceRegistry {
    pool: SqlitePool,
    live: Arc<Mutex<HashMap<Uuid, LiveConnection>>>,
}

/// New unguessable device identifier (32 hex characters)
pub fn generate_device_id() -> String {
    Uuid::new_v4().simple().to_string()
}

fn device_hash(device_id: &str) -> String {
    hex::encode(Sha256::digest(device_id.as_bytes()))
}

/// Shortened identifier for logs. Cuts on a character boundary, since
/// identifiers presented by devices are arbitrary text.
pub(crate) fn short_id(id: &str) -> &str {
    id.char_indices().nth(8).map_or(id, |(end, _)| &id[..end])
}

impl DeviceRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            live: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Persistently authorize a device identifier
    pub async fn authorize(&self, device_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO paired_devices (device_hash, authorized_at, last_sync)
            VALUES (?, ?, NULL)
            ON CONFLICT(device_hash) DO NOTHING
            "#,
        )
        .bind(device_hash(device_id))
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        tracing::info!("Device {}... authorized", short_id(device_id));
        Ok(())
    }

    pub async fn is_authorized(&self, device_id: &str) -> Result<bool> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT device_hash FROM paired_devices WHERE device_hash = ?")
                .bind(device_hash(device_id))
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.is_some())
    }

    /// Record a completed sync for the device
    pub async fn touch_sync(&self, device_id: &str) -> Result<()> {
        sqlx::query("UPDATE paired_devices SET last_sync = ? WHERE device_hash = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(device_hash(device_id))
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Remove authorization and drop any live channel bound to the device.
    ///
    /// Returns whether anything was removed; revoking twice is harmless.
    pub async fn revoke(&self, device_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM paired_devices WHERE device_hash = ?")
            .bind(device_hash(device_id))
            .execute(&self.pool)
            .await?;

        let kicked = self.disconnect(device_id);
        let removed = result.rows_affected() > 0 || kicked > 0;

        if removed {
            tracing::info!(
                "Device {}... revoked, {} live connection(s) closed",
                short_id(device_id),
                kicked
            );
        }

        Ok(removed)
    }

    /// Close every live connection bound to `device_id`, returning how many.
    pub fn disconnect(&self, device_id: &str) -> usize {
        let mut live = self.live.lock();
        let ids: Vec<Uuid> = live
            .iter()
            .filter(|(_, conn)| conn.device_id == device_id)
            .map(|(id, _)| *id)
            .collect();

        for id in &ids {
            if let Some(mut conn) = live.remove(id) {
                if let Some(kick) = conn.kick.take() {
                    // The receiver is gone if the socket already closed.
                    let _ = kick.send(());
                }
            }
        }

        ids.len()
    }

    /// Bind a live connection to an authenticated device
    pub fn attach(&self, connection_id: Uuid, device_id: &str, kick: oneshot::Sender<()>) {
        self.live.lock().insert(
            connection_id,
            LiveConnection {
                device_id: device_id.to_string(),
                connected_at: Utc::now(),
                kick: Some(kick),
            },
        );
    }

    /// Forget a closed connection. The device stays authorized.
    pub fn detach(&self, connection_id: Uuid) {
        self.live.lock().remove(&connection_id);
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }

    /// Live connections joined with their authorization metadata
    pub async fn list(&self) -> Result<Vec<ConnectedDevice>> {
        let mut snapshot: Vec<(String, DateTime<Utc>)> = self
            .live
            .lock()
            .values()
            .map(|conn| (conn.device_id.clone(), conn.connected_at))
            .collect();
        snapshot.sort_by_key(|(_, connected_at)| *connected_at);

        let mut devices = Vec::with_capacity(snapshot.len());
        for (device_id, connected_at) in snapshot {
            let row = self.paired_row(&device_id).await?;
            let last_sync = row
                .and_then(|r| r.last_sync)
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.with_timezone(&Utc));

            devices.push(ConnectedDevice {
                device_id,
                connected_at,
                last_sync,
            });
        }

        Ok(devices)
    }

    /// Number of persistently authorized devices
    pub async fn paired_count(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM paired_devices")
            .fetch_one(&self.pool)
            .await?;

        Ok(row.0)
    }

    async fn paired_row(&self, device_id: &str) -> Result<Option<PairedDeviceRow>> {
        let row = sqlx::query_as::<_, PairedDeviceRow>(
            "SELECT device_hash, authorized_at, last_sync FROM paired_devices WHERE device_hash = ?",
        )
        .bind(device_hash(device_id))
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }
}
