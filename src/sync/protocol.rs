//! Sync protocol messages
//!
//! Every frame is a JSON object tagged by its `type` field:
//! - client → server: `auth`, `sync_request`, `sync_push`, `ping`
//! - server → client: `auth_success`, `auth_failed`, `sync_data`,
//!   `sync_success`, `pong`, `error`

use std::ops::AddAssign;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::SyncError;
use crate::db::{Debt, Expense, Income, Password, Person};

/// Messages a device may send
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Auth(AuthRequest),
    SyncRequest,
    SyncPush(SyncChanges),
    Ping,
}

/// Credentials presented in an `auth` message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthRequest {
    #[serde(default)]
    pub token: Option<String>,
    /// Identifier issued by an earlier successful pairing
    #[serde(default, rename = "persistentId")]
    pub persistent_id: Option<String>,
}

/// Changed records per entity kind in a `sync_push`.
///
/// Records stay as raw JSON until merge time so that one undecodable record
/// only fails itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncChanges {
    #[serde(default)]
    pub expenses: Option<Vec<Value>>,
    #[serde(default)]
    pub incomes: Option<Vec<Value>>,
    #[serde(default)]
    pub people: Option<Vec<Value>>,
    #[serde(default)]
    pub debts: Option<Vec<Value>>,
    /// Accepted on the wire but never merged
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passwords: Option<Vec<Value>>,
}

impl SyncChanges {
    /// Number of mergeable records carried
    pub fn len(&self) -> usize {
        [&self.expenses, &self.incomes, &self.people, &self.debts]
            .iter()
            .map(|batch| batch.as_ref().map_or(0, Vec::len))
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Deserialize)]
struct SyncPushBody {
    changes: SyncChanges,
}

/// Result of parsing one inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Message(ClientMessage),
    /// Well-formed envelope with a `type` this server does not know
    Unknown(String),
}

/// Parse a text frame into a client message.
///
/// Frames that are not JSON objects with a string `type`, or whose fields do
/// not fit the named type, are malformed. A valid envelope with an
/// unrecognised type is reported as [`Inbound::Unknown`].
pub fn parse_message(text: &str) -> Result<Inbound, SyncError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| SyncError::Malformed(format!("invalid JSON: {}", e)))?;

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| SyncError::Malformed("missing message type".to_string()))?
        .to_string();

    let message = match kind.as_str() {
        "auth" => ClientMessage::Auth(decode(value)?),
        "sync_request" => ClientMessage::SyncRequest,
        "sync_push" => ClientMessage::SyncPush(decode::<SyncPushBody>(value)?.changes),
        "ping" => ClientMessage::Ping,
        _ => return Ok(Inbound::Unknown(kind)),
    };

    Ok(Inbound::Message(message))
}

fn decode<T: for<'de> Deserialize<'de>>(value: Value) -> Result<T, SyncError> {
    serde_json::from_value(value).map_err(|e| SyncError::Malformed(e.to_string()))
}

/// Merge counters reported after a push
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStats {
    pub processed: u64,
    pub skipped: u64,
    pub errors: u64,
}

impl AddAssign for MergeStats {
    fn add_assign(&mut self, other: Self) {
        self.processed += other.processed;
        self.skipped += other.skipped;
        self.errors += other.errors;
    }
}

/// Full contents of every synced kind
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncSnapshot {
    pub expenses: Vec<Expense>,
    pub incomes: Vec<Income>,
    pub debts: Vec<Debt>,
    pub people: Vec<Person>,
    pub passwords: Vec<Password>,
}

/// Messages the server sends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    AuthSuccess {
        #[serde(rename = "deviceId")]
        device_id: String,
        persistent: bool,
    },
    AuthFailed {
        reason: String,
    },
    SyncData {
        timestamp: DateTime<Utc>,
        data: SyncSnapshot,
    },
    SyncSuccess {
        message: String,
        stats: MergeStats,
    },
    Pong,
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
