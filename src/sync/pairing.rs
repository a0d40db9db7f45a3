//! Pairing token management
//!
//! A single short-lived secret is handed to a joining device out-of-band
//! (usually as a QR code). It is replaced on a fixed cadence shorter than its
//! lifetime, and on demand from the control plane. Devices that already
//! paired never need it again.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use subtle::ConstantTimeEq;
use tokio::task::JoinHandle;
use tokio::time;
use uuid::Uuid;

/// A pairing secret and its validity window
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingToken {
    pub value: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PairingToken {
    fn generate(ttl: chrono::Duration, previous: Option<&str>) -> Self {
        let mut value = Uuid::new_v4().simple().to_string();
        while previous == Some(value.as_str()) {
            value = Uuid::new_v4().simple().to_string();
        }

        let created_at = Utc::now();
        Self {
            value,
            created_at,
            expires_at: created_at + ttl,
        }
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Owner of the current pairing token
#[derive(Clone)]
pub struct PairingTokenManager {
    current: Arc<Mutex<PairingToken>>,
    ttl: chrono::Duration,
}

impl PairingTokenManager {
    /// Create a manager holding a freshly generated token
    pub fn new(ttl: chrono::Duration) -> Self {
        Self {
            current: Arc::new(Mutex::new(PairingToken::generate(ttl, None))),
            ttl,
        }
    }

    pub fn ttl(&self) -> chrono::Duration {
        self.ttl
    }

    /// Current token value, rotating first if it has expired
    pub fn current_token(&self) -> String {
        self.current_snapshot().value
    }

    /// Current token with its validity window, rotating first if expired
    pub fn current_snapshot(&self) -> PairingToken {
        let mut current = self.current.lock();
        if !current.is_valid_at(Utc::now()) {
            *current = PairingToken::generate(self.ttl, Some(&current.value));
            tracing::info!("Pairing token expired, rotated");
        }
        current.clone()
    }

    /// Replace the token with a new value and a fresh expiry window
    pub fn rotate(&self) -> PairingToken {
        let mut current = self.current.lock();
        *current = PairingToken::generate(self.ttl, Some(&current.value));
        tracing::info!(
            "Pairing token rotated, valid until {}",
            current.expires_at.to_rfc3339()
        );
        current.clone()
    }

    /// Stored token as-is, without rotating
    pub fn peek(&self) -> PairingToken {
        self.current.lock().clone()
    }

    /// Whether the stored token has not yet expired
    pub fn is_valid(&self) -> bool {
        self.current.lock().is_valid_at(Utc::now())
    }

    /// Check a presented token for expiry and equality under one lock
    pub fn verify(&self, candidate: &str) -> Result<(), TokenRejection> {
        let current = self.current.lock();
        if !current.is_valid_at(Utc::now()) {
            return Err(TokenRejection::Expired);
        }
        if !bool::from(current.value.as_bytes().ct_eq(candidate.as_bytes())) {
            return Err(TokenRejection::Mismatch);
        }
        Ok(())
    }
}

/// Why a presented pairing token was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TokenRejection {
    #[error("Token expired")]
    Expired,

    #[error("Invalid or expired token")]
    Mismatch,
}

/// Rotate the token on a fixed cadence for the lifetime of the process.
pub fn spawn_rotation_task(tokens: PairingTokenManager, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(every);
        // The first tick completes immediately; the token is already fresh.
        interval.tick().await;
        loop {
            interval.tick().await;
            tokens.rotate();
        }
    })
}
