//! Sync error taxonomy
//!
//! - `Auth`: bad or expired pairing token. One reply, then the channel closes.
//! - `Malformed` / `NotAuthenticated`: protocol misuse. Error reply, channel stays open.
//! - `Store`: a read or write failed. Isolated to one record or one entity kind.
//! - `Transport`: the channel dropped. The connection is closed, never retried.

use thiserror::Error;

use super::protocol::ServerMessage;
use crate::error::AppError;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("{0}")]
    Auth(String),

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Store error: {0}")]
    Store(#[from] AppError),

    #[error("Transport error: {0}")]
    Transport(#[from] axum::Error),
}

impl SyncError {
    /// Whether the connection must be closed after replying
    pub fn closes_connection(&self) -> bool {
        matches!(self, SyncError::Auth(_) | SyncError::Transport(_))
    }

    /// Reply to send to the device, if the channel is still usable
    pub fn reply(&self) -> Option<ServerMessage> {
        match self {
            SyncError::Auth(reason) => Some(ServerMessage::AuthFailed {
                reason: reason.clone(),
            }),
            SyncError::Malformed(_) => Some(ServerMessage::Error {
                message: "Invalid message format".to_string(),
            }),
            SyncError::NotAuthenticated => Some(ServerMessage::Error {
                message: "Not authenticated".to_string(),
            }),
            SyncError::Store(_) => Some(ServerMessage::Error {
                message: "Internal server error".to_string(),
            }),
            SyncError::Transport(_) => None,
        }
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(e: sqlx::Error) -> Self {
        SyncError::Store(AppError::Database(e))
    }
}
