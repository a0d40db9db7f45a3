//! Device pairing and record sync over WebSocket
//!
//! # Sync Protocol
//!
//! 1. Device opens a channel and sends `auth` with the pairing token (first
//!    time) or its `persistentId` (every later time)
//! 2. Server replies `auth_success` carrying the device identifier
//! 3. Device sends `sync_request` to pull every record, or `sync_push` with
//!    its changed records
//! 4. After a push the server replies `sync_success` with merge counters,
//!    followed by a full `sync_data` snapshot
//!
//! # Conflict Resolution
//!
//! - Records are keyed by `(kind, id)`
//! - The incoming record wins only if its `created_at` is strictly newer
//! - Ties and older records are skipped, so replaying a push is a no-op
//! - Passwords are sent to devices but never accepted from them

mod connection;
mod engine;
mod error;
mod pairing;
mod protocol;
mod registry;
mod socket;

pub use connection::{ConnectionHandler, ConnectionState, Outcome};
pub use engine::{parse_logical_timestamp, MergeOutcome, ReconciliationEngine};
pub use error::SyncError;
pub use pairing::{spawn_rotation_task, PairingToken, PairingTokenManager, TokenRejection};
pub use protocol::{
    parse_message, AuthRequest, ClientMessage, Inbound, MergeStats, ServerMessage, SyncChanges,
    SyncSnapshot,
};
pub use registry::{generate_device_id, ConnectedDevice, DeviceRegistry};
pub use socket::router;
