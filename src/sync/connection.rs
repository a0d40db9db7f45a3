//! Per-connection protocol state machine
//!
//! `Unauthenticated` → `Authenticated` → `Closed`. There is no way back to
//! `Unauthenticated`; a new channel authenticates on its own. The handler is
//! transport-independent: it consumes text frames and returns the replies to
//! send, in order, plus whether the channel must be closed.

use chrono::Utc;
use tokio::sync::oneshot;
use uuid::Uuid;

use super::error::SyncError;
use super::protocol::{parse_message, AuthRequest, ClientMessage, Inbound, ServerMessage};
use super::registry::{generate_device_id, short_id};
use crate::state::AppState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Unauthenticated,
    Authenticated { device_id: String },
    Closed,
}

/// Replies produced by one inbound frame
#[derive(Debug, Default)]
pub struct Outcome {
    pub replies: Vec<ServerMessage>,
    pub close: bool,
}

impl Outcome {
    fn reply(message: ServerMessage) -> Self {
        Self {
            replies: vec![message],
            close: false,
        }
    }

    fn silent() -> Self {
        Self::default()
    }
}

pub struct ConnectionHandler {
    id: Uuid,
    state: ConnectionState,
    app: AppState,
    kick: Option<oneshot::Sender<()>>,
}

impl ConnectionHandler {
    /// `kick` fires when the bound device is revoked from elsewhere.
    pub fn new(app: AppState, kick: oneshot::Sender<()>) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: ConnectionState::Unauthenticated,
            app,
            kick: Some(kick),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn device_id(&self) -> Option<&str> {
        match &self.state {
            ConnectionState::Authenticated { device_id } => Some(device_id),
            _ => None,
        }
    }

    /// Handle one text frame
    pub async fn handle_text(&mut self, text: &str) -> Outcome {
        if self.state == ConnectionState::Closed {
            return Outcome {
                replies: Vec::new(),
                close: true,
            };
        }

        let inbound = match parse_message(text) {
            Ok(inbound) => inbound,
            Err(e) => return self.fail(e),
        };

        let device_id = match &self.state {
            ConnectionState::Authenticated { device_id } => device_id.clone(),
            _ => {
                return match inbound {
                    Inbound::Message(ClientMessage::Ping) => Outcome::reply(ServerMessage::Pong),
                    Inbound::Message(ClientMessage::Auth(req)) => {
                        match self.authenticate(req).await {
                            Ok(reply) => Outcome::reply(reply),
                            Err(e) => self.fail(e),
                        }
                    }
                    _ => self.fail(SyncError::NotAuthenticated),
                };
            }
        };

        match inbound {
            Inbound::Message(ClientMessage::Ping) => Outcome::reply(ServerMessage::Pong),
            Inbound::Message(ClientMessage::Auth(_)) => Outcome::reply(ServerMessage::AuthSuccess {
                device_id,
                persistent: true,
            }),
            Inbound::Message(ClientMessage::SyncRequest) => {
                let reply = self.snapshot().await;
                self.touch_sync(&device_id).await;
                Outcome::reply(reply)
            }
            Inbound::Message(ClientMessage::SyncPush(changes)) => {
                tracing::debug!(
                    "Device {}... pushed {} record(s)",
                    short_id(&device_id),
                    changes.len()
                );
                let stats = self.app.engine().merge(changes).await;
                let summary = ServerMessage::SyncSuccess {
                    message: format!(
                        "Sync completed: {} processed, {} skipped, {} errors",
                        stats.processed, stats.skipped, stats.errors
                    ),
                    stats,
                };
                let snapshot = self.snapshot().await;
                self.touch_sync(&device_id).await;
                Outcome {
                    replies: vec![summary, snapshot],
                    close: false,
                }
            }
            Inbound::Unknown(kind) => {
                tracing::debug!(
                    "Ignoring unknown message type {:?} from {}...",
                    kind,
                    short_id(&device_id)
                );
                Outcome::silent()
            }
        }
    }

    /// Reject a frame that cannot be read as text
    pub fn handle_unreadable(&mut self, reason: &str) -> Outcome {
        self.fail(SyncError::Malformed(reason.to_string()))
    }

    /// Move to `Closed` and drop the live binding. The device stays authorized.
    pub fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        if let Some(device_id) = self.device_id() {
            tracing::info!("Device {}... disconnected", short_id(device_id));
        }
        self.app.registry().detach(self.id);
        self.state = ConnectionState::Closed;
    }

    async fn authenticate(&mut self, req: AuthRequest) -> Result<ServerMessage, SyncError> {
        // A known device reconnects without the pairing token.
        let persistent_id = req.persistent_id.filter(|id| !id.is_empty());
        if let Some(persistent_id) = persistent_id.clone() {
            if self.app.registry().is_authorized(&persistent_id).await? {
                tracing::info!("Device {}... reconnected", short_id(&persistent_id));
                self.bind(persistent_id.clone());
                return Ok(ServerMessage::AuthSuccess {
                    device_id: persistent_id,
                    persistent: true,
                });
            }
            tracing::debug!(
                "Unknown persistent id {}..., falling back to token",
                short_id(&persistent_id)
            );
        }

        let token = req.token.filter(|t| !t.is_empty()).ok_or_else(|| {
            let reason = match persistent_id {
                Some(_) => "Unknown device",
                None => "Missing token",
            };
            SyncError::Auth(reason.to_string())
        })?;

        self.app
            .tokens()
            .verify(&token)
            .map_err(|rejection| SyncError::Auth(rejection.to_string()))?;

        let device_id = generate_device_id();
        self.app.registry().authorize(&device_id).await?;
        tracing::info!("Device {}... paired", short_id(&device_id));
        self.bind(device_id.clone());

        Ok(ServerMessage::AuthSuccess {
            device_id,
            persistent: true,
        })
    }

    fn bind(&mut self, device_id: String) {
        if let Some(kick) = self.kick.take() {
            self.app.registry().attach(self.id, &device_id, kick);
        }
        self.state = ConnectionState::Authenticated { device_id };
    }

    async fn snapshot(&self) -> ServerMessage {
        let data = self.app.engine().pull().await;
        ServerMessage::SyncData {
            timestamp: Utc::now(),
            data,
        }
    }

    async fn touch_sync(&self, device_id: &str) {
        if let Err(e) = self.app.registry().touch_sync(device_id).await {
            tracing::warn!("Failed to record sync for {}...: {}", short_id(device_id), e);
        }
    }

    fn fail(&mut self, error: SyncError) -> Outcome {
        match &error {
            SyncError::Auth(reason) => tracing::warn!("Authentication failed: {}", reason),
            SyncError::Store(e) => tracing::error!("Store failure on connection {}: {}", self.id, e),
            other => tracing::debug!("Rejected message on connection {}: {}", self.id, other),
        }

        let close = error.closes_connection();
        let outcome = Outcome {
            replies: error.reply().into_iter().collect(),
            close,
        };
        if close {
            self.close();
        }
        outcome
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        self.close();
    }
}
