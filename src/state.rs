//! Application state management

use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::sync::Arc;

use sqlx::SqlitePool;

use crate::config::Config;
use crate::sync::{DeviceRegistry, PairingTokenManager, ReconciliationEngine};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    db: SqlitePool,
    tokens: PairingTokenManager,
    registry: DeviceRegistry,
    engine: ReconciliationEngine,
    advertised_host: String,
}

impl AppState {
    /// Create a new application state with a fresh pairing token
    pub fn new(config: Config, db: SqlitePool) -> Self {
        let ttl = chrono::Duration::seconds(config.sync.token_ttl_secs as i64);
        let advertised_host = config
            .sync
            .public_host
            .clone()
            .unwrap_or_else(|| detect_lan_address().to_string());

        Self {
            inner: Arc::new(AppStateInner {
                tokens: PairingTokenManager::new(ttl),
                registry: DeviceRegistry::new(db.clone()),
                engine: ReconciliationEngine::new(db.clone()),
                config,
                db,
                advertised_host,
            }),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the database pool
    pub fn db(&self) -> &SqlitePool {
        &self.inner.db
    }

    pub fn tokens(&self) -> &PairingTokenManager {
        &self.inner.tokens
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.inner.registry
    }

    pub fn engine(&self) -> &ReconciliationEngine {
        &self.inner.engine
    }

    /// Address joining devices should dial
    pub fn advertised_host(&self) -> &str {
        &self.inner.advertised_host
    }
}

/// Primary outbound interface address. Connecting a UDP socket sends nothing;
/// it only selects the route.
fn detect_lan_address() -> IpAddr {
    UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|socket| {
            socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9))?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .ok()
        .filter(|ip| !ip.is_unspecified())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}
