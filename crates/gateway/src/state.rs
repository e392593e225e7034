use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Instant,
};

use tokio::sync::{RwLock, mpsc};

use moltis_config::schema::GatewayConfig;
use moltis_service_traits::Services;

use crate::{pairing::PairingStore, rate_limiter::RateLimiter};

// ── Connected client ─────────────────────────────────────────────────────────

/// A WebSocket client currently connected to the gateway. `role` is resolved
/// once at connect time (§4.1) and never changes for the lifetime of the
/// connection.
#[derive(Debug)]
pub struct ConnectedClient {
    pub conn_id: String,
    pub role: String,
    pub user_id: Option<String>,
    /// Channel for sending serialized frames to this client's write loop.
    pub sender: mpsc::Sender<String>,
    pub connected_at: Instant,
    pub last_activity: Instant,
}

impl ConnectedClient {
    pub fn has_role(&self, required: &str) -> bool {
        moltis_protocol::roles::at_least(&self.role, required)
    }

    /// Send a serialized JSON frame to this client; drops the frame if the
    /// outbound queue is full rather than blocking the caller.
    pub fn send(&self, frame: String) -> bool {
        self.sender.try_send(frame).is_ok()
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

// ── Dedupe cache ─────────────────────────────────────────────────────────────

struct DedupeEntry {
    inserted_at: Instant,
}

/// Simple TTL-based idempotency cache, shared by the channel-to-agent
/// pipeline to drop messages it has already seen.
pub struct DedupeCache {
    entries: HashMap<String, DedupeEntry>,
    ttl: std::time::Duration,
    max_entries: usize,
}

impl DedupeCache {
    pub fn new(ttl: std::time::Duration, max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
            max_entries,
        }
    }

    /// Returns true if the key is a duplicate (already seen within TTL).
    pub fn check_and_insert(&mut self, key: &str) -> bool {
        self.evict_expired();
        if self.entries.contains_key(key) {
            return true;
        }
        if self.entries.len() >= self.max_entries
            && let Some(oldest_key) = self
                .entries
                .iter()
                .min_by_key(|(_, v)| v.inserted_at)
                .map(|(k, _)| k.clone())
        {
            self.entries.remove(&oldest_key);
        }
        self.entries.insert(key.to_string(), DedupeEntry {
            inserted_at: Instant::now(),
        });
        false
    }

    fn evict_expired(&mut self) {
        let cutoff = Instant::now() - self.ttl;
        self.entries.retain(|_, v| v.inserted_at > cutoff);
    }
}

// ── Gateway state ────────────────────────────────────────────────────────────

/// Shared gateway runtime state, wrapped in Arc for use across async tasks.
pub struct GatewayState {
    /// All connected WebSocket clients, keyed by conn_id.
    pub clients: RwLock<HashMap<String, ConnectedClient>>,
    /// Mirrors `clients.len()` without requiring the async lock; used by
    /// synchronous diagnostics (e.g. `system.status`'s connection count).
    pub client_counter: AtomicUsize,
    /// Monotonically increasing sequence counter for broadcast events.
    pub seq: AtomicU64,
    /// Inbound-message dedupe cache for the channel pipeline.
    pub dedupe: RwLock<DedupeCache>,
    /// Server version string, reported in `HelloOk`.
    pub version: String,
    /// Hostname reported in `HelloOk`.
    pub hostname: String,
    /// Loaded gateway configuration.
    pub config: Arc<GatewayConfig>,
    /// Device/sender pairing store.
    pub pairing: Arc<PairingStore>,
    /// Per-key token-bucket limiter guarding `chat.send`.
    pub rate_limiter: RateLimiter,
    /// Domain services backing the RPC surface.
    pub services: Services,
}

impl GatewayState {
    pub fn new(config: Arc<GatewayConfig>, services: Services) -> Arc<Self> {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".into());

        let pairing = Arc::new(PairingStore::new(std::time::Duration::from_secs(
            config.pairing_ttl_secs,
        )));
        let rate_limiter = RateLimiter::new(&config.rate_limit);
        let dedupe = DedupeCache::new(
            std::time::Duration::from_secs(config.dedupe.ttl_secs),
            config.dedupe.max_size,
        );

        Arc::new(Self {
            clients: RwLock::new(HashMap::new()),
            client_counter: AtomicUsize::new(0),
            seq: AtomicU64::new(0),
            dedupe: RwLock::new(dedupe),
            version: env!("CARGO_PKG_VERSION").to_string(),
            hostname,
            config,
            pairing,
            rate_limiter,
            services,
        })
    }

    /// Construct the state with a `Services` bundle that itself needs a
    /// back-reference to the state (the chat service's run registry
    /// broadcasts events through it). `build_services` receives a [`Weak`]
    /// so there is no reference cycle keeping the state alive forever.
    pub fn new_cyclic(
        config: Arc<GatewayConfig>,
        build_services: impl FnOnce(std::sync::Weak<Self>) -> Services,
    ) -> Arc<Self> {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".into());

        let pairing = Arc::new(PairingStore::new(std::time::Duration::from_secs(
            config.pairing_ttl_secs,
        )));
        let rate_limiter = RateLimiter::new(&config.rate_limit);
        let dedupe = DedupeCache::new(
            std::time::Duration::from_secs(config.dedupe.ttl_secs),
            config.dedupe.max_size,
        );

        Arc::new_cyclic(|weak| Self {
            clients: RwLock::new(HashMap::new()),
            client_counter: AtomicUsize::new(0),
            seq: AtomicU64::new(0),
            dedupe: RwLock::new(dedupe),
            version: env!("CARGO_PKG_VERSION").to_string(),
            hostname,
            config,
            pairing,
            rate_limiter,
            services: build_services(weak.clone()),
        })
    }

    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Register a new client connection.
    pub async fn register_client(&self, client: ConnectedClient) {
        let conn_id = client.conn_id.clone();
        self.clients.write().await.insert(conn_id, client);
        self.client_counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Remove a client by conn_id. Returns the removed client if found.
    pub async fn remove_client(&self, conn_id: &str) -> Option<ConnectedClient> {
        let removed = self.clients.write().await.remove(conn_id);
        if removed.is_some() {
            self.client_counter.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Number of connected clients.
    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Synchronous connection count, for callbacks that can't `.await`.
    pub fn client_count_sync(&self) -> usize {
        self.client_counter.load(Ordering::Relaxed)
    }

    /// Broadcast a pre-serialized event frame to every connected client
    /// holding at least `min_role`.
    pub async fn broadcast(&self, frame: &str, min_role: &str) {
        let clients = self.clients.read().await;
        for client in clients.values() {
            if client.has_role(min_role) {
                client.send(frame.to_string());
            }
        }
    }
}
