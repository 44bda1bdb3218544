/// Client-facing PostgreSQL front-end
///
/// A minimal simple-query server: it performs a trust handshake, announces the
/// primary's version and hands each query to the [`ProxyEngine`](crate::core::ProxyEngine).
pub mod codec;
pub mod server;
pub mod session;

pub use server::ProxyServer;
pub use session::ClientSession;

use crate::utils::generate_id;
use fnv::FnvHashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

/// A connected client
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub id: String,
    pub peer_addr: SocketAddr,
    pub connected_at: Instant,
}

impl ClientInfo {
    pub fn new(peer_addr: SocketAddr) -> Self {
        Self {
            id: generate_id("client"),
            peer_addr,
            connected_at: Instant::now(),
        }
    }
}

/// Registry of connected clients
pub struct ClientRegistry {
    clients: Arc<RwLock<FnvHashMap<String, ClientInfo>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: Arc::new(RwLock::new(FnvHashMap::default())),
        }
    }

    /// Register a new client connection
    pub async fn register(&self, client: ClientInfo) {
        let mut clients = self.clients.write().await;
        clients.insert(client.id.clone(), client);
    }

    /// Unregister a client connection
    pub async fn unregister(&self, client_id: &str) -> Option<ClientInfo> {
        let mut clients = self.clients.write().await;
        clients.remove(client_id)
    }

    /// Get client by ID
    pub async fn get(&self, client_id: &str) -> Option<ClientInfo> {
        let clients = self.clients.read().await;
        clients.get(client_id).cloned()
    }

    /// Get all connections from a specific peer address
    pub async fn clients_from(&self, peer_addr: SocketAddr) -> Vec<ClientInfo> {
        let clients = self.clients.read().await;
        clients
            .values()
            .filter(|client| client.peer_addr == peer_addr)
            .cloned()
            .collect()
    }

    /// Get total client count
    pub async fn count(&self) -> usize {
        let clients = self.clients.read().await;
        clients.len()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}
