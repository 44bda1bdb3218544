/// TCP listener accepting PostgreSQL clients
use super::session::ClientSession;
use super::{ClientInfo, ClientRegistry};
use crate::core::ProxyEngine;
use crate::error::{EspejoResult, ErrorSeverity};
use crate::utils::format_duration;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

const TOO_MANY_CONNECTIONS: &str = "53300";

pub struct ProxyServer {
    engine: Arc<ProxyEngine>,
    clients: Arc<ClientRegistry>,
    connection_limit: Arc<Semaphore>,
    max_connections: usize,
}

impl ProxyServer {
    pub fn new(engine: Arc<ProxyEngine>, max_connections: usize) -> Self {
        Self {
            engine,
            clients: Arc::new(ClientRegistry::new()),
            connection_limit: Arc::new(Semaphore::new(max_connections)),
            max_connections,
        }
    }

    pub fn clients(&self) -> Arc<ClientRegistry> {
        Arc::clone(&self.clients)
    }

    /// Accept clients until `shutdown` resolves. Sessions already running are left to finish.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> EspejoResult<()>
    where
        F: Future<Output = ()>,
    {
        info!("Accepting PostgreSQL clients on {}", listener.local_addr()?);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(
                        "Stopped accepting clients ({} still connected)",
                        self.clients.count().await
                    );
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.accept(stream, peer),
                    Err(e) => warn!("Failed to accept client connection: {}", e),
                },
            }
        }
    }

    fn accept(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }

        let Ok(permit) = Arc::clone(&self.connection_limit).try_acquire_owned() else {
            warn!(
                "Refusing client {}: {} connections already open",
                peer, self.max_connections
            );
            let session =
                ClientSession::new(format!("refused-{}", peer), stream, Arc::clone(&self.engine));
            tokio::spawn(async move {
                if let Err(e) = session
                    .refuse(TOO_MANY_CONNECTIONS, "sorry, too many clients already")
                    .await
                {
                    debug!("Error refusing client {}: {}", peer, e);
                }
            });
            return;
        };

        let client = ClientInfo::new(peer);
        let clients = Arc::clone(&self.clients);
        let engine = Arc::clone(&self.engine);

        tokio::spawn(async move {
            let _permit = permit;
            let id = client.id.clone();
            let connected_at = client.connected_at;
            clients.register(client).await;
            debug!("Client {} accepted from {}", id, peer);

            match ClientSession::new(id.clone(), stream, engine).run().await {
                Ok(()) => info!(
                    "Client {} from {} disconnected after {}",
                    id,
                    peer,
                    format_duration(connected_at.elapsed())
                ),
                Err(e) => match e.severity() {
                    ErrorSeverity::Critical => error!("Client {} session failed: {}", id, e),
                    _ => warn!("Client {} session ended with error: {}", id, e),
                },
            }

            clients.unregister(&id).await;
        });
    }
}
