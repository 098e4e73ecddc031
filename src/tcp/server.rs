use std::collections::HashMap;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::role::{ConnectHandler, Listener, RoleStrategy};
use crate::types::{EslError, Result, SessionId};

type Sessions = Arc<Mutex<HashMap<SessionId, Connection>>>;

/// Listening server for outbound event sockets: the switch dials in once per
/// call and each accepted socket is greeted with `connect`.
pub struct OutboundServer {
    listener: TcpListener,
    config: ServerConfig,
    next_session_id: Arc<Mutex<SessionId>>,
    sessions: Sessions,
    shutdown: Arc<watch::Sender<bool>>,
}

/// Controls a running [`OutboundServer`] from another task.
#[derive(Clone)]
pub struct ServerHandle {
    sessions: Sessions,
    shutdown: Arc<watch::Sender<bool>>,
}

impl ServerHandle {
    /// Stop accepting and close every live session.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Number of sessions currently open.
    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

impl OutboundServer {
    /// Bind to the configured address
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        info!("Outbound server [{}] bound to {}", config.name, config.bind_addr);

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            listener,
            config,
            next_session_id: Arc::new(Mutex::new(0)),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            shutdown: Arc::new(shutdown),
        })
    }

    /// Get the local address this server is bound to
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        self.listener.local_addr().map_err(EslError::Io)
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            sessions: self.sessions.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Accept connections until shut down. `factory` builds the handler for
    /// each new session; it receives the channel data and every later event.
    pub async fn run<F, H>(self, factory: F) -> Result<()>
    where
        F: Fn(SessionId) -> Arc<H> + Send + Sync + 'static,
        H: Listener + ConnectHandler,
    {
        info!(
            "Outbound server [{}] waiting for connections on {}",
            self.config.name,
            self.local_addr()?
        );
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, addr)) => {
                        info!("New connection from {}", addr);
                        self.handle_connection(socket, &factory).await;
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                },
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        self.stop().await;
        Ok(())
    }

    /// Start the engine for one accepted socket
    async fn handle_connection<F, H>(&self, socket: TcpStream, factory: &F)
    where
        F: Fn(SessionId) -> Arc<H>,
        H: Listener + ConnectHandler,
    {
        // Generate session ID
        let session_id = {
            let mut id_guard = self.next_session_id.lock().await;
            *id_guard += 1;
            *id_guard
        };

        if let Err(e) = socket.set_nodelay(true) {
            warn!("Session {} could not set TCP_NODELAY: {}", session_id, e);
        }

        info!("Starting session {}", session_id);
        let handler = factory(session_id);
        let connection = Connection::start_session(
            session_id,
            socket,
            RoleStrategy::outbound(handler.clone()),
            handler,
            self.config.connection_options(),
        );
        self.sessions
            .lock()
            .await
            .insert(session_id, connection.clone());

        let sessions = self.sessions.clone();
        tokio::spawn(async move {
            connection.closed().await;
            sessions.lock().await.remove(&session_id);
            info!("Session {} ended", session_id);
        });
    }

    async fn stop(&self) {
        let sessions: Vec<Connection> = {
            let mut sessions = self.sessions.lock().await;
            sessions.drain().map(|(_, connection)| connection).collect()
        };
        for connection in sessions {
            connection.close().await;
        }
        info!("Outbound server [{}] stopped", self.config.name);
    }
}
