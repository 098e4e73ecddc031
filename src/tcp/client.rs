use std::ops::Deref;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{error, info};

use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::role::{Listener, RoleStrategy};
use crate::types::{EslError, Result};

/// Inbound client: dials the switch and authenticates with a password.
///
/// Derefs to [`Connection`] for issuing commands.
pub struct Client {
    connection: Connection,
    addr: String,
}

impl Client {
    /// Connect to the switch and wait until authentication completes.
    pub async fn connect(config: &ClientConfig, listener: Arc<dyn Listener>) -> Result<Self> {
        let addr = config.addr();
        info!("Connecting to {}", addr);

        let socket = match timeout(config.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(socket) => socket?,
            Err(_) => {
                error!("Timed out connecting to {}", addr);
                return Err(EslError::ConnectTimeout);
            }
        };
        socket.set_nodelay(true)?;

        let connection = Connection::start(
            socket,
            RoleStrategy::inbound(config.password.clone()),
            listener,
            config.connection_options(),
        );

        match timeout(config.connect_timeout, connection.wait_ready()).await {
            Ok(Ok(())) => {
                info!("Connected to {} as connection {}", addr, connection.id());
                Ok(Self { connection, addr })
            }
            Ok(Err(e)) => {
                error!("Handshake with {} failed: {}", addr, e);
                Err(e)
            }
            Err(_) => {
                error!("Timed out authenticating with {}", addr);
                connection.close().await;
                Err(EslError::ConnectTimeout)
            }
        }
    }

    /// Address this client dialed.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Close the connection
    pub async fn close(self) {
        info!("Closing connection to {}", self.addr);
        self.connection.close().await;
    }
}

impl Deref for Client {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.connection
    }
}
