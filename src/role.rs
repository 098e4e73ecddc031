//! Role strategies and the application-facing listener interface.

use std::fmt;
use std::sync::Arc;

use tracing::warn;

use crate::connection::Connection;
use crate::event::Event;
use crate::types::{Dialect, DisconnectReason, Message};

/// Receives what a connection produces. Called from the connection's ordered
/// dispatch task, so implementations should not block for long.
pub trait Listener: Send + Sync + 'static {
    /// Called for every parsed event, in arrival order.
    fn on_event(&self, event: Event);

    /// Inbound only: called once with the outcome of authentication. When no
    /// reply arrived (timeout, transport loss) `reply` is an empty message.
    fn on_auth_result(&self, _success: bool, _reply: &Message) {}

    /// Called exactly once when the connection ends.
    fn on_disconnected(&self, _reason: DisconnectReason) {}

    /// A message whose content type the engine does not route.
    fn on_unrecognized(&self, message: &Message) {
        warn!(
            "Unrecognized message with content type {:?}",
            message.content_type()
        );
    }
}

/// Outbound only: receives the channel data returned by `connect`.
pub trait ConnectHandler: Send + Sync + 'static {
    /// Called once, before any event is dispatched on `connection`.
    ///
    /// Commands issued from here must be sent from a spawned task; the
    /// dispatch task is blocked until this returns.
    fn on_connect_response(&self, event: Event, connection: Connection);
}

impl<F> ConnectHandler for F
where
    F: Fn(Event, Connection) + Send + Sync + 'static,
{
    fn on_connect_response(&self, event: Event, connection: Connection) {
        self(event, connection)
    }
}

/// Selects the handshake a connection performs.
#[derive(Clone)]
pub enum RoleStrategy {
    /// This side dialed the switch and authenticates with a password.
    Inbound { password: String },
    /// The switch dialed in; greet it with `connect`.
    Outbound { handler: Arc<dyn ConnectHandler> },
}

impl RoleStrategy {
    pub fn inbound(password: impl Into<String>) -> Self {
        RoleStrategy::Inbound {
            password: password.into(),
        }
    }

    pub fn outbound(handler: Arc<dyn ConnectHandler>) -> Self {
        RoleStrategy::Outbound { handler }
    }

    /// Framing dialect for this role: clients use A, listening servers use B.
    pub fn dialect(&self) -> Dialect {
        match self {
            RoleStrategy::Inbound { .. } => Dialect::Client,
            RoleStrategy::Outbound { .. } => Dialect::Server,
        }
    }

    pub fn is_inbound(&self) -> bool {
        matches!(self, RoleStrategy::Inbound { .. })
    }
}

impl fmt::Debug for RoleStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoleStrategy::Inbound { .. } => f
                .debug_struct("Inbound")
                .field("password", &"*****")
                .finish(),
            RoleStrategy::Outbound { .. } => f.debug_struct("Outbound").finish_non_exhaustive(),
        }
    }
}
