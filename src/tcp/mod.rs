//! TCP transports: the inbound client and the outbound socket server.

pub mod client;
pub mod server;

pub use client::Client;
pub use server::{OutboundServer, ServerHandle};
