//! # esl - event socket protocol engine
//!
//! A client/server engine for the line-oriented event socket protocol spoken by
//! telephony switches. One connection carries three kinds of traffic:
//!
//! * **Command replies** answering the single outstanding command
//! * **Events** pushed asynchronously by the switch
//! * **Notices** such as the disconnect notice sent before the switch hangs up
//!
//! ## Quick Start
//!
//! ```rust
//! use bytes::BytesMut;
//! use esl::{ContentType, Dialect, FrameDecoder};
//!
//! let mut decoder = FrameDecoder::new(Dialect::Client, 8192);
//! let mut buf = BytesMut::from(&b"Content-Type: api/response\nContent-Length: 3\n\n+OK"[..]);
//!
//! let message = decoder.decode(&mut buf)?.unwrap();
//! assert_eq!(message.kind(), Some(ContentType::ApiResponse));
//! assert_eq!(message.body.as_deref(), Some(&b"+OK"[..]));
//! # Ok::<(), esl::EslError>(())
//! ```
//!
//! ## Wire Format
//!
//! Every message is a block of `Name: Value` header lines terminated by a blank
//! line. When the block declares `Content-Length: N`, exactly `N` body bytes
//! follow. Commands are written as one or more text lines followed by a blank
//! line.
//!
//! ```text
//! Content-Type: text/event-plain
//! Content-Length: 41
//!
//! Event-Name: HEARTBEAT
//! Core-UUID: 1234
//! ```
//!
//! ## Content Types
//!
//! | Content-Type             | Routing                                      |
//! |--------------------------|----------------------------------------------|
//! | `auth/request`           | Inbound handshake: answer with `auth`        |
//! | `command/reply`          | Reply to the pending command                 |
//! | `api/response`           | Reply to the pending `api` command           |
//! | `text/event-plain`       | Event, properties in the body                |
//! | `text/event-xml`         | Event, XML body kept raw                     |
//! | `text/disconnect-notice` | Peer is closing; connection ends cleanly     |
//!
//! ## Roles
//!
//! - **Inbound** ([`tcp::Client`]): dial the switch, wait for `auth/request`,
//!   authenticate with a password
//! - **Outbound** ([`tcp::OutboundServer`]): the switch dials in per call; greet
//!   it with `connect` and receive the channel data

pub mod types;
pub mod frame;
pub mod codec;
pub mod event;
pub mod reply;
pub mod role;
pub mod connection;
pub mod commands;
pub mod config;
pub mod tcp;

// Re-export main types for convenience
pub use types::{
    ConnectionState, ContentType, Dialect, DisconnectReason, EslError, Header, Message, Result,
    SessionId, CONTENT_LENGTH, CONTENT_TYPE, DEFAULT_MAX_HEADER_SIZE, JOB_UUID, REPLY_TEXT,
};

pub use frame::{encode_command, encode_message, FrameDecoder};
pub use codec::EslCodec;
pub use event::Event;
pub use reply::CommandReply;
pub use role::{ConnectHandler, Listener, RoleStrategy};
pub use connection::{Connection, ConnectionOptions};
pub use commands::{EventFormat, SendMsg};
pub use config::{ClientConfig, ServerConfig};
pub use tcp::{Client, OutboundServer, ServerHandle};
