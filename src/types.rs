//! Core protocol types: headers, messages, content types, connection state and errors.

use std::borrow::Cow;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

/// Header carrying the routing content type of a message.
pub const CONTENT_TYPE: &str = "Content-Type";
/// Header declaring the exact byte length of the body that follows the header block.
pub const CONTENT_LENGTH: &str = "Content-Length";
/// Header carrying the `+OK`/`-ERR` text of a `command/reply`.
pub const REPLY_TEXT: &str = "Reply-Text";
/// Header carrying the background job identifier of a `bgapi` reply or job event.
pub const JOB_UUID: &str = "Job-UUID";

/// Default upper bound for one header block, in bytes.
pub const DEFAULT_MAX_HEADER_SIZE: usize = 8192;

/// Identifier assigned to each connection for logging.
pub type SessionId = u64;

/// Content-Type values understood by the connection engine.
pub mod content_type {
    pub const AUTH_REQUEST: &str = "auth/request";
    pub const COMMAND_REPLY: &str = "command/reply";
    pub const API_RESPONSE: &str = "api/response";
    pub const EVENT_PLAIN: &str = "text/event-plain";
    pub const EVENT_XML: &str = "text/event-xml";
    pub const DISCONNECT_NOTICE: &str = "text/disconnect-notice";
}

/// Routing class of a message, derived from its `Content-Type` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentType {
    AuthRequest,
    CommandReply,
    ApiResponse,
    EventPlain,
    EventXml,
    DisconnectNotice,
    Other(String),
}

impl ContentType {
    /// Classify a raw `Content-Type` value. Matching is exact and case-sensitive.
    pub fn parse(value: &str) -> Self {
        match value {
            content_type::AUTH_REQUEST => ContentType::AuthRequest,
            content_type::COMMAND_REPLY => ContentType::CommandReply,
            content_type::API_RESPONSE => ContentType::ApiResponse,
            content_type::EVENT_PLAIN => ContentType::EventPlain,
            content_type::EVENT_XML => ContentType::EventXml,
            content_type::DISCONNECT_NOTICE => ContentType::DisconnectNotice,
            other => ContentType::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ContentType::AuthRequest => content_type::AUTH_REQUEST,
            ContentType::CommandReply => content_type::COMMAND_REPLY,
            ContentType::ApiResponse => content_type::API_RESPONSE,
            ContentType::EventPlain => content_type::EVENT_PLAIN,
            ContentType::EventXml => content_type::EVENT_XML,
            ContentType::DisconnectNotice => content_type::DISCONNECT_NOTICE,
            ContentType::Other(value) => value,
        }
    }

    /// Whether this message answers the single outstanding command.
    pub fn is_reply(&self) -> bool {
        matches!(self, ContentType::CommandReply | ContentType::ApiResponse)
    }

    pub fn is_event(&self) -> bool {
        matches!(self, ContentType::EventPlain | ContentType::EventXml)
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single `Name: Value` header line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// One decoded protocol message: an ordered header block plus an optional body.
///
/// Headers keep arrival order and duplicates; nothing is merged or overwritten.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub headers: Vec<Header>,
    pub body: Option<Bytes>,
}

impl Message {
    /// Create an empty message
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a header (builder style)
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(Header::new(name, value));
        self
    }

    /// Set the body (builder style)
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Value of the first header with this exact name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name == name)
            .map(|h| h.value.as_str())
    }

    /// All values for a header name, in arrival order.
    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |h| h.name == name)
            .map(|h| h.value.as_str())
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.iter().any(|h| h.name == name)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header(CONTENT_TYPE)
    }

    /// Routing class, or `None` when the message carries no `Content-Type`.
    pub fn kind(&self) -> Option<ContentType> {
        self.content_type().map(ContentType::parse)
    }

    /// Declared `Content-Length`, if present and numeric.
    pub fn content_length(&self) -> Option<usize> {
        self.header(CONTENT_LENGTH)
            .and_then(|v| v.trim().parse().ok())
    }

    pub fn body_len(&self) -> usize {
        self.body.as_ref().map_or(0, |b| b.len())
    }

    /// Body as text, replacing invalid UTF-8 sequences.
    pub fn body_text(&self) -> Option<Cow<'_, str>> {
        self.body.as_ref().map(|b| String::from_utf8_lossy(b))
    }
}

/// Header/body framing convention used by the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dialect {
    /// Dialect A: only `Content-Length` delivers a body. Used by connecting clients.
    #[default]
    Client,
    /// Dialect B: every header other than `Content-Type`/`Content-Length` is also
    /// folded into the body as a `Name: Value` line. Used by listening servers,
    /// where channel data arrives as header lines.
    Server,
}

impl Dialect {
    pub fn folds_headers(self) -> bool {
        matches!(self, Dialect::Server)
    }
}

/// Lifecycle of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Init,
    AwaitingAuthRequest,
    AwaitingAuthReply,
    AwaitingConnectReply,
    Ready,
    Closed,
    Failed,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }

    /// States in which the next message, whatever its type, answers the handshake command.
    pub fn awaits_handshake_reply(&self) -> bool {
        matches!(
            self,
            ConnectionState::AwaitingAuthReply | ConnectionState::AwaitingConnectReply
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Init => "init",
            ConnectionState::AwaitingAuthRequest => "awaiting-auth-request",
            ConnectionState::AwaitingAuthReply => "awaiting-auth-reply",
            ConnectionState::AwaitingConnectReply => "awaiting-connect-reply",
            ConnectionState::Ready => "ready",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Why a connection ended, as reported to the listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer sent `text/disconnect-notice`.
    Notice,
    /// The peer closed the transport.
    PeerClosed,
    /// Closed locally through [`crate::Connection::close`].
    Local,
    /// Transport, decode or handshake failure.
    Failed(String),
}

impl DisconnectReason {
    /// Whether the connection ended without a protocol or transport failure.
    pub fn is_clean(&self) -> bool {
        !matches!(self, DisconnectReason::Failed(_))
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Notice => f.write_str("disconnect notice from peer"),
            DisconnectReason::PeerClosed => f.write_str("peer closed the connection"),
            DisconnectReason::Local => f.write_str("closed locally"),
            DisconnectReason::Failed(cause) => write!(f, "failed: {}", cause),
        }
    }
}

/// Errors produced by the protocol engine.
#[derive(Debug, Error)]
pub enum EslError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("header block of {size} bytes exceeds maximum of {max}")]
    HeaderTooLarge { size: usize, max: usize },

    #[error("malformed event body line: {0:?}")]
    MalformedEventBody(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("authentication rejected: {0}")]
    AuthFailed(String),

    #[error("command {command:?} timed out after {timeout:?}")]
    CommandTimeout { command: String, timeout: Duration },

    #[error("command failed: {0}")]
    CommandFailed(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("connection not ready (state: {0})")]
    NotReady(ConnectionState),

    #[error("timed out establishing connection")]
    ConnectTimeout,
}

impl EslError {
    /// A `send_command` wait elapsed; the connection is still usable.
    pub fn is_timeout(&self) -> bool {
        matches!(self, EslError::CommandTimeout { .. })
    }

    /// The connection is gone and will not deliver further replies.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            EslError::Io(_)
                | EslError::Decode(_)
                | EslError::HeaderTooLarge { .. }
                | EslError::Handshake(_)
                | EslError::AuthFailed(_)
                | EslError::ConnectionClosed
        )
    }
}

// io::Error is not Clone; the copy keeps its kind and message.
impl Clone for EslError {
    fn clone(&self) -> Self {
        match self {
            EslError::Io(e) => EslError::Io(std::io::Error::new(e.kind(), e.to_string())),
            EslError::Decode(msg) => EslError::Decode(msg.clone()),
            EslError::HeaderTooLarge { size, max } => EslError::HeaderTooLarge {
                size: *size,
                max: *max,
            },
            EslError::MalformedEventBody(line) => EslError::MalformedEventBody(line.clone()),
            EslError::Handshake(msg) => EslError::Handshake(msg.clone()),
            EslError::AuthFailed(msg) => EslError::AuthFailed(msg.clone()),
            EslError::CommandTimeout { command, timeout } => EslError::CommandTimeout {
                command: command.clone(),
                timeout: *timeout,
            },
            EslError::CommandFailed(msg) => EslError::CommandFailed(msg.clone()),
            EslError::ConnectionClosed => EslError::ConnectionClosed,
            EslError::NotReady(state) => EslError::NotReady(*state),
            EslError::ConnectTimeout => EslError::ConnectTimeout,
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EslError>;
