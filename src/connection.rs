//! Connection engine: handshake state machine, ordered dispatch and
//! synchronous command correlation.
//!
//! Every connection runs two tasks:
//! - the reader decodes messages in arrival order and hands command replies
//!   straight to the armed waiter; it never runs application code
//! - the dispatcher drains everything else from an ordered queue, drives the
//!   handshake and calls the [`Listener`]
//!
//! The protocol carries no request identifiers, so at most one command is in
//! flight per connection and a reply belongs to whichever command is armed.

use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, trace, warn};

use crate::codec::EslCodec;
use crate::event::Event;
use crate::reply::CommandReply;
use crate::role::{ConnectHandler, Listener, RoleStrategy};
use crate::types::{
    ConnectionState, ContentType, DisconnectReason, EslError, Message, Result, SessionId,
    DEFAULT_MAX_HEADER_SIZE, REPLY_TEXT,
};

/// Default wait for a command reply.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Per-connection tunables.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Wait applied by [`Connection::send_command`] and the handshake commands.
    pub command_timeout: Duration,
    /// Upper bound for one decoded header block.
    pub max_header_size: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
        }
    }
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The single outstanding command.
struct PendingCommand {
    command: String,
    reply_tx: oneshot::Sender<Result<Message>>,
    deadline: Instant,
}

/// Work item for the dispatcher, in arrival order.
enum Dispatch {
    Message(Message),
    Closed(DisconnectReason),
}

struct Inner {
    id: SessionId,
    writer: tokio::sync::Mutex<FramedWrite<BoxedWriter, EslCodec>>,
    /// Held for the whole write-then-wait of one command.
    issue: tokio::sync::Mutex<()>,
    pending: Mutex<Option<PendingCommand>>,
    state: watch::Sender<ConnectionState>,
    listener: Arc<dyn Listener>,
    options: ConnectionOptions,
    /// Set by the reader once the transport has ended.
    transport_end: Mutex<Option<DisconnectReason>>,
    closed: AtomicBool,
    reason: Mutex<Option<DisconnectReason>>,
    /// The error that failed the connection, reported by `wait_ready`.
    failure: Mutex<Option<EslError>>,
    orphaned: AtomicU64,
}

/// Handle to one protocol connection. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Start the engine over an established transport.
    ///
    /// Must be called within a tokio runtime. Outbound roles write `connect`
    /// immediately; inbound roles wait for the switch's `auth/request`.
    pub fn start<S>(
        stream: S,
        role: RoleStrategy,
        listener: Arc<dyn Listener>,
        options: ConnectionOptions,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        Self::start_session(id, stream, role, listener, options)
    }

    pub(crate) fn start_session<S>(
        id: SessionId,
        stream: S,
        role: RoleStrategy,
        listener: Arc<dyn Listener>,
        options: ConnectionOptions,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let dialect = role.dialect();
        let (read_half, write_half) = tokio::io::split(stream);
        let reader = FramedRead::new(read_half, EslCodec::new(dialect, options.max_header_size));
        let write_half: BoxedWriter = Box::new(write_half);
        let writer = FramedWrite::new(write_half, EslCodec::new(dialect, options.max_header_size));
        let (state, _) = watch::channel(ConnectionState::Init);

        let connection = Connection {
            inner: Arc::new(Inner {
                id,
                writer: tokio::sync::Mutex::new(writer),
                issue: tokio::sync::Mutex::new(()),
                pending: Mutex::new(None),
                state,
                listener,
                options,
                transport_end: Mutex::new(None),
                closed: AtomicBool::new(false),
                reason: Mutex::new(None),
                failure: Mutex::new(None),
                orphaned: AtomicU64::new(0),
            }),
        };

        debug!("Starting connection {} as {:?}", id, role);

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        tokio::spawn(connection.clone().read_loop(reader, queue_tx));
        tokio::spawn(connection.clone().dispatch_loop(role, queue_rx));

        connection
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Whether commands can be issued now.
    pub fn can_send(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Replies discarded because no command was waiting for them.
    pub fn orphaned_replies(&self) -> u64 {
        self.inner.orphaned.load(Ordering::Relaxed)
    }

    /// Why the connection ended, once it has.
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        lock(&self.inner.reason).clone()
    }

    /// Wait until the handshake completes.
    pub async fn wait_ready(&self) -> Result<()> {
        let mut state_rx = self.inner.state.subscribe();
        loop {
            let state = *state_rx.borrow_and_update();
            if state == ConnectionState::Ready {
                return Ok(());
            }
            if state.is_terminal() {
                return Err(lock(&self.inner.failure)
                    .clone()
                    .unwrap_or(EslError::ConnectionClosed));
            }
            if state_rx.changed().await.is_err() {
                return Err(EslError::ConnectionClosed);
            }
        }
    }

    /// Wait until the connection has ended.
    pub async fn closed(&self) {
        let mut state_rx = self.inner.state.subscribe();
        while !state_rx.borrow_and_update().is_terminal() {
            if state_rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Close the connection. Safe to call repeatedly and concurrently; the
    /// listener hears about it once.
    pub async fn close(&self) {
        self.terminate(DisconnectReason::Local, ConnectionState::Closed)
            .await;
    }

    /// Send a command and wait for its reply using the configured timeout.
    pub async fn send_command(&self, command: &str) -> Result<CommandReply> {
        self.send_command_timeout(command, self.inner.options.command_timeout)
            .await
    }

    /// Send a command and wait up to `timeout` for its reply.
    ///
    /// Concurrent callers queue; each write is followed by its reply before the
    /// next caller writes. A timeout abandons the wait only: the command has
    /// been sent, and a reply arriving later is discarded.
    pub async fn send_command_timeout(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandReply> {
        match self.state() {
            ConnectionState::Ready => {}
            state if state.is_terminal() => return Err(EslError::ConnectionClosed),
            state => return Err(EslError::NotReady(state)),
        }
        let message = self.exchange(command, timeout).await?;
        Ok(CommandReply::new(command, message))
    }

    async fn exchange(&self, command: &str, timeout: Duration) -> Result<Message> {
        let _issue = self.inner.issue.lock().await;

        let (reply_tx, mut reply_rx) = oneshot::channel();
        self.arm(PendingCommand {
            command: command.to_string(),
            reply_tx,
            deadline: Instant::now() + timeout,
        })?;
        let _armed = Disarm(self);

        debug!("Connection {} sending [{}]", self.id(), redact(command));
        // The deadline covers the write too: a peer that stops reading stalls it
        let round_trip = async {
            self.write(command).await?;
            match (&mut reply_rx).await {
                Ok(result) => result,
                Err(_) => Err(EslError::ConnectionClosed),
            }
        };
        let outcome = tokio::time::timeout(timeout, round_trip).await;

        match outcome {
            Ok(result) => result,
            Err(_) => {
                self.pending_slot().take();
                // The reply may have landed between the deadline and disarming
                if let Ok(result) = reply_rx.try_recv() {
                    return result;
                }
                warn!(
                    "Connection {} command [{}] timed out after {:?}",
                    self.id(),
                    redact(command),
                    timeout
                );
                Err(EslError::CommandTimeout {
                    command: redact(command).into_owned(),
                    timeout,
                })
            }
        }
    }

    /// Write one command, giving up (and releasing the writer) once the
    /// connection ends.
    async fn write(&self, command: &str) -> Result<()> {
        let send = async {
            let mut writer = self.inner.writer.lock().await;
            writer.send(command).await
        };
        tokio::select! {
            result = send => result,
            _ = self.closed() => Err(EslError::ConnectionClosed),
        }
    }

    /// Install the pending command. The open check runs under the slot lock,
    /// the same lock `terminate` and the reader hold while marking the end.
    fn arm(&self, pending: PendingCommand) -> Result<()> {
        let mut slot = self.pending_slot();
        if self.is_closed() || lock(&self.inner.transport_end).is_some() {
            return Err(EslError::ConnectionClosed);
        }
        *slot = Some(pending);
        Ok(())
    }

    /// Keep the first failure; later ones are consequences of it.
    fn record_failure(&self, err: EslError) {
        lock(&self.inner.failure).get_or_insert(err);
    }

    fn pending_slot(&self) -> MutexGuard<'_, Option<PendingCommand>> {
        lock(&self.inner.pending)
    }

    /// Hand a reply to the armed waiter, or give it back if nobody waits.
    fn resolve_pending(&self, message: Message) -> std::result::Result<(), Message> {
        let Some(pending) = self.pending_slot().take() else {
            return Err(message);
        };
        if pending.reply_tx.is_closed() {
            return Err(message);
        }
        if Instant::now() > pending.deadline {
            debug!(
                "Connection {} reply for [{}] arrived past its deadline",
                self.id(),
                redact(&pending.command)
            );
        }
        trace!(
            "Connection {} reply for [{}]",
            self.id(),
            redact(&pending.command)
        );
        let _ = pending.reply_tx.send(Ok(message));
        Ok(())
    }

    fn fail_pending(&self, err: EslError) {
        if let Some(pending) = self.pending_slot().take() {
            debug!(
                "Connection {} failing pending command [{}]: {}",
                self.id(),
                redact(&pending.command),
                err
            );
            let _ = pending.reply_tx.send(Err(err));
        }
    }

    fn orphan(&self, message: &Message) {
        self.inner.orphaned.fetch_add(1, Ordering::Relaxed);
        warn!(
            "Connection {} discarding orphaned reply {:?}",
            self.id(),
            message.header(REPLY_TEXT).or(message.content_type())
        );
    }

    fn set_state(&self, next: ConnectionState) {
        let id = self.id();
        self.inner.state.send_if_modified(|state| {
            if state.is_terminal() || *state == next {
                return false;
            }
            debug!("Connection {} state {} -> {}", id, state, next);
            *state = next;
            true
        });
    }

    /// Reader task: decode in order, route replies, queue the rest.
    async fn read_loop<R>(self, mut reader: FramedRead<R, EslCodec>, queue: mpsc::UnboundedSender<Dispatch>)
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut state_rx = self.inner.state.subscribe();

        let reason = loop {
            tokio::select! {
                frame = reader.next() => match frame {
                    Some(Ok(message)) => self.route(message, &queue),
                    Some(Err(e)) => {
                        error!("Connection {} read error: {}", self.id(), e);
                        let reason = DisconnectReason::Failed(e.to_string());
                        self.record_failure(e);
                        break reason;
                    }
                    None => {
                        debug!("Connection {} closed by peer", self.id());
                        break DisconnectReason::PeerClosed;
                    }
                },
                changed = state_rx.changed() => {
                    if changed.is_err() || state_rx.borrow().is_terminal() {
                        trace!("Connection {} reader stopping", self.id());
                        return;
                    }
                }
            }
        };

        {
            let _slot = self.pending_slot();
            *lock(&self.inner.transport_end) = Some(reason.clone());
        }
        self.fail_pending(EslError::ConnectionClosed);
        let _ = queue.send(Dispatch::Closed(reason));
    }

    fn route(&self, message: Message, queue: &mpsc::UnboundedSender<Dispatch>) {
        let state = self.state();
        if state.is_terminal() {
            trace!("Connection {} dropping message after close", self.id());
            return;
        }

        let is_reply = message.kind().is_some_and(|kind| kind.is_reply());
        // During a handshake the next message answers the handshake command,
        // whatever its content type.
        let handshake = state.awaits_handshake_reply();

        if is_reply || handshake {
            match self.resolve_pending(message) {
                Ok(()) => return,
                Err(message) if handshake && !is_reply => {
                    let _ = queue.send(Dispatch::Message(message));
                }
                Err(message) => self.orphan(&message),
            }
            return;
        }

        let _ = queue.send(Dispatch::Message(message));
    }

    /// Dispatcher task: handshake first, then the ready loop.
    async fn dispatch_loop(self, role: RoleStrategy, mut queue: mpsc::UnboundedReceiver<Dispatch>) {
        let handshake = match &role {
            RoleStrategy::Inbound { .. } => {
                self.set_state(ConnectionState::AwaitingAuthRequest);
                Ok(())
            }
            RoleStrategy::Outbound { handler } => self.greet(handler.as_ref()).await,
        };
        if let Err(e) = handshake {
            self.fail(e).await;
            return;
        }

        while let Some(item) = queue.recv().await {
            if self.is_closed() {
                break;
            }
            match item {
                Dispatch::Closed(reason) => {
                    let state = if reason.is_clean() {
                        ConnectionState::Closed
                    } else {
                        ConnectionState::Failed
                    };
                    self.terminate(reason, state).await;
                    break;
                }
                Dispatch::Message(message) => {
                    if let Err(e) = self.dispatch(&role, message).await {
                        self.fail(e).await;
                        break;
                    }
                }
            }
        }
        trace!("Connection {} dispatcher stopped", self.id());
    }

    async fn dispatch(&self, role: &RoleStrategy, message: Message) -> Result<()> {
        let kind = message.kind();
        match self.state() {
            ConnectionState::AwaitingAuthRequest => match (role, kind) {
                (RoleStrategy::Inbound { password }, Some(ContentType::AuthRequest)) => {
                    self.authenticate(password).await
                }
                (_, Some(ContentType::DisconnectNotice)) => {
                    self.terminate(DisconnectReason::Notice, ConnectionState::Closed)
                        .await;
                    Ok(())
                }
                (_, other) => Err(EslError::Handshake(format!(
                    "expected auth/request, received {}",
                    describe(other.as_ref())
                ))),
            },
            ConnectionState::Ready => {
                self.dispatch_ready(message, kind).await;
                Ok(())
            }
            state => {
                debug!(
                    "Connection {} ignoring {} in state {}",
                    self.id(),
                    describe(kind.as_ref()),
                    state
                );
                Ok(())
            }
        }
    }

    async fn dispatch_ready(&self, message: Message, kind: Option<ContentType>) {
        match kind {
            Some(ContentType::EventPlain | ContentType::EventXml) => {
                match Event::from_message(message) {
                    Ok(event) => {
                        trace!("Connection {} received {}", self.id(), event);
                        self.inner.listener.on_event(event);
                    }
                    Err(e) => warn!("Connection {} dropping unparseable event: {}", self.id(), e),
                }
            }
            Some(ContentType::DisconnectNotice) => {
                debug!("Connection {} received disconnection notice", self.id());
                self.terminate(DisconnectReason::Notice, ConnectionState::Closed)
                    .await;
            }
            Some(ContentType::CommandReply | ContentType::ApiResponse) => self.orphan(&message),
            _ => self.inner.listener.on_unrecognized(&message),
        }
    }

    async fn authenticate(&self, password: &str) -> Result<()> {
        debug!("Connection {} auth requested, sending [auth *****]", self.id());
        self.set_state(ConnectionState::AwaitingAuthReply);

        let command = format!("auth {}", password);
        let message = match self
            .exchange(&command, self.inner.options.command_timeout)
            .await
        {
            Ok(message) => message,
            Err(e) => {
                warn!("Connection {} no auth reply: {}", self.id(), e);
                self.inner.listener.on_auth_result(false, &Message::default());
                return Err(handshake_error(e));
            }
        };

        if message.kind() != Some(ContentType::CommandReply) {
            error!(
                "Connection {} bad auth response content type {:?}",
                self.id(),
                message.content_type()
            );
            self.inner.listener.on_auth_result(false, &message);
            return Err(EslError::Handshake(format!(
                "auth reply has content type {}",
                describe(message.kind().as_ref())
            )));
        }

        let reply = CommandReply::new("auth", message);
        if !reply.is_ok() {
            let text = reply.reply_text().map(Cow::into_owned).unwrap_or_default();
            warn!("Connection {} authentication rejected: {}", self.id(), text);
            self.inner.listener.on_auth_result(false, reply.message());
            return Err(EslError::AuthFailed(text));
        }

        info!("Connection {} authenticated", self.id());
        self.set_state(ConnectionState::Ready);
        self.inner.listener.on_auth_result(true, reply.message());
        Ok(())
    }

    async fn greet(&self, handler: &dyn ConnectHandler) -> Result<()> {
        debug!("Connection {} sending connect", self.id());
        self.set_state(ConnectionState::AwaitingConnectReply);

        let message = self
            .exchange("connect", self.inner.options.command_timeout)
            .await
            .map_err(handshake_error)?;
        let event = Event::from_headers(message);
        info!(
            "Connection {} channel data received for {}",
            self.id(),
            event.get("Unique-ID").unwrap_or("<unknown>")
        );

        self.set_state(ConnectionState::Ready);
        handler.on_connect_response(event, self.clone());
        Ok(())
    }

    async fn fail(&self, err: EslError) {
        // A waiter woken by a dead transport reports the transport's reason
        let reason = match (&err, lock(&self.inner.transport_end).clone()) {
            (EslError::ConnectionClosed, Some(reason)) => reason,
            _ => DisconnectReason::Failed(err.to_string()),
        };
        if !self.is_closed() {
            error!("Connection {} failed: {}", self.id(), err);
            if !reason.is_clean() {
                self.record_failure(err);
            }
        }
        let state = if reason.is_clean() {
            ConnectionState::Closed
        } else {
            ConnectionState::Failed
        };
        self.terminate(reason, state).await;
    }

    async fn terminate(&self, reason: DisconnectReason, state: ConnectionState) {
        let first = {
            let _slot = self.pending_slot();
            !self.inner.closed.swap(true, Ordering::SeqCst)
        };
        if !first {
            return;
        }
        info!("Connection {} ended: {}", self.id(), reason);

        *lock(&self.inner.reason) = Some(reason.clone());
        self.inner.state.send_replace(state);
        self.fail_pending(EslError::ConnectionClosed);
        self.inner.listener.on_disconnected(reason);

        let mut writer = self.inner.writer.lock().await;
        if let Err(e) = writer.get_mut().shutdown().await {
            debug!("Connection {} transport shutdown: {}", self.id(), e);
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

/// Disarms the pending slot when a command exchange ends, including when the
/// caller's future is dropped mid-wait.
struct Disarm<'a>(&'a Connection);

impl Drop for Disarm<'_> {
    fn drop(&mut self) {
        self.0.pending_slot().take();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn redact(command: &str) -> Cow<'_, str> {
    if command.starts_with("auth ") {
        Cow::Borrowed("auth *****")
    } else {
        Cow::Borrowed(command)
    }
}

/// A handshake command that timed out leaves no usable connection behind.
fn handshake_error(err: EslError) -> EslError {
    match err {
        EslError::CommandTimeout { command, timeout } => EslError::Handshake(format!(
            "no reply to [{}] within {:?}",
            command, timeout
        )),
        other => other,
    }
}

fn describe(kind: Option<&ContentType>) -> String {
    match kind {
        Some(kind) => kind.to_string(),
        None => "message without Content-Type".to_string(),
    }
}
