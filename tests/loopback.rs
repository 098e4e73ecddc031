use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use esl::{
    Client, ClientConfig, Connection, ConnectHandler, ConnectionState, DisconnectReason, EslError,
    Event, Listener, Message, OutboundServer, SendMsg, ServerConfig, ServerHandle, SessionId,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

async fn read_command(socket: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\n\n") {
        socket.read_exact(&mut byte).await.unwrap();
        buf.push(byte[0]);
    }
    String::from_utf8(buf).unwrap()
}

async fn next(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
    timeout(WAIT, rx.recv()).await.unwrap().unwrap()
}

fn plain_event(body: &str) -> String {
    format!(
        "Content-Type: text/event-plain\nContent-Length: {}\n\n{}",
        body.len(),
        body
    )
}

struct Recorder {
    seen: mpsc::UnboundedSender<String>,
}

impl Listener for Recorder {
    fn on_event(&self, event: Event) {
        let _ = self
            .seen
            .send(format!("event {}", event.event_name().unwrap_or("?")));
    }

    fn on_auth_result(&self, success: bool, _reply: &Message) {
        let _ = self.seen.send(format!("auth {}", success));
    }

    fn on_disconnected(&self, reason: DisconnectReason) {
        let _ = self.seen.send(format!("disconnected {}", reason));
    }
}

#[tokio::test]
async fn test_inbound_client_session() {
    let switch = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = switch.local_addr().unwrap().port();

    let switch_task = tokio::spawn(async move {
        let (mut socket, _) = switch.accept().await.unwrap();
        socket
            .write_all(b"Content-Type: auth/request\n\n")
            .await
            .unwrap();
        assert_eq!(read_command(&mut socket).await, "auth ClueCon\n\n");
        socket
            .write_all(b"Content-Type: command/reply\nReply-Text: +OK accepted\n\n")
            .await
            .unwrap();

        assert_eq!(read_command(&mut socket).await, "api status\n\n");
        let body = "UP 0 years, 1 day\n";
        socket
            .write_all(
                format!(
                    "Content-Type: api/response\nContent-Length: {}\n\n{}",
                    body.len(),
                    body
                )
                .as_bytes(),
            )
            .await
            .unwrap();

        socket
            .write_all(plain_event("Event-Name: HEARTBEAT\nUp-Time: 0%20years\n\n").as_bytes())
            .await
            .unwrap();
        socket
            .write_all(b"Content-Type: text/disconnect-notice\nContent-Length: 0\n\n")
            .await
            .unwrap();
        socket
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let config = ClientConfig::new("127.0.0.1", port, "ClueCon");
    let client = Client::connect(&config, Arc::new(Recorder { seen: tx }))
        .await
        .unwrap();
    assert!(client.can_send());

    let reply = client.api("status", None).await.unwrap();
    assert!(reply.reply_text().as_deref() == Some("UP 0 years, 1 day"));

    assert_eq!(next(&mut rx).await, "auth true");
    assert_eq!(next(&mut rx).await, "event HEARTBEAT");
    assert_eq!(next(&mut rx).await, "disconnected disconnect notice from peer");

    timeout(WAIT, client.closed()).await.unwrap();
    assert_eq!(client.state(), ConnectionState::Closed);
    assert_eq!(client.disconnect_reason(), Some(DisconnectReason::Notice));
    assert!(matches!(
        client.api("status", None).await,
        Err(EslError::ConnectionClosed)
    ));

    switch_task.await.unwrap();
}

#[tokio::test]
async fn test_inbound_client_rejected_password() {
    let switch = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = switch.local_addr().unwrap().port();

    let switch_task = tokio::spawn(async move {
        let (mut socket, _) = switch.accept().await.unwrap();
        socket
            .write_all(b"Content-Type: auth/request\n\n")
            .await
            .unwrap();
        assert_eq!(read_command(&mut socket).await, "auth wrong\n\n");
        socket
            .write_all(b"Content-Type: command/reply\nReply-Text: -ERR invalid\n\n")
            .await
            .unwrap();
        socket
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let config = ClientConfig::new("127.0.0.1", port, "wrong");
    let err = Client::connect(&config, Arc::new(Recorder { seen: tx }))
        .await
        .err()
        .unwrap();

    assert!(matches!(err, EslError::AuthFailed(ref text) if text == "-ERR invalid"));
    assert!(err.is_connection_failure());
    assert_eq!(next(&mut rx).await, "auth false");
    assert!(next(&mut rx).await.starts_with("disconnected failed"));

    switch_task.await.unwrap();
}

#[tokio::test]
async fn test_inbound_client_connect_refused() {
    // Grab a free port, then release it
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let (tx, _rx) = mpsc::unbounded_channel();
    let config = ClientConfig::new("127.0.0.1", port, "ClueCon")
        .with_connect_timeout(Duration::from_secs(1));

    let err = Client::connect(&config, Arc::new(Recorder { seen: tx }))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, EslError::Io(_) | EslError::ConnectTimeout));
}

struct CallHandler {
    session_id: SessionId,
    seen: mpsc::UnboundedSender<String>,
}

impl ConnectHandler for CallHandler {
    fn on_connect_response(&self, channel: Event, connection: Connection) {
        let _ = self.seen.send(format!(
            "connect {} {} {}",
            self.session_id,
            channel.get("Unique-ID").unwrap_or("?"),
            channel.get("Channel-Name").unwrap_or("?")
        ));

        let seen = self.seen.clone();
        tokio::spawn(async move {
            if let Ok(reply) = connection
                .sendmsg(&SendMsg::new().execute("answer", None))
                .await
            {
                let _ = seen.send(format!("answer {}", reply.is_ok()));
            }
        });
    }
}

impl Listener for CallHandler {
    fn on_event(&self, event: Event) {
        let _ = self
            .seen
            .send(format!("event {}", event.event_name().unwrap_or("?")));
    }

    fn on_disconnected(&self, reason: DisconnectReason) {
        let _ = self.seen.send(format!("disconnected {}", reason));
    }
}

type RunningServer = (
    SocketAddr,
    ServerHandle,
    mpsc::UnboundedReceiver<String>,
    JoinHandle<esl::Result<()>>,
);

async fn start_server() -> RunningServer {
    let server = OutboundServer::bind(ServerConfig::new("test", "127.0.0.1:0"))
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let handle = server.handle();

    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(server.run(move |session_id| {
        Arc::new(CallHandler {
            session_id,
            seen: tx.clone(),
        })
    }));
    (addr, handle, rx, task)
}

async fn wait_for_sessions(handle: &ServerHandle, expected: usize) {
    timeout(WAIT, async {
        while handle.session_count().await != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_outbound_server_session() {
    let (addr, handle, mut rx, server_task) = start_server().await;

    let mut switch = TcpStream::connect(addr).await.unwrap();
    assert_eq!(read_command(&mut switch).await, "connect\n\n");
    switch
        .write_all(
            b"Content-Type: command/reply\nReply-Text: +OK\nUnique-ID: abc-123\nChannel-Name: sofia%2Finternal%2F1000\n\n",
        )
        .await
        .unwrap();

    assert_eq!(next(&mut rx).await, "connect 1 abc-123 sofia/internal/1000");
    wait_for_sessions(&handle, 1).await;

    assert_eq!(
        read_command(&mut switch).await,
        "sendmsg\ncall-command: execute\nexecute-app-name: answer\n\n"
    );
    switch
        .write_all(b"Content-Type: command/reply\nReply-Text: +OK\n\n")
        .await
        .unwrap();
    assert_eq!(next(&mut rx).await, "answer true");

    switch
        .write_all(plain_event("Event-Name: CHANNEL_ANSWER\nUnique-ID: abc-123\n\n").as_bytes())
        .await
        .unwrap();
    assert_eq!(next(&mut rx).await, "event CHANNEL_ANSWER");

    drop(switch);
    assert_eq!(next(&mut rx).await, "disconnected peer closed the connection");
    wait_for_sessions(&handle, 0).await;

    handle.shutdown();
    timeout(WAIT, server_task).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_outbound_server_shutdown_closes_sessions() {
    let (addr, handle, mut rx, server_task) = start_server().await;

    let mut switch = TcpStream::connect(addr).await.unwrap();
    assert_eq!(read_command(&mut switch).await, "connect\n\n");
    switch
        .write_all(b"Content-Type: command/reply\nReply-Text: +OK\nUnique-ID: xyz\n\n")
        .await
        .unwrap();
    assert!(next(&mut rx).await.starts_with("connect 1 xyz"));
    // Leave the answer unacknowledged; shutdown must still close the session.
    read_command(&mut switch).await;
    wait_for_sessions(&handle, 1).await;

    handle.shutdown();
    timeout(WAIT, server_task).await.unwrap().unwrap().unwrap();
    assert_eq!(handle.session_count().await, 0);

    let mut rest = Vec::new();
    let n = timeout(WAIT, switch.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);
    assert_eq!(next(&mut rx).await, "disconnected closed locally");
}
