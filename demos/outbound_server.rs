use std::error::Error;
use std::sync::Arc;

use esl::{
    Connection, ConnectHandler, Event, EventFormat, Listener, OutboundServer, SendMsg,
    ServerConfig, SessionId,
};
use tracing::{error, info};

/// Answers each call and plays a prompt.
struct Ivr {
    session_id: SessionId,
}

impl ConnectHandler for Ivr {
    fn on_connect_response(&self, channel: Event, connection: Connection) {
        let session_id = self.session_id;
        info!(
            "Session {}: call from {:?} on channel {:?}",
            session_id,
            channel.get("Caller-Caller-ID-Number"),
            channel.get("Unique-ID")
        );

        // The dispatch task is waiting on us; talk to the switch from a new task.
        tokio::spawn(async move {
            let steps = async {
                connection.my_events(EventFormat::Plain).await?;
                connection
                    .sendmsg(&SendMsg::new().execute("answer", None))
                    .await?;
                connection
                    .sendmsg(
                        &SendMsg::new()
                            .execute("playback", Some("ivr/ivr-welcome.wav"))
                            .event_lock(true),
                    )
                    .await?;
                connection
                    .sendmsg(&SendMsg::new().hangup("NORMAL_CLEARING"))
                    .await
            };
            if let Err(e) = steps.await {
                error!("Session {}: {}", session_id, e);
            }
        });
    }
}

impl Listener for Ivr {
    fn on_event(&self, event: Event) {
        info!(
            "Session {}: {}",
            self.session_id,
            event.event_name().unwrap_or("<unnamed>")
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    info!("Starting outbound server example...");

    let server = OutboundServer::bind(ServerConfig::new("ivr", "127.0.0.1:8084")).await?;
    let handle = server.handle();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.shutdown();
        }
    });

    server
        .run(|session_id| Arc::new(Ivr { session_id }))
        .await?;

    Ok(())
}
