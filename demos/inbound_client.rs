use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use esl::{Client, ClientConfig, DisconnectReason, Event, EventFormat, Listener, Message};
use tracing::{info, warn};

struct PrintEvents;

impl Listener for PrintEvents {
    fn on_event(&self, event: Event) {
        info!(
            "Event {}: {} properties",
            event.event_name().unwrap_or("<unnamed>"),
            event.len()
        );
        if let Some(job) = event.job_uuid() {
            info!("Background job {} finished: {:?}", job, event.body());
        }
    }

    fn on_auth_result(&self, success: bool, _reply: &Message) {
        info!("Authentication {}", if success { "accepted" } else { "rejected" });
    }

    fn on_disconnected(&self, reason: DisconnectReason) {
        warn!("Disconnected: {}", reason);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    info!("Starting inbound client example...");

    let config = ClientConfig::new("127.0.0.1", 8021, "ClueCon");
    let client = Client::connect(&config, Arc::new(PrintEvents)).await?;

    let reply = client.api("status", None).await?;
    info!("status: {}", reply.reply_text().unwrap_or_default());

    client
        .set_event_subscriptions(EventFormat::Plain, "HEARTBEAT BACKGROUND_JOB")
        .await?;

    let job = client.bgapi("show", Some("channels")).await?;
    info!("Started background job {}", job);

    // Let a few events arrive
    tokio::time::sleep(Duration::from_secs(30)).await;

    client.exit().await?;
    client.close().await;

    info!("Client example completed successfully!");
    Ok(())
}
