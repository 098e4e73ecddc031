//! Convenience commands layered on [`Connection::send_command`].

use std::fmt;

use crate::connection::Connection;
use crate::reply::CommandReply;
use crate::types::{EslError, Result};

/// Wire format requested for subscribed events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventFormat {
    #[default]
    Plain,
    Xml,
}

impl EventFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventFormat::Plain => "plain",
            EventFormat::Xml => "xml",
        }
    }
}

impl fmt::Display for EventFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `sendmsg` command: one `sendmsg` line followed by `name: value` lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendMsg {
    uuid: Option<String>,
    lines: Vec<(String, String)>,
}

impl SendMsg {
    /// Target the channel owning the connection (outbound sockets).
    pub fn new() -> Self {
        Self::default()
    }

    /// Target a specific channel.
    pub fn for_uuid(uuid: impl Into<String>) -> Self {
        Self {
            uuid: Some(uuid.into()),
            lines: Vec::new(),
        }
    }

    /// `call-command: execute` for a dialplan application.
    pub fn execute(self, app: &str, arg: Option<&str>) -> Self {
        let msg = self
            .line("call-command", "execute")
            .line("execute-app-name", app);
        match arg {
            Some(arg) => msg.line("execute-app-arg", arg),
            None => msg,
        }
    }

    /// `call-command: hangup` with a hangup cause.
    pub fn hangup(self, cause: &str) -> Self {
        self.line("call-command", "hangup")
            .line("hangup-cause", cause)
    }

    pub fn event_lock(self, lock: bool) -> Self {
        self.line("event-lock", if lock { "true" } else { "false" })
    }

    pub fn loops(self, loops: u32) -> Self {
        self.line("loops", &loops.to_string())
    }

    pub fn line(mut self, name: &str, value: &str) -> Self {
        self.lines.push((name.to_string(), value.to_string()));
        self
    }

    /// The command text, without the terminating blank line.
    pub fn to_command(&self) -> String {
        let mut command = String::from("sendmsg");
        if let Some(uuid) = &self.uuid {
            command.push(' ');
            command.push_str(uuid);
        }
        for (name, value) in &self.lines {
            command.push('\n');
            command.push_str(name);
            command.push_str(": ");
            command.push_str(value);
        }
        command
    }
}

impl Connection {
    /// Run an API command and wait for its `api/response`.
    pub async fn api(&self, command: &str, arg: Option<&str>) -> Result<CommandReply> {
        self.send_command(&join("api", command, arg)).await
    }

    /// Start a background job; returns its `Job-UUID`.
    ///
    /// The result arrives later as a `BACKGROUND_JOB` event carrying the same
    /// `Job-UUID`.
    pub async fn bgapi(&self, command: &str, arg: Option<&str>) -> Result<String> {
        let reply = self.send_command(&join("bgapi", command, arg)).await?;
        if !reply.is_ok() {
            return Err(EslError::CommandFailed(format!(
                "bgapi rejected: {}",
                reply.reply_text().unwrap_or_default()
            )));
        }
        reply
            .job_uuid()
            .ok_or_else(|| EslError::CommandFailed("bgapi reply without Job-UUID".into()))
    }

    /// Subscribe to events by name, e.g. `"CHANNEL_CREATE CHANNEL_HANGUP"` or `"ALL"`.
    pub async fn set_event_subscriptions(
        &self,
        format: EventFormat,
        events: &str,
    ) -> Result<CommandReply> {
        self.send_command(&format!("event {} {}", format, events))
            .await
    }

    pub async fn cancel_event_subscriptions(&self) -> Result<CommandReply> {
        self.send_command("noevents").await
    }

    /// Outbound sockets: subscribe to the events of the connected channel only.
    pub async fn my_events(&self, format: EventFormat) -> Result<CommandReply> {
        self.send_command(&format!("myevents {}", format)).await
    }

    pub async fn add_event_filter(&self, header: &str, value: &str) -> Result<CommandReply> {
        self.send_command(&format!("filter {} {}", header, value))
            .await
    }

    /// Remove a filter; with no value every filter on `header` is removed.
    pub async fn delete_event_filter(
        &self,
        header: &str,
        value: Option<&str>,
    ) -> Result<CommandReply> {
        self.send_command(&join("filter delete", header, value))
            .await
    }

    pub async fn sendmsg(&self, msg: &SendMsg) -> Result<CommandReply> {
        self.send_command(&msg.to_command()).await
    }

    /// Receive switch log lines at `level` (delivered as `log/data` messages).
    pub async fn set_logging_level(&self, level: &str) -> Result<CommandReply> {
        self.send_command(&format!("log {}", level)).await
    }

    pub async fn cancel_logging(&self) -> Result<CommandReply> {
        self.send_command("nolog").await
    }

    /// Outbound sockets: keep the socket open after the channel hangs up.
    pub async fn linger(&self) -> Result<CommandReply> {
        self.send_command("linger").await
    }

    /// Ask the switch to close the socket. It answers, then sends a disconnect notice.
    pub async fn exit(&self) -> Result<CommandReply> {
        self.send_command("exit").await
    }
}

fn join(verb: &str, command: &str, arg: Option<&str>) -> String {
    match arg {
        Some(arg) if !arg.is_empty() => format!("{} {} {}", verb, command, arg),
        _ => format!("{} {}", verb, command),
    }
}
