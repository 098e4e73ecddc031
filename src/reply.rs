//! Replies to synchronous commands.

use std::borrow::Cow;

use crate::types::{ContentType, Message, JOB_UUID, REPLY_TEXT};

/// The correlated reply to one command, paired with the command text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReply {
    command: String,
    message: Message,
}

impl CommandReply {
    pub fn new(command: impl Into<String>, message: Message) -> Self {
        Self {
            command: command.into(),
            message,
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn into_message(self) -> Message {
        self.message
    }

    /// Reply text: the `Reply-Text` header of a `command/reply`, or the body
    /// of an `api/response`.
    pub fn reply_text(&self) -> Option<Cow<'_, str>> {
        match self.message.kind() {
            Some(ContentType::ApiResponse) => self
                .message
                .body_text()
                .map(|text| Cow::Owned(text.trim_end().to_string())),
            _ => self.message.header(REPLY_TEXT).map(Cow::Borrowed),
        }
    }

    /// `+OK ...` signals success; anything else, including a missing reply text, is failure.
    pub fn is_ok(&self) -> bool {
        self.reply_text()
            .map_or(false, |text| text.starts_with("+OK"))
    }

    /// Error text following `-ERR`, if the reply signals failure that way.
    pub fn error_text(&self) -> Option<String> {
        let text = self.reply_text()?;
        text.strip_prefix("-ERR").map(|rest| rest.trim().to_string())
    }

    /// Background job identifier from a `bgapi` reply.
    pub fn job_uuid(&self) -> Option<String> {
        if let Some(uuid) = self.message.header(JOB_UUID) {
            return Some(uuid.to_string());
        }
        let text = self.reply_text()?;
        text.split_once("Job-UUID:")
            .map(|(_, uuid)| uuid.trim().to_string())
            .filter(|uuid| !uuid.is_empty())
    }
}
