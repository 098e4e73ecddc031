//! Event model: name/value properties parsed from a message.

use std::fmt;

use percent_encoding::percent_decode_str;

use crate::types::{
    ContentType, EslError, Message, Result, CONTENT_LENGTH, CONTENT_TYPE, JOB_UUID,
};

/// Property holding the event's name.
pub const EVENT_NAME: &str = "Event-Name";

/// An asynchronous notification from the switch.
///
/// Properties iterate in the order they appeared on the wire. A repeated name
/// keeps its first position and takes the later value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    properties: Vec<(String, String)>,
    body: Option<String>,
    message: Message,
}

impl Event {
    /// Parse the message body as `Name: Value` lines.
    ///
    /// `text/event-xml` bodies are not line-oriented; they produce an event with
    /// no properties and the XML available through [`Event::raw_body`].
    pub fn from_message(message: Message) -> Result<Self> {
        if message.kind() == Some(ContentType::EventXml) {
            return Ok(Self {
                properties: Vec::new(),
                body: None,
                message,
            });
        }

        let (properties, body) = match message.body_text() {
            Some(text) => parse_properties(&text)?,
            None => (Vec::new(), None),
        };
        Ok(Self {
            properties,
            body,
            message,
        })
    }

    /// Build an event from the header block itself, as channel data is delivered
    /// in reply to `connect`. Control headers are skipped.
    pub fn from_headers(message: Message) -> Self {
        let mut event = Self {
            properties: Vec::new(),
            body: None,
            message: Message::default(),
        };
        for header in message
            .headers
            .iter()
            .filter(|h| h.name != CONTENT_TYPE && h.name != CONTENT_LENGTH)
        {
            event.insert(header.name.clone(), decode_value(&header.value));
        }
        event.message = message;
        event
    }

    fn insert(&mut self, name: String, value: String) {
        match self.properties.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.properties.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn properties(&self) -> impl Iterator<Item = (&str, &str)> {
        self.properties.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    pub fn event_name(&self) -> Option<&str> {
        self.get(EVENT_NAME)
    }

    pub fn job_uuid(&self) -> Option<&str> {
        self.get(JOB_UUID)
    }

    /// Text following the property block when the event declares its own
    /// `Content-Length` (background job results, custom payloads).
    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }

    /// The unparsed body of the originating message.
    pub fn raw_body(&self) -> Option<std::borrow::Cow<'_, str>> {
        self.message.body_text()
    }

    /// The message this event was parsed from.
    pub fn message(&self) -> &Message {
        &self.message
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Event[{}, {} properties]",
            self.event_name().unwrap_or("<unnamed>"),
            self.properties.len()
        )
    }
}

type Properties = (Vec<(String, String)>, Option<String>);

fn parse_properties(text: &str) -> Result<Properties> {
    let mut event = Event {
        properties: Vec::new(),
        body: None,
        message: Message::default(),
    };
    let mut rest = text;

    while !rest.is_empty() {
        let (line, next) = match rest.find('\n') {
            Some(pos) => (&rest[..pos], &rest[pos + 1..]),
            None => (rest, ""),
        };
        rest = next;
        let line = line.trim_end_matches('\r');

        if line.trim().is_empty() {
            if let Some(len) = event.get(CONTENT_LENGTH).and_then(|v| v.parse::<usize>().ok()) {
                let end = len.min(rest.len());
                let body = rest.get(..end).unwrap_or(rest);
                event.body = Some(body.to_string());
                break;
            }
            continue;
        }

        let Some((name, value)) = line.split_once(':') else {
            return Err(EslError::MalformedEventBody(line.to_string()));
        };
        event.insert(name.trim().to_string(), decode_value(value.trim()));
    }

    Ok((event.properties, event.body))
}

fn decode_value(value: &str) -> String {
    percent_decode_str(value).decode_utf8_lossy().into_owned()
}
