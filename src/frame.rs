//! Incremental message decoding and command encoding.
//!
//! The decoder is a two-state machine:
//! - `Headers`: consume one `Name: Value` line at a time until a blank line
//! - `Body`: header block done, waiting for exactly `Content-Length` bytes
//!
//! Partial lines stay in the caller's buffer and accumulated headers stay in the
//! decoder, so a message may arrive split across any number of reads.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::types::{
    Dialect, EslError, Header, Message, Result, CONTENT_LENGTH, CONTENT_TYPE,
    DEFAULT_MAX_HEADER_SIZE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Headers,
    Body { remaining: usize },
}

/// Stateful decoder turning a byte stream into [`Message`]s.
#[derive(Debug)]
pub struct FrameDecoder {
    dialect: Dialect,
    max_header_size: usize,
    state: State,
    headers: Vec<Header>,
    /// Dialect B body accumulator.
    folded: String,
    header_bytes: usize,
}

impl FrameDecoder {
    pub fn new(dialect: Dialect, max_header_size: usize) -> Self {
        Self {
            dialect,
            max_header_size,
            state: State::Headers,
            headers: Vec::new(),
            folded: String::new(),
            header_bytes: 0,
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn max_header_size(&self) -> usize {
        self.max_header_size
    }

    /// True when no partial message is held.
    pub fn is_idle(&self) -> bool {
        self.state == State::Headers && self.headers.is_empty() && self.header_bytes == 0
    }

    /// Try to decode one message from the front of `buf`.
    ///
    /// Consumed bytes are removed from `buf`. Returns `Ok(None)` when more bytes
    /// are needed; the partial state is kept for the next call.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>> {
        loop {
            match self.state {
                State::Headers => {
                    let Some(pos) = buf.iter().position(|&b| b == b'\n') else {
                        let pending = self.header_bytes + buf.len();
                        if pending > self.max_header_size {
                            return Err(EslError::HeaderTooLarge {
                                size: pending,
                                max: self.max_header_size,
                            });
                        }
                        return Ok(None);
                    };

                    let line = buf.split_to(pos + 1);
                    self.header_bytes += line.len();
                    if self.header_bytes > self.max_header_size {
                        return Err(EslError::HeaderTooLarge {
                            size: self.header_bytes,
                            max: self.max_header_size,
                        });
                    }

                    let line = std::str::from_utf8(trim_line_end(&line))
                        .map_err(|_| EslError::Decode("header line is not valid UTF-8".into()))?;

                    if !line.is_empty() {
                        self.push_header_line(line)?;
                        continue;
                    }

                    if self.headers.is_empty() {
                        // Stray separator between messages
                        self.header_bytes = 0;
                        continue;
                    }

                    match self.declared_length()? {
                        Some(len) if len > 0 => {
                            trace!("header block complete, awaiting {} body bytes", len);
                            self.state = State::Body { remaining: len };
                        }
                        Some(_) => return Ok(Some(self.finish(Some(Bytes::new())))),
                        None => return Ok(Some(self.finish(None))),
                    }
                }
                State::Body { remaining } => {
                    if buf.len() < remaining {
                        return Ok(None);
                    }
                    let body = buf.split_to(remaining).freeze();
                    return Ok(Some(self.finish(Some(body))));
                }
            }
        }
    }

    /// Decode at end of stream. Leftover partial data is a decode failure.
    pub fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Message>> {
        if let Some(message) = self.decode(buf)? {
            return Ok(Some(message));
        }
        if buf.is_empty() && self.is_idle() {
            return Ok(None);
        }
        let reason = match self.state {
            State::Body { remaining } => format!(
                "stream ended {} bytes short of declared body",
                remaining - buf.len()
            ),
            State::Headers => "stream ended inside a header block".to_string(),
        };
        Err(EslError::Decode(reason))
    }

    /// Drop any partial message.
    pub fn reset(&mut self) {
        self.state = State::Headers;
        self.headers.clear();
        self.folded.clear();
        self.header_bytes = 0;
    }

    fn push_header_line(&mut self, line: &str) -> Result<()> {
        let Some((name, value)) = line.split_once(':') else {
            return Err(EslError::Decode(format!("malformed header line {:?}", line)));
        };
        let name = name.trim();
        let value = value.trim();
        if name.is_empty() {
            return Err(EslError::Decode(format!("header line without name {:?}", line)));
        }

        if self.dialect.folds_headers() && name != CONTENT_TYPE && name != CONTENT_LENGTH {
            if !self.folded.is_empty() {
                self.folded.push('\n');
            }
            self.folded.push_str(name);
            self.folded.push_str(": ");
            self.folded.push_str(value);
        }

        self.headers.push(Header::new(name, value));
        Ok(())
    }

    fn declared_length(&self) -> Result<Option<usize>> {
        match self.headers.iter().find(|h| h.name == CONTENT_LENGTH) {
            Some(h) => h
                .value
                .parse()
                .map(Some)
                .map_err(|_| EslError::Decode(format!("invalid Content-Length {:?}", h.value))),
            None => Ok(None),
        }
    }

    /// Emit the accumulated message and reset for the next one.
    ///
    /// A declared body always wins over the dialect B accumulator so the body
    /// length matches `Content-Length` exactly.
    fn finish(&mut self, body: Option<Bytes>) -> Message {
        let headers = std::mem::take(&mut self.headers);
        let folded = std::mem::take(&mut self.folded);
        self.state = State::Headers;
        self.header_bytes = 0;

        let body = match body {
            Some(body) => Some(body),
            None if !folded.is_empty() => Some(Bytes::from(folded)),
            None => None,
        };
        Message { headers, body }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(Dialect::Client, DEFAULT_MAX_HEADER_SIZE)
    }
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && (line[end - 1] == b'\n' || line[end - 1] == b'\r') {
        end -= 1;
    }
    &line[..end]
}

/// Encode a command: its line(s) followed by the blank terminating line.
pub fn encode_command(command: &str, dst: &mut BytesMut) {
    let command = command.trim_end_matches(|c| c == '\r' || c == '\n');
    dst.reserve(command.len() + 2);
    dst.put_slice(command.as_bytes());
    dst.put_slice(b"\n\n");
}

/// Encode a full message the way a switch writes it, computing `Content-Length`
/// from the body.
pub fn encode_message(message: &Message, dst: &mut BytesMut) {
    for header in message.headers.iter().filter(|h| h.name != CONTENT_LENGTH) {
        dst.put_slice(header.name.as_bytes());
        dst.put_slice(b": ");
        dst.put_slice(header.value.as_bytes());
        dst.put_u8(b'\n');
    }
    match &message.body {
        Some(body) => {
            dst.put_slice(format!("{}: {}\n\n", CONTENT_LENGTH, body.len()).as_bytes());
            dst.put_slice(body);
        }
        None => dst.put_u8(b'\n'),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn decode_all(decoder: &mut FrameDecoder, data: &[u8]) -> Vec<Message> {
        let mut buf = BytesMut::from(data);
        let mut out = Vec::new();
        while let Some(msg) = decoder.decode(&mut buf).unwrap() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn test_duplicate_headers_preserved_in_order() {
        let mut decoder = FrameDecoder::default();
        let msgs = decode_all(&mut decoder, b"A: 1\nA: 2\n\n");

        assert_eq!(msgs.len(), 1);
        assert_eq!(
            msgs[0].headers,
            vec![Header::new("A", "1"), Header::new("A", "2")]
        );
        assert!(msgs[0].body.is_none());
    }

    #[test]
    fn test_body_read_verbatim_with_blank_lines() {
        let body = "Event-Name: CUSTOM\n\nstill body\n\n";
        let wire = format!(
            "Content-Type: text/event-plain\nContent-Length: {}\n\n{}",
            body.len(),
            body
        );
        let mut decoder = FrameDecoder::default();
        let msgs = decode_all(&mut decoder, wire.as_bytes());

        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].body_len(), body.len());
        assert_eq!(msgs[0].content_length(), Some(body.len()));
        assert_eq!(msgs[0].body_text().unwrap(), body);
    }

    #[test]
    fn test_crlf_and_whitespace_trimmed() {
        let mut decoder = FrameDecoder::default();
        let msgs = decode_all(
            &mut decoder,
            b"Content-Type:  command/reply \r\nReply-Text: +OK accepted\r\n\r\n",
        );

        assert_eq!(msgs[0].content_type(), Some("command/reply"));
        assert_eq!(msgs[0].header("Reply-Text"), Some("+OK accepted"));
    }

    #[test]
    fn test_value_split_on_first_colon() {
        let mut decoder = FrameDecoder::default();
        let msgs = decode_all(&mut decoder, b"Reply-Text: +OK Job-UUID: abc\n\n");
        assert_eq!(msgs[0].header("Reply-Text"), Some("+OK Job-UUID: abc"));
    }

    #[test]
    fn test_dialect_b_folds_headers_into_body() {
        let mut decoder = FrameDecoder::new(Dialect::Server, DEFAULT_MAX_HEADER_SIZE);
        let msgs = decode_all(&mut decoder, b"Unique-ID: abc\nCall-Direction: inbound\n\n");

        assert_eq!(msgs.len(), 1);
        assert_eq!(
            msgs[0].body_text().unwrap(),
            "Unique-ID: abc\nCall-Direction: inbound"
        );
        // Headers are kept as well
        assert_eq!(msgs[0].header("Unique-ID"), Some("abc"));
    }

    #[test]
    fn test_dialect_b_excludes_control_headers() {
        let mut decoder = FrameDecoder::new(Dialect::Server, DEFAULT_MAX_HEADER_SIZE);
        let msgs = decode_all(
            &mut decoder,
            b"Content-Type: command/reply\nReply-Text: +OK\nUnique-ID: x\n\n",
        );

        assert_eq!(msgs[0].body_text().unwrap(), "Reply-Text: +OK\nUnique-ID: x");
        assert_eq!(msgs[0].content_type(), Some("command/reply"));
    }

    #[test]
    fn test_dialect_b_declared_body_wins() {
        let mut decoder = FrameDecoder::new(Dialect::Server, DEFAULT_MAX_HEADER_SIZE);
        let msgs = decode_all(
            &mut decoder,
            b"Content-Type: api/response\nX-Extra: 1\nContent-Length: 3\n\nabc",
        );

        assert_eq!(msgs[0].body_text().unwrap(), "abc");
        assert_eq!(msgs[0].body_len(), 3);
    }

    #[test]
    fn test_dialect_a_does_not_fold() {
        let mut decoder = FrameDecoder::default();
        let msgs = decode_all(&mut decoder, b"Unique-ID: abc\n\n");
        assert!(msgs[0].body.is_none());
    }

    #[test]
    fn test_multiple_messages_in_one_buffer() {
        let mut decoder = FrameDecoder::default();
        let msgs = decode_all(
            &mut decoder,
            b"Content-Type: auth/request\n\nContent-Type: command/reply\nReply-Text: +OK\n\n",
        );

        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].content_type(), Some("auth/request"));
        assert_eq!(msgs[1].header("Reply-Text"), Some("+OK"));
    }

    #[test]
    fn test_stray_blank_lines_skipped() {
        let mut decoder = FrameDecoder::default();
        let msgs = decode_all(&mut decoder, b"\n\r\nContent-Type: auth/request\n\n");
        assert_eq!(msgs.len(), 1);
    }

    #[test]
    fn test_byte_at_a_time() {
        let wire = b"Content-Type: api/response\nContent-Length: 5\n\nhello";
        let mut decoder = FrameDecoder::default();
        let mut buf = BytesMut::new();
        let mut msgs = Vec::new();

        for byte in wire.iter() {
            buf.put_u8(*byte);
            if let Some(msg) = decoder.decode(&mut buf).unwrap() {
                msgs.push(msg);
            }
        }

        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].body_text().unwrap(), "hello");
        assert!(decoder.is_idle());
    }

    #[test]
    fn test_random_chunking_yields_same_messages() {
        let mut wire = BytesMut::new();
        for i in 0..20 {
            let body = format!("Event-Name: HEARTBEAT\nEvent-Sequence: {}\n\n", i);
            let msg = Message::new()
                .with_header("Content-Type", "text/event-plain")
                .with_body(body);
            encode_message(&msg, &mut wire);
        }
        let wire = wire.freeze();

        let mut rng = rand::thread_rng();
        for _ in 0..10 {
            let mut decoder = FrameDecoder::default();
            let mut buf = BytesMut::new();
            let mut seen = 0;
            let mut offset = 0;
            while offset < wire.len() {
                let step = rng.gen_range(1..=37).min(wire.len() - offset);
                buf.extend_from_slice(&wire[offset..offset + step]);
                offset += step;
                while let Some(msg) = decoder.decode(&mut buf).unwrap() {
                    let text = msg.body_text().unwrap().into_owned();
                    assert!(text.contains(&format!("Event-Sequence: {}\n", seen)));
                    seen += 1;
                }
            }
            assert_eq!(seen, 20);
        }
    }

    #[test]
    fn test_header_block_too_large() {
        let mut decoder = FrameDecoder::new(Dialect::Client, 32);
        let mut buf = BytesMut::from(&b"X-Long: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"[..]);

        let err = decoder.decode(&mut buf).unwrap_err();
        assert!(matches!(err, EslError::HeaderTooLarge { max: 32, .. }));
    }

    #[test]
    fn test_header_limit_does_not_bound_body() {
        let body = "x".repeat(256);
        let wire = format!("Content-Type: api/response\nContent-Length: 256\n\n{}", body);
        let mut decoder = FrameDecoder::new(Dialect::Client, 64);
        let msgs = decode_all(&mut decoder, wire.as_bytes());
        assert_eq!(msgs[0].body_len(), 256);
    }

    #[test]
    fn test_malformed_header_line() {
        let mut decoder = FrameDecoder::default();
        let mut buf = BytesMut::from(&b"no colon here\n\n"[..]);
        assert!(matches!(decoder.decode(&mut buf), Err(EslError::Decode(_))));
    }

    #[test]
    fn test_invalid_content_length() {
        let mut decoder = FrameDecoder::default();
        let mut buf = BytesMut::from(&b"Content-Length: ten\n\n"[..]);
        assert!(matches!(decoder.decode(&mut buf), Err(EslError::Decode(_))));
    }

    #[test]
    fn test_eof_short_body_is_error() {
        let mut decoder = FrameDecoder::default();
        let mut buf = BytesMut::from(&b"Content-Type: api/response\nContent-Length: 10\n\nabc"[..]);

        assert!(decoder.decode(&mut buf).unwrap().is_none());
        let err = decoder.decode_eof(&mut buf).unwrap_err();
        assert!(err.to_string().contains("short of declared body"));
    }

    #[test]
    fn test_eof_clean() {
        let mut decoder = FrameDecoder::default();
        let mut buf = BytesMut::from(&b"Content-Type: auth/request\n\n"[..]);
        assert!(decoder.decode_eof(&mut buf).unwrap().is_some());
        assert!(decoder.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_encode_command_appends_blank_line() {
        let mut dst = BytesMut::new();
        encode_command("auth ClueCon", &mut dst);
        assert_eq!(&dst[..], b"auth ClueCon\n\n");

        let mut dst = BytesMut::new();
        encode_command("sendmsg\ncall-command: hangup\n", &mut dst);
        assert_eq!(&dst[..], b"sendmsg\ncall-command: hangup\n\n");
    }
}
