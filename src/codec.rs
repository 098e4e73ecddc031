//! `tokio_util` codec adapter over [`FrameDecoder`].

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::frame::{encode_command, FrameDecoder};
use crate::types::{Dialect, EslError, Message, DEFAULT_MAX_HEADER_SIZE};

/// Decodes [`Message`]s and encodes command text for `Framed` transports.
#[derive(Debug)]
pub struct EslCodec {
    decoder: FrameDecoder,
}

impl EslCodec {
    pub fn new(dialect: Dialect, max_header_size: usize) -> Self {
        Self {
            decoder: FrameDecoder::new(dialect, max_header_size),
        }
    }

    /// Codec for connections this side initiated (dialect A).
    pub fn client() -> Self {
        Self::new(Dialect::Client, DEFAULT_MAX_HEADER_SIZE)
    }

    /// Codec for connections accepted by a listening server (dialect B).
    pub fn server() -> Self {
        Self::new(Dialect::Server, DEFAULT_MAX_HEADER_SIZE)
    }

    pub fn dialect(&self) -> Dialect {
        self.decoder.dialect()
    }
}

impl Default for EslCodec {
    fn default() -> Self {
        Self::client()
    }
}

impl Decoder for EslCodec {
    type Item = Message;
    type Error = EslError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decoder.decode(src)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decoder.decode_eof(src)
    }
}

impl Encoder<String> for EslCodec {
    type Error = EslError;

    fn encode(&mut self, command: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_command(&command, dst);
        Ok(())
    }
}

impl<'a> Encoder<&'a str> for EslCodec {
    type Error = EslError;

    fn encode(&mut self, command: &'a str, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_command(command, dst);
        Ok(())
    }
}
