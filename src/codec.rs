use std::io;

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::core::message::RedirectMessage;

/// Frames redirect messages on a stream transport.
///
/// The redirect header has no length of its own, so each message travels in a length-delimited
/// frame: header byte first, payload after.
pub struct RedirectCodec {
    codec: LengthDelimitedCodec,
}

impl RedirectCodec {
    pub fn new() -> Self {
        Self {
            codec: LengthDelimitedCodec::new(),
        }
    }
}

impl Default for RedirectCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for RedirectCodec {
    type Item = RedirectMessage;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let bytes = match self.codec.decode(src)? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };

        match RedirectMessage::decode(bytes.freeze()) {
            Some(message) => Ok(Some(message)),
            None => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "frame is missing the redirect header",
            )),
        }
    }
}

impl Encoder<RedirectMessage> for RedirectCodec {
    type Error = io::Error;

    fn encode(&mut self, message: RedirectMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.codec.encode(message.to_bytes(), dst)
    }
}
