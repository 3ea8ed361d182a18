//! Incremental decoding of the streamed message sequence.
//!
//! The upstream response body is a continuous sequence of JSON objects with
//! no framing beyond JSON itself. Objects may straddle network chunk
//! boundaries, so raw bytes are buffered until at least one complete object
//! is available.

use bytes::{Buf, BytesMut};
use serde::Deserialize;

/// A single element of the upstream stream. Only the text matters here.
#[derive(Debug, Deserialize)]
pub struct StreamMessage {
    #[serde(default)]
    pub text: String,
}

/// Buffers body bytes and yields complete messages.
#[derive(Default)]
pub struct StreamDecoder {
    buf: BytesMut,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    /// Feed one body chunk and drain every message it completes.
    ///
    /// A trailing partial object stays buffered for the next chunk. A syntax
    /// error means the stream is corrupt; the caller treats it as a dead
    /// connection.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<StreamMessage>, serde_json::Error> {
        self.buf.extend_from_slice(chunk);

        let mut messages = Vec::new();
        let mut consumed = 0;
        let mut corrupt = None;
        {
            let mut objects = serde_json::Deserializer::from_slice(&self.buf)
                .into_iter::<StreamMessage>();
            loop {
                match objects.next() {
                    Some(Ok(message)) => {
                        messages.push(message);
                        consumed = objects.byte_offset();
                    }
                    // Partial object at the end of the buffer: wait for more.
                    Some(Err(e)) if e.is_eof() => break,
                    Some(Err(e)) => {
                        corrupt = Some(e);
                        break;
                    }
                    None => break,
                }
            }
        }
        self.buf.advance(consumed);

        match corrupt {
            Some(e) => Err(e),
            None => Ok(messages),
        }
    }
}
