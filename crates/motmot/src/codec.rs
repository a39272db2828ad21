use crate::protocol::Message;
use bytes::{Buf, BytesMut};
use rmpv::Value;
use std::io::{self, Cursor};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Bytes read from a socket per read call.
pub const READ_CHUNK: usize = 4096;

/// Upper bound on bytes buffered for a single incomplete message.
pub const MAX_PENDING_BYTES: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed msgpack: {0}")]
    Malformed(String),
    #[error("incomplete message exceeds {MAX_PENDING_BYTES} buffered bytes")]
    TooLarge,
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Incremental MessagePack decoder and encoder.
///
/// Bytes are fed in arbitrary chunks; [`drain`](Self::drain) yields every
/// complete value currently buffered and keeps a trailing partial value for
/// the next [`feed`](Self::feed).
#[derive(Debug, Default)]
pub struct MessageCodec {
    buf: BytesMut,
}

impl MessageCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet decoded.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn drain(&mut self) -> Result<Vec<Value>, CodecError> {
        let mut values = Vec::new();
        while let Some(value) = decode_one(&mut self.buf)? {
            values.push(value);
        }
        Ok(values)
    }

    pub fn encode(message: &Message) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        let value = Value::from(message.clone());
        rmpv::encode::write_value(&mut out, &value)
            .map_err(|e| CodecError::Encode(e.to_string()))?;
        Ok(out)
    }
}

/// Decode one value from the front of `buf`, consuming its bytes.
/// Returns `Ok(None)` when more bytes are needed.
fn decode_one(buf: &mut BytesMut) -> Result<Option<Value>, CodecError> {
    if buf.is_empty() {
        return Ok(None);
    }
    let mut cursor = Cursor::new(&buf[..]);
    match rmpv::decode::read_value(&mut cursor) {
        Ok(value) => {
            let used = cursor.position() as usize;
            buf.advance(used);
            Ok(Some(value))
        }
        Err(e) if is_incomplete(&e) => {
            if buf.len() > MAX_PENDING_BYTES {
                Err(CodecError::TooLarge)
            } else {
                Ok(None)
            }
        }
        Err(e) => Err(CodecError::Malformed(e.to_string())),
    }
}

fn is_incomplete(err: &rmpv::decode::Error) -> bool {
    match err {
        rmpv::decode::Error::InvalidMarkerRead(e) | rmpv::decode::Error::InvalidDataRead(e) => {
            e.kind() == io::ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}

impl Decoder for MessageCodec {
    type Item = Value;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Value>, CodecError> {
        decode_one(src)
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), CodecError> {
        let bytes = MessageCodec::encode(&item)?;
        dst.extend_from_slice(&bytes);
        Ok(())
    }
}
