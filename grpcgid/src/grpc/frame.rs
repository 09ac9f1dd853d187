use bytes::{BufMut, Bytes, BytesMut};
use h2::RecvStream;
use thiserror::Error;

pub const FRAME_HEADER_LEN: usize = 5;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("stream ended before a full message frame was read")]
    UnexpectedEof,
    #[error("transport error while reading message frame")]
    Transport(#[from] h2::Error),
}

/// One length-delimited RPC message. The compression flag is carried through
/// untouched; a non-zero flag means the payload is opaque to the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub compression_flag: u8,
    pub payload: Bytes,
}

/// Prefixes `payload` with the 5-byte header (flag 0, big-endian length).
pub fn encode_frame(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.put_u8(0);
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(payload);
    buf.freeze()
}

/// Incremental frame decoder: feed received chunks, get a frame back once the
/// header and the declared payload are complete.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Option<Frame> {
        self.buf.extend_from_slice(chunk);
        self.poll()
    }

    fn poll(&mut self) -> Option<Frame> {
        if self.buf.len() < FRAME_HEADER_LEN {
            return None;
        }
        let declared =
            u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
        if self.buf.len() < FRAME_HEADER_LEN + declared {
            return None;
        }
        let header = self.buf.split_to(FRAME_HEADER_LEN);
        let payload = self.buf.split_to(declared).freeze();
        Some(Frame {
            compression_flag: header[0],
            payload,
        })
    }
}

/// Reads exactly one framed message from the inbound stream. Data received
/// past the first frame is left unread; the caller never consumes a second
/// message (unary calls only).
pub async fn read_message(body: &mut RecvStream) -> Result<Frame, FrameError> {
    let mut decoder = FrameDecoder::new();
    loop {
        match body.data().await {
            Some(Ok(chunk)) => {
                let released = chunk.len();
                let frame = decoder.push(&chunk);
                body.flow_control().release_capacity(released)?;
                if let Some(frame) = frame {
                    return Ok(frame);
                }
            }
            Some(Err(err)) => return Err(FrameError::Transport(err)),
            None => return Err(FrameError::UnexpectedEof),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let payload = [0x00u8, 0x01, 0x02, 0x03];
        let encoded = encode_frame(&payload);
        assert_eq!(&encoded[..], &[0, 0, 0, 0, 4, 0x00, 0x01, 0x02, 0x03]);

        let mut decoder = FrameDecoder::new();
        let frame = decoder.push(&encoded).expect("complete frame");
        assert_eq!(frame.compression_flag, 0);
        assert_eq!(&frame.payload[..], &payload);
    }

    #[test]
    fn empty_payload_roundtrip() {
        let encoded = encode_frame(&[]);
        assert_eq!(&encoded[..], &[0, 0, 0, 0, 0]);
        let mut decoder = FrameDecoder::new();
        let frame = decoder.push(&encoded).expect("complete frame");
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn decoder_handles_split_chunks() {
        let encoded = encode_frame(b"hello");
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(&encoded[..3]).is_none());
        assert!(decoder.push(&encoded[3..7]).is_none());
        let frame = decoder.push(&encoded[7..]).expect("complete frame");
        assert_eq!(&frame.payload[..], b"hello");
    }

    #[test]
    fn compression_flag_passes_through() {
        let mut raw = vec![1u8, 0, 0, 0, 2, 0xAA, 0xBB];
        let mut decoder = FrameDecoder::new();
        let frame = decoder.push(&raw).expect("complete frame");
        assert_eq!(frame.compression_flag, 1);
        assert_eq!(&frame.payload[..], &[0xAA, 0xBB]);

        // Trailing bytes beyond the first frame stay unconsumed.
        raw.push(0xFF);
        let mut decoder = FrameDecoder::new();
        let frame = decoder.push(&raw).expect("complete frame");
        assert_eq!(&frame.payload[..], &[0xAA, 0xBB]);
    }
}
