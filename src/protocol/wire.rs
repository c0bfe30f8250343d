//! Length-prefixed frame codec.
//!
//! Every message travels as one frame:
//!
//! ```text
//! [ total_length: u32, big endian ][ magic tag: 4 bytes ][ body ]
//! ```
//!
//! `total_length` covers the magic tag and the body but not the length
//! prefix itself. The body is the serde_json encoding of an
//! [`RpcMessage`]. Encoding and decoding are pure; the async helpers at
//! the bottom move whole frames across a byte stream and nothing else.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, RpcError};
use crate::protocol::RpcMessage;

/// Magic tag opening every frame body.
///
/// The trailing byte is the protocol revision. A peer speaking a different
/// revision fails the tag comparison and is disconnected rather than
/// misparsed.
pub const PROTOCOL_MAGIC: [u8; 4] = *b"WRP1";

/// Size of the length prefix preceding each frame.
pub const LEN_PREFIX_SIZE: usize = 4;

/// Default cap on the declared frame length, see
/// [`RpcConfig::max_frame_size`](crate::RpcConfig::max_frame_size).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Encode a message into a complete frame, length prefix included.
///
/// # Errors
///
/// Returns [`RpcError::Serialization`] if the body cannot be serialized and
/// [`RpcError::FrameTooLarge`] if the frame would not fit a `u32` length.
pub fn encode(message: &RpcMessage) -> Result<Bytes> {
    // ---
    let body = serde_json::to_vec(message)?;
    let total = PROTOCOL_MAGIC.len() + body.len();
    if total > u32::MAX as usize {
        return Err(RpcError::FrameTooLarge {
            len: total,
            limit: u32::MAX as usize,
        });
    }

    let mut frame = BytesMut::with_capacity(LEN_PREFIX_SIZE + total);
    frame.put_u32(total as u32);
    frame.put_slice(&PROTOCOL_MAGIC);
    frame.put_slice(&body);
    Ok(frame.freeze())
}

/// Decode the contents of one frame, without its length prefix.
///
/// # Errors
///
/// Returns [`RpcError::UnknownMessage`] if the magic tag is missing or
/// wrong, and [`RpcError::Parse`] if the body is not a valid message. No
/// field-level validation happens here; an empty service name, for
/// instance, is rejected at dispatch time, not by the codec.
pub fn decode(frame: &[u8]) -> Result<RpcMessage> {
    // ---
    if frame.len() < PROTOCOL_MAGIC.len() || frame[..PROTOCOL_MAGIC.len()] != PROTOCOL_MAGIC {
        return Err(RpcError::UnknownMessage);
    }
    serde_json::from_slice(&frame[PROTOCOL_MAGIC.len()..]).map_err(RpcError::Parse)
}

/// Read one frame from `reader`, returning its contents without the prefix.
///
/// Reads exactly the length prefix, validates the declared size against
/// `max_frame_size` before allocating, then reads the rest of the frame.
pub(crate) async fn read_frame<R>(reader: &mut R, max_frame_size: usize) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    // ---
    let mut len_buf = [0u8; LEN_PREFIX_SIZE];
    reader.read_exact(&mut len_buf).await?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_frame_size {
        return Err(RpcError::FrameTooLarge {
            len,
            limit: max_frame_size,
        });
    }

    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame).await?;
    Ok(frame)
}

/// Write one already-encoded frame to `writer` and flush it.
pub(crate) async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    // ---
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn round_trip(message: RpcMessage) {
        // ---
        let frame = encode(&message).unwrap();
        let decoded = decode(&frame[LEN_PREFIX_SIZE..]).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_round_trip_request() {
        // ---
        round_trip(RpcMessage::Request {
            id: 1,
            service: "Echo".into(),
            method: "Call".into(),
            payload: Bytes::from_static(b"{\"text\":\"hello\"}"),
        });
    }

    #[test]
    fn test_round_trip_response_and_error() {
        // ---
        round_trip(RpcMessage::Response {
            id: 42,
            payload: Bytes::from_static(b"{}"),
        });
        round_trip(RpcMessage::Error {
            id: 43,
            code: crate::protocol::ErrorCode::UnknownMethod,
            message: "Frob".into(),
        });
    }

    #[test]
    fn test_round_trip_empty_payload() {
        // ---
        round_trip(RpcMessage::Request {
            id: 2,
            service: "Echo".into(),
            method: "Call".into(),
            payload: Bytes::new(),
        });
    }

    #[test]
    fn test_round_trip_large_payload() {
        // ---
        // Larger than 64 KiB so multi-chunk transports would exercise
        // reassembly.
        let payload = Bytes::from(vec![0x5a; 70 * 1024]);
        round_trip(RpcMessage::Response { id: 3, payload });
    }

    #[test]
    fn test_declared_length_excludes_prefix() {
        // ---
        let message = RpcMessage::Response {
            id: 9,
            payload: Bytes::from_static(b"abc"),
        };
        let frame = encode(&message).unwrap();

        let declared = u32::from_be_bytes(frame[..LEN_PREFIX_SIZE].try_into().unwrap()) as usize;
        assert_eq!(declared, frame.len() - LEN_PREFIX_SIZE);
        assert_eq!(&frame[LEN_PREFIX_SIZE..LEN_PREFIX_SIZE + 4], &PROTOCOL_MAGIC);
    }

    #[test]
    fn test_decode_rejects_bad_magic() {
        // ---
        let mut frame = b"NOPE".to_vec();
        frame.extend_from_slice(b"{}");
        assert!(matches!(decode(&frame), Err(RpcError::UnknownMessage)));
    }

    #[test]
    fn test_decode_rejects_short_frame() {
        // ---
        assert!(matches!(decode(&[0x57, 0x52]), Err(RpcError::UnknownMessage)));
    }

    #[test]
    fn test_decode_rejects_garbage_body() {
        // ---
        let mut frame = PROTOCOL_MAGIC.to_vec();
        frame.extend_from_slice(b"not json at all");
        assert!(matches!(decode(&frame), Err(RpcError::Parse(_))));
    }

    #[tokio::test]
    async fn test_frame_io_round_trip() {
        // ---
        let (mut a, mut b) = tokio::io::duplex(4096);
        let message = RpcMessage::Request {
            id: 7,
            service: "Echo".into(),
            method: "Call".into(),
            payload: Bytes::from_static(b"hi"),
        };

        let frame = encode(&message).unwrap();
        write_frame(&mut a, &frame).await.unwrap();

        let read = read_frame(&mut b, DEFAULT_MAX_FRAME_SIZE).await.unwrap();
        assert_eq!(decode(&read).unwrap(), message);
    }

    #[tokio::test]
    async fn test_read_frame_rejects_oversized_before_allocating() {
        // ---
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&100u32.to_be_bytes()).await.unwrap();

        let err = read_frame(&mut b, 16).await.unwrap_err();
        assert!(matches!(
            err,
            RpcError::FrameTooLarge {
                len: 100,
                limit: 16
            }
        ));
    }

    #[tokio::test]
    async fn test_read_frame_reports_eof() {
        // ---
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);

        let err = read_frame(&mut b, 64).await.unwrap_err();
        assert!(
            matches!(err, RpcError::Io(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
        );
    }
}
