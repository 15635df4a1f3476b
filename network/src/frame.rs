//! Length-prefixed framing
//!
//! Every frame is a base-128 varint length (low 7 bits first, high bit set
//! on all but the last byte) followed by that many body bytes.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame body accepted from a peer (10 MiB)
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// A u64 never needs more than 10 varint bytes
pub const MAX_VARINT_LEN: usize = 10;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame of {size} bytes exceeds limit of {max}")]
    TooLarge { size: usize, max: usize },

    #[error("Malformed varint length prefix")]
    MalformedVarint,

    #[error("Connection closed")]
    Closed,
}

/// Append `value` as a varint
pub fn encode_varint(mut value: u64, buf: &mut Vec<u8>) {
    while value >= 0x80 {
        buf.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

/// Number of bytes `encode_varint` writes for `value`
pub fn varint_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.max(1).div_ceil(7)
}

/// Decode a varint from the start of `buf`.
///
/// Returns the value and the number of bytes consumed, or `None` when the
/// buffer ends before the last group, the encoding overflows a u64 or it is
/// longer than the minimal encoding.
pub fn decode_varint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    for (i, byte) in buf.iter().enumerate().take(MAX_VARINT_LEN) {
        let group = (byte & 0x7f) as u64;
        if !group_fits(i, group, *byte) {
            return None;
        }
        value |= group << (7 * i as u32);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

/// Overflow and minimal-length check for the group at position `i`
fn group_fits(i: usize, group: u64, byte: u8) -> bool {
    // the tenth byte may only carry the top bit of a u64
    if i == MAX_VARINT_LEN - 1 && group > 1 {
        return false;
    }
    // a zero final group after the first byte is an overlong encoding
    !(i > 0 && byte == 0)
}

/// Read one varint from an async stream
pub async fn read_varint<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u64, FrameError> {
    let mut value: u64 = 0;
    for i in 0..MAX_VARINT_LEN {
        let byte = match reader.read_u8().await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof && i == 0 => {
                return Err(FrameError::Closed)
            }
            Err(e) => return Err(FrameError::Io(e)),
        };
        let group = (byte & 0x7f) as u64;
        if !group_fits(i, group, byte) {
            return Err(FrameError::MalformedVarint);
        }
        value |= group << (7 * i as u32);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(FrameError::MalformedVarint)
}

/// Read one frame body
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> Result<Vec<u8>, FrameError> {
    let len = read_varint(reader).await?;
    let size = usize::try_from(len).map_err(|_| FrameError::MalformedVarint)?;
    if size > max_size {
        return Err(FrameError::TooLarge {
            size,
            max: max_size,
        });
    }
    let mut body = vec![0u8; size];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// Write one frame and flush; bodies over `max_size` are refused
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    body: &[u8],
    max_size: usize,
) -> Result<(), FrameError> {
    if body.len() > max_size {
        return Err(FrameError::TooLarge {
            size: body.len(),
            max: max_size,
        });
    }
    let mut buf = Vec::with_capacity(body.len() + varint_len(body.len() as u64));
    encode_varint(body.len() as u64, &mut buf);
    buf.extend_from_slice(body);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: u64) -> (u64, usize) {
        let mut buf = Vec::new();
        encode_varint(value, &mut buf);
        assert_eq!(buf.len(), varint_len(value), "length for {}", value);
        decode_varint(&buf).unwrap()
    }

    #[test]
    fn test_varint_boundaries() {
        let cases: [(u64, usize); 8] = [
            (0, 1),
            (1, 1),
            (127, 1),
            (128, 2),
            (16_383, 2),
            (16_384, 3),
            (2_097_151, 3),
            (2_097_152, 4),
        ];
        for (value, len) in cases {
            assert_eq!(roundtrip(value), (value, len));
        }
    }

    #[test]
    fn test_varint_five_bytes_and_more() {
        assert_eq!(roundtrip(1 << 28), (1 << 28, 5));
        assert_eq!(roundtrip(u32::MAX as u64), (u32::MAX as u64, 5));
        assert_eq!(roundtrip(1 << 35), (1 << 35, 6));
        assert_eq!(roundtrip(u64::MAX), (u64::MAX, 10));
    }

    #[test]
    fn test_varint_wire_layout() {
        let mut buf = Vec::new();
        encode_varint(300, &mut buf);
        assert_eq!(buf, vec![0xac, 0x02]);
    }

    #[test]
    fn test_varint_truncated_and_overlong() {
        assert_eq!(decode_varint(&[0x80, 0x80]), None);
        assert_eq!(decode_varint(&[]), None);
        assert_eq!(decode_varint(&[0xff; 11]), None);
        let mut overflow = vec![0xff; 9];
        overflow.push(0x02);
        assert_eq!(decode_varint(&overflow), None);
    }

    #[test]
    fn test_varint_non_minimal_rejected() {
        // 0 and 1 padded with empty continuation groups
        assert_eq!(decode_varint(&[0x80, 0x00]), None);
        assert_eq!(decode_varint(&[0x81, 0x80, 0x00]), None);
        // a single zero byte is the minimal encoding of 0
        assert_eq!(decode_varint(&[0x00]), Some((0, 1)));
    }

    #[tokio::test]
    async fn test_read_varint_non_minimal_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[0x85, 0x00]).await.unwrap();
        assert!(matches!(
            read_varint(&mut b).await,
            Err(FrameError::MalformedVarint)
        ));
    }

    #[test]
    fn test_decode_ignores_trailing_bytes() {
        assert_eq!(decode_varint(&[0x05, 0xaa, 0xbb]), Some((5, 1)));
    }

    #[tokio::test]
    async fn test_frame_roundtrip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        let body = vec![42u8; 20_000];
        write_frame(&mut a, &body, MAX_FRAME_SIZE).await.unwrap();
        write_frame(&mut a, b"", MAX_FRAME_SIZE).await.unwrap();

        assert_eq!(read_frame(&mut b, MAX_FRAME_SIZE).await.unwrap(), body);
        assert!(read_frame(&mut b, MAX_FRAME_SIZE).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_frame_too_large_rejected() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, &[1u8; 100], MAX_FRAME_SIZE).await.unwrap();
        let result = read_frame(&mut b, 10).await;
        assert!(matches!(result, Err(FrameError::TooLarge { size: 100, max: 10 })));
    }

    #[tokio::test]
    async fn test_write_honours_configured_limit() {
        let (mut a, _b) = tokio::io::duplex(1024);
        let result = write_frame(&mut a, &[1u8; 100], 64).await;
        assert!(matches!(result, Err(FrameError::TooLarge { size: 100, max: 64 })));
        write_frame(&mut a, &[1u8; 64], 64).await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_stream() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(matches!(
            read_frame(&mut b, MAX_FRAME_SIZE).await,
            Err(FrameError::Closed)
        ));
    }
}
