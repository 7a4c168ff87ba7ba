//! # Length-Prefixed Framing
//!
//! Purpose: Split every TCP stream into discrete messages with a 4-byte
//! big-endian length prefix, keeping allocations under control.
//!
//! ## Design Principles
//! 1. **Incremental Parsing**: the async side feeds a `BytesMut` and drains
//!    complete frames as they arrive.
//! 2. **Bounded Frames**: a frame longer than the configured maximum is an
//!    `Oversize` failure before any payload byte is buffered.
//! 3. **Binary-Safe**: the payload is opaque to this layer.

use std::io::{Read, Write};

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{CacheError, CacheResult};

/// Number of bytes in the frame length prefix.
pub const LENGTH_PREFIX_BYTES: usize = 4;

/// Appends one framed payload to `out`.
pub fn write_frame(payload: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
}

/// Writes one framed payload to a blocking writer and flushes it.
///
/// Used by the synchronous client; the async services frame into a buffer
/// with [`write_frame`] and hand it to the socket in one write.
pub fn send_frame<W: Write>(writer: &mut W, payload: &[u8], max_frame: usize) -> CacheResult<()> {
    if payload.len() > max_frame {
        return Err(CacheError::Oversize {
            size: payload.len(),
            limit: max_frame,
        });
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

/// Reads one complete frame from a blocking reader.
///
/// Timeouts configured on the underlying socket surface as IO errors and are
/// mapped to [`CacheError::Timeout`] by the caller.
pub fn read_frame<R: Read>(reader: &mut R, max_frame: usize) -> CacheResult<Vec<u8>> {
    let mut prefix = [0u8; LENGTH_PREFIX_BYTES];
    reader.read_exact(&mut prefix)?;
    let len = u32::from_be_bytes(prefix) as usize;
    if len > max_frame {
        return Err(CacheError::Oversize {
            size: len,
            limit: max_frame,
        });
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

/// Incremental frame parser over a reusable `BytesMut` buffer.
///
/// The caller appends raw socket bytes and drains zero or more complete
/// frames per read; partially received frames stay buffered.
#[derive(Debug, Clone)]
pub struct FrameParser {
    max_frame: usize,
}

impl FrameParser {
    /// Creates a parser enforcing the provided maximum frame size.
    pub fn new(max_frame: usize) -> Self {
        FrameParser { max_frame }
    }

    /// Attempts to extract the next complete frame from `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    pub fn parse(&self, buf: &mut BytesMut) -> CacheResult<Option<Bytes>> {
        if buf.len() < LENGTH_PREFIX_BYTES {
            return Ok(None);
        }

        let mut prefix = [0u8; LENGTH_PREFIX_BYTES];
        prefix.copy_from_slice(&buf[..LENGTH_PREFIX_BYTES]);
        let len = u32::from_be_bytes(prefix) as usize;
        if len > self.max_frame {
            return Err(CacheError::Oversize {
                size: len,
                limit: self.max_frame,
            });
        }

        if buf.len() < LENGTH_PREFIX_BYTES + len {
            // Reserve up front so the next read lands in one allocation.
            buf.reserve(LENGTH_PREFIX_BYTES + len - buf.len());
            return Ok(None);
        }

        buf.advance(LENGTH_PREFIX_BYTES);
        Ok(Some(buf.split_to(len).freeze()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_single_frame() {
        let mut out = Vec::new();
        write_frame(b"hello", &mut out);

        let parser = FrameParser::new(1024);
        let mut buf = BytesMut::from(&out[..]);
        let frame = parser.parse(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut out = Vec::new();
        write_frame(b"abcdef", &mut out);

        let parser = FrameParser::new(1024);
        let mut buf = BytesMut::from(&out[..4]);
        assert!(parser.parse(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&out[4..7]);
        assert!(parser.parse(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&out[7..]);
        let frame = parser.parse(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], b"abcdef");
    }

    #[test]
    fn two_frames_in_one_read() {
        let mut out = Vec::new();
        write_frame(b"one", &mut out);
        write_frame(b"two", &mut out);

        let parser = FrameParser::new(1024);
        let mut buf = BytesMut::from(&out[..]);
        assert_eq!(&parser.parse(&mut buf).unwrap().unwrap()[..], b"one");
        assert_eq!(&parser.parse(&mut buf).unwrap().unwrap()[..], b"two");
        assert!(parser.parse(&mut buf).unwrap().is_none());
    }

    #[test]
    fn oversize_frame_is_rejected() {
        let mut out = Vec::new();
        write_frame(&[0u8; 64], &mut out);

        let parser = FrameParser::new(16);
        let mut buf = BytesMut::from(&out[..]);
        assert!(matches!(
            parser.parse(&mut buf),
            Err(CacheError::Oversize { size: 64, limit: 16 })
        ));
    }

    #[test]
    fn zero_length_frame_is_valid() {
        let mut out = Vec::new();
        write_frame(b"", &mut out);

        let parser = FrameParser::new(16);
        let mut buf = BytesMut::from(&out[..]);
        let frame = parser.parse(&mut buf).unwrap().unwrap();
        assert!(frame.is_empty());
    }

    #[test]
    fn blocking_roundtrip() {
        let mut wire = Vec::new();
        send_frame(&mut wire, b"payload", 1024).unwrap();
        let mut cursor = std::io::Cursor::new(wire);
        let payload = read_frame(&mut cursor, 1024).unwrap();
        assert_eq!(payload, b"payload");
    }
}
