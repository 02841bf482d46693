//! Stream splitter for TCP connections.
//!
//! Cuts the byte stream into inbound units: the IMEI handshake unit, complete
//! binary frames, and `{...}` JSON documents. Bytes that start neither a frame
//! nor a document are handed on as an opaque unit, ending where the next frame
//! preamble or document could begin, so the dispatcher can report them.

use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;

use super::protocol::{DEFAULT_MAX_FRAME_SIZE, FRAME_OVERHEAD, PREAMBLE_SIZE};
use crate::error::GatewayError;
use crate::imei::{IMEI_BCD_SIZE, IMEI_DIGITS, IMEI_HANDSHAKE_SIZE};

/// Tokio codec splitting device traffic into units
#[derive(Debug)]
pub struct DeviceStreamCodec {
    expect_handshake: bool,
    max_frame_size: usize,
}

impl DeviceStreamCodec {
    /// Codec for a fresh connection (first unit is the handshake)
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            expect_handshake: true,
            max_frame_size,
        }
    }

    /// Next unit is the IMEI handshake
    pub fn expects_handshake(&self) -> bool {
        self.expect_handshake
    }

    fn decode_handshake(&mut self, src: &mut BytesMut) -> Option<Bytes> {
        if src.len() < 2 {
            return None;
        }

        let unit_len = if u16::from_be_bytes([src[0], src[1]]) as usize == IMEI_DIGITS {
            IMEI_HANDSHAKE_SIZE
        } else {
            IMEI_BCD_SIZE
        };

        if src.len() < unit_len {
            src.reserve(unit_len - src.len());
            return None;
        }

        self.expect_handshake = false;
        Some(src.split_to(unit_len).freeze())
    }

    fn decode_frame(&self, src: &mut BytesMut) -> Result<Option<Bytes>, GatewayError> {
        if src.len() < PREAMBLE_SIZE + 4 {
            return Ok(None);
        }

        let payload_len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if payload_len > self.max_frame_size {
            return Err(GatewayError::FrameTooLarge {
                size: payload_len,
                max: self.max_frame_size,
            });
        }

        let total_len = FRAME_OVERHEAD + payload_len;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        Ok(Some(src.split_to(total_len).freeze()))
    }

    fn decode_json(&self, src: &mut BytesMut) -> Result<Option<Bytes>, GatewayError> {
        match json_document_end(src) {
            Some(end) => Ok(Some(src.split_to(end).freeze())),
            None if src.len() > self.max_frame_size => Err(GatewayError::FrameTooLarge {
                size: src.len(),
                max: self.max_frame_size,
            }),
            None => Ok(None),
        }
    }
}

impl Default for DeviceStreamCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

/// Length of the leading noise: up to the next byte that could start a frame
/// preamble (including a zero run cut off by the end of the buffer) or a
/// JSON document
fn opaque_unit_end(buf: &[u8]) -> usize {
    (1..buf.len())
        .find(|&i| {
            buf[i] == b'{' || buf[i..].iter().take(PREAMBLE_SIZE).all(|&b| b == 0)
        })
        .unwrap_or(buf.len())
}

/// Length of the balanced `{...}` document at the start of `buf`
fn json_document_end(buf: &[u8]) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &byte) in buf.iter().enumerate() {
        if in_string {
            match byte {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match byte {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }

    None
}

impl Decoder for DeviceStreamCodec {
    type Item = Bytes;
    type Error = GatewayError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        if self.expect_handshake {
            return Ok(self.decode_handshake(src));
        }

        match src[0] {
            0x00 => {
                // Wait until the whole preamble is visible before judging it
                let zeros = src.iter().take(PREAMBLE_SIZE).take_while(|&&b| b == 0).count();
                if zeros == src.len().min(PREAMBLE_SIZE) && src.len() < PREAMBLE_SIZE {
                    return Ok(None);
                }
                if zeros == PREAMBLE_SIZE {
                    return self.decode_frame(src);
                }
                let end = opaque_unit_end(src);
                Ok(Some(src.split_to(end).freeze()))
            }
            b'{' => self.decode_json(src),
            _ => {
                let end = opaque_unit_end(src);
                Ok(Some(src.split_to(end).freeze()))
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(unit) => Ok(Some(unit)),
            // Leftover partial unit: surface it for error reporting
            None if !buf.is_empty() => Ok(Some(buf.split().freeze())),
            None => Ok(None),
        }
    }
}
