//! # Frame Assembler
//!
//! Strips and attaches the `[preamble][length][data][crc]` envelope.
//!
//! ```text
//! 00 00 00 00 | 00 00 00 LL | <LL bytes of data> | 00 00 CC CC
//!   preamble     BE length        codec payload       CRC16(data)
//! ```

use super::crc::crc16;
use super::protocol::*;
use super::reader::ByteReader;
use crate::error::{GatewayError, Result};

/// Parse a complete binary frame
///
/// # Arguments
///
/// * `raw` - Frame bytes including preamble, length, data and CRC field
///
/// # Returns
///
/// * `Result<Frame>` - Validated frame
///
/// # Errors
///
/// Returns error if:
/// - The preamble is non-zero (`InvalidPreamble`)
/// - The buffer is shorter than the length field announces (`Truncated`)
/// - Bytes follow the CRC field (`MalformedPayload`)
/// - The CRC field does not match the data (`CrcMismatch`)
pub fn parse_frame(raw: &[u8]) -> Result<Frame> {
    let mut reader = ByteReader::new(raw);

    let preamble = reader.u32()?;
    if preamble != 0 {
        return Err(GatewayError::InvalidPreamble(preamble));
    }

    let payload_length = reader.u32()?;
    let payload = reader.take(payload_length as usize)?.to_vec();
    let received = reader.u32()?;
    if reader.remaining() > 0 {
        return Err(GatewayError::MalformedPayload(format!(
            "{} bytes after the CRC field",
            reader.remaining()
        )));
    }

    let calculated = crc16(&payload);
    if received != calculated as u32 {
        return Err(GatewayError::CrcMismatch { received, calculated });
    }

    Ok(Frame {
        preamble_valid: true,
        payload_length,
        payload,
        checksum: calculated,
    })
}

/// Wrap a codec payload in the binary envelope
///
/// # Examples
///
/// ```
/// use teltonika_gateway::codec::frame::{build_frame, parse_frame};
///
/// let frame = build_frame(&[0x08, 0x00, 0x00]);
/// assert_eq!(parse_frame(&frame).unwrap().payload, vec![0x08, 0x00, 0x00]);
/// ```
pub fn build_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_OVERHEAD + payload.len());
    frame.extend_from_slice(&[0u8; PREAMBLE_SIZE]);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame.extend_from_slice(&(crc16(payload) as u32).to_be_bytes());
    frame
}

/// Raw input that is a `{...}` document rather than a binary frame
pub fn is_json_document(raw: &[u8]) -> bool {
    raw.first() == Some(&b'{') && raw.last() == Some(&b'}')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_frame_layout() {
        let frame = build_frame(&[0x0C, 0x01]);
        assert_eq!(&frame[0..4], &[0, 0, 0, 0]);
        assert_eq!(&frame[4..8], &[0, 0, 0, 2]);
        assert_eq!(&frame[8..10], &[0x0C, 0x01]);
        let crc = crc16(&[0x0C, 0x01]);
        assert_eq!(&frame[10..14], &(crc as u32).to_be_bytes());
    }

    #[test]
    fn test_round_trip() {
        let payload = b"\x08\x01some data\x01".to_vec();
        let frame = parse_frame(&build_frame(&payload)).unwrap();
        assert!(frame.preamble_valid);
        assert_eq!(frame.payload_length as usize, payload.len());
        assert_eq!(frame.payload, payload);
        assert_eq!(frame.checksum, crc16(&payload));
        assert_eq!(frame.codec_byte(), Some(0x08));
    }

    #[test]
    fn test_invalid_preamble() {
        let mut frame = build_frame(&[0x08, 0x00, 0x00]);
        frame[2] = 0x01;
        match parse_frame(&frame) {
            Err(GatewayError::InvalidPreamble(0x0000_0100)) => {}
            other => panic!("Expected InvalidPreamble, got: {:?}", other),
        }
    }

    #[test]
    fn test_flipped_payload_byte_is_crc_mismatch() {
        let mut frame = build_frame(&[0x0C, 0x01, 0x06, 0x00]);
        frame[10] ^= 0xFF;
        match parse_frame(&frame) {
            Err(GatewayError::CrcMismatch { .. }) => {}
            other => panic!("Expected CrcMismatch, got: {:?}", other),
        }
    }

    #[test]
    fn test_nonzero_crc_high_bytes_rejected() {
        let mut frame = build_frame(&[0x08, 0x00, 0x00]);
        let crc_start = frame.len() - CRC_FIELD_SIZE;
        frame[crc_start] = 0x01;
        assert!(matches!(parse_frame(&frame), Err(GatewayError::CrcMismatch { .. })));
    }

    #[test]
    fn test_truncated_frame() {
        let frame = build_frame(&[0x08, 0x01, 0x02, 0x03]);
        let result = parse_frame(&frame[..frame.len() - 3]);
        assert!(matches!(result, Err(GatewayError::Truncated { .. })));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut frame = build_frame(&[0x08, 0x00, 0x00]);
        frame.extend_from_slice(&[0xAA, 0xBB]);
        match parse_frame(&frame) {
            Err(GatewayError::MalformedPayload(message)) => assert!(message.contains("2 bytes")),
            other => panic!("Expected MalformedPayload, got: {:?}", other),
        }
    }

    #[test]
    fn test_json_detection() {
        assert!(is_json_document(br#"{"imei":"1"}"#));
        assert!(!is_json_document(b"{unterminated"));
        assert!(!is_json_document(&build_frame(&[0x08])));
    }
}
