//! # File Transfer Codecs (34, 36)
//!
//! Server to device (Codec 34):
//!
//! ```text
//! chunk: [0x22][mode][0x01][u32 seq][u32 offset][u16 len][data]
//! end:   [0x22][mode][0x02][u32 seq][u32 total len][mode data]
//! ```
//!
//! `mode data` is the CRC16 of the whole image (u16) for full images and the
//! chunk count (u32) for delta transfers.
//!
//! Device to server (Codec 36):
//!
//! ```text
//! ack:   [0x24][stage][status][u32 seq]
//! ```

use super::frame::build_frame;
use super::protocol::*;
use super::reader::ByteReader;
use crate::error::{GatewayError, Result};

/// Largest chunk a single Codec 34 payload can carry
pub const MAX_CHUNK_SIZE: usize = u16::MAX as usize;

/// Encode one chunk of the source image as a complete frame
pub fn encode_chunk(mode: TransferMode, sequence: u32, offset: u32, data: &[u8]) -> Vec<u8> {
    debug_assert!(data.len() <= MAX_CHUNK_SIZE);

    let mut payload = Vec::with_capacity(13 + data.len());
    payload.push(CodecId::Codec34.id());
    payload.push(mode.as_byte());
    payload.push(TransferStage::Chunk.as_byte());
    payload.extend_from_slice(&sequence.to_be_bytes());
    payload.extend_from_slice(&offset.to_be_bytes());
    payload.extend_from_slice(&(data.len() as u16).to_be_bytes());
    payload.extend_from_slice(data);
    build_frame(&payload)
}

/// Encode the end-of-transfer marker as a complete frame
///
/// # Arguments
///
/// * `mode` - Transfer mode, selects the trailing mode data
/// * `sequence` - Sequence number following the last chunk
/// * `total_len` - Size of the transferred image
/// * `image_crc` - CRC16 of the whole image (full mode)
/// * `chunk_count` - Number of chunks sent (delta mode)
pub fn encode_end_marker(
    mode: TransferMode,
    sequence: u32,
    total_len: u32,
    image_crc: u16,
    chunk_count: u32,
) -> Vec<u8> {
    let mut payload = Vec::with_capacity(15);
    payload.push(CodecId::Codec34.id());
    payload.push(mode.as_byte());
    payload.push(TransferStage::End.as_byte());
    payload.extend_from_slice(&sequence.to_be_bytes());
    payload.extend_from_slice(&total_len.to_be_bytes());
    match mode {
        TransferMode::Full => payload.extend_from_slice(&image_crc.to_be_bytes()),
        TransferMode::Delta => payload.extend_from_slice(&chunk_count.to_be_bytes()),
    }
    build_frame(&payload)
}

/// Decode a Codec 36 acknowledgment data field
pub fn decode_transfer_ack(payload: &[u8]) -> Result<TransferAck> {
    let mut reader = ByteReader::new(payload);

    let codec = CodecId::try_from(reader.u8()?)?;
    if codec != CodecId::Codec36 {
        return Err(GatewayError::MalformedPayload(format!(
            "{} is not a transfer acknowledgment",
            codec.name()
        )));
    }

    let stage_byte = reader.u8()?;
    let stage = TransferStage::from_byte(stage_byte).ok_or_else(|| {
        GatewayError::MalformedPayload(format!("unknown transfer stage 0x{:02X}", stage_byte))
    })?;
    let status = reader.u8()?;
    let sequence = reader.u32()?;

    Ok(TransferAck {
        stage,
        status,
        sequence,
    })
}

/// Build a Codec 36 acknowledgment frame (device side, used by simulators and tests)
pub fn encode_transfer_ack(ack: &TransferAck) -> Vec<u8> {
    let mut payload = Vec::with_capacity(7);
    payload.push(CodecId::Codec36.id());
    payload.push(ack.stage.as_byte());
    payload.push(ack.status);
    payload.extend_from_slice(&ack.sequence.to_be_bytes());
    build_frame(&payload)
}
