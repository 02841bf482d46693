//! # Codec Dispatcher
//!
//! Turns raw inbound bytes into a [`DecodedPacket`]. Never fails: every error
//! raised while parsing becomes [`DecodedPacket::ParsingError`].

use serde::Serialize;

use super::avl::decode_avl;
use super::command::decode_command_message;
use super::frame::{is_json_document, parse_frame};
use super::protocol::*;
use super::transfer::decode_transfer_ack;
use crate::error::{GatewayError, Result};

/// Decoder routine for one codec's data field
type DecodeFn = fn(&[u8]) -> Result<DecodedPacket>;

/// Normalized result of decoding one inbound unit
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecodedPacket {
    /// Codec 8 / 8 Extended AVL records
    Telemetry(AvlData),

    /// Codec 12 / 13 / 14 message
    Command(CommandResponse),

    /// Codec 36 file transfer acknowledgment
    TransferAck(TransferAck),

    /// Known codec whose decoding is incomplete; raw data field attached
    NotImplemented { codec: CodecId, raw: String },

    /// Codec without a decoder; raw data field attached
    Raw { codec_id: u8, raw: String },

    /// Auxiliary JSON side-channel document
    Json { data: serde_json::Value },

    /// Input that could not be parsed
    ParsingError { error: String, raw: String },
}

impl DecodedPacket {
    /// Display label ("Codec 8", "Codec 12 Response", "parsing_error", ...)
    pub fn label(&self) -> String {
        match self {
            Self::Telemetry(data) => data.codec.name().to_string(),
            Self::Command(message) => format!("{} Response", message.codec.name()),
            Self::TransferAck(_) => format!("{} Ack", CodecId::Codec36.name()),
            Self::NotImplemented { codec, .. } => format!("{} Response", codec.name()),
            Self::Raw { codec_id, .. } => format!("Codec {}", codec_id),
            Self::Json { .. } => "JSON".to_string(),
            Self::ParsingError { .. } => "parsing_error".to_string(),
        }
    }

    /// Telemetry that must be acknowledged with its record count
    pub fn record_count(&self) -> Option<u8> {
        match self {
            Self::Telemetry(data) => Some(data.record_count),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::ParsingError { .. })
    }
}

/// Decoder for each supported codec
fn decoder_for(codec: CodecId) -> DecodeFn {
    match codec {
        CodecId::Codec8 | CodecId::Codec8Extended => decode_telemetry,
        CodecId::Codec12 | CodecId::Codec13 | CodecId::Codec14 => decode_command,
        CodecId::Codec36 => decode_ack,
        CodecId::Codec17 => decode_codec17,
        // Server-to-device payloads carry nothing to decode on the way in
        CodecId::Codec34 => decode_raw,
    }
}

fn decode_telemetry(payload: &[u8]) -> Result<DecodedPacket> {
    decode_avl(payload).map(DecodedPacket::Telemetry)
}

fn decode_command(payload: &[u8]) -> Result<DecodedPacket> {
    decode_command_message(payload).map(DecodedPacket::Command)
}

fn decode_ack(payload: &[u8]) -> Result<DecodedPacket> {
    decode_transfer_ack(payload).map(DecodedPacket::TransferAck)
}

fn decode_codec17(payload: &[u8]) -> Result<DecodedPacket> {
    Ok(DecodedPacket::NotImplemented {
        codec: CodecId::Codec17,
        raw: hex::encode(payload),
    })
}

fn decode_raw(payload: &[u8]) -> Result<DecodedPacket> {
    Ok(DecodedPacket::Raw {
        codec_id: payload.first().copied().unwrap_or_default(),
        raw: hex::encode(payload),
    })
}

/// Decode one inbound unit
///
/// # Arguments
///
/// * `raw` - Binary frame or `{...}` JSON document
///
/// # Returns
///
/// * `DecodedPacket` - Tagged result; parsing failures become `ParsingError`
///
/// # Examples
///
/// ```
/// use teltonika_gateway::codec::command::encode_codec12_command;
/// use teltonika_gateway::codec::dispatch::decode_packet;
///
/// let decoded = decode_packet(&encode_codec12_command("getver"));
/// assert_eq!(decoded.label(), "Codec 12 Response");
/// ```
pub fn decode_packet(raw: &[u8]) -> DecodedPacket {
    try_decode(raw).unwrap_or_else(|e| DecodedPacket::ParsingError {
        error: e.to_string(),
        raw: hex::encode(raw),
    })
}

fn try_decode(raw: &[u8]) -> Result<DecodedPacket> {
    if is_json_document(raw) {
        // Fall through to the binary path when the braces were coincidental
        if let Ok(data) = serde_json::from_slice(raw) {
            return Ok(DecodedPacket::Json { data });
        }
    }

    let frame = parse_frame(raw)?;
    let codec_byte = frame
        .codec_byte()
        .ok_or_else(|| GatewayError::MalformedPayload("empty data field".to_string()))?;

    match CodecId::from_byte(codec_byte) {
        Some(codec) => decoder_for(codec)(&frame.payload),
        None => decode_raw(&frame.payload),
    }
}
