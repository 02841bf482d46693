//! # Teltonika Protocol Constants and Types
//!
//! Core definitions shared by the frame assembler and the codec routines.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{GatewayError, Result};
use crate::imei::Imei;

/// Length of the zero preamble opening every binary frame
pub const PREAMBLE_SIZE: usize = 4;

/// Length of the big-endian data field length
pub const LENGTH_FIELD_SIZE: usize = 4;

/// Length of the trailing CRC field (CRC16 in the low two bytes)
pub const CRC_FIELD_SIZE: usize = 4;

/// Envelope overhead: preamble + length + crc
pub const FRAME_OVERHEAD: usize = PREAMBLE_SIZE + LENGTH_FIELD_SIZE + CRC_FIELD_SIZE;

/// Default ceiling for a single frame payload
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// IMEI handshake acknowledgment: accepted
pub const IMEI_ACCEPTED: u8 = 0x01;

/// IMEI handshake acknowledgment: rejected
pub const IMEI_REJECTED: u8 = 0x00;

/// Command message type (server to device)
pub const MESSAGE_TYPE_COMMAND: u8 = 0x05;

/// Response message type (device to server)
pub const MESSAGE_TYPE_RESPONSE: u8 = 0x06;

/// Codec 14 negative acknowledgment (IMEI mismatch)
pub const MESSAGE_TYPE_NACK: u8 = 0x11;

/// AVL data codec identifiers and the command/transfer codecs
///
/// Adding a codec means adding a variant here and a decoder in
/// [`crate::codec::dispatch`].
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CodecId {
    /// Codec 8 AVL data (1-byte IO ids)
    Codec8 = 0x08,
    /// Codec 8 Extended AVL data (2-byte IO ids, variable-length IO)
    Codec8Extended = 0x8E,
    /// Codec 12 GPRS command / response
    Codec12 = 0x0C,
    /// Codec 13 timestamped device message
    Codec13 = 0x0D,
    /// Codec 14 IMEI-addressed command
    Codec14 = 0x0E,
    /// Codec 17 (decoding not fully implemented)
    Codec17 = 0x11,
    /// Codec 34 file transfer payload (server to device)
    Codec34 = 0x22,
    /// Codec 36 file transfer acknowledgment (device to server)
    Codec36 = 0x24,
}

impl CodecId {
    /// Try to convert a byte to a CodecId
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x08 => Some(Self::Codec8),
            0x8E => Some(Self::Codec8Extended),
            0x0C => Some(Self::Codec12),
            0x0D => Some(Self::Codec13),
            0x0E => Some(Self::Codec14),
            0x11 => Some(Self::Codec17),
            0x22 => Some(Self::Codec34),
            0x24 => Some(Self::Codec36),
            _ => None,
        }
    }

    /// Wire identifier
    pub fn id(self) -> u8 {
        self as u8
    }

    /// Human-readable codec name ("Codec 8 Extended", "Codec 12", ...)
    pub fn name(self) -> &'static str {
        match self {
            Self::Codec8 => "Codec 8",
            Self::Codec8Extended => "Codec 8 Extended",
            Self::Codec12 => "Codec 12",
            Self::Codec13 => "Codec 13",
            Self::Codec14 => "Codec 14",
            Self::Codec17 => "Codec 17",
            Self::Codec34 => "Codec 34",
            Self::Codec36 => "Codec 36",
        }
    }
}

impl TryFrom<u8> for CodecId {
    type Error = GatewayError;

    fn try_from(byte: u8) -> Result<Self> {
        Self::from_byte(byte).ok_or(GatewayError::UnknownCodec(byte))
    }
}

/// Validated binary frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Preamble was all zero
    pub preamble_valid: bool,

    /// Announced data field length
    pub payload_length: u32,

    /// Data field (codec id through trailing count)
    pub payload: Vec<u8>,

    /// CRC16 carried by the frame
    pub checksum: u16,
}

impl Frame {
    /// Codec identifier byte at payload offset 0
    pub fn codec_byte(&self) -> Option<u8> {
        self.payload.first().copied()
    }
}

/// Single IO element value
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum IoValue {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    /// Variable-length value (Codec 8 Extended NX group), hex encoded
    Bytes(#[serde(serialize_with = "serialize_hex")] Vec<u8>),
}

fn serialize_hex<S: serde::Serializer>(bytes: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&hex::encode(bytes))
}

/// IO element attached to an AVL record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IoElement {
    pub id: u16,
    pub value: IoValue,
}

/// One telemetry sample
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AvlRecord {
    /// Sample time (UTC, millisecond precision)
    pub timestamp: DateTime<Utc>,

    /// 0 = low, 1 = high, 2 = panic
    pub priority: u8,

    /// Longitude in degrees
    pub longitude: f64,

    /// Latitude in degrees
    pub latitude: f64,

    /// Altitude in meters above sea level
    pub altitude: i16,

    /// Heading in degrees from north
    pub angle: u16,

    /// Visible satellites
    pub satellites: u8,

    /// Ground speed in km/h
    pub speed: u16,

    /// IO id that triggered the record (0 for periodic records)
    pub event_io_id: u16,

    /// Total IO element count announced by the record
    pub io_element_count: u16,

    /// IO elements in wire order
    pub io_elements: Vec<IoElement>,
}

/// Decoded Codec 8 / 8 Extended data field
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AvlData {
    pub codec: CodecId,

    /// Leading record count (echoed back as the acknowledgment)
    pub record_count: u8,

    /// Trailing record count
    pub trailing_record_count: u8,

    pub records: Vec<AvlRecord>,
}

impl AvlData {
    /// Leading and trailing counts agree
    pub fn counts_match(&self) -> bool {
        self.record_count == self.trailing_record_count
    }
}

/// Direction marker of a command-codec message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Command,
    Response,
    /// Codec 14 nACK
    Rejected,
}

impl MessageKind {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            MESSAGE_TYPE_COMMAND => Some(Self::Command),
            MESSAGE_TYPE_RESPONSE => Some(Self::Response),
            MESSAGE_TYPE_NACK => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// Decoded Codec 12 / 13 / 14 message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandResponse {
    pub codec: CodecId,
    pub kind: MessageKind,

    /// Message text, invalid UTF-8 replaced
    pub text: String,

    /// Device time (Codec 13 only)
    pub timestamp: Option<DateTime<Utc>>,

    /// Addressed device (Codec 14 only)
    pub imei: Option<Imei>,
}

/// File transfer mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    /// Complete firmware image
    Full,
    /// Delta patch against the installed image
    Delta,
}

impl TransferMode {
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Full => 0x01,
            Self::Delta => 0x02,
        }
    }
}

/// What a file transfer payload or acknowledgment refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStage {
    Chunk,
    End,
}

impl TransferStage {
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Chunk => 0x01,
            Self::End => 0x02,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Chunk),
            0x02 => Some(Self::End),
            _ => None,
        }
    }
}

/// Decoded Codec 36 acknowledgment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransferAck {
    pub stage: TransferStage,

    /// 0x00 = accepted, anything else = rejected
    pub status: u8,

    pub sequence: u32,
}

impl TransferAck {
    pub fn is_ok(&self) -> bool {
        self.status == 0x00
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_constants() {
        assert_eq!(FRAME_OVERHEAD, 12);
        assert_eq!(IMEI_ACCEPTED, 0x01);
        assert_eq!(IMEI_REJECTED, 0x00);
    }

    #[test]
    fn test_codec_id_round_trip() {
        for byte in [0x08, 0x8E, 0x0C, 0x0D, 0x0E, 0x11, 0x22, 0x24] {
            let codec = CodecId::from_byte(byte).unwrap();
            assert_eq!(codec.id(), byte);
        }
        assert_eq!(CodecId::from_byte(0x10), None);
    }

    #[test]
    fn test_codec_id_try_from_unknown() {
        match CodecId::try_from(0x99) {
            Err(GatewayError::UnknownCodec(0x99)) => {}
            other => panic!("Expected UnknownCodec, got: {:?}", other),
        }
    }

    #[test]
    fn test_codec_names() {
        assert_eq!(CodecId::Codec8.name(), "Codec 8");
        assert_eq!(CodecId::Codec8Extended.name(), "Codec 8 Extended");
        assert_eq!(CodecId::Codec12.name(), "Codec 12");
    }

    #[test]
    fn test_transfer_ack_status() {
        let ack = TransferAck { stage: TransferStage::Chunk, status: 0, sequence: 3 };
        assert!(ack.is_ok());
        let nack = TransferAck { status: 2, ..ack };
        assert!(!nack.is_ok());
    }
}
