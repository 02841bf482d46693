//! # Command Codecs (12, 13, 14)
//!
//! Codec 12 data field:
//!
//! ```text
//! [0x0C][qty=1][type][u32 size][command text][qty=1]
//! ```
//!
//! `type` is 0x05 for server commands and 0x06 for device responses. Codec 13
//! inserts a 4-byte device timestamp (seconds) in front of the text, Codec 14
//! inserts the 8-byte BCD IMEI of the addressed device. Both are counted in
//! `size`.

use chrono::{TimeZone, Utc};
use tracing::warn;

use super::frame::build_frame;
use super::protocol::*;
use super::reader::ByteReader;
use crate::error::{GatewayError, Result};
use crate::imei::{Imei, IMEI_BCD_SIZE};

/// Encode a text command as a complete Codec 12 frame
///
/// # Examples
///
/// ```
/// use teltonika_gateway::codec::command::encode_codec12_command;
///
/// let frame = encode_codec12_command("getver");
/// assert_eq!(&frame[..4], &[0, 0, 0, 0]);
/// assert_eq!(frame[8], 0x0C);
/// ```
pub fn encode_codec12_command(command: &str) -> Vec<u8> {
    build_frame(&command_payload(CodecId::Codec12, &[], command.as_bytes()))
}

/// Encode a text command addressed to one IMEI as a complete Codec 14 frame
pub fn encode_codec14_command(imei: &Imei, command: &str) -> Vec<u8> {
    build_frame(&command_payload(CodecId::Codec14, &imei.to_bcd(), command.as_bytes()))
}

/// Data field shared by the command codecs: `prefix` is counted in the size
fn command_payload(codec: CodecId, prefix: &[u8], body: &[u8]) -> Vec<u8> {
    let size = (prefix.len() + body.len()) as u32;

    let mut payload = Vec::with_capacity(9 + prefix.len() + body.len());
    payload.push(codec.id());
    payload.push(1); // command quantity 1
    payload.push(MESSAGE_TYPE_COMMAND);
    payload.extend_from_slice(&size.to_be_bytes());
    payload.extend_from_slice(prefix);
    payload.extend_from_slice(body);
    payload.push(1); // command quantity 2
    payload
}

/// Decode a Codec 12, 13 or 14 data field
///
/// # Errors
///
/// Returns error if the codec is not a command codec, the message type is
/// unknown, or the announced size overruns the payload
pub fn decode_command_message(payload: &[u8]) -> Result<CommandResponse> {
    let mut reader = ByteReader::new(payload);

    let codec = CodecId::try_from(reader.u8()?)?;
    if !matches!(codec, CodecId::Codec12 | CodecId::Codec13 | CodecId::Codec14) {
        return Err(GatewayError::MalformedPayload(format!(
            "{} is not a command codec",
            codec.name()
        )));
    }

    let quantity = reader.u8()?;
    let type_byte = reader.u8()?;
    let kind = MessageKind::from_byte(type_byte).ok_or_else(|| {
        GatewayError::MalformedPayload(format!("unknown message type 0x{:02X}", type_byte))
    })?;

    let size = reader.u32()? as usize;
    let body = reader.take(size)?;
    let trailing_quantity = reader.u8()?;
    if trailing_quantity != quantity {
        warn!(
            "{} quantity mismatch: leading {}, trailing {}",
            codec.name(),
            quantity,
            trailing_quantity
        );
    }

    let mut body_reader = ByteReader::new(body);
    let mut timestamp = None;
    let mut imei = None;

    match codec {
        CodecId::Codec13 => {
            let seconds = body_reader.u32()?;
            timestamp = Utc.timestamp_opt(seconds as i64, 0).single();
        }
        CodecId::Codec14 => {
            imei = Some(Imei::from_bcd(body_reader.take(IMEI_BCD_SIZE)?)?);
        }
        _ => {}
    }

    let text = String::from_utf8_lossy(&body[body_reader.position()..]).into_owned();

    Ok(CommandResponse {
        codec,
        kind,
        text,
        timestamp,
        imei,
    })
}
