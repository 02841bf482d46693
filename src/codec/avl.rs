//! # Codec 8 / Codec 8 Extended Decoder
//!
//! AVL data field layout:
//!
//! ```text
//! [codec id][record count] [record]*count [record count]
//! ```
//!
//! Each record carries a GPS element followed by an IO element. Codec 8 uses
//! 1-byte IO ids and group counts; Codec 8 Extended widens both to 2 bytes and
//! appends a group of variable-length (NX) values.

use chrono::{TimeZone, Utc};
use tracing::warn;

use super::protocol::*;
use super::reader::ByteReader;
use crate::error::{GatewayError, Result};

/// Fixed IO group value widths, in wire order
const IO_GROUP_WIDTHS: [usize; 4] = [1, 2, 4, 8];

/// Coordinates are transmitted as degrees × 10^7
const COORDINATE_SCALE: f64 = 10_000_000.0;

/// Decode a Codec 8 or Codec 8 Extended data field
///
/// # Arguments
///
/// * `payload` - Frame data field starting with the codec id
///
/// # Returns
///
/// * `Result<AvlData>` - All announced records
///
/// # Errors
///
/// Returns error if the codec id is not an AVL codec or a record is truncated.
/// A trailing record count that differs from the leading one is logged and
/// the decoded records are still returned.
pub fn decode_avl(payload: &[u8]) -> Result<AvlData> {
    let mut reader = ByteReader::new(payload);

    let codec = CodecId::try_from(reader.u8()?)?;
    let extended = match codec {
        CodecId::Codec8 => false,
        CodecId::Codec8Extended => true,
        other => {
            return Err(GatewayError::MalformedPayload(format!(
                "{} is not an AVL codec",
                other.name()
            )))
        }
    };

    let record_count = reader.u8()?;
    let mut records = Vec::with_capacity(record_count as usize);
    for _ in 0..record_count {
        records.push(decode_record(&mut reader, extended)?);
    }

    let trailing_record_count = reader.u8()?;
    if trailing_record_count != record_count {
        warn!(
            "{} record count mismatch: leading {}, trailing {}",
            codec.name(),
            record_count,
            trailing_record_count
        );
    }

    Ok(AvlData {
        codec,
        record_count,
        trailing_record_count,
        records,
    })
}

fn decode_record(reader: &mut ByteReader<'_>, extended: bool) -> Result<AvlRecord> {
    let millis = reader.u64()?;
    let timestamp = Utc
        .timestamp_millis_opt(millis as i64)
        .single()
        .ok_or_else(|| GatewayError::MalformedPayload(format!("timestamp {} out of range", millis)))?;

    let priority = reader.u8()?;

    // GPS element
    let longitude = reader.i32()? as f64 / COORDINATE_SCALE;
    let latitude = reader.i32()? as f64 / COORDINATE_SCALE;
    let altitude = reader.i16()?;
    let angle = reader.u16()?;
    let satellites = reader.u8()?;
    let speed = reader.u16()?;

    // IO element
    let event_io_id = read_io_field(reader, extended)?;
    let io_element_count = read_io_field(reader, extended)?;

    let mut io_elements = Vec::with_capacity(io_element_count as usize);
    for width in IO_GROUP_WIDTHS {
        let group_len = read_io_field(reader, extended)?;
        for _ in 0..group_len {
            let id = read_io_field(reader, extended)?;
            let value = match width {
                1 => IoValue::U8(reader.u8()?),
                2 => IoValue::U16(reader.u16()?),
                4 => IoValue::U32(reader.u32()?),
                _ => IoValue::U64(reader.u64()?),
            };
            io_elements.push(IoElement { id, value });
        }
    }

    if extended {
        let group_len = reader.u16()?;
        for _ in 0..group_len {
            let id = reader.u16()?;
            let len = reader.u16()? as usize;
            let value = IoValue::Bytes(reader.take(len)?.to_vec());
            io_elements.push(IoElement { id, value });
        }
    }

    Ok(AvlRecord {
        timestamp,
        priority,
        longitude,
        latitude,
        altitude,
        angle,
        satellites,
        speed,
        event_io_id,
        io_element_count,
        io_elements,
    })
}

/// IO ids and group counts: 1 byte in Codec 8, 2 bytes in Codec 8 Extended
fn read_io_field(reader: &mut ByteReader<'_>, extended: bool) -> Result<u16> {
    if extended {
        reader.u16()
    } else {
        Ok(reader.u8()? as u16)
    }
}
