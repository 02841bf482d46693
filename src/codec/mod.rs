//! # Teltonika Codec Module
//!
//! Wire protocol of Teltonika GPS trackers.
//!
//! This module handles:
//! - CRC-16/Modbus checksum calculation
//! - Binary frame envelope (preamble, length, CRC)
//! - AVL telemetry decoding (Codec 8, Codec 8 Extended)
//! - Text commands and responses (Codec 12, 13, 14)
//! - File transfer payloads and acknowledgments (Codec 34, 36)
//! - Routing inbound units to the matching decoder
//! - Splitting a TCP byte stream into inbound units

pub mod protocol;
pub mod crc;
pub mod frame;
pub mod avl;
pub mod command;
pub mod transfer;
pub mod dispatch;
pub mod stream;
pub(crate) mod reader;
