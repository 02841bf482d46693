//! # Error Types
//!
//! Custom error types for the Teltonika gateway using `thiserror`.

use std::time::Duration;

use thiserror::Error;

/// Main error type for the gateway
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Frame did not start with the four zero preamble bytes
    #[error("Invalid preamble: 0x{0:08X}")]
    InvalidPreamble(u32),

    /// Trailing CRC field does not match the CRC16 of the payload
    #[error("CRC mismatch. Got 0x{received:08X}, calculated 0x{calculated:04X}")]
    CrcMismatch { received: u32, calculated: u16 },

    /// Buffer ended before the announced length
    #[error("Truncated input: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// Announced frame length exceeds the configured maximum
    #[error("Frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// Codec identifier outside the supported set
    #[error("Unknown codec 0x{0:02X}")]
    UnknownCodec(u8),

    /// Codec payload is structurally invalid
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// Handshake did not carry a valid 15-digit IMEI
    #[error("Malformed IMEI: {0}")]
    MalformedImei(String),

    /// Device did not answer a command within its correlation window
    #[error("Command timed out after {0:?}")]
    CommandTimeout(Duration),

    /// Device refused a Codec 14 command (IMEI mismatch)
    #[error("Command rejected by device: {0}")]
    CommandRejected(String),

    /// A chunk exhausted its retry budget
    #[error("File transfer failed at offset {offset} after {attempts} attempts")]
    FileTransferRetryExhausted { offset: usize, attempts: u32 },

    /// Session already runs a file transfer
    #[error("A file transfer is already in progress")]
    TransferInProgress,

    /// Session ended while the operation was pending
    #[error("Session closed")]
    SessionClosed,

    /// No authenticated session exists for the IMEI
    #[error("Device {0} is not connected")]
    DeviceNotConnected(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// JSON side-channel and event serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the gateway
pub type Result<T> = std::result::Result<T, GatewayError>;
