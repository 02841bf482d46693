//! # Teltonika Gateway Library
//!
//! Receive telemetry from Teltonika GPS trackers and send them commands and files.
//!
//! This library provides the protocol codecs (AVL Codecs 8 and 8E, command Codecs
//! 12/13/14, file transfer Codecs 34/36), per-device session handling over TCP
//! or UDP, and the gateway facade used by the operator console.

pub mod codec;
pub mod config;
pub mod console;
pub mod error;
pub mod events;
pub mod imei;
pub mod logging;
pub mod registry;
pub mod server;
pub mod session;
pub mod telemetry;

pub use config::Config;
pub use error::{GatewayError, Result};
pub use imei::Imei;
pub use server::Gateway;
