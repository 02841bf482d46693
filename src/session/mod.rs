//! # Device Session Module
//!
//! One task per connected device.
//!
//! This module handles:
//! - IMEI handshake and session lifecycle
//! - Telemetry acknowledgment
//! - FIFO correlation of command responses
//! - Chunked file transfer with retries
//! - Transport abstraction over TCP streams and UDP peers

pub mod commands;
pub mod device;
pub mod file_transfer;
pub mod link;

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};

use crate::codec::protocol::{CommandResponse, TransferMode};
use crate::error::{GatewayError, Result};
use crate::imei::Imei;

pub use device::{DeviceSession, SessionContext};
pub use link::DeviceLink;

/// Queued operator requests per session
pub const REQUEST_CHANNEL_CAPACITY: usize = 32;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl SessionId {
    pub fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    AwaitingHandshake,
    Authenticated,
    Closed,
}

/// Envelope used for an outbound text command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandCodec {
    /// Codec 12
    Plain,
    /// Codec 14, carries the device IMEI
    Addressed,
}

/// Operator request delivered to a session task
#[derive(Debug)]
pub enum SessionRequest {
    Command {
        text: String,
        codec: CommandCodec,
        responder: oneshot::Sender<Result<CommandResponse>>,
    },
    Transfer {
        data: Vec<u8>,
        mode: TransferMode,
        responder: oneshot::Sender<Result<()>>,
    },
}

/// Cloneable reference to a running, authenticated session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    imei: Imei,
    peer: SocketAddr,
    requests: mpsc::Sender<SessionRequest>,
    close: Arc<watch::Sender<Option<String>>>,
}

impl SessionHandle {
    pub(crate) fn new(
        id: SessionId,
        imei: Imei,
        peer: SocketAddr,
        requests: mpsc::Sender<SessionRequest>,
        close: Arc<watch::Sender<Option<String>>>,
    ) -> Self {
        Self {
            id,
            imei,
            peer,
            requests,
            close,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn imei(&self) -> Imei {
        self.imei
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Send a text command and wait for the correlated response
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - No response arrives within the response window (`CommandTimeout`)
    /// - The device refuses a Codec 14 command (`CommandRejected`)
    /// - The session ends first (`SessionClosed`)
    pub async fn send_command(&self, text: &str, codec: CommandCodec) -> Result<CommandResponse> {
        let (responder, response) = oneshot::channel();
        self.requests
            .send(SessionRequest::Command {
                text: text.to_string(),
                codec,
                responder,
            })
            .await
            .map_err(|_| GatewayError::SessionClosed)?;

        response.await.map_err(|_| GatewayError::SessionClosed)?
    }

    /// Upload an image and wait until the device acknowledged all of it
    pub async fn upload(&self, data: Vec<u8>, mode: TransferMode) -> Result<()> {
        let (responder, outcome) = oneshot::channel();
        self.requests
            .send(SessionRequest::Transfer { data, mode, responder })
            .await
            .map_err(|_| GatewayError::SessionClosed)?;

        outcome.await.map_err(|_| GatewayError::SessionClosed)?
    }

    /// Ask the session to close
    pub fn close(&self, reason: &str) {
        self.close.send_replace(Some(reason.to_string()));
    }

    pub fn is_closed(&self) -> bool {
        self.requests.is_closed()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Handle whose request side is observable by the test
    pub(crate) fn detached_handle(
        imei: Imei,
    ) -> (SessionHandle, mpsc::Receiver<SessionRequest>, watch::Receiver<Option<String>>) {
        let (tx, rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        let (close_tx, close_rx) = watch::channel(None);
        let handle = SessionHandle::new(
            SessionId::next(),
            imei,
            "127.0.0.1:5027".parse().unwrap(),
            tx,
            Arc::new(close_tx),
        );
        (handle, rx, close_rx)
    }

    #[test]
    fn test_session_ids_are_unique() {
        let a = SessionId::next();
        let b = SessionId::next();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn test_close_is_observable() {
        let imei = Imei::parse("356307042441013").unwrap();
        let (handle, _rx, close_rx) = detached_handle(imei);
        handle.close("kicked");
        assert_eq!(close_rx.borrow().as_deref(), Some("kicked"));
    }

    #[tokio::test]
    async fn test_send_command_after_session_ended() {
        let imei = Imei::parse("356307042441013").unwrap();
        let (handle, rx, _close_rx) = detached_handle(imei);
        drop(rx);

        assert!(handle.is_closed());
        assert!(matches!(
            handle.send_command("getver", CommandCodec::Plain).await,
            Err(GatewayError::SessionClosed)
        ));
    }
}
