//! # Device Session
//!
//! `AwaitingHandshake -> Authenticated -> Closed`, driven by a single task
//! that multiplexes inbound units, operator requests, a close signal and
//! the earliest pending deadline.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

use super::commands::{CommandQueue, Resolution};
use super::file_transfer::{FileTransferJob, TransferStep};
use super::link::DeviceLink;
use super::{CommandCodec, SessionHandle, SessionId, SessionRequest, SessionState, REQUEST_CHANNEL_CAPACITY};
use crate::codec::command::{encode_codec12_command, encode_codec14_command};
use crate::codec::dispatch::{decode_packet, DecodedPacket};
use crate::codec::protocol::{TransferAck, IMEI_ACCEPTED, IMEI_REJECTED};
use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::events::{EventBus, GatewayEvent};
use crate::imei::Imei;
use crate::registry::DeviceRegistry;

/// Shared collaborators of every session
#[derive(Clone)]
pub struct SessionContext {
    pub config: Arc<Config>,
    pub registry: Arc<DeviceRegistry>,
    pub events: EventBus,
}

struct ActiveTransfer {
    job: FileTransferJob,
    deadline: Instant,
    responder: oneshot::Sender<Result<()>>,
}

/// What woke the session loop
enum Wake {
    Inbound(Option<Result<Bytes>>),
    Request(SessionRequest),
    Close(String),
    Deadline,
}

/// Per-connection state machine
pub struct DeviceSession<L> {
    id: SessionId,
    link: L,
    ctx: SessionContext,
    state: SessionState,
    imei: Option<Imei>,
    requests_tx: mpsc::Sender<SessionRequest>,
    requests_rx: mpsc::Receiver<SessionRequest>,
    close_tx: Arc<watch::Sender<Option<String>>>,
    close_rx: watch::Receiver<Option<String>>,
    commands: CommandQueue,
    transfer: Option<ActiveTransfer>,
    idle_deadline: Instant,
}

impl<L: DeviceLink> DeviceSession<L> {
    pub fn new(link: L, ctx: SessionContext) -> Self {
        let (requests_tx, requests_rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        let (close_tx, close_rx) = watch::channel(None);
        let commands = CommandQueue::new(ctx.config.command.response_timeout());
        let idle_deadline = Instant::now() + ctx.config.session.idle_timeout();

        Self {
            id: SessionId::next(),
            link,
            ctx,
            state: SessionState::AwaitingHandshake,
            imei: None,
            requests_tx,
            requests_rx,
            close_tx: Arc::new(close_tx),
            close_rx,
            commands,
            transfer: None,
            idle_deadline,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drive the session until it closes
    pub async fn run(mut self) {
        let peer = self.link.peer();
        self.ctx.events.emit(GatewayEvent::Connected { session_id: self.id, peer });
        debug!("Session {} accepted from {}", self.id, peer);

        let reason = match self.handshake().await {
            Ok(()) => self.serve().await,
            Err(reason) => reason,
        };

        self.close(reason);
    }

    /// Read and answer the IMEI unit
    async fn handshake(&mut self) -> std::result::Result<(), String> {
        let peer = self.link.peer();
        let unit = match timeout(self.ctx.config.session.handshake_timeout(), self.link.recv()).await {
            Err(_) => return Err("handshake timeout".to_string()),
            Ok(None) => return Err("connection closed before handshake".to_string()),
            Ok(Some(Err(e))) => return Err(format!("transport error: {}", e)),
            Ok(Some(Ok(unit))) => unit,
        };

        let imei = match Imei::from_handshake(&unit) {
            Ok(imei) => imei,
            Err(e) => {
                warn!("Rejected handshake from {}: {}", peer, e);
                let _ = self.link.send(&[IMEI_REJECTED]).await;
                self.ctx.events.emit(GatewayEvent::HandshakeRejected {
                    session_id: self.id,
                    peer,
                    reason: e.to_string(),
                });
                return Err(e.to_string());
            }
        };

        if let Some(delay) = self.ctx.config.debug.imei_ack_delay() {
            debug!("Delaying IMEI acknowledgment for {} by {:?}", imei, delay);
            sleep(delay).await;
        }

        self.link
            .send(&[IMEI_ACCEPTED])
            .await
            .map_err(|e| format!("transport error: {}", e))?;

        self.imei = Some(imei);
        self.state = SessionState::Authenticated;
        self.idle_deadline = Instant::now() + self.ctx.config.session.idle_timeout();

        let handle = SessionHandle::new(
            self.id,
            imei,
            peer,
            self.requests_tx.clone(),
            Arc::clone(&self.close_tx),
        );
        if let Some(previous) = self.ctx.registry.register(handle) {
            previous.close("replaced by a new connection");
        }

        info!("Device {} authenticated from {} (session {})", imei, peer, self.id);
        self.ctx.events.emit(GatewayEvent::Authenticated {
            session_id: self.id,
            imei,
            peer,
        });
        Ok(())
    }

    /// Authenticated loop; returns the close reason
    async fn serve(&mut self) -> String {
        loop {
            let deadline = self.next_deadline();

            let wake = tokio::select! {
                unit = self.link.recv() => Wake::Inbound(unit),
                Some(request) = self.requests_rx.recv() => Wake::Request(request),
                _ = self.close_rx.changed() => Wake::Close(self.close_reason()),
                _ = sleep_until(deadline) => Wake::Deadline,
            };

            let outcome = match wake {
                Wake::Inbound(None) => return "connection closed by peer".to_string(),
                Wake::Inbound(Some(Err(e))) => return format!("transport error: {}", e),
                Wake::Inbound(Some(Ok(unit))) => self.handle_unit(unit).await,
                Wake::Request(request) => self.handle_request(request).await,
                Wake::Close(reason) => return reason,
                Wake::Deadline => self.handle_deadlines().await,
            };

            if let Err(reason) = outcome {
                return reason;
            }
        }
    }

    fn close_reason(&self) -> String {
        self.close_rx
            .borrow()
            .clone()
            .unwrap_or_else(|| "closed".to_string())
    }

    fn next_deadline(&self) -> Instant {
        [
            Some(self.idle_deadline),
            self.commands.next_deadline(),
            self.transfer.as_ref().map(|t| t.deadline),
        ]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or(self.idle_deadline)
    }

    fn imei(&self) -> std::result::Result<Imei, String> {
        self.imei.ok_or_else(|| "session not authenticated".to_string())
    }

    async fn write(&mut self, data: &[u8]) -> std::result::Result<(), String> {
        self.link
            .send(data)
            .await
            .map_err(|e| format!("transport error: {}", e))
    }

    async fn handle_unit(&mut self, unit: Bytes) -> std::result::Result<(), String> {
        let imei = self.imei()?;
        self.idle_deadline = Instant::now() + self.ctx.config.session.idle_timeout();
        self.ctx.registry.touch(&imei);

        let packet = decode_packet(&unit);
        let label = packet.label();
        debug!("{} from {}: {} bytes", label, imei, unit.len());

        match &packet {
            DecodedPacket::Telemetry(data) => {
                if !data.counts_match() {
                    warn!(
                        "{} record count mismatch from {}: {} vs {}",
                        label, imei, data.record_count, data.trailing_record_count
                    );
                }
            }
            DecodedPacket::Command(response) => match self.commands.resolve_oldest(response.clone()) {
                Some(resolution) => self.emit_resolution(imei, resolution),
                None => debug!("Unsolicited {} from {}: {:?}", label, imei, response.text),
            },
            DecodedPacket::TransferAck(ack) => self.handle_transfer_ack(imei, *ack).await?,
            DecodedPacket::ParsingError { error, .. } => {
                warn!("Undecodable unit from {}: {}", imei, error);
            }
            _ => {}
        }

        let record_count = packet.record_count();
        self.ctx.events.emit(GatewayEvent::Packet {
            imei,
            received_at: Utc::now(),
            label,
            packet,
        });

        if let Some(count) = record_count {
            if let Some(delay) = self.ctx.config.debug.record_ack_delay() {
                debug!("Delaying record acknowledgment for {} by {:?}", imei, delay);
                sleep(delay).await;
            }
            self.write(&(count as u32).to_be_bytes()).await?;
        }

        Ok(())
    }

    async fn handle_request(&mut self, request: SessionRequest) -> std::result::Result<(), String> {
        let imei = self.imei()?;

        match request {
            SessionRequest::Command { text, codec, responder } => {
                let frame = match codec {
                    CommandCodec::Plain => encode_codec12_command(&text),
                    CommandCodec::Addressed => encode_codec14_command(&imei, &text),
                };

                if let Err(reason) = self.write(&frame).await {
                    let _ = responder.send(Err(GatewayError::SessionClosed));
                    return Err(reason);
                }

                info!("Sent command {:?} to {}", text, imei);
                self.ctx.events.emit(GatewayEvent::CommandSent {
                    imei,
                    command: text.clone(),
                });
                self.commands.push(text, Instant::now(), responder);
            }
            SessionRequest::Transfer { data, mode, responder } => {
                if self.transfer.is_some() {
                    let _ = responder.send(Err(GatewayError::TransferInProgress));
                    return Ok(());
                }

                let settings = &self.ctx.config.file_transfer;
                let mut job = FileTransferJob::new(data, settings.chunk_size, mode, settings.max_retries);
                info!(
                    "Starting {:?} transfer of {} bytes to {} ({} chunks)",
                    job.mode(),
                    job.total_len(),
                    imei,
                    job.chunk_count()
                );

                let step = job.start();
                self.transfer = Some(ActiveTransfer {
                    job,
                    deadline: Instant::now(),
                    responder,
                });
                self.apply_transfer_step(imei, step).await?;
            }
        }

        Ok(())
    }

    async fn handle_transfer_ack(&mut self, imei: Imei, ack: TransferAck) -> std::result::Result<(), String> {
        let Some(active) = self.transfer.as_mut() else {
            debug!("Transfer acknowledgment from {} with no active transfer", imei);
            return Ok(());
        };

        if !ack.is_ok() {
            warn!("Device {} refused transfer payload {} (status {})", imei, ack.sequence, ack.status);
        }

        let step = active.job.on_ack(&ack);
        self.apply_transfer_step(imei, step).await
    }

    async fn apply_transfer_step(&mut self, imei: Imei, step: TransferStep) -> std::result::Result<(), String> {
        match step {
            TransferStep::Send(frame) => {
                self.write(&frame).await?;
                if let Some(active) = self.transfer.as_mut() {
                    active.deadline = Instant::now() + self.ctx.config.file_transfer.ack_timeout();
                    self.ctx.events.emit(GatewayEvent::TransferProgress {
                        imei,
                        bytes_acked: active.job.bytes_acked(),
                        total: active.job.total_len(),
                    });
                }
            }
            TransferStep::Wait => debug!("Ignoring stale transfer acknowledgment from {}", imei),
            TransferStep::Completed => {
                if let Some(active) = self.transfer.take() {
                    info!("Transfer of {} bytes to {} completed", active.job.total_len(), imei);
                    self.ctx.events.emit(GatewayEvent::TransferFinished {
                        imei,
                        success: true,
                        error: None,
                    });
                    let _ = active.responder.send(Ok(()));
                }
            }
            TransferStep::Failed(error) => {
                if let Some(active) = self.transfer.take() {
                    warn!("Transfer to {} failed: {}", imei, error);
                    self.ctx.events.emit(GatewayEvent::TransferFinished {
                        imei,
                        success: false,
                        error: Some(error.to_string()),
                    });
                    let _ = active.responder.send(Err(error));
                }
            }
        }

        Ok(())
    }

    async fn handle_deadlines(&mut self) -> std::result::Result<(), String> {
        let now = Instant::now();
        let imei = self.imei()?;

        if now >= self.idle_deadline {
            info!("Device {} idle for {:?}", imei, self.ctx.config.session.idle_timeout());
            return Err("idle timeout".to_string());
        }

        for resolution in self.commands.expire(now) {
            self.emit_resolution(imei, resolution);
        }

        let transfer_due = self.transfer.as_ref().map_or(false, |t| now >= t.deadline);
        if transfer_due {
            if let Some(active) = self.transfer.as_mut() {
                debug!("Transfer acknowledgment from {} timed out", imei);
                let step = active.job.on_timeout();
                self.apply_transfer_step(imei, step).await?;
            }
        }

        Ok(())
    }

    fn emit_resolution(&self, imei: Imei, resolution: Resolution) {
        let event = match resolution {
            Resolution::Completed { command, response } => {
                info!("Device {} answered {:?}: {:?}", imei, command, response);
                GatewayEvent::CommandCompleted { imei, command, response }
            }
            Resolution::Failed { command, error } => {
                warn!("Command {:?} to {} failed: {}", command, imei, error);
                GatewayEvent::CommandFailed { imei, command, error }
            }
        };
        self.ctx.events.emit(event);
    }

    /// Fail everything in flight and release the registry entry
    fn close(mut self, reason: String) {
        self.state = SessionState::Closed;

        if let Some(imei) = self.imei {
            for resolution in self.commands.fail_all() {
                self.emit_resolution(imei, resolution);
            }

            if let Some(mut active) = self.transfer.take() {
                active.job.fail();
                self.ctx.events.emit(GatewayEvent::TransferFinished {
                    imei,
                    success: false,
                    error: Some(GatewayError::SessionClosed.to_string()),
                });
                let _ = active.responder.send(Err(GatewayError::SessionClosed));
            }

            self.ctx.registry.mark_offline(&imei, self.id);
            info!("Device {} disconnected: {}", imei, reason);
        } else {
            debug!("Session {} closed before authentication: {}", self.id, reason);
        }

        // Requests queued after the loop stopped observe SessionClosed
        self.requests_rx.close();
        while let Ok(request) = self.requests_rx.try_recv() {
            match request {
                SessionRequest::Command { responder, .. } => {
                    let _ = responder.send(Err(GatewayError::SessionClosed));
                }
                SessionRequest::Transfer { responder, .. } => {
                    let _ = responder.send(Err(GatewayError::SessionClosed));
                }
            }
        }

        self.ctx.events.emit(GatewayEvent::Disconnected {
            session_id: self.id,
            imei: self.imei,
            reason,
        });
    }
}
