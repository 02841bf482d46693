//! # Gateway Server
//!
//! Owns configuration, the device registry and the event bus, runs the
//! listener, and exposes the operator operations.

pub mod listener;

use std::sync::Arc;

use tracing::info;

use crate::codec::protocol::{CommandResponse, TransferMode};
use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::events::EventBus;
use crate::imei::Imei;
use crate::registry::{DeviceDirectory, DeviceRegistry, DeviceSnapshot, MemoryDirectory};
use crate::session::{CommandCodec, SessionContext, SessionHandle};

pub use listener::Listener;

/// Gateway facade
#[derive(Clone)]
pub struct Gateway {
    ctx: SessionContext,
}

impl Gateway {
    /// Gateway backed by the given device directory
    pub fn new(config: Config, directory: Arc<dyn DeviceDirectory>) -> Self {
        Self {
            ctx: SessionContext {
                config: Arc::new(config),
                registry: Arc::new(DeviceRegistry::new(directory)),
                events: EventBus::default(),
            },
        }
    }

    /// Gateway with an in-memory directory seeded from `[devices.names]`
    pub fn from_config(config: Config) -> Self {
        let directory = Arc::new(MemoryDirectory::from_names(&config.devices.names));
        Self::new(config, directory)
    }

    pub fn config(&self) -> &Config {
        &self.ctx.config
    }

    pub fn events(&self) -> &EventBus {
        &self.ctx.events
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.ctx.registry
    }

    /// Bind the configured listener
    pub async fn bind(&self) -> Result<Listener> {
        Listener::bind(&self.ctx.config.server).await
    }

    /// Accept devices on an already bound listener
    pub async fn serve(&self, listener: Listener) -> Result<()> {
        listener.serve(self.ctx.clone()).await
    }

    /// Bind and serve
    pub async fn run(&self) -> Result<()> {
        let listener = self.bind().await?;
        info!(
            "Gateway listening on {} ({:?})",
            listener.local_addr()?,
            self.ctx.config.server.protocol
        );
        self.serve(listener).await
    }

    fn session(&self, imei: &Imei) -> Result<SessionHandle> {
        self.ctx
            .registry
            .handle(imei)
            .ok_or_else(|| GatewayError::DeviceNotConnected(imei.to_string()))
    }

    /// Send a Codec 12 command and wait for the device's answer
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - The device has no live session (`DeviceNotConnected`)
    /// - No response arrives in time (`CommandTimeout`)
    /// - The session closes first (`SessionClosed`)
    pub async fn send_command(&self, imei: &Imei, text: &str) -> Result<CommandResponse> {
        self.session(imei)?.send_command(text, CommandCodec::Plain).await
    }

    /// Send a Codec 14 command carrying the device IMEI
    pub async fn send_command_to_imei(&self, imei: &Imei, text: &str) -> Result<CommandResponse> {
        self.session(imei)?.send_command(text, CommandCodec::Addressed).await
    }

    /// Upload an image; `mode` defaults to the configured transfer mode
    pub async fn upload(&self, imei: &Imei, data: Vec<u8>, mode: Option<TransferMode>) -> Result<()> {
        let mode = mode.unwrap_or(self.ctx.config.file_transfer.mode);
        self.session(imei)?.upload(data, mode).await
    }

    /// Disconnect a device
    pub fn kick(&self, imei: &Imei) -> Result<()> {
        let session = self.session(imei)?;
        info!("Kicking device {} (session {})", imei, session.id());
        session.close("kicked by operator");
        Ok(())
    }

    pub fn devices(&self) -> Vec<DeviceSnapshot> {
        self.ctx.registry.snapshot()
    }
}
