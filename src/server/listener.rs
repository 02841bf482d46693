//! Connection listener: TCP accept loop and UDP per-peer routing

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn};

use crate::codec::protocol::FRAME_OVERHEAD;
use crate::config::{Protocol, ServerConfig};
use crate::error::Result;
use crate::session::link::{DatagramLink, StreamLink};
use crate::session::{DeviceSession, SessionContext};

/// Datagrams buffered per UDP peer before new ones are dropped
const DATAGRAM_QUEUE_SIZE: usize = 64;

/// Back-off after a failed accept
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Bound transport socket
pub enum Listener {
    Tcp(TcpListener),
    Udp(Arc<UdpSocket>),
}

impl Listener {
    /// Bind the configured protocol on `host:port`
    pub async fn bind(config: &ServerConfig) -> Result<Self> {
        let addr = config.bind_addr();
        let listener = match config.protocol {
            Protocol::Tcp => Self::Tcp(TcpListener::bind(&addr).await?),
            Protocol::Udp => Self::Udp(Arc::new(UdpSocket::bind(&addr).await?)),
        };
        Ok(listener)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        let addr = match self {
            Self::Tcp(listener) => listener.local_addr()?,
            Self::Udp(socket) => socket.local_addr()?,
        };
        Ok(addr)
    }

    /// Run until the socket fails; one session task per peer
    pub async fn serve(self, ctx: SessionContext) -> Result<()> {
        match self {
            Self::Tcp(listener) => serve_tcp(listener, ctx).await,
            Self::Udp(socket) => serve_udp(socket, ctx).await,
        }
    }
}

async fn serve_tcp(listener: TcpListener, ctx: SessionContext) -> Result<()> {
    info!("Listening for TCP devices on {}", listener.local_addr()?);
    let max_frame_size = ctx.config.server.max_frame_size;

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Failed to accept connection: {}", e);
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                continue;
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY for {}: {}", peer, e);
        }

        let link = StreamLink::new(stream, peer, max_frame_size);
        tokio::spawn(DeviceSession::new(link, ctx.clone()).run());
    }
}

async fn serve_udp(socket: Arc<UdpSocket>, ctx: SessionContext) -> Result<()> {
    info!("Listening for UDP devices on {}", socket.local_addr()?);

    let mut peers: HashMap<SocketAddr, mpsc::Sender<Bytes>> = HashMap::new();
    let mut buf = vec![0u8; ctx.config.server.max_frame_size + FRAME_OVERHEAD];

    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                // ICMP errors from earlier replies surface here
                warn!("UDP receive failed: {}", e);
                continue;
            }
        };

        let unit = Bytes::copy_from_slice(&buf[..len]);
        route_datagram(&mut peers, peer, unit, &socket, &ctx);
    }
}

/// Hand a datagram to its peer's session, starting one if needed
fn route_datagram(
    peers: &mut HashMap<SocketAddr, mpsc::Sender<Bytes>>,
    peer: SocketAddr,
    unit: Bytes,
    socket: &Arc<UdpSocket>,
    ctx: &SessionContext,
) {
    let unit = match peers.get(&peer) {
        Some(tx) => match tx.try_send(unit) {
            Ok(()) => return,
            Err(TrySendError::Full(_)) => {
                warn!("Session for {} is backlogged, dropping datagram", peer);
                return;
            }
            Err(TrySendError::Closed(unit)) => unit,
        },
        None => unit,
    };

    // Session for this peer ended (or never existed)
    peers.retain(|_, tx| !tx.is_closed());

    let (tx, rx) = mpsc::channel(DATAGRAM_QUEUE_SIZE);
    let _ = tx.try_send(unit);
    peers.insert(peer, tx);

    let link = DatagramLink::new(rx, Arc::clone(socket), peer);
    tokio::spawn(DeviceSession::new(link, ctx.clone()).run());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::events::EventBus;
    use crate::imei::Imei;
    use crate::registry::{DeviceRegistry, MemoryDirectory};

    fn context(config: Config) -> SessionContext {
        SessionContext {
            config: Arc::new(config),
            registry: Arc::new(DeviceRegistry::new(Arc::new(MemoryDirectory::default()))),
            events: EventBus::default(),
        }
    }

    fn local_config(protocol: Protocol) -> ServerConfig {
        ServerConfig {
            protocol,
            host: "127.0.0.1".to_string(),
            port: 0,
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let tcp = Listener::bind(&local_config(Protocol::Tcp)).await.unwrap();
        assert!(matches!(tcp, Listener::Tcp(_)));
        assert_ne!(tcp.local_addr().unwrap().port(), 0);

        let udp = Listener::bind(&local_config(Protocol::Udp)).await.unwrap();
        assert!(matches!(udp, Listener::Udp(_)));
    }

    #[tokio::test]
    async fn test_udp_handshake() {
        let mut config = Config::default();
        config.server = local_config(Protocol::Udp);
        let ctx = context(config);

        let listener = Listener::bind(&ctx.config.server).await.unwrap();
        let server_addr = listener.local_addr().unwrap();
        tokio::spawn(listener.serve(ctx.clone()));

        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let imei = Imei::parse("356307042441013").unwrap();
        device.send_to(&imei.to_handshake(), server_addr).await.unwrap();

        let mut reply = [0u8; 8];
        let (len, from) = tokio::time::timeout(Duration::from_secs(5), device.recv_from(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&reply[..len], &[0x01]);
        assert_eq!(from, server_addr);
    }

    #[tokio::test]
    async fn test_route_datagram_restarts_ended_session() {
        let ctx = context(Config::default());
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let peer: SocketAddr = "127.0.0.1:40001".parse().unwrap();
        let mut peers = HashMap::new();

        // Stale entry whose session is gone
        let (stale_tx, stale_rx) = mpsc::channel(1);
        drop(stale_rx);
        peers.insert(peer, stale_tx);

        route_datagram(&mut peers, peer, Bytes::from_static(b"x"), &socket, &ctx);
        assert!(!peers[&peer].is_closed());
    }
}
