//! Transport abstraction between a session and its device

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;

use crate::codec::stream::DeviceStreamCodec;
use crate::error::Result;

/// Unit-oriented connection to one device
#[async_trait]
pub trait DeviceLink: Send {
    /// Next inbound unit; `None` once the peer is gone
    async fn recv(&mut self) -> Option<Result<Bytes>>;

    /// Write raw bytes to the device
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Remote address
    fn peer(&self) -> SocketAddr;
}

/// Byte stream (TCP) split into units by [`DeviceStreamCodec`]
pub struct StreamLink<S> {
    reader: FramedRead<ReadHalf<S>, DeviceStreamCodec>,
    writer: WriteHalf<S>,
    peer: SocketAddr,
}

impl<S: AsyncRead + AsyncWrite> StreamLink<S> {
    pub fn new(stream: S, peer: SocketAddr, max_frame_size: usize) -> Self {
        let (read_half, writer) = tokio::io::split(stream);
        Self {
            reader: FramedRead::new(read_half, DeviceStreamCodec::new(max_frame_size)),
            writer,
            peer,
        }
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Send + 'static> DeviceLink for StreamLink<S> {
    async fn recv(&mut self) -> Option<Result<Bytes>> {
        self.reader.next().await
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data).await?;
        self.writer.flush().await?;
        Ok(())
    }

    fn peer(&self) -> SocketAddr {
        self.peer
    }
}

/// One UDP peer: datagrams routed in by the listener, replies sent with `send_to`
pub struct DatagramLink {
    inbound: mpsc::Receiver<Bytes>,
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl DatagramLink {
    pub fn new(inbound: mpsc::Receiver<Bytes>, socket: Arc<UdpSocket>, peer: SocketAddr) -> Self {
        Self { inbound, socket, peer }
    }
}

#[async_trait]
impl DeviceLink for DatagramLink {
    async fn recv(&mut self) -> Option<Result<Bytes>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.socket.send_to(data, self.peer).await?;
        Ok(())
    }

    fn peer(&self) -> SocketAddr {
        self.peer
    }
}
