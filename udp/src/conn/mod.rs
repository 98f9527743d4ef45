pub mod conn_pipe;

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::UdpSocket;

use crate::error::Result;

/// Transport capability the engines drive. Exactly one engine owns a `Conn`;
/// send and receive are serialised through that engine.
///
/// The initiator uses the connected `recv`/`send` pair, the responder the
/// unconnected `recv_from`/`send_to` pair.
#[async_trait]
pub trait Conn: Send + Sync {
    async fn recv(&self, buf: &mut [u8]) -> Result<usize>;
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)>;
    async fn send(&self, buf: &[u8]) -> Result<usize>;
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize>;
    fn local_addr(&self) -> Result<SocketAddr>;
}

#[async_trait]
impl Conn for UdpSocket {
    async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        Ok(UdpSocket::recv(self, buf).await?)
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        Ok(UdpSocket::recv_from(self, buf).await?)
    }

    async fn send(&self, buf: &[u8]) -> Result<usize> {
        Ok(UdpSocket::send(self, buf).await?)
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize> {
        Ok(UdpSocket::send_to(self, buf, target).await?)
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(UdpSocket::local_addr(self)?)
    }
}
