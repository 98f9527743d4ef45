
use std::net::SocketAddr;
use std::sync::Mutex as SyncMutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::Mutex;

use super::Conn;
use crate::error::{Error, Result};

/// Per-datagram hook installed on the sending side of a pipe endpoint.
/// Returning `None` drops the datagram, returning modified bytes delivers
/// those instead. This is how the tests model lossy and hostile links.
pub type SendFilter = Box<dyn FnMut(&[u8]) -> Option<Vec<u8>> + Send>;

/// In-memory datagram pipe. Both ends implement [`Conn`], so an initiator
/// and a responder can be wired back to back without any sockets.
pub struct PipeConn {
    addr: SocketAddr,
    peer_addr: SocketAddr,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    filter: SyncMutex<Option<SendFilter>>,
}

/// Creates the two connected endpoints of a pipe.
pub fn pipe() -> (PipeConn, PipeConn) {
    let a_addr: SocketAddr = "127.0.0.1:5001".parse().expect("static addr");
    let b_addr: SocketAddr = "127.0.0.1:5002".parse().expect("static addr");
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();

    let a = PipeConn {
        addr: a_addr,
        peer_addr: b_addr,
        tx: a_tx,
        rx: Mutex::new(a_rx),
        filter: SyncMutex::new(None),
    };
    let b = PipeConn {
        addr: b_addr,
        peer_addr: a_addr,
        tx: b_tx,
        rx: Mutex::new(b_rx),
        filter: SyncMutex::new(None),
    };
    (a, b)
}

impl PipeConn {
    /// Installs (or clears) the outbound filter for this endpoint.
    pub fn set_send_filter(&self, filter: Option<SendFilter>) {
        if let Ok(mut guard) = self.filter.lock() {
            *guard = filter;
        }
    }

    fn filtered(&self, buf: &[u8]) -> Option<Vec<u8>> {
        match self.filter.lock() {
            Ok(mut guard) => match guard.as_mut() {
                Some(f) => f(buf),
                None => Some(buf.to_vec()),
            },
            Err(_) => Some(buf.to_vec()),
        }
    }
}

#[async_trait]
impl Conn for PipeConn {
    async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let mut rx = self.rx.lock().await;
        let datagram = rx.recv().await.ok_or(Error::ErrClosed)?;
        let n = datagram.len().min(buf.len());
        buf[..n].copy_from_slice(&datagram[..n]);
        Ok(n)
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        let n = self.recv(buf).await?;
        Ok((n, self.peer_addr))
    }

    async fn send(&self, buf: &[u8]) -> Result<usize> {
        let len = buf.len();
        if let Some(datagram) = self.filtered(buf) {
            self.tx.send(datagram).map_err(|_| Error::ErrClosed)?;
        }
        // A dropped datagram still "left" this endpoint, exactly like a
        // datagram lost on the wire.
        Ok(len)
    }

    async fn send_to(&self, buf: &[u8], _target: SocketAddr) -> Result<usize> {
        self.send(buf).await
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.addr)
    }
}
