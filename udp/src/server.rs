
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use wire::codec::Codec;
use wire::header::*;
use wire::packet::*;

use crate::chunker::{chunk_response, ChunkedResponse, ChunkerConfig};
use crate::conn::Conn;
use crate::error::{Error, Result};
use crate::util::unix_now;

/// Outcome taxonomy of the origin-side HTTP fetch, mapped onto wire error
/// codes by the responder.
#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone)]
#[non_exhaustive]
pub enum FetcherError {
    #[error("invalid url")]
    InvalidUrl,
    #[error("body exceeds the configured cap")]
    BodyTooLarge,
    #[error("upstream timed out")]
    UpstreamTimeout,
    #[error("upstream failure: {0}")]
    Upstream(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl FetcherError {
    /// `(error_code, http_status)` pair carried by the Error datagram.
    fn wire_code(&self) -> (u8, u16) {
        match self {
            FetcherError::InvalidUrl => (ERR_CODE_INVALID_URL, 400),
            FetcherError::BodyTooLarge => (ERR_CODE_BODY_TOO_LARGE, 502),
            FetcherError::UpstreamTimeout => (ERR_CODE_UPSTREAM_TIMEOUT, 504),
            FetcherError::Upstream(_) => (ERR_CODE_UPSTREAM_FAILURE, 502),
            FetcherError::Internal(_) => (ERR_CODE_INTERNAL, 500),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// The single runtime-polymorphic dependency of the responder: whatever
/// actually performs the outbound HTTP(S) request.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        method: Method,
        headers: &[(String, String)],
    ) -> std::result::Result<FetchedResponse, FetcherError>;
}

#[derive(Debug, Clone)]
pub struct ServerPolicy {
    /// Reject plaintext requests with `Error(0x40, 400)`.
    pub require_encryption: bool,
    /// How long sent chunks are retained for retransmit after the last send.
    pub resp_cache_ttl: Duration,
    pub mtu_budget: usize,
    pub parity_enabled: bool,
    pub head_duplication: usize,
    pub body_duplication: usize,
    /// Cap on datagrams replayed for one first-lost ACK.
    pub ack_replay_cap: usize,
    pub max_body_len: u32,
}

impl Default for ServerPolicy {
    fn default() -> Self {
        ServerPolicy {
            require_encryption: false,
            resp_cache_ttl: Duration::from_secs(5),
            mtu_budget: 1200,
            parity_enabled: false,
            head_duplication: 4,
            body_duplication: 1,
            ack_replay_cap: 64,
            max_body_len: 8 * 1024 * 1024,
        }
    }
}

enum CacheState {
    /// Chunked response retained for retransmit, bit-identical to the
    /// original emission.
    Streamed(ChunkedResponse),
    /// The single Error datagram emitted for this identifier, so a duplicate
    /// request never re-invokes the fetcher.
    Errored(Bytes),
}

struct CacheEntry {
    flags: Flags,
    peer: SocketAddr,
    state: CacheState,
    last_send: Instant,
}

/// Responder engine: demultiplexes inbound datagrams by request identifier,
/// fetches each URL exactly once per identifier within the retention window,
/// streams the chunked response, and answers NACK/ACK by replaying cached
/// datagrams.
pub struct AkariServer {
    name: String,
    psk: Vec<u8>,
    fetcher: Arc<dyn Fetcher>,
    policy: ServerPolicy,
    close_tx: Mutex<Option<mpsc::Sender<()>>>,
}

impl AkariServer {
    pub fn new(psk: &[u8], fetcher: Arc<dyn Fetcher>, policy: ServerPolicy) -> Self {
        AkariServer {
            name: "akari-server".to_owned(),
            psk: psk.to_vec(),
            fetcher,
            policy,
            close_tx: Mutex::new(None),
        }
    }

    /// Binds a UDP socket and runs until [`AkariServer::close`].
    pub async fn serve(&self, bind_host: &str, bind_port: u16) -> Result<()> {
        let socket = UdpSocket::bind((bind_host, bind_port)).await?;
        self.serve_conn(Arc::new(socket)).await
    }

    /// Runs the engine loop over an existing transport until closed. All
    /// per-request state lives inside this call and is torn down with it.
    pub async fn serve_conn(&self, conn: Arc<dyn Conn>) -> Result<()> {
        let (close_tx, mut close_rx) = mpsc::channel::<()>(1);
        self.close_tx.lock().await.replace(close_tx);

        let mut codec = Codec::new(&self.psk);
        let mut cache: HashMap<u64, CacheEntry> = HashMap::new();
        let mut sweep = tokio::time::interval(Duration::from_secs(1));
        let mut buf = vec![0u8; 2048];

        log::debug!("[{}] serve loop entered", self.name);
        loop {
            tokio::select! {
                biased;

                _ = close_rx.recv() => {
                    log::debug!("[{}] serve loop closed", self.name);
                    return Ok(());
                }

                res = conn.recv_from(&mut buf) => {
                    let (n, peer) = res?;
                    let raw = buf[..n].to_vec();
                    self.handle_datagram(&conn, &mut codec, &mut cache, &raw, peer).await?;
                }

                _ = sweep.tick() => {
                    let now = Instant::now();
                    let ttl = self.policy.resp_cache_ttl;
                    cache.retain(|id, entry| {
                        let keep = now.duration_since(entry.last_send) <= ttl;
                        if !keep {
                            log::trace!("[{}] id={id} cache expired", self.name);
                        }
                        keep
                    });
                }
            }
        }
    }

    /// Stops the serve loop. The response cache is discarded immediately and
    /// any in-flight re-emits are abandoned.
    pub async fn close(&self) {
        self.close_tx.lock().await.take();
    }

    async fn handle_datagram(
        &self,
        conn: &Arc<dyn Conn>,
        codec: &mut Codec,
        cache: &mut HashMap<u64, CacheEntry>,
        raw: &[u8],
        peer: SocketAddr,
    ) -> Result<()> {
        let pkt = match codec.decode(raw, unix_now()) {
            Ok(pkt) => pkt,
            Err(wire::Error::ErrUnknownVersion { version }) => {
                self.reply_unsupported_version(conn, codec, raw, peer, version)
                    .await?;
                return Ok(());
            }
            Err(e) => {
                log::trace!("[{}] dropped datagram from {peer}: {e}", self.name);
                return Ok(());
            }
        };

        let id = pkt.header.request_id;
        match &pkt.payload {
            Payload::Req(req) => {
                self.handle_req(conn, codec, cache, &pkt.header, req, peer)
                    .await
            }
            Payload::NackHead(nack) => {
                if let Some(entry) = Self::cached(cache, id, pkt.header.flags) {
                    if let CacheState::Streamed(chunks) = &entry.state {
                        let missing = nack.missing_sequences(chunks.head.len() as u16);
                        log::debug!("[{}] id={id} NACK-HEAD replay {missing:?}", self.name);
                        for seq in missing {
                            let datagram = chunks.head[usize::from(seq)].clone();
                            conn.send_to(&datagram, entry.peer).await?;
                        }
                        entry.last_send = Instant::now();
                    }
                }
                Ok(())
            }
            Payload::NackBody(nack) => {
                if let Some(entry) = Self::cached(cache, id, pkt.header.flags) {
                    if let CacheState::Streamed(chunks) = &entry.state {
                        let missing = nack.missing_sequences(chunks.body.len() as u16);
                        log::debug!("[{}] id={id} NACK-BODY replay {missing:?}", self.name);
                        for seq in missing {
                            let datagram = chunks.body[usize::from(seq)].clone();
                            conn.send_to(&datagram, entry.peer).await?;
                        }
                        entry.last_send = Instant::now();
                    }
                }
                Ok(())
            }
            Payload::Ack(ack) => {
                if ack.first_lost == ACK_ALL_RECEIVED {
                    return Ok(());
                }
                if let Some(entry) = Self::cached(cache, id, pkt.header.flags) {
                    if let CacheState::Streamed(chunks) = &entry.state {
                        let from = usize::from(ack.first_lost);
                        let cap = self.policy.ack_replay_cap;
                        log::debug!(
                            "[{}] id={id} ACK replay from seq {from}",
                            self.name
                        );
                        for datagram in chunks.body.iter().skip(from).take(cap) {
                            conn.send_to(datagram, entry.peer).await?;
                        }
                        entry.last_send = Instant::now();
                    }
                }
                Ok(())
            }
            Payload::Error(e) => {
                log::debug!(
                    "[{}] id={id} peer error {} ({}), discarding cache",
                    self.name,
                    e.error_code,
                    e.http_status
                );
                cache.remove(&id);
                Ok(())
            }
            // Response datagrams have no business arriving here.
            _ => Ok(()),
        }
    }

    fn cached(
        cache: &mut HashMap<u64, CacheEntry>,
        id: u64,
        flags: Flags,
    ) -> Option<&mut CacheEntry> {
        let entry = cache.get_mut(&id)?;
        // Inconsistent flags for a known identifier are malformed.
        if entry.flags.mode_bits() != flags.mode_bits() {
            return None;
        }
        Some(entry)
    }

    async fn handle_req(
        &self,
        conn: &Arc<dyn Conn>,
        codec: &mut Codec,
        cache: &mut HashMap<u64, CacheEntry>,
        header: &Header,
        req: &ReqPayload,
        peer: SocketAddr,
    ) -> Result<()> {
        let id = header.request_id;
        let flags = header.flags.without(FLAG_FINAL);

        if let Some(entry) = cache.get_mut(&id) {
            if entry.flags.mode_bits() != flags.mode_bits() {
                log::trace!("[{}] id={id} duplicate REQ with foreign flags", self.name);
                return Ok(());
            }
            // Duplicate request: re-emit the head, never refetch. The
            // initiator drives anything else through NACK/ACK.
            match &entry.state {
                CacheState::Streamed(chunks) => {
                    log::debug!("[{}] id={id} duplicate REQ, re-sending head", self.name);
                    for datagram in &chunks.head {
                        conn.send_to(datagram, entry.peer).await?;
                    }
                }
                CacheState::Errored(raw) => {
                    conn.send_to(raw, entry.peer).await?;
                }
            }
            entry.last_send = Instant::now();
            return Ok(());
        }

        if self.policy.require_encryption && !flags.encrypt() {
            log::debug!("[{}] id={id} unencrypted REQ refused", self.name);
            let raw = self
                .send_error(
                    conn,
                    codec,
                    header,
                    peer,
                    ERR_CODE_UNENCRYPTED_REFUSED,
                    400,
                    "encryption required",
                )
                .await?;
            cache.insert(
                id,
                CacheEntry {
                    flags,
                    peer,
                    state: CacheState::Errored(raw),
                    last_send: Instant::now(),
                },
            );
            return Ok(());
        }

        log::debug!(
            "[{}] id={id} REQ {} {} ({} headers)",
            self.name,
            req.method,
            req.url,
            req.headers.len()
        );
        let fetched = self.fetcher.fetch(&req.url, req.method, &req.headers).await;

        let fetch_error = match fetched {
            Ok(resp) if resp.body.len() > self.policy.max_body_len as usize => {
                Some(FetcherError::BodyTooLarge)
            }
            Ok(resp) => {
                match self.stream_response(conn, codec, header, peer, &resp).await {
                    Ok(chunks) => {
                        cache.insert(
                            id,
                            CacheEntry {
                                flags,
                                peer,
                                state: CacheState::Streamed(chunks),
                                last_send: Instant::now(),
                            },
                        );
                        return Ok(());
                    }
                    Err(Error::ErrBodyTooLarge) => Some(FetcherError::BodyTooLarge),
                    Err(Error::Io(e)) => return Err(Error::Io(e)),
                    Err(e) => {
                        log::warn!("[{}] id={id} failed to chunk response: {e}", self.name);
                        Some(FetcherError::Internal(e.to_string()))
                    }
                }
            }
            Err(e) => Some(e),
        };

        if let Some(fe) = fetch_error {
            let (code, status) = fe.wire_code();
            log::debug!("[{}] id={id} fetch failed: {fe} -> {code}/{status}", self.name);
            let raw = self
                .send_error(conn, codec, header, peer, code, status, &fe.to_string())
                .await?;
            cache.insert(
                id,
                CacheEntry {
                    flags,
                    peer,
                    state: CacheState::Errored(raw),
                    last_send: Instant::now(),
                },
            );
        }
        Ok(())
    }

    async fn stream_response(
        &self,
        conn: &Arc<dyn Conn>,
        codec: &Codec,
        header: &Header,
        peer: SocketAddr,
        resp: &FetchedResponse,
    ) -> Result<ChunkedResponse> {
        let flags = header.flags.without(FLAG_FINAL);
        let cfg = ChunkerConfig {
            mtu_budget: self.policy.mtu_budget,
            parity: self.policy.parity_enabled,
            head_duplication: self.policy.head_duplication,
            body_duplication: self.policy.body_duplication,
        };
        let timestamp = if flags.short_id() { 0 } else { unix_now() };
        let chunks = chunk_response(
            codec,
            header.version,
            flags,
            header.request_id,
            timestamp,
            resp.status,
            &resp.headers,
            &resp.body,
            &cfg,
        )?;

        log::debug!(
            "[{}] id={} streaming {} head + {} body datagrams",
            self.name,
            header.request_id,
            chunks.head.len(),
            chunks.body.len()
        );
        for datagram in chunks.emit_order() {
            conn.send_to(datagram, peer).await?;
        }
        Ok(chunks)
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_error(
        &self,
        conn: &Arc<dyn Conn>,
        codec: &Codec,
        req_header: &Header,
        peer: SocketAddr,
        error_code: u8,
        http_status: u16,
        message: &str,
    ) -> Result<Bytes> {
        let flags = req_header.flags.without(FLAG_FINAL);
        let header = Header {
            version: req_header.version,
            kind: PK_ERROR,
            flags,
            request_id: req_header.request_id,
            sequence: 0,
            sequence_total: 0,
            payload_len: 0,
            timestamp: if flags.short_id() { 0 } else { unix_now() },
        };
        let raw = codec.encode(&Packet::new(
            header,
            Payload::Error(ErrorPayload {
                error_code,
                http_status,
                message: message.to_owned(),
            }),
        ))?;
        conn.send_to(&raw, peer).await?;
        Ok(raw)
    }

    /// Best-effort reply to a version we do not speak: recover the request
    /// identifier from the long-identifier layout if the buffer is big
    /// enough, then discard.
    async fn reply_unsupported_version(
        &self,
        conn: &Arc<dyn Conn>,
        codec: &Codec,
        raw: &[u8],
        peer: SocketAddr,
        version: u8,
    ) -> Result<()> {
        log::debug!(
            "[{}] unsupported version {version:#04x} from {peer}",
            self.name
        );
        if raw.len() < 14 {
            return Ok(());
        }
        let mut id_bytes = [0u8; 8];
        id_bytes.copy_from_slice(&raw[6..14]);
        let header = Header {
            version: VERSION_3,
            kind: PK_ERROR,
            flags: Flags(0),
            request_id: u64::from_be_bytes(id_bytes),
            sequence: 0,
            sequence_total: 0,
            payload_len: 0,
            timestamp: unix_now(),
        };
        let datagram = codec.encode(&Packet::new(
            header,
            Payload::Error(ErrorPayload {
                error_code: ERR_CODE_UNSUPPORTED_VERSION,
                http_status: 505,
                message: "unsupported protocol version".to_owned(),
            }),
        ))?;
        conn.send_to(&datagram, peer).await?;
        Ok(())
    }
}
