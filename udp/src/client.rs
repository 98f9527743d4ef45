
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};
use wire::codec::Codec;
use wire::header::*;
use wire::packet::*;
use wire::replay::DEFAULT_REPLAY_WINDOW;

use crate::assembler::ResponseAssembler;
use crate::conn::Conn;
use crate::error::{Error, Result};
use crate::stats::{RejectStats, TransferStats};
use crate::util::unix_now;

/// Per-request knobs, frozen for the duration of one fetch.
#[derive(Debug, Clone)]
pub struct RequestConfig {
    /// Hard deadline for the whole request.
    pub timeout: Duration,
    /// Upper bound on a single quiet wait between wakeups.
    pub socket_timeout: Duration,
    pub initial_request_retries: u32,
    pub initial_request_retry_interval: Duration,
    /// Dwell time of an unchanged first gap before a NACK goes out.
    pub first_gap_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_backoff: f64,
    pub max_nack_rounds: u32,
    pub max_nack_bits: u16,
    /// Overrides the client's default flag set for this request.
    pub flags: Option<Flags>,
}

impl Default for RequestConfig {
    fn default() -> Self {
        RequestConfig {
            timeout: Duration::from_secs(30),
            socket_timeout: Duration::from_secs(5),
            initial_request_retries: 3,
            initial_request_retry_interval: Duration::from_millis(500),
            first_gap_timeout: Duration::from_millis(200),
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_backoff: 1.5,
            max_nack_rounds: 8,
            max_nack_bits: 256,
            flags: None,
        }
    }
}

/// A completed tunnel fetch: the origin response plus transfer counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status_code: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub stats: TransferStats,
}

/// Allocator for the 16-bit identifier space. Identifiers recently in use
/// stay on cooldown for the replay window, and at most half of the space may
/// be on cooldown at once, so an in-flight identifier can never collide with
/// a cooling-down one.
struct ShortIdAllocator {
    next: u16,
    recent: VecDeque<(u16, Instant)>,
    window: Duration,
}

const SHORT_ID_COOLDOWN_CAP: usize = 0x8000;

impl ShortIdAllocator {
    fn new(window: Duration) -> Self {
        ShortIdAllocator {
            next: rand::random(),
            recent: VecDeque::new(),
            window,
        }
    }

    fn alloc(&mut self, now: Instant) -> Result<u16> {
        while let Some((_, born)) = self.recent.front() {
            if now.duration_since(*born) > self.window {
                self.recent.pop_front();
            } else {
                break;
            }
        }
        if self.recent.len() >= SHORT_ID_COOLDOWN_CAP {
            return Err(Error::ErrShortIdSpaceExhausted);
        }
        for _ in 0..=u16::MAX as u32 {
            let candidate = self.next;
            self.next = self.next.wrapping_add(1);
            if !self.recent.iter().any(|(id, _)| *id == candidate) {
                self.recent.push_back((candidate, now));
                return Ok(candidate);
            }
        }
        Err(Error::ErrShortIdSpaceExhausted)
    }
}

struct ClientInner {
    codec: Codec,
    short_ids: ShortIdAllocator,
}

/// Initiator engine. One engine owns one socket; a fetch serialises send and
/// receive on it, so a single engine runs one request at a time. Use an
/// [`AkariClientPool`] for concurrent callers.
pub struct AkariClient {
    name: String,
    conn: Arc<dyn Conn>,
    default_flags: Flags,
    next_id: AtomicU64,
    inner: Mutex<ClientInner>,
}

impl AkariClient {
    /// Binds a fresh UDP socket and points it at the responder.
    pub async fn new(
        remote_host: &str,
        remote_port: u16,
        psk: &[u8],
        default_flags: Flags,
    ) -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect((remote_host, remote_port)).await?;
        Ok(Self::with_conn(Arc::new(socket), psk, default_flags))
    }

    /// Builds a client over an existing transport.
    pub fn with_conn(conn: Arc<dyn Conn>, psk: &[u8], default_flags: Flags) -> Self {
        AkariClient {
            name: "akari-client".to_owned(),
            conn,
            default_flags,
            next_id: AtomicU64::new(rand::random()),
            inner: Mutex::new(ClientInner {
                codec: Codec::new(psk),
                short_ids: ShortIdAllocator::new(DEFAULT_REPLAY_WINDOW),
            }),
        }
    }

    /// Tunnels one HTTP request and returns the reassembled response.
    ///
    /// The returned body bytes are in wire-declared sequence order no matter
    /// how datagrams arrived. Failures are typed; packet-layer rejections
    /// are silent and only feed the statistics.
    pub async fn fetch(
        &self,
        url: &str,
        method: Method,
        headers: &[(String, String)],
        cfg: &RequestConfig,
    ) -> Result<HttpResponse> {
        let flags = cfg.flags.unwrap_or(self.default_flags);
        if flags.encrypt() && flags.aggregate_tag() {
            // Refused before any datagram is emitted: under per-datagram
            // AEAD the combination has no defined wire form.
            return Err(Error::ErrAggTagWithEncrypt);
        }

        let mut inner = self.inner.lock().await;
        let start = Instant::now();
        let deadline = start + cfg.timeout;

        let request_id = if flags.short_id() {
            u64::from(inner.short_ids.alloc(start)?)
        } else {
            self.next_id.fetch_add(1, Ordering::SeqCst)
        };

        let mut stats = TransferStats::default();
        let mut rejects = RejectStats::default();
        let mut asm = ResponseAssembler::new(flags);

        let req_payload = Payload::Req(ReqPayload {
            method,
            url: url.to_owned(),
            headers: headers.to_vec(),
        });

        // Attempt 0 plus bounded retries until any response datagram lands.
        let mut attempt: u32 = 0;
        self.send_req(&inner.codec, flags, request_id, attempt, &req_payload, &mut stats)
            .await?;
        let mut next_retry = Some(start + cfg.initial_request_retry_interval);
        let mut got_response = false;

        let mut ctrl_seq: u16 = 0;
        let mut nack_rounds: u32 = 0;
        let mut last_nack: Option<Bytes> = None;

        let mut gap_state: Option<(Option<u16>, Option<u16>, Instant)> = None;
        let mut heartbeat_interval = cfg.heartbeat_interval;
        let mut next_heartbeat: Option<Instant> = None;

        let mut buf = vec![0u8; 2048];

        loop {
            if asm.is_complete() {
                let assembled = asm.take(inner.codec.key())?;
                log::debug!(
                    "[{}] id={} complete: status={} body={}B nacks={} retries={}",
                    self.name,
                    request_id,
                    assembled.status,
                    assembled.body.len(),
                    stats.nacks_sent,
                    stats.request_retries
                );
                return Ok(HttpResponse {
                    status_code: assembled.status,
                    headers: assembled.headers,
                    body: assembled.body,
                    stats,
                });
            }

            let now = Instant::now();
            if now >= deadline {
                log::debug!(
                    "[{}] id={} deadline exceeded ({} rejects)",
                    self.name,
                    request_id,
                    rejects.total()
                );
                return Err(Error::ErrTimeout);
            }

            let mut wake = deadline.min(now + cfg.socket_timeout);
            if !got_response {
                if let Some(t) = next_retry {
                    wake = wake.min(t);
                }
            }
            if let Some((_, _, since)) = gap_state {
                wake = wake.min(since + cfg.first_gap_timeout);
            }
            if let Some(t) = next_heartbeat {
                wake = wake.min(t);
            }

            tokio::select! {
                biased;

                res = self.conn.recv(&mut buf) => {
                    let n = res?;
                    stats.bytes_received += n as u64;
                    let pkt = match inner.codec.decode(&buf[..n], unix_now()) {
                        Ok(pkt) => pkt,
                        Err(e) => {
                            rejects.bump(e.reject_kind());
                            log::trace!("[{}] dropped datagram: {}", self.name, e);
                            continue;
                        }
                    };
                    if pkt.header.request_id != request_id {
                        // Not ours; late traffic from an earlier request.
                        continue;
                    }
                    if pkt.header.version != VERSION_3
                        || pkt.header.flags.mode_bits() != flags.mode_bits()
                    {
                        rejects.malformed += 1;
                        continue;
                    }

                    got_response = true;
                    next_retry = None;

                    if let Payload::Error(e) = &pkt.payload {
                        return Err(Error::ErrPeer {
                            error_code: e.error_code,
                            http_status: e.http_status,
                            message: e.message.clone(),
                        });
                    }

                    match asm.on_packet(&pkt) {
                        Ok(crate::assembler::Admitted::Progress) => {
                            let gaps = (asm.first_head_gap(), asm.first_body_gap());
                            let now = Instant::now();
                            let changed = match gap_state {
                                Some((h, b, _)) => (h, b) != gaps,
                                None => true,
                            };
                            if changed {
                                gap_state = match gaps {
                                    (None, None) => None,
                                    (h, b) => Some((h, b, now)),
                                };
                            }
                            heartbeat_interval = cfg.heartbeat_interval;
                            next_heartbeat = Some(now + heartbeat_interval);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            rejects.malformed += 1;
                            log::trace!("[{}] assembler rejected datagram: {}", self.name, e);
                        }
                    }
                }

                _ = sleep_until(wake) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::ErrTimeout);
                    }

                    if !got_response {
                        if let Some(t) = next_retry {
                            if now >= t {
                                if attempt >= cfg.initial_request_retries {
                                    // A totally silent peer is not worth the
                                    // rest of the deadline.
                                    return Err(Error::ErrTimeout);
                                }
                                attempt += 1;
                                self.send_req(
                                    &inner.codec,
                                    flags,
                                    request_id,
                                    attempt,
                                    &req_payload,
                                    &mut stats,
                                )
                                .await?;
                                stats.request_retries += 1;
                                next_retry =
                                    Some(now + cfg.initial_request_retry_interval);
                            }
                        }
                        continue;
                    }

                    // Gap dwell: the first gap has not moved for long enough.
                    if let Some((_, _, since)) = gap_state {
                        if now >= since + cfg.first_gap_timeout
                            && nack_rounds < cfg.max_nack_rounds
                        {
                            let nack = self.build_nack(&asm, cfg, request_id);
                            if let Some(payload) = nack {
                                ctrl_seq = ctrl_seq.wrapping_add(1);
                                let raw = inner.codec.encode(&Packet::new(
                                    self.control_header(flags, request_id, ctrl_seq),
                                    payload,
                                ))?;
                                self.conn.send(&raw).await?;
                                stats.bytes_sent += raw.len() as u64;
                                stats.nacks_sent += 1;
                                nack_rounds += 1;
                                last_nack = Some(raw);
                                if let Some((h, b, _)) = gap_state {
                                    gap_state = Some((h, b, now));
                                }
                                next_heartbeat = Some(now + heartbeat_interval);
                            }
                        }
                    }

                    // Silence recovery: repeat the last NACK, or nudge the
                    // responder with the first-lost sequence.
                    if let Some(t) = next_heartbeat {
                        if now >= t {
                            if let Some(raw) = &last_nack {
                                self.conn.send(raw).await?;
                                stats.bytes_sent += raw.len() as u64;
                                stats.nacks_sent += 1;
                            } else {
                                ctrl_seq = ctrl_seq.wrapping_add(1);
                                let ack = Payload::Ack(AckPayload {
                                    first_lost: asm
                                        .first_body_gap()
                                        .unwrap_or(ACK_ALL_RECEIVED),
                                });
                                let raw = inner.codec.encode(&Packet::new(
                                    self.control_header(flags, request_id, ctrl_seq),
                                    ack,
                                ))?;
                                self.conn.send(&raw).await?;
                                stats.bytes_sent += raw.len() as u64;
                            }
                            heartbeat_interval =
                                heartbeat_interval.mul_f64(cfg.heartbeat_backoff);
                            next_heartbeat = Some(now + heartbeat_interval);
                        }
                    }
                }
            }
        }
    }

    async fn send_req(
        &self,
        codec: &Codec,
        flags: Flags,
        request_id: u64,
        attempt: u32,
        payload: &Payload,
        stats: &mut TransferStats,
    ) -> Result<()> {
        // The attempt number rides in the sequence field so a retransmitted
        // request is not shadowed by the responder's replay cache.
        let header = Header {
            version: VERSION_3,
            kind: PK_REQ,
            flags: flags.without(FLAG_FINAL),
            request_id,
            sequence: attempt as u16,
            sequence_total: 1,
            payload_len: 0,
            timestamp: if flags.short_id() { 0 } else { unix_now() },
        };
        let raw = codec.encode(&Packet::new(header, payload.clone()))?;
        self.conn.send(&raw).await?;
        stats.bytes_sent += raw.len() as u64;
        log::debug!(
            "[{}] id={} sent REQ attempt {}",
            self.name,
            request_id,
            attempt
        );
        Ok(())
    }

    fn control_header(&self, flags: Flags, request_id: u64, ctrl_seq: u16) -> Header {
        Header {
            version: VERSION_3,
            kind: PacketKind::default(),
            flags: flags.without(FLAG_FINAL),
            request_id,
            sequence: ctrl_seq,
            sequence_total: 0,
            payload_len: 0,
            timestamp: if flags.short_id() { 0 } else { unix_now() },
        }
    }

    fn build_nack(
        &self,
        asm: &ResponseAssembler,
        cfg: &RequestConfig,
        request_id: u64,
    ) -> Option<Payload> {
        // Head gaps are fatal to progress, so they go first.
        if asm.first_head_gap().is_some() {
            let missing = asm.missing_head_sequences(cfg.max_nack_bits);
            if missing.is_empty() {
                return None;
            }
            log::debug!(
                "[{}] id={} NACK-HEAD {:?}",
                self.name,
                request_id,
                missing
            );
            return Some(Payload::NackHead(NackPayload::from_missing(&missing)));
        }
        if asm.first_body_gap().is_some() {
            let missing = asm.missing_body_sequences(cfg.max_nack_bits);
            if missing.is_empty() {
                return None;
            }
            log::debug!(
                "[{}] id={} NACK-BODY {:?}",
                self.name,
                request_id,
                missing
            );
            return Some(Payload::NackBody(NackPayload::from_missing(&missing)));
        }
        None
    }
}

/// A set of independent initiator engines for concurrent callers. Requests
/// are handed out round-robin; each member still runs one request at a time
/// on its own socket.
pub struct AkariClientPool {
    members: Vec<Arc<AkariClient>>,
    next: AtomicUsize,
}

impl AkariClientPool {
    pub async fn new(
        remote_host: &str,
        remote_port: u16,
        psk: &[u8],
        default_flags: Flags,
        pool_size: usize,
    ) -> Result<Self> {
        if pool_size == 0 {
            return Err(Error::ErrPoolEmpty);
        }
        let mut members = Vec::with_capacity(pool_size);
        for _ in 0..pool_size {
            members.push(Arc::new(
                AkariClient::new(remote_host, remote_port, psk, default_flags).await?,
            ));
        }
        Ok(AkariClientPool {
            members,
            next: AtomicUsize::new(0),
        })
    }

    pub fn with_members(members: Vec<Arc<AkariClient>>) -> Result<Self> {
        if members.is_empty() {
            return Err(Error::ErrPoolEmpty);
        }
        Ok(AkariClientPool {
            members,
            next: AtomicUsize::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub async fn send_request(
        &self,
        url: &str,
        method: Method,
        headers: &[(String, String)],
        cfg: &RequestConfig,
    ) -> Result<HttpResponse> {
        let index = self.next.fetch_add(1, Ordering::SeqCst) % self.members.len();
        self.members[index].fetch(url, method, headers, cfg).await
    }
}
