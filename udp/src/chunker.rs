#[cfg(test)]
mod chunker_test;

use bytes::Bytes;
use wire::codec::Codec;
use wire::header::*;
use wire::header_block::encode_header_block;
use wire::packet::*;

use crate::error::{Error, Result};

/// Keep the body sequence space clear of the parity index and the ACK
/// all-received sentinel.
const MAX_BODY_CHUNKS: usize = 0xFFF0;

#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    /// Working per-datagram size target; never exceeded, so the IP layer
    /// does not fragment.
    pub mtu_budget: usize,
    pub parity: bool,
    pub head_duplication: usize,
    pub body_duplication: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        ChunkerConfig {
            mtu_budget: 1200,
            parity: false,
            head_duplication: 4,
            body_duplication: 1,
        }
    }
}

/// An owned, independently addressable chunk sequence. `head[i]` and
/// `body[seq]` hold the exact transmit bytes, which is what makes cached
/// re-emits bit-identical.
#[derive(Debug, Clone)]
pub struct ChunkedResponse {
    pub head: Vec<Bytes>,
    /// Data chunks at `0..body_total`, plus the parity chunk at
    /// `body_total` when parity is on.
    pub body: Vec<Bytes>,
    pub body_total: u16,
    pub parity: bool,
    pub head_duplication: usize,
    pub body_duplication: usize,
}

impl ChunkedResponse {
    /// First-transmission order: head copies first (their loss is fatal to
    /// progress), then the body rounds.
    pub fn emit_order(&self) -> impl Iterator<Item = &Bytes> {
        let head_rounds = self.head_duplication.max(1);
        let body_rounds = self.body_duplication.max(1);
        std::iter::repeat(&self.head)
            .take(head_rounds)
            .flatten()
            .chain(std::iter::repeat(&self.body).take(body_rounds).flatten())
    }

    pub fn total_datagrams(&self) -> usize {
        self.head.len() * self.head_duplication.max(1)
            + self.body.len() * self.body_duplication.max(1)
    }
}

/// Usable payload bytes per datagram under the given flags.
pub fn payload_budget(mtu_budget: usize, flags: Flags) -> Result<usize> {
    let overhead = Header::size(flags) + TAG_SIZE;
    // Room for the RespHead prefix plus at least a few block bytes.
    if mtu_budget < overhead + 16 {
        return Err(Error::ErrBadGeometry);
    }
    Ok(mtu_budget - overhead)
}

/// Splits one fetched response into its deterministic datagram sequence.
///
/// The body is cut into `n = ceil(len / budget)` chunks of uniform size
/// `ceil(len / n)` (last chunk possibly shorter), sequences dense from zero.
/// A body that fits the first head datagram (the empty body always does) is
/// carried inline there instead, with the final marker set and no body
/// datagrams at all.
pub fn chunk_response(
    codec: &Codec,
    version: u8,
    flags: Flags,
    request_id: u64,
    timestamp: u32,
    status: u16,
    headers: &[(String, String)],
    body: &[u8],
    cfg: &ChunkerConfig,
) -> Result<ChunkedResponse> {
    if flags.encrypt() && flags.aggregate_tag() {
        return Err(Error::ErrAggTagWithEncrypt);
    }
    let budget = payload_budget(cfg.mtu_budget, flags)?;
    if body.len() > u32::MAX as usize {
        return Err(Error::ErrBodyTooLarge);
    }

    let block = encode_header_block(headers).map_err(Error::Wire)?;
    let prefix = if flags.short_len() { 9 } else { 11 };

    // A body that shares the first head datagram with the whole header block
    // rides inline: one head datagram, zero body datagrams.
    let inline = body.is_empty() || prefix + block.len() + body.len() <= budget;
    let inline_body: &[u8] = if inline { body } else { &[] };

    // Body geometry.
    let n = if inline { 0 } else { body.len().div_ceil(budget) };
    if n > MAX_BODY_CHUNKS {
        return Err(Error::ErrBodyTooLarge);
    }
    let chunk_size = if n == 0 { 0 } else { body.len().div_ceil(n) };
    let parity = cfg.parity && n > 0;

    // Head split: the first head datagram carries the fixed prefix and the
    // inline body (if any); the rest of the header block flows into
    // continuation datagrams.
    let first_cap = budget - prefix - inline_body.len();
    let first_frag_len = block.len().min(first_cap);
    let mut cont_frags = vec![];
    let mut off = first_frag_len;
    while off < block.len() {
        let end = (off + budget).min(block.len());
        cont_frags.push(block.slice(off..end));
        off = end;
    }
    let head_total = 1 + cont_frags.len() as u16;

    let base = Header {
        version,
        kind: PacketKind::default(),
        flags,
        request_id,
        sequence: 0,
        sequence_total: head_total,
        payload_len: 0,
        timestamp,
    };

    let mut head = Vec::with_capacity(usize::from(head_total));
    for i in 0..head_total {
        let mut header = base.clone();
        header.sequence = i;
        // With no body the last head datagram closes the response.
        if n == 0 && i + 1 == head_total {
            header.flags = header.flags.with(FLAG_FINAL);
        }
        let payload = if i == 0 {
            Payload::RespHead(RespHeadPayload {
                status,
                parity,
                body_total: n as u16,
                body_len: body.len() as u32,
                block_frag: block.slice(..first_frag_len),
                inline_body: Bytes::copy_from_slice(inline_body),
            })
        } else {
            Payload::RespHeadCont(RespHeadContPayload {
                block_frag: cont_frags[usize::from(i) - 1].clone(),
            })
        };
        head.push(codec.encode(&Packet::new(header, payload))?);
    }

    // Body chunks, dense sequences, uniform size, last possibly shorter.
    let body_seq_total = n as u16 + u16::from(parity);
    let mut chunks: Vec<&[u8]> = Vec::with_capacity(n);
    for seq in 0..n {
        let start = seq * chunk_size;
        let end = (start + chunk_size).min(body.len());
        chunks.push(&body[start..end]);
    }

    let aggregate_tag = if flags.aggregate_tag() && n > 0 {
        Some(codec.key().tag(&chunks))
    } else {
        None
    };

    let mut out_body = Vec::with_capacity(n + usize::from(parity));
    for (seq, chunk) in chunks.iter().enumerate() {
        let mut header = base.clone();
        header.sequence = seq as u16;
        header.sequence_total = body_seq_total;
        // The last data chunk is the aggregate-tag carrier.
        if seq + 1 == n {
            header.flags = header.flags.with(FLAG_FINAL);
        }
        let payload = Payload::RespBody(RespBodyPayload {
            data: Bytes::copy_from_slice(chunk),
            aggregate_tag: if seq + 1 == n { aggregate_tag } else { None },
        });
        out_body.push(codec.encode(&Packet::new(header, payload))?);
    }

    if parity {
        let mut parity_payload = vec![0u8; chunk_size];
        for chunk in &chunks {
            for (i, b) in chunk.iter().enumerate() {
                parity_payload[i] ^= b;
            }
        }
        let mut header = base.clone();
        header.sequence = n as u16;
        header.sequence_total = body_seq_total;
        let payload = Payload::RespBody(RespBodyPayload {
            data: Bytes::from(parity_payload),
            aggregate_tag: None,
        });
        out_body.push(codec.encode(&Packet::new(header, payload))?);
    }

    Ok(ChunkedResponse {
        head,
        body: out_body,
        body_total: n as u16,
        parity,
        head_duplication: cfg.head_duplication,
        body_duplication: cfg.body_duplication,
    })
}
