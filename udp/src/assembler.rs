#[cfg(test)]
mod assembler_test;

use bytes::{BufMut, Bytes, BytesMut};
use wire::crypto::KeySchedule;
use wire::header::*;
use wire::header_block::decode_header_block;
use wire::packet::*;

use crate::error::{Error, Result};

/// Body datagrams that arrive before the response head are parked here until
/// the declared geometry is known. Bounded so reordering cannot balloon
/// memory.
const MAX_PENDING_BODY: usize = 64;

/// Admission outcome for one response datagram.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Admitted {
    /// Newly accepted; the assembler state advanced.
    Progress,
    /// Already had it; silently dropped.
    Duplicate,
    /// Not usable right now (e.g. nothing sensible to do with it).
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// Per-request buffer that collects head and body chunks, tolerates
/// duplicates and reordering, repairs at most one missing body chunk from
/// the XOR parity chunk, and refuses delivery until the aggregate tag (when
/// in use) has verified.
pub struct ResponseAssembler {
    flags: Flags,

    head_total: Option<u16>,
    head_chunks: Vec<Option<Bytes>>,
    accepted_head: usize,

    status: Option<u16>,
    body_len: Option<u32>,
    body_total: Option<u16>,
    parity_expected: bool,
    chunk_size: usize,

    body_chunks: Vec<Option<Bytes>>,
    accepted_body: usize,
    parity_chunk: Option<Bytes>,
    inline_body: Option<Bytes>,
    aggregate_tag: Option<[u8; TAG_SIZE]>,

    pending_body: Vec<(u16, u16, Bytes, Option<[u8; TAG_SIZE]>)>,
}

impl ResponseAssembler {
    pub fn new(flags: Flags) -> Self {
        ResponseAssembler {
            flags,
            head_total: None,
            head_chunks: vec![],
            accepted_head: 0,
            status: None,
            body_len: None,
            body_total: None,
            parity_expected: false,
            chunk_size: 0,
            body_chunks: vec![],
            accepted_body: 0,
            parity_chunk: None,
            inline_body: None,
            aggregate_tag: None,
            pending_body: vec![],
        }
    }

    /// Feeds one already-authenticated datagram of this request. Errors are
    /// admission rejections; the caller drops the datagram and counts it.
    pub fn on_packet(&mut self, pkt: &Packet) -> Result<Admitted> {
        if pkt.header.flags.mode_bits() != self.flags.mode_bits() {
            return Err(Error::ErrFlagMismatch);
        }
        match &pkt.payload {
            Payload::RespHead(p) => self.on_head(&pkt.header, p),
            Payload::RespHeadCont(p) => self.on_head_cont(&pkt.header, p),
            Payload::RespBody(p) => {
                self.on_body(pkt.header.sequence, pkt.header.sequence_total, p)
            }
            _ => Ok(Admitted::Ignored),
        }
    }

    fn set_head_total(&mut self, total: u16) -> Result<()> {
        match self.head_total {
            Some(known) if known != total => Err(Error::ErrHeadMismatch),
            Some(_) => Ok(()),
            None => {
                if total == 0 {
                    return Err(Error::ErrBadGeometry);
                }
                self.head_total = Some(total);
                self.head_chunks = vec![None; usize::from(total)];
                Ok(())
            }
        }
    }

    fn on_head(&mut self, header: &Header, p: &RespHeadPayload) -> Result<Admitted> {
        // The response head is head chunk zero and is unique per request.
        if header.sequence != 0 {
            return Err(Error::ErrSequenceOutOfRange);
        }
        self.set_head_total(header.sequence_total)?;

        if let Some(status) = self.status {
            // A late duplicate head that disagrees with the first-seen
            // declaration is malformed and must be dropped.
            let same = status == p.status
                && self.body_len == Some(p.body_len)
                && self.body_total == Some(p.body_total)
                && self.parity_expected == p.parity;
            return if same {
                Ok(Admitted::Duplicate)
            } else {
                Err(Error::ErrHeadMismatch)
            };
        }

        let body_total = usize::from(p.body_total);
        let body_len = p.body_len as usize;
        if body_total == 0 {
            // The whole body (possibly empty) rides inline in the head.
            if p.parity || p.inline_body.len() != body_len {
                return Err(Error::ErrBadGeometry);
            }
            self.inline_body = Some(p.inline_body.clone());
        } else {
            if !p.inline_body.is_empty() {
                return Err(Error::ErrBadGeometry);
            }
            let chunk_size = body_len.div_ceil(body_total);
            if chunk_size == 0 || body_len + chunk_size <= body_total * chunk_size {
                return Err(Error::ErrBadGeometry);
            }
            self.chunk_size = chunk_size;
        }

        self.status = Some(p.status);
        self.body_len = Some(p.body_len);
        self.body_total = Some(p.body_total);
        self.parity_expected = p.parity;
        self.body_chunks = vec![None; body_total];
        self.head_chunks[0] = Some(p.block_frag.clone());
        self.accepted_head += 1;

        // Replay any body chunks that arrived ahead of the head.
        let pending = std::mem::take(&mut self.pending_body);
        for (seq, seq_total, data, tag) in pending {
            let _ = self.admit_body(
                seq,
                seq_total,
                &RespBodyPayload {
                    data,
                    aggregate_tag: tag,
                },
            );
        }
        Ok(Admitted::Progress)
    }

    fn on_head_cont(&mut self, header: &Header, p: &RespHeadContPayload) -> Result<Admitted> {
        if header.sequence == 0 {
            return Err(Error::ErrSequenceOutOfRange);
        }
        self.set_head_total(header.sequence_total)?;
        let total = usize::from(self.head_total.unwrap_or(0));
        let seq = usize::from(header.sequence);
        if seq >= total {
            return Err(Error::ErrSequenceOutOfRange);
        }
        if self.head_chunks[seq].is_some() {
            return Ok(Admitted::Duplicate);
        }
        self.head_chunks[seq] = Some(p.block_frag.clone());
        self.accepted_head += 1;
        Ok(Admitted::Progress)
    }

    fn on_body(&mut self, seq: u16, seq_total: u16, p: &RespBodyPayload) -> Result<Admitted> {
        if self.body_total.is_none() {
            // Head not seen yet; park a bounded number of early arrivals.
            if self.pending_body.len() >= MAX_PENDING_BODY {
                return Ok(Admitted::Ignored);
            }
            if self
                .pending_body
                .iter()
                .any(|(pending_seq, ..)| *pending_seq == seq)
            {
                return Ok(Admitted::Duplicate);
            }
            self.pending_body
                .push((seq, seq_total, p.data.clone(), p.aggregate_tag));
            return Ok(Admitted::Progress);
        }
        self.admit_body(seq, seq_total, p)
    }

    fn admit_body(&mut self, seq: u16, seq_total: u16, p: &RespBodyPayload) -> Result<Admitted> {
        let body_total = self.body_total.unwrap_or(0);
        let wire_total = body_total + u16::from(self.parity_expected);
        if seq_total != wire_total || seq >= wire_total {
            return Err(Error::ErrSequenceOutOfRange);
        }

        if self.parity_expected && seq == body_total {
            if p.data.len() != self.chunk_size {
                return Err(Error::ErrChunkLengthInvalid);
            }
            if self.parity_chunk.is_some() {
                return Ok(Admitted::Duplicate);
            }
            self.parity_chunk = Some(p.data.clone());
            return Ok(Admitted::Progress);
        }

        if p.data.len() != self.expected_chunk_len(seq) {
            return Err(Error::ErrChunkLengthInvalid);
        }
        let slot = usize::from(seq);
        if self.body_chunks[slot].is_some() {
            return Ok(Admitted::Duplicate);
        }
        self.body_chunks[slot] = Some(p.data.clone());
        self.accepted_body += 1;
        if let Some(tag) = p.aggregate_tag {
            self.aggregate_tag = Some(tag);
        }
        Ok(Admitted::Progress)
    }

    fn expected_chunk_len(&self, seq: u16) -> usize {
        let body_total = usize::from(self.body_total.unwrap_or(0));
        let body_len = self.body_len.unwrap_or(0) as usize;
        if usize::from(seq) + 1 == body_total {
            body_len - (body_total - 1) * self.chunk_size
        } else {
            self.chunk_size
        }
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn head_complete(&self) -> bool {
        match self.head_total {
            Some(total) => self.accepted_head == usize::from(total),
            None => false,
        }
    }

    fn missing_body(&self) -> Vec<u16> {
        self.body_chunks
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_none())
            .map(|(i, _)| i as u16)
            .collect()
    }

    fn body_payload_complete(&self) -> bool {
        if self.body_total.is_none() {
            return false;
        }
        let missing = self.missing_body();
        missing.is_empty() || (missing.len() == 1 && self.parity_chunk.is_some())
    }

    /// Whether the body aggregate tag (if this request uses one) is in hand.
    fn aggregate_satisfied(&self) -> bool {
        !self.flags.aggregate_tag()
            || self.body_total == Some(0)
            || self.aggregate_tag.is_some()
    }

    pub fn is_complete(&self) -> bool {
        self.head_complete() && self.body_payload_complete() && self.aggregate_satisfied()
    }

    /// First missing head-chunk index. Body datagrams arriving with no head
    /// seen yet are evidence that head chunk zero was lost, so it is
    /// reported as the gap even before the head-chunk count is known.
    pub fn first_head_gap(&self) -> Option<u16> {
        match self.head_total {
            None => {
                if self.pending_body.is_empty() {
                    None
                } else {
                    Some(0)
                }
            }
            Some(_) => self
                .head_chunks
                .iter()
                .position(|c| c.is_none())
                .map(|i| i as u16),
        }
    }

    /// First missing body sequence. The aggregate-tag carrier counts as
    /// missing while its tag is absent, so the gap policy keeps requesting
    /// the real datagram even when parity could fill the payload.
    pub fn first_body_gap(&self) -> Option<u16> {
        let body_total = self.body_total?;
        let missing = self.missing_body();
        if let Some(first) = missing.first() {
            return Some(*first);
        }
        if !self.aggregate_satisfied() && body_total > 0 {
            return Some(body_total - 1);
        }
        None
    }

    /// Missing head sequences, at most `max_bits` of them.
    pub fn missing_head_sequences(&self, max_bits: u16) -> Vec<u16> {
        match self.head_total {
            None => match self.first_head_gap() {
                Some(seq) => vec![seq],
                None => vec![],
            },
            Some(_) => self
                .head_chunks
                .iter()
                .enumerate()
                .filter(|(_, c)| c.is_none())
                .take(usize::from(max_bits))
                .map(|(i, _)| i as u16)
                .collect(),
        }
    }

    /// Missing body sequences, at most `max_bits` of them.
    pub fn missing_body_sequences(&self, max_bits: u16) -> Vec<u16> {
        let mut missing = self.missing_body();
        if missing.is_empty() {
            if let Some(seq) = self.first_body_gap() {
                missing.push(seq);
            }
        }
        missing.truncate(usize::from(max_bits));
        missing
    }

    /// Consumes the assembler on completion: reconstructs the single missing
    /// chunk from parity if needed, verifies the aggregate tag, expands the
    /// header block, and returns the response with body bytes in declared
    /// sequence order.
    pub fn take(mut self, key: &KeySchedule) -> Result<AssembledResponse> {
        if !self.is_complete() {
            return Err(Error::ErrNotComplete);
        }

        let missing = self.missing_body();
        if let (Some(&seq), Some(parity)) = (missing.first(), self.parity_chunk.as_ref()) {
            let mut repaired = parity.to_vec();
            for chunk in self.body_chunks.iter().flatten() {
                for (i, b) in chunk.iter().enumerate() {
                    repaired[i] ^= b;
                }
            }
            repaired.truncate(self.expected_chunk_len(seq));
            self.body_chunks[usize::from(seq)] = Some(Bytes::from(repaired));
        }

        if self.flags.aggregate_tag() && self.body_total != Some(0) {
            let tag = self.aggregate_tag.ok_or(Error::ErrAggTagVerifyFailed)?;
            let parts: Vec<&[u8]> = self
                .body_chunks
                .iter()
                .flatten()
                .map(|c| c.as_ref())
                .collect();
            if !key.verify_tag(&parts, &tag) {
                return Err(Error::ErrAggTagVerifyFailed);
            }
        }

        let mut block = BytesMut::new();
        for frag in self.head_chunks.iter().flatten() {
            block.put_slice(frag);
        }
        let headers = decode_header_block(&block).map_err(Error::Wire)?;

        let body = match &self.inline_body {
            Some(inline) => inline.clone(),
            None => {
                let mut body =
                    BytesMut::with_capacity(self.body_len.unwrap_or(0) as usize);
                for chunk in self.body_chunks.iter().flatten() {
                    body.put_slice(chunk);
                }
                body.freeze()
            }
        };

        Ok(AssembledResponse {
            status: self.status.unwrap_or(0),
            headers,
            body,
        })
    }
}
