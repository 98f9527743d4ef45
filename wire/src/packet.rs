
use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::header::*;

/// Request method carried inside a `Req` payload.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub struct Method(pub u8);

pub const METHOD_GET: Method = Method(1);
pub const METHOD_POST: Method = Method(2);
pub const METHOD_HEAD: Method = Method(3);
pub const METHOD_PUT: Method = Method(4);
pub const METHOD_DELETE: Method = Method(5);
pub const METHOD_OPTIONS: Method = Method(6);
pub const METHOD_PATCH: Method = Method(7);

impl Method {
    pub fn is_known(&self) -> bool {
        (METHOD_GET.0..=METHOD_PATCH.0).contains(&self.0)
    }

    pub fn from_name(name: &str) -> Option<Method> {
        let m = match name.to_ascii_uppercase().as_str() {
            "GET" => METHOD_GET,
            "POST" => METHOD_POST,
            "HEAD" => METHOD_HEAD,
            "PUT" => METHOD_PUT,
            "DELETE" => METHOD_DELETE,
            "OPTIONS" => METHOD_OPTIONS,
            "PATCH" => METHOD_PATCH,
            _ => return None,
        };
        Some(m)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            METHOD_GET => "GET",
            METHOD_POST => "POST",
            METHOD_HEAD => "HEAD",
            METHOD_PUT => "PUT",
            METHOD_DELETE => "DELETE",
            METHOD_OPTIONS => "OPTIONS",
            METHOD_PATCH => "PATCH",
            _ => return write!(f, "Unknown Method: {}", self.0),
        };
        write!(f, "{s}")
    }
}

// Wire error codes carried by an Error payload, each paired with an
// HTTP-style status hint by the sender.
pub const ERR_CODE_INVALID_URL: u8 = 10;
pub const ERR_CODE_BODY_TOO_LARGE: u8 = 11;
pub const ERR_CODE_UPSTREAM_TIMEOUT: u8 = 20;
pub const ERR_CODE_UPSTREAM_FAILURE: u8 = 30;
pub const ERR_CODE_UNENCRYPTED_REFUSED: u8 = 0x40;
pub const ERR_CODE_UNSUPPORTED_VERSION: u8 = 0x50;
pub const ERR_CODE_INTERNAL: u8 = 255;

/// Sentinel first-lost value meaning "all received".
pub const ACK_ALL_RECEIVED: u16 = 0xFFFF;

/// `[method:1][url_len:2][url][header block]`
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct ReqPayload {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
}

/// `[status:2][parity:1][body_total:2][body_len:4|2][block_len:2][block frag][inline body]`
///
/// The header's sequence fields index the head-chunk space; body_total counts
/// data chunks only. When `parity` is set one extra parity chunk follows at
/// body sequence `body_total`. A body small enough to share the first head
/// datagram is carried inline with `body_total == 0`; inline bytes on a
/// chunked response are malformed.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct RespHeadPayload {
    pub status: u16,
    pub parity: bool,
    pub body_total: u16,
    pub body_len: u32,
    pub block_frag: Bytes,
    pub inline_body: Bytes,
}

#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct RespHeadContPayload {
    pub block_frag: Bytes,
}

#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct RespBodyPayload {
    pub data: Bytes,
    /// Aggregate tag carried by the final body datagram in aggregate-tag
    /// mode. Rides in the datagram's tag slot, not in the payload bytes.
    pub aggregate_tag: Option<[u8; TAG_SIZE]>,
}

/// Bitmap of missing sequences: bit `i` (LSB-first within each byte) set
/// means sequence `i` is missing. An empty bitmap is malformed.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct NackPayload {
    pub bitmap: Bytes,
}

impl NackPayload {
    pub fn from_missing(missing: &[u16]) -> Self {
        let max = missing.iter().max().copied().unwrap_or(0);
        let mut bitmap = vec![0u8; usize::from(max) / 8 + 1];
        for seq in missing {
            bitmap[usize::from(*seq) / 8] |= 1u8 << (*seq % 8);
        }
        NackPayload {
            bitmap: Bytes::from(bitmap),
        }
    }

    /// Set bits in ascending sequence order. Bits past `limit` are ignored,
    /// which is how a responder discards out-of-range requests without ever
    /// indexing out of bounds.
    pub fn missing_sequences(&self, limit: u16) -> Vec<u16> {
        let mut missing = vec![];
        for (byte_index, byte) in self.bitmap.iter().enumerate() {
            for bit in 0..8usize {
                if (byte >> bit) & 1 == 0 {
                    continue;
                }
                let seq = byte_index * 8 + bit;
                if seq >= usize::from(limit) {
                    return missing;
                }
                missing.push(seq as u16);
            }
        }
        missing
    }
}

/// `[first_lost:2]`; an empty payload decodes as the all-received sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckPayload {
    pub first_lost: u16,
}

/// `[code:1][http_status:2][utf-8 message]`
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct ErrorPayload {
    pub error_code: u8,
    pub http_status: u16,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Req(ReqPayload),
    RespHead(RespHeadPayload),
    RespHeadCont(RespHeadContPayload),
    RespBody(RespBodyPayload),
    NackHead(NackPayload),
    NackBody(NackPayload),
    Ack(AckPayload),
    Error(ErrorPayload),
}

impl Payload {
    pub fn kind(&self) -> PacketKind {
        match self {
            Payload::Req(_) => PK_REQ,
            Payload::RespHead(_) => PK_RESP_HEAD,
            Payload::RespHeadCont(_) => PK_RESP_HEAD_CONT,
            Payload::RespBody(_) => PK_RESP_BODY,
            Payload::NackHead(_) => PK_NACK_HEAD,
            Payload::NackBody(_) => PK_NACK_BODY,
            Payload::Ack(_) => PK_ACK,
            Payload::Error(_) => PK_ERROR,
        }
    }

    /// Serializes the kind-specific payload bytes (the part that gets
    /// authenticated and, under the encrypt flag, sealed).
    pub fn marshal(&self, flags: Flags) -> Result<Bytes> {
        let mut writer = BytesMut::new();
        match self {
            Payload::Req(p) => {
                if !p.method.is_known() {
                    return Err(Error::ErrUnknownMethod { method: p.method.0 });
                }
                if p.url.len() > usize::from(u16::MAX) {
                    return Err(Error::ErrPayloadTooLarge);
                }
                writer.put_u8(p.method.0);
                writer.put_u16(p.url.len() as u16);
                writer.put_slice(p.url.as_bytes());
                writer.put_slice(&crate::header_block::encode_header_block(&p.headers)?);
            }
            Payload::RespHead(p) => {
                if p.body_total > 0 && !p.inline_body.is_empty() {
                    return Err(Error::ErrInlineBodyWithChunks);
                }
                if p.block_frag.len() > usize::from(u16::MAX) {
                    return Err(Error::ErrPayloadTooLarge);
                }
                writer.put_u16(p.status);
                writer.put_u8(u8::from(p.parity));
                writer.put_u16(p.body_total);
                if flags.short_len() {
                    if p.body_len > u32::from(u16::MAX) {
                        return Err(Error::ErrPayloadTooLarge);
                    }
                    writer.put_u16(p.body_len as u16);
                } else {
                    writer.put_u32(p.body_len);
                }
                writer.put_u16(p.block_frag.len() as u16);
                writer.put_slice(&p.block_frag);
                writer.put_slice(&p.inline_body);
            }
            Payload::RespHeadCont(p) => {
                if p.block_frag.is_empty() {
                    return Err(Error::ErrEmptyPayload);
                }
                writer.put_slice(&p.block_frag);
            }
            Payload::RespBody(p) => {
                if p.data.is_empty() {
                    return Err(Error::ErrEmptyPayload);
                }
                writer.put_slice(&p.data);
            }
            Payload::NackHead(p) | Payload::NackBody(p) => {
                if p.bitmap.is_empty() {
                    return Err(Error::ErrEmptyBitmap);
                }
                writer.put_slice(&p.bitmap);
            }
            Payload::Ack(p) => {
                writer.put_u16(p.first_lost);
            }
            Payload::Error(p) => {
                writer.put_u8(p.error_code);
                writer.put_u16(p.http_status);
                writer.put_slice(p.message.as_bytes());
            }
        }
        Ok(writer.freeze())
    }

    /// Exact inverse of [`Payload::marshal`] for already-authenticated (or
    /// deliberately deferred) payload bytes.
    pub fn unmarshal(kind: PacketKind, flags: Flags, raw: &Bytes) -> Result<Payload> {
        if raw.is_empty() && kind != PK_ACK {
            return Err(Error::ErrEmptyPayload);
        }
        let payload = match kind {
            PK_REQ => {
                if raw.len() < 3 {
                    return Err(Error::ErrPayloadTooShort);
                }
                let reader = &mut raw.clone();
                let method = Method(reader.get_u8());
                if !method.is_known() {
                    return Err(Error::ErrUnknownMethod { method: method.0 });
                }
                let url_len = usize::from(reader.get_u16());
                if reader.remaining() < url_len {
                    return Err(Error::ErrPayloadTooShort);
                }
                let url = String::from_utf8(reader.copy_to_bytes(url_len).to_vec())
                    .map_err(|_| Error::ErrInvalidUtf8)?;
                let headers = crate::header_block::decode_header_block(reader.chunk())?;
                Payload::Req(ReqPayload {
                    method,
                    url,
                    headers,
                })
            }
            PK_RESP_HEAD => {
                let prefix = if flags.short_len() { 9 } else { 11 };
                if raw.len() < prefix {
                    return Err(Error::ErrPayloadTooShort);
                }
                let reader = &mut raw.clone();
                let status = reader.get_u16();
                let parity = match reader.get_u8() {
                    0 => false,
                    1 => true,
                    _ => return Err(Error::ErrBadParityFlag),
                };
                let body_total = reader.get_u16();
                let body_len = if flags.short_len() {
                    u32::from(reader.get_u16())
                } else {
                    reader.get_u32()
                };
                let block_len = usize::from(reader.get_u16());
                if prefix + block_len > raw.len() {
                    return Err(Error::ErrPayloadTooShort);
                }
                let inline_body = raw.slice(prefix + block_len..);
                if body_total > 0 && !inline_body.is_empty() {
                    return Err(Error::ErrInlineBodyWithChunks);
                }
                Payload::RespHead(RespHeadPayload {
                    status,
                    parity,
                    body_total,
                    body_len,
                    block_frag: raw.slice(prefix..prefix + block_len),
                    inline_body,
                })
            }
            PK_RESP_HEAD_CONT => Payload::RespHeadCont(RespHeadContPayload {
                block_frag: raw.clone(),
            }),
            PK_RESP_BODY => Payload::RespBody(RespBodyPayload {
                data: raw.clone(),
                aggregate_tag: None,
            }),
            PK_NACK_HEAD => Payload::NackHead(NackPayload {
                bitmap: raw.clone(),
            }),
            PK_NACK_BODY => Payload::NackBody(NackPayload {
                bitmap: raw.clone(),
            }),
            PK_ACK => {
                if raw.is_empty() {
                    Payload::Ack(AckPayload {
                        first_lost: ACK_ALL_RECEIVED,
                    })
                } else if raw.len() == 2 {
                    Payload::Ack(AckPayload {
                        first_lost: u16::from_be_bytes([raw[0], raw[1]]),
                    })
                } else {
                    return Err(Error::ErrLengthMismatch);
                }
            }
            PK_ERROR => {
                if raw.len() < 3 {
                    return Err(Error::ErrPayloadTooShort);
                }
                let message = String::from_utf8(raw.slice(3..).to_vec())
                    .map_err(|_| Error::ErrInvalidUtf8)?;
                Payload::Error(ErrorPayload {
                    error_code: raw[0],
                    http_status: u16::from_be_bytes([raw[1], raw[2]]),
                    message,
                })
            }
            _ => return Err(Error::ErrUnknownKind { kind: kind.0 }),
        };
        Ok(payload)
    }
}

/// A fully decoded (or to-be-encoded) datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub payload: Payload,
}

impl Packet {
    /// Builds a packet, forcing the header kind to match the payload.
    pub fn new(mut header: Header, payload: Payload) -> Self {
        header.kind = payload.kind();
        Packet { header, payload }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.header)
    }
}
