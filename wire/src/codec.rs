
use std::time::Duration;

use bytes::{Bytes, BytesMut};

use crate::crypto::KeySchedule;
use crate::error::{Error, Result};
use crate::header::*;
use crate::packet::{Packet, Payload};
use crate::replay::{ReplayCache, DEFAULT_REPLAY_WINDOW};

/// Timestamps (long-identifier layout only) are accepted within this many
/// seconds of the receiver's wall-clock reference.
pub const MAX_TIMESTAMP_SKEW_SECS: u32 = 30;

/// Codec turns packets into transmit bytes and authenticated inbound bytes
/// into packets. Each engine owns exactly one codec; the embedded replay
/// cache is never shared. Buffers passed to `decode` are only borrowed for
/// the duration of the call.
pub struct Codec {
    key: KeySchedule,
    replay: ReplayCache,
}

impl Codec {
    pub fn new(psk: &[u8]) -> Self {
        Self::with_replay_window(psk, DEFAULT_REPLAY_WINDOW)
    }

    pub fn with_replay_window(psk: &[u8], window: Duration) -> Self {
        Codec {
            key: KeySchedule::new(psk),
            replay: ReplayCache::new(window),
        }
    }

    pub fn key(&self) -> &KeySchedule {
        &self.key
    }

    /// Returns the exact bytes to transmit for `pkt`. The result is stable:
    /// encoding the same packet twice yields identical bytes (nonces are
    /// derived from the header), which is what makes cached re-emits safe.
    pub fn encode(&self, pkt: &Packet) -> Result<Bytes> {
        let flags = pkt.header.flags;
        if pkt.header.kind != pkt.payload.kind() {
            return Err(Error::ErrKindMismatch);
        }

        let payload = pkt.payload.marshal(flags)?;
        if payload.len() > usize::from(u16::MAX) {
            return Err(Error::ErrPayloadTooLarge);
        }

        let mut header = pkt.header.clone();
        header.payload_len = payload.len() as u16;

        let mut writer =
            BytesMut::with_capacity(Header::size(flags) + payload.len() + TAG_SIZE);
        header.marshal_to(&mut writer)?;

        if flags.encrypt() {
            let mut buffer = payload.to_vec();
            let tag = self.key.seal(
                header.request_id,
                header.sequence,
                flags,
                &writer,
                &mut buffer,
            )?;
            writer.extend_from_slice(&buffer);
            writer.extend_from_slice(&tag);
        } else if flags.aggregate_tag() && header.kind == PK_RESP_BODY {
            writer.extend_from_slice(&payload);
            if flags.final_marker() {
                let tag = match &pkt.payload {
                    Payload::RespBody(p) => {
                        p.aggregate_tag.ok_or(Error::ErrMissingAggregateTag)?
                    }
                    _ => return Err(Error::ErrKindMismatch),
                };
                writer.extend_from_slice(&tag);
            }
        } else {
            let tag = self.key.tag(&[&writer[..], &payload[..]]);
            writer.extend_from_slice(&payload);
            writer.extend_from_slice(&tag);
        }

        Ok(writer.freeze())
    }

    /// Decodes and authenticates one datagram. `now_unix` is the receiver's
    /// wall-clock reference in seconds for the staleness check. The first
    /// failed check wins: structural errors, then authentication, then
    /// staleness, then payload form, then replay.
    ///
    /// Intermediate aggregate-tagged body datagrams are admitted without
    /// per-datagram authentication; the assembler must hold their bytes back
    /// until the aggregate tag verifies.
    pub fn decode(&mut self, raw: &[u8], now_unix: u32) -> Result<Packet> {
        let raw = Bytes::copy_from_slice(raw);
        let header = Header::unmarshal(&raw)?;
        let flags = header.flags;

        let header_size = Header::size(flags);
        let payload_len = usize::from(header.payload_len);
        let tag_size = header.tag_size();
        if raw.len() != header_size + payload_len + tag_size {
            return Err(Error::ErrLengthMismatch);
        }

        let header_bytes = raw.slice(..header_size);
        let payload_end = header_size + payload_len;
        let tag = &raw[payload_end..];

        let mut aggregate_tag = None;
        let payload_bytes = if flags.encrypt() {
            let mut buffer = raw[header_size..payload_end].to_vec();
            self.key.open(
                header.request_id,
                header.sequence,
                flags,
                &header_bytes,
                &mut buffer,
                tag,
            )?;
            Bytes::from(buffer)
        } else if flags.aggregate_tag() && header.kind == PK_RESP_BODY {
            // Deferred authentication: the aggregate tag on the final body
            // datagram covers the whole body, nothing is verified here.
            if flags.final_marker() {
                let mut agg = [0u8; TAG_SIZE];
                agg.copy_from_slice(tag);
                aggregate_tag = Some(agg);
            }
            raw.slice(header_size..payload_end)
        } else {
            if !self
                .key
                .verify_tag(&[&header_bytes[..], &raw[header_size..payload_end]], tag)
            {
                return Err(Error::ErrAuthFailed);
            }
            raw.slice(header_size..payload_end)
        };

        if !flags.short_id() {
            let skew = now_unix.abs_diff(header.timestamp);
            if skew > MAX_TIMESTAMP_SKEW_SECS {
                return Err(Error::ErrStale);
            }
        }

        let mut payload = Payload::unmarshal(header.kind, flags, &payload_bytes)?;
        if let Payload::RespBody(ref mut p) = payload {
            p.aggregate_tag = aggregate_tag;
        }

        if !self.replay.observe(
            header.request_id,
            header.timestamp,
            header.sequence,
            header.kind,
        ) {
            return Err(Error::ErrReplay);
        }

        Ok(Packet { header, payload })
    }
}
