
use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Every AKARI datagram starts with the fixed two-byte magic so the tunnel
/// can be multiplexed with other traffic on the same port.
pub const MAGIC: [u8; 2] = *b"AK";

/// Legacy versions: long identifier only, no aggregate tag.
pub const VERSION_1: u8 = 0x01;
pub const VERSION_2: u8 = 0x02;
/// Current version: adds the short-identifier and aggregate-tag flags.
pub const VERSION_3: u8 = 0x03;

pub const TAG_SIZE: usize = 16;

/// PacketKind discriminates the kind-specific payload of a datagram.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct PacketKind(pub u8);

pub const PK_REQ: PacketKind = PacketKind(1);
pub const PK_RESP_HEAD: PacketKind = PacketKind(2);
pub const PK_RESP_HEAD_CONT: PacketKind = PacketKind(3);
pub const PK_RESP_BODY: PacketKind = PacketKind(4);
pub const PK_NACK_HEAD: PacketKind = PacketKind(5);
pub const PK_NACK_BODY: PacketKind = PacketKind(6);
pub const PK_ACK: PacketKind = PacketKind(7);
pub const PK_ERROR: PacketKind = PacketKind(8);

impl PacketKind {
    pub fn is_known(&self) -> bool {
        (PK_REQ.0..=PK_ERROR.0).contains(&self.0)
    }

    /// Head and body sequence spaces are independent; these two kinds share
    /// the head-chunk counter.
    pub fn is_head(&self) -> bool {
        *self == PK_RESP_HEAD || *self == PK_RESP_HEAD_CONT
    }
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            PK_REQ => "REQ",
            PK_RESP_HEAD => "RESP-HEAD",
            PK_RESP_HEAD_CONT => "RESP-HEAD-CONT",
            PK_RESP_BODY => "RESP-BODY",
            PK_NACK_HEAD => "NACK-HEAD",
            PK_NACK_BODY => "NACK-BODY",
            PK_ACK => "ACK",
            PK_ERROR => "ERROR",
            _ => return write!(f, "Unknown PacketKind: {}", self.0),
        };
        write!(f, "{s}")
    }
}

pub const FLAG_ENCRYPT: u8 = 0x01;
pub const FLAG_AGG_TAG: u8 = 0x02;
pub const FLAG_SHORT_ID: u8 = 0x04;
pub const FLAG_SHORT_LEN: u8 = 0x08;
pub const FLAG_FINAL: u8 = 0x10;

/// Mode bits must be identical on every datagram of a request; FINAL is the
/// only per-datagram flag.
pub const FLAG_MODE_MASK: u8 = FLAG_ENCRYPT | FLAG_AGG_TAG | FLAG_SHORT_ID | FLAG_SHORT_LEN;

/// The low two flag bits are folded into the AEAD nonce.
pub const FLAG_NONCE_MASK: u8 = FLAG_ENCRYPT | FLAG_AGG_TAG;

#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub struct Flags(pub u8);

impl Flags {
    pub fn encrypt(self) -> bool {
        self.0 & FLAG_ENCRYPT != 0
    }

    pub fn aggregate_tag(self) -> bool {
        self.0 & FLAG_AGG_TAG != 0
    }

    pub fn short_id(self) -> bool {
        self.0 & FLAG_SHORT_ID != 0
    }

    pub fn short_len(self) -> bool {
        self.0 & FLAG_SHORT_LEN != 0
    }

    pub fn final_marker(self) -> bool {
        self.0 & FLAG_FINAL != 0
    }

    pub fn mode_bits(self) -> u8 {
        self.0 & FLAG_MODE_MASK
    }

    pub fn with(self, bit: u8) -> Flags {
        Flags(self.0 | bit)
    }

    pub fn without(self, bit: u8) -> Flags {
        Flags(self.0 & !bit)
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (FLAG_ENCRYPT, "ENCRYPT"),
            (FLAG_AGG_TAG, "AGG-TAG"),
            (FLAG_SHORT_ID, "SHORT-ID"),
            (FLAG_SHORT_LEN, "SHORT-LEN"),
            (FLAG_FINAL, "FINAL"),
        ];
        let mut first = true;
        for (bit, name) in names {
            if self.0 & bit != 0 {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        if first {
            write!(f, "-")?;
        }
        Ok(())
    }
}

/// Header is the fixed-layout prefix of every AKARI datagram.
///
/// Long-identifier layout (versions 1-3):
/// ```text
///  0                   1                   2
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3
/// +---+---+-------+-------+-------+-------+
/// |'A'|'K'|version| kind  | flags |rsvd=0 |
/// +---+---+-------+-------+-------+-------+
/// |            request id (8)             |
/// +-------+-------+-------+-------+-------+
/// | seq (2)       | seq total (2) |
/// +-------+-------+-------+-------+
/// | payload len (2|1)     | timestamp (4) |
/// +-------+-------+-------+---------------+
/// ```
///
/// The short-identifier layout (version 3 only) narrows the request id to two
/// bytes and drops the timestamp. All integers are big-endian.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub kind: PacketKind,
    pub flags: Flags,
    pub request_id: u64,
    pub sequence: u16,
    pub sequence_total: u16,
    pub payload_len: u16,
    /// Wall-clock seconds; carried only by the long-identifier layout.
    pub timestamp: u32,
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} id={} seq={}/{} len={} flags={}",
            self.kind, self.request_id, self.sequence, self.sequence_total, self.payload_len, self.flags
        )
    }
}

impl Header {
    /// Encoded size of a header carrying the given flags.
    pub fn size(flags: Flags) -> usize {
        let id = if flags.short_id() { 2 } else { 8 };
        let plen = if flags.short_len() { 1 } else { 2 };
        let ts = if flags.short_id() { 0 } else { 4 };
        2 + 1 + 1 + 1 + 1 + id + 2 + 2 + plen + ts
    }

    /// Size of the per-datagram tag slot that follows the payload. Intermediate
    /// aggregate-tagged body datagrams carry no tag at all; the final one
    /// carries the aggregate tag in the same 16-byte slot.
    pub fn tag_size(&self) -> usize {
        if self.flags.aggregate_tag() && self.kind == PK_RESP_BODY && !self.flags.final_marker() {
            0
        } else {
            TAG_SIZE
        }
    }

    /// Validates the flag set against the version and the mutual-exclusion
    /// rules shared by the encode and decode paths.
    pub fn check_flags(&self) -> Result<()> {
        if self.flags.encrypt() && self.flags.aggregate_tag() {
            return Err(Error::ErrAggTagWithEncrypt);
        }
        if self.version != VERSION_3 && self.flags.0 & (FLAG_AGG_TAG | FLAG_SHORT_ID) != 0 {
            return Err(Error::ErrFlagsNotAllowedOnVersion {
                version: self.version,
                flags: self.flags.0,
            });
        }
        Ok(())
    }

    pub fn marshal_to(&self, writer: &mut BytesMut) -> Result<usize> {
        self.check_flags()?;
        if self.flags.short_id() && self.request_id > u64::from(u16::MAX) {
            return Err(Error::ErrShortIdOverflow);
        }
        if self.flags.short_len() && self.payload_len > u16::from(u8::MAX) {
            return Err(Error::ErrPayloadTooLarge);
        }

        writer.put_slice(&MAGIC);
        writer.put_u8(self.version);
        writer.put_u8(self.kind.0);
        writer.put_u8(self.flags.0);
        writer.put_u8(0); // reserved
        if self.flags.short_id() {
            writer.put_u16(self.request_id as u16);
        } else {
            writer.put_u64(self.request_id);
        }
        writer.put_u16(self.sequence);
        writer.put_u16(self.sequence_total);
        if self.flags.short_len() {
            writer.put_u8(self.payload_len as u8);
        } else {
            writer.put_u16(self.payload_len);
        }
        if !self.flags.short_id() {
            writer.put_u32(self.timestamp);
        }

        Ok(Self::size(self.flags))
    }

    pub fn unmarshal(raw: &Bytes) -> Result<Self> {
        // The fixed prefix up to the flags byte is enough to learn the layout.
        if raw.len() < 6 {
            return Err(Error::ErrShortBuffer);
        }
        if raw[0..2] != MAGIC {
            return Err(Error::ErrBadMagic);
        }
        let version = raw[2];
        if !(VERSION_1..=VERSION_3).contains(&version) {
            return Err(Error::ErrUnknownVersion { version });
        }

        let kind = PacketKind(raw[3]);
        if !kind.is_known() {
            return Err(Error::ErrUnknownKind { kind: raw[3] });
        }
        let flags = Flags(raw[4]);
        if raw[5] != 0 {
            return Err(Error::ErrReservedNotZero);
        }
        if raw.len() < Self::size(flags) {
            return Err(Error::ErrShortBuffer);
        }

        let reader = &mut raw.slice(6..);
        let request_id = if flags.short_id() {
            u64::from(reader.get_u16())
        } else {
            reader.get_u64()
        };
        let sequence = reader.get_u16();
        let sequence_total = reader.get_u16();
        let payload_len = if flags.short_len() {
            u16::from(reader.get_u8())
        } else {
            reader.get_u16()
        };
        let timestamp = if flags.short_id() { 0 } else { reader.get_u32() };

        let header = Header {
            version,
            kind,
            flags,
            request_id,
            sequence,
            sequence_total,
            payload_len,
            timestamp,
        };
        header.check_flags()?;

        Ok(header)
    }
}
