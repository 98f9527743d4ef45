//! Wire layer of the AKARI UDP tunnel.
//!
//! AKARI tunnels HTTP request/response pairs over UDP between a local proxy
//! and an origin-side gateway. This crate owns everything that touches raw
//! datagram bytes: the fixed-layout header, the kind-specific payloads, the
//! compressed HTTP header block, per-datagram authentication (HMAC-SHA-256 or
//! XChaCha20-Poly1305), and replay rejection.
//!
//! The protocol engines that drive retransmission and reassembly live in the
//! `akari-udp` crate on top of this one.

#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod codec;
pub mod crypto;
pub mod error;
pub mod header;
pub mod header_block;
pub mod packet;
pub mod replay;

pub use codec::{Codec, MAX_TIMESTAMP_SKEW_SECS};
pub use crypto::KeySchedule;
pub use error::{Error, RejectKind, Result};
pub use header::{Flags, Header, PacketKind};
pub use packet::{Packet, Payload};
pub use replay::ReplayCache;
