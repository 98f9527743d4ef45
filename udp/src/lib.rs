//! Protocol engines for the AKARI UDP tunnel.
//!
//! AKARI relays HTTP request/response pairs over UDP across lossy, jittery,
//! or intermittently blacked-out links. The wire layer (framing,
//! authenticated encryption, header-block compression, replay rejection)
//! lives in the `akari-wire` crate; this crate adds everything that moves:
//!
//! - the [`chunker`], which cuts a fetched response into a deterministic
//!   datagram sequence with optional XOR parity and redundant copies,
//! - the [`assembler`], the per-request buffer that tolerates loss,
//!   duplication, and reordering,
//! - the [`client`] (initiator engine) with bounded request retry, NACK/ACK
//!   driven selective retransmission, and per-request deadlines,
//! - the [`server`] (responder engine), which fetches each URL once per
//!   identifier, streams the chunked response, and replays cached datagrams
//!   bit-identically on request.
//!
//! Both engines drive a single socket with non-blocking I/O and timers on a
//! cooperative single task; run several clients via
//! [`client::AkariClientPool`] for parallelism.

#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod assembler;
pub mod chunker;
pub mod client;
pub mod conn;
pub mod error;
pub mod server;
pub mod stats;
mod util;

pub use assembler::{Admitted, AssembledResponse, ResponseAssembler};
pub use chunker::{chunk_response, ChunkedResponse, ChunkerConfig};
pub use client::{AkariClient, AkariClientPool, HttpResponse, RequestConfig};
pub use conn::Conn;
pub use error::{Error, Result};
pub use server::{AkariServer, FetchedResponse, Fetcher, FetcherError, ServerPolicy};
pub use stats::{RejectStats, TransferStats};
