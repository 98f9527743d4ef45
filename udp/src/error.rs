use std::io;

use thiserror::Error;
use tokio::sync::mpsc::error::SendError as MpscSendError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error, PartialEq)]
#[non_exhaustive]
pub enum Error {
    #[error("request deadline exceeded")]
    ErrTimeout,
    #[error("peer reported error {error_code} (http {http_status}): {message}")]
    ErrPeer {
        error_code: u8,
        http_status: u16,
        message: String,
    },
    #[error("aggregate-tag mode cannot be combined with per-datagram encryption")]
    ErrAggTagWithEncrypt,
    #[error("aggregate tag verification failed")]
    ErrAggTagVerifyFailed,
    #[error("engine is closed")]
    ErrClosed,
    #[error("client pool has no members")]
    ErrPoolEmpty,
    #[error("no free short identifier inside the collision window")]
    ErrShortIdSpaceExhausted,
    #[error("response is not complete yet")]
    ErrNotComplete,

    #[error("sequence is outside the declared total")]
    ErrSequenceOutOfRange,
    #[error("head datagram disagrees with the first-seen response head")]
    ErrHeadMismatch,
    #[error("body chunk length does not match the declared geometry")]
    ErrChunkLengthInvalid,
    #[error("datagram flags differ from the request's flag set")]
    ErrFlagMismatch,
    #[error("declared body geometry is impossible")]
    ErrBadGeometry,
    #[error("response body exceeds the configured cap")]
    ErrBodyTooLarge,

    #[error("{0}")]
    Wire(#[from] wire::Error),
    #[error("{0}")]
    Io(#[source] IoError),
    #[error("mpsc send: {0}")]
    MpscSend(String),

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
#[error("io error: {0}")]
pub struct IoError(#[from] pub io::Error);

// Workaround for wanting PartialEq for io::Error.
impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(IoError(e))
    }
}

// Because Tokio SendError is parameterized, we sadly lose the backtrace.
impl<T> From<MpscSendError<T>> for Error {
    fn from(e: MpscSendError<T>) -> Self {
        Error::MpscSend(e.to_string())
    }
}
