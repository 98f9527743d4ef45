use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse bucket a datagram rejection falls into. Engines drop rejected
/// datagrams silently and only feed these buckets into their statistics.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RejectKind {
    Malformed,
    AuthFailed,
    Replay,
    Stale,
}

#[derive(Debug, Error, PartialEq, Eq, Clone)]
#[non_exhaustive]
pub enum Error {
    #[error("buffer is too small for a datagram header")]
    ErrShortBuffer,
    #[error("datagram does not start with the AK magic")]
    ErrBadMagic,
    #[error("unknown protocol version {version}")]
    ErrUnknownVersion { version: u8 },
    #[error("reserved header byte is non-zero")]
    ErrReservedNotZero,
    #[error("unknown packet kind {kind}")]
    ErrUnknownKind { kind: u8 },
    #[error("flags {flags:#04x} are not allowed on protocol version {version}")]
    ErrFlagsNotAllowedOnVersion { version: u8, flags: u8 },
    #[error("aggregate-tag cannot be combined with per-datagram encryption")]
    ErrAggTagWithEncrypt,
    #[error("declared payload length is inconsistent with the buffer")]
    ErrLengthMismatch,
    #[error("payload does not fit the length field chosen by the flags")]
    ErrPayloadTooLarge,
    #[error("request id does not fit the short-identifier form")]
    ErrShortIdOverflow,
    #[error("header kind does not match the payload kind")]
    ErrKindMismatch,
    #[error("short-identifier flag requires protocol version 3")]
    ErrShortIdOnLegacyVersion,

    #[error("authentication tag mismatch")]
    ErrAuthFailed,
    #[error("duplicate datagram inside the replay window")]
    ErrReplay,
    #[error("datagram timestamp is outside the acceptance window")]
    ErrStale,
    #[error("final aggregate-tagged body datagram is missing its tag")]
    ErrMissingAggregateTag,

    #[error("payload is shorter than its kind requires")]
    ErrPayloadTooShort,
    #[error("payload must not be empty for this kind")]
    ErrEmptyPayload,
    #[error("parity byte must be 0 or 1")]
    ErrBadParityFlag,
    #[error("inline body is only legal when the body has no chunks")]
    ErrInlineBodyWithChunks,
    #[error("NACK bitmap must not be empty")]
    ErrEmptyBitmap,
    #[error("unknown request method {method}")]
    ErrUnknownMethod { method: u8 },
    #[error("string field is not valid UTF-8")]
    ErrInvalidUtf8,

    #[error("header block is truncated")]
    ErrHeaderBlockTruncated,
    #[error("unknown header name id {id}")]
    ErrUnknownHeaderId { id: u8 },
    #[error("header name is longer than 255 bytes")]
    ErrHeaderNameTooLong,
    #[error("header value is longer than a varint16 can carry")]
    ErrHeaderValueTooLong,

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Buckets a decode rejection. Everything that is not an authentication,
    /// replay, or staleness failure is a structural `Malformed`.
    pub fn reject_kind(&self) -> RejectKind {
        match self {
            Error::ErrAuthFailed => RejectKind::AuthFailed,
            Error::ErrReplay => RejectKind::Replay,
            Error::ErrStale => RejectKind::Stale,
            _ => RejectKind::Malformed,
        }
    }
}
