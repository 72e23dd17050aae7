//! Error taxonomy for the adapter protocol engine.
//!
//! Transport and execution failures bubble up through the executor's public
//! operations; decode failures stay local to a single measurement and are
//! logged and dropped by the caller.

use thiserror::Error;

/// Failures of the underlying byte channel.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The response deadline elapsed without any inbound data.
    #[error("request timeout of {waited_ms} ms exceeded")]
    Timeout { waited_ms: u64 },

    /// The channel closed before a complete frame arrived. Fatal,
    /// equivalent to connection loss.
    #[error("input stream closed before response terminator")]
    StreamClosed,
}

impl TransportError {
    /// Whether this error tears down the whole session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::StreamClosed)
    }
}

/// Failures of command execution against a connected adapter.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The adapter never produced a recognizable reply during the
    /// handshake. Recoverable: the selection loop should try the next
    /// registered protocol implementation.
    #[error("adapter '{adapter}' failed to establish a connection")]
    AdapterFailed {
        adapter: String,
        #[source]
        source: TransportError,
    },

    /// A response did not belong to the command that was sent.
    /// Recoverable: retry with a fresh command, bounded by the stale
    /// counter threshold.
    #[error("response did not match the expected identifier '{expected}'")]
    UnmatchedResponse { expected: String },

    /// Too many consecutive unmatched responses. Fatal for the session.
    #[error("connection lost: unmatched response threshold exceeded")]
    ConnectionLost,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Failures of decoding a single response frame into a measurement.
///
/// Never fatal: the offending sample is dropped, the session stays alive.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// Leading identifier bytes do not map to any catalogued quantity.
    #[error("unknown response identifier '{0}'")]
    UnknownIdentifier(String),

    /// Payload is shorter than the quantity's expected byte width.
    #[error("malformed payload for {pid}: expected {expected} bytes, got {actual}")]
    MalformedPayload {
        pid: &'static str,
        expected: usize,
        actual: usize,
    },

    /// A value byte was not valid hexadecimal text.
    #[error("invalid hex in response payload: '{0}'")]
    InvalidHex(String),

    /// The adapter answered with an explicit no-data marker.
    #[error("adapter reported no data for this request")]
    NoData,
}
