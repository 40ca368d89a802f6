//! Error types for firehose decoding.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while decoding firehose data.
#[derive(Error, Debug)]
pub enum Error {
    /// The CBOR frame header could not be decoded.
    #[error("frame header decode error: {0}")]
    HeaderDecode(String),

    /// The DAG-CBOR frame body could not be decoded.
    #[error("frame body decode error: {0}")]
    BodyDecode(String),

    /// The frame header carried an op code we do not understand.
    #[error("unsupported frame op {op}")]
    UnsupportedFrame {
        /// The op code from the header.
        op: i64,
    },

    /// The commit's CAR block payload is malformed.
    #[error("CAR decode error: {0}")]
    Car(String),

    /// A record block is not valid DAG-CBOR for the expected shape.
    #[error("record decode error: {0}")]
    RecordDecode(String),

    /// A record's `$type` does not match the collection it was written to.
    #[error("record type mismatch: expected {expected}, found {found}")]
    RecordTypeMismatch {
        /// The collection NSID the record was written under.
        expected: String,
        /// The `$type` carried by the record.
        found: String,
    },

    /// An AT-URI or repository path is malformed.
    #[error("invalid AT-URI '{uri}': {reason}")]
    InvalidUri {
        /// The offending input.
        uri: String,
        /// Description of what's wrong.
        reason: &'static str,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
