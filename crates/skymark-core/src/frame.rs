//! Firehose frame decoding.
//!
//! Each binary WebSocket message from `com.atproto.sync.subscribeRepos` is a
//! pair of concatenated CBOR objects:
//!
//! ```text
//! [header: {op: 1, t: "#commit"}][body: DAG-CBOR commit]
//! [header: {op: -1}]             [body: {error, message}]
//! ```
//!
//! The header is read with ciborium, which stops exactly at the end of the
//! first object; the remainder is handed to serde_ipld_dagcbor so CID links
//! decode natively.

use crate::error::{Error, Result};
use ipld_core::cid::Cid;
use serde::Deserialize;
use std::io::Cursor;

/// Message type of repository commit frames.
pub const COMMIT_MESSAGE_TYPE: &str = "#commit";

const OP_MESSAGE: i64 = 1;
const OP_ERROR: i64 = -1;

/// One unit of stream data, exactly as delivered by the source.
///
/// `index` is assigned by the source in delivery order. The stream's own
/// sequence number is inside the payload and only known after decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Delivery sequence number assigned by the source.
    pub index: u64,

    /// Raw binary message.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a new frame.
    pub fn new(index: u64, payload: Vec<u8>) -> Self {
        Self { index, payload }
    }

    /// Decode this frame's payload.
    pub fn decode(&self) -> Result<StreamMessage> {
        decode_frame(&self.payload)
    }
}

#[derive(Debug, Deserialize)]
struct FrameHeader {
    op: i64,
    #[serde(default)]
    t: Option<String>,
}

/// Body of an error frame (`op == -1`).
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorBody {
    /// Error name, e.g. `FutureCursor`.
    pub error: String,

    /// Optional human-readable detail.
    #[serde(default)]
    pub message: Option<String>,
}

/// A decoded firehose message.
#[derive(Debug)]
pub enum StreamMessage {
    /// A repository commit.
    Commit(Commit),

    /// The stream reported an error.
    Error(ErrorBody),

    /// Any other message type (`#identity`, `#account`, `#sync`, `#info`, ...).
    Other(String),
}

/// A repository commit event.
#[derive(Debug, Clone, Deserialize)]
pub struct Commit {
    /// Stream sequence number.
    pub seq: i64,

    /// DID of the repository (the author).
    pub repo: String,

    /// Operations in commit order.
    #[serde(default)]
    pub ops: Vec<RepoOp>,

    /// CAR slice containing the blocks referenced by `ops`.
    #[serde(default, with = "serde_bytes")]
    pub blocks: Vec<u8>,

    /// Commit timestamp (ISO-8601).
    #[serde(default)]
    pub time: Option<String>,

    /// Set when the commit was too large to include its blocks.
    #[serde(default, rename = "tooBig")]
    pub too_big: bool,
}

impl Commit {
    /// Whether the commit carries any block content.
    pub fn has_blocks(&self) -> bool {
        !self.blocks.is_empty()
    }
}

/// Kind of mutation performed by an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Create,
    Update,
    Delete,
}

impl Action {
    /// Parse the wire value. Unknown actions yield `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// One mutation within a commit.
#[derive(Debug, Clone, Deserialize)]
pub struct RepoOp {
    /// Raw action string (`create`, `update`, `delete`).
    pub action: String,

    /// Repository path: `<collection>/<rkey>`.
    pub path: String,

    /// CID of the new record (create/update only).
    #[serde(default)]
    pub cid: Option<Cid>,
}

impl RepoOp {
    /// The parsed action, or `None` for unknown values.
    pub fn action(&self) -> Option<Action> {
        Action::parse(&self.action)
    }

    /// Collection NSID part of the path.
    pub fn collection(&self) -> &str {
        self.path
            .split_once('/')
            .map_or(self.path.as_str(), |(collection, _)| collection)
    }
}

/// Decode a raw firehose message.
pub fn decode_frame(payload: &[u8]) -> Result<StreamMessage> {
    let mut cursor = Cursor::new(payload);
    let header: FrameHeader = ciborium::de::from_reader(&mut cursor)
        .map_err(|e| Error::HeaderDecode(e.to_string()))?;
    let body = &payload[cursor.position() as usize..];

    match header.op {
        OP_MESSAGE => match header.t.as_deref() {
            Some(COMMIT_MESSAGE_TYPE) => {
                let commit: Commit = serde_ipld_dagcbor::from_slice(body)
                    .map_err(|e| Error::BodyDecode(e.to_string()))?;
                Ok(StreamMessage::Commit(commit))
            }
            Some(other) => Ok(StreamMessage::Other(other.to_string())),
            None => Err(Error::HeaderDecode(
                "message frame without type".to_string(),
            )),
        },
        OP_ERROR => {
            let error: ErrorBody = serde_ipld_dagcbor::from_slice(body)
                .map_err(|e| Error::BodyDecode(e.to_string()))?;
            Ok(StreamMessage::Error(error))
        }
        op => Err(Error::UnsupportedFrame { op }),
    }
}
