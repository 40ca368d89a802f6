//! Fixture encoders for tests.
//!
//! Builds real firehose payloads (CBOR header + DAG-CBOR commit body with an
//! embedded CAR slice) so decoding is exercised end to end. Enabled for this
//! crate's own tests and, through the `test-util` feature, for downstream
//! crates.

use crate::frame::{COMMIT_MESSAGE_TYPE, Frame};
use crate::record::{FOLLOW_COLLECTION, POST_COLLECTION};
use ipld_core::cid::Cid;
use ipld_core::cid::multihash::Multihash;
use serde::Serialize;

/// Multicodec for DAG-CBOR.
const DAG_CBOR_CODEC: u64 = 0x71;
/// Multihash code for sha2-256.
const SHA2_256_CODE: u64 = 0x12;

/// Fixed timestamp used by fixture records.
pub const FIXTURE_CREATED_AT: &str = "2024-11-05T09:30:00.000Z";

/// A deterministic CIDv1 whose digest encodes `n`.
///
/// The digest is not a real hash of anything; nothing on the read path
/// verifies it.
pub fn test_cid(n: u64) -> Cid {
    let mut digest = [0u8; 32];
    digest[..8].copy_from_slice(&n.to_be_bytes());
    digest[8..16].copy_from_slice(&(!n).to_be_bytes());
    let hash = Multihash::<64>::wrap(SHA2_256_CODE, &digest).expect("32-byte digest fits");
    Cid::new_v1(DAG_CBOR_CODEC, hash)
}

fn write_uvarint(out: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        out.push((value as u8) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

#[derive(Serialize)]
struct CarHeader {
    roots: Vec<Cid>,
    version: u64,
}

/// Encode a CAR v1 file with a single root.
pub fn encode_car(root: Cid, blocks: &[(Cid, Vec<u8>)]) -> Vec<u8> {
    let header = serde_ipld_dagcbor::to_vec(&CarHeader {
        roots: vec![root],
        version: 1,
    })
    .expect("CAR header encodes");

    let mut out = Vec::new();
    write_uvarint(&mut out, header.len() as u64);
    out.extend_from_slice(&header);

    for (cid, data) in blocks {
        let cid_bytes = cid.to_bytes();
        write_uvarint(&mut out, (cid_bytes.len() + data.len()) as u64);
        out.extend_from_slice(&cid_bytes);
        out.extend_from_slice(data);
    }
    out
}

/// An image to embed in a fixture post.
#[derive(Debug, Clone, Copy)]
pub struct ImageSpec<'a> {
    pub alt: Option<&'a str>,
    pub mime_type: &'a str,
}

impl<'a> ImageSpec<'a> {
    pub fn new(alt: Option<&'a str>, mime_type: &'a str) -> Self {
        Self { alt, mime_type }
    }
}

#[derive(Serialize)]
struct BlobBody<'a> {
    #[serde(rename = "$type")]
    blob_type: &'static str,
    #[serde(rename = "ref")]
    link: Cid,
    #[serde(rename = "mimeType")]
    mime_type: &'a str,
    size: u64,
}

#[derive(Serialize)]
struct ImageBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    alt: Option<&'a str>,
    image: BlobBody<'a>,
}

#[derive(Serialize)]
struct ImagesEmbedBody<'a> {
    #[serde(rename = "$type")]
    embed_type: &'static str,
    images: Vec<ImageBody<'a>>,
}

#[derive(Serialize)]
struct PostBody<'a> {
    #[serde(rename = "$type")]
    record_type: &'a str,
    text: &'a str,
    #[serde(rename = "createdAt")]
    created_at: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    embed: Option<ImagesEmbedBody<'a>>,
}

/// Encode an `app.bsky.feed.post` record. No images means no embed.
pub fn encode_post(text: &str, images: &[ImageSpec<'_>]) -> Vec<u8> {
    encode_typed_post(POST_COLLECTION, text, images)
}

/// Encode a post-shaped record with an arbitrary `$type`.
pub fn encode_typed_post(record_type: &str, text: &str, images: &[ImageSpec<'_>]) -> Vec<u8> {
    let embed = (!images.is_empty()).then(|| ImagesEmbedBody {
        embed_type: "app.bsky.embed.images",
        images: images
            .iter()
            .enumerate()
            .map(|(i, spec)| ImageBody {
                alt: spec.alt,
                image: BlobBody {
                    blob_type: "blob",
                    link: test_cid(0xb10b + i as u64),
                    mime_type: spec.mime_type,
                    size: 1024,
                },
            })
            .collect(),
    });

    serde_ipld_dagcbor::to_vec(&PostBody {
        record_type,
        text,
        created_at: FIXTURE_CREATED_AT,
        embed,
    })
    .expect("post record encodes")
}

#[derive(Serialize)]
struct FollowBody<'a> {
    #[serde(rename = "$type")]
    record_type: &'static str,
    subject: &'a str,
    #[serde(rename = "createdAt")]
    created_at: &'static str,
}

/// Encode an `app.bsky.graph.follow` record.
pub fn encode_follow(subject: &str) -> Vec<u8> {
    serde_ipld_dagcbor::to_vec(&FollowBody {
        record_type: FOLLOW_COLLECTION,
        subject,
        created_at: FIXTURE_CREATED_AT,
    })
    .expect("follow record encodes")
}

#[derive(Serialize)]
struct HeaderBody<'a> {
    op: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    t: Option<&'a str>,
}

fn encode_header(op: i64, t: Option<&str>) -> Vec<u8> {
    serde_ipld_dagcbor::to_vec(&HeaderBody { op, t }).expect("frame header encodes")
}

/// Encode a message frame of type `t` with an arbitrary body.
pub fn encode_message_frame<T: Serialize>(t: &str, body: &T) -> Vec<u8> {
    let mut out = encode_header(1, Some(t));
    out.extend(serde_ipld_dagcbor::to_vec(body).expect("frame body encodes"));
    out
}

#[derive(Serialize)]
struct ErrorFrameBody<'a> {
    error: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'a str>,
}

/// Encode an error frame (`op == -1`).
pub fn encode_error_frame(error: &str, message: Option<&str>) -> Vec<u8> {
    let mut out = encode_header(-1, None);
    out.extend(
        serde_ipld_dagcbor::to_vec(&ErrorFrameBody { error, message })
            .expect("error body encodes"),
    );
    out
}

#[derive(Serialize)]
struct OpBody {
    action: &'static str,
    path: String,
    cid: Option<Cid>,
}

#[derive(Serialize)]
struct CommitBody<'a> {
    seq: i64,
    repo: &'a str,
    ops: &'a [OpBody],
    #[serde(with = "serde_bytes")]
    blocks: Vec<u8>,
    time: &'a str,
    #[serde(rename = "tooBig")]
    too_big: bool,
}

/// Builder for `#commit` frames.
pub struct CommitBuilder {
    seq: i64,
    repo: String,
    ops: Vec<OpBody>,
    blocks: Vec<(Cid, Vec<u8>)>,
    include_blocks: bool,
    next_cid: u64,
}

impl CommitBuilder {
    pub fn new(seq: i64, repo: &str) -> Self {
        Self {
            seq,
            repo: repo.to_string(),
            ops: Vec::new(),
            blocks: Vec::new(),
            include_blocks: true,
            next_cid: (seq.unsigned_abs() << 16) + 1,
        }
    }

    fn allocate_cid(&mut self) -> Cid {
        let cid = test_cid(self.next_cid);
        self.next_cid += 1;
        cid
    }

    /// Add a create op whose record block is present.
    pub fn create(mut self, path: &str, record: Vec<u8>) -> Self {
        let cid = self.allocate_cid();
        self.blocks.push((cid, record));
        self.push_op("create", path, Some(cid));
        self
    }

    /// Add a create op whose CID has no matching block.
    pub fn create_dangling(mut self, path: &str) -> Self {
        let cid = self.allocate_cid();
        self.push_op("create", path, Some(cid));
        self
    }

    /// Add an update op whose record block is present.
    pub fn update(mut self, path: &str, record: Vec<u8>) -> Self {
        let cid = self.allocate_cid();
        self.blocks.push((cid, record));
        self.push_op("update", path, Some(cid));
        self
    }

    /// Add a delete op.
    pub fn delete(mut self, path: &str) -> Self {
        self.push_op("delete", path, None);
        self
    }

    /// Encode the commit with an empty `blocks` field.
    pub fn without_blocks(mut self) -> Self {
        self.include_blocks = false;
        self
    }

    fn push_op(&mut self, action: &'static str, path: &str, cid: Option<Cid>) {
        self.ops.push(OpBody {
            action,
            path: path.to_string(),
            cid,
        });
    }

    /// Encode the full frame payload.
    pub fn encode(self) -> Vec<u8> {
        let blocks = if self.include_blocks {
            encode_car(test_cid(u64::MAX), &self.blocks)
        } else {
            Vec::new()
        };

        encode_message_frame(
            COMMIT_MESSAGE_TYPE,
            &CommitBody {
                seq: self.seq,
                repo: &self.repo,
                ops: &self.ops,
                blocks,
                time: FIXTURE_CREATED_AT,
                too_big: false,
            },
        )
    }

    /// Encode into a [`Frame`] with the given delivery index.
    pub fn frame(self, index: u64) -> Frame {
        Frame::new(index, self.encode())
    }
}
