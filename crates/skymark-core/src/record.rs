//! Typed `app.bsky.*` records.
//!
//! Only the fields the listener looks at are modelled; everything else
//! (facets, langs, reply refs, blob links) is skipped during decoding. A
//! record whose `$type` does not equal the collection it was written to is
//! rejected.

use crate::error::{Error, Result};
use serde::Deserialize;
use serde::de::DeserializeOwned;

/// Collection NSID for posts.
pub const POST_COLLECTION: &str = "app.bsky.feed.post";

/// Collection NSID for follows.
pub const FOLLOW_COLLECTION: &str = "app.bsky.graph.follow";

const IMAGE_MIME_PREFIX: &str = "image/";

/// A decoded record of a kind the listener understands.
#[derive(Debug, Clone)]
pub enum Record {
    Post(PostRecord),
    Follow(FollowRecord),
}

impl Record {
    /// Decode a record block written to `collection`.
    ///
    /// Returns `Ok(None)` for collections that have no typed model here.
    pub fn decode(collection: &str, bytes: &[u8]) -> Result<Option<Self>> {
        match collection {
            POST_COLLECTION => decode_typed::<PostRecord>(collection, bytes)
                .map(|post| Some(Self::Post(post))),
            FOLLOW_COLLECTION => decode_typed::<FollowRecord>(collection, bytes)
                .map(|follow| Some(Self::Follow(follow))),
            _ => Ok(None),
        }
    }

    /// The record's `$type`.
    pub fn record_type(&self) -> &str {
        match self {
            Self::Post(post) => &post.record_type,
            Self::Follow(follow) => &follow.record_type,
        }
    }
}

trait Typed {
    fn record_type(&self) -> &str;
}

fn decode_typed<T>(collection: &str, bytes: &[u8]) -> Result<T>
where
    T: DeserializeOwned + Typed,
{
    let record: T =
        serde_ipld_dagcbor::from_slice(bytes).map_err(|e| Error::RecordDecode(e.to_string()))?;
    if record.record_type() != collection {
        return Err(Error::RecordTypeMismatch {
            expected: collection.to_string(),
            found: record.record_type().to_string(),
        });
    }
    Ok(record)
}

/// An `app.bsky.feed.post` record.
#[derive(Debug, Clone, Deserialize)]
pub struct PostRecord {
    #[serde(rename = "$type")]
    pub record_type: String,

    /// Client-declared creation time (ISO-8601), passed through verbatim.
    #[serde(rename = "createdAt")]
    pub created_at: String,

    #[serde(default)]
    pub text: String,

    #[serde(default)]
    pub embed: Option<Embed>,
}

impl PostRecord {
    /// Images embedded directly in the post (`app.bsky.embed.images`).
    ///
    /// Other embed kinds have no `images` field and yield an empty slice.
    pub fn images(&self) -> &[EmbeddedImage] {
        self.embed
            .as_ref()
            .map(|embed| embed.images.as_slice())
            .unwrap_or_default()
    }

    /// Whether at least one embedded image declares an `image/*` media type.
    pub fn has_image(&self) -> bool {
        self.images().iter().any(EmbeddedImage::is_image)
    }

    /// Alt texts of embedded images that set one.
    pub fn alt_texts(&self) -> impl Iterator<Item = &str> {
        self.images().iter().filter_map(|image| image.alt.as_deref())
    }
}

impl Typed for PostRecord {
    fn record_type(&self) -> &str {
        &self.record_type
    }
}

/// The `embed` union of a post, reduced to what image detection needs.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Embed {
    #[serde(rename = "$type", default)]
    pub embed_type: Option<String>,

    #[serde(default)]
    pub images: Vec<EmbeddedImage>,
}

/// One entry of `app.bsky.embed.images#image`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EmbeddedImage {
    #[serde(default)]
    pub alt: Option<String>,

    #[serde(default)]
    pub image: Option<BlobRef>,
}

impl EmbeddedImage {
    /// Whether the blob declares an `image/*` media type.
    pub fn is_image(&self) -> bool {
        self.image
            .as_ref()
            .is_some_and(|blob| blob.mime_type.starts_with(IMAGE_MIME_PREFIX))
    }
}

/// A blob reference. The CID link itself is not needed and is skipped.
#[derive(Debug, Clone, Deserialize)]
pub struct BlobRef {
    #[serde(rename = "mimeType")]
    pub mime_type: String,
}

/// An `app.bsky.graph.follow` record.
#[derive(Debug, Clone, Deserialize)]
pub struct FollowRecord {
    #[serde(rename = "$type")]
    pub record_type: String,

    /// DID of the followed account.
    pub subject: String,

    #[serde(rename = "createdAt")]
    pub created_at: String,
}

impl Typed for FollowRecord {
    fn record_type(&self) -> &str {
        &self.record_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ImageSpec, encode_follow, encode_post, encode_typed_post};

    #[test]
    fn test_decode_post_with_images() {
        let bytes = encode_post(
            "sunset",
            &[
                ImageSpec::new(Some("wmset"), "image/png"),
                ImageSpec::new(None, "image/jpeg"),
            ],
        );

        let Some(Record::Post(post)) = Record::decode(POST_COLLECTION, &bytes).unwrap() else {
            panic!("expected a post");
        };
        assert_eq!(post.text, "sunset");
        assert_eq!(post.images().len(), 2);
        assert!(post.has_image());
        assert_eq!(post.alt_texts().collect::<Vec<_>>(), vec!["wmset"]);
    }

    #[test]
    fn test_post_without_embed_has_no_image() {
        let bytes = encode_post("just text", &[]);
        let Some(Record::Post(post)) = Record::decode(POST_COLLECTION, &bytes).unwrap() else {
            panic!("expected a post");
        };
        assert!(post.embed.is_none());
        assert!(post.images().is_empty());
        assert!(!post.has_image());
    }

    #[test]
    fn test_non_image_mime_is_not_an_image() {
        let bytes = encode_post("clip", &[ImageSpec::new(None, "video/mp4")]);
        let Some(Record::Post(post)) = Record::decode(POST_COLLECTION, &bytes).unwrap() else {
            panic!("expected a post");
        };
        assert_eq!(post.images().len(), 1);
        assert!(!post.has_image());
    }

    #[test]
    fn test_decode_follow() {
        let bytes = encode_follow("did:plc:subject");
        let Some(Record::Follow(follow)) = Record::decode(FOLLOW_COLLECTION, &bytes).unwrap()
        else {
            panic!("expected a follow");
        };
        assert_eq!(follow.subject, "did:plc:subject");
        assert_eq!(follow.record_type, FOLLOW_COLLECTION);
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let bytes = encode_typed_post("app.bsky.feed.like", "oops", &[]);
        let err = Record::decode(POST_COLLECTION, &bytes).unwrap_err();
        assert!(matches!(err, Error::RecordTypeMismatch { .. }));
    }

    #[test]
    fn test_unknown_collection_is_none() {
        let bytes = encode_post("hello", &[]);
        assert!(
            Record::decode("app.bsky.feed.like", &bytes)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_garbage_is_decode_error() {
        let err = Record::decode(POST_COLLECTION, b"not cbor at all").unwrap_err();
        assert!(matches!(err, Error::RecordDecode(_)));
    }
}
