//! Post classification.
//!
//! A post is only interesting when its author is a member and it carries at
//! least one image. Two reserved alt texts then steer it:
//!
//! | Alt text | Effect |
//! |----------|--------|
//! | `wmset`  | the image becomes the author's reference watermark |
//! | `nown`   | the author opts this post out of watermarking |
//!
//! `wmset` wins when both are present. Matches are exact and case-sensitive.

use crate::membership::MembershipCache;
use skymark_core::PostRecord;

/// Alt text that registers an image as the author's watermark.
pub const ALT_SET_WATERMARK_IMAGE: &str = "wmset";

/// Alt text that opts a post out of watermarking.
pub const ALT_SKIP_WATERMARKING: &str = "nown";

/// What to do with a post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Classification {
    /// No action.
    NotOfInterest,

    /// Register the image as a reference watermark.
    WatermarkReference,

    /// Watermark the post's images.
    WatermarkableContent,
}

impl Classification {
    /// Metric label value.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotOfInterest => "not_of_interest",
            Self::WatermarkReference => "watermark_reference",
            Self::WatermarkableContent => "watermarkable_content",
        }
    }
}

/// Classify a post written by `author`.
pub fn classify(post: &PostRecord, author: &str, members: &MembershipCache) -> Classification {
    if !members.contains(author) || !post.has_image() {
        return Classification::NotOfInterest;
    }

    let mut skip = false;
    for alt in post.alt_texts() {
        if alt == ALT_SET_WATERMARK_IMAGE {
            return Classification::WatermarkReference;
        }
        skip |= alt == ALT_SKIP_WATERMARKING;
    }

    if skip {
        Classification::NotOfInterest
    } else {
        Classification::WatermarkableContent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skymark_core::testing::{ImageSpec, encode_post};
    use skymark_core::{POST_COLLECTION, Record};

    const MEMBER: &str = "did:plc:member";

    fn post(images: &[ImageSpec<'_>]) -> PostRecord {
        let bytes = encode_post("caption", images);
        match Record::decode(POST_COLLECTION, &bytes).unwrap() {
            Some(Record::Post(post)) => post,
            other => panic!("expected a post, got {other:?}"),
        }
    }

    fn members() -> MembershipCache {
        MembershipCache::from_members([MEMBER])
    }

    #[test]
    fn test_member_image_post_is_watermarkable() {
        let post = post(&[ImageSpec::new(Some("a cat"), "image/jpeg")]);
        assert_eq!(
            classify(&post, MEMBER, &members()),
            Classification::WatermarkableContent
        );
    }

    #[test]
    fn test_post_without_images_is_not_of_interest() {
        let post = post(&[]);
        assert_eq!(
            classify(&post, MEMBER, &members()),
            Classification::NotOfInterest
        );
    }

    #[test]
    fn test_non_image_media_is_not_of_interest() {
        let post = post(&[ImageSpec::new(None, "video/mp4")]);
        assert_eq!(
            classify(&post, MEMBER, &members()),
            Classification::NotOfInterest
        );
    }

    #[test]
    fn test_non_member_is_not_of_interest_regardless_of_tags() {
        for alt in [None, Some(ALT_SET_WATERMARK_IMAGE), Some(ALT_SKIP_WATERMARKING)] {
            let post = post(&[ImageSpec::new(alt, "image/png")]);
            assert_eq!(
                classify(&post, "did:plc:stranger", &members()),
                Classification::NotOfInterest
            );
        }
    }

    #[test]
    fn test_wmset_is_reference() {
        let post = post(&[
            ImageSpec::new(None, "image/png"),
            ImageSpec::new(Some(ALT_SET_WATERMARK_IMAGE), "image/png"),
        ]);
        assert_eq!(
            classify(&post, MEMBER, &members()),
            Classification::WatermarkReference
        );
    }

    #[test]
    fn test_wmset_wins_over_nown() {
        let post = post(&[
            ImageSpec::new(Some(ALT_SKIP_WATERMARKING), "image/png"),
            ImageSpec::new(Some(ALT_SET_WATERMARK_IMAGE), "image/png"),
        ]);
        assert_eq!(
            classify(&post, MEMBER, &members()),
            Classification::WatermarkReference
        );
    }

    #[test]
    fn test_nown_opts_out() {
        let post = post(&[
            ImageSpec::new(Some("sunset"), "image/jpeg"),
            ImageSpec::new(Some(ALT_SKIP_WATERMARKING), "image/jpeg"),
        ]);
        assert_eq!(
            classify(&post, MEMBER, &members()),
            Classification::NotOfInterest
        );
    }

    #[test]
    fn test_tags_are_exact_and_case_sensitive() {
        for alt in ["WMSET", "wmset ", "please nown"] {
            let post = post(&[ImageSpec::new(Some(alt), "image/png")]);
            assert_eq!(
                classify(&post, MEMBER, &members()),
                Classification::WatermarkableContent,
                "alt {alt:?}"
            );
        }
    }
}
