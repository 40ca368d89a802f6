//! AT-URI handling for repository records.
//!
//! Firehose operations carry a repository path of the form
//! `<collection>/<rkey>`; combined with the commit's repo DID it names the
//! record as `at://<did>/<collection>/<rkey>`.

use crate::error::{Error, Result};
use std::fmt;

const SCHEME: &str = "at://";

/// A resolved record identifier: `at://<authority>/<collection>/<rkey>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AtUri {
    authority: String,
    collection: String,
    rkey: String,
}

impl AtUri {
    /// Build a URI from a commit's repo DID and an operation path.
    pub fn from_repo_path(repo: &str, path: &str) -> Result<Self> {
        let invalid = |reason| Error::InvalidUri {
            uri: format!("{SCHEME}{repo}/{path}"),
            reason,
        };

        if repo.is_empty() {
            return Err(invalid("empty repository"));
        }
        let (collection, rkey) = path.split_once('/').ok_or_else(|| invalid("missing rkey"))?;
        if collection.is_empty() {
            return Err(invalid("empty collection"));
        }
        if rkey.is_empty() || rkey.contains('/') {
            return Err(invalid("invalid rkey"));
        }

        Ok(Self {
            authority: repo.to_string(),
            collection: collection.to_string(),
            rkey: rkey.to_string(),
        })
    }

    /// The repository DID (or handle) that owns the record.
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// The collection NSID, e.g. `app.bsky.feed.post`.
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// The record key within the collection.
    pub fn rkey(&self) -> &str {
        &self.rkey
    }
}

impl fmt::Display for AtUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{SCHEME}{}/{}/{}",
            self.authority, self.collection, self.rkey
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_repo_path() {
        let uri = AtUri::from_repo_path("did:plc:abc123", "app.bsky.feed.post/3kabc").unwrap();
        assert_eq!(uri.authority(), "did:plc:abc123");
        assert_eq!(uri.collection(), "app.bsky.feed.post");
        assert_eq!(uri.rkey(), "3kabc");
        assert_eq!(
            uri.to_string(),
            "at://did:plc:abc123/app.bsky.feed.post/3kabc"
        );
    }

    #[test]
    fn test_missing_rkey_rejected() {
        let err = AtUri::from_repo_path("did:plc:abc", "app.bsky.feed.post").unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidUri {
                reason: "missing rkey",
                ..
            }
        ));
    }

    #[test]
    fn test_nested_rkey_rejected() {
        assert!(AtUri::from_repo_path("did:plc:abc", "app.bsky.feed.post/a/b").is_err());
    }

    #[test]
    fn test_empty_parts_rejected() {
        assert!(AtUri::from_repo_path("", "app.bsky.feed.post/a").is_err());
        assert!(AtUri::from_repo_path("did:plc:abc", "/a").is_err());
        assert!(AtUri::from_repo_path("did:plc:abc", "app.bsky.feed.post/").is_err());
    }
}
