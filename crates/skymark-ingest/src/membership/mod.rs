//! Membership cache: the set of accounts the bot follows.
//!
//! Workers consult the cache for every post; the dispatcher rebuilds it
//! periodically. A rebuild assembles the complete new set first and then
//! swaps it in with a single atomic pointer store, so a reader sees either
//! the old set or the new one and never blocks.

mod bsky;

pub use bsky::BskyFollowsClient;

use crate::{Error, Result};
use arc_swap::ArcSwap;
use skymark_core::metrics::{increment_labeled, set_gauge};
use std::collections::HashSet;
use std::sync::Arc;

/// Lock-free, wholesale-replaced set of member DIDs.
#[derive(Debug, Default)]
pub struct MembershipCache {
    members: ArcSwap<HashSet<String>>,
}

impl MembershipCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a cache holding `members`.
    pub fn from_members<I, S>(members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let cache = Self::new();
        cache.replace(members.into_iter().map(Into::into).collect());
        cache
    }

    /// Whether `did` is a member of the current snapshot.
    pub fn contains(&self, did: &str) -> bool {
        self.members.load().contains(did)
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<HashSet<String>> {
        self.members.load_full()
    }

    /// Atomically replace the whole set.
    pub fn replace(&self, members: HashSet<String>) {
        self.members.store(Arc::new(members));
    }

    /// Number of members in the current snapshot.
    pub fn len(&self) -> usize {
        self.members.load().len()
    }

    /// Whether the current snapshot is empty.
    pub fn is_empty(&self) -> bool {
        self.members.load().is_empty()
    }
}

/// One page of an account's follows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FollowsPage {
    /// DIDs of followed accounts on this page.
    pub dids: Vec<String>,

    /// Cursor for the next page; absent or empty on the last page.
    pub cursor: Option<String>,
}

/// A paginated listing of the accounts an actor follows.
pub trait FollowsSource: Send + Sync {
    /// Fetch one page, starting after `cursor`.
    fn fetch_page(&self, actor: &str, cursor: Option<&str>) -> Result<FollowsPage>;
}

impl<T: FollowsSource + ?Sized> FollowsSource for Arc<T> {
    fn fetch_page(&self, actor: &str, cursor: Option<&str>) -> Result<FollowsPage> {
        (**self).fetch_page(actor, cursor)
    }
}

/// Rebuilds a [`MembershipCache`] from a [`FollowsSource`].
pub struct MembershipRefresher<S> {
    source: S,
    actor: String,
    cache: Arc<MembershipCache>,
}

impl<S: FollowsSource> MembershipRefresher<S> {
    /// Create a refresher listing `actor`'s follows into `cache`.
    pub fn new(source: S, actor: impl Into<String>, cache: Arc<MembershipCache>) -> Self {
        Self {
            source,
            actor: actor.into(),
            cache,
        }
    }

    /// List every follow and swap the result into the cache.
    ///
    /// On error the cache keeps its previous snapshot. Returns the new
    /// member count.
    pub fn refresh(&self) -> Result<usize> {
        match self.fetch_all() {
            Ok(members) => {
                let count = members.len();
                self.cache.replace(members);
                increment_labeled("listener_membership_refresh_total", "result", "ok");
                set_gauge("listener_membership_size", count as f64);
                tracing::info!("Membership refreshed: {} accounts", count);
                Ok(count)
            }
            Err(e) => {
                increment_labeled("listener_membership_refresh_total", "result", "error");
                Err(e)
            }
        }
    }

    fn fetch_all(&self) -> Result<HashSet<String>> {
        let mut members = HashSet::new();
        let mut seen_cursors = HashSet::new();
        let mut cursor: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let page = self.source.fetch_page(&self.actor, cursor.as_deref())?;
            pages += 1;
            members.extend(page.dids);

            match page.cursor.filter(|c| !c.is_empty()) {
                None => break,
                Some(next) => {
                    if !seen_cursors.insert(next.clone()) {
                        return Err(Error::Membership(format!(
                            "follows listing repeated cursor '{next}' after {pages} pages"
                        )));
                    }
                    cursor = Some(next);
                }
            }
        }

        tracing::debug!("Listed {} follows in {} pages", members.len(), pages);
        Ok(members)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    /// Serves canned pages keyed by request cursor.
    struct FakeFollows {
        pages: Vec<(Option<&'static str>, FollowsPage)>,
        requests: Mutex<Vec<Option<String>>>,
        fail: AtomicBool,
    }

    impl FakeFollows {
        fn new(pages: Vec<(Option<&'static str>, FollowsPage)>) -> Self {
            Self {
                pages,
                requests: Mutex::new(Vec::new()),
                fail: AtomicBool::new(false),
            }
        }
    }

    impl FollowsSource for FakeFollows {
        fn fetch_page(&self, actor: &str, cursor: Option<&str>) -> Result<FollowsPage> {
            assert_eq!(actor, "did:plc:bot");
            self.requests.lock().push(cursor.map(str::to_string));
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::Membership("upstream unavailable".to_string()));
            }
            self.pages
                .iter()
                .find(|(key, _)| *key == cursor)
                .map(|(_, page)| page.clone())
                .ok_or_else(|| Error::Membership(format!("no page for {cursor:?}")))
        }
    }

    fn page(dids: &[&str], cursor: Option<&str>) -> FollowsPage {
        FollowsPage {
            dids: dids.iter().map(|d| d.to_string()).collect(),
            cursor: cursor.map(str::to_string),
        }
    }

    #[test]
    fn test_cache_contains_and_replace() {
        let cache = MembershipCache::from_members(["did:plc:a", "did:plc:b"]);
        assert_eq!(cache.len(), 2);
        assert!(cache.contains("did:plc:a"));
        assert!(!cache.contains("did:plc:c"));

        let old = cache.snapshot();
        cache.replace(HashSet::from(["did:plc:c".to_string()]));
        assert!(cache.contains("did:plc:c"));
        assert!(!cache.contains("did:plc:a"));
        assert_eq!(old.len(), 2, "earlier snapshots are unaffected");
    }

    #[test]
    fn test_refresh_follows_pagination() {
        let source = Arc::new(FakeFollows::new(vec![
            (None, page(&["did:plc:a", "did:plc:b"], Some("c1"))),
            (Some("c1"), page(&["did:plc:c"], Some("c2"))),
            (Some("c2"), page(&["did:plc:d"], Some(""))),
        ]));
        let cache = Arc::new(MembershipCache::new());
        let refresher =
            MembershipRefresher::new(Arc::clone(&source), "did:plc:bot", Arc::clone(&cache));

        assert_eq!(refresher.refresh().unwrap(), 4);
        assert!(cache.contains("did:plc:d"));
        assert_eq!(
            *source.requests.lock(),
            vec![None, Some("c1".to_string()), Some("c2".to_string())]
        );
    }

    #[test]
    fn test_repeated_cursor_is_an_error() {
        let source = FakeFollows::new(vec![
            (None, page(&["did:plc:a"], Some("loop"))),
            (Some("loop"), page(&["did:plc:b"], Some("loop"))),
        ]);
        let cache = Arc::new(MembershipCache::from_members(["did:plc:old"]));
        let refresher = MembershipRefresher::new(source, "did:plc:bot", Arc::clone(&cache));

        assert!(matches!(refresher.refresh(), Err(Error::Membership(_))));
        assert!(cache.contains("did:plc:old"));
    }

    #[test]
    fn test_failed_refresh_keeps_previous_snapshot() {
        let source = Arc::new(FakeFollows::new(vec![(None, page(&["did:plc:a"], None))]));
        let cache = Arc::new(MembershipCache::new());
        let refresher =
            MembershipRefresher::new(Arc::clone(&source), "did:plc:bot", Arc::clone(&cache));

        refresher.refresh().unwrap();
        source.fail.store(true, Ordering::SeqCst);
        assert!(refresher.refresh().is_err());
        assert_eq!(cache.len(), 1);
        assert!(cache.contains("did:plc:a"));
    }

    #[test]
    fn test_replace_is_atomic_under_concurrent_readers() {
        let old: HashSet<String> = (0..1000).map(|i| format!("did:plc:old{i}")).collect();
        let new: HashSet<String> = (0..1000).map(|i| format!("did:plc:new{i}")).collect();
        let cache = Arc::new(MembershipCache::new());
        cache.replace(old.clone());

        let done = Arc::new(AtomicBool::new(false));
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let done = Arc::clone(&done);
                thread::spawn(move || {
                    let mut observed = 0usize;
                    loop {
                        let finished = done.load(Ordering::SeqCst);
                        let snapshot = cache.snapshot();
                        let olds = snapshot.iter().filter(|d| d.contains("old")).count();
                        let news = snapshot.len() - olds;
                        assert!(
                            (olds == 1000 && news == 0) || (olds == 0 && news == 1000),
                            "partial snapshot: {olds} old, {news} new"
                        );
                        observed += 1;
                        if finished {
                            break observed;
                        }
                    }
                })
            })
            .collect();

        for round in 0..200 {
            cache.replace(if round % 2 == 0 { new.clone() } else { old.clone() });
        }
        done.store(true, Ordering::SeqCst);

        for reader in readers {
            assert!(reader.join().unwrap() > 0);
        }
    }
}
