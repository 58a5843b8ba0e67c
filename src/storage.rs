use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::domain::{Review, ReviewId, ThreadHandle, TrackedReview};

/// Last observed (and already notified) state of every review, keyed by id.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReviewCache {
    entries: BTreeMap<ReviewId, TrackedReview>,
}

impl ReviewCache {
    pub fn get(&self, id: ReviewId) -> Option<&TrackedReview> {
        self.entries.get(&id)
    }

    #[cfg(test)]
    pub fn contains(&self, id: ReviewId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn insert(&mut self, tracked: TrackedReview) {
        self.entries.insert(tracked.id(), tracked);
    }

    pub fn thread(&self, id: ReviewId) -> Option<&ThreadHandle> {
        self.entries.get(&id).and_then(|entry| entry.thread.as_ref())
    }

    /// Records the thread created for a review. An existing handle is kept.
    pub fn attach_thread(&mut self, id: ReviewId, handle: ThreadHandle) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) if entry.thread.is_none() => {
                entry.thread = Some(handle);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrackedReview> {
        self.entries.values()
    }

    /// Pairs each freshly fetched review with the thread handle cached under
    /// the same id. Reviews without a cache counterpart start untracked.
    pub fn carry_threads(&self, fetched: Vec<Review>) -> Vec<TrackedReview> {
        fetched
            .into_iter()
            .map(|review| {
                let thread = self.thread(review.id).cloned();
                TrackedReview { review, thread }
            })
            .collect()
    }
}

impl FromIterator<TrackedReview> for ReviewCache {
    fn from_iter<I: IntoIterator<Item = TrackedReview>>(iter: I) -> Self {
        let mut cache = Self::default();
        for tracked in iter {
            cache.insert(tracked);
        }
        cache
    }
}

/// Durable home of the [`ReviewCache`]: one JSON array, rewritten every cycle.
pub struct CacheStore {
    path: PathBuf,
}

impl CacheStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the stored cache. Missing or unreadable storage yields an empty
    /// cache, equivalent to a first-ever run.
    pub fn load(&self) -> ReviewCache {
        match self.read_entries() {
            Ok(entries) => {
                info!(path = %self.path.display(), reviews = entries.len(), "Loaded review cache");
                entries.into_iter().collect()
            }
            Err(CacheError::Io(err)) if err.kind() == io::ErrorKind::NotFound => {
                warn!(path = %self.path.display(), "No review cache found; starting empty");
                ReviewCache::default()
            }
            Err(err) => {
                error!(path = %self.path.display(), error = %err, "Could not read review cache; starting empty");
                ReviewCache::default()
            }
        }
    }

    /// Overwrites storage by writing a sibling temp file and renaming it over
    /// the target, so a crash never leaves a truncated cache behind.
    pub fn save(&self, cache: &ReviewCache) -> Result<(), CacheError> {
        let entries: Vec<&TrackedReview> = cache.iter().collect();
        let data = serde_json::to_string_pretty(&entries)?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            fs::create_dir_all(parent)?;
        }

        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, data)?;
        fs::rename(&temp_path, &self.path)?;
        debug!(path = %self.path.display(), reviews = entries.len(), "Persisted review cache");
        Ok(())
    }

    fn read_entries(&self) -> Result<Vec<TrackedReview>, CacheError> {
        let contents = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("I/O error while handling the review cache: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to (de)serialize the review cache: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::domain::{TestStatus, Vote};

    pub(crate) fn review(id: ReviewId) -> Review {
        Review {
            id,
            author: "alice".into(),
            description: format!("Review {id}\nbody"),
            created: 1_700_000_000,
            updated: 1_700_000_000,
            state: "needsReview".into(),
            state_label: Some("Needs Review".into()),
            test_status: TestStatus::None,
            changes: vec![10, 11],
            commits: Vec::new(),
            votes: Vec::new(),
            participants: vec!["alice".into(), "bob".into()],
        }
    }

    fn handle(ts: &str) -> ThreadHandle {
        ThreadHandle {
            channel: "C1".into(),
            ts: ts.into(),
        }
    }

    #[test]
    fn save_then_load_round_trips_thread_handles() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CacheStore::new(dir.path().join("review-cache.json"));

        let mut voted = review(2);
        voted.votes.push(Vote {
            user: "bob".into(),
            value: 1,
            version: 1,
            is_stale: false,
        });
        let cache: ReviewCache = [
            TrackedReview {
                review: review(1),
                thread: Some(handle("111.1")),
            },
            TrackedReview::untracked(voted),
        ]
        .into_iter()
        .collect();

        store.save(&cache).expect("save");
        assert_eq!(store.load(), cache);
        assert!(!dir.path().join("review-cache.json.tmp").exists());
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CacheStore::new(dir.path().join("absent.json"));
        assert!(store.load().is_empty());
    }

    #[test]
    fn corrupt_file_loads_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("review-cache.json");
        fs::write(&path, "[{ not json").expect("write");
        assert!(CacheStore::new(path).load().is_empty());
    }

    #[test]
    fn save_creates_missing_parent_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CacheStore::new(dir.path().join("state").join("cache.json"));
        store.save(&ReviewCache::default()).expect("save");
        assert!(store.path().exists());
    }

    #[test]
    fn carry_threads_matches_by_id() {
        let cache: ReviewCache = [TrackedReview {
            review: review(42),
            thread: Some(handle("42.0")),
        }]
        .into_iter()
        .collect();

        let carried = cache.carry_threads(vec![review(42), review(43)]);
        assert_eq!(carried[0].thread, Some(handle("42.0")));
        assert_eq!(carried[1].thread, None);
    }

    #[test]
    fn attach_thread_never_replaces_existing_handle() {
        let mut cache: ReviewCache = [TrackedReview::untracked(review(5))].into_iter().collect();
        assert!(cache.attach_thread(5, handle("first")));
        assert!(!cache.attach_thread(5, handle("second")));
        assert_eq!(cache.thread(5), Some(&handle("first")));
        assert!(!cache.attach_thread(6, handle("orphan")));
    }
}
