//! Change detection between two successive review snapshots.
//!
//! [`diff`] is pure: it never touches the network or disk, and the caller
//! decides what to do with the resulting events and next cache.

use chrono::{DateTime, TimeDelta, Utc};

use crate::{
    domain::{Review, ReviewId, TestStatus, TrackedReview},
    storage::ReviewCache,
};

/// Reviews first seen within this window of their creation are announced.
/// Older unseen reviews are adopted silently so an empty cache does not flood
/// the channel with every pre-existing review.
const NEW_REVIEW_WINDOW: TimeDelta = TimeDelta::minutes(2);

/// Every review carries the original change plus its shelved copy.
const BASELINE_CHANGE_COUNT: usize = 2;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReviewEvent {
    pub review_id: ReviewId,
    pub kind: EventKind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventKind {
    Discovered,
    NewRevision {
        latest_change: u64,
    },
    StateChanged {
        from: String,
        to: String,
    },
    TestStatusChanged {
        from: TestStatus,
        to: TestStatus,
    },
    CommitLanded {
        commit: u64,
    },
    VoteChanged {
        user: String,
        value: i32,
        version: u32,
    },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Discovered => "discovered",
            EventKind::NewRevision { .. } => "new_revision",
            EventKind::StateChanged { .. } => "state_changed",
            EventKind::TestStatusChanged { .. } => "test_status_changed",
            EventKind::CommitLanded { .. } => "commit_landed",
            EventKind::VoteChanged { .. } => "vote_changed",
        }
    }
}

#[derive(Debug)]
pub struct Diff {
    /// In fetch order, then in fixed check order within a review.
    pub events: Vec<ReviewEvent>,
    /// Replaces the previous cache once the events are dispatched.
    pub next: ReviewCache,
}

/// Compares the latest full fetch (thread handles already carried forward)
/// against the previous cache. Reviews missing from `current` are dropped.
pub fn diff(previous: &ReviewCache, current: Vec<TrackedReview>, now: DateTime<Utc>) -> Diff {
    let mut events = Vec::new();

    for tracked in &current {
        let review = &tracked.review;
        match previous.get(review.id) {
            None => {
                if tracked.thread.is_none() && is_recent(review, now) {
                    events.push(ReviewEvent {
                        review_id: review.id,
                        kind: EventKind::Discovered,
                    });
                }
            }
            Some(before) if before.review.updated == review.updated => {}
            Some(before) => {
                events.extend(
                    detect_changes(&before.review, review)
                        .into_iter()
                        .map(|kind| ReviewEvent {
                            review_id: review.id,
                            kind,
                        }),
                );
            }
        }
    }

    Diff {
        events,
        next: current.into_iter().collect(),
    }
}

fn is_recent(review: &Review, now: DateTime<Utc>) -> bool {
    review
        .created_at()
        .is_some_and(|created| now - created <= NEW_REVIEW_WINDOW)
}

fn detect_changes(before: &Review, after: &Review) -> Vec<EventKind> {
    let mut kinds = Vec::new();

    if after.changes.len() > BASELINE_CHANGE_COUNT
        && after.changes.len() != before.changes.len()
        && let Some(&latest_change) = after.changes.iter().max()
    {
        kinds.push(EventKind::NewRevision { latest_change });
    }

    if after.state != before.state {
        kinds.push(EventKind::StateChanged {
            from: before.state.clone(),
            to: after.state.clone(),
        });
    }

    if after.test_status != before.test_status {
        kinds.push(EventKind::TestStatusChanged {
            from: before.test_status,
            to: after.test_status,
        });
    }

    if after.commits.len() > before.commits.len()
        && let Some(&commit) = after.commits.first()
    {
        kinds.push(EventKind::CommitLanded { commit });
    }

    for vote in after.votes.iter().filter(|vote| !vote.is_stale) {
        let unchanged = before
            .vote_by(&vote.user)
            .is_some_and(|old| old.value == vote.value && old.version == vote.version);
        if !unchanged {
            kinds.push(EventKind::VoteChanged {
                user: vote.user.clone(),
                value: vote.value,
                version: vote.version,
            });
        }
    }

    kinds
}
