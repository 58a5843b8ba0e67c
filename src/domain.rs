use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Domain data structures shared across modules.

pub type ReviewId = u64;

/// A point-in-time view of one Swarm review, as fetched from the service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Review {
    pub id: ReviewId,
    pub author: String,
    pub description: String,
    pub created: i64,
    pub updated: i64,
    pub state: String,
    pub state_label: Option<String>,
    pub test_status: TestStatus,
    pub changes: Vec<u64>,
    pub commits: Vec<u64>,
    pub votes: Vec<Vote>,
    pub participants: Vec<String>,
}

impl Review {
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.created, 0)
    }

    /// First line of the description, used as the thread title.
    pub fn headline(&self) -> &str {
        self.description.lines().next().unwrap_or_default()
    }

    pub fn vote_by(&self, user: &str) -> Option<&Vote> {
        self.votes.iter().find(|vote| vote.user == user)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub user: String,
    pub value: i32,
    pub version: u32,
    pub is_stale: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Running,
    Pass,
    Fail,
    #[default]
    None,
}

impl TestStatus {
    pub fn from_wire(raw: Option<&str>) -> Self {
        match raw {
            Some("running") => TestStatus::Running,
            Some("pass") => TestStatus::Pass,
            Some("fail") => TestStatus::Fail,
            _ => TestStatus::None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TestStatus::Running => "running",
            TestStatus::Pass => "pass",
            TestStatus::Fail => "fail",
            TestStatus::None => "none",
        }
    }
}

/// Where follow-up notifications for a review are threaded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadHandle {
    pub channel: String,
    pub ts: String,
}

impl std::fmt::Display for ThreadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.channel, self.ts)
    }
}

/// A review together with the notification thread this process owns for it.
///
/// The thread handle never comes from Swarm; it is carried forward from the
/// reconciliation cache onto every fresh fetch of the same review.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackedReview {
    #[serde(flatten)]
    pub review: Review,
    #[serde(default)]
    pub thread: Option<ThreadHandle>,
}

impl TrackedReview {
    #[cfg(test)]
    pub fn untracked(review: Review) -> Self {
        Self {
            review,
            thread: None,
        }
    }

    pub fn id(&self) -> ReviewId {
        self.review.id
    }
}

#[derive(Clone, Debug)]
pub struct TestRun {
    pub id: u64,
    pub version: u32,
    pub url: String,
}

#[derive(Clone, Debug)]
pub struct SwarmUser {
    pub email: Option<String>,
}

#[derive(Clone, Debug)]
pub struct SwarmGroup {
    pub id: String,
    pub users: Vec<String>,
}

/// Read-only snapshot of Swarm groups used to expand group participants.
#[derive(Clone, Debug, Default)]
pub struct GroupDirectory {
    groups: Vec<SwarmGroup>,
}

impl GroupDirectory {
    pub fn new(groups: Vec<SwarmGroup>) -> Self {
        Self { groups }
    }

    pub fn members(&self, group_id: &str) -> Option<&[String]> {
        self.groups
            .iter()
            .find(|group| group.id == group_id)
            .map(|group| group.users.as_slice())
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }
}
