use std::{collections::BTreeMap, time::Duration};

use reqwest::{
    blocking::Client,
    header::{ACCEPT, USER_AGENT},
};
use serde::{Deserialize, de::DeserializeOwned};
use thiserror::Error;

use crate::{
    config::SwarmSettings,
    domain::{Review, ReviewId, SwarmGroup, SwarmUser, TestRun, TestStatus, Vote},
};

const USER_AGENT_HEADER: &str = "swarm-notifier/0.1";
/// Calls wait for as long as the remote side takes; a hung request stalls
/// the poll loop rather than failing it.
const REQUEST_TIMEOUT: Option<Duration> = None;

/// Read access to the review service.
pub trait ReviewSource {
    /// The complete current review collection, in service order.
    fn fetch_reviews(&self) -> Result<Vec<Review>, FetchError>;
    /// Test runs for a review, latest first.
    fn fetch_test_runs(&self, review_id: ReviewId) -> Result<Vec<TestRun>, FetchError>;
    fn fetch_groups(&self) -> Result<Vec<SwarmGroup>, FetchError>;
    fn fetch_user(&self, username: &str) -> Result<Option<SwarmUser>, FetchError>;
}

#[derive(Clone)]
pub struct SwarmClient {
    http: Client,
    api_uri: String,
    username: String,
    token: String,
}

pub fn build_client() -> Result<Client, FetchError> {
    Client::builder()
        .user_agent(USER_AGENT_HEADER)
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(FetchError::Http)
}

impl SwarmClient {
    pub fn new(settings: &SwarmSettings) -> Result<Self, FetchError> {
        if settings.token.is_empty() {
            return Err(FetchError::MissingToken);
        }
        Ok(Self {
            http: build_client()?,
            api_uri: settings.api_uri(),
            username: settings.username.clone(),
            token: settings.token.clone(),
        })
    }

    fn get<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, FetchError> {
        let url = format!("{}/{path}", self.api_uri);
        let envelope: SwarmEnvelope<T> = self
            .http
            .get(url)
            .header(USER_AGENT, USER_AGENT_HEADER)
            .header(ACCEPT, "application/json")
            .basic_auth(&self.username, Some(&self.token))
            .send()?
            .error_for_status()?
            .json()?;
        envelope.into_data()
    }
}

impl ReviewSource for SwarmClient {
    fn fetch_reviews(&self) -> Result<Vec<Review>, FetchError> {
        let data: ReviewsData = self
            .get("reviews")?
            .ok_or(FetchError::MissingData("reviews"))?;
        Ok(data.reviews.into_iter().map(Review::from).collect())
    }

    fn fetch_test_runs(&self, review_id: ReviewId) -> Result<Vec<TestRun>, FetchError> {
        let data: Option<TestRunsData> = self.get(&format!("reviews/{review_id}/testruns"))?;
        Ok(data
            .map(|data| data.testruns)
            .unwrap_or_default()
            .into_iter()
            .map(|run| TestRun {
                id: run.id,
                version: run.version,
                url: run.url,
            })
            .collect())
    }

    fn fetch_groups(&self) -> Result<Vec<SwarmGroup>, FetchError> {
        let data: GroupsData = self
            .get("groups")?
            .ok_or(FetchError::MissingData("groups"))?;
        Ok(data
            .groups
            .into_iter()
            .map(|group| SwarmGroup {
                id: group.id,
                users: group.users,
            })
            .collect())
    }

    fn fetch_user(&self, username: &str) -> Result<Option<SwarmUser>, FetchError> {
        let data: Option<UsersData> = self.get(&format!("users/{username}"))?;
        Ok(data
            .and_then(|data| data.users.into_iter().next())
            .map(|user| SwarmUser {
                email: user.email.filter(|email| !email.is_empty()),
            }))
    }
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Swarm API request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Swarm API token is missing")]
    MissingToken,
    #[error("Swarm API reported an error: {0}")]
    Api(String),
    #[error("Swarm API response carried no {0} data")]
    MissingData(&'static str),
}

// Response payloads ---------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SwarmEnvelope<T> {
    error: Option<String>,
    messages: Option<Vec<String>>,
    data: Option<T>,
}

impl<T> SwarmEnvelope<T> {
    fn into_data(self) -> Result<Option<T>, FetchError> {
        if let Some(error) = self.error.filter(|error| !error.is_empty()) {
            let detail = match self.messages {
                Some(messages) if !messages.is_empty() => {
                    format!("{error} ({})", messages.join("; "))
                }
                _ => error,
            };
            return Err(FetchError::Api(detail));
        }
        Ok(self.data)
    }
}

#[derive(Debug, Deserialize)]
struct ReviewsData {
    reviews: Vec<ReviewPayload>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReviewPayload {
    id: ReviewId,
    #[serde(default)]
    author: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    created: i64,
    #[serde(default)]
    updated: i64,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    state_label: Option<String>,
    #[serde(default)]
    test_status: Option<String>,
    #[serde(default)]
    changes: Vec<u64>,
    #[serde(default)]
    commits: Vec<u64>,
    #[serde(default)]
    participants: Vec<String>,
    #[serde(default)]
    participants_data: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ParticipantData {
    vote: Option<VotePayload>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VotePayload {
    value: i32,
    #[serde(default)]
    version: Option<u32>,
    #[serde(default)]
    is_stale: bool,
}

impl From<ReviewPayload> for Review {
    fn from(payload: ReviewPayload) -> Self {
        Review {
            id: payload.id,
            author: payload.author,
            description: payload.description,
            created: payload.created,
            updated: payload.updated,
            state: payload.state.unwrap_or_default(),
            state_label: payload.state_label,
            test_status: TestStatus::from_wire(payload.test_status.as_deref()),
            changes: payload.changes,
            commits: payload.commits,
            votes: extract_votes(payload.participants_data),
            participants: payload.participants,
        }
    }
}

/// Swarm mixes three shapes under `participantsData`; only objects carrying a
/// `vote` are of interest. Arrays and vote-less objects are skipped.
fn extract_votes(participants_data: BTreeMap<String, serde_json::Value>) -> Vec<Vote> {
    participants_data
        .into_iter()
        .filter(|(_, value)| value.is_object())
        .filter_map(|(user, value)| {
            let data: ParticipantData = serde_json::from_value(value).ok()?;
            let vote = data.vote?;
            Some(Vote {
                user,
                value: vote.value,
                version: vote.version.unwrap_or_default(),
                is_stale: vote.is_stale,
            })
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct TestRunsData {
    #[serde(alias = "testRuns")]
    testruns: Vec<TestRunPayload>,
}

#[derive(Debug, Deserialize)]
struct TestRunPayload {
    id: u64,
    #[serde(default)]
    version: u32,
    #[serde(default)]
    url: String,
}

#[derive(Debug, Deserialize)]
struct GroupsData {
    groups: Vec<GroupPayload>,
}

#[derive(Debug, Deserialize)]
struct GroupPayload {
    id: String,
    #[serde(default)]
    users: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct UsersData {
    users: Vec<UserPayload>,
}

#[derive(Debug, Deserialize)]
struct UserPayload {
    #[serde(default)]
    email: Option<String>,
}

// -------------------------------------------------------------------------
// Tests
// -------------------------------------------------------------------------
