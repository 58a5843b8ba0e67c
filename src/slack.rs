use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    domain::ThreadHandle,
    render::{Block, Message},
    swarm::{self, ReviewSource},
};

const SLACK_API: &str = "https://slack.com/api";

/// Messaging sink able to open a thread and reply inside it.
pub trait Notifier {
    fn post_top(&self, channel: &str, message: &Message) -> Result<ThreadHandle, NotifyError>;
    fn post_reply(&self, thread: &ThreadHandle, message: &Message) -> Result<(), NotifyError>;
}

/// Turns a Swarm username into a chat mention target. Never fails: the raw
/// username is the fallback.
pub trait MentionResolver {
    fn resolve_mention(&self, username: &str) -> String;
}

/// Email to chat user id lookup.
pub trait UserDirectory {
    fn lookup_by_email(&self, email: &str) -> Result<String, NotifyError>;
}

#[derive(Clone)]
pub struct SlackClient {
    http: Client,
    token: String,
}

impl SlackClient {
    pub fn new(token: &str) -> Result<Self, NotifyError> {
        if token.is_empty() {
            return Err(NotifyError::MissingToken);
        }
        Ok(Self {
            http: swarm::build_client().map_err(|err| NotifyError::Client(err.to_string()))?,
            token: token.to_owned(),
        })
    }

    fn post_message(&self, request: &PostMessageRequest<'_>) -> Result<PostMessageResponse, NotifyError> {
        let response: PostMessageResponse = self
            .http
            .post(format!("{SLACK_API}/chat.postMessage"))
            .bearer_auth(&self.token)
            .json(request)
            .send()?
            .error_for_status()?
            .json()?;
        if !response.ok {
            return Err(NotifyError::Rejected(
                response.error.unwrap_or_else(|| "unknown_error".to_owned()),
            ));
        }
        Ok(response)
    }
}

impl Notifier for SlackClient {
    fn post_top(&self, channel: &str, message: &Message) -> Result<ThreadHandle, NotifyError> {
        let response = self.post_message(&PostMessageRequest {
            channel,
            text: &message.text,
            blocks: blocks_json(&message.blocks),
            thread_ts: None,
        })?;
        match (response.channel, response.ts) {
            (Some(channel), Some(ts)) => Ok(ThreadHandle { channel, ts }),
            _ => Err(NotifyError::Rejected("response without channel/ts".to_owned())),
        }
    }

    fn post_reply(&self, thread: &ThreadHandle, message: &Message) -> Result<(), NotifyError> {
        self.post_message(&PostMessageRequest {
            channel: &thread.channel,
            text: &message.text,
            blocks: blocks_json(&message.blocks),
            thread_ts: Some(&thread.ts),
        })?;
        Ok(())
    }
}

impl UserDirectory for SlackClient {
    fn lookup_by_email(&self, email: &str) -> Result<String, NotifyError> {
        let response: LookupResponse = self
            .http
            .get(format!("{SLACK_API}/users.lookupByEmail"))
            .query(&[("email", email)])
            .bearer_auth(&self.token)
            .send()?
            .error_for_status()?
            .json()?;
        match (response.ok, response.user) {
            (true, Some(user)) => Ok(user.id),
            _ => Err(NotifyError::Rejected(
                response.error.unwrap_or_else(|| "users_not_found".to_owned()),
            )),
        }
    }
}

/// Resolves mentions through the Swarm user's email, then through
/// `username@domain` for each configured fallback domain.
pub struct IdentityResolver<S, D> {
    source: S,
    directory: Option<D>,
    fallback_domains: Vec<String>,
}

impl<S: ReviewSource, D: UserDirectory> IdentityResolver<S, D> {
    pub fn new(source: S, directory: Option<D>, fallback_domains: Vec<String>) -> Self {
        Self {
            source,
            directory,
            fallback_domains,
        }
    }

    fn lookup(&self, directory: &D, username: &str) -> Option<String> {
        match self.source.fetch_user(username) {
            Ok(Some(user)) => {
                if let Some(email) = user.email {
                    match directory.lookup_by_email(&email) {
                        Ok(id) => return Some(id),
                        Err(err) => debug!(username, error = %err, "Lookup by Swarm email failed"),
                    }
                }
            }
            Ok(None) => debug!(username, "Swarm user not found"),
            Err(err) => debug!(username, error = %err, "Swarm user lookup failed"),
        }

        self.fallback_domains.iter().find_map(|domain| {
            directory
                .lookup_by_email(&format!("{username}@{domain}"))
                .inspect_err(|err| debug!(username, domain = %domain, error = %err, "Lookup by fallback domain failed"))
                .ok()
        })
    }
}

impl<S: ReviewSource, D: UserDirectory> MentionResolver for IdentityResolver<S, D> {
    fn resolve_mention(&self, username: &str) -> String {
        let Some(directory) = &self.directory else {
            return username.to_owned();
        };
        self.lookup(directory, username).unwrap_or_else(|| {
            warn!(username, "Could not resolve chat user; mentioning raw username");
            username.to_owned()
        })
    }
}

fn blocks_json(blocks: &[Block]) -> Vec<Value> {
    blocks
        .iter()
        .map(|block| match block {
            Block::Header(text) => json!({
                "type": "header",
                "text": { "type": "plain_text", "text": text },
            }),
            Block::Context(text) => json!({
                "type": "context",
                "elements": [{ "type": "mrkdwn", "text": text }],
            }),
            Block::Section(text) => json!({
                "type": "section",
                "text": { "type": "mrkdwn", "text": text },
            }),
        })
        .collect()
}

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Slack API request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Slack token is missing")]
    MissingToken,
    #[error("Could not build Slack client: {0}")]
    Client(String),
    #[error("Slack rejected the request: {0}")]
    Rejected(String),
}

// Request/response payloads -------------------------------------------------

#[derive(Debug, Serialize)]
struct PostMessageRequest<'a> {
    channel: &'a str,
    text: &'a str,
    blocks: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thread_ts: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct PostMessageResponse {
    ok: bool,
    error: Option<String>,
    channel: Option<String>,
    ts: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    ok: bool,
    error: Option<String>,
    user: Option<LookupUser>,
}

#[derive(Debug, Deserialize)]
struct LookupUser {
    id: String,
}
