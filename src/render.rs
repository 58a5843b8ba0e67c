use std::collections::BTreeSet;

use tracing::warn;

use crate::{
    config::EventIcons,
    domain::{GroupDirectory, Review, TestRun, TestStatus},
};

const GROUP_PREFIX: &str = "swarm-group-";
/// Slack rejects header blocks of 150 characters or more.
const HEADER_LIMIT: usize = 150;
const HEADER_KEEP: usize = 145;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Block {
    Header(String),
    Context(String),
    Section(String),
}

/// Sink-neutral message: markdown blocks plus a plain fallback line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub text: String,
    pub blocks: Vec<Block>,
}

impl Message {
    fn section(text: String) -> Self {
        Self {
            blocks: vec![Block::Section(text.clone())],
            text,
        }
    }
}

pub struct Renderer {
    icons: EventIcons,
    web_uri: String,
}

impl Renderer {
    pub fn new(icons: EventIcons, web_uri: impl Into<String>) -> Self {
        Self {
            icons,
            web_uri: web_uri.into(),
        }
    }

    /// Top-level thread message: title, review link, author and reviewers.
    pub fn thread_root(&self, review: &Review, author: &str, reviewers: &[String]) -> Message {
        let header = match review.headline().trim() {
            "" => format!("Review {}", review.id),
            headline => truncate_header(headline),
        };
        let review_link = link(
            &format!("{}/reviews/{}", self.web_uri, review.id),
            &format!("Review {}", review.id),
        );

        let mut mentions = format!("*Author:* {}", mention(author));
        if !reviewers.is_empty() {
            let reviewers: Vec<String> = reviewers.iter().map(|id| mention(id)).collect();
            mentions.push_str(&format!(" - *Reviewers:* {}", reviewers.join(", ")));
        }

        Message {
            text: format!("Review {}: {header}", review.id),
            blocks: vec![
                Block::Header(header),
                Block::Context(review_link),
                Block::Context(mentions),
            ],
        }
    }

    pub fn new_revision(&self) -> Message {
        Message::section(format!("{} Files updated in review.", self.icons.files_updated))
    }

    pub fn state_changed(&self, review: &Review) -> Message {
        let icon = match review.state.as_str() {
            "archived" => self.icons.archived.as_str(),
            "approved" => self.icons.approved.as_str(),
            "rejected" => self.icons.rejected.as_str(),
            "needsRevision" => self.icons.needs_revision.as_str(),
            "needsReview" => self.icons.needs_review.as_str(),
            _ => "",
        };
        let label = review.state_label.as_deref().unwrap_or(&review.state);
        Message::section(format!(
            "{icon} Review state changed to *{}*",
            label.to_uppercase()
        ))
    }

    pub fn test_status_changed(&self, status: TestStatus, run: &TestRun) -> Message {
        let icon = match status {
            TestStatus::Pass => self.icons.test_pass.as_str(),
            TestStatus::Fail => self.icons.test_fail.as_str(),
            TestStatus::Running | TestStatus::None => "",
        };
        let test_link = link(&run.url, &format!("Test run v{}", run.version));
        Message::section(format!(
            "{icon} {test_link} changed to *{}*",
            status.label().to_uppercase()
        ))
    }

    pub fn commit_landed(&self, commit: u64) -> Message {
        let commit_link = link(
            &format!("{}/changes/{commit}", self.web_uri),
            &commit.to_string(),
        );
        Message::section(format!(
            "{} Changes committed to {commit_link}",
            self.icons.committed
        ))
    }

    /// Values other than up/down (retractions, future vote kinds) fall back
    /// to a generic rendering.
    pub fn vote_changed(&self, user: &str, value: i32, version: u32) -> Message {
        let vote_text = match value {
            1 => format!("{} {user} voted up", self.icons.upvote),
            -1 => format!("{} {user} voted down", self.icons.downvote),
            _ => format!("{user} changed vote"),
        };
        Message::section(format!("{vote_text} (revision {version})"))
    }
}

/// Participants other than the author, with group references expanded to
/// their members. Unknown groups are skipped.
pub fn reviewers(review: &Review, groups: &GroupDirectory) -> Vec<String> {
    let mut users = BTreeSet::new();
    for participant in &review.participants {
        match participant.strip_prefix(GROUP_PREFIX) {
            Some(group_id) => match groups.members(group_id) {
                Some(members) => users.extend(members.iter().cloned()),
                None => warn!(review_id = review.id, group = group_id, "Unknown Swarm group in participants"),
            },
            None => {
                users.insert(participant.clone());
            }
        }
    }
    users.remove(&review.author);
    users.into_iter().collect()
}

fn truncate_header(line: &str) -> String {
    if line.chars().count() >= HEADER_LIMIT {
        let kept: String = line.chars().take(HEADER_KEEP).collect();
        format!("{kept}...")
    } else {
        line.to_owned()
    }
}

fn link(target: &str, text: &str) -> String {
    format!("<{target}|{text}>")
}

fn mention(id: &str) -> String {
    format!("<@{id}>")
}
