use std::{
    env, fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use thiserror::Error;

const DEFAULT_CONFIG_FILE: &str = "appsettings.json";
const CONFIG_ENV_VAR: &str = "SWARM_NOTIFIER_CONFIG";
const DEFAULT_CACHE_FILE: &str = "review-cache.json";

#[derive(Debug, Clone, Deserialize)]
pub struct AppSettings {
    pub swarm: SwarmSettings,
    pub slack: SlackSettings,
    #[serde(default)]
    pub event_icons: EventIcons,
    #[serde(default)]
    pub monitor: MonitorSettings,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SwarmSettings {
    pub uri: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    pub username: String,
    pub token: String,
}

impl SwarmSettings {
    pub fn api_uri(&self) -> String {
        format!("{}/api/{}", self.uri.trim_end_matches('/'), self.api_version)
    }

    /// Base URI for human-facing links.
    pub fn web_uri(&self) -> &str {
        self.uri.trim_end_matches('/')
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SlackSettings {
    pub message_token: String,
    #[serde(default)]
    pub user_token: Option<String>,
    pub channel: String,
    #[serde(default)]
    pub additional_lookup_domains: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventIcons {
    pub upvote: String,
    pub downvote: String,
    pub committed: String,
    pub test_pass: String,
    pub test_fail: String,
    pub archived: String,
    pub approved: String,
    pub rejected: String,
    pub needs_revision: String,
    pub needs_review: String,
    pub files_updated: String,
}

impl Default for EventIcons {
    fn default() -> Self {
        Self {
            upvote: ":upvote:".to_owned(),
            downvote: ":downvote:".to_owned(),
            committed: ":rocket:".to_owned(),
            test_pass: ":green_circle:".to_owned(),
            test_fail: ":red_circle:".to_owned(),
            archived: ":open_book:".to_owned(),
            approved: ":check:".to_owned(),
            rejected: ":cross:".to_owned(),
            needs_revision: ":pencil:".to_owned(),
            needs_review: ":eyes:".to_owned(),
            files_updated: ":arrows_clockwise:".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub poll_interval_secs: u64,
    pub group_refresh_secs: u64,
    pub cache_path: Option<PathBuf>,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            group_refresh_secs: 600,
            cache_path: None,
        }
    }
}

impl MonitorSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn group_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.group_refresh_secs)
    }

    /// Configured cache location, or `review-cache.json` beside the executable.
    pub fn resolved_cache_path(&self) -> PathBuf {
        if let Some(path) = &self.cache_path {
            return path.clone();
        }
        env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
            .unwrap_or_default()
            .join(DEFAULT_CACHE_FILE)
    }
}

fn default_api_version() -> String {
    "v11".to_owned()
}

fn default_log_level() -> String {
    "info".to_owned()
}

impl AppSettings {
    /// Picks the settings file: first CLI argument, then the env var, then
    /// `appsettings.json` in the working directory.
    pub fn locate(arg: Option<String>) -> PathBuf {
        arg.or_else(|| env::var(CONFIG_ENV_VAR).ok())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let settings: AppSettings = serde_json::from_str(contents)?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("swarm.uri", &self.swarm.uri),
            ("swarm.username", &self.swarm.username),
            ("swarm.token", &self.swarm.token),
            ("slack.message_token", &self.slack.message_token),
            ("slack.channel", &self.slack.channel),
        ];
        if let Some((field, _)) = required.iter().find(|(_, value)| value.trim().is_empty()) {
            return Err(ConfigError::MissingField(*field));
        }
        if self.monitor.poll_interval_secs == 0 {
            return Err(ConfigError::ZeroPollInterval);
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read settings file {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("Settings file is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Required setting `{0}` is empty")]
    MissingField(&'static str),
    #[error("monitor.poll_interval_secs must be greater than zero")]
    ZeroPollInterval,
}
