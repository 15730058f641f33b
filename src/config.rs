//! Configuration loader and validator for the membership sync runs.
use chrono::{Duration as ChronoDuration, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::actions::Action;
use crate::filter::Eligibility;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub api: Api,
    #[serde(default)]
    pub poll: Poll,
    #[serde(default)]
    pub pacing: Pacing,
    pub report: Report,
    #[serde(default)]
    pub queries: Vec<Query>,
}

/// Membership platform account and credentials.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Api {
    pub account_id: String,
    pub username: String,
    pub password: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_scope")]
    pub scope: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

/// Search poll loop timing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Poll {
    pub interval_ms: u64,
    pub result_delay_ms: u64,
    /// Absent means poll until the search resolves or the run is cancelled.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

/// Delays between record updates to stay under the API rate limit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pacing {
    pub after_update_ms: u64,
    pub after_skip_ms: u64,
    pub after_error_ms: u64,
}

/// End-of-run summary notification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Report {
    pub to: String,
    pub from: String,
    #[serde(default)]
    pub reply_to: Option<String>,
    /// Mail relay endpoint. Without one the summary only goes to the log.
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// One scheduled contacts query and the action applied to its results.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Query {
    pub name: String,
    pub action: String,
    pub filter: String,
    #[serde(default)]
    pub select: Option<String>,
    #[serde(default)]
    pub eligibility: Vec<String>,
    /// Membership level name the contacts are moved to (level-change actions only).
    #[serde(default)]
    pub target_level: Option<String>,
}

fn default_scope() -> String {
    "auto".to_string()
}

fn default_token_url() -> String {
    "https://oauth.wildapricot.org/auth/token".to_string()
}

fn default_api_base() -> String {
    "https://api.wildapricot.org/v2.1/".to_string()
}

impl Default for Poll {
    fn default() -> Self {
        Self {
            interval_ms: 10_000,
            result_delay_ms: 1_000,
            max_attempts: None,
        }
    }
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            after_update_ms: 1_000,
            after_skip_ms: 500,
            after_error_ms: 500,
        }
    }
}

impl Poll {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn result_delay(&self) -> Duration {
        Duration::from_millis(self.result_delay_ms)
    }
}

impl Config {
    /// Replace credentials with `WILDAPRICOT_*` environment values when present.
    pub fn apply_env_overrides(&mut self) {
        let overrides: [(&str, &mut String); 4] = [
            ("WILDAPRICOT_USERNAME", &mut self.api.username),
            ("WILDAPRICOT_PASSWORD", &mut self.api.password),
            ("WILDAPRICOT_CLIENT_ID", &mut self.api.client_id),
            ("WILDAPRICOT_CLIENT_SECRET", &mut self.api.client_secret),
        ];
        for (key, slot) in overrides {
            if let Ok(value) = std::env::var(key) {
                if !value.trim().is_empty() {
                    *slot = value;
                }
            }
        }
    }

    pub fn query(&self, name: &str) -> Option<&Query> {
        self.queries.iter().find(|q| q.name == name)
    }
}

static DATE_PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{today(?:([+-])(\d+))?\}").expect("valid placeholder regex"));

impl Query {
    /// Expand `{today}`, `{today-N}` and `{today+N}` into `yyyy-mm-dd` dates.
    pub fn render_filter(&self, today: NaiveDate) -> String {
        DATE_PLACEHOLDER
            .replace_all(&self.filter, |caps: &regex::Captures<'_>| {
                let days: i64 = caps
                    .get(2)
                    .and_then(|m| m.as_str().parse().ok())
                    .unwrap_or(0);
                let date = match caps.get(1).map(|m| m.as_str()) {
                    Some("-") => today - ChronoDuration::days(days),
                    _ => today + ChronoDuration::days(days),
                };
                date.format("%Y-%m-%d").to_string()
            })
            .into_owned()
    }
}

/// Load configuration from a YAML file, apply env overrides and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let mut cfg: Config = serde_yaml::from_str(&content)?;
    cfg.apply_env_overrides();
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.api.account_id.trim().is_empty() {
        return Err(ConfigError::Invalid("api.account_id must be non-empty"));
    }
    if cfg.api.username.trim().is_empty() {
        return Err(ConfigError::Invalid("api.username must be non-empty"));
    }
    if cfg.api.password.is_empty() {
        return Err(ConfigError::Invalid("api.password must be non-empty"));
    }
    if cfg.api.client_id.trim().is_empty() {
        return Err(ConfigError::Invalid("api.client_id must be non-empty"));
    }
    if cfg.api.client_secret.trim().is_empty() {
        return Err(ConfigError::Invalid("api.client_secret must be non-empty"));
    }
    if reqwest::Url::parse(&cfg.api.token_url).is_err() {
        return Err(ConfigError::Invalid("api.token_url must be a valid URL"));
    }
    if reqwest::Url::parse(&cfg.api.api_base).is_err() {
        return Err(ConfigError::Invalid("api.api_base must be a valid URL"));
    }

    if cfg.poll.interval_ms == 0 {
        return Err(ConfigError::Invalid("poll.interval_ms must be > 0"));
    }
    if cfg.poll.max_attempts == Some(0) {
        return Err(ConfigError::Invalid("poll.max_attempts must be > 0 when set"));
    }

    if cfg.report.to.trim().is_empty() {
        return Err(ConfigError::Invalid("report.to must be non-empty"));
    }
    if cfg.report.from.trim().is_empty() {
        return Err(ConfigError::Invalid("report.from must be non-empty"));
    }
    if let Some(endpoint) = &cfg.report.endpoint {
        if reqwest::Url::parse(endpoint).is_err() {
            return Err(ConfigError::Invalid("report.endpoint must be a valid URL"));
        }
    }

    for (i, q) in cfg.queries.iter().enumerate() {
        if q.name.trim().is_empty() {
            return Err(ConfigError::Invalid("queries[].name must be non-empty"));
        }
        if q.filter.trim().is_empty() {
            return Err(ConfigError::Invalid("queries[].filter must be non-empty"));
        }
        if cfg.queries[..i].iter().any(|other| other.name == q.name) {
            return Err(ConfigError::Invalid("queries[].name must be unique"));
        }
        let action: Action = q
            .action
            .parse()
            .map_err(|_| ConfigError::Invalid("queries[].action must be a supported action"))?;
        if action.needs_target_level() && q.target_level.is_none() {
            return Err(ConfigError::Invalid(
                "queries[].target_level is required for newbieToNewcomerUpdate",
            ));
        }
        if Eligibility::parse_all(&q.eligibility).is_err() {
            return Err(ConfigError::Invalid(
                "queries[].eligibility contains an unrecognised expression",
            ));
        }
    }

    Ok(())
}

/// Returns an example YAML configuration.
pub fn example() -> &'static str {
    r#"api:
  account_id: "287727"
  username: "sync-bot@example.org"
  password: "YOUR_PASSWORD"
  client_id: "YOUR_CLIENT_ID"
  client_secret: "YOUR_CLIENT_SECRET"
  scope: "auto"

poll:
  interval_ms: 10000
  result_delay_ms: 1000

pacing:
  after_update_ms: 1000
  after_skip_ms: 500
  after_error_ms: 500

report:
  to: "HelpDesk@example.org"
  from: "HelpDesk@example.org"
  reply_to: "no-reply@example.org"

queries:
  - name: alumni-renewal
    action: updateRenewalDate
    select: "'First name','Last name','Renewal due','Membership status','Membership enabled','Level last changed'"
    filter: "'Membership level ID' eq '694456' AND 'Profile last updated' ge '{today-1}'"
    eligibility:
      - "'Membership enabled' == true"
  - name: friends-renewal
    action: renewFromEventRegistration
    select: "'First name','Last name','Renewal due','Membership status','Membership enabled'"
    filter: "'Membership level ID' eq '694456'"
    eligibility:
      - "'Membership enabled' == true"
  - name: member-since-copy
    action: copyMemberSince
    filter: "'Membership status' ne 'Lapsed' AND 'Membership status' ne 'PendingNew' AND 'Member since readonly' eq NULL"
  - name: newbie-flag-set
    action: setNewbieFlag
    filter: "'Membership status' ne 'Lapsed' AND 'Membership status' ne 'PendingNew' AND 'Member since' gt {today-90}"
    eligibility:
      - "level == 'Newcomer Member'"
  - name: newbie-flag-clear
    action: clearNewbieFlag
    filter: "'Membership status' ne 'Lapsed' AND 'Membership status' ne 'PendingNew' AND 'Member since' le {today-90}"
    eligibility:
      - "level == 'Newcomer Member'"
  - name: newbie-to-newcomer
    action: newbieToNewcomerUpdate
    select: "'First name','Last name','Membership status','Membership enabled','Member since','Renewal due'"
    filter: "'Membership status' eq 'Active' AND 'Membership level ID' eq 1041308 AND 'Renewal due' le '{today+641}'"
    target_level: "NewcomerMember"
    eligibility:
      - "'Membership enabled' == true"
"#
}
