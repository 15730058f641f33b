//! End-of-run summary notification.
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use tracing::{debug, info, warn};

use crate::actions::Action;
use crate::config;
use crate::pipeline::{JobStatus, RunTally};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Summary {
    pub to: String,
    pub from: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    pub subject: String,
    pub html_body: String,
    pub text_body: String,
}

fn plural(n: u32) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

impl Summary {
    pub fn headline(action: Action, tally: &RunTally) -> String {
        format!(
            "{} processed for {} member{} with {} updated, {} skipped, and {} error{}",
            action,
            tally.processed,
            plural(tally.processed),
            tally.updated,
            tally.skipped,
            tally.errors,
            plural(tally.errors)
        )
    }

    /// Build the notification for one finished run. Updated contacts are itemised.
    pub fn from_tally(action: Action, tally: &RunTally, report: &config::Report) -> Self {
        let headline = Summary::headline(action, tally);
        let updated: Vec<String> = tally
            .outcomes
            .iter()
            .filter(|o| o.status == JobStatus::Updated)
            .map(|o| format!("{} ({})", o.display_name, o.target_id))
            .collect();

        let mut text = headline.clone();
        let mut html = format!("<p>{}</p>", escape_html(&headline));
        if !updated.is_empty() {
            html.push_str("<ul>");
            for contact in &updated {
                let _ = write!(text, "\n{}", contact);
                let _ = write!(html, "<li>{}</li>", escape_html(contact));
            }
            html.push_str("</ul>");
        }

        let subject = if tally.errors > 0 {
            format!("*** ERRORS: {}", action.subject())
        } else {
            action.subject().to_string()
        };

        Self {
            to: report.to.clone(),
            from: report.from.clone(),
            reply_to: report.reply_to.clone(),
            subject,
            html_body: html,
            text_body: text,
        }
    }
}

/// Receives the end-of-run summary. Returns the sink's message id.
#[async_trait]
pub trait SummaryReporter: Send + Sync {
    async fn send_summary(&self, summary: &Summary) -> Result<String>;
}

/// Posts the summary as JSON to a mail relay.
#[derive(Debug, Clone)]
pub struct HttpMailer {
    http: Client,
    endpoint: Url,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RelayResponse {
    message_id: String,
}

impl HttpMailer {
    pub fn new(endpoint: Url) -> Result<Self> {
        let http = Client::builder()
            .user_agent("apricot-sync/0.1")
            .no_proxy()
            .build()
            .context("failed to build mail relay client")?;
        Ok(Self { http, endpoint })
    }
}

#[async_trait]
impl SummaryReporter for HttpMailer {
    async fn send_summary(&self, summary: &Summary) -> Result<String> {
        debug!(endpoint = %self.endpoint, subject = %summary.subject, "sending run summary");
        let res = self
            .http
            .post(self.endpoint.clone())
            .json(summary)
            .send()
            .await
            .context("failed to reach mail relay")?;

        if res.status() == StatusCode::TOO_MANY_REQUESTS {
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("received 429 from mail relay: {}", body));
        }
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            warn!(%status, "mail relay rejected summary");
            return Err(anyhow!("mail relay error {}: {}", status, body));
        }
        let payload: RelayResponse = res.json().await.context("invalid mail relay response")?;
        Ok(payload.message_id)
    }
}

/// Writes the summary to the log only; used when no relay endpoint is configured.
#[derive(Debug, Clone, Default)]
pub struct LogReporter;

#[async_trait]
impl SummaryReporter for LogReporter {
    async fn send_summary(&self, summary: &Summary) -> Result<String> {
        info!(to = %summary.to, subject = %summary.subject, "{}", summary.text_body);
        Ok("log".to_string())
    }
}

/// Pick the reporter for a configuration.
pub fn from_config(report: &config::Report) -> Result<Box<dyn SummaryReporter>> {
    match &report.endpoint {
        Some(endpoint) => {
            let url = Url::parse(endpoint).context("invalid report.endpoint")?;
            Ok(Box::new(HttpMailer::new(url)?))
        }
        None => Ok(Box::new(LogReporter)),
    }
}
