//! Poll loop over the asynchronous contacts search.
//!
//! A search is issued, then re-issued every `interval` while the platform reports
//! `Waiting`/`Processing`. A `Complete` answer without contacts carries only a result id;
//! after `result_delay` the search is re-issued with that id as its sole parameter to
//! fetch the materialized list. `Failed` and unknown states end the chain without records.
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::client::MembershipApi;
use crate::config;
use crate::error::SyncResult;
use crate::model::{Record, SearchState};

/// Parameters of one contacts search. Follow-up requests carry only the result cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub filter: Option<String>,
    pub select: Option<String>,
    pub result_id: Option<String>,
}

impl SearchRequest {
    pub fn new(filter: impl Into<String>) -> Self {
        Self {
            filter: Some(filter.into()),
            select: None,
            result_id: None,
        }
    }

    pub fn with_select(mut self, select: impl Into<String>) -> Self {
        self.select = Some(select.into());
        self
    }

    /// Request for the materialized result list of a completed search.
    pub fn for_result(&self, result_id: &str) -> Self {
        Self {
            filter: None,
            select: None,
            result_id: Some(result_id.to_string()),
        }
    }

    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        if let Some(id) = &self.result_id {
            return vec![("resultId", id.clone())];
        }
        let mut pairs = Vec::new();
        if let Some(filter) = &self.filter {
            pairs.push(("$filter", filter.clone()));
        }
        if let Some(select) = &self.select {
            pairs.push(("$select", select.clone()));
        }
        pairs
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub result_delay: Duration,
    pub max_attempts: Option<u32>,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self::from(&config::Poll::default())
    }
}

impl From<&config::Poll> for PollSettings {
    fn from(poll: &config::Poll) -> Self {
        Self {
            interval: poll.interval(),
            result_delay: poll.result_delay(),
            max_attempts: poll.max_attempts,
        }
    }
}

/// How a poll chain ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchOutcome {
    Complete(Vec<Record>),
    Failed(String),
    /// The platform answered with a state this client does not know.
    Abandoned(String),
    Cancelled,
    TimedOut { attempts: u32 },
}

pub struct SearchPoller<'a, A: MembershipApi + ?Sized> {
    api: &'a A,
    settings: PollSettings,
    cancel: CancellationToken,
}

impl<'a, A: MembershipApi + ?Sized> SearchPoller<'a, A> {
    pub fn new(api: &'a A, settings: PollSettings, cancel: CancellationToken) -> Self {
        Self {
            api,
            settings,
            cancel,
        }
    }

    /// Drive one search to a terminal state.
    ///
    /// Only a fatal error (authentication) is returned as `Err`; transport and protocol
    /// failures of a search call end the chain as `SearchOutcome::Failed`.
    #[instrument(skip_all, fields(filter = request.filter.as_deref().unwrap_or("")))]
    pub async fn search(&self, request: SearchRequest) -> SyncResult<SearchOutcome> {
        let mut current = request;
        let mut attempts: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Ok(SearchOutcome::Cancelled);
            }
            if let Some(max) = self.settings.max_attempts {
                if attempts >= max {
                    warn!(attempts, "search did not resolve; giving up");
                    return Ok(SearchOutcome::TimedOut { attempts });
                }
            }
            attempts += 1;

            let state = match self.api.search_contacts(&current).await {
                Ok(state) => state,
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    error!(error = %err, attempt = attempts, "contact search call failed");
                    return Ok(SearchOutcome::Failed(err.to_string()));
                }
            };

            match state {
                SearchState::Waiting { result_id } | SearchState::Processing { result_id } => {
                    debug!(
                        result_id = result_id.as_deref().unwrap_or(""),
                        attempt = attempts,
                        "search still running; polling again in {}s",
                        self.settings.interval.as_secs()
                    );
                    if !self.pause(self.settings.interval).await {
                        return Ok(SearchOutcome::Cancelled);
                    }
                }
                SearchState::Complete {
                    records: Some(records),
                    ..
                } => {
                    info!(count = records.len(), attempt = attempts, "contacts retrieved");
                    return Ok(SearchOutcome::Complete(records));
                }
                SearchState::Complete {
                    records: None,
                    result_id: Some(result_id),
                } => {
                    debug!(%result_id, "search complete; fetching results");
                    current = current.for_result(&result_id);
                    if !self.pause(self.settings.result_delay).await {
                        return Ok(SearchOutcome::Cancelled);
                    }
                }
                SearchState::Complete {
                    records: None,
                    result_id: None,
                } => {
                    error!("search complete without contacts or result id");
                    return Ok(SearchOutcome::Failed(
                        "complete without contacts or result id".to_string(),
                    ));
                }
                SearchState::Failed(diagnostic) => {
                    error!(%diagnostic, "contact search failed");
                    return Ok(SearchOutcome::Failed(diagnostic));
                }
                SearchState::Unrecognized(state) => {
                    trace!(%state, "unknown search state; abandoning poll chain");
                    return Ok(SearchOutcome::Abandoned(state));
                }
            }
        }
    }

    /// Run the search and hand the records to `on_complete` exactly once when it completes.
    /// Returns `None` when the chain ended without records.
    pub async fn search_with<F, Fut, T>(
        &self,
        request: SearchRequest,
        on_complete: F,
    ) -> SyncResult<Option<T>>
    where
        F: FnOnce(Vec<Record>) -> Fut,
        Fut: Future<Output = T>,
    {
        match self.search(request).await? {
            SearchOutcome::Complete(records) => Ok(Some(on_complete(records).await)),
            _ => Ok(None),
        }
    }

    /// Sleep unless cancelled first. Returns false on cancellation.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}
