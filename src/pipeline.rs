use chrono::Local;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::actions::{Action, ActionContext, UpdateJob, Verdict};
use crate::client::MembershipApi;
use crate::config;
use crate::error::{SyncError, SyncResult};
use crate::filter::Eligibility;
use crate::model::{Record, RegistrationFilter};
use crate::report::{Summary, SummaryReporter};
use crate::search::{SearchPoller, SearchRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Updated,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub target_id: i64,
    pub display_name: String,
    pub status: JobStatus,
}

/// Counters for one pipeline invocation. A fresh tally is built per run.
///
/// `updated + skipped + errors == processed`; `invalid` counts records dropped before a job
/// was created (missing fields) and is not part of `processed`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunTally {
    pub processed: u32,
    pub updated: u32,
    pub skipped: u32,
    pub errors: u32,
    pub invalid: u32,
    pub outcomes: Vec<JobOutcome>,
}

impl RunTally {
    fn record(&mut self, job: &UpdateJob, status: JobStatus) {
        match status {
            JobStatus::Updated => self.updated += 1,
            JobStatus::Skipped => self.skipped += 1,
            JobStatus::Failed => self.errors += 1,
        }
        self.outcomes.push(JobOutcome {
            target_id: job.target_id,
            display_name: job.display_name.clone(),
            status,
        });
    }
}

/// Delays after each job, purely to stay under the API rate limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pacing {
    pub after_update: Duration,
    pub after_skip: Duration,
    pub after_error: Duration,
}

impl Default for Pacing {
    fn default() -> Self {
        Self::from(&config::Pacing::default())
    }
}

impl From<&config::Pacing> for Pacing {
    fn from(p: &config::Pacing) -> Self {
        Self {
            after_update: Duration::from_millis(p.after_update_ms),
            after_skip: Duration::from_millis(p.after_skip_ms),
            after_error: Duration::from_millis(p.after_error_ms),
        }
    }
}

/// Filters search results, turns them into update jobs and applies them one at a time.
pub struct RecordPipeline<'a, A: MembershipApi + ?Sized> {
    api: &'a A,
    reporter: &'a dyn SummaryReporter,
    report: config::Report,
    supported: Vec<Action>,
    eligibility: Eligibility,
    context: ActionContext,
    pacing: Pacing,
    cancel: CancellationToken,
}

impl<'a, A: MembershipApi + ?Sized> RecordPipeline<'a, A> {
    pub fn new(api: &'a A, reporter: &'a dyn SummaryReporter, report: config::Report) -> Self {
        Self {
            api,
            reporter,
            report,
            supported: Action::ALL.to_vec(),
            eligibility: Eligibility::default(),
            context: ActionContext::new(Local::now().date_naive()),
            pacing: Pacing::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Restrict the action tags this pipeline accepts.
    pub fn supporting(mut self, actions: &[Action]) -> Self {
        self.supported = actions.to_vec();
        self
    }

    pub fn with_eligibility(mut self, eligibility: Eligibility) -> Self {
        self.eligibility = eligibility;
        self
    }

    pub fn with_context(mut self, context: ActionContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn resolve_action(&self, tag: &str) -> SyncResult<Action> {
        let action: Action = tag.parse()?;
        if !self.supported.contains(&action) {
            return Err(SyncError::UnsupportedAction(tag.to_string()));
        }
        if action.needs_target_level() && self.context.target_level.is_none() {
            return Err(SyncError::Config(format!(
                "action {} needs a target membership level",
                action
            )));
        }
        Ok(action)
    }

    /// Build the update jobs for a batch: eligibility filter, then field extraction.
    /// Records missing a required field are logged and counted as `invalid`.
    pub fn prepare_jobs(
        &self,
        records: &[Record],
        action: Action,
        tally: &mut RunTally,
    ) -> Vec<UpdateJob> {
        let eligible = self.eligibility.apply(records);
        debug!(
            received = records.len(),
            eligible = eligible.len(),
            "eligibility filter applied"
        );
        let mut jobs = Vec::with_capacity(eligible.len());
        for record in eligible {
            match action.prepare(record) {
                Ok(job) => jobs.push(job),
                Err(err) => {
                    error!(contact_id = record.id, error = %err, "record rejected");
                    tally.invalid += 1;
                }
            }
        }
        jobs
    }

    /// Apply `action` to a delivered batch and send the summary.
    ///
    /// Unsupported actions abort before any API call. Per-record failures are counted and the
    /// batch continues; an authentication failure aborts the run without a summary.
    #[instrument(skip_all, fields(action = tag))]
    pub async fn run(&self, records: &[Record], tag: &str) -> SyncResult<RunTally> {
        let action = self.resolve_action(tag)?;
        let mut tally = RunTally::default();
        let mut jobs = self.prepare_jobs(records, action, &mut tally);
        let total = jobs.len();
        info!(count = jobs.len(), "contacts to process");

        for (index, job) in jobs.iter_mut().enumerate() {
            if self.cancel.is_cancelled() {
                warn!(remaining = total - index, "run cancelled; stopping before next contact");
                break;
            }
            tally.processed += 1;
            trace!(
                index = index + 1,
                contact_id = job.target_id,
                name = %job.display_name,
                "processing contact"
            );

            if action.needs_registrations() {
                let filter = RegistrationFilter::Contact(job.target_id);
                match self.api.list_event_registrations(filter).await {
                    Ok(registrations) => {
                        trace!(
                            contact_id = job.target_id,
                            count = registrations.len(),
                            "event registrations fetched"
                        );
                        job.attach_registrations(&registrations);
                    }
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(err) => {
                        error!(
                            index = index + 1,
                            contact_id = job.target_id,
                            error = %err,
                            "failed to list event registrations"
                        );
                        tally.record(job, JobStatus::Failed);
                        self.pause(self.pacing.after_error).await;
                        continue;
                    }
                }
            }

            let delay = match action.decide(job, &self.context) {
                Verdict::Skip(reason) => {
                    trace!(contact_id = job.target_id, %reason, "skipping contact");
                    tally.record(job, JobStatus::Skipped);
                    self.pacing.after_skip
                }
                Verdict::Apply(update) => match self.api.update_contact(&update).await {
                    Ok(res) if res.id.is_some() => {
                        trace!(
                            index = index + 1,
                            contact_id = job.target_id,
                            status = res.status.as_deref().unwrap_or(""),
                            "contact updated"
                        );
                        tally.record(job, JobStatus::Updated);
                        self.pacing.after_update
                    }
                    Ok(_) => {
                        error!(
                            index = index + 1,
                            contact_id = job.target_id,
                            name = %job.display_name,
                            "update response carried no contact id"
                        );
                        tally.record(job, JobStatus::Failed);
                        self.pacing.after_error
                    }
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(err) => {
                        error!(
                            index = index + 1,
                            contact_id = job.target_id,
                            name = %job.display_name,
                            error = %err,
                            "failed to update contact"
                        );
                        tally.record(job, JobStatus::Failed);
                        self.pacing.after_error
                    }
                },
            };
            self.pause(delay).await;
        }

        if tally.processed == 0 {
            info!("nothing processed; no summary sent");
            return Ok(tally);
        }

        info!(
            processed = tally.processed,
            updated = tally.updated,
            skipped = tally.skipped,
            errors = tally.errors,
            "{}",
            Summary::headline(action, &tally)
        );
        let summary = Summary::from_tally(action, &tally, &self.report);
        match self.reporter.send_summary(&summary).await {
            Ok(message_id) => debug!(%message_id, "summary sent"),
            Err(err) => error!(error = ?err, "failed to send run summary"),
        }
        Ok(tally)
    }

    /// Poll a search to completion and run the pipeline over its records.
    /// Returns `None` when the search ended without records; the pipeline is not invoked then.
    pub async fn run_search(
        &self,
        poller: &SearchPoller<'_, A>,
        request: SearchRequest,
        tag: &str,
    ) -> SyncResult<Option<RunTally>> {
        poller
            .search_with(request, |records| async move { self.run(&records, tag).await })
            .await?
            .transpose()
    }

    async fn pause(&self, delay: Duration) {
        if delay.is_zero() {
            return;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
