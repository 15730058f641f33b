use anyhow::{anyhow, Result};
use apricot_sync::actions::{
    Action, ActionContext, MEMBER_SINCE, MEMBER_SINCE_READONLY, RENEWAL_DUE,
};
use apricot_sync::client::MembershipApi;
use apricot_sync::config;
use apricot_sync::error::{SyncError, SyncResult};
use apricot_sync::filter::Eligibility;
use apricot_sync::model::{
    ContactUpdate, EventRegistration, Invoice, LevelRef, Record, RegistrationFilter, SearchState,
    UpdateResponse,
};
use apricot_sync::pipeline::{JobStatus, Pacing, RecordPipeline, RunTally};
use apricot_sync::report::{Summary, SummaryReporter};
use apricot_sync::search::{PollSettings, SearchPoller, SearchRequest};
use chrono::{DateTime, NaiveDate};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Default)]
struct RecordingApi {
    searches: Arc<Mutex<VecDeque<SyncResult<SearchState>>>>,
    responses: Arc<Mutex<VecDeque<SyncResult<UpdateResponse>>>>,
    updates: Arc<Mutex<Vec<ContactUpdate>>>,
    update_times: Arc<Mutex<Vec<Instant>>>,
    registrations: Arc<Mutex<VecDeque<SyncResult<Vec<EventRegistration>>>>>,
    registration_calls: Arc<Mutex<Vec<RegistrationFilter>>>,
}

impl RecordingApi {
    fn with_responses(responses: Vec<SyncResult<UpdateResponse>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            ..Default::default()
        }
    }

    fn with_searches(searches: Vec<SyncResult<SearchState>>) -> Self {
        Self {
            searches: Arc::new(Mutex::new(VecDeque::from(searches))),
            ..Default::default()
        }
    }

    fn with_registrations(registrations: Vec<SyncResult<Vec<EventRegistration>>>) -> Self {
        Self {
            registrations: Arc::new(Mutex::new(VecDeque::from(registrations))),
            ..Default::default()
        }
    }

    async fn updates(&self) -> Vec<ContactUpdate> {
        self.updates.lock().await.clone()
    }

    async fn update_times(&self) -> Vec<Instant> {
        self.update_times.lock().await.clone()
    }

    async fn registration_calls(&self) -> Vec<RegistrationFilter> {
        self.registration_calls.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl MembershipApi for RecordingApi {
    async fn search_contacts(&self, _request: &SearchRequest) -> SyncResult<SearchState> {
        self.searches
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Ok(SearchState::Unrecognized("script exhausted".into())))
    }

    async fn update_contact(&self, update: &ContactUpdate) -> SyncResult<UpdateResponse> {
        self.updates.lock().await.push(update.clone());
        self.update_times.lock().await.push(Instant::now());
        self.responses.lock().await.pop_front().unwrap_or_else(|| {
            Ok(UpdateResponse {
                id: Some(update.id),
                status: Some("Active".into()),
                ..Default::default()
            })
        })
    }

    async fn list_event_registrations(
        &self,
        filter: RegistrationFilter,
    ) -> SyncResult<Vec<EventRegistration>> {
        self.registration_calls.lock().await.push(filter);
        self.registrations
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn get_invoice(&self, invoice_id: i64) -> SyncResult<Invoice> {
        Err(SyncError::Protocol(format!("no invoice {}", invoice_id)))
    }
}

#[derive(Clone, Default)]
struct RecordingReporter {
    sent: Arc<Mutex<Vec<Summary>>>,
    fail: bool,
}

impl RecordingReporter {
    fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    async fn sent(&self) -> Vec<Summary> {
        self.sent.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl SummaryReporter for RecordingReporter {
    async fn send_summary(&self, summary: &Summary) -> Result<String> {
        self.sent.lock().await.push(summary.clone());
        if self.fail {
            return Err(anyhow!("relay down"));
        }
        Ok("msg-1".into())
    }
}

fn report_cfg() -> config::Report {
    config::Report {
        to: "help@example.org".into(),
        from: "bot@example.org".into(),
        reply_to: None,
        endpoint: None,
    }
}

fn no_pacing() -> Pacing {
    Pacing {
        after_update: Duration::ZERO,
        after_skip: Duration::ZERO,
        after_error: Duration::ZERO,
    }
}

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
}

fn member(id: i64, name: &str, since: Value) -> Record {
    Record::new(id, name, "Member")
        .with_field(MEMBER_SINCE, "MemberSince", since)
        .with_field(MEMBER_SINCE_READONLY, "custom-12345", Value::Null)
        .with_field("Membership enabled", "MembershipEnabled", json!(true))
}

fn pipeline<'a>(
    api: &'a RecordingApi,
    reporter: &'a RecordingReporter,
) -> RecordPipeline<'a, RecordingApi> {
    RecordPipeline::new(api, reporter, report_cfg())
        .with_context(ActionContext::new(today()))
        .with_pacing(no_pacing())
}

fn assert_balanced(tally: &RunTally) {
    assert_eq!(tally.updated + tally.skipped + tally.errors, tally.processed);
    assert_eq!(tally.outcomes.len() as u32, tally.processed);
}

#[tokio::test]
async fn processes_only_eligible_records() {
    let api = RecordingApi::default();
    let reporter = RecordingReporter::default();
    let records = vec![
        member(1, "Ann", json!("2020-05-01T00:00:00")),
        member(2, "Bob", json!("2019-01-15T00:00:00"))
            .with_field("Membership enabled", "MembershipEnabled", json!(false)),
        member(3, "Cy", Value::Null),
    ];

    let tally = pipeline(&api, &reporter)
        .with_eligibility(Eligibility::parse_all(&["'Membership enabled' == true"]).unwrap())
        .run(&records, "copyMemberSince")
        .await
        .unwrap();

    assert_eq!(tally.processed, 2);
    assert_eq!(tally.updated, 1);
    assert_eq!(tally.skipped, 1);
    assert_eq!(tally.errors, 0);
    assert_balanced(&tally);

    let updates = api.updates().await;
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].id, 1);
    assert_eq!(updates[0].field_values[0].field_name, MEMBER_SINCE_READONLY);
    assert_eq!(updates[0].field_values[0].system_code, "custom-12345");
    assert_eq!(updates[0].field_values[0].value, json!("2020-05-01"));

    let sent = reporter.sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].subject, "Copy Member Since Field");
    assert!(sent[0].text_body.starts_with(
        "copyMemberSince processed for 2 members with 1 updated, 1 skipped, and 0 errors"
    ));
}

#[tokio::test]
async fn one_failed_update_does_not_stop_the_batch() {
    let api = RecordingApi::with_responses(vec![
        Ok(UpdateResponse {
            id: Some(1),
            ..Default::default()
        }),
        Err(SyncError::Protocol("API error 500".into())),
        Ok(UpdateResponse {
            id: Some(3),
            ..Default::default()
        }),
    ]);
    let reporter = RecordingReporter::default();
    let records = vec![
        member(1, "Ann", json!("2020-05-01")),
        member(2, "Bob", json!("2021-06-02")),
        member(3, "Cy", json!("2022-07-03")),
    ];

    let tally = pipeline(&api, &reporter)
        .run(&records, "copyMemberSince")
        .await
        .unwrap();

    let statuses: Vec<(i64, JobStatus)> = tally
        .outcomes
        .iter()
        .map(|o| (o.target_id, o.status))
        .collect();
    assert_eq!(
        statuses,
        vec![
            (1, JobStatus::Updated),
            (2, JobStatus::Failed),
            (3, JobStatus::Updated)
        ]
    );
    assert_eq!(tally.errors, 1);
    assert_balanced(&tally);

    let sent = reporter.sent().await;
    assert!(sent[0].subject.starts_with("*** ERRORS: "));
    assert!(!sent[0].text_body.contains("Bob"));
}

#[tokio::test]
async fn response_without_id_counts_as_error() {
    let api = RecordingApi::with_responses(vec![Ok(UpdateResponse::default())]);
    let reporter = RecordingReporter::default();
    let records = vec![member(1, "Ann", json!("2020-05-01"))];

    let tally = pipeline(&api, &reporter)
        .run(&records, "copyMemberSince")
        .await
        .unwrap();
    assert_eq!(tally.errors, 1);
    assert_eq!(tally.updated, 0);
}

#[tokio::test]
async fn empty_batch_sends_no_summary() {
    let api = RecordingApi::default();
    let reporter = RecordingReporter::default();

    let tally = pipeline(&api, &reporter)
        .run(&[], "setNewbieFlag")
        .await
        .unwrap();

    assert_eq!(tally, RunTally::default());
    assert!(api.updates().await.is_empty());
    assert!(reporter.sent().await.is_empty());
}

#[tokio::test]
async fn unsupported_action_fails_before_any_call() {
    let api = RecordingApi::default();
    let reporter = RecordingReporter::default();
    let records = vec![member(1, "Ann", json!("2020-05-01"))];
    let pipeline = pipeline(&api, &reporter).supporting(&[Action::CopyMemberSince]);

    assert!(matches!(
        pipeline.run(&records, "updateRenewalDate").await,
        Err(SyncError::UnsupportedAction(tag)) if tag == "updateRenewalDate"
    ));
    assert!(matches!(
        pipeline.run(&records, "deleteEverything").await,
        Err(SyncError::UnsupportedAction(_))
    ));
    assert!(api.updates().await.is_empty());
    assert!(reporter.sent().await.is_empty());
}

#[tokio::test]
async fn level_change_requires_resolved_target() {
    let api = RecordingApi::default();
    let reporter = RecordingReporter::default();
    let records = vec![Record::new(5, "Nia", "New").with_field(
        "Membership status",
        "Status",
        json!({ "Id": 1, "Label": "Active" }),
    )];

    let result = pipeline(&api, &reporter)
        .run(&records, "newbieToNewcomerUpdate")
        .await;
    assert!(matches!(result, Err(SyncError::Config(_))));
    assert!(api.updates().await.is_empty());

    let target = LevelRef {
        id: 1207614,
        name: Some("NewcomerMember".into()),
        url: None,
    };
    let tally = pipeline(&api, &reporter)
        .with_context(ActionContext::new(today()).with_target_level(target))
        .run(&records, "newbieToNewcomerUpdate")
        .await
        .unwrap();
    assert_eq!(tally.updated, 1);
    let updates = api.updates().await;
    assert_eq!(updates[0].membership_level.as_ref().map(|l| l.id), Some(1207614));
    assert!(updates[0].field_values.is_empty());
}

#[tokio::test]
async fn authentication_failure_aborts_run() {
    let api = RecordingApi::with_responses(vec![
        Ok(UpdateResponse {
            id: Some(1),
            ..Default::default()
        }),
        Err(SyncError::Auth("invalid_grant: bad credentials".into())),
    ]);
    let reporter = RecordingReporter::default();
    let records = vec![
        member(1, "Ann", json!("2020-05-01")),
        member(2, "Bob", json!("2021-06-02")),
        member(3, "Cy", json!("2022-07-03")),
    ];

    let result = pipeline(&api, &reporter)
        .run(&records, "copyMemberSince")
        .await;
    assert!(matches!(result, Err(SyncError::Auth(_))));
    assert_eq!(api.updates().await.len(), 2);
    assert!(reporter.sent().await.is_empty());
}

#[tokio::test]
async fn missing_field_rejects_record_only() {
    let api = RecordingApi::default();
    let reporter = RecordingReporter::default();
    let incomplete = Record::new(9, "Zed", "Partial").with_field(
        MEMBER_SINCE,
        "MemberSince",
        json!("2018-02-02"),
    );
    let records = vec![incomplete, member(1, "Ann", json!("2020-05-01"))];

    let tally = pipeline(&api, &reporter)
        .run(&records, "copyMemberSince")
        .await
        .unwrap();

    assert_eq!(tally.invalid, 1);
    assert_eq!(tally.processed, 1);
    assert_eq!(tally.updated, 1);
    assert_balanced(&tally);
    assert_eq!(api.updates().await.len(), 1);
}

#[tokio::test]
async fn reporter_failure_keeps_the_tally() {
    let api = RecordingApi::default();
    let reporter = RecordingReporter::failing();
    let records = vec![member(1, "Ann", json!("2020-05-01"))];

    let tally = pipeline(&api, &reporter)
        .run(&records, "copyMemberSince")
        .await
        .unwrap();
    assert_eq!(tally.updated, 1);
    assert_eq!(reporter.sent().await.len(), 1);
}

#[tokio::test]
async fn each_run_starts_from_zero() {
    let api = RecordingApi::default();
    let reporter = RecordingReporter::default();
    let pipeline = pipeline(&api, &reporter);
    let records = vec![
        member(1, "Ann", json!("2020-05-01")),
        member(2, "Bob", json!("2021-06-02")),
    ];

    let first = pipeline.run(&records, "copyMemberSince").await.unwrap();
    let second = pipeline.run(&records[..1], "copyMemberSince").await.unwrap();
    assert_eq!(first.processed, 2);
    assert_eq!(second.processed, 1);
    assert_eq!(second.updated, 1);
}

#[tokio::test(start_paused = true)]
async fn cancellation_stops_before_next_record() {
    let api = RecordingApi::default();
    let reporter = RecordingReporter::default();
    let cancel = CancellationToken::new();
    let records = vec![
        member(1, "Ann", json!("2020-05-01")),
        member(2, "Bob", json!("2021-06-02")),
        member(3, "Cy", json!("2022-07-03")),
    ];

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1500)).await;
        trigger.cancel();
    });

    let tally = RecordPipeline::new(&api, &reporter, report_cfg())
        .with_context(ActionContext::new(today()))
        .with_pacing(Pacing::default())
        .with_cancel(cancel)
        .run(&records, "copyMemberSince")
        .await
        .unwrap();

    assert_eq!(tally.processed, 2);
    assert_balanced(&tally);
    assert_eq!(reporter.sent().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_search_never_invokes_pipeline() {
    let api = RecordingApi::with_searches(vec![
        Ok(SearchState::Waiting { result_id: None }),
        Ok(SearchState::Failed("{}".into())),
    ]);
    let reporter = RecordingReporter::default();
    let poller = SearchPoller::new(&api, PollSettings::default(), CancellationToken::new());

    let result = pipeline(&api, &reporter)
        .run_search(&poller, SearchRequest::new("'Status' eq 'Active'"), "copyMemberSince")
        .await
        .unwrap();

    assert_eq!(result, None);
    assert!(api.updates().await.is_empty());
    assert!(reporter.sent().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn completed_search_feeds_pipeline() {
    let api = RecordingApi::with_searches(vec![
        Ok(SearchState::Processing { result_id: None }),
        Ok(SearchState::Complete {
            records: None,
            result_id: Some("r-2".into()),
        }),
        Ok(SearchState::Complete {
            records: Some(vec![member(1, "Ann", json!("2020-05-01"))]),
            result_id: Some("r-2".into()),
        }),
    ]);
    let reporter = RecordingReporter::default();
    let poller = SearchPoller::new(&api, PollSettings::default(), CancellationToken::new());

    let tally = pipeline(&api, &reporter)
        .run_search(&poller, SearchRequest::new("'Status' eq 'Active'"), "copyMemberSince")
        .await
        .unwrap()
        .expect("search completed");

    assert_eq!(tally.updated, 1);
    assert_eq!(reporter.sent().await.len(), 1);
}

fn alum(id: i64, name: &str, renewal: Value) -> Record {
    Record::new(id, name, "Alum").with_field(RENEWAL_DUE, "RenewalDue", renewal)
}

fn registered(id: i64, at: &str) -> EventRegistration {
    EventRegistration {
        id,
        event: None,
        contact: None,
        registration_type: None,
        registration_fee: None,
        registration_date: Some(DateTime::parse_from_rfc3339(at).unwrap()),
        invoice: None,
        is_paid: None,
    }
}

#[tokio::test(start_paused = true)]
async fn each_job_is_followed_by_its_pacing_delay() {
    let api = RecordingApi::with_responses(vec![
        Ok(UpdateResponse {
            id: Some(1),
            ..Default::default()
        }),
        Err(SyncError::Protocol("API error 500".into())),
    ]);
    let reporter = RecordingReporter::default();
    let pacing = Pacing {
        after_update: Duration::from_millis(1000),
        after_skip: Duration::from_millis(500),
        after_error: Duration::from_millis(700),
    };
    let records = vec![
        member(1, "Ann", json!("2020-05-01")),
        member(2, "Bob", Value::Null),
        member(3, "Cy", json!("2022-07-03")),
    ];

    let started = Instant::now();
    let tally = RecordPipeline::new(&api, &reporter, report_cfg())
        .with_context(ActionContext::new(today()))
        .with_pacing(pacing.clone())
        .run(&records, "copyMemberSince")
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!((tally.updated, tally.skipped, tally.errors), (1, 1, 1));
    assert_eq!(
        elapsed,
        pacing.after_update + pacing.after_skip + pacing.after_error
    );
    let times = api.update_times().await;
    assert_eq!(times.len(), 2);
    assert_eq!(times[0], started);
    assert_eq!(times[1] - times[0], pacing.after_update + pacing.after_skip);
}

#[tokio::test]
async fn renewal_follows_latest_event_registration() {
    let api = RecordingApi::with_registrations(vec![
        Ok(vec![
            registered(10, "2024-02-01T18:00:00-08:00"),
            registered(11, "2024-05-20T18:30:00-07:00"),
            registered(12, "2023-11-11T10:00:00-08:00"),
        ]),
        Ok(Vec::new()),
        Err(SyncError::Protocol("API error 503".into())),
        Ok(vec![registered(13, "2024-01-10T10:00:00-08:00")]),
    ]);
    let reporter = RecordingReporter::default();
    let records = vec![
        alum(1, "Ann", json!("2024-03-31T00:00:00")),
        alum(2, "Bob", json!("2024-03-31T00:00:00")),
        alum(3, "Cy", json!("2024-03-31T00:00:00")),
        alum(4, "Di", json!("2024-03-31T00:00:00")),
    ];

    let tally = pipeline(&api, &reporter)
        .run(&records, "renewFromEventRegistration")
        .await
        .unwrap();

    let statuses: Vec<(i64, JobStatus)> = tally
        .outcomes
        .iter()
        .map(|o| (o.target_id, o.status))
        .collect();
    assert_eq!(
        statuses,
        vec![
            (1, JobStatus::Updated),
            (2, JobStatus::Skipped),
            (3, JobStatus::Failed),
            (4, JobStatus::Skipped)
        ]
    );
    assert_balanced(&tally);
    assert_eq!(
        api.registration_calls().await,
        vec![
            RegistrationFilter::Contact(1),
            RegistrationFilter::Contact(2),
            RegistrationFilter::Contact(3),
            RegistrationFilter::Contact(4)
        ]
    );

    let updates = api.updates().await;
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].id, 1);
    assert_eq!(updates[0].field_values[0].field_name, RENEWAL_DUE);
    assert_eq!(updates[0].field_values[0].system_code, "RenewalDue");
    assert_eq!(updates[0].field_values[0].value, json!("2024-05-20"));

    let sent = reporter.sent().await;
    assert_eq!(
        sent[0].subject,
        "*** ERRORS: Renewal Date Database Update for Existing Alumni"
    );
}

#[tokio::test]
async fn registration_lookup_auth_failure_aborts_run() {
    let api = RecordingApi::with_registrations(vec![Err(SyncError::Auth("expired".into()))]);
    let reporter = RecordingReporter::default();
    let records = vec![alum(1, "Ann", json!("2024-03-31T00:00:00"))];

    let result = pipeline(&api, &reporter)
        .run(&records, "renewFromEventRegistration")
        .await;
    assert!(matches!(result, Err(SyncError::Auth(_))));
    assert!(api.updates().await.is_empty());
    assert!(reporter.sent().await.is_empty());
}

#[tokio::test]
async fn other_actions_never_list_registrations() {
    let api = RecordingApi::default();
    let reporter = RecordingReporter::default();
    let records = vec![alum(1, "Ann", json!("2024-03-31T00:00:00"))];

    pipeline(&api, &reporter)
        .run(&records, "updateRenewalDate")
        .await
        .unwrap();
    assert!(api.registration_calls().await.is_empty());
}
