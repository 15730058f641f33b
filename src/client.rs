use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use tracing::{debug, warn};

use crate::auth::{Credential, TokenManager};
use crate::config::Config;
use crate::error::{SyncError, SyncResult};
use crate::model::{
    ContactUpdate, Event, EventList, EventRegistration, Invoice, LevelRef, Record,
    RegistrationFilter, SearchResponse, SearchState, UpdateResponse,
};
use crate::search::SearchRequest;

/// Calls the poller, the pipeline and the registration roster make against the platform.
#[async_trait]
pub trait MembershipApi: Send + Sync {
    async fn search_contacts(&self, request: &SearchRequest) -> SyncResult<SearchState>;

    async fn update_contact(&self, update: &ContactUpdate) -> SyncResult<UpdateResponse>;

    async fn list_event_registrations(
        &self,
        filter: RegistrationFilter,
    ) -> SyncResult<Vec<EventRegistration>>;

    async fn get_invoice(&self, invoice_id: i64) -> SyncResult<Invoice>;
}

pub struct ApiClient {
    http: Client,
    base_url: Url,
    account_id: String,
    tokens: TokenManager,
}

impl fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url)
            .field("account_id", &self.account_id)
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    pub fn new(mut base_url: Url, account_id: String, tokens: TokenManager) -> SyncResult<Self> {
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let http = Client::builder()
            .user_agent("apricot-sync/0.1")
            .no_proxy()
            .build()?;
        Ok(Self {
            http,
            base_url,
            account_id,
            tokens,
        })
    }

    pub fn from_config(cfg: &Config) -> SyncResult<Self> {
        let base_url = Url::parse(&cfg.api.api_base)
            .map_err(|e| SyncError::Config(format!("api.api_base: {}", e)))?;
        let tokens = TokenManager::from_config(&cfg.api)?;
        Self::new(base_url, cfg.api.account_id.clone(), tokens)
    }

    pub fn account_url(&self, path: &str) -> SyncResult<Url> {
        self.base_url
            .join(&format!("accounts/{}/{}", self.account_id, path))
            .map_err(|e| SyncError::Config(format!("invalid API URL for '{}': {}", path, e)))
    }

    /// Decorate a call with the bearer credential and JSON content type.
    pub fn build_request<B: Serialize + ?Sized>(
        &self,
        method: Method,
        url: Url,
        credential: &Credential,
        query: &[(&str, String)],
        body: Option<&B>,
    ) -> SyncResult<reqwest::Request> {
        let mut builder = self
            .http
            .request(method, url)
            .header(
                "Authorization",
                format!("Bearer {}", credential.bearer_token),
            )
            .header("Content-Type", "application/json")
            .header("Accept", "application/json");
        if !query.is_empty() {
            builder = builder.query(query);
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }
        Ok(builder.build()?)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> SyncResult<T> {
        let credential = self.tokens.ensure_valid_credential().await?;
        let url = self.account_url(path)?;
        let request = self.build_request(method, url, &credential, query, body.as_ref())?;
        debug!(method = %request.method(), url = %request.url(), "sending API request");

        let res = self.http.execute(request).await?;
        let status = res.status();
        if status == StatusCode::UNAUTHORIZED {
            // token revoked server-side before its reported expiry
            self.tokens.invalidate().await;
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            let body = res.text().await.unwrap_or_default();
            warn!(%status, "rate limited by membership API");
            return Err(SyncError::Protocol(format!("received 429: {}", body)));
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(SyncError::Protocol(format!("API error {}: {}", status, body)));
        }
        let text = res.text().await?;
        serde_json::from_str(&text)
            .map_err(|e| SyncError::Protocol(format!("invalid response JSON from {}: {}", path, e)))
    }

    pub async fn get_contact(&self, contact_id: i64) -> SyncResult<Record> {
        let path = format!("contacts/{}", contact_id);
        self.call(Method::GET, &path, &[], None).await
    }

    /// List events, optionally narrowed by a `$filter` expression and ordered by `$sort`.
    pub async fn list_events(
        &self,
        filter: Option<&str>,
        sort: Option<&str>,
    ) -> SyncResult<Vec<Event>> {
        let mut query = Vec::new();
        if let Some(f) = filter {
            query.push(("$filter", f.to_string()));
        }
        if let Some(s) = sort {
            query.push(("$sort", s.to_string()));
        }
        let list: EventList = self.call(Method::GET, "events", &query, None).await?;
        Ok(list.events)
    }

    /// Single event with its session list, which the event list may leave out.
    pub async fn get_event(&self, event_id: i64) -> SyncResult<Event> {
        let path = format!("events/{}", event_id);
        self.call(Method::GET, &path, &[], None).await
    }

    pub async fn list_membership_levels(&self) -> SyncResult<Vec<LevelRef>> {
        self.call(Method::GET, "membershiplevels", &[], None).await
    }

    /// Resolve a membership level id from its display name.
    pub async fn lookup_membership_level(&self, name: &str) -> SyncResult<LevelRef> {
        let levels = self.list_membership_levels().await?;
        levels
            .into_iter()
            .find(|l| l.name.as_deref() == Some(name))
            .ok_or_else(|| SyncError::Config(format!("membership level '{}' not found", name)))
    }
}

#[async_trait]
impl MembershipApi for ApiClient {
    async fn search_contacts(&self, request: &SearchRequest) -> SyncResult<SearchState> {
        let res: SearchResponse = self
            .call(Method::GET, "contacts", &request.query_pairs(), None)
            .await?;
        Ok(SearchState::from(res))
    }

    async fn update_contact(&self, update: &ContactUpdate) -> SyncResult<UpdateResponse> {
        let body = serde_json::to_value(update)
            .map_err(|e| SyncError::Protocol(format!("unserializable update: {}", e)))?;
        let path = format!("contacts/{}", update.id);
        self.call(Method::PUT, &path, &[], Some(body)).await
    }

    async fn list_event_registrations(
        &self,
        filter: RegistrationFilter,
    ) -> SyncResult<Vec<EventRegistration>> {
        let query = match filter {
            RegistrationFilter::Event(id) => vec![("eventId", id.to_string())],
            RegistrationFilter::Contact(id) => vec![
                ("contactId", id.to_string()),
                ("includeWaitList", "true".to_string()),
            ],
        };
        self.call(Method::GET, "eventregistrations", &query, None).await
    }

    async fn get_invoice(&self, invoice_id: i64) -> SyncResult<Invoice> {
        let path = format!("Invoices/{}", invoice_id);
        self.call(Method::GET, &path, &[], None).await
    }
}
