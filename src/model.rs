use chrono::{DateTime, FixedOffset, NaiveDate};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::{SyncError, SyncResult};

/// One value of a contact field together with the system code the API wants back on update.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldValue {
    pub system_code: String,
    pub value: Value,
}

impl FieldValue {
    pub fn is_empty(&self) -> bool {
        match &self.value {
            Value::Null => true,
            Value::String(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    /// Date part of a timestamp-valued field (`2019-05-01T00:00:00-07:00` -> 2019-05-01).
    pub fn as_date(&self) -> Option<NaiveDate> {
        let s = self.value.as_str()?;
        let day = s.get(..10)?;
        NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
    }

    /// Choice fields come back as `{ "Id": .., "Label": .. }`.
    pub fn label(&self) -> Option<&str> {
        match &self.value {
            Value::Object(obj) => obj.get("Label").and_then(Value::as_str),
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawFieldValue {
    field_name: String,
    #[serde(default)]
    system_code: String,
    #[serde(default)]
    value: Value,
}

fn fields_by_name<'de, D>(de: D) -> Result<BTreeMap<String, FieldValue>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<Vec<RawFieldValue>> = Option::deserialize(de)?;
    let mut fields = BTreeMap::new();
    for f in raw.unwrap_or_default() {
        // first occurrence wins
        fields.entry(f.field_name).or_insert(FieldValue {
            system_code: f.system_code,
            value: f.value,
        });
    }
    Ok(fields)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LevelRef {
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// A contact as returned by the contacts search. Read-only input to the pipeline.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Record {
    pub id: i64,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub membership_level: Option<LevelRef>,
    #[serde(rename = "FieldValues", default, deserialize_with = "fields_by_name")]
    pub fields: BTreeMap<String, FieldValue>,
}

impl Record {
    pub fn new(id: i64, first_name: &str, last_name: &str) -> Self {
        Self {
            id,
            first_name: Some(first_name.to_string()),
            last_name: Some(last_name.to_string()),
            email: None,
            status: None,
            membership_level: None,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: &str, system_code: &str, value: Value) -> Self {
        self.fields.insert(
            name.to_string(),
            FieldValue {
                system_code: system_code.to_string(),
                value,
            },
        );
        self
    }

    pub fn with_level(mut self, id: i64, name: &str) -> Self {
        self.membership_level = Some(LevelRef {
            id,
            name: Some(name.to_string()),
            url: None,
        });
        self
    }

    /// Exact-name field lookup. A missing field is an error, never a null.
    pub fn field(&self, name: &str) -> SyncResult<&FieldValue> {
        self.fields.get(name).ok_or_else(|| SyncError::MissingField {
            contact_id: self.id,
            field: name.to_string(),
        })
    }

    pub fn display_name(&self) -> String {
        let first = self.first_name.as_deref().unwrap_or("");
        let last = self.last_name.as_deref().unwrap_or("");
        format!("{} {}", first, last).trim().to_string()
    }
}

/// Raw body of `GET /accounts/{id}/contacts`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SearchResponse {
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub result_id: Option<String>,
    #[serde(default)]
    pub contacts: Option<Vec<Record>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Asynchronous status of a long-running contacts search.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchState {
    Waiting {
        result_id: Option<String>,
    },
    Processing {
        result_id: Option<String>,
    },
    Complete {
        records: Option<Vec<Record>>,
        result_id: Option<String>,
    },
    Failed(String),
    Unrecognized(String),
}

impl From<SearchResponse> for SearchState {
    fn from(res: SearchResponse) -> Self {
        match res.state.as_deref() {
            Some("Waiting") => SearchState::Waiting {
                result_id: res.result_id,
            },
            Some("Processing") => SearchState::Processing {
                result_id: res.result_id,
            },
            Some("Complete") => SearchState::Complete {
                records: res.contacts,
                result_id: res.result_id,
            },
            Some("Failed") => {
                let mut diag = res.extra;
                if let Some(id) = res.result_id {
                    diag.insert("ResultId".into(), Value::String(id));
                }
                SearchState::Failed(Value::Object(diag).to_string())
            }
            Some(other) => SearchState::Unrecognized(other.to_string()),
            None => SearchState::Unrecognized("<missing>".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct FieldUpdate {
    pub field_name: String,
    pub system_code: String,
    pub value: Value,
}

/// Body of `PUT /accounts/{id}/contacts/{contactId}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContactUpdate {
    pub id: i64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub field_values: Vec<FieldUpdate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub membership_level: Option<LevelRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UpdateResponse {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IdName {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Session {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub title: Option<String>,
    pub start_date: DateTime<FixedOffset>,
    #[serde(default)]
    pub end_date: Option<DateTime<FixedOffset>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Event {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    pub start_date: DateTime<FixedOffset>,
    #[serde(default)]
    pub end_date: Option<DateTime<FixedOffset>>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub sessions: Option<Vec<Session>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EventList {
    #[serde(default)]
    pub events: Vec<Event>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EventRegistration {
    pub id: i64,
    #[serde(default)]
    pub event: Option<IdName>,
    #[serde(default)]
    pub contact: Option<IdName>,
    #[serde(default)]
    pub registration_type: Option<IdName>,
    #[serde(default)]
    pub registration_fee: Option<f64>,
    #[serde(default)]
    pub registration_date: Option<DateTime<FixedOffset>>,
    #[serde(default)]
    pub invoice: Option<IdName>,
    #[serde(default)]
    pub is_paid: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Invoice {
    pub id: i64,
    #[serde(default)]
    pub document_number: Option<String>,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub is_paid: Option<bool>,
}

/// Filter for `GET /accounts/{id}/eventregistrations`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationFilter {
    Event(i64),
    Contact(i64),
}
