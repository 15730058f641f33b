use chrono::{Datelike, Duration, NaiveDate};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{SyncError, SyncResult};
use crate::model::{ContactUpdate, EventRegistration, FieldUpdate, FieldValue, LevelRef, Record};

pub const RENEWAL_DUE: &str = "Renewal due";
pub const MEMBER_SINCE: &str = "Member since";
pub const MEMBER_SINCE_READONLY: &str = "Member since readonly";
pub const NEW_MEMBER: &str = "New member";
pub const NEW_MEMBER_UPDATED_ON: &str = "New member updated on";
pub const MEMBERSHIP_STATUS: &str = "Membership status";

/// Days added to an alumni renewal date.
const RENEWAL_EXTENSION_DAYS: i64 = 730;

/// Supported per-record mutations. The tag strings are the ones used in query configs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    UpdateRenewalDate,
    RenewFromEventRegistration,
    CopyMemberSince,
    SetNewbieFlag,
    ClearNewbieFlag,
    NewbieToNewcomer,
}

impl Action {
    pub const ALL: [Action; 6] = [
        Action::UpdateRenewalDate,
        Action::RenewFromEventRegistration,
        Action::CopyMemberSince,
        Action::SetNewbieFlag,
        Action::ClearNewbieFlag,
        Action::NewbieToNewcomer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::UpdateRenewalDate => "updateRenewalDate",
            Action::RenewFromEventRegistration => "renewFromEventRegistration",
            Action::CopyMemberSince => "copyMemberSince",
            Action::SetNewbieFlag => "setNewbieFlag",
            Action::ClearNewbieFlag => "clearNewbieFlag",
            Action::NewbieToNewcomer => "newbieToNewcomerUpdate",
        }
    }

    /// Subject line of the end-of-run summary.
    pub fn subject(&self) -> &'static str {
        match self {
            Action::UpdateRenewalDate => "Renewal Date Database Update",
            Action::RenewFromEventRegistration => {
                "Renewal Date Database Update for Existing Alumni"
            }
            Action::CopyMemberSince => "Copy Member Since Field",
            Action::SetNewbieFlag | Action::ClearNewbieFlag => "Newbie Flag Database Update",
            Action::NewbieToNewcomer => "Newbie to Newcomer update",
        }
    }

    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            Action::UpdateRenewalDate | Action::RenewFromEventRegistration => &[RENEWAL_DUE],
            Action::CopyMemberSince => &[MEMBER_SINCE, MEMBER_SINCE_READONLY],
            Action::SetNewbieFlag | Action::ClearNewbieFlag => &[NEW_MEMBER, NEW_MEMBER_UPDATED_ON],
            Action::NewbieToNewcomer => &[MEMBERSHIP_STATUS],
        }
    }

    pub fn needs_target_level(&self) -> bool {
        matches!(self, Action::NewbieToNewcomer)
    }

    /// The decision reads the contact's event registrations, fetched per job.
    pub fn needs_registrations(&self) -> bool {
        matches!(self, Action::RenewFromEventRegistration)
    }

    /// Extract the fields this action reads into a job. Fails on the first missing field.
    pub fn prepare(&self, record: &Record) -> SyncResult<UpdateJob> {
        let mut fields = BTreeMap::new();
        for name in self.required_fields() {
            let field = record.field(name)?;
            fields.insert(name.to_string(), field.clone());
        }
        Ok(UpdateJob {
            target_id: record.id,
            action: *self,
            display_name: record.display_name(),
            fields,
            latest_registration: None,
        })
    }

    pub fn decide(&self, job: &UpdateJob, ctx: &ActionContext) -> Verdict {
        match self {
            Action::UpdateRenewalDate => {
                let Some(renewal) = job.field(RENEWAL_DUE) else {
                    return Verdict::Skip(format!("no '{}' field", RENEWAL_DUE));
                };
                let Some(current) = renewal.as_date() else {
                    return Verdict::Skip("renewal date not set".to_string());
                };
                if current.year() > ctx.today.year() {
                    return Verdict::Skip(format!("renewal date already set to {}", current));
                }
                let next = current + Duration::days(RENEWAL_EXTENSION_DAYS);
                Verdict::Apply(job.set_fields(vec![(RENEWAL_DUE, renewal, date_value(next))]))
            }
            Action::RenewFromEventRegistration => {
                let Some(renewal) = job.field(RENEWAL_DUE) else {
                    return Verdict::Skip(format!("no '{}' field", RENEWAL_DUE));
                };
                let Some(latest) = job.latest_registration else {
                    return Verdict::Skip("no event registrations".to_string());
                };
                match renewal.as_date() {
                    Some(current) if current >= latest => Verdict::Skip(format!(
                        "renewal date {} not before latest registration {}",
                        current, latest
                    )),
                    _ => Verdict::Apply(job.set_fields(vec![(
                        RENEWAL_DUE,
                        renewal,
                        date_value(latest),
                    )])),
                }
            }
            Action::CopyMemberSince => {
                let (Some(since), Some(readonly)) =
                    (job.field(MEMBER_SINCE), job.field(MEMBER_SINCE_READONLY))
                else {
                    return Verdict::Skip("member since fields absent".to_string());
                };
                match since.as_date() {
                    Some(date) => Verdict::Apply(job.set_fields(vec![(
                        MEMBER_SINCE_READONLY,
                        readonly,
                        date_value(date),
                    )])),
                    None => Verdict::Skip("member since not set".to_string()),
                }
            }
            Action::SetNewbieFlag | Action::ClearNewbieFlag => {
                let (Some(flag), Some(stamp)) =
                    (job.field(NEW_MEMBER), job.field(NEW_MEMBER_UPDATED_ON))
                else {
                    return Verdict::Skip("new member fields absent".to_string());
                };
                let value = if *self == Action::SetNewbieFlag {
                    if !flag.is_empty() {
                        return Verdict::Skip(format!(
                            "newbie flag already set to '{}'",
                            flag.label().unwrap_or("?")
                        ));
                    }
                    "Yes"
                } else {
                    "No"
                };
                Verdict::Apply(job.set_fields(vec![
                    (NEW_MEMBER, flag, Value::String(value.to_string())),
                    (NEW_MEMBER_UPDATED_ON, stamp, date_value(ctx.today)),
                ]))
            }
            Action::NewbieToNewcomer => match &ctx.target_level {
                Some(level) => Verdict::Apply(ContactUpdate {
                    id: job.target_id,
                    field_values: Vec::new(),
                    membership_level: Some(LevelRef {
                        id: level.id,
                        name: None,
                        url: None,
                    }),
                }),
                None => Verdict::Skip("target membership level unresolved".to_string()),
            },
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = SyncError;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        Action::ALL
            .iter()
            .copied()
            .find(|a| a.as_str() == tag)
            .ok_or_else(|| SyncError::UnsupportedAction(tag.to_string()))
    }
}

fn date_value(date: NaiveDate) -> Value {
    Value::String(date.format("%Y-%m-%d").to_string())
}

/// Inputs to the decision policies that do not come from the record.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionContext {
    pub today: NaiveDate,
    pub target_level: Option<LevelRef>,
}

impl ActionContext {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            today,
            target_level: None,
        }
    }

    pub fn with_target_level(mut self, level: LevelRef) -> Self {
        self.target_level = Some(level);
        self
    }
}

/// One pending mutation of one contact, built from a snapshot of the fields it needs.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateJob {
    pub target_id: i64,
    pub action: Action,
    pub display_name: String,
    pub fields: BTreeMap<String, FieldValue>,
    /// Date of the most recent event registration, when the action reads registrations.
    pub latest_registration: Option<NaiveDate>,
}

impl UpdateJob {
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Remember the latest dated registration; undated ones are ignored.
    pub fn attach_registrations(&mut self, registrations: &[EventRegistration]) {
        self.latest_registration = registrations
            .iter()
            .filter_map(|r| r.registration_date)
            .max()
            .map(|at| at.date_naive());
    }

    fn set_fields(&self, values: Vec<(&str, &FieldValue, Value)>) -> ContactUpdate {
        ContactUpdate {
            id: self.target_id,
            field_values: values
                .into_iter()
                .map(|(name, current, value)| FieldUpdate {
                    field_name: name.to_string(),
                    system_code: current.system_code.clone(),
                    value,
                })
                .collect(),
            membership_level: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Apply(ContactUpdate),
    Skip(String),
}
