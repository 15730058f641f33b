//! Client-side eligibility predicates applied to search results before any update.
//!
//! Accepted forms:
//! - `'Field name' == literal` / `'Field name' != literal` where literal is
//!   `true`, `false`, `null`, a number or a single-quoted string
//! - `level == 'Level name'` / `level != 'Level name'`
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::error::{SyncError, SyncResult};
use crate::model::{FieldValue, Record};

static FIELD_EXPR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*'([^']+)'\s*(==|!=)\s*(.+?)\s*$").expect("valid field predicate regex")
});
static LEVEL_EXPR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*level\s*(==|!=)\s*'([^']*)'\s*$").expect("valid level predicate regex")
});

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Field {
        name: String,
        expected: Value,
        negate: bool,
    },
    Level {
        name: String,
        negate: bool,
    },
}

fn parse_literal(raw: &str) -> SyncResult<Value> {
    match raw {
        "true" => Ok(Value::Bool(true)),
        "false" => Ok(Value::Bool(false)),
        "null" => Ok(Value::Null),
        _ if raw.len() >= 2 && raw.starts_with('\'') && raw.ends_with('\'') => {
            Ok(Value::String(raw[1..raw.len() - 1].to_string()))
        }
        _ => serde_json::from_str::<serde_json::Number>(raw)
            .map(Value::Number)
            .map_err(|_| SyncError::Config(format!("unrecognised literal '{}'", raw))),
    }
}

fn field_matches(field: &FieldValue, expected: &Value) -> bool {
    match expected {
        Value::Null => field.is_empty(),
        Value::Bool(b) => match &field.value {
            Value::Bool(actual) => actual == b,
            Value::String(s) => s.eq_ignore_ascii_case(if *b { "true" } else { "false" }),
            _ => false,
        },
        Value::Number(n) => match (&field.value, n.as_f64()) {
            (Value::Number(actual), Some(want)) => actual.as_f64() == Some(want),
            (Value::String(s), Some(want)) => s.trim().parse::<f64>().ok() == Some(want),
            _ => false,
        },
        Value::String(s) => field.label() == Some(s.as_str()),
        _ => false,
    }
}

impl Predicate {
    pub fn parse(expr: &str) -> SyncResult<Self> {
        if let Some(caps) = LEVEL_EXPR.captures(expr) {
            return Ok(Predicate::Level {
                negate: &caps[1] == "!=",
                name: caps[2].to_string(),
            });
        }
        if let Some(caps) = FIELD_EXPR.captures(expr) {
            return Ok(Predicate::Field {
                name: caps[1].to_string(),
                negate: &caps[2] == "!=",
                expected: parse_literal(&caps[3])?,
            });
        }
        Err(SyncError::Config(format!(
            "unrecognised eligibility expression: {}",
            expr
        )))
    }

    /// A record lacking the named field (or a membership level) never matches.
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Predicate::Field {
                name,
                expected,
                negate,
            } => match record.fields.get(name) {
                Some(field) => field_matches(field, expected) != *negate,
                None => false,
            },
            Predicate::Level { name, negate } => {
                match record.membership_level.as_ref().and_then(|l| l.name.as_deref()) {
                    Some(level) => (level == name) != *negate,
                    None => false,
                }
            }
        }
    }
}

/// Conjunction of predicates. Pure: records are never touched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Eligibility {
    predicates: Vec<Predicate>,
}

impl Eligibility {
    pub fn parse_all<S: AsRef<str>>(exprs: &[S]) -> SyncResult<Self> {
        let predicates = exprs
            .iter()
            .map(|e| Predicate::parse(e.as_ref()))
            .collect::<SyncResult<Vec<_>>>()?;
        Ok(Self { predicates })
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    pub fn admits(&self, record: &Record) -> bool {
        self.predicates.iter().all(|p| p.matches(record))
    }

    pub fn apply<'r>(&self, records: &'r [Record]) -> Vec<&'r Record> {
        records.iter().filter(|r| self.admits(r)).collect()
    }
}
