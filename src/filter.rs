//! Nostr filter parsing and event matching.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::event::{Event, EventId, PublicKey};

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("filter must be a JSON object")]
    NotAnObject,
    #[error("filter set must be a JSON array of objects")]
    NotAnArray,
    #[error("invalid `{field}`: {reason}")]
    InvalidField { field: String, reason: String },
    #[error("limit can't be negative")]
    NegativeLimit,
}

fn invalid(field: &str, reason: impl ToString) -> FilterError {
    FilterError::InvalidField {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

/// Conjunctive predicate over stored events. Empty dimensions are
/// unconstrained.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub ids: Vec<EventId>,
    pub kinds: Vec<u32>,
    pub authors: Vec<PublicKey>,
    /// Tag name (without the `#`) to accepted values.
    pub tags: BTreeMap<String, Vec<String>>,
    /// Exclusive lower bound on `created_at`.
    pub since: Option<u64>,
    /// Exclusive upper bound on `created_at`.
    pub until: Option<u64>,
    /// Result cap for this clause during retrieval.
    pub limit: Option<usize>,
}

impl Filter {
    /// Build a `Filter` from a Nostr filter JSON object used by HTTP and WS APIs.
    pub fn from_value(val: &Value) -> Result<Self, FilterError> {
        let obj = val.as_object().ok_or(FilterError::NotAnObject)?;
        let mut filter = Filter::default();
        for (key, v) in obj {
            match key.as_str() {
                "ids" => {
                    filter.ids = strings(key, v)?
                        .iter()
                        .map(|s| EventId::from_hex(s).map_err(|e| invalid(key, e)))
                        .collect::<Result<_, _>>()?;
                }
                "authors" => {
                    filter.authors = strings(key, v)?
                        .iter()
                        .map(|s| PublicKey::from_hex(s).map_err(|e| invalid(key, e)))
                        .collect::<Result<_, _>>()?;
                }
                "kinds" => {
                    let arr = v.as_array().ok_or_else(|| invalid(key, "expected array"))?;
                    filter.kinds = arr
                        .iter()
                        .map(|k| {
                            k.as_u64()
                                .and_then(|k| u32::try_from(k).ok())
                                .ok_or_else(|| invalid(key, format!("bad kind {k}")))
                        })
                        .collect::<Result<_, _>>()?;
                }
                "since" => filter.since = Some(timestamp(key, v)?),
                "until" => filter.until = Some(timestamp(key, v)?),
                "limit" => {
                    let n = v.as_i64().ok_or_else(|| invalid(key, "expected integer"))?;
                    if n < 0 {
                        return Err(FilterError::NegativeLimit);
                    }
                    filter.limit = Some(n as usize);
                }
                _ => {
                    if let Some(name) = key.strip_prefix('#').filter(|n| !n.is_empty()) {
                        filter.tags.insert(name.to_string(), strings(key, v)?);
                    }
                }
            }
        }
        Ok(filter)
    }

    /// Wire form accepted by relays.
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        if !self.ids.is_empty() {
            obj.insert("ids".into(), self.ids.iter().map(|i| i.to_hex()).collect());
        }
        if !self.kinds.is_empty() {
            obj.insert("kinds".into(), self.kinds.iter().copied().collect());
        }
        if !self.authors.is_empty() {
            obj.insert(
                "authors".into(),
                self.authors.iter().map(|a| a.to_hex()).collect(),
            );
        }
        for (name, values) in &self.tags {
            obj.insert(format!("#{name}"), values.iter().cloned().collect());
        }
        if let Some(since) = self.since {
            obj.insert("since".into(), since.into());
        }
        if let Some(until) = self.until {
            obj.insert("until".into(), until.into());
        }
        if let Some(limit) = self.limit {
            obj.insert("limit".into(), limit.into());
        }
        Value::Object(obj)
    }

    pub fn matches(&self, ev: &Event) -> bool {
        if !self.ids.is_empty() && !self.ids.contains(&ev.id()) {
            return false;
        }
        if !self.kinds.is_empty() && !self.kinds.contains(&ev.kind()) {
            return false;
        }
        if !self.authors.is_empty() && !self.authors.contains(&ev.pubkey()) {
            return false;
        }
        for (name, values) in &self.tags {
            if values.is_empty() {
                continue;
            }
            let hit = ev.tags().iter().any(|t| {
                t.name() == Some(name.as_str())
                    && t.value().is_some_and(|v| values.iter().any(|w| w == v))
            });
            if !hit {
                return false;
            }
        }
        if self.since.is_some_and(|s| ev.created_at() <= s) {
            return false;
        }
        if self.until.is_some_and(|u| ev.created_at() >= u) {
            return false;
        }
        true
    }
}

fn strings(field: &str, v: &Value) -> Result<Vec<String>, FilterError> {
    let arr = v.as_array().ok_or_else(|| invalid(field, "expected array"))?;
    arr.iter()
        .map(|s| {
            s.as_str()
                .map(str::to_string)
                .ok_or_else(|| invalid(field, "expected strings"))
        })
        .collect()
}

fn timestamp(field: &str, v: &Value) -> Result<u64, FilterError> {
    v.as_u64()
        .ok_or_else(|| invalid(field, "expected unix timestamp"))
}

/// Ordered disjunction of filters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterSet(Vec<Filter>);

impl FilterSet {
    pub fn new(filters: Vec<Filter>) -> Self {
        Self(filters)
    }

    /// Parse a JSON array of filter objects. A bare object is accepted as a
    /// single-clause set.
    pub fn from_value(val: &Value) -> Result<Self, FilterError> {
        match val {
            Value::Array(items) => items
                .iter()
                .map(Filter::from_value)
                .collect::<Result<_, _>>()
                .map(Self),
            Value::Object(_) => Ok(Self(vec![Filter::from_value(val)?])),
            _ => Err(FilterError::NotAnArray),
        }
    }

    pub fn filters(&self) -> &[Filter] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn matches(&self, ev: &Event) -> bool {
        self.0.iter().any(|f| f.matches(ev))
    }
}
