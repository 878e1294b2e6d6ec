//! Subscription filters: JSON shape, in-memory matching for live
//! broadcast, and the building blocks the store uses for query
//! translation.

use crate::error::Error;
use crate::event::Event;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// One filter of a REQ; a REQ carries a disjunction of these.
///
/// `ids` and `authors` entries may be full 64-char hex strings or
/// prefixes. Tag constraints are keyed by the single-letter tag name
/// (the wire form is `"#x"`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub ids: Option<Vec<String>>,
    pub authors: Option<Vec<String>>,
    pub kinds: Option<Vec<u32>>,
    pub since: Option<u64>,
    pub until: Option<u64>,
    pub limit: Option<usize>,
    pub tags: BTreeMap<String, BTreeSet<String>>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn authors<I, S>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authors = Some(authors.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn kinds<I: IntoIterator<Item = u32>>(mut self, kinds: I) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    #[must_use]
    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    #[must_use]
    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn tag<S: Into<String>, I, V>(mut self, name: S, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        self.tags
            .entry(name.into())
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    /// Parses a filter object. Unrecognized keys are ignored.
    pub fn from_value(value: &Value) -> Result<Self, Error> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::notice("invalid: filter is not a JSON object"))?;

        let mut filter = Filter::new();
        for (key, val) in obj {
            match key.as_str() {
                "ids" => filter.ids = Some(string_set(val, "ids")?),
                "authors" => filter.authors = Some(string_set(val, "authors")?),
                "kinds" => {
                    let kinds = val
                        .as_array()
                        .ok_or_else(|| Error::notice("invalid: filter 'kinds' is not an array"))?
                        .iter()
                        .map(|v| {
                            v.as_u64()
                                .and_then(|k| u32::try_from(k).ok())
                                .ok_or_else(|| Error::notice("invalid: filter kind is not an integer"))
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    filter.kinds = Some(kinds);
                }
                "since" => {
                    filter.since = Some(
                        val.as_u64()
                            .ok_or_else(|| Error::notice("invalid: filter 'since' is not an integer"))?,
                    )
                }
                "until" => {
                    filter.until = Some(
                        val.as_u64()
                            .ok_or_else(|| Error::notice("invalid: filter 'until' is not an integer"))?,
                    )
                }
                "limit" => {
                    filter.limit = Some(
                        val.as_u64()
                            .map(|l| l as usize)
                            .ok_or_else(|| Error::notice("invalid: filter 'limit' is not an integer"))?,
                    )
                }
                tag_key if tag_key.starts_with('#') && tag_key.len() == 2 => {
                    let values = string_set(val, tag_key)?;
                    filter
                        .tags
                        .entry(tag_key[1..].to_string())
                        .or_default()
                        .extend(values);
                }
                _ => {}
            }
        }
        Ok(filter)
    }

    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        if let Some(ids) = &self.ids {
            obj.insert("ids".into(), serde_json::json!(ids));
        }
        if let Some(authors) = &self.authors {
            obj.insert("authors".into(), serde_json::json!(authors));
        }
        if let Some(kinds) = &self.kinds {
            obj.insert("kinds".into(), serde_json::json!(kinds));
        }
        if let Some(since) = self.since {
            obj.insert("since".into(), serde_json::json!(since));
        }
        if let Some(until) = self.until {
            obj.insert("until".into(), serde_json::json!(until));
        }
        if let Some(limit) = self.limit {
            obj.insert("limit".into(), serde_json::json!(limit));
        }
        for (name, values) in &self.tags {
            obj.insert(format!("#{name}"), serde_json::json!(values));
        }
        Value::Object(obj)
    }

    /// In-memory match used on the live broadcast path. Every present key
    /// must match; an empty filter matches everything.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|p| event.id.starts_with(p.as_str())) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|p| event.pubkey.starts_with(p.as_str())) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.created_at > until {
                return false;
            }
        }
        for (name, accepted) in &self.tags {
            let hit = event
                .tags
                .iter()
                .any(|t| t.name() == name && t.value().is_some_and(|v| accepted.contains(v)));
            if !hit {
                return false;
            }
        }
        true
    }
}

fn string_set(value: &Value, key: &str) -> Result<Vec<String>, Error> {
    value
        .as_array()
        .ok_or_else(|| Error::notice(format!("invalid: filter '{key}' is not an array")))?
        .iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| Error::notice(format!("invalid: filter '{key}' entry is not a string")))
        })
        .collect()
}

/// Sorts newest first, ties broken by ascending id; truncates to `limit`.
pub fn sort_and_limit(events: &mut Vec<Event>, limit: Option<usize>) {
    events.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    if let Some(limit) = limit {
        events.truncate(limit);
    }
}
