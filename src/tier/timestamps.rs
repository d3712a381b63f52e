use crate::error::TierResult;
use crate::tier::config::LockConfig;
use crate::tier::store::{DocStore, Document, json_decode, json_encode};
use crate::tier::util::iso_time;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Raw entries are kept as JSON values so that a malformed entry is reported
/// by the audit instead of failing the whole store.
pub type TimestampMap = BTreeMap<String, Value>;

impl Document for TimestampMap {
    fn decode(raw: &str) -> Result<Self, String> {
        json_decode(raw)
    }

    fn encode(&self) -> Result<String, String> {
        json_encode(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TimestampProblem {
    Unparsable,
    Future {
        expected: String,
    },
    Mismatch {
        expected: String,
        actual: String,
    },
}

/// Accepts an RFC 3339 / ISO-8601 string, epoch seconds, or an object
/// carrying either under `mtime`.
pub fn parse_expected(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(raw) => iso_time::parse(raw),
        Value::Number(n) => {
            let secs = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
            DateTime::<Utc>::from_timestamp(secs, 0)
        }
        Value::Object(map) => map.get("mtime").and_then(|inner| match inner {
            Value::Object(_) => None,
            other => parse_expected(other),
        }),
        _ => None,
    }
}

pub fn classify(
    value: &Value,
    actual: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    tolerance_secs: u64,
) -> Option<TimestampProblem> {
    let Some(expected) = parse_expected(value) else {
        return Some(TimestampProblem::Unparsable);
    };
    let tolerance = i64::try_from(tolerance_secs).unwrap_or(i64::MAX);
    if expected.signed_duration_since(now).num_seconds() > tolerance {
        return Some(TimestampProblem::Future {
            expected: iso_time::format(&expected),
        });
    }
    let actual = actual?;
    let drift = expected.signed_duration_since(actual).num_seconds().abs();
    if drift > tolerance {
        return Some(TimestampProblem::Mismatch {
            expected: iso_time::format(&expected),
            actual: iso_time::format(&actual),
        });
    }
    None
}

/// Expected modification time per cache-tier path, used to undo timestamp
/// drift introduced by tier moves.
#[derive(Debug, Clone)]
pub struct TimestampStore {
    store: DocStore<TimestampMap>,
}

impl TimestampStore {
    pub fn new(path: impl Into<PathBuf>, lock: LockConfig) -> Self {
        Self {
            store: DocStore::new(path, lock),
        }
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }

    pub fn entries(&self) -> TierResult<TimestampMap> {
        self.store.load()
    }

    pub fn set(&self, path: &str, expected: DateTime<Utc>) -> TierResult<()> {
        self.store.update(|map| {
            map.insert(path.to_string(), Value::String(iso_time::format(&expected)));
            Ok(())
        })?;
        Ok(())
    }

    pub fn get(&self, path: &str) -> TierResult<Option<Value>> {
        Ok(self.entries()?.remove(path))
    }

    /// Put back an entry exactly as it was, malformed or not.
    pub fn insert_raw(&self, path: &str, value: Value) -> TierResult<()> {
        self.store.update(|map| {
            map.insert(path.to_string(), value);
            Ok(())
        })?;
        Ok(())
    }

    pub fn remove<'a>(&self, paths: impl IntoIterator<Item = &'a str>) -> TierResult<usize> {
        let paths = paths.into_iter().collect::<BTreeSet<_>>();
        let (removed, _) = self.store.update(|map| {
            let before = map.len();
            map.retain(|p, _| !paths.contains(p.as_str()));
            Ok(before.saturating_sub(map.len()))
        })?;
        Ok(removed)
    }
}
