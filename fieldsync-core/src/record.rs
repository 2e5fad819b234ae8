//! Raw document records and the mapping contract for cached record types.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::RecordError;
use crate::Timestamp;

/// Conventional last-modified field.
pub const UPDATED_AT: &str = "updatedAt";

/// Fallback last-modified field for records that were never updated.
pub const CREATED_AT: &str = "createdAt";

/// A document as returned by the remote store: an opaque id plus loosely
/// typed fields.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawRecord {
    pub id: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl RawRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }

    /// Builder-style field setter.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Builder-style timestamp setter, stored in normalized form.
    pub fn with_timestamp(self, name: impl Into<String>, at: Timestamp) -> Self {
        self.with_field(name, format_timestamp(at))
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(field.into(), value.into());
    }

    /// Read a timestamp field. Absent and `null` are `Ok(None)`; a value that
    /// is present but not a recognizable timestamp is an error.
    pub fn timestamp(&self, field: &str) -> Result<Option<Timestamp>, RecordError> {
        match self.fields.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => parse_timestamp(value).map(Some).ok_or_else(|| {
                RecordError::InvalidTimestamp {
                    id: self.id.clone(),
                    field: field.to_string(),
                    value: value.to_string(),
                }
            }),
        }
    }

    /// `updatedAt`, falling back to `createdAt`. Unparseable values count as absent.
    pub fn last_modified(&self) -> Option<Timestamp> {
        self.timestamp(UPDATED_AT)
            .ok()
            .flatten()
            .or_else(|| self.timestamp(CREATED_AT).ok().flatten())
    }

    /// Rewrite store-native timestamp objects (`{seconds, nanoseconds}` and
    /// `{_seconds, _nanoseconds}`) as RFC 3339 strings, recursively.
    pub fn normalize_timestamps(&mut self) {
        for value in self.fields.values_mut() {
            normalize_json_timestamps(value);
        }
    }

    /// Owned JSON object with the id injected under `"id"`.
    pub fn to_json(&self) -> Value {
        let mut object = self.fields.clone();
        object.insert("id".to_string(), Value::String(self.id.clone()));
        Value::Object(object)
    }

    /// Decode into a serde type, with the id available as the `id` field.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, RecordError> {
        serde_json::from_value(self.to_json()).map_err(|e| RecordError::Decode {
            id: self.id.clone(),
            reason: e.to_string(),
        })
    }
}

/// Mapping contract for record types held in the cache.
///
/// `from_raw` receives records whose timestamps have already been normalized.
/// `last_modified` feeds the watermark and must read exactly the fields named
/// by `last_modified_fields`, since the staleness probe filters on each of
/// them. Types declaring no fields are never probed.
pub trait CachedRecord: Clone + Send + Sync + 'static {
    fn from_raw(raw: RawRecord) -> Result<Self, RecordError>;

    fn last_modified(&self) -> Option<Timestamp>;

    /// Remote fields `last_modified` is drawn from, most frequently written first.
    fn last_modified_fields() -> &'static [&'static str] {
        &[UPDATED_AT, CREATED_AT]
    }
}

impl CachedRecord for RawRecord {
    fn from_raw(raw: RawRecord) -> Result<Self, RecordError> {
        Ok(raw)
    }

    fn last_modified(&self) -> Option<Timestamp> {
        RawRecord::last_modified(self)
    }
}

/// Parse any timestamp representation the store may hand back.
///
/// Accepts RFC 3339 strings, epoch milliseconds, and the object forms
/// `{seconds, nanoseconds}` / `{_seconds, _nanoseconds}`.
pub fn parse_timestamp(value: &Value) -> Option<Timestamp> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        Value::Object(map) => {
            let seconds = map
                .get("seconds")
                .or_else(|| map.get("_seconds"))
                .and_then(Value::as_i64)?;
            let nanos = map
                .get("nanoseconds")
                .or_else(|| map.get("_nanoseconds"))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            let nanos = u32::try_from(nanos).ok()?;
            DateTime::from_timestamp(seconds, nanos)
        }
        _ => None,
    }
}

/// Fixed-width RFC 3339 form; lexical order matches chronological order.
pub fn format_timestamp(at: Timestamp) -> Value {
    Value::String(at.to_rfc3339_opts(SecondsFormat::Nanos, true))
}

fn native_timestamp(value: &Value) -> Option<Timestamp> {
    match value {
        Value::Object(map) if map.len() == 2 => {
            let has = |a: &str, b: &str| map.contains_key(a) && map.contains_key(b);
            if has("seconds", "nanoseconds") || has("_seconds", "_nanoseconds") {
                parse_timestamp(value)
            } else {
                None
            }
        }
        _ => None,
    }
}

/// In-place rewrite of native timestamp objects anywhere inside `value`.
pub fn normalize_json_timestamps(value: &mut Value) {
    if let Some(at) = native_timestamp(value) {
        *value = format_timestamp(at);
        return;
    }
    match value {
        Value::Object(map) => {
            for nested in map.values_mut() {
                normalize_json_timestamps(nested);
            }
        }
        Value::Array(items) => {
            for item in items {
                normalize_json_timestamps(item);
            }
        }
        _ => {}
    }
}
