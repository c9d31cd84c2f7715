//! Invocation payloads and handler binding.
//!
//! A payload is a JSON object mapping string keys to nullable string
//! values. It travels with the invocation row, is handed verbatim to
//! continuations and repeats, and is bound onto a freshly constructed
//! handler at dispatch time through [`PayloadBinder`].
//!
//! Binding rules:
//! - key lookup is case-insensitive;
//! - a null value clears (the handler keeps its default);
//! - unknown keys are ignored with a warning;
//! - a missing required key fails the bind, which the dispatcher commits
//!   as `Crashed` before the handler is invoked.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::PayloadError;

/// String-to-nullable-string mapping carried by every invocation.
///
/// Serializes as a plain JSON object: `{"source":"https://a","apiKey":null}`.
/// Round-trips are stable: keys and nulls are preserved, values are
/// literal strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(BTreeMap<String, Option<String>>);

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Exact-key lookup. Binding goes through [`PayloadBinder`], which is
    /// case-insensitive; this accessor is for code that wrote the key itself.
    pub fn get(&self, key: &str) -> Option<Option<&str>> {
        self.0.get(key).map(|v| v.as_deref())
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.0.insert(key.into(), Some(value.into()));
        self
    }

    pub fn set_null(&mut self, key: impl Into<String>) -> &mut Self {
        self.0.insert(key.into(), None);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_deref()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Flatten a serializable options struct into a payload.
    ///
    /// Nested objects become dotted keys (`source.server`), scalars are
    /// stringified, nulls stay null, arrays are kept as their JSON text.
    pub fn from_options<T: Serialize>(options: &T) -> Result<Self, serde_json::Error> {
        let value = serde_json::to_value(options)?;
        let mut map = BTreeMap::new();
        flatten_value("", &value, &mut map);
        Ok(Self(map))
    }
}

impl From<BTreeMap<String, Option<String>>> for Payload {
    fn from(map: BTreeMap<String, Option<String>>) -> Self {
        Self(map)
    }
}

impl FromIterator<(String, Option<String>)> for Payload {
    fn from_iter<I: IntoIterator<Item = (String, Option<String>)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

fn flatten_value(prefix: &str, value: &serde_json::Value, out: &mut BTreeMap<String, Option<String>>) {
    match value {
        serde_json::Value::Object(fields) => {
            for (key, value) in fields {
                let key = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_value(&key, value, out);
            }
        }
        serde_json::Value::Null => {
            out.insert(prefix.to_string(), None);
        }
        serde_json::Value::String(s) => {
            out.insert(prefix.to_string(), Some(s.clone()));
        }
        other => {
            out.insert(prefix.to_string(), Some(other.to_string()));
        }
    }
}

/// Enum targets bindable from a payload value by case-insensitive name.
pub trait PayloadEnum: Sized {
    fn from_name(name: &str) -> Option<Self>;
}

/// Rehydrates typed handler attributes from a [`Payload`].
///
/// The binder tracks which keys were consumed; [`finish`](Self::finish)
/// warns about the leftovers so a typo'd key is visible in the logs
/// instead of silently ignored.
pub struct PayloadBinder<'a> {
    entries: Vec<BinderEntry<'a>>,
    consumed: BTreeSet<String>,
}

struct BinderEntry<'a> {
    lower: String,
    original: &'a str,
    value: Option<&'a str>,
}

impl<'a> PayloadBinder<'a> {
    pub fn new(payload: &'a Payload) -> Self {
        let entries = payload
            .0
            .iter()
            .map(|(key, value)| BinderEntry {
                lower: key.to_ascii_lowercase(),
                original: key.as_str(),
                value: value.as_deref(),
            })
            .collect();
        Self {
            entries,
            consumed: BTreeSet::new(),
        }
    }

    /// Case-insensitive lookup. `None` means absent; `Some(None)` means the
    /// key was present with a null value (clears to default).
    fn lookup(&mut self, name: &str) -> Option<Option<&'a str>> {
        let lower = name.to_ascii_lowercase();
        let found = self
            .entries
            .iter()
            .find(|entry| entry.lower == lower)
            .map(|entry| entry.value);
        if found.is_some() {
            self.consumed.insert(lower);
        }
        found
    }

    pub fn optional_str(&mut self, name: &str) -> Option<String> {
        self.lookup(name).flatten().map(str::to_string)
    }

    pub fn require_str(&mut self, name: &str) -> Result<String, PayloadError> {
        self.optional_str(name)
            .ok_or_else(|| PayloadError::MissingKey(name.to_string()))
    }

    pub fn optional_i64(&mut self, name: &str) -> Result<Option<i64>, PayloadError> {
        self.parse_with(name, "integer", |raw| raw.trim().parse::<i64>().ok())
    }

    pub fn require_i64(&mut self, name: &str) -> Result<i64, PayloadError> {
        self.optional_i64(name)?
            .ok_or_else(|| PayloadError::MissingKey(name.to_string()))
    }

    pub fn optional_bool(&mut self, name: &str) -> Result<Option<bool>, PayloadError> {
        self.parse_with(name, "boolean", |raw| match raw.trim() {
            v if v.eq_ignore_ascii_case("true") || v == "1" => Some(true),
            v if v.eq_ignore_ascii_case("false") || v == "0" => Some(false),
            _ => None,
        })
    }

    pub fn require_bool(&mut self, name: &str) -> Result<bool, PayloadError> {
        self.optional_bool(name)?
            .ok_or_else(|| PayloadError::MissingKey(name.to_string()))
    }

    /// Time spans parse from an ISO-8601 duration (`PT30M`) or a
    /// colon-separated `hh:mm:ss` (optionally `d.hh:mm:ss` and fractional
    /// seconds).
    pub fn optional_duration(&mut self, name: &str) -> Result<Option<Duration>, PayloadError> {
        self.parse_with(name, "duration", parse_duration)
    }

    pub fn require_duration(&mut self, name: &str) -> Result<Duration, PayloadError> {
        self.optional_duration(name)?
            .ok_or_else(|| PayloadError::MissingKey(name.to_string()))
    }

    /// UTC timestamps parse from ISO-8601 / RFC 3339 text.
    pub fn optional_timestamp(&mut self, name: &str) -> Result<Option<DateTime<Utc>>, PayloadError> {
        self.parse_with(name, "utc timestamp", parse_timestamp)
    }

    pub fn require_timestamp(&mut self, name: &str) -> Result<DateTime<Utc>, PayloadError> {
        self.optional_timestamp(name)?
            .ok_or_else(|| PayloadError::MissingKey(name.to_string()))
    }

    pub fn optional_enum<T: PayloadEnum>(&mut self, name: &str) -> Result<Option<T>, PayloadError> {
        self.parse_with(name, "enum name", T::from_name)
    }

    pub fn require_enum<T: PayloadEnum>(&mut self, name: &str) -> Result<T, PayloadError> {
        self.optional_enum(name)?
            .ok_or_else(|| PayloadError::MissingKey(name.to_string()))
    }

    /// View onto a nested options object addressed by dotted keys:
    /// `binder.section("source").require_str("server")` reads
    /// `source.server`.
    pub fn section<'b>(&'b mut self, prefix: &str) -> SectionBinder<'b, 'a> {
        SectionBinder {
            binder: self,
            prefix: prefix.to_string(),
        }
    }

    fn parse_with<T>(
        &mut self,
        name: &str,
        expected: &'static str,
        parse: impl Fn(&str) -> Option<T>,
    ) -> Result<Option<T>, PayloadError> {
        match self.lookup(name).flatten() {
            None => Ok(None),
            Some(raw) => parse(raw).map(Some).ok_or_else(|| PayloadError::InvalidValue {
                key: name.to_string(),
                expected,
                value: raw.to_string(),
            }),
        }
    }

    /// Original spellings of the keys no getter asked for.
    pub fn unconsumed(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|entry| !self.consumed.contains(&entry.lower))
            .map(|entry| entry.original)
            .collect()
    }

    /// Warn about keys the handler never consumed.
    pub fn finish(self) {
        for key in self.unconsumed() {
            warn!(key = %key, "ignoring unknown payload key");
        }
    }
}

/// Dotted-prefix view over a [`PayloadBinder`].
pub struct SectionBinder<'b, 'a> {
    binder: &'b mut PayloadBinder<'a>,
    prefix: String,
}

impl SectionBinder<'_, '_> {
    fn qualified(&self, name: &str) -> String {
        format!("{}.{name}", self.prefix)
    }

    pub fn optional_str(&mut self, name: &str) -> Option<String> {
        self.binder.optional_str(&self.qualified(name))
    }

    pub fn require_str(&mut self, name: &str) -> Result<String, PayloadError> {
        self.binder.require_str(&self.qualified(name))
    }

    pub fn optional_i64(&mut self, name: &str) -> Result<Option<i64>, PayloadError> {
        self.binder.optional_i64(&self.qualified(name))
    }

    pub fn optional_bool(&mut self, name: &str) -> Result<Option<bool>, PayloadError> {
        self.binder.optional_bool(&self.qualified(name))
    }

    pub fn optional_duration(&mut self, name: &str) -> Result<Option<Duration>, PayloadError> {
        self.binder.optional_duration(&self.qualified(name))
    }

    pub fn optional_timestamp(&mut self, name: &str) -> Result<Option<DateTime<Utc>>, PayloadError> {
        self.binder.optional_timestamp(&self.qualified(name))
    }
}

/// Parse `PT5M`-style ISO-8601 durations and `hh:mm:ss` time spans.
fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if raw.starts_with('P') || raw.starts_with('p') {
        parse_iso8601_duration(raw)
    } else {
        parse_colon_duration(raw)
    }
}

fn parse_iso8601_duration(raw: &str) -> Option<Duration> {
    let body = &raw[1..];
    let (date_part, time_part) = match body.split_once(['T', 't']) {
        Some((d, t)) => (d, t),
        None => (body, ""),
    };

    let mut seconds = 0f64;
    let mut matched = false;

    let mut number = String::new();
    for ch in date_part.chars() {
        if ch.is_ascii_digit() || ch == '.' {
            number.push(ch);
        } else if ch == 'D' || ch == 'd' {
            seconds += number.parse::<f64>().ok()? * 86_400.0;
            number.clear();
            matched = true;
        } else {
            return None;
        }
    }
    if !number.is_empty() {
        return None;
    }

    for ch in time_part.chars() {
        if ch.is_ascii_digit() || ch == '.' {
            number.push(ch);
        } else {
            let value = number.parse::<f64>().ok()?;
            number.clear();
            matched = true;
            match ch {
                'H' | 'h' => seconds += value * 3_600.0,
                'M' | 'm' => seconds += value * 60.0,
                'S' | 's' => seconds += value,
                _ => return None,
            }
        }
    }
    if !number.is_empty() || !matched {
        return None;
    }
    Duration::try_from_secs_f64(seconds).ok()
}

fn parse_colon_duration(raw: &str) -> Option<Duration> {
    // Optional leading day count: `d.hh:mm:ss`.
    let (days, rest) = match raw.split_once('.') {
        Some((d, rest)) if rest.contains(':') && d.chars().all(|c| c.is_ascii_digit()) => {
            (d.parse::<u64>().ok()?, rest)
        }
        _ => (0, raw),
    };

    let parts: Vec<&str> = rest.split(':').collect();
    if parts.len() != 3 {
        return None;
    }
    let hours = parts[0].parse::<u64>().ok()?;
    let minutes = parts[1].parse::<u64>().ok()?;
    let seconds = parts[2].parse::<f64>().ok()?;
    if minutes >= 60 || !(0.0..60.0).contains(&seconds) {
        return None;
    }
    let whole = days
        .checked_mul(86_400)?
        .checked_add(hours.checked_mul(3_600)?)?
        .checked_add(minutes * 60)?;
    Duration::try_from_secs_f64(whole as f64 + seconds).ok()
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    // Bare ISO-8601 without an offset is taken as UTC.
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
