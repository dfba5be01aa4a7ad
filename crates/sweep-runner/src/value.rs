use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeDelta};
use serde_json::{Map, Number, Value};
use std::fmt;

pub const DATETIME_SUFFIX: &str = "_dt";
pub const DURATION_SUFFIX: &str = "_td";

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FieldKind {
    #[default]
    Plain,
    DateTime,
    Duration,
}

impl FieldKind {
    pub fn from_key(key: &str) -> Option<Self> {
        if key.ends_with(DATETIME_SUFFIX) {
            Some(FieldKind::DateTime)
        } else if key.ends_with(DURATION_SUFFIX) {
            Some(FieldKind::Duration)
        } else {
            None
        }
    }

    /// Kind for the value stored under `key` inside a node of this kind.
    pub fn for_child(self, key: &str) -> Self {
        Self::from_key(key).unwrap_or(self)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    DateTime(NaiveDateTime),
    Duration(TimeDelta),
    List(Vec<ConfigValue>),
    Map(ConfigMap),
}

impl ConfigValue {
    /// Errors carry the string that failed to parse.
    pub fn from_json(value: &Value, kind: FieldKind) -> Result<Self, String> {
        Ok(match value {
            Value::Null => ConfigValue::Null,
            Value::Bool(b) => ConfigValue::Bool(*b),
            Value::Number(n) => ConfigValue::Number(n.clone()),
            Value::String(s) => match kind {
                FieldKind::Plain => ConfigValue::String(s.clone()),
                FieldKind::DateTime => ConfigValue::DateTime(
                    parse_datetime(s).ok_or_else(|| format!("invalid datetime '{}'", s))?,
                ),
                FieldKind::Duration => ConfigValue::Duration(
                    parse_duration(s).ok_or_else(|| format!("invalid duration '{}'", s))?,
                ),
            },
            Value::Array(items) => ConfigValue::List(
                items
                    .iter()
                    .map(|item| ConfigValue::from_json(item, kind))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Object(map) => ConfigValue::Map(ConfigMap::from_json(map, kind)?),
        })
    }

    pub fn to_json(&self) -> Value {
        match self {
            ConfigValue::Null => Value::Null,
            ConfigValue::Bool(b) => Value::Bool(*b),
            ConfigValue::Number(n) => Value::Number(n.clone()),
            ConfigValue::String(s) => Value::String(s.clone()),
            ConfigValue::DateTime(dt) => Value::String(format_datetime(dt)),
            ConfigValue::Duration(td) => Value::String(format_duration(td)),
            ConfigValue::List(items) => Value::Array(items.iter().map(|v| v.to_json()).collect()),
            ConfigValue::Map(map) => map.to_json(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ConfigValue::Null => "null",
            ConfigValue::Bool(_) => "boolean",
            ConfigValue::Number(_) => "number",
            ConfigValue::String(_) => "string",
            ConfigValue::DateTime(_) => "datetime",
            ConfigValue::Duration(_) => "duration",
            ConfigValue::List(_) => "list",
            ConfigValue::Map(_) => "mapping",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ConfigValue::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ConfigValue::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<NaiveDateTime> {
        match self {
            ConfigValue::DateTime(dt) => Some(*dt),
            _ => None,
        }
    }

    pub fn as_duration(&self) -> Option<TimeDelta> {
        match self {
            ConfigValue::Duration(td) => Some(*td),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&ConfigMap> {
        match self {
            ConfigValue::Map(m) => Some(m),
            _ => None,
        }
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::String(s) => f.write_str(s),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

/// Keys stay in template declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigMap {
    entries: Vec<(String, ConfigValue)>,
}

pub type ConcreteConfig = ConfigMap;

impl ConfigMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(map: &Map<String, Value>, kind: FieldKind) -> Result<Self, String> {
        let mut out = ConfigMap::new();
        for (key, value) in map {
            out.insert(key.clone(), ConfigValue::from_json(value, kind.for_child(key))?);
        }
        Ok(out)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: ConfigValue) {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn remove(&mut self, key: &str) -> Option<ConfigValue> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ConfigValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_json(&self) -> Value {
        let mut out = Map::new();
        for (key, value) in &self.entries {
            out.insert(key.clone(), value.to_json());
        }
        Value::Object(out)
    }
}

impl<'a> IntoIterator for &'a ConfigMap {
    type Item = (&'a str, &'a ConfigValue);
    type IntoIter = Box<dyn Iterator<Item = (&'a str, &'a ConfigValue)> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

impl FromIterator<(String, ConfigValue)> for ConfigMap {
    fn from_iter<I: IntoIterator<Item = (String, ConfigValue)>>(iter: I) -> Self {
        let mut out = ConfigMap::new();
        for (key, value) in iter {
            out.insert(key, value);
        }
        out
    }
}

pub fn parse_datetime(raw: &str) -> Option<NaiveDateTime> {
    let s = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    for format in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// Parses `<amount> <unit>`, e.g. `10 seconds`, `15 min`, `1.5h`, `2 weeks`,
/// or the ISO 8601 form written to `config.json` (`PT900S`, `P1DT30S`).
pub fn parse_duration(raw: &str) -> Option<TimeDelta> {
    let s = raw.trim();
    if let Some(td) = parse_iso_duration(s) {
        return Some(td);
    }
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-' || c == '+'))
        .unwrap_or(s.len());
    let (amount, unit) = s.split_at(split);
    let amount: f64 = amount.trim().parse().ok()?;
    let unit_seconds = match unit.trim().to_ascii_lowercase().as_str() {
        "s" | "sec" | "secs" | "second" | "seconds" => 1.0,
        "m" | "min" | "mins" | "minute" | "minutes" => 60.0,
        "h" | "hr" | "hrs" | "hour" | "hours" => 3_600.0,
        "d" | "day" | "days" => 86_400.0,
        "w" | "week" | "weeks" => 604_800.0,
        _ => return None,
    };
    let millis = (amount * unit_seconds * 1_000.0).round();
    if !millis.is_finite() || millis.abs() > i64::MAX as f64 {
        return None;
    }
    TimeDelta::try_milliseconds(millis as i64)
}

pub fn format_datetime(dt: &NaiveDateTime) -> String {
    dt.format("%Y-%m-%d %H:%M:%S%.f").to_string()
}

pub fn format_duration(td: &TimeDelta) -> String {
    td.to_string()
}

// Hand-edited records may spell the same instant differently.
pub fn canonicalize_json(value: &Value, kind: FieldKind) -> Value {
    match value {
        Value::String(s) => {
            let canonical = match kind {
                FieldKind::Plain => None,
                FieldKind::DateTime => parse_datetime(s).map(|dt| format_datetime(&dt)),
                FieldKind::Duration => parse_duration(s).map(|td| format_duration(&td)),
            };
            Value::String(canonical.unwrap_or_else(|| s.clone()))
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| canonicalize_json(item, kind))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), canonicalize_json(v, kind.for_child(k))))
                .collect(),
        ),
        other => other.clone(),
    }
}

// `[-]P[<days>D][T<seconds>S]`, the subset `format_duration` emits.
fn parse_iso_duration(s: &str) -> Option<TimeDelta> {
    let (negative, rest) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let rest = rest.strip_prefix('P')?;
    let (days, time) = match rest.split_once('T') {
        Some((days, time)) => (days, Some(time)),
        None => (rest, None),
    };
    if days.is_empty() && time.is_none() {
        return None;
    }
    let mut seconds = 0.0;
    if !days.is_empty() {
        let days: f64 = days.strip_suffix('D')?.parse().ok()?;
        seconds += days * 86_400.0;
    }
    if let Some(time) = time {
        let secs: f64 = time.strip_suffix('S')?.parse().ok()?;
        seconds += secs;
    }
    let millis = (seconds * 1_000.0).round();
    if !millis.is_finite() || millis.abs() > i64::MAX as f64 {
        return None;
    }
    let millis = millis as i64;
    TimeDelta::try_milliseconds(if negative { -millis } else { millis })
}
