use crate::error::{Result, SweepError};
use crate::glob::{expand_glob, is_glob};
use crate::value::{ConcreteConfig, ConfigMap, ConfigValue, FieldKind};
use chrono::TimeDelta;
use serde_json::{Map, Number, Value};

pub const RANGE_FROM: &str = "_from";
pub const RANGE_TO: &str = "_to";
pub const RANGE_STEP: &str = "_step";

/// Expands `template` into every concrete configuration it describes.
///
/// The root must be a mapping, or a sequence whose elements expand to mappings.
pub fn expand(template: &Value) -> Result<Vec<ConcreteConfig>> {
    expand_node(template, FieldKind::Plain, "$")?
        .into_iter()
        .map(|value| match value {
            ConfigValue::Map(map) => Ok(map),
            other => Err(SweepError::expansion(
                "$",
                format!(
                    "template must expand to mappings, found a {}",
                    other.type_name()
                ),
            )),
        })
        .collect()
}

pub fn count(template: &Value) -> Result<usize> {
    Ok(expand(template)?.len())
}

fn expand_node(node: &Value, kind: FieldKind, path: &str) -> Result<Vec<ConfigValue>> {
    match node {
        Value::Object(map) if is_range_descriptor(map) => expand_range(map, kind, path),
        Value::Object(map) => expand_mapping(map, kind, path),
        Value::Array(items) => {
            let mut out = Vec::new();
            for (idx, item) in items.iter().enumerate() {
                out.extend(expand_node(item, kind, &format!("{}[{}]", path, idx))?);
            }
            Ok(out)
        }
        Value::String(s) if is_glob(s) => {
            let matches = expand_glob(s)?;
            if matches.is_empty() {
                tracing::warn!("{}: pattern '{}' matched no files", path, s);
            }
            Ok(matches.into_iter().map(ConfigValue::String).collect())
        }
        leaf => ConfigValue::from_json(leaf, kind)
            .map(|value| vec![value])
            .map_err(|message| SweepError::expansion(path, message)),
    }
}

fn expand_mapping(map: &Map<String, Value>, kind: FieldKind, path: &str) -> Result<Vec<ConfigValue>> {
    let mut combos = vec![ConfigMap::new()];
    for (key, value) in map {
        let options = expand_node(value, kind.for_child(key), &format!("{}.{}", path, key))?;
        let mut next = Vec::with_capacity(combos.len() * options.len());
        for combo in &combos {
            for option in &options {
                let mut extended = combo.clone();
                extended.insert(key.clone(), option.clone());
                next.push(extended);
            }
        }
        combos = next;
    }
    Ok(combos.into_iter().map(ConfigValue::Map).collect())
}

pub fn is_range_descriptor(map: &Map<String, Value>) -> bool {
    map.contains_key(RANGE_FROM)
        && map.contains_key(RANGE_TO)
        && map
            .keys()
            .all(|k| k == RANGE_FROM || k == RANGE_TO || k == RANGE_STEP)
}

fn expand_range(map: &Map<String, Value>, kind: FieldKind, path: &str) -> Result<Vec<ConfigValue>> {
    let from = &map[RANGE_FROM];
    let to = &map[RANGE_TO];
    let step = map.get(RANGE_STEP);
    match kind {
        FieldKind::Plain => numeric_range(from, to, step, path),
        FieldKind::DateTime => datetime_range(from, to, step, path),
        FieldKind::Duration => Err(SweepError::expansion(
            path,
            "ranges over durations are undefined; list the durations explicitly",
        )),
    }
}

fn numeric_range(from: &Value, to: &Value, step: Option<&Value>, path: &str) -> Result<Vec<ConfigValue>> {
    let default_step = Value::from(1);
    let step = step.unwrap_or(&default_step);
    if let (Some(a), Some(b), Some(s)) = (from.as_i64(), to.as_i64(), step.as_i64()) {
        return int_range(a, b, s, path);
    }
    match (from.as_f64(), to.as_f64(), step.as_f64()) {
        (Some(a), Some(b), Some(s)) => float_range(a, b, s, path),
        _ => Err(SweepError::expansion(
            path,
            format!(
                "range bounds must be numbers (got {} .. {} step {}); suffix the key with _dt for datetime ranges",
                from, to, step
            ),
        )),
    }
}

fn int_range(from: i64, to: i64, step: i64, path: &str) -> Result<Vec<ConfigValue>> {
    if step == 0 {
        return Err(SweepError::expansion(path, "range step must not be zero"));
    }
    let mut out = Vec::new();
    let mut current = from;
    while (step > 0 && current < to) || (step < 0 && current > to) {
        out.push(ConfigValue::Number(Number::from(current)));
        current = match current.checked_add(step) {
            Some(next) => next,
            None => break,
        };
    }
    Ok(out)
}

fn float_range(from: f64, to: f64, step: f64, path: &str) -> Result<Vec<ConfigValue>> {
    if step == 0.0 || !step.is_finite() || !from.is_finite() || !to.is_finite() {
        return Err(SweepError::expansion(
            path,
            "float range needs finite bounds and a non-zero finite step",
        ));
    }
    let mut out = Vec::new();
    let mut idx = 0u64;
    loop {
        let current = from + idx as f64 * step;
        if !((step > 0.0 && current < to) || (step < 0.0 && current > to)) {
            break;
        }
        let number = Number::from_f64(current)
            .ok_or_else(|| SweepError::expansion(path, "range produced a non-finite value"))?;
        out.push(ConfigValue::Number(number));
        idx += 1;
    }
    Ok(out)
}

fn datetime_range(from: &Value, to: &Value, step: Option<&Value>, path: &str) -> Result<Vec<ConfigValue>> {
    let parse = |bound: &Value, name: &str| {
        bound
            .as_str()
            .and_then(crate::value::parse_datetime)
            .ok_or_else(|| SweepError::expansion(path, format!("{} is not a datetime: {}", name, bound)))
    };
    let start = parse(from, RANGE_FROM)?;
    let end = parse(to, RANGE_TO)?;
    let step = step
        .ok_or_else(|| SweepError::expansion(path, "datetime range requires _step (e.g. \"1 hour\")"))?;
    let step = step
        .as_str()
        .and_then(crate::value::parse_duration)
        .ok_or_else(|| SweepError::expansion(path, format!("_step is not a duration: {}", step)))?;
    if step <= TimeDelta::zero() {
        return Err(SweepError::expansion(path, "datetime range step must be positive"));
    }

    let mut out = Vec::new();
    let mut current = start;
    while current < end {
        let next = current
            .checked_add_signed(step)
            .ok_or_else(|| SweepError::expansion(path, "datetime range overflows"))?;
        let mut window = ConfigMap::new();
        window.insert("start", ConfigValue::DateTime(current));
        window.insert("stop", ConfigValue::DateTime(next.min(end)));
        out.push(ConfigValue::Map(window));
        current = next;
    }
    Ok(out)
}
