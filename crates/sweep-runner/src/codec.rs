use crate::error::{IoContext, Result, SweepError};
use crate::value::{canonicalize_json, ConcreteConfig, FieldKind};
use crate::{atomic_write_bytes, atomic_write_json_pretty};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "config.json";
pub const ERROR_FILE: &str = "err.txt";
const RESERVED_FILES: [&str; 2] = [CONFIG_FILE, ERROR_FILE];

pub const OPAQUE_FORMAT_VERSION: u32 = 1;
const TAG_BINCODE: &str = "bincode";
const TAG_JSON: &str = "json";

pub type TrialOutput = BTreeMap<String, ResultValue>;

#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Text(s) => f.write_str(s),
            Scalar::Int(v) => write!(f, "{}", v),
            // serde_json keeps the trailing `.0` on whole floats
            Scalar::Float(v) => match Number::from_f64(*v) {
                Some(n) => write!(f, "{}", n),
                None => write!(f, "{}", v),
            },
            Scalar::Bool(v) => write!(f, "{}", v),
        }
    }
}

impl Scalar {
    fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Scalar::Text(s.clone())),
            Value::Bool(b) => Some(Scalar::Bool(*b)),
            Value::Number(n) => Some(match n.as_i64() {
                Some(i) => Scalar::Int(i),
                None => Scalar::Float(n.as_f64().unwrap_or(f64::NAN)),
            }),
            _ => None,
        }
    }
}

/// Encoded payload for values that have no text or JSON artifact form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpaqueValue {
    pub format_version: u32,
    pub type_tag: String,
    pub payload: Vec<u8>,
}

impl OpaqueValue {
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        let payload = bincode::serialize(value).map_err(|e| SweepError::Encode {
            key: String::new(),
            message: e.to_string(),
        })?;
        Ok(OpaqueValue {
            format_version: OPAQUE_FORMAT_VERSION,
            type_tag: TAG_BINCODE.to_string(),
            payload,
        })
    }

    fn from_json(value: &Value) -> Self {
        OpaqueValue {
            format_version: OPAQUE_FORMAT_VERSION,
            type_tag: TAG_JSON.to_string(),
            payload: serde_json::to_vec(value).unwrap_or_default(),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        let fail = |message: String| SweepError::Encode {
            key: self.type_tag.clone(),
            message,
        };
        if self.format_version != OPAQUE_FORMAT_VERSION {
            return Err(fail(format!(
                "unsupported opaque format version {}",
                self.format_version
            )));
        }
        match self.type_tag.as_str() {
            TAG_BINCODE => bincode::deserialize(&self.payload).map_err(|e| fail(e.to_string())),
            TAG_JSON => serde_json::from_slice(&self.payload).map_err(|e| fail(e.to_string())),
            other => Err(fail(format!("unknown payload encoding '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResultValue {
    Scalar(Scalar),
    Mapping(Map<String, Value>),
    List(Vec<Scalar>),
    Opaque(OpaqueValue),
}

impl ResultValue {
    // Values JSON cannot represent (non-string map keys) are bincode-encoded directly.
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        match serde_json::to_value(value) {
            Ok(json) => Ok(ResultValue::from(json)),
            Err(_) => Ok(ResultValue::Opaque(OpaqueValue::encode(value)?)),
        }
    }

    fn verbatim_bytes(&self) -> Vec<u8> {
        match self {
            ResultValue::Scalar(s) => s.to_string().into_bytes(),
            ResultValue::Mapping(m) => Value::Object(m.clone()).to_string().into_bytes(),
            ResultValue::List(items) => join_lines(items).into_bytes(),
            ResultValue::Opaque(o) => o.payload.clone(),
        }
    }
}

impl From<Value> for ResultValue {
    fn from(value: Value) -> Self {
        if let Some(scalar) = Scalar::from_json(&value) {
            return ResultValue::Scalar(scalar);
        }
        match value {
            Value::Object(map) => ResultValue::Mapping(map),
            Value::Array(items) => {
                let scalars: Option<Vec<Scalar>> = items.iter().map(Scalar::from_json).collect();
                match scalars {
                    Some(scalars) => ResultValue::List(scalars),
                    None => ResultValue::Opaque(OpaqueValue::from_json(&Value::Array(items))),
                }
            }
            other => ResultValue::Opaque(OpaqueValue::from_json(&other)),
        }
    }
}

impl From<Scalar> for ResultValue {
    fn from(value: Scalar) -> Self {
        ResultValue::Scalar(value)
    }
}

impl From<&str> for ResultValue {
    fn from(value: &str) -> Self {
        ResultValue::Scalar(Scalar::Text(value.to_string()))
    }
}

impl From<String> for ResultValue {
    fn from(value: String) -> Self {
        ResultValue::Scalar(Scalar::Text(value))
    }
}

impl From<i64> for ResultValue {
    fn from(value: i64) -> Self {
        ResultValue::Scalar(Scalar::Int(value))
    }
}

impl From<i32> for ResultValue {
    fn from(value: i32) -> Self {
        ResultValue::Scalar(Scalar::Int(value.into()))
    }
}

impl From<f64> for ResultValue {
    fn from(value: f64) -> Self {
        ResultValue::Scalar(Scalar::Float(value))
    }
}

impl From<bool> for ResultValue {
    fn from(value: bool) -> Self {
        ResultValue::Scalar(Scalar::Bool(value))
    }
}

impl From<Map<String, Value>> for ResultValue {
    fn from(value: Map<String, Value>) -> Self {
        ResultValue::Mapping(value)
    }
}

impl From<Vec<Scalar>> for ResultValue {
    fn from(value: Vec<Scalar>) -> Self {
        ResultValue::List(value)
    }
}

impl From<OpaqueValue> for ResultValue {
    fn from(value: OpaqueValue) -> Self {
        ResultValue::Opaque(value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

pub fn encode(key: &str, value: &ResultValue) -> Result<Artifact> {
    validate_key(key)?;
    let encoded = |message: String| SweepError::Encode {
        key: key.to_string(),
        message,
    };
    let artifact = if key.contains('.') {
        Artifact {
            file_name: key.to_string(),
            bytes: value.verbatim_bytes(),
        }
    } else {
        let (extension, bytes) = match value {
            ResultValue::Scalar(s) => ("txt", s.to_string().into_bytes()),
            ResultValue::Mapping(m) => (
                "json",
                serde_json::to_vec_pretty(m).map_err(|e| encoded(e.to_string()))?,
            ),
            ResultValue::List(items) => ("lst", join_lines(items).into_bytes()),
            ResultValue::Opaque(o) => (
                "bin",
                bincode::serialize(o).map_err(|e| encoded(e.to_string()))?,
            ),
        };
        Artifact {
            file_name: format!("{}.{}", key, extension),
            bytes,
        }
    };
    if RESERVED_FILES.contains(&artifact.file_name.as_str()) {
        return Err(encoded(format!(
            "{} is reserved for the trial record",
            artifact.file_name
        )));
    }
    Ok(artifact)
}

fn join_lines(items: &[Scalar]) -> String {
    items
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

fn validate_key(key: &str) -> Result<()> {
    let invalid = |reason: &str| SweepError::Encode {
        key: key.to_string(),
        message: reason.to_string(),
    };
    if key.is_empty() {
        return Err(invalid("result key is empty"));
    }
    if key.contains('/') || key.contains('\\') || key == "." || key == ".." {
        return Err(invalid("result key must be a plain file name"));
    }
    Ok(())
}

/// Writes `config.json` followed by one artifact per result key.
///
/// Every key is encoded before anything touches the disk, so an unencodable
/// result leaves the directory empty. Write failures are reported together
/// after every key was attempted.
pub fn write_record(dir: &Path, config: &ConcreteConfig, output: &TrialOutput) -> Result<Vec<PathBuf>> {
    let mut artifacts = Vec::with_capacity(output.len());
    let mut failures: Vec<(String, String)> = Vec::new();
    let mut seen: BTreeMap<String, String> = BTreeMap::new();
    for (key, value) in output {
        let artifact = match encode(key, value) {
            Ok(artifact) => artifact,
            Err(err) => {
                failures.push((key.clone(), err.to_string()));
                continue;
            }
        };
        if let Some(other) = seen.insert(artifact.file_name.clone(), key.clone()) {
            failures.push((
                key.clone(),
                format!("file {} already used by key '{}'", artifact.file_name, other),
            ));
            continue;
        }
        artifacts.push((key, artifact));
    }
    if !failures.is_empty() {
        return Err(persistence_error(dir, &failures));
    }

    write_config(dir, config)?;
    let mut written = Vec::with_capacity(artifacts.len());
    for (key, artifact) in artifacts {
        let path = dir.join(&artifact.file_name);
        match atomic_write_bytes(&path, &artifact.bytes) {
            Ok(()) => written.push(path),
            Err(err) => failures.push((key.clone(), err.to_string())),
        }
    }
    if failures.is_empty() {
        Ok(written)
    } else {
        Err(persistence_error(dir, &failures))
    }
}

fn persistence_error(dir: &Path, failures: &[(String, String)]) -> SweepError {
    SweepError::Persistence {
        dir: dir.to_path_buf(),
        key: failures
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(", "),
        message: failures
            .iter()
            .map(|(k, m)| format!("{}: {}", k, m))
            .collect::<Vec<_>>()
            .join("; "),
    }
}

/// Records a failed trial: its config plus an `err.txt` holding the error chain.
pub fn write_failure(dir: &Path, config: &ConcreteConfig, message: &str) -> Result<PathBuf> {
    write_config(dir, config)?;
    let path = dir.join(ERROR_FILE);
    atomic_write_bytes(&path, message.as_bytes())?;
    Ok(path)
}

pub fn write_config(dir: &Path, config: &ConcreteConfig) -> Result<PathBuf> {
    let path = dir.join(CONFIG_FILE);
    atomic_write_json_pretty(&path, &config.to_json())?;
    Ok(path)
}

pub fn read_config(dir: &Path) -> Result<Option<Value>> {
    let path = dir.join(CONFIG_FILE);
    if !path.is_file() {
        return Ok(None);
    }
    let bytes = fs::read(&path).at(&path)?;
    let value: Value = serde_json::from_slice(&bytes).at(&path)?;
    Ok(Some(canonicalize_json(&value, FieldKind::Plain)))
}

pub fn has_failure(dir: &Path) -> bool {
    dir.join(ERROR_FILE).is_file()
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoredValue {
    Text(String),
    Json(Value),
    Lines(Vec<String>),
    Opaque(OpaqueValue),
}

impl StoredValue {
    /// JSON view used by the results table; opaque payloads are summarized.
    pub fn to_json(&self) -> Value {
        match self {
            StoredValue::Text(s) => Value::String(s.clone()),
            StoredValue::Json(v) => v.clone(),
            StoredValue::Lines(lines) => {
                Value::Array(lines.iter().cloned().map(Value::String).collect())
            }
            StoredValue::Opaque(o) => {
                if o.type_tag == TAG_JSON {
                    if let Ok(v) = o.decode::<Value>() {
                        return v;
                    }
                }
                Value::String(format!("<{} bytes, {}>", o.payload.len(), o.type_tag))
            }
        }
    }
}

/// Loads an artifact, dispatching on its extension. Text reloads as text.
pub fn read_artifact(path: &Path) -> Result<StoredValue> {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let bytes = fs::read(path).at(path)?;
    Ok(match extension {
        "json" => StoredValue::Json(serde_json::from_slice(&bytes).at(path)?),
        "lst" => StoredValue::Lines(
            String::from_utf8_lossy(&bytes)
                .lines()
                .map(|l| l.to_string())
                .collect(),
        ),
        "bin" => StoredValue::Opaque(bincode::deserialize(&bytes).map_err(|e| {
            SweepError::Persistence {
                dir: path.parent().unwrap_or(path).to_path_buf(),
                key: path.display().to_string(),
                message: format!("not an opaque artifact: {}", e),
            }
        })?),
        _ => StoredValue::Text(String::from_utf8_lossy(&bytes).into_owned()),
    })
}
