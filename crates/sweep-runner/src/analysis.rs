use crate::alloc::{dir_is_empty, numbered_dirs};
use crate::codec::{read_artifact, read_config, CONFIG_FILE};
use crate::error::{IoContext, Result, SweepError};
use crate::glob::natural_cmp;
use crate::value::{canonicalize_json, FieldKind};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_SEPARATOR: &str = "/";
pub const TRIAL_COLUMN: &str = "trial";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingPolicy {
    /// Leave that trial out of the table.
    #[default]
    Skip,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    pub dir: PathBuf,
    /// `trial` first, then flattened config keys, then result columns.
    pub columns: Map<String, Value>,
}

/// Nested mappings become `outer<sep>inner` keys; everything else is kept as is.
pub fn flatten(config: &Map<String, Value>, separator: &str) -> Map<String, Value> {
    let mut out = Map::new();
    flatten_into(&mut out, None, config, separator);
    out
}

fn flatten_into(out: &mut Map<String, Value>, prefix: Option<&str>, map: &Map<String, Value>, sep: &str) {
    for (key, value) in map {
        let name = match prefix {
            Some(p) => format!("{}{}{}", p, sep, key),
            None => key.clone(),
        };
        match value {
            Value::Object(inner) => flatten_into(out, Some(&name), inner, sep),
            other => {
                out.insert(name, other.clone());
            }
        }
    }
}

pub fn is_subset(filter: &Value, config: &Value) -> bool {
    match (filter, config) {
        (Value::Object(f), Value::Object(c)) => f.iter().all(|(key, fv)| match c.get(key) {
            Some(cv) if fv.is_object() => is_subset(fv, cv),
            Some(cv) => fv == cv,
            None => false,
        }),
        (Value::Object(_), _) | (_, Value::Object(_)) => false,
        (f, c) => f == c,
    }
}

/// An empty `files` list loads every artifact. Columns are named after the file
/// stem, with JSON mappings flattened below it.
pub fn load_results(
    output_dir: &Path,
    files: &[String],
    separator: &str,
    missing: MissingPolicy,
) -> Result<Vec<ResultRow>> {
    let mut rows = Vec::new();
    'trials: for (_, dir) in numbered_dirs(output_dir)? {
        let Some(config) = read_config(&dir)? else {
            if !dir_is_empty(&dir)? {
                tracing::warn!("skipping {}: no {}", dir.display(), CONFIG_FILE);
            }
            continue;
        };

        let mut columns = Map::new();
        let trial = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        columns.insert(TRIAL_COLUMN.to_string(), Value::String(trial));
        if let Value::Object(map) = &config {
            columns.extend(flatten(map, separator));
        }

        let names = if files.is_empty() {
            artifact_names(&dir)?
        } else {
            files.to_vec()
        };
        for name in &names {
            let path = dir.join(name);
            if !path.is_file() {
                match missing {
                    MissingPolicy::Skip => {
                        tracing::debug!("skipping {}: no {}", dir.display(), name);
                        continue 'trials;
                    }
                    MissingPolicy::Error => {
                        return Err(SweepError::Persistence {
                            dir: dir.clone(),
                            key: name.clone(),
                            message: "result file is missing".to_string(),
                        })
                    }
                }
            }
            let stem = Path::new(name)
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| name.clone());
            match read_artifact(&path)?.to_json() {
                Value::Object(map) => {
                    for (key, value) in flatten(&map, separator) {
                        columns.insert(format!("{}{}{}", stem, separator, key), value);
                    }
                }
                other => {
                    columns.insert(stem, other);
                }
            }
        }
        rows.push(ResultRow { dir, columns });
    }
    Ok(rows)
}

pub fn query(output_dir: &Path, filter: &Value) -> Result<Vec<PathBuf>> {
    let filter = canonicalize_json(filter, FieldKind::Plain);
    let mut out = Vec::new();
    for (_, dir) in numbered_dirs(output_dir)? {
        if let Some(config) = read_config(&dir)? {
            if is_subset(&filter, &config) {
                out.push(dir);
            }
        }
    }
    Ok(out)
}

fn artifact_names(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir).at(dir)? {
        let entry = entry.at(dir)?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == CONFIG_FILE || name.starts_with('.') || !entry.path().is_file() {
            continue;
        }
        names.push(name);
    }
    names.sort_by(|a, b| natural_cmp(a, b));
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensure_dir;
    use chrono::Utc;
    use serde_json::json;

    fn temp_output(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "sweep_analysis_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&dir).expect("temp dir");
        dir
    }

    fn trial(out: &Path, name: &str, config: Value, files: &[(&str, &str)]) {
        let dir = out.join(name);
        ensure_dir(&dir).expect("dir");
        fs::write(dir.join(CONFIG_FILE), config.to_string()).expect("config");
        for (file, body) in files {
            fs::write(dir.join(file), body).expect("file");
        }
    }

    #[test]
    fn flatten_joins_nested_keys() {
        let config = json!({
            "a1": "v1",
            "a2": {"a21": "v21", "a22": "v22", "a23": "v23"},
            "a3": {"a31": {"a311": "v311", "a312": "v312"}},
        });
        let Value::Object(map) = config else { unreachable!() };
        let flat = flatten(&map, "/");
        assert_eq!(
            Value::Object(flat),
            json!({
                "a1": "v1", "a2/a21": "v21", "a2/a22": "v22", "a2/a23": "v23",
                "a3/a31/a311": "v311", "a3/a31/a312": "v312",
            })
        );
        let flat = flatten(&map, "$");
        assert!(flat.contains_key("a3$a31$a312"));
    }

    #[test]
    fn subset_matching_recurses() {
        let config = json!({"lr": 0.1, "model": {"depth": 3, "width": 64}});
        assert!(is_subset(&json!({}), &config));
        assert!(is_subset(&json!({"model": {"depth": 3}}), &config));
        assert!(!is_subset(&json!({"model": {"depth": 4}}), &config));
        assert!(!is_subset(&json!({"seed": 1}), &config));
        assert!(!is_subset(&json!({"lr": {"x": 1}}), &config));
    }

    #[test]
    fn rows_hold_config_and_results() {
        let out = temp_output("rows");
        trial(&out, "000001", json!({"x": 1, "opt": {"lr": 0.1}}), &[
            ("result.txt", "42"),
            ("metrics.json", r#"{"loss": 0.5, "acc": {"top1": 0.9}}"#),
            ("notes.txt", "fine"),
        ]);
        trial(&out, "000002", json!({"x": 2, "opt": {"lr": 0.2}}), &[("result.txt", "43")]);
        ensure_dir(&out.join("000003")).expect("reserved");

        let rows = load_results(&out, &[], "/", MissingPolicy::Skip).expect("load");
        assert_eq!(rows.len(), 2);
        let first = &rows[0].columns;
        assert_eq!(first["trial"], json!("000001"));
        assert_eq!(first["opt/lr"], json!(0.1));
        assert_eq!(first["result"], json!("42"));
        assert_eq!(first["metrics/acc/top1"], json!(0.9));
        assert_eq!(first["notes"], json!("fine"));
        assert!(!rows[1].columns.contains_key("metrics/loss"));
        let _ = fs::remove_dir_all(out);
    }

    #[test]
    fn text_results_stay_text() {
        let out = temp_output("text");
        trial(&out, "000001", json!({"x": 1}), &[
            ("label.txt", "42"),
            ("flag.txt", "true"),
            ("curve.lst", "1\n2"),
        ]);
        let rows = load_results(&out, &[], "/", MissingPolicy::Error).expect("load");
        let row = &rows[0].columns;
        assert_eq!(row["label"], json!("42"));
        assert_eq!(row["flag"], json!("true"));
        assert_eq!(row["curve"], json!(["1", "2"]));
        let _ = fs::remove_dir_all(out);
    }

    #[test]
    fn missing_files_follow_policy() {
        let out = temp_output("missing");
        trial(&out, "000001", json!({"x": 1}), &[("result.txt", "1")]);
        trial(&out, "000002", json!({"x": 2}), &[]);
        let files = vec!["result.txt".to_string()];

        let rows = load_results(&out, &files, "/", MissingPolicy::Skip).expect("skip");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].columns["result"], json!("1"));

        let err = load_results(&out, &files, "/", MissingPolicy::Error).expect_err("strict");
        assert!(err.to_string().contains("missing"), "{}", err);
        let _ = fs::remove_dir_all(out);
    }

    #[test]
    fn query_matches_canonical_datetimes() {
        let out = temp_output("query");
        trial(&out, "000001", json!({"start_dt": "2024-01-01 00:00:00", "n": 1}), &[]);
        trial(&out, "000002", json!({"start_dt": "2024-01-02 00:00:00", "n": 1}), &[]);
        let found = query(&out, &json!({"start_dt": "2024-01-02"})).expect("query");
        assert_eq!(found, vec![out.join("000002")]);
        assert_eq!(query(&out, &json!({"n": 1})).expect("query").len(), 2);
        let _ = fs::remove_dir_all(out);
    }
}
