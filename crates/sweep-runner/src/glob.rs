use crate::error::Result;
use std::cmp::Ordering;
use std::path::Path;
use walkdir::WalkDir;

pub const WILDCARD: char = '*';

pub fn is_glob(s: &str) -> bool {
    s.contains(WILDCARD)
}

/// Matches keep the pattern's prefix spelling; relative patterns yield relative paths.
pub fn expand_glob(pattern: &str) -> Result<Vec<String>> {
    let parts: Vec<&str> = pattern.split('/').collect();
    let literal_len = parts
        .iter()
        .position(|p| has_wildcard(p))
        .unwrap_or(parts.len());
    let (prefix, rest) = parts.split_at(literal_len);
    let pattern_parts: Vec<&str> = rest.iter().copied().filter(|p| !p.is_empty()).collect();

    let base = prefix.join("/");
    let root = if prefix.is_empty() {
        ".".to_string()
    } else if base.is_empty() {
        "/".to_string()
    } else {
        base.clone()
    };
    let root_path = Path::new(&root);
    if !root_path.is_dir() {
        return Ok(Vec::new());
    }

    let globstar = pattern_parts.contains(&"**");
    let mut walker = WalkDir::new(root_path).min_depth(1).follow_links(true);
    if !globstar {
        walker = walker.max_depth(pattern_parts.len());
    }
    let walker = walker.into_iter().filter_entry(|entry| {
        if globstar || !entry.file_type().is_dir() {
            return true;
        }
        let rel = relative_components(entry.path(), root_path);
        rel.len() >= pattern_parts.len()
            || match_components(&pattern_parts[..rel.len()], &rel)
    });

    let mut matches = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            // Unreadable subtrees, dangling links and link loops just don't match.
            Err(err) => {
                tracing::debug!("glob {}: skipping entry: {}", pattern, err);
                continue;
            }
        };
        let rel = relative_components(entry.path(), root_path);
        if !match_components(&pattern_parts, &rel) {
            continue;
        }
        let rel = rel.join("/");
        matches.push(if prefix.is_empty() {
            rel
        } else {
            format!("{}/{}", base, rel)
        });
    }
    matches.sort_by(|a, b| natural_cmp(a, b));
    Ok(matches)
}

fn has_wildcard(component: &str) -> bool {
    component.contains(WILDCARD) || component.contains('?')
}

fn relative_components(path: &Path, root: &Path) -> Vec<String> {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect()
}

fn match_components(pattern: &[&str], path: &[String]) -> bool {
    match pattern.split_first() {
        None => path.is_empty(),
        Some((&"**", rest)) => (0..=path.len()).any(|skip| {
            path[..skip].iter().all(|c| !c.starts_with('.')) && match_components(rest, &path[skip..])
        }),
        Some((first, rest)) => match path.split_first() {
            Some((head, tail)) => match_component(first, head) && match_components(rest, tail),
            None => false,
        },
    }
}

fn match_component(pattern: &str, name: &str) -> bool {
    if name.starts_with('.') && !pattern.starts_with('.') {
        return false;
    }
    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();
    wildcard_match(&pattern, &name)
}

fn wildcard_match(pattern: &[char], text: &[char]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while t < text.len() {
        if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, t));
            p += 1;
        } else if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if let Some((star, mark)) = backtrack {
            p = star + 1;
            t = mark + 1;
            backtrack = Some((star, mark + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|c| *c == '*')
}

/// Numeric-aware string ordering: `run2 < run10`.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut left = a.chars().peekable();
    let mut right = b.chars().peekable();
    loop {
        match (left.peek().copied(), right.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let lhs = take_digits(&mut left);
                let rhs = take_digits(&mut right);
                let ord = compare_digit_runs(&lhs, &rhs);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            (Some(x), Some(y)) => {
                if x != y {
                    return x.cmp(&y);
                }
                left.next();
                right.next();
            }
        }
    }
}

fn take_digits(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut run = String::new();
    while let Some(c) = chars.peek().copied().filter(|c| c.is_ascii_digit()) {
        run.push(c);
        chars.next();
    }
    run
}

fn compare_digit_runs(a: &str, b: &str) -> Ordering {
    let a_trim = a.trim_start_matches('0');
    let b_trim = b.trim_start_matches('0');
    a_trim
        .len()
        .cmp(&b_trim.len())
        .then_with(|| a_trim.cmp(b_trim))
        .then_with(|| a.len().cmp(&b.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensure_dir;
    use chrono::Utc;
    use std::fs;
    use std::path::PathBuf;

    fn temp_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "sweep_glob_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&root).expect("temp dir");
        root
    }

    #[test]
    fn natural_order_compares_numbers_by_value() {
        let mut names = vec!["run10.csv", "run2.csv", "run1.csv", "run02.csv", "alpha"];
        names.sort_by(|a, b| natural_cmp(a, b));
        assert_eq!(
            names,
            vec!["alpha", "run1.csv", "run2.csv", "run02.csv", "run10.csv"]
        );
    }

    #[test]
    fn wildcards_match_within_a_component() {
        assert!(match_component("*.csv", "data.csv"));
        assert!(match_component("run?.csv", "run1.csv"));
        assert!(!match_component("run?.csv", "run10.csv"));
        assert!(match_component("a*b*c", "axxbyyc"));
        assert!(!match_component("*.csv", ".hidden.csv"));
        assert!(match_component(".*", ".hidden"));
    }

    #[test]
    fn expands_files_in_natural_order() {
        let root = temp_root("files");
        for name in ["run10.txt", "run2.txt", "run1.txt", "notes.md"] {
            fs::write(root.join(name), b"x").expect("write");
        }
        let pattern = format!("{}/run*.txt", root.display());
        let found = expand_glob(&pattern).expect("glob");
        let names: Vec<String> = found
            .iter()
            .map(|p| p.rsplit('/').next().unwrap_or_default().to_string())
            .collect();
        assert_eq!(names, vec!["run1.txt", "run2.txt", "run10.txt"]);
        assert!(found[0].starts_with(&root.display().to_string()));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn expands_across_directories() {
        let root = temp_root("dirs");
        ensure_dir(&root.join("a").join("deep")).expect("dirs");
        ensure_dir(&root.join("b")).expect("dirs");
        fs::write(root.join("a").join("x.json"), b"{}").expect("write");
        fs::write(root.join("b").join("y.json"), b"{}").expect("write");
        fs::write(root.join("a").join("deep").join("z.json"), b"{}").expect("write");

        let one_level = expand_glob(&format!("{}/*/*.json", root.display())).expect("glob");
        assert_eq!(one_level.len(), 2);

        let any_level = expand_glob(&format!("{}/**/*.json", root.display())).expect("glob");
        assert_eq!(any_level.len(), 3);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_root_matches_nothing() {
        let found = expand_glob("/definitely/not/here/*.csv").expect("glob");
        assert!(found.is_empty());
    }
}
