//! Remote listing results and pattern matching.

use std::collections::BTreeMap;

use anyhow::{format_err, Error};
use regex::Regex;
use serde::Serialize;

use crate::protocol::ListedFile;

/// Number of leading name characters that form the sortable date prefix
/// (`YYYYMMDD-HHMMSS-`).
pub const DATE_PREFIX_LEN: usize = 16;

/// How list patterns are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    Glob,
    Regex,
}

/// One remote catalogue file, as reported by the server.
#[derive(Debug, Clone, Serialize)]
pub struct CtfileListEntry {
    pub name: String,
    pub size: u64,
    pub mtime: i64,
    /// Cull reference count, unused outside the cull workflow.
    #[serde(skip)]
    pub keep: u32,
}

impl From<ListedFile> for CtfileListEntry {
    fn from(file: ListedFile) -> Self {
        Self {
            name: file.name,
            size: file.size,
            mtime: file.mtime,
            keep: 0,
        }
    }
}

/// Translate a glob pattern to an anchored regular expression.
fn glob_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            ch => out.push_str(&regex::escape(&ch.to_string())),
        }
    }
    out.push('$');
    out
}

/// Compiled include patterns. An empty pattern list matches everything.
pub struct Matcher {
    regexes: Vec<Regex>,
}

impl Matcher {
    pub fn compile(mode: MatchMode, patterns: &[String]) -> Result<Self, Error> {
        let mut regexes = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            let source = match mode {
                MatchMode::Glob => glob_to_regex(pattern),
                MatchMode::Regex => pattern.clone(),
            };
            regexes.push(
                Regex::new(&source)
                    .map_err(|err| format_err!("bad match pattern '{}' - {}", pattern, err))?,
            );
        }
        Ok(Self { regexes })
    }

    pub fn matches(&self, name: &str) -> bool {
        if self.regexes.is_empty() {
            return true;
        }
        self.regexes.iter().any(|re| re.is_match(name))
    }
}

/// Filter raw listing results down to the files of interest, keyed by name
/// so iteration order is the lexical (and therefore temporal) order.
pub fn filter_results(
    files: Vec<CtfileListEntry>,
    mode: MatchMode,
    include: &[String],
    exclude: &[String],
) -> Result<BTreeMap<String, CtfileListEntry>, Error> {
    let matcher = Matcher::compile(mode, include)?;
    let excluder = if exclude.is_empty() {
        None
    } else {
        Some(Matcher::compile(mode, exclude)?)
    };

    let mut results = BTreeMap::new();
    for file in files {
        if !matcher.matches(&file.name) {
            continue;
        }
        if let Some(ref excluder) = excluder {
            if excluder.matches(&file.name) {
                continue;
            }
        }
        results.insert(file.name.clone(), file);
    }
    Ok(results)
}

/// The newest entry: date prefixes sort lexically, so this is the maximum
/// key. Never guessed from mtime, the embedded date is authoritative.
pub fn newest(results: &BTreeMap<String, CtfileListEntry>) -> Option<&CtfileListEntry> {
    results.iter().next_back().map(|(_, entry)| entry)
}

#[cfg(test)]
mod test {
    use super::*;

    fn entry(name: &str) -> CtfileListEntry {
        CtfileListEntry {
            name: name.to_string(),
            size: 0,
            mtime: 0,
            keep: 0,
        }
    }

    #[test]
    fn glob_matches_secrets_pattern() {
        let matcher =
            Matcher::compile(MatchMode::Glob, &["*-crypto.secrets".to_string()]).unwrap();
        assert!(matcher.matches("00000000000000002000-crypto.secrets"));
        assert!(!matcher.matches("20240101-000000-photos"));
        assert!(!matcher.matches("x-crypto.secrets.old"));
    }

    #[test]
    fn regex_matching_is_anchored_by_pattern() {
        let matcher = Matcher::compile(
            MatchMode::Regex,
            &["^[0-9]{8}-[0-9]{6}-photos$".to_string()],
        )
        .unwrap();
        assert!(matcher.matches("20240101-123456-photos"));
        assert!(!matcher.matches("20240101-123456-photos-2"));
    }

    #[test]
    fn empty_include_matches_all_and_exclude_wins() {
        let files = vec![entry("a"), entry("b"), entry("c")];
        let results =
            filter_results(files, MatchMode::Glob, &[], &["b".to_string()]).unwrap();
        let names: Vec<_> = results.keys().cloned().collect();
        assert_eq!(names, vec!["a", "c"]);
    }

    #[test]
    fn newest_follows_the_date_prefix() {
        let mut names = vec![
            "20240222-000000-weekly",
            "20240301-000000-weekly",
            "20240215-000000-weekly",
        ];
        let files: Vec<_> = names.iter().map(|n| entry(n)).collect();
        let results = filter_results(files, MatchMode::Glob, &[], &[]).unwrap();
        assert_eq!(newest(&results).unwrap().name, "20240301-000000-weekly");

        // lexical order of the 16-char prefix equals wall-clock order
        names.sort_by(|a, b| a[..DATE_PREFIX_LEN].cmp(&b[..DATE_PREFIX_LEN]));
        assert_eq!(
            names,
            vec![
                "20240215-000000-weekly",
                "20240222-000000-weekly",
                "20240301-000000-weekly",
            ]
        );
    }
}
