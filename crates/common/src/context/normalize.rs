//! Query normalisation applied before and after enhancement
//!
//! - Raw query cleaning (niqqud, punctuation, whitespace)
//! - Language tagging
//! - Course nickname canonicalisation
//! - Whole-word entity matching

use crate::errors::{AppError, Result};
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

/// Language of a user query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    Hebrew,
    English,
    Unknown,
}

impl Language {
    /// Any Hebrew letter makes the query Hebrew; otherwise any Latin
    /// letter makes it English.
    pub fn detect(text: &str) -> Self {
        if text.chars().any(is_hebrew_letter) {
            Language::Hebrew
        } else if text.chars().any(|c| c.is_ascii_alphabetic()) {
            Language::English
        } else {
            Language::Unknown
        }
    }
}

fn is_hebrew_letter(c: char) -> bool {
    ('\u{05D0}'..='\u{05EA}').contains(&c)
}

fn is_hebrew_mark(c: char) -> bool {
    ('\u{0591}'..='\u{05C7}').contains(&c)
}

/// Strip niqqud and cantillation, replace punctuation with spaces and
/// collapse whitespace.
pub fn clean_query(query: &str) -> String {
    let mapped: String = query
        .chars()
        .filter(|c| !is_hebrew_mark(*c))
        .map(|c| {
            if c.is_ascii_alphanumeric() || is_hebrew_letter(c) {
                c
            } else {
                ' '
            }
        })
        .collect();

    mapped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// One-letter Hebrew prefixes that attach to the following word
/// (in, the, and, to, from, that, as)
const WORD_PREFIXES: &str = "בהולמשכ";

// regex-lite has ASCII-only `\b`, so word characters are spelled out
fn mention_pattern(name: &str) -> Option<Regex> {
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Regex::new(&format!(
        r"(?i)(^|[^0-9A-Za-zא-ת])([{}]{{0,2}})({})",
        WORD_PREFIXES,
        regex_lite::escape(name)
    ))
    .ok()
}

fn ends_word(text: &str, end: usize) -> bool {
    !text[end..].chars().next().is_some_and(char::is_alphanumeric)
}

/// Byte ranges where `name` occurs as a whole word in `text`
fn mention_spans(text: &str, name: &str) -> Vec<(usize, usize)> {
    let Some(pattern) = mention_pattern(name) else {
        return Vec::new();
    };
    pattern
        .captures_iter(text)
        .filter_map(|caps| caps.get(3))
        .filter(|m| ends_word(text, m.end()))
        .map(|m| (m.start(), m.end()))
        .collect()
}

/// Whether `name` occurs in `text` as a whole word, ignoring ASCII case.
///
/// A Hebrew prefix of up to two letters may be attached ("באלגוריתמים").
pub fn mentions(text: &str, name: &str) -> bool {
    !mention_spans(text, name).is_empty()
}

fn replace_mentions(text: &str, alias: &str, official: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for (start, end) in mention_spans(text, alias) {
        out.push_str(&text[last..start]);
        out.push_str(official);
        last = end;
    }
    out.push_str(&text[last..]);
    out
}

/// Map from informal course names to official ones
#[derive(Debug, Clone, Default)]
pub struct NicknameMap {
    aliases: HashMap<String, String>,
}

impl NicknameMap {
    pub fn new(aliases: HashMap<String, String>) -> Self {
        Self { aliases }
    }

    /// Load from a JSON object file. A missing file yields an empty map.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "Nickname map not found, continuing without aliases");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };

        let aliases: HashMap<String, String> =
            serde_json::from_str(&raw).map_err(|e| AppError::Configuration {
                message: format!("invalid nickname map {}: {}", path.display(), e),
            })?;
        info!(aliases = aliases.len(), "Course nickname map loaded");
        Ok(Self { aliases })
    }

    /// Official name for `name`, or `name` itself
    pub fn canonical<'a>(&'a self, name: &'a str) -> &'a str {
        self.aliases.get(name).map(String::as_str).unwrap_or(name)
    }

    /// Replace aliases in `courses`, and their whole-word occurrences in
    /// `text`, with official names
    pub fn apply(&self, text: &str, courses: &mut [String]) -> String {
        let mut text = text.to_string();
        for course in courses.iter_mut() {
            let official = self.canonical(course).to_string();
            if official != *course {
                text = replace_mentions(&text, course, &official);
                *course = official;
            }
        }
        text
    }

    pub fn len(&self) -> usize {
        self.aliases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_query() {
        assert_eq!(
            clean_query("  What's the avg   grade in algo?! "),
            "What s the avg grade in algo"
        );
        // niqqud removed, letters kept
        assert_eq!(clean_query("שָׁלוֹם, עוֹלָם"), "שלום עולם");
    }

    #[test]
    fn test_language_detection() {
        assert_eq!(Language::detect("מה הממוצע בקורס"), Language::Hebrew);
        assert_eq!(Language::detect("average grade"), Language::English);
        assert_eq!(Language::detect("2023 2024"), Language::Unknown);
    }

    #[test]
    fn test_nicknames_apply() {
        let map = NicknameMap::new(HashMap::from([
            ("algo".to_string(), "Algorithms".to_string()),
        ]));
        let mut courses = vec!["algo".to_string(), "Calculus".to_string()];
        let text = map.apply("who teaches algo", &mut courses);

        assert_eq!(text, "who teaches Algorithms");
        assert_eq!(courses, ["Algorithms", "Calculus"]);
        assert_eq!(map.canonical("unknown"), "unknown");
    }

    #[test]
    fn test_nicknames_replace_whole_words_only() {
        let map = NicknameMap::new(HashMap::from([
            ("algo".to_string(), "Algorithms".to_string()),
            ("חדוא 1".to_string(), "חשבון דיפרנציאלי ואינטגרלי 1".to_string()),
        ]));

        let mut courses = vec!["algo".to_string()];
        let text = map.apply("is algo harder than algorithms 2 or algo", &mut courses);
        assert_eq!(text, "is Algorithms harder than algorithms 2 or Algorithms");

        let mut courses = vec!["חדוא 1".to_string()];
        let text = map.apply("מה הממוצע בחדוא 1", &mut courses);
        assert_eq!(text, "מה הממוצע בחשבון דיפרנציאלי ואינטגרלי 1");
    }

    #[test]
    fn test_mentions_whole_words() {
        assert!(mentions("Compare lecturer A and lecturer B", "A"));
        assert!(!mentions("how hard is algorithms", "A"));
        assert!(mentions("grades in 2024?", "2024"));
        assert!(!mentions("grades in 20245", "2024"));
        assert!(mentions("who teaches ALGORITHMS", "Algorithms"));
        // attached Hebrew prefix
        assert!(mentions("מה הממוצע באלגוריתמים", "אלגוריתמים"));
        assert!(!mentions("מה הממוצע בקורס", "קורס א"));
        assert!(!mentions("anything", "  "));
    }

    #[tokio::test]
    async fn test_missing_nickname_file_is_empty() {
        let map = NicknameMap::load("no/such/nicknames.json").await.unwrap();
        assert!(map.is_empty());
    }
}
