//! Path patterns.
//!
//! A pattern is a comma-separated list of globs. `*` matches within one path
//! segment, `**` across segments and `?` one character. A glob that does not
//! start with `/` matches at any depth, so `foo.json` means `/**/foo.json`.

use std::fmt;

use regex::Regex;

use crate::repository::error::{RepositoryError, RepositoryResult};

/// a compiled path pattern
#[derive(Debug, Clone)]
pub struct PathPattern {
    source: String,
    /// `None` when the pattern matches every path
    regex: Option<Regex>,
}

impl PathPattern {
    pub const ALL: &'static str = "/**";

    pub fn new(pattern: &str) -> RepositoryResult<Self> {
        let globs: Vec<String> = pattern
            .split(',')
            .map(str::trim)
            .filter(|glob| !glob.is_empty())
            .map(|glob| {
                if glob.starts_with('/') {
                    glob.to_string()
                } else {
                    format!("/**/{}", glob)
                }
            })
            .collect();
        if globs.is_empty() {
            return Err(RepositoryError::InvalidPattern(pattern.to_string()));
        }

        let source = globs.join(",");
        if globs.iter().any(|glob| glob == Self::ALL) {
            return Ok(Self { source, regex: None });
        }
        let alternatives: Vec<String> = globs.iter().map(|glob| glob_to_regex(glob)).collect();
        let regex = Regex::new(&format!("^(?:{})$", alternatives.join("|")))
            .map_err(|e| RepositoryError::InvalidPattern(format!("{}: {}", pattern, e)))?;

        Ok(Self {
            source,
            regex: Some(regex),
        })
    }

    /// the pattern matching every path
    pub fn all() -> Self {
        Self {
            source: Self::ALL.to_string(),
            regex: None,
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        match &self.regex {
            Some(regex) => regex.is_match(path),
            None => true,
        }
    }

    pub fn is_match_all(&self) -> bool {
        self.regex.is_none()
    }

    /// the normalized pattern text
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn glob_to_regex(glob: &str) -> String {
    let mut regex = String::with_capacity(glob.len() * 2);
    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                if chars.peek() == Some(&'/') {
                    chars.next();
                    regex.push_str("(?:.*/)?");
                } else {
                    regex.push_str(".*");
                }
            }
            '*' => regex.push_str("[^/]*"),
            '?' => regex.push_str("[^/]"),
            c => regex.push_str(&regex::escape(&c.to_string())),
        }
    }
    regex
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_path() {
        let pattern = PathPattern::new("/a/b.json").unwrap();
        assert!(pattern.matches("/a/b.json"));
        assert!(!pattern.matches("/a/bxjson"));
        assert!(!pattern.matches("/x/a/b.json"));
    }

    #[test]
    fn wildcards() {
        let pattern = PathPattern::new("/foo/*.json").unwrap();
        assert!(pattern.matches("/foo/a.json"));
        assert!(!pattern.matches("/foo/bar/a.json"));

        let pattern = PathPattern::new("/foo/**").unwrap();
        assert!(pattern.matches("/foo/y"));
        assert!(pattern.matches("/foo/a/b/c"));
        assert!(!pattern.matches("/bar/x"));

        let pattern = PathPattern::new("/a?.txt").unwrap();
        assert!(pattern.matches("/ab.txt"));
        assert!(!pattern.matches("/a/.txt"));
    }

    #[test]
    fn relative_globs_match_at_any_depth() {
        let pattern = PathPattern::new("foo.json").unwrap();
        assert_eq!(pattern.as_str(), "/**/foo.json");
        assert!(pattern.matches("/foo.json"));
        assert!(pattern.matches("/a/b/foo.json"));
        assert!(!pattern.matches("/a/xfoo.json"));
    }

    #[test]
    fn alternatives() {
        let pattern = PathPattern::new("/a.json, /b/**").unwrap();
        assert!(pattern.matches("/a.json"));
        assert!(pattern.matches("/b/c"));
        assert!(!pattern.matches("/c"));
        assert!(!pattern.is_match_all());
        assert!(PathPattern::new("/x, /**").unwrap().is_match_all());
    }

    #[test]
    fn all_matches_like_double_star() {
        let all = PathPattern::all();
        let parsed = PathPattern::new("/**").unwrap();
        assert_eq!(all.as_str(), parsed.as_str());
        assert!(all.is_match_all() && parsed.is_match_all());
        for path in ["/a.json", "/a/b/c.txt", "/.hidden"] {
            assert!(all.matches(path));
            assert_eq!(all.matches(path), parsed.matches(path));
        }
    }

    #[test]
    fn empty_pattern_is_invalid() {
        assert!(PathPattern::new("").is_err());
        assert!(PathPattern::new(" , ").is_err());
    }
}
