//! Content sanitization: sensitive-data detection and rule-based replacement.
//!
//! [`detect`] runs a fixed catalogue of detectors over in-memory content and
//! reports de-duplicated matches per category. [`apply`] rewrites content
//! under caller-supplied replacement rules; its `applied` count is what the
//! history rewriter uses to decide whether a commit needs amending at all.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

/// A replacement pattern: either a literal substring or a compiled regex.
#[derive(Debug, Clone)]
pub enum Pattern {
    Literal(String),
    Regex(Regex),
}

/// A single search-and-replace rule applied across historical file content.
#[derive(Debug, Clone)]
pub struct ReplacementRule {
    pub pattern: Pattern,
    pub replacement: String,
}

impl ReplacementRule {
    /// Build a literal rule. The pattern must be non-empty.
    pub fn literal(pattern: &str, replacement: &str) -> Result<Self, Error> {
        if pattern.is_empty() {
            return Err(Error::EmptyPattern);
        }
        Ok(Self {
            pattern: Pattern::Literal(pattern.to_string()),
            replacement: replacement.to_string(),
        })
    }

    /// Build a regex rule. The pattern must compile.
    pub fn regex(pattern: &str, replacement: &str) -> Result<Self, Error> {
        let re = Regex::new(pattern).map_err(|source| Error::BadRegex {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self {
            pattern: Pattern::Regex(re),
            replacement: replacement.to_string(),
        })
    }

    /// The raw search text, used to locate candidate files before rewriting.
    pub fn needle(&self) -> &str {
        match &self.pattern {
            Pattern::Literal(s) => s,
            Pattern::Regex(re) => re.as_str(),
        }
    }

    /// Whether candidate search should treat the needle as a fixed string.
    pub fn is_literal(&self) -> bool {
        matches!(self.pattern, Pattern::Literal(_))
    }
}

/// Categories of sensitive data the fixed detectors look for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Category {
    Email,
    Phone,
    Credential,
    Ipv4,
    Url,
    CardNumber,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Category::Email => "email",
            Category::Phone => "phone",
            Category::Credential => "credential",
            Category::Ipv4 => "ipv4",
            Category::Url => "url",
            Category::CardNumber => "card-number",
        };
        f.write_str(name)
    }
}

static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap()
});

static PHONE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:\+\d{1,3}[ .-]?)?\(?\d{3}\)?[ .-]\d{3}[ .-]\d{4}\b").unwrap()
});

static CREDENTIAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\b[A-Z][A-Z0-9]*(?:_[A-Z0-9]+)*_?(?:KEY|TOKEN|SECRET|PASSWORD)\s*=\s*["']?[^\s"']+"#).unwrap()
});

static IPV4: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").unwrap()
});

static URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"https?://[^\s"'<>]+"#).unwrap()
});

static CARD_NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b\d{4}[ -]?\d{4}[ -]?\d{4}[ -]?\d{1,4}\b").unwrap()
});

/// Run every detector over `content`, returning de-duplicated matches per
/// category. Categories with no matches are absent from the map.
pub fn detect(content: &str) -> BTreeMap<Category, BTreeSet<String>> {
    let detectors: [(Category, &Regex); 6] = [
        (Category::Email, &EMAIL),
        (Category::Phone, &PHONE),
        (Category::Credential, &CREDENTIAL),
        (Category::Ipv4, &IPV4),
        (Category::Url, &URL),
        (Category::CardNumber, &CARD_NUMBER),
    ];

    let mut found = BTreeMap::new();
    for (category, re) in detectors {
        let matches: BTreeSet<String> = re
            .find_iter(content)
            .map(|m| m.as_str().to_string())
            .collect();
        if !matches.is_empty() {
            found.insert(category, matches);
        }
    }
    found
}

/// Result of applying replacement rules to one piece of content.
#[derive(Debug, Clone)]
pub struct SanitizeOutcome {
    pub content: String,
    /// Number of individual occurrences replaced. Zero means the content is
    /// unchanged and the caller must not amend.
    pub applied: usize,
}

/// Apply every rule to `content`: literal rules replace all occurrences,
/// regex rules substitute globally.
pub fn apply(content: &str, rules: &[ReplacementRule]) -> SanitizeOutcome {
    let mut current = content.to_string();
    let mut applied = 0;

    for rule in rules {
        match &rule.pattern {
            Pattern::Literal(needle) => {
                let hits = current.matches(needle.as_str()).count();
                if hits > 0 && rule.replacement != *needle {
                    current = current.replace(needle.as_str(), &rule.replacement);
                    applied += hits;
                }
            }
            Pattern::Regex(re) => {
                let hits = re.find_iter(&current).count();
                if hits > 0 {
                    let replaced = re.replace_all(&current, rule.replacement.as_str()).into_owned();
                    // A substitution that reproduces the input is not a change.
                    if replaced != current {
                        current = replaced;
                        applied += hits;
                    }
                }
            }
        }
    }

    SanitizeOutcome {
        content: current,
        applied,
    }
}

/// Errors from rule construction.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("literal pattern must not be empty")]
    EmptyPattern,

    #[error("regex pattern '{pattern}' does not compile")]
    BadRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}
