//! Domain matching rules.
//!
//! A rule is written as `<kind>;[w];<payload>`:
//!
//! - `r` matches the payload as a regular expression
//! - `c` matches when the domain contains the payload
//! - `e` matches when the domain equals the payload
//!
//! A middle field starting with `w` marks a whitelist rule. Lines starting
//! with `#` are comments.
//!
//! # Example
//!
//! ```
//! use dnsfs::rules::{Rule, RuleSet};
//!
//! let rules = ["c;;google.com", "c;w;456.google.com"]
//!     .iter()
//!     .filter_map(|line| Rule::parse_line(line).unwrap());
//! let set = RuleSet::new(rules);
//!
//! assert!(set.test("xxx.google.com"));
//! assert!(!set.test("456.google.com"));
//! ```

pub mod convert;
pub mod loader;
pub mod remote;

use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;

use regex::Regex;

pub use loader::RuleFile;

const REGEX_KIND: &str = "r";
const CONTAINS_KIND: &str = "c";
const EQUALS_KIND: &str = "e";
const WHITELIST_MARK: char = 'w';

/// Error for a single rule line.
#[derive(Debug, thiserror::Error)]
pub enum RuleParseError {
    #[error("invalid rule format {0:?}")]
    InvalidFormat(String),

    #[error("unknown rule kind {kind:?} in {text:?}")]
    UnknownKind { kind: String, text: String },

    #[error("invalid regular expression in {text:?}: {source}")]
    InvalidRegex {
        text: String,
        #[source]
        source: regex::Error,
    },
}

/// Error loading rule files.
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("could not read rule directory {path:?}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not read rule file {path:?}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("rule file {path:?}, line {line}: {source}")]
    Parse {
        path: PathBuf,
        line: usize,
        #[source]
        source: RuleParseError,
    },

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// What a rule compares the domain against.
#[derive(Debug, Clone)]
pub enum Matcher {
    Regex(Regex),
    Contains(String),
    Equals(String),
}

impl Matcher {
    const fn kind(&self) -> &'static str {
        match self {
            Self::Regex(_) => REGEX_KIND,
            Self::Contains(_) => CONTAINS_KIND,
            Self::Equals(_) => EQUALS_KIND,
        }
    }

    fn payload(&self) -> &str {
        match self {
            Self::Regex(regex) => regex.as_str(),
            Self::Contains(text) | Self::Equals(text) => text,
        }
    }

    /// `domain` must already be lower-case.
    fn matches_lowercase(&self, domain: &str) -> bool {
        match self {
            Self::Regex(regex) => regex.is_match(domain),
            Self::Contains(text) => domain.contains(text.as_str()),
            Self::Equals(text) => domain == text,
        }
    }
}

/// A single domain matching rule.
///
/// Two rules are equal when kind, payload and whitelist flag are equal.
#[derive(Debug, Clone)]
pub struct Rule {
    matcher: Matcher,
    whitelist: bool,
}

impl Rule {
    pub const fn new(matcher: Matcher, whitelist: bool) -> Self {
        Self { matcher, whitelist }
    }

    /// Parse one line of a rule file.
    ///
    /// Returns `Ok(None)` for comments and blank lines. Literal payloads are
    /// lower-cased so every kind of rule matches case-insensitively.
    pub fn parse_line(line: &str) -> Result<Option<Self>, RuleParseError> {
        let text = line.trim_end_matches(['\r', '\n']).trim_matches(' ');

        if text.is_empty() || text.starts_with('#') {
            return Ok(None);
        }

        let fields: Vec<&str> = text.splitn(3, ';').collect();
        let (kind, whitelist, payload) = match fields.as_slice() {
            [kind, flags, payload] => (*kind, flags.starts_with(WHITELIST_MARK), *payload),
            [kind, payload] => (*kind, false, *payload),
            _ => return Err(RuleParseError::InvalidFormat(text.to_string())),
        };

        let matcher = match kind {
            REGEX_KIND => {
                let regex = Regex::new(payload).map_err(|source| RuleParseError::InvalidRegex {
                    text: text.to_string(),
                    source,
                })?;
                Matcher::Regex(regex)
            }
            CONTAINS_KIND => Matcher::Contains(payload.to_lowercase()),
            EQUALS_KIND => Matcher::Equals(payload.to_lowercase()),
            _ => {
                return Err(RuleParseError::UnknownKind {
                    kind: kind.to_string(),
                    text: text.to_string(),
                });
            }
        };

        Ok(Some(Self { matcher, whitelist }))
    }

    /// Check the rule against a domain, ignoring case.
    pub fn matches(&self, domain: &str) -> bool {
        self.matcher.matches_lowercase(&domain.to_lowercase())
    }

    pub const fn is_whitelist(&self) -> bool {
        self.whitelist
    }

    pub const fn matcher(&self) -> &Matcher {
        &self.matcher
    }
}

impl PartialEq for Rule {
    fn eq(&self, other: &Self) -> bool {
        self.whitelist == other.whitelist
            && self.matcher.kind() == other.matcher.kind()
            && self.matcher.payload() == other.matcher.payload()
    }
}

impl Eq for Rule {}

impl Hash for Rule {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.matcher.kind().hash(state);
        self.matcher.payload().hash(state);
        self.whitelist.hash(state);
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = if self.whitelist { "w" } else { "" };
        write!(f, "{};{flag};{}", self.matcher.kind(), self.matcher.payload())
    }
}

/// Rules of one polarity, with equality rules split out for hash lookups.
#[derive(Debug, Clone, Default)]
struct RuleGroup {
    exact: HashSet<String>,
    patterns: Vec<Rule>,
}

impl RuleGroup {
    fn insert(&mut self, rule: &Rule) {
        match &rule.matcher {
            Matcher::Equals(text) => {
                self.exact.insert(text.clone());
            }
            _ => self.patterns.push(rule.clone()),
        }
    }

    fn matches(&self, domain: &str) -> bool {
        self.exact.contains(domain)
            || self
                .patterns
                .iter()
                .any(|rule| rule.matcher.matches_lowercase(domain))
    }
}

/// A de-duplicated set of rules.
///
/// Evaluation never mutates the set, so it can be shared between tasks
/// without locking once built.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
    whitelist: RuleGroup,
    blacklist: RuleGroup,
}

impl RuleSet {
    /// Build a set, dropping structural duplicates while keeping first-seen
    /// order.
    pub fn new<I>(rules: I) -> Self
    where
        I: IntoIterator<Item = Rule>,
    {
        let mut seen = HashSet::new();
        let mut set = Self::default();

        for rule in rules {
            if !seen.insert(rule.clone()) {
                continue;
            }

            if rule.whitelist {
                set.whitelist.insert(&rule);
            } else {
                set.blacklist.insert(&rule);
            }
            set.rules.push(rule);
        }

        set
    }

    /// Merge the rules of already loaded files.
    pub fn from_files(files: &[RuleFile]) -> Self {
        Self::new(files.iter().flat_map(|file| file.rules.iter().cloned()))
    }

    /// Returns `true` when the domain should be sunk.
    ///
    /// Whitelist rules are evaluated first and any match wins outright;
    /// blacklist rules are only consulted when no whitelist rule matched.
    pub fn test(&self, domain: &str) -> bool {
        let domain = domain.to_lowercase();

        if self.whitelist.matches(&domain) {
            return false;
        }

        self.blacklist.matches(&domain)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(line: &str) -> Rule {
        Rule::parse_line(line).unwrap().unwrap()
    }

    fn set(lines: &[&str]) -> RuleSet {
        RuleSet::new(lines.iter().map(|line| rule(line)))
    }

    #[test]
    fn should_parse_each_rule_kind() {
        assert!(matches!(rule("r;;^ads\\.").matcher(), Matcher::Regex(_)));
        assert!(matches!(rule("c;;tracker").matcher(), Matcher::Contains(_)));
        assert!(matches!(rule("e;;example.com").matcher(), Matcher::Equals(_)));
    }

    #[test]
    fn should_mark_whitelist_from_middle_field() {
        assert!(rule("e;w;example.com").is_whitelist());
        assert!(rule("e;whatever;example.com").is_whitelist());
        assert!(!rule("e;;example.com").is_whitelist());
        assert!(!rule("e;x;example.com").is_whitelist());
    }

    #[test]
    fn should_accept_two_field_form_as_blacklist() {
        let parsed = rule("c;doubleclick");
        assert!(!parsed.is_whitelist());
        assert!(parsed.matches("ad.doubleclick.net"));
    }

    #[test]
    fn should_keep_semicolons_inside_payload() {
        let parsed = rule("r;;a;b");
        assert_eq!(parsed.matcher().payload(), "a;b");
    }

    #[test]
    fn should_skip_comments_and_blank_lines() {
        assert!(Rule::parse_line("# a comment").unwrap().is_none());
        assert!(Rule::parse_line("   # indented comment").unwrap().is_none());
        assert!(Rule::parse_line("").unwrap().is_none());
        assert!(Rule::parse_line("\n").unwrap().is_none());
    }

    #[test]
    fn should_reject_line_without_separator() {
        assert!(matches!(
            Rule::parse_line("example.com"),
            Err(RuleParseError::InvalidFormat(_))
        ));
    }

    #[test]
    fn should_reject_unknown_kind() {
        assert!(matches!(
            Rule::parse_line("x;;example.com"),
            Err(RuleParseError::UnknownKind { kind, .. }) if kind == "x"
        ));
    }

    #[test]
    fn should_reject_invalid_regex() {
        assert!(matches!(
            Rule::parse_line("r;;(unclosed"),
            Err(RuleParseError::InvalidRegex { .. })
        ));
    }

    #[test]
    fn should_match_case_insensitively_for_every_kind() {
        assert!(rule("r;;^ads\\.example\\.com$").matches("ADS.Example.com"));
        assert!(rule("c;;Tracker").matches("my.TRACKER.net"));
        assert!(rule("e;;Example.COM").matches("example.com"));
        assert!(rule("e;;example.com").matches("EXAMPLE.com"));
    }

    #[test]
    fn should_not_match_partial_equals() {
        let parsed = rule("e;;example.com");
        assert!(!parsed.matches("www.example.com"));
        assert!(!parsed.matches("example.co"));
    }

    #[test]
    fn should_render_textual_form() {
        assert_eq!(rule("c;w;google.com").to_string(), "c;w;google.com");
        assert_eq!(rule("r;;^ads").to_string(), "r;;^ads");
        assert_eq!(rule("e;;EXAMPLE.com").to_string(), "e;;example.com");
    }

    #[test]
    fn should_give_whitelist_absolute_precedence() {
        let rules = set(&["c;;google.com", "c;w;456.google.com"]);

        assert!(rules.test("xxx.google.com"));
        assert!(!rules.test("456.google.com"));
    }

    #[test]
    fn should_give_whitelist_precedence_regardless_of_order() {
        let rules = set(&["c;w;456.google.com", "e;;456.google.com", "r;;google"]);

        assert!(!rules.test("456.google.com"));
        assert!(rules.test("mail.google.com"));
    }

    #[test]
    fn should_not_sink_without_any_match() {
        let rules = set(&["c;;ads", "e;w;example.com"]);

        assert!(!rules.test("github.com"));
        assert!(!rules.test("example.com"));
        assert!(!RuleSet::default().test("anything.org"));
    }

    #[test]
    fn should_sink_exact_and_pattern_matches() {
        let rules = set(&["e;;blocked.com", "r;;^track[0-9]+\\."]);

        assert!(rules.test("blocked.com"));
        assert!(rules.test("BLOCKED.COM"));
        assert!(rules.test("track42.example.net"));
        assert!(!rules.test("tracking.example.net"));
    }

    #[test]
    fn should_deduplicate_structurally_equal_rules() {
        let rules = set(&["c;;ads", "c;;ads", "c;w;ads", "e;;ads", "c;;ADS"]);

        assert_eq!(rules.len(), 3);
        let rendered: Vec<String> = rules.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, vec!["c;;ads", "c;w;ads", "e;;ads"]);
    }

    #[test]
    fn should_give_same_answer_on_repeated_tests() {
        let rules = set(&["c;;google.com", "c;w;456.google.com", "r;;^ads"]);

        for domain in ["xxx.google.com", "456.google.com", "ads.net", "other.org"] {
            let first = rules.test(domain);
            for _ in 0..10 {
                assert_eq!(rules.test(domain), first);
            }
        }
    }
}
