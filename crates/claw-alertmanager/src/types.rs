//! Core types for the notification engine.
//!
//! This module provides the fundamental types used throughout the crate:
//! - [`LabelSet`]: The identity of an alert
//! - [`Fingerprint`]: A stable hash of a label set
//! - [`Matcher`]: A label matcher (`=`, `!=`, `=~`, `!~`)
//! - [`AlertState`]: Whether an alert is firing or resolved
//! - [`Alert`]: A normalized alert held by the alert store
//! - [`RawAlert`]: An alert as submitted by a caller

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{AlertError, Result};

/// An alert's labels, ordered by name.
///
/// Ordering makes iteration, hashing and serialization deterministic.
pub type LabelSet = BTreeMap<String, String>;

/// Name of the label conventionally holding the alert's name.
pub const ALERT_NAME_LABEL: &str = "alertname";

static LABEL_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").unwrap_or_else(|_| unreachable!())
});

static MATCHER_SYNTAX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\s*([a-zA-Z_][a-zA-Z0-9_]*)\s*(=~|!~|!=|=)\s*(.*?)\s*$"#)
        .unwrap_or_else(|_| unreachable!())
});

/// Returns true if `name` is a valid label name.
#[must_use]
pub fn is_valid_label_name(name: &str) -> bool {
    LABEL_NAME.is_match(name)
}

/// A stable 64-bit hash of a label set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(u64);

impl Fingerprint {
    /// Computes the fingerprint of a label set.
    #[must_use]
    pub fn of(labels: &LabelSet) -> Self {
        let mut hasher = blake3::Hasher::new();
        for (name, value) in labels {
            hasher.update(name.as_bytes());
            hasher.update(&[0xff]);
            hasher.update(value.as_bytes());
            hasher.update(&[0xff]);
        }
        let digest = hasher.finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest.as_bytes()[..8]);
        Self(u64::from_be_bytes(head))
    }

    /// Returns the raw hash value.
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl From<Fingerprint> for String {
    fn from(fp: Fingerprint) -> Self {
        fp.to_string()
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        u64::from_str_radix(&value, 16)
            .map(Self)
            .map_err(|e| format!("invalid fingerprint '{value}': {e}"))
    }
}

/// The comparison a [`Matcher`] performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchType {
    /// `name="value"`
    Equal,
    /// `name!="value"`
    NotEqual,
    /// `name=~"regex"`
    Regex,
    /// `name!~"regex"`
    NotRegex,
}

impl MatchType {
    /// Returns the operator symbol.
    #[must_use]
    pub const fn as_symbol(&self) -> &'static str {
        match self {
            Self::Equal => "=",
            Self::NotEqual => "!=",
            Self::Regex => "=~",
            Self::NotRegex => "!~",
        }
    }

    fn from_symbol(symbol: &str) -> Option<Self> {
        match symbol {
            "=" => Some(Self::Equal),
            "!=" => Some(Self::NotEqual),
            "=~" => Some(Self::Regex),
            "!~" => Some(Self::NotRegex),
            _ => None,
        }
    }
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_symbol())
    }
}

/// A single label matcher.
///
/// A label that is absent from the set is treated as having the empty value,
/// so `severity!="critical"` matches an alert without a `severity` label.
/// Regular expressions are fully anchored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Matcher {
    name: String,
    match_type: MatchType,
    value: String,
    regex: Option<Regex>,
}

impl Matcher {
    /// Creates a new matcher, compiling the regex for regex match types.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::InvalidMatcher` if the name is not a valid label
    /// name or the regex does not compile.
    pub fn new(name: impl Into<String>, match_type: MatchType, value: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let value = value.into();
        let invalid = |reason: String| AlertError::InvalidMatcher {
            input: format!("{name}{match_type}\"{value}\""),
            reason,
        };

        if !is_valid_label_name(&name) {
            return Err(invalid("invalid label name".to_string()));
        }

        let regex = match match_type {
            MatchType::Regex | MatchType::NotRegex => Some(
                Regex::new(&format!("^(?:{value})$")).map_err(|e| invalid(e.to_string()))?,
            ),
            MatchType::Equal | MatchType::NotEqual => None,
        };

        Ok(Self {
            name,
            match_type,
            value,
            regex,
        })
    }

    /// Shorthand for an equality matcher.
    ///
    /// # Errors
    ///
    /// Returns an error if `name` is not a valid label name.
    pub fn equal(name: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        Self::new(name, MatchType::Equal, value)
    }

    /// Shorthand for a regex matcher.
    ///
    /// # Errors
    ///
    /// Returns an error if `name` is invalid or the regex does not compile.
    pub fn regex(name: impl Into<String>, pattern: impl Into<String>) -> Result<Self> {
        Self::new(name, MatchType::Regex, pattern)
    }

    /// Returns the label name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the match type.
    #[must_use]
    pub const fn match_type(&self) -> MatchType {
        self.match_type
    }

    /// Returns the value or pattern.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Checks the matcher against a label set.
    #[must_use]
    pub fn matches(&self, labels: &LabelSet) -> bool {
        let actual = labels.get(&self.name).map_or("", String::as_str);
        match (self.match_type, &self.regex) {
            (MatchType::Equal, _) => actual == self.value,
            (MatchType::NotEqual, _) => actual != self.value,
            (MatchType::Regex, Some(re)) => re.is_match(actual),
            (MatchType::NotRegex, Some(re)) => !re.is_match(actual),
            (MatchType::Regex | MatchType::NotRegex, None) => false,
        }
    }
}

/// Returns true if every matcher matches the label set.
///
/// An empty matcher list matches everything.
#[must_use]
pub fn matches_all(matchers: &[Matcher], labels: &LabelSet) -> bool {
    matchers.iter().all(|m| m.matches(labels))
}

impl PartialEq for Matcher {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.match_type == other.match_type && self.value == other.value
    }
}

impl Eq for Matcher {}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let escaped = self.value.replace('\\', r"\\").replace('"', "\\\"");
        write!(f, "{}{}\"{}\"", self.name, self.match_type, escaped)
    }
}

impl FromStr for Matcher {
    type Err = AlertError;

    fn from_str(input: &str) -> Result<Self> {
        let caps = MATCHER_SYNTAX
            .captures(input)
            .ok_or_else(|| AlertError::InvalidMatcher {
                input: input.to_string(),
                reason: "expected name, operator and value".to_string(),
            })?;

        let name = &caps[1];
        let match_type = MatchType::from_symbol(&caps[2]).ok_or_else(|| AlertError::InvalidMatcher {
            input: input.to_string(),
            reason: "unknown operator".to_string(),
        })?;
        let raw = &caps[3];

        let value = if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
            unescape(&raw[1..raw.len() - 1])
        } else {
            raw.to_string()
        };

        Self::new(name, match_type, value)
    }
}

fn unescape(quoted: &str) -> String {
    let mut out = String::with_capacity(quoted.len());
    let mut chars = quoted.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some(other) => out.push(other),
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

impl From<Matcher> for String {
    fn from(m: Matcher) -> Self {
        m.to_string()
    }
}

impl TryFrom<String> for Matcher {
    type Error = AlertError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// Whether an alert is firing or resolved at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertState {
    /// The alert is actively firing.
    Firing,
    /// The alert's end time has passed.
    Resolved,
}

impl AlertState {
    /// Returns the state as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Firing => "firing",
            Self::Resolved => "resolved",
        }
    }
}

impl fmt::Display for AlertState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A normalized alert.
///
/// Labels are the identity and never change after creation; everything else
/// is replaced by later updates for the same fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Identifying labels.
    pub labels: LabelSet,
    /// Descriptive, non-identifying annotations.
    pub annotations: BTreeMap<String, String>,
    /// When the alert started firing.
    pub starts_at: DateTime<Utc>,
    /// When the alert ends (or is expected to, if `timeout` is set).
    pub ends_at: DateTime<Utc>,
    /// When the alert was last received.
    pub updated_at: DateTime<Utc>,
    /// Link back to the system that produced the alert.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generator_url: Option<String>,
    /// Set when `ends_at` was assigned from the resolve timeout.
    #[serde(default)]
    pub timeout: bool,
}

impl Alert {
    /// Creates a firing alert starting at `now` with the given end time.
    #[must_use]
    pub fn new(labels: LabelSet, now: DateTime<Utc>, ends_at: DateTime<Utc>) -> Self {
        Self {
            labels,
            annotations: BTreeMap::new(),
            starts_at: now,
            ends_at,
            updated_at: now,
            generator_url: None,
            timeout: false,
        }
    }

    /// Returns the label-set fingerprint.
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(&self.labels)
    }

    /// Returns the `alertname` label, or an empty string.
    #[must_use]
    pub fn name(&self) -> &str {
        self.labels.get(ALERT_NAME_LABEL).map_or("", String::as_str)
    }

    /// Returns true if the alert has ended at `now`.
    #[must_use]
    pub fn resolved_at(&self, now: DateTime<Utc>) -> bool {
        self.ends_at <= now
    }

    /// Returns true if the alert has ended.
    #[must_use]
    pub fn resolved(&self) -> bool {
        self.resolved_at(Utc::now())
    }

    /// Returns the alert's state at `now`.
    #[must_use]
    pub fn state_at(&self, now: DateTime<Utc>) -> AlertState {
        if self.resolved_at(now) {
            AlertState::Resolved
        } else {
            AlertState::Firing
        }
    }
}

/// An alert as submitted by a caller, before normalization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawAlert {
    /// Identifying labels; empty values are stripped.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Annotations; empty values are stripped.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Optional start time.
    #[serde(default, alias = "startsAt", skip_serializing_if = "Option::is_none")]
    pub starts_at: Option<DateTime<Utc>>,
    /// Optional end time.
    #[serde(default, alias = "endsAt", skip_serializing_if = "Option::is_none")]
    pub ends_at: Option<DateTime<Utc>>,
    /// Optional source link.
    #[serde(default, alias = "generatorURL", skip_serializing_if = "Option::is_none")]
    pub generator_url: Option<String>,
}

impl RawAlert {
    /// Creates a raw alert with the given labels.
    #[must_use]
    pub fn new<K, V>(labels: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            labels: labels.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
            ..Self::default()
        }
    }

    /// Adds an annotation.
    #[must_use]
    pub fn annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Sets the start time.
    #[must_use]
    pub const fn starts_at(mut self, at: DateTime<Utc>) -> Self {
        self.starts_at = Some(at);
        self
    }

    /// Sets the end time.
    #[must_use]
    pub const fn ends_at(mut self, at: DateTime<Utc>) -> Self {
        self.ends_at = Some(at);
        self
    }
}

/// Builds a label set from pairs.
pub fn labels<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> LabelSet
where
    K: Into<String>,
    V: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;
    use test_case::test_case;

    mod fingerprint_tests {
        use super::*;

        #[test]
        fn fingerprint_is_order_independent() {
            let a = labels([("alertname", "Down"), ("instance", "host1")]);
            let b = labels([("instance", "host1"), ("alertname", "Down")]);
            assert_eq!(Fingerprint::of(&a), Fingerprint::of(&b));
        }

        #[test]
        fn fingerprint_distinguishes_values() {
            let a = labels([("alertname", "Down"), ("instance", "host1")]);
            let b = labels([("alertname", "Down"), ("instance", "host2")]);
            assert_ne!(Fingerprint::of(&a), Fingerprint::of(&b));
        }

        #[test]
        fn fingerprint_does_not_collide_on_concatenation() {
            let a = labels([("ab", "c")]);
            let b = labels([("a", "bc")]);
            assert_ne!(Fingerprint::of(&a), Fingerprint::of(&b));
        }

        #[test]
        fn fingerprint_serde_roundtrip() {
            let fp = Fingerprint::of(&labels([("alertname", "Down")]));
            let json = serde_json::to_string(&fp).expect("serialize");
            assert_eq!(json, format!("\"{fp}\""));
            let back: Fingerprint = serde_json::from_str(&json).expect("deserialize");
            assert_eq!(back, fp);
        }

        proptest! {
            #[test]
            fn fingerprint_is_stable(pairs in proptest::collection::btree_map("[a-z_]{1,8}", "[a-z0-9]{0,8}", 0..6)) {
                let first = Fingerprint::of(&pairs);
                let second = Fingerprint::of(&pairs.clone());
                prop_assert_eq!(first, second);
            }
        }
    }

    mod matcher_tests {
        use super::*;
        use test_case::test_case;

        #[test_case(r#"alertname="Down""#, MatchType::Equal, "Down" ; "equal")]
        #[test_case(r#"env!="prod""#, MatchType::NotEqual, "prod" ; "not equal")]
        #[test_case(r#"instance=~"host[0-9]+""#, MatchType::Regex, "host[0-9]+" ; "regex")]
        #[test_case(r#"team!~"db|infra""#, MatchType::NotRegex, "db|infra" ; "not regex")]
        #[test_case("severity=critical", MatchType::Equal, "critical" ; "unquoted")]
        #[test_case(r#"  job = "api"  "#, MatchType::Equal, "api" ; "surrounding whitespace")]
        #[test_case(r#"msg="say \"hi\"""#, MatchType::Equal, r#"say "hi""# ; "escaped quotes")]
        fn parse_matcher(input: &str, match_type: MatchType, value: &str) {
            let m: Matcher = input.parse().expect("should parse");
            assert_eq!(m.match_type(), match_type);
            assert_eq!(m.value(), value);
        }

        #[test_case("" ; "empty")]
        #[test_case("=\"x\"" ; "missing name")]
        #[test_case("1abc=\"x\"" ; "invalid name")]
        #[test_case("name=~\"(\"" ; "bad regex")]
        #[test_case("name" ; "missing operator")]
        fn parse_matcher_invalid(input: &str) {
            assert!(input.parse::<Matcher>().is_err(), "expected '{input}' to be invalid");
        }

        #[test]
        fn regex_is_anchored() {
            let m = Matcher::regex("instance", "host").expect("valid");
            assert!(m.matches(&labels([("instance", "host")])));
            assert!(!m.matches(&labels([("instance", "host1")])));
            assert!(!m.matches(&labels([("instance", "myhost")])));
        }

        #[test]
        fn missing_label_is_empty_value() {
            let ne = Matcher::new("severity", MatchType::NotEqual, "critical").expect("valid");
            assert!(ne.matches(&LabelSet::new()));

            let eq_empty = Matcher::equal("severity", "").expect("valid");
            assert!(eq_empty.matches(&LabelSet::new()));
        }

        #[test]
        fn display_roundtrip() {
            let m = Matcher::new("msg", MatchType::NotRegex, r#"a"b\.c"#).expect("valid");
            let text = m.to_string();
            let back: Matcher = text.parse().expect("reparse");
            assert_eq!(back, m);
        }

        #[test]
        fn serde_uses_string_form() {
            let m = Matcher::equal("alertname", "Down").expect("valid");
            let json = serde_json::to_string(&m).expect("serialize");
            assert_eq!(json, r#""alertname=\"Down\"""#);
            let back: Matcher = serde_json::from_str(&json).expect("deserialize");
            assert_eq!(back, m);
        }

        #[test]
        fn empty_matchers_match_everything() {
            assert!(matches_all(&[], &labels([("a", "b")])));
        }
    }

    mod alert_tests {
        use super::*;

        #[test]
        fn alert_resolved_at_end_time() {
            let now = Utc::now();
            let alert = Alert::new(labels([("alertname", "Down")]), now, now + Duration::minutes(5));
            assert!(!alert.resolved_at(now));
            assert!(alert.resolved_at(now + Duration::minutes(5)));
            assert_eq!(alert.state_at(now), AlertState::Firing);
            assert_eq!(alert.state_at(now + Duration::minutes(6)), AlertState::Resolved);
        }

        #[test]
        fn alert_name() {
            let now = Utc::now();
            let alert = Alert::new(labels([("alertname", "Down")]), now, now);
            assert_eq!(alert.name(), "Down");
        }

        #[test]
        fn raw_alert_accepts_camel_case_times() {
            let json = r#"{
                "labels": {"alertname": "Down"},
                "startsAt": "2026-01-01T00:00:00Z",
                "endsAt": "2026-01-01T01:00:00Z",
                "generatorURL": "http://prom/graph"
            }"#;
            let raw: RawAlert = serde_json::from_str(json).expect("deserialize");
            assert!(raw.starts_at.is_some());
            assert!(raw.ends_at.is_some());
            assert_eq!(raw.generator_url.as_deref(), Some("http://prom/graph"));
        }

        #[test]
        fn state_display() {
            assert_eq!(AlertState::Firing.to_string(), "firing");
            assert_eq!(AlertState::Resolved.to_string(), "resolved");
        }
    }
}
