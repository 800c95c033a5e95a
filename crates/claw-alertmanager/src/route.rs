//! The routing tree.
//!
//! A [`RouteConfig`] tree from the configuration document is compiled into a
//! [`Route`] tree in which every node carries its fully inherited receiver,
//! grouping and timing options. [`Route::match_labels`] walks the tree
//! depth-first with an explicit stack and returns the matching leaves.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AlertError, Result};
use crate::types::{LabelSet, Matcher, matches_all};

/// Default delay before a new group's first notification.
pub const DEFAULT_GROUP_WAIT: Duration = Duration::from_secs(30);

/// Default minimum spacing between notifications for a group.
pub const DEFAULT_GROUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Default interval before an unchanged notification is resent.
pub const DEFAULT_REPEAT_INTERVAL: Duration = Duration::from_secs(4 * 60 * 60);

/// `group_by` entry meaning "group by every label".
pub const GROUP_BY_ALL: &str = "...";

/// A route as written in the configuration document.
///
/// Unset fields are inherited from the parent route.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Receiver for alerts matching this route.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<String>,
    /// Labels to group by.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_by: Option<Vec<String>>,
    /// Matchers that must all match.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matchers: Vec<Matcher>,
    /// Keep evaluating siblings after this route matches.
    #[serde(default, rename = "continue")]
    pub continue_matching: bool,
    /// Delay before the first notification of a new group.
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub group_wait: Option<Duration>,
    /// Minimum spacing between notifications of one group.
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub group_interval: Option<Duration>,
    /// Interval before an unchanged notification is resent.
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub repeat_interval: Option<Duration>,
    /// Child routes, evaluated in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<RouteConfig>,
}

impl RouteConfig {
    /// Creates a route sending to `receiver`.
    #[must_use]
    pub fn new(receiver: impl Into<String>) -> Self {
        Self {
            receiver: Some(receiver.into()),
            ..Self::default()
        }
    }

    /// Adds a matcher.
    #[must_use]
    pub fn with_matcher(mut self, matcher: Matcher) -> Self {
        self.matchers.push(matcher);
        self
    }

    /// Sets the `group_by` labels.
    #[must_use]
    pub fn with_group_by<S: Into<String>>(mut self, labels: impl IntoIterator<Item = S>) -> Self {
        self.group_by = Some(labels.into_iter().map(Into::into).collect());
        self
    }

    /// Sets all three timings.
    #[must_use]
    pub const fn with_timings(mut self, wait: Duration, interval: Duration, repeat: Duration) -> Self {
        self.group_wait = Some(wait);
        self.group_interval = Some(interval);
        self.repeat_interval = Some(repeat);
        self
    }

    /// Sets the `continue` flag.
    #[must_use]
    pub const fn with_continue(mut self, continue_matching: bool) -> Self {
        self.continue_matching = continue_matching;
        self
    }

    /// Adds a child route.
    #[must_use]
    pub fn with_route(mut self, child: Self) -> Self {
        self.routes.push(child);
        self
    }
}

/// How a route partitions alerts into groups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupBy {
    /// One group per distinct label set.
    All,
    /// One group per distinct value combination of these labels.
    Labels(BTreeSet<String>),
}

impl GroupBy {
    fn from_config(labels: &[String]) -> Result<Self> {
        if labels.iter().any(|l| l == GROUP_BY_ALL) {
            if labels.len() > 1 {
                return Err(AlertError::config(format!(
                    "group_by '{GROUP_BY_ALL}' cannot be combined with other labels"
                )));
            }
            return Ok(Self::All);
        }
        if let Some(bad) = labels.iter().find(|l| !crate::types::is_valid_label_name(l)) {
            return Err(AlertError::config(format!("invalid group_by label '{bad}'")));
        }
        Ok(Self::Labels(labels.iter().cloned().collect()))
    }
}

/// Timing options of a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteTimings {
    /// Delay before the first notification.
    pub group_wait: Duration,
    /// Minimum spacing between notifications.
    pub group_interval: Duration,
    /// Resend interval for unchanged content.
    pub repeat_interval: Duration,
}

impl Default for RouteTimings {
    fn default() -> Self {
        Self {
            group_wait: DEFAULT_GROUP_WAIT,
            group_interval: DEFAULT_GROUP_INTERVAL,
            repeat_interval: DEFAULT_REPEAT_INTERVAL,
        }
    }
}

/// A compiled route node.
#[derive(Debug, Clone)]
pub struct Route {
    key: String,
    receiver: String,
    group_by: GroupBy,
    matchers: Vec<Matcher>,
    continue_matching: bool,
    timings: RouteTimings,
    routes: Vec<Route>,
}

struct Frame<'a> {
    route: &'a Route,
    next_child: usize,
    child_matched: bool,
}

impl Route {
    /// Compiles the root of a routing tree.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::InvalidConfig` if the root has matchers or no
    /// receiver, or any node has an invalid `group_by` or zero interval.
    pub fn build(root: &RouteConfig) -> Result<Self> {
        if !root.matchers.is_empty() {
            return Err(AlertError::config("root route must not have matchers"));
        }
        if root.continue_matching {
            return Err(AlertError::config("root route must not set continue"));
        }
        let Some(receiver) = root.receiver.clone() else {
            return Err(AlertError::config("root route must have a receiver"));
        };

        let parent = Self {
            key: String::new(),
            receiver,
            group_by: GroupBy::Labels(BTreeSet::new()),
            matchers: Vec::new(),
            continue_matching: false,
            timings: RouteTimings::default(),
            routes: Vec::new(),
        };
        Self::compile(root, &parent, "{}".to_string())
    }

    // Recursion depth equals config nesting, which the JSON parser already
    // bounds; matching never recurses.
    fn compile(config: &RouteConfig, parent: &Self, key: String) -> Result<Self> {
        let group_by = match &config.group_by {
            Some(labels) => GroupBy::from_config(labels)?,
            None => parent.group_by.clone(),
        };

        let timings = RouteTimings {
            group_wait: config.group_wait.unwrap_or(parent.timings.group_wait),
            group_interval: config.group_interval.unwrap_or(parent.timings.group_interval),
            repeat_interval: config.repeat_interval.unwrap_or(parent.timings.repeat_interval),
        };
        if timings.group_interval.is_zero() {
            return Err(AlertError::config(format!("route {key}: group_interval cannot be zero")));
        }
        if timings.repeat_interval.is_zero() {
            return Err(AlertError::config(format!("route {key}: repeat_interval cannot be zero")));
        }

        let mut route = Self {
            receiver: config.receiver.clone().unwrap_or_else(|| parent.receiver.clone()),
            group_by,
            matchers: config.matchers.clone(),
            continue_matching: config.continue_matching,
            timings,
            routes: Vec::with_capacity(config.routes.len()),
            key,
        };

        for (index, child) in config.routes.iter().enumerate() {
            let matchers: Vec<String> = child.matchers.iter().map(ToString::to_string).collect();
            let child_key = format!("{}/{{{}}}/{index}", route.key, matchers.join(","));
            let compiled = Self::compile(child, &route, child_key)?;
            route.routes.push(compiled);
        }

        Ok(route)
    }

    /// Returns the route's stable identity within its tree.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the receiver name.
    #[must_use]
    pub fn receiver(&self) -> &str {
        &self.receiver
    }

    /// Returns the grouping mode.
    #[must_use]
    pub const fn group_by(&self) -> &GroupBy {
        &self.group_by
    }

    /// Returns the timing options.
    #[must_use]
    pub const fn timings(&self) -> RouteTimings {
        self.timings
    }

    /// Returns the `continue` flag.
    #[must_use]
    pub const fn continue_matching(&self) -> bool {
        self.continue_matching
    }

    /// Returns the child routes.
    #[must_use]
    pub fn routes(&self) -> &[Self] {
        &self.routes
    }

    fn matches(&self, labels: &LabelSet) -> bool {
        matches_all(&self.matchers, labels)
    }

    /// Returns the routes that handle an alert with `labels`, in tree order.
    ///
    /// A matching node hands the alert to its matching children; it is
    /// itself a result only if none of them match. After a child matches,
    /// its later siblings are skipped unless that child sets `continue`.
    #[must_use]
    pub fn match_labels(&self, labels: &LabelSet) -> Vec<&Self> {
        let mut results = Vec::new();
        let mut stack = vec![Frame {
            route: self,
            next_child: 0,
            child_matched: false,
        }];

        while let Some(top) = stack.last_mut() {
            let route = top.route;
            if let Some(child) = route.routes.get(top.next_child) {
                top.next_child += 1;
                if child.matches(labels) {
                    top.child_matched = true;
                    if !child.continue_matching {
                        top.next_child = route.routes.len();
                    }
                    stack.push(Frame {
                        route: child,
                        next_child: 0,
                        child_matched: false,
                    });
                }
            } else if let Some(done) = stack.pop() {
                if !done.child_matched {
                    results.push(done.route);
                }
            }
        }

        results
    }

    /// Returns the subset of `labels` this route groups by.
    #[must_use]
    pub fn group_labels(&self, labels: &LabelSet) -> LabelSet {
        match &self.group_by {
            GroupBy::All => labels.clone(),
            GroupBy::Labels(names) => labels
                .iter()
                .filter(|(k, _)| names.contains(*k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Returns the aggregation group key for `group_labels` on this route.
    #[must_use]
    pub fn group_key(&self, group_labels: &LabelSet) -> String {
        format!("{}:{}", self.key, format_labels(group_labels))
    }

    /// Visits every node of the tree, depth-first.
    pub fn walk(&self) -> impl Iterator<Item = &Self> {
        let mut stack = vec![self];
        std::iter::from_fn(move || {
            let route = stack.pop()?;
            stack.extend(route.routes.iter().rev());
            Some(route)
        })
    }
}

/// Renders a label set as `{a="1", b="2"}`.
#[must_use]
pub fn format_labels(labels: &LabelSet) -> String {
    let mut out = String::from("{");
    for (i, (k, v)) in labels.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "{k}={v:?}");
    }
    out.push('}');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::labels;
    use proptest::prelude::*;

    fn eq(name: &str, value: &str) -> Matcher {
        Matcher::equal(name, value).expect("valid matcher")
    }

    fn receivers(routes: &[&Route]) -> Vec<String> {
        routes.iter().map(|r| r.receiver().to_string()).collect()
    }

    fn sample_tree() -> Route {
        let config = RouteConfig::new("default")
            .with_group_by(["alertname"])
            .with_route(
                RouteConfig::new("database")
                    .with_matcher(eq("team", "db"))
                    .with_route(RouteConfig::new("db-pager").with_matcher(eq("severity", "critical"))),
            )
            .with_route(
                RouteConfig::new("frontend")
                    .with_matcher(eq("team", "frontend"))
                    .with_continue(true),
            )
            .with_route(RouteConfig::new("web").with_matcher(Matcher::regex("service", "web.*").expect("valid")))
            .with_route(RouteConfig::new("unreachable").with_matcher(Matcher::regex("service", ".+").expect("valid")));
        Route::build(&config).expect("valid tree")
    }

    mod build_tests {
        use super::*;

        #[test]
        fn root_requires_receiver() {
            assert!(Route::build(&RouteConfig::default()).is_err());
        }

        #[test]
        fn root_rejects_matchers() {
            let config = RouteConfig::new("default").with_matcher(eq("a", "b"));
            assert!(Route::build(&config).is_err());
        }

        #[test]
        fn group_by_all_must_be_alone() {
            let config = RouteConfig::new("default").with_group_by(["...", "alertname"]);
            assert!(Route::build(&config).is_err());
        }

        #[test]
        fn zero_group_interval_rejected() {
            let mut config = RouteConfig::new("default");
            config.group_interval = Some(Duration::ZERO);
            assert!(Route::build(&config).is_err());
        }

        #[test]
        fn children_inherit_from_parent() {
            let config = RouteConfig::new("default")
                .with_group_by(["cluster"])
                .with_timings(Duration::from_secs(10), Duration::from_secs(60), Duration::from_secs(600))
                .with_route(RouteConfig::default().with_matcher(eq("team", "db")));
            let root = Route::build(&config).expect("valid");
            let child = &root.routes()[0];

            assert_eq!(child.receiver(), "default");
            assert_eq!(child.group_by(), root.group_by());
            assert_eq!(child.timings(), root.timings());
        }

        #[test]
        fn root_gets_default_timings() {
            let root = Route::build(&RouteConfig::new("default")).expect("valid");
            assert_eq!(root.timings(), RouteTimings::default());
        }

        #[test]
        fn keys_are_unique() {
            let tree = sample_tree();
            let keys: BTreeSet<&str> = tree.walk().map(Route::key).collect();
            assert_eq!(keys.len(), tree.walk().count());
        }

        #[test]
        fn deserializes_humantime_durations() {
            let json = r#"{
                "receiver": "default",
                "group_by": ["alertname"],
                "group_wait": "10s",
                "repeat_interval": "1h",
                "routes": [{"matchers": ["team=\"db\""], "receiver": "db", "continue": true}]
            }"#;
            let config: RouteConfig = serde_json::from_str(json).expect("deserialize");
            assert_eq!(config.group_wait, Some(Duration::from_secs(10)));
            assert_eq!(config.repeat_interval, Some(Duration::from_secs(3600)));
            assert!(config.routes[0].continue_matching);
        }
    }

    mod match_tests {
        use super::*;

        #[test]
        fn unmatched_alert_goes_to_root() {
            let tree = sample_tree();
            let matched = tree.match_labels(&labels([("alertname", "X")]));
            assert_eq!(receivers(&matched), vec!["default"]);
        }

        #[test]
        fn nested_match_returns_deepest() {
            let tree = sample_tree();
            let matched = tree.match_labels(&labels([("team", "db"), ("severity", "critical")]));
            assert_eq!(receivers(&matched), vec!["db-pager"]);
        }

        #[test]
        fn parent_used_when_no_child_matches() {
            let tree = sample_tree();
            let matched = tree.match_labels(&labels([("team", "db"), ("severity", "info")]));
            assert_eq!(receivers(&matched), vec!["database"]);
        }

        #[test]
        fn first_match_stops_siblings() {
            let tree = sample_tree();
            let matched = tree.match_labels(&labels([("team", "db"), ("service", "web1")]));
            assert_eq!(receivers(&matched), vec!["database"]);
        }

        #[test]
        fn continue_evaluates_later_siblings() {
            let tree = sample_tree();
            let matched = tree.match_labels(&labels([("team", "frontend"), ("service", "web1")]));
            assert_eq!(receivers(&matched), vec!["frontend", "web"]);
        }

        #[test]
        fn continue_without_later_match_returns_only_continued() {
            let tree = sample_tree();
            let matched = tree.match_labels(&labels([("team", "frontend")]));
            assert_eq!(receivers(&matched), vec!["frontend"]);
        }

        #[test]
        fn group_labels_and_key() {
            let tree = sample_tree();
            let alert = labels([("alertname", "Down"), ("instance", "host1")]);
            let route = tree.match_labels(&alert)[0];

            let group = route.group_labels(&alert);
            assert_eq!(group, labels([("alertname", "Down")]));
            assert_eq!(route.group_key(&group), r#"{}:{alertname="Down"}"#);
        }

        #[test]
        fn group_by_all_uses_every_label() {
            let config = RouteConfig::new("default").with_group_by(["..."]);
            let tree = Route::build(&config).expect("valid");
            let alert = labels([("alertname", "Down"), ("instance", "host1")]);
            assert_eq!(tree.group_labels(&alert), alert);
        }

        #[test]
        fn deep_tree_does_not_overflow() {
            let mut config = RouteConfig::new("leaf").with_matcher(eq("a", "b"));
            for depth in 0..200 {
                config = RouteConfig::new(format!("level{depth}"))
                    .with_matcher(eq("a", "b"))
                    .with_route(config);
            }
            let root = Route::build(&RouteConfig::new("root").with_route(config)).expect("valid");
            let matched = root.match_labels(&labels([("a", "b")]));
            assert_eq!(receivers(&matched), vec!["leaf"]);
        }

        proptest! {
            #[test]
            fn matching_is_deterministic(
                team in prop::sample::select(vec!["db", "frontend", "other"]),
                service in prop::sample::select(vec!["web1", "api", ""]),
                severity in prop::sample::select(vec!["critical", "info"]),
            ) {
                let tree = sample_tree();
                let alert = labels([("team", team), ("service", service), ("severity", severity), ("alertname", "A")]);

                let first: Vec<(String, String)> = tree
                    .match_labels(&alert)
                    .iter()
                    .map(|r| (r.receiver().to_string(), r.group_key(&r.group_labels(&alert))))
                    .collect();
                let second: Vec<(String, String)> = tree
                    .match_labels(&alert)
                    .iter()
                    .map(|r| (r.receiver().to_string(), r.group_key(&r.group_labels(&alert))))
                    .collect();

                prop_assert!(!first.is_empty());
                prop_assert_eq!(first, second);
            }
        }
    }
}
