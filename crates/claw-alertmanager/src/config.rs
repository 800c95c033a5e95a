//! Configuration.
//!
//! Two layers of configuration drive the engine:
//! - [`EngineSettings`]: process-level settings (state directory, timeouts,
//!   retention, retry policy) loaded from TOML at startup
//! - [`ConfigDocument`]: the routing tree, receivers, inhibition rules and
//!   templates, loaded as JSON from a config source and hot-reloaded

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AlertError, Result};
use crate::inhibit::InhibitRule;
use crate::route::{Route, RouteConfig};
use crate::template::TemplateSet;

/// Alert lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AlertSettings {
    /// How long an alert without `ends_at` stays firing without updates.
    pub resolve_timeout_secs: u64,
    /// How long resolved alerts are kept before removal.
    pub retention_secs: u64,
    /// How often resolved alerts are garbage collected.
    pub gc_interval_secs: u64,
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            resolve_timeout_secs: 300,
            retention_secs: 120 * 3600,
            gc_interval_secs: 30 * 60,
        }
    }
}

/// Delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NotifySettings {
    /// Hard timeout of a single send attempt.
    pub send_timeout_secs: u64,
    /// Lower bound on the total time spent retrying one notification.
    pub min_retry_timeout_secs: u64,
    /// First retry delay.
    pub initial_backoff_ms: u64,
    /// Cap on the retry delay.
    pub max_backoff_ms: u64,
    /// Maximum attempts per notification.
    pub max_attempts: u32,
    /// Extra delay per integration index within a receiver.
    pub wait_stagger_ms: u64,
}

impl Default for NotifySettings {
    fn default() -> Self {
        Self {
            send_timeout_secs: 10,
            min_retry_timeout_secs: 10,
            initial_backoff_ms: 200,
            max_backoff_ms: 10_000,
            max_attempts: 10,
            wait_stagger_ms: 0,
        }
    }
}

/// Aggregation group maintenance settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DispatchSettings {
    /// How often empty aggregation groups are checked for removal.
    pub maintenance_interval_ms: u64,
    /// How long a group may stay empty before it is removed.
    pub empty_group_retention_secs: u64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            maintenance_interval_ms: 30_000,
            empty_group_retention_secs: 5 * 60,
        }
    }
}

/// Snapshot settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PersistenceSettings {
    /// How often silences and the notification log are snapshotted.
    pub snapshot_interval_secs: u64,
    /// Retention of notification log entries and expired silences.
    pub retention_secs: u64,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            snapshot_interval_secs: 15 * 60,
            retention_secs: 120 * 3600,
        }
    }
}

/// Configuration reload settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReloadSettings {
    /// How often the config source is polled; 0 disables polling.
    pub poll_interval_secs: u64,
}

impl Default for ReloadSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
        }
    }
}

/// Process-level engine settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineSettings {
    /// Directory for snapshots and persisted templates.
    pub data_dir: PathBuf,
    /// JSON configuration document; the built-in default is used if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_file: Option<PathBuf>,
    /// Alert lifecycle.
    #[serde(default)]
    pub alerts: AlertSettings,
    /// Delivery.
    #[serde(default)]
    pub notify: NotifySettings,
    /// Group maintenance.
    #[serde(default)]
    pub dispatch: DispatchSettings,
    /// Snapshots.
    #[serde(default)]
    pub persistence: PersistenceSettings,
    /// Reloading.
    #[serde(default)]
    pub reload: ReloadSettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            config_file: None,
            alerts: AlertSettings::default(),
            notify: NotifySettings::default(),
            dispatch: DispatchSettings::default(),
            persistence: PersistenceSettings::default(),
            reload: ReloadSettings::default(),
        }
    }
}

impl EngineSettings {
    /// Creates default settings rooted at `data_dir`.
    #[must_use]
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Loads settings from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            AlertError::config(format!(
                "failed to read settings file '{}': {e}",
                path.as_ref().display()
            ))
        })?;

        Self::from_toml(&content)
    }

    /// Parses settings from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self> {
        let settings: Self =
            toml::from_str(content).map_err(|e| AlertError::config(format!("invalid TOML: {e}")))?;

        settings.validate()?;
        Ok(settings)
    }

    /// Renders the settings as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| AlertError::SerializationError(e.to_string()))
    }

    /// Validates the settings.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::InvalidConfig` naming the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(AlertError::config("data_dir cannot be empty"));
        }

        let positive = [
            ("alerts.resolve_timeout_secs", self.alerts.resolve_timeout_secs),
            ("alerts.retention_secs", self.alerts.retention_secs),
            ("alerts.gc_interval_secs", self.alerts.gc_interval_secs),
            ("notify.send_timeout_secs", self.notify.send_timeout_secs),
            ("notify.initial_backoff_ms", self.notify.initial_backoff_ms),
            ("dispatch.maintenance_interval_ms", self.dispatch.maintenance_interval_ms),
            ("persistence.snapshot_interval_secs", self.persistence.snapshot_interval_secs),
            ("persistence.retention_secs", self.persistence.retention_secs),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(AlertError::config(format!("{name} must be greater than 0")));
        }

        if self.notify.max_attempts == 0 {
            return Err(AlertError::config("notify.max_attempts must be greater than 0"));
        }
        if self.notify.max_backoff_ms < self.notify.initial_backoff_ms {
            return Err(AlertError::config(
                "notify.max_backoff_ms must not be less than notify.initial_backoff_ms",
            ));
        }

        Ok(())
    }

    /// Resolve timeout for alerts without an end time.
    #[must_use]
    pub const fn resolve_timeout(&self) -> Duration {
        Duration::from_secs(self.alerts.resolve_timeout_secs)
    }

    /// Retention of resolved alerts.
    #[must_use]
    pub const fn alert_retention(&self) -> Duration {
        Duration::from_secs(self.alerts.retention_secs)
    }

    /// Interval of the alert GC loop.
    #[must_use]
    pub const fn alert_gc_interval(&self) -> Duration {
        Duration::from_secs(self.alerts.gc_interval_secs)
    }

    /// Retention of notification log entries and expired silences.
    #[must_use]
    pub const fn state_retention(&self) -> Duration {
        Duration::from_secs(self.persistence.retention_secs)
    }

    /// Interval between snapshots.
    #[must_use]
    pub const fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.persistence.snapshot_interval_secs)
    }

    /// Config poll interval, or `None` if polling is disabled.
    #[must_use]
    pub const fn poll_interval(&self) -> Option<Duration> {
        if self.reload.poll_interval_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.reload.poll_interval_secs))
        }
    }

    /// Directory where templates are persisted on reload.
    #[must_use]
    pub fn templates_dir(&self) -> PathBuf {
        self.data_dir.join("templates")
    }
}

/// One integration inside a receiver.
///
/// `type` selects the builder; every other key is passed to it as settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationConfig {
    /// Integration type, e.g. `webhook` or `email`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Whether to report resolved alerts; the type's default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_resolved: Option<bool>,
    /// Type-specific settings.
    #[serde(flatten)]
    pub settings: serde_json::Map<String, serde_json::Value>,
}

impl IntegrationConfig {
    /// Creates an integration config of the given type.
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            send_resolved: None,
            settings: serde_json::Map::new(),
        }
    }

    /// Adds a setting.
    #[must_use]
    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }

    /// Sets `send_resolved`.
    #[must_use]
    pub const fn with_send_resolved(mut self, send_resolved: bool) -> Self {
        self.send_resolved = Some(send_resolved);
        self
    }
}

/// A named receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiverConfig {
    /// Receiver name referenced by routes.
    pub name: String,
    /// Integrations, notified concurrently.
    #[serde(default)]
    pub integrations: Vec<IntegrationConfig>,
}

impl ReceiverConfig {
    /// Creates a receiver.
    #[must_use]
    pub fn new(name: impl Into<String>, integrations: Vec<IntegrationConfig>) -> Self {
        Self {
            name: name.into(),
            integrations,
        }
    }
}

/// The hot-reloadable configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigDocument {
    /// Root of the routing tree.
    pub route: RouteConfig,
    /// Receivers.
    #[serde(default)]
    pub receivers: Vec<ReceiverConfig>,
    /// Inhibition rules.
    #[serde(default)]
    pub inhibit_rules: Vec<InhibitRule>,
    /// Named message templates.
    #[serde(default)]
    pub templates: BTreeMap<String, String>,
}

impl Default for ConfigDocument {
    fn default() -> Self {
        Self {
            route: RouteConfig::new("default").with_group_by(["alertname"]),
            receivers: vec![ReceiverConfig::new("default", vec![IntegrationConfig::new("log")])],
            inhibit_rules: Vec::new(),
            templates: BTreeMap::new(),
        }
    }
}

impl ConfigDocument {
    /// Parses a document from JSON.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::InvalidConfig` if the JSON does not describe a
    /// configuration document.
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| AlertError::config(format!("invalid configuration document: {e}")))
    }

    /// Loads a document from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            AlertError::config(format!(
                "failed to read configuration '{}': {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_json(&content)
    }

    /// Serializes the document as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Checks structural consistency: unique receiver names, every route's
    /// receiver defined, a valid routing tree and valid templates.
    ///
    /// Integration settings are checked when integrations are built.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<()> {
        let mut names = BTreeSet::new();
        for receiver in &self.receivers {
            if receiver.name.is_empty() {
                return Err(AlertError::config("receiver name cannot be empty"));
            }
            if !names.insert(receiver.name.as_str()) {
                return Err(AlertError::config(format!(
                    "duplicate receiver '{}'",
                    receiver.name
                )));
            }
        }

        let tree = Route::build(&self.route)?;
        if let Some(route) = tree.walk().find(|r| !names.contains(r.receiver())) {
            return Err(AlertError::config(format!(
                "route {} references undefined receiver '{}'",
                route.key(),
                route.receiver()
            )));
        }

        for rule in &self.inhibit_rules {
            if rule.target_matchers.is_empty() {
                return Err(AlertError::config("inhibit rule requires target_matchers"));
            }
        }

        TemplateSet::new(self.templates.clone())?;
        Ok(())
    }

    /// Returns a stable hash of the whole document.
    ///
    /// Object keys serialize in sorted order, so equal documents hash
    /// equally regardless of the key order they were written in.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn fingerprint(&self) -> Result<String> {
        let canonical = serde_json::to_vec(self)?;
        Ok(blake3::hash(&canonical).to_hex().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("failed to create temp file");
        file.write_all(content.as_bytes())
            .expect("failed to write temp file");
        file
    }

    mod settings_tests {
        use super::*;

        #[test]
        fn test_parse_minimal_settings() {
            let settings = EngineSettings::from_toml(r#"data_dir = "/var/lib/claw-alertmanager""#)
                .expect("should parse");

            assert_eq!(settings.data_dir, PathBuf::from("/var/lib/claw-alertmanager"));
            assert_eq!(settings.resolve_timeout(), Duration::from_secs(300));
            assert_eq!(settings.notify.max_attempts, 10);
            assert_eq!(settings.poll_interval(), Some(Duration::from_secs(60)));
        }

        #[test]
        fn test_parse_full_settings() {
            let toml = r#"
                data_dir = "/tmp/am"
                config_file = "/etc/claw/alertmanager.json"

                [alerts]
                resolve_timeout_secs = 60

                [notify]
                max_attempts = 3
                initial_backoff_ms = 50

                [reload]
                poll_interval_secs = 0
            "#;
            let settings = EngineSettings::from_toml(toml).expect("should parse");

            assert_eq!(settings.alerts.resolve_timeout_secs, 60);
            assert_eq!(settings.alerts.retention_secs, 120 * 3600);
            assert_eq!(settings.notify.max_attempts, 3);
            assert_eq!(settings.poll_interval(), None);
            assert!(settings.config_file.is_some());
        }

        #[test]
        fn test_load_from_file() {
            let file = create_temp_file(r#"data_dir = "state""#);
            let settings = EngineSettings::from_file(file.path()).expect("should load");
            assert_eq!(settings.templates_dir(), PathBuf::from("state/templates"));
        }

        #[test]
        fn test_file_not_found() {
            assert!(EngineSettings::from_file("/nonexistent/settings.toml").is_err());
        }

        #[test]
        fn test_zero_resolve_timeout_rejected() {
            let toml = "data_dir = \"d\"\n[alerts]\nresolve_timeout_secs = 0\n";
            let err = EngineSettings::from_toml(toml).expect_err("invalid");
            assert!(err.to_string().contains("alerts.resolve_timeout_secs"));
        }

        #[test]
        fn test_backoff_bounds_rejected() {
            let toml = "data_dir = \"d\"\n[notify]\ninitial_backoff_ms = 500\nmax_backoff_ms = 100\n";
            assert!(EngineSettings::from_toml(toml).is_err());
        }

        #[test]
        fn test_invalid_toml_rejected() {
            assert!(EngineSettings::from_toml("data_dir = ").is_err());
        }

        #[test]
        fn test_toml_roundtrip() {
            let settings = EngineSettings::with_data_dir("/tmp/am");
            let rendered = settings.to_toml().expect("render");
            let parsed = EngineSettings::from_toml(&rendered).expect("parse");
            assert_eq!(parsed, settings);
        }
    }

    mod document_tests {
        use super::*;

        const DOC: &str = r#"{
            "route": {
                "receiver": "default",
                "group_by": ["alertname"],
                "group_wait": "30s",
                "routes": [
                    {"matchers": ["team=\"db\""], "receiver": "db"}
                ]
            },
            "receivers": [
                {"name": "default", "integrations": [{"type": "log"}]},
                {"name": "db", "integrations": [
                    {"type": "webhook", "url": "http://hooks.local/db", "send_resolved": false}
                ]}
            ],
            "inhibit_rules": [
                {"source_matchers": ["severity=\"critical\""], "target_matchers": ["severity=\"warning\""], "equal": ["cluster"]}
            ],
            "templates": {"title": "[{{ status }}] {{ receiver }}"}
        }"#;

        #[test]
        fn test_parse_and_validate() {
            let doc = ConfigDocument::from_json(DOC).expect("parse");
            doc.validate().expect("valid");

            let webhook = &doc.receivers[1].integrations[0];
            assert_eq!(webhook.kind, "webhook");
            assert_eq!(webhook.send_resolved, Some(false));
            assert_eq!(webhook.settings.get("url"), Some(&serde_json::json!("http://hooks.local/db")));
        }

        #[test]
        fn test_default_document_is_valid() {
            ConfigDocument::default().validate().expect("valid");
        }

        #[test]
        fn test_undefined_receiver_rejected() {
            let mut doc = ConfigDocument::from_json(DOC).expect("parse");
            doc.receivers.retain(|r| r.name != "db");
            let err = doc.validate().expect_err("invalid");
            assert!(err.to_string().contains("undefined receiver 'db'"));
        }

        #[test]
        fn test_duplicate_receiver_rejected() {
            let mut doc = ConfigDocument::default();
            doc.receivers.push(ReceiverConfig::new("default", vec![]));
            assert!(doc.validate().is_err());
        }

        #[test]
        fn test_bad_template_rejected() {
            let mut doc = ConfigDocument::default();
            doc.templates.insert("t".into(), "{{ nope }}".into());
            assert!(matches!(doc.validate(), Err(AlertError::Template { .. })));
        }

        #[test]
        fn test_fingerprint_ignores_key_order() {
            let a = ConfigDocument::from_json(
                r#"{"route": {"receiver": "r"}, "receivers": [{"name": "r", "integrations": [{"type": "webhook", "url": "http://a", "max_alerts": 5}]}]}"#,
            )
            .expect("parse");
            let b = ConfigDocument::from_json(
                r#"{"receivers": [{"integrations": [{"max_alerts": 5, "url": "http://a", "type": "webhook"}], "name": "r"}], "route": {"receiver": "r"}}"#,
            )
            .expect("parse");

            assert_eq!(a.fingerprint().expect("hash"), b.fingerprint().expect("hash"));
        }

        #[test]
        fn test_fingerprint_changes_with_templates() {
            let a = ConfigDocument::default();
            let mut b = ConfigDocument::default();
            b.templates.insert("t".into(), "x".into());
            assert_ne!(a.fingerprint().expect("hash"), b.fingerprint().expect("hash"));
        }

        #[test]
        fn test_json_roundtrip() {
            let doc = ConfigDocument::from_json(DOC).expect("parse");
            let back = ConfigDocument::from_json(&doc.to_json().expect("render")).expect("reparse");
            assert_eq!(back, doc);
        }
    }
}
