//! Alert notification routing and dispatch for Clawbernetes.
//!
//! `claw-alertmanager` takes firing and resolved alerts, groups and
//! deduplicates them, applies silences and inhibition rules, and delivers
//! notifications to receivers (webhooks, Slack, `PagerDuty`, email, logs or
//! custom integrations) with retries and at-most-once-per-interval
//! delivery.
//!
//! # Features
//!
//! - **Routing tree**: label matchers (`=`, `!=`, `=~`, `!~`) select
//!   receivers, with `continue` chains and inherited grouping and timings
//! - **Aggregation groups**: `group_wait`, `group_interval` and
//!   `repeat_interval` timers per `(route, group labels)`
//! - **Silences and inhibition**: mute alerts by matcher or by other firing
//!   alerts, with per-alert mute status
//! - **Notification log**: durable dedup state per group, receiver and
//!   integration
//! - **Hot reload**: configuration documents are compiled, validated and
//!   swapped without losing alert state
//!
//! # Example
//!
//! ```rust,no_run
//! use claw_alertmanager::{EngineSettings, NotificationEngine, RawAlert};
//!
//! # async fn run() -> claw_alertmanager::Result<()> {
//! let engine = NotificationEngine::new(EngineSettings::with_data_dir("/var/lib/claw-alertmanager"))?;
//! engine.start(None).await?;
//!
//! engine.put_alerts(vec![
//!     RawAlert::new([("alertname", "GpuOverheating"), ("node", "gpu-7")])
//!         .annotation("summary", "GPU temperature above 90C"),
//! ])?;
//!
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Matchers
//!
//! ```rust
//! use claw_alertmanager::{Matcher, types::labels};
//!
//! let matcher: Matcher = r#"severity=~"critical|page""#.parse().unwrap();
//! assert!(matcher.matches(&labels([("severity", "page")])));
//! assert!(!matcher.matches(&labels([("severity", "warning")])));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod channels;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod inhibit;
pub mod manager;
pub mod marker;
pub mod nflog;
pub mod normalize;
pub mod pipeline;
pub mod reload;
pub mod route;
pub mod silence;
pub mod store;
pub mod template;
pub mod types;

// Re-export main types at crate root
pub use channels::{Integration, IntegrationRegistry, Notification, Notifier, Sender};
pub use config::{ConfigDocument, EngineSettings, IntegrationConfig, ReceiverConfig};
pub use dispatch::{Dispatcher, GroupSnapshot};
pub use error::{AlertError, BatchRejection, Result, SendError, ValidationError};
pub use inhibit::InhibitRule;
pub use manager::NotificationEngine;
pub use marker::{AlertStatus, MuteState};
pub use reload::{ConfigReloader, ConfigSource, FileConfigSource};
pub use route::{Route, RouteConfig};
pub use silence::{NewSilence, Silence, SilenceFilter, SilenceState};
pub use types::{Alert, AlertState, Fingerprint, LabelSet, MatchType, Matcher, RawAlert};
