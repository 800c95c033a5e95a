//! The notification pipeline.
//!
//! A flush of an aggregation group runs through:
//!
//! ```text
//! routing ─► silence ─► inhibit ─► fanout ─┬─► wait ─► dedup ─► retry ─► set-notifies   (integration 0)
//!                                          └─► wait ─► dedup ─► retry ─► set-notifies   (integration 1)
//! ```
//!
//! Every stage receives the alerts left by the previous one. A stage that
//! returns an empty set ends the chain. Integrations of a receiver run
//! concurrently and a failing integration never blocks its siblings.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::channels::{Integration, Notification};
use crate::config::NotifySettings;
use crate::error::{AlertError, Result, SendError};
use crate::inhibit::Inhibitor;
use crate::marker::Marker;
use crate::nflog::{self, DedupCheck, DeliveryOutcome, NflogKey, NotificationLog};
use crate::route::RouteTimings;
use crate::silence::SilenceStore;
use crate::types::{Alert, Fingerprint, LabelSet};

/// Per-flush state passed along the stages.
#[derive(Debug, Clone)]
pub struct NotifyContext {
    /// Receiver the group routes to.
    pub receiver: String,
    /// Aggregation group key.
    pub group_key: String,
    /// Labels the group is keyed on.
    pub group_labels: LabelSet,
    /// Timings of the group's route.
    pub timings: RouteTimings,
    /// Flush time.
    pub now: DateTime<Utc>,
    pending: Option<PendingEntry>,
    failure: Option<SendError>,
}

#[derive(Debug, Clone)]
struct PendingEntry {
    hash: String,
    firing: BTreeSet<Fingerprint>,
    resolved: BTreeSet<Fingerprint>,
}

impl NotifyContext {
    /// Creates a context for one flush.
    #[must_use]
    pub fn new(
        receiver: impl Into<String>,
        group_key: impl Into<String>,
        group_labels: LabelSet,
        timings: RouteTimings,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            receiver: receiver.into(),
            group_key: group_key.into(),
            group_labels,
            timings,
            now,
            pending: None,
            failure: None,
        }
    }
}

/// One step of the pipeline.
pub trait Stage: Send + Sync + fmt::Debug {
    /// Processes `alerts`, returning the ones to pass on.
    fn exec<'a>(&'a self, ctx: &'a mut NotifyContext, alerts: Vec<Alert>) -> BoxFuture<'a, Result<Vec<Alert>>>;
}

/// Runs stages in order, stopping once no alerts remain.
#[derive(Debug, Default)]
pub struct MultiStage {
    stages: Vec<Arc<dyn Stage>>,
}

impl MultiStage {
    /// Creates a chain of stages.
    #[must_use]
    pub fn new(stages: Vec<Arc<dyn Stage>>) -> Self {
        Self { stages }
    }
}

impl Stage for MultiStage {
    fn exec<'a>(&'a self, ctx: &'a mut NotifyContext, mut alerts: Vec<Alert>) -> BoxFuture<'a, Result<Vec<Alert>>> {
        Box::pin(async move {
            for stage in &self.stages {
                if alerts.is_empty() {
                    break;
                }
                alerts = stage.exec(ctx, alerts).await?;
            }
            Ok(alerts)
        })
    }
}

/// Runs one branch per integration concurrently.
///
/// Each branch gets its own copy of the context. Branch failures are logged
/// and do not fail the fanout.
#[derive(Debug, Default)]
pub struct FanoutStage {
    branches: Vec<Arc<dyn Stage>>,
}

impl FanoutStage {
    /// Creates a fanout over `branches`.
    #[must_use]
    pub fn new(branches: Vec<Arc<dyn Stage>>) -> Self {
        Self { branches }
    }
}

impl Stage for FanoutStage {
    fn exec<'a>(&'a self, ctx: &'a mut NotifyContext, alerts: Vec<Alert>) -> BoxFuture<'a, Result<Vec<Alert>>> {
        Box::pin(async move {
            let mut contexts = vec![ctx.clone(); self.branches.len()];
            let results = join_all(
                self.branches
                    .iter()
                    .zip(contexts.iter_mut())
                    .map(|(branch, branch_ctx)| branch.exec(branch_ctx, alerts.clone())),
            )
            .await;

            for result in results {
                if let Err(e) = result {
                    error!(receiver = %ctx.receiver, group_key = %ctx.group_key, error = %e, "notification failed");
                }
            }
            Ok(alerts)
        })
    }
}

/// Dispatches a flush to the pipeline of its receiver.
#[derive(Debug, Default)]
pub struct RoutingStage {
    receivers: HashMap<String, Arc<dyn Stage>>,
}

impl RoutingStage {
    /// Creates an empty routing stage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the pipeline for `receiver`.
    pub fn insert(&mut self, receiver: impl Into<String>, stage: Arc<dyn Stage>) {
        self.receivers.insert(receiver.into(), stage);
    }

    /// Returns true if `receiver` has a pipeline.
    #[must_use]
    pub fn contains(&self, receiver: &str) -> bool {
        self.receivers.contains_key(receiver)
    }
}

impl Stage for RoutingStage {
    fn exec<'a>(&'a self, ctx: &'a mut NotifyContext, alerts: Vec<Alert>) -> BoxFuture<'a, Result<Vec<Alert>>> {
        Box::pin(async move {
            let Some(stage) = self.receivers.get(&ctx.receiver) else {
                return Err(AlertError::config(format!("no pipeline for receiver '{}'", ctx.receiver)));
            };
            stage.exec(ctx, alerts).await
        })
    }
}

/// Drops alerts muted by an active silence and records the silence ids.
#[derive(Debug)]
pub struct SilenceStage {
    silences: Arc<SilenceStore>,
    marker: Arc<Marker>,
}

impl SilenceStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(silences: Arc<SilenceStore>, marker: Arc<Marker>) -> Self {
        Self { silences, marker }
    }
}

impl Stage for SilenceStage {
    fn exec<'a>(&'a self, ctx: &'a mut NotifyContext, alerts: Vec<Alert>) -> BoxFuture<'a, Result<Vec<Alert>>> {
        Box::pin(async move {
            let before = alerts.len();
            let kept: Vec<Alert> = alerts
                .into_iter()
                .filter(|alert| {
                    let ids = self.silences.query_active(&alert.labels, ctx.now);
                    let silenced = !ids.is_empty();
                    self.marker.set_silenced(alert.fingerprint(), ids);
                    !silenced
                })
                .collect();

            if kept.len() < before {
                debug!(group_key = %ctx.group_key, silenced = before - kept.len(), "silenced alerts");
            }
            Ok(kept)
        })
    }
}

/// Drops alerts inhibited by another firing alert and records the sources.
#[derive(Debug)]
pub struct InhibitStage {
    inhibitor: Inhibitor,
    marker: Arc<Marker>,
}

impl InhibitStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(inhibitor: Inhibitor, marker: Arc<Marker>) -> Self {
        Self { inhibitor, marker }
    }
}

impl Stage for InhibitStage {
    fn exec<'a>(&'a self, ctx: &'a mut NotifyContext, alerts: Vec<Alert>) -> BoxFuture<'a, Result<Vec<Alert>>> {
        Box::pin(async move {
            let sources = self.inhibitor.firing_sources(ctx.now);
            let before = alerts.len();
            let kept: Vec<Alert> = alerts
                .into_iter()
                .filter(|alert| {
                    let by = self.inhibitor.inhibited_by_sources(&alert.labels, &sources);
                    let inhibited = !by.is_empty();
                    self.marker.set_inhibited(alert.fingerprint(), by);
                    !inhibited
                })
                .collect();

            if kept.len() < before {
                debug!(group_key = %ctx.group_key, inhibited = before - kept.len(), "inhibited alerts");
            }
            Ok(kept)
        })
    }
}

/// Delays an integration's branch to stagger sends within a receiver.
#[derive(Debug, Clone, Copy)]
pub struct WaitStage {
    delay: Duration,
}

impl WaitStage {
    /// Creates a stage that waits `delay`.
    #[must_use]
    pub const fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Stage for WaitStage {
    fn exec<'a>(&'a self, _ctx: &'a mut NotifyContext, alerts: Vec<Alert>) -> BoxFuture<'a, Result<Vec<Alert>>> {
        Box::pin(async move {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(alerts)
        })
    }
}

/// Suppresses a notification the log says was already sent.
#[derive(Debug)]
pub struct DedupStage {
    nflog: Arc<NotificationLog>,
    integration: usize,
    send_resolved: bool,
}

impl DedupStage {
    /// Creates the stage for the integration at `integration` in its receiver.
    #[must_use]
    pub fn new(nflog: Arc<NotificationLog>, integration: usize, send_resolved: bool) -> Self {
        Self {
            nflog,
            integration,
            send_resolved,
        }
    }
}

impl Stage for DedupStage {
    fn exec<'a>(&'a self, ctx: &'a mut NotifyContext, alerts: Vec<Alert>) -> BoxFuture<'a, Result<Vec<Alert>>> {
        Box::pin(async move {
            let (firing, resolved) = nflog::partition(&alerts, ctx.now);
            let hash = nflog::content_hash(&firing, &resolved);
            let key = NflogKey::new(&ctx.group_key, &ctx.receiver, self.integration);
            let entry = self.nflog.get(&key);

            let send = nflog::needs_update(
                entry.as_ref(),
                &DedupCheck {
                    hash: &hash,
                    firing: &firing,
                    resolved: &resolved,
                    send_resolved: self.send_resolved,
                    repeat_interval: ctx.timings.repeat_interval,
                    now: ctx.now,
                },
            );
            if !send {
                debug!(key = %key, "notification already sent, skipping");
                return Ok(Vec::new());
            }

            ctx.pending = Some(PendingEntry { hash, firing, resolved });
            Ok(alerts)
        })
    }
}

/// Retry behaviour of the send stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Hard timeout of one attempt.
    pub send_timeout: Duration,
    /// Lower bound on the total retry window.
    pub min_timeout: Duration,
    /// First backoff delay.
    pub initial_backoff: Duration,
    /// Backoff cap.
    pub max_backoff: Duration,
    /// Attempt limit.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&NotifySettings::default())
    }
}

impl From<&NotifySettings> for RetryPolicy {
    fn from(settings: &NotifySettings) -> Self {
        Self {
            send_timeout: Duration::from_secs(settings.send_timeout_secs),
            min_timeout: Duration::from_secs(settings.min_retry_timeout_secs),
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
            max_attempts: settings.max_attempts,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }

    /// Total retry window for a route with `group_interval`.
    #[must_use]
    pub fn window(&self, group_interval: Duration) -> Duration {
        self.min_timeout.max(group_interval)
    }
}

/// Sends through an integration with bounded exponential backoff.
///
/// Resolved alerts are dropped first if the integration does not report
/// them. The outcome is left in the context for [`SetNotifiesStage`].
#[derive(Debug)]
pub struct RetryStage {
    integration: Arc<Integration>,
    policy: RetryPolicy,
}

impl RetryStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(integration: Arc<Integration>, policy: RetryPolicy) -> Self {
        Self { integration, policy }
    }

    async fn attempt(&self, notification: &Notification) -> std::result::Result<(), SendError> {
        let send = AssertUnwindSafe(self.integration.notify(notification)).catch_unwind();
        match tokio::time::timeout(self.policy.send_timeout, send).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SendError::permanent("sender panicked")),
            Err(_) => Err(SendError::retryable(format!(
                "timed out after {:?}",
                self.policy.send_timeout
            ))),
        }
    }

    async fn send(&self, notification: &Notification, window: Duration) -> std::result::Result<u32, SendError> {
        let deadline = Instant::now() + window;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.attempt(notification).await {
                Ok(()) => return Ok(attempt),
                Err(e) => e,
            };

            if !err.retryable {
                return Err(err);
            }
            let delay = self.policy.backoff(attempt);
            if attempt >= self.policy.max_attempts || Instant::now() + delay > deadline {
                return Err(err);
            }

            warn!(
                integration = %self.integration,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "notify attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

impl Stage for RetryStage {
    fn exec<'a>(&'a self, ctx: &'a mut NotifyContext, alerts: Vec<Alert>) -> BoxFuture<'a, Result<Vec<Alert>>> {
        Box::pin(async move {
            let to_send: Vec<Alert> = if self.integration.send_resolved() {
                alerts.clone()
            } else {
                alerts.iter().filter(|a| !a.resolved_at(ctx.now)).cloned().collect()
            };
            if to_send.is_empty() {
                debug!(integration = %self.integration, "only resolved alerts, nothing to send");
                return Ok(alerts);
            }

            let notification = Notification::new(
                &ctx.receiver,
                &ctx.group_key,
                ctx.group_labels.clone(),
                to_send,
                ctx.now,
            );
            match self.send(&notification, self.policy.window(ctx.timings.group_interval)).await {
                Ok(attempts) => {
                    info!(
                        integration = %self.integration,
                        group_key = %ctx.group_key,
                        alerts = notification.alerts.len(),
                        attempts,
                        "notification sent"
                    );
                }
                Err(e) => {
                    ctx.failure = Some(e);
                }
            }
            Ok(alerts)
        })
    }
}

/// Records the outcome of a send in the notification log.
///
/// A terminal failure is logged too, so an identical notification is not
/// retried before the repeat interval; the failure is then returned.
#[derive(Debug)]
pub struct SetNotifiesStage {
    nflog: Arc<NotificationLog>,
    integration: Arc<Integration>,
}

impl SetNotifiesStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(nflog: Arc<NotificationLog>, integration: Arc<Integration>) -> Self {
        Self { nflog, integration }
    }
}

impl Stage for SetNotifiesStage {
    fn exec<'a>(&'a self, ctx: &'a mut NotifyContext, alerts: Vec<Alert>) -> BoxFuture<'a, Result<Vec<Alert>>> {
        Box::pin(async move {
            let Some(pending) = ctx.pending.take() else {
                return Ok(alerts);
            };
            let failure = ctx.failure.take();
            let outcome = if failure.is_some() {
                DeliveryOutcome::Failed
            } else {
                DeliveryOutcome::Delivered
            };

            self.nflog.log(
                NflogKey::new(&ctx.group_key, &ctx.receiver, self.integration.index()),
                pending.hash,
                pending.firing,
                pending.resolved,
                outcome,
                Utc::now(),
            );

            match failure {
                Some(source) => Err(AlertError::Delivery {
                    integration: self.integration.to_string(),
                    source,
                }),
                None => Ok(alerts),
            }
        })
    }
}

/// Shared state the pipeline stages read and write.
#[derive(Debug, Clone)]
pub struct PipelineDeps {
    /// Silence store for the silence stage.
    pub silences: Arc<SilenceStore>,
    /// Inhibition evaluator for the inhibit stage.
    pub inhibitor: Inhibitor,
    /// Mute status record.
    pub marker: Arc<Marker>,
    /// Notification log.
    pub nflog: Arc<NotificationLog>,
    /// Retry behaviour.
    pub retry: RetryPolicy,
    /// Extra wait per integration index.
    pub wait_stagger: Duration,
}

/// Builds the routing stage for a set of receivers.
#[must_use]
pub fn build_pipeline(receivers: &HashMap<String, Vec<Arc<Integration>>>, deps: &PipelineDeps) -> RoutingStage {
    let mut routing = RoutingStage::new();
    for (name, integrations) in receivers {
        let branches: Vec<Arc<dyn Stage>> = integrations
            .iter()
            .map(|integration| {
                let index = integration.index() as u32;
                let stages: Vec<Arc<dyn Stage>> = vec![
                    Arc::new(WaitStage::new(deps.wait_stagger.saturating_mul(index))),
                    Arc::new(DedupStage::new(
                        Arc::clone(&deps.nflog),
                        integration.index(),
                        integration.send_resolved(),
                    )),
                    Arc::new(RetryStage::new(Arc::clone(integration), deps.retry)),
                    Arc::new(SetNotifiesStage::new(Arc::clone(&deps.nflog), Arc::clone(integration))),
                ];
                Arc::new(MultiStage::new(stages)) as Arc<dyn Stage>
            })
            .collect();

        let receiver: Vec<Arc<dyn Stage>> = vec![
            Arc::new(SilenceStage::new(Arc::clone(&deps.silences), Arc::clone(&deps.marker))),
            Arc::new(InhibitStage::new(deps.inhibitor.clone(), Arc::clone(&deps.marker))),
            Arc::new(FanoutStage::new(branches)),
        ];
        routing.insert(name.clone(), Arc::new(MultiStage::new(receiver)));
    }
    routing
}
