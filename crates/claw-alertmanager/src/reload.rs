//! Configuration sources and hot reload.
//!
//! A reload compiles the new document completely before touching the
//! running engine. Only when the routing tree, every integration and the
//! templates are known good is the dispatcher stopped, swapped and started
//! again. Alert, silence and notification log state is shared across the
//! swap; the new dispatcher re-reads the alert store, and the notification
//! log keeps it from repeating notifications already sent.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channels::{BuildContext, Integration, IntegrationRegistry};
use crate::config::{ConfigDocument, EngineSettings};
use crate::dispatch::{DispatchOptions, Dispatcher};
use crate::error::{AlertError, Result};
use crate::inhibit::Inhibitor;
use crate::marker::Marker;
use crate::nflog::NotificationLog;
use crate::pipeline::{PipelineDeps, RetryPolicy, build_pipeline};
use crate::route::Route;
use crate::silence::SilenceStore;
use crate::store::AlertStore;
use crate::template::TemplateSet;

/// Where configuration documents come from.
pub trait ConfigSource: Send + Sync + fmt::Debug {
    /// Loads the current document.
    fn load(&self) -> BoxFuture<'_, Result<ConfigDocument>>;

    /// Persists a document.
    fn save<'a>(&'a self, document: &'a ConfigDocument) -> BoxFuture<'a, Result<()>>;
}

/// A JSON document on the local filesystem.
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    /// Creates a source reading `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the document path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigSource for FileConfigSource {
    fn load(&self) -> BoxFuture<'_, Result<ConfigDocument>> {
        Box::pin(async move {
            let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
                AlertError::config(format!(
                    "failed to read configuration '{}': {e}",
                    self.path.display()
                ))
            })?;
            ConfigDocument::from_json(&content)
        })
    }

    fn save<'a>(&'a self, document: &'a ConfigDocument) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let bytes = document.to_json()?.into_bytes();
            let path = self.path.clone();
            tokio::task::spawn_blocking(move || claw_persist::write_atomic(&path, &bytes))
                .await
                .map_err(|e| AlertError::Io(std::io::Error::other(e)))??;
            debug!(path = %self.path.display(), "saved configuration");
            Ok(())
        })
    }
}

/// The compiled configuration currently driving the engine.
#[derive(Debug)]
pub struct Runtime {
    hash: String,
    document: ConfigDocument,
    integrations: HashMap<String, Vec<Arc<Integration>>>,
    dispatcher: Dispatcher,
}

impl Runtime {
    /// Returns the document fingerprint.
    #[must_use]
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Returns the document.
    #[must_use]
    pub fn document(&self) -> &ConfigDocument {
        &self.document
    }

    /// Returns the routing tree.
    #[must_use]
    pub fn route(&self) -> &Arc<Route> {
        self.dispatcher.route()
    }

    /// Returns the built integrations per receiver.
    #[must_use]
    pub fn integrations(&self) -> &HashMap<String, Vec<Arc<Integration>>> {
        &self.integrations
    }

    /// Returns the dispatcher.
    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }
}

/// State shared by every runtime generation.
#[derive(Debug, Clone)]
pub struct SharedState {
    /// Alert store.
    pub alerts: Arc<AlertStore>,
    /// Silence store.
    pub silences: Arc<SilenceStore>,
    /// Notification log.
    pub nflog: Arc<NotificationLog>,
    /// Mute status record.
    pub marker: Arc<Marker>,
}

struct Compiled {
    route: Arc<Route>,
    integrations: HashMap<String, Vec<Arc<Integration>>>,
    inhibitor: Inhibitor,
}

/// Applies configuration documents to a running engine.
#[derive(Debug)]
pub struct ConfigReloader {
    shared: SharedState,
    registry: IntegrationRegistry,
    settings: EngineSettings,
    current: RwLock<Option<Arc<Runtime>>>,
    apply_lock: tokio::sync::Mutex<()>,
}

impl ConfigReloader {
    /// Creates a reloader with no configuration applied yet.
    #[must_use]
    pub fn new(shared: SharedState, registry: IntegrationRegistry, settings: EngineSettings) -> Self {
        Self {
            shared,
            registry,
            settings,
            current: RwLock::new(None),
            apply_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Returns the running configuration, if any.
    #[must_use]
    pub fn current(&self) -> Option<Arc<Runtime>> {
        self.current.read().clone()
    }

    /// Applies `document`, returning false if it matches the running one.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is invalid, an integration cannot be
    /// built or the templates cannot be persisted. The running
    /// configuration is left untouched in every error case.
    pub async fn apply(&self, document: ConfigDocument) -> Result<bool> {
        let _guard = self.apply_lock.lock().await;

        let hash = document.fingerprint()?;
        if self.current().is_some_and(|rt| rt.hash == hash) {
            debug!(hash = %hash, "configuration unchanged");
            return Ok(false);
        }

        document.validate()?;
        self.persist_templates(&document).await?;
        let compiled = self.compile(&document)?;

        let previous = self.current();
        if let Some(previous) = &previous {
            previous.dispatcher.stop().await;
        }

        let deps = PipelineDeps {
            silences: Arc::clone(&self.shared.silences),
            inhibitor: compiled.inhibitor,
            marker: Arc::clone(&self.shared.marker),
            nflog: Arc::clone(&self.shared.nflog),
            retry: RetryPolicy::from(&self.settings.notify),
            wait_stagger: Duration::from_millis(self.settings.notify.wait_stagger_ms),
        };
        let stage = Arc::new(build_pipeline(&compiled.integrations, &deps));
        let dispatcher = Dispatcher::start(
            compiled.route,
            stage,
            Arc::clone(&self.shared.alerts),
            DispatchOptions::from(&self.settings),
        );

        *self.current.write() = Some(Arc::new(Runtime {
            hash: hash.clone(),
            document,
            integrations: compiled.integrations,
            dispatcher,
        }));

        info!(
            hash = %hash,
            replaced = previous.is_some(),
            "applied configuration"
        );
        Ok(true)
    }

    /// Loads a document from `source` and applies it.
    ///
    /// # Errors
    ///
    /// Returns the load or apply error.
    pub async fn reload(&self, source: &dyn ConfigSource) -> Result<bool> {
        let document = source.load().await?;
        self.apply(document).await
    }

    /// Validates `document`, persists it to `source`, then applies it.
    ///
    /// # Errors
    ///
    /// Returns an error if validation, persistence or the apply fails.
    pub async fn save(&self, source: &dyn ConfigSource, document: ConfigDocument) -> Result<bool> {
        document.validate()?;
        self.compile(&document)?;
        source.save(&document).await?;
        self.apply(document).await
    }

    /// Polls `source` every `interval` until `cancel` fires.
    pub async fn poll(self: Arc<Self>, source: Arc<dyn ConfigSource>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.reload(source.as_ref()).await {
                        warn!(error = %e, "configuration reload failed, keeping current configuration");
                    }
                }
            }
        }
        debug!("configuration poller stopped");
    }

    /// Stops the running dispatcher.
    pub async fn stop(&self) {
        let _guard = self.apply_lock.lock().await;
        if let Some(runtime) = self.current() {
            runtime.dispatcher.stop().await;
        }
    }

    fn compile(&self, document: &ConfigDocument) -> Result<Compiled> {
        let route = Arc::new(Route::build(&document.route)?);
        let templates = Arc::new(TemplateSet::new(document.templates.clone())?);
        let ctx = BuildContext::new(
            templates,
            Duration::from_secs(self.settings.notify.send_timeout_secs),
        );

        let mut integrations = HashMap::with_capacity(document.receivers.len());
        for receiver in &document.receivers {
            let built = self
                .registry
                .build_receiver(receiver, &ctx)?
                .into_iter()
                .map(Arc::new)
                .collect();
            integrations.insert(receiver.name.clone(), built);
        }

        Ok(Compiled {
            route,
            integrations,
            inhibitor: Inhibitor::new(document.inhibit_rules.clone(), Arc::clone(&self.shared.alerts)),
        })
    }

    async fn persist_templates(&self, document: &ConfigDocument) -> Result<()> {
        if document.templates.is_empty() {
            return Ok(());
        }
        let dir = self.settings.templates_dir();
        let templates = document.templates.clone();

        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            for (name, text) in &templates {
                claw_persist::write_atomic(&dir.join(format!("{name}.tmpl")), text.as_bytes())?;
            }
            Ok(())
        })
        .await
        .map_err(|e| AlertError::Io(std::io::Error::other(e)))??;

        debug!(count = document.templates.len(), "persisted templates");
        Ok(())
    }
}
