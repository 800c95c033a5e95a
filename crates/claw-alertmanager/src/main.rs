//! claw-alertmanager - Clawbernetes alert notification engine
//!
//! Runs the routing and dispatch engine as a standalone process, reading
//! engine settings from TOML and the routing configuration from JSON.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use claw_alertmanager::channels::BuildContext;
use claw_alertmanager::template::TemplateSet;
use claw_alertmanager::{
    ConfigDocument, ConfigSource, EngineSettings, FileConfigSource, IntegrationRegistry,
    NotificationEngine,
};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "claw-alertmanager")]
#[command(about = "Clawbernetes alert notification engine")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the notification engine
    Run {
        /// Path to the engine settings file
        #[arg(short, long, env = "CLAW_ALERTMANAGER_SETTINGS", default_value = "/etc/claw-alertmanager/settings.toml")]
        settings: PathBuf,
    },

    /// Validate a configuration document
    CheckConfig {
        /// Path to the JSON configuration document
        config: PathBuf,
    },

    /// Write sample settings and configuration files
    InitConfig {
        /// Directory to write `settings.toml` and `config.json` into
        #[arg(short, long, default_value = "/etc/claw-alertmanager")]
        output: PathBuf,

        /// State directory recorded in the settings
        #[arg(long, default_value = "/var/lib/claw-alertmanager")]
        data_dir: PathBuf,
    },
}

fn init_tracing() -> anyhow::Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("claw_alertmanager=info".parse()?);

    #[cfg(feature = "json-logs")]
    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(filter)
        .init();

    #[cfg(not(feature = "json-logs"))]
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing()?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { settings } => {
            run_engine(&settings).await?;
        }

        Commands::CheckConfig { config } => {
            check_config(&config)?;
        }

        Commands::InitConfig { output, data_dir } => {
            init_config(&output, data_dir)?;
        }
    }

    Ok(())
}

async fn run_engine(settings_path: &Path) -> anyhow::Result<()> {
    info!(settings = %settings_path.display(), "starting claw-alertmanager");

    let settings = EngineSettings::from_file(settings_path)?;
    let source: Option<Arc<dyn ConfigSource>> = settings
        .config_file
        .as_ref()
        .map(|path| Arc::new(FileConfigSource::new(path)) as Arc<dyn ConfigSource>);

    let engine = NotificationEngine::new(settings)?;
    engine.start(source).await?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    engine.shutdown().await;
    Ok(())
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    let document = ConfigDocument::from_file(path)?;
    document.validate()?;

    // Build every integration too, so bad settings are caught here.
    let registry = IntegrationRegistry::default();
    let ctx = BuildContext::new(
        Arc::new(TemplateSet::new(document.templates.clone())?),
        std::time::Duration::from_secs(10),
    );
    let mut integrations = 0;
    for receiver in &document.receivers {
        integrations += registry.build_receiver(receiver, &ctx)?.len();
    }

    println!(
        "{}: ok ({} receivers, {} integrations, {} inhibit rules, {} templates)",
        path.display(),
        document.receivers.len(),
        integrations,
        document.inhibit_rules.len(),
        document.templates.len()
    );
    Ok(())
}

fn init_config(output: &Path, data_dir: PathBuf) -> anyhow::Result<()> {
    std::fs::create_dir_all(output)
        .with_context(|| format!("failed to create {}", output.display()))?;

    let config_path = output.join("config.json");
    let settings = EngineSettings {
        config_file: Some(config_path.clone()),
        ..EngineSettings::with_data_dir(data_dir)
    };

    let settings_path = output.join("settings.toml");
    std::fs::write(&settings_path, settings.to_toml()?)?;
    std::fs::write(&config_path, ConfigDocument::default().to_json()?)?;

    println!("Settings written to {}", settings_path.display());
    println!("Configuration written to {}", config_path.display());
    Ok(())
}
