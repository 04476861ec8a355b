//! Mastermind CLI - Operator tool for the metadata cache
//!
//! Builds a `Controller` from a TOML configuration file (plus command line
//! overrides) and dumps, watches or queries the mirrored datasets.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mastermind_client::cache::from_unix_millis;
use mastermind_client::{Controller, DatasetStatus, PersistenceStore};
use mastermind_common::{ControllerConfig, DatasetKind};
use serde_json::Value;
use std::path::PathBuf;
use std::time::SystemTime;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "mastermind-cli")]
#[command(about = "Mastermind metadata cache CLI")]
#[command(version)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Remote service instance, host:port[:family] (repeatable, replaces
    /// the configured list)
    #[arg(short, long = "remote", env = "MASTERMIND_REMOTES", value_delimiter = ',')]
    remotes: Vec<String>,

    /// Snapshot file
    #[arg(long)]
    cache_path: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Refresh once and print the datasets
    Dump {
        /// Only this dataset (e.g. namespace-states)
        #[arg(short, long)]
        dataset: Option<DatasetKind>,
    },
    /// Keep refreshing and report every cycle until Ctrl-C
    Watch,
    /// Show a snapshot file without contacting the remote
    Inspect {
        /// Snapshot file
        #[arg(short, long)]
        path: PathBuf,
        /// Also print the stored values
        #[arg(long)]
        values: bool,
    },
    /// Send one event to the remote and print the response
    Call {
        /// Event name (e.g. fetch-couple-info)
        event: String,
        /// JSON payload
        payload: Option<String>,
    },
}

fn load_config(args: &Args) -> Result<ControllerConfig> {
    let mut config = match &args.config {
        Some(path) => ControllerConfig::load(path)?,
        None => ControllerConfig::default(),
    };
    if !args.remotes.is_empty() {
        config.remotes.clone_from(&args.remotes);
    }
    if args.cache_path.is_some() {
        config.cache_path.clone_from(&args.cache_path);
    }
    Ok(config)
}

fn dataset_value(controller: &Controller, kind: DatasetKind) -> serde_json::Result<Value> {
    match kind {
        DatasetKind::NamespaceStates => serde_json::to_value(&*controller.namespace_states()),
        DatasetKind::CachedKeys => serde_json::to_value(&*controller.cached_keys()),
        DatasetKind::EllipticsRemotes => serde_json::to_value(&*controller.elliptics_remotes()),
        DatasetKind::NamespaceSettings => {
            serde_json::to_value(&*controller.namespace_settings())
        }
        DatasetKind::BadGroups => serde_json::to_value(&*controller.bad_groups()),
        DatasetKind::FakeGroupsInfo => serde_json::to_value(&*controller.fake_groups_info()),
    }
}

fn print_status(statuses: &[DatasetStatus]) {
    println!(
        "{:<20} {:<9} {:<14} {:>10} {:>6} {:>6}",
        "DATASET", "ORIGIN", "STALENESS", "AGE", "OK", "FAIL"
    );
    for s in statuses {
        println!(
            "{:<20} {:<9} {:<14} {:>9}s {:>6} {:>6}",
            s.dataset.name(),
            format!("{:?}", s.origin).to_lowercase(),
            s.staleness.to_string(),
            s.age_secs,
            s.successes,
            s.failures
        );
        if let Some(error) = &s.last_error {
            println!("    last error: {error}");
        }
    }
}

fn dump(config: ControllerConfig, dataset: Option<DatasetKind>) -> Result<()> {
    let controller = Controller::new(ControllerConfig {
        auto_start: false,
        ..config
    })?;
    controller.start()?;
    controller.stop();

    match dataset {
        Some(kind) => {
            let value = dataset_value(&controller, kind)?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        None => {
            print_status(&controller.dataset_status());
            println!();
            let mut all = serde_json::Map::new();
            for kind in DatasetKind::ALL {
                all.insert(kind.name().to_string(), dataset_value(&controller, kind)?);
            }
            println!("{}", serde_json::to_string_pretty(&Value::Object(all))?);
        }
    }
    if controller.cache_is_expired() {
        println!("WARNING: cache is expired");
    }
    Ok(())
}

async fn watch(config: ControllerConfig) -> Result<()> {
    let controller = Controller::new(ControllerConfig {
        auto_start: false,
        ..config
    })?;
    controller.set_update_callback_with_expiry(|expired| {
        if expired {
            println!("Cache refreshed, some datasets are expired");
        } else {
            println!("Cache refreshed");
        }
    });
    controller.start()?;
    print_status(&controller.dataset_status());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("Shutting down after {} cycles", controller.cycles());
    controller.stop();
    print_status(&controller.dataset_status());
    Ok(())
}

fn inspect(path: PathBuf, values: bool) -> Result<()> {
    let store = PersistenceStore::new(&path);
    let snapshot = store
        .load()?
        .with_context(|| format!("no snapshot at {}", path.display()))?;

    let now = SystemTime::now();
    let age = |ms: u64| {
        now.duration_since(from_unix_millis(ms))
            .map(|d| d.as_secs())
            .unwrap_or(0)
    };

    println!("Snapshot: {}", path.display());
    println!("Version: {}", snapshot.version);
    println!("Worker: {}", snapshot.worker_name);
    println!("Saved: {}s ago", age(snapshot.saved_at_ms));
    println!();
    for kind in DatasetKind::ALL {
        match snapshot.entry(kind) {
            Some(entry) => {
                println!("{:<20} {:>9}s old", kind.name(), age(entry.timestamp_ms));
                if values {
                    println!("{}", serde_json::to_string_pretty(&entry.value)?);
                }
            }
            None => println!("{:<20} (missing)", kind.name()),
        }
    }
    Ok(())
}

fn call(config: ControllerConfig, event: &str, payload: Option<&str>) -> Result<()> {
    let payload: Value = match payload {
        Some(text) => serde_json::from_str(text).context("payload is not valid JSON")?,
        None => Value::Null,
    };
    let controller = Controller::new(ControllerConfig {
        auto_start: false,
        ..config
    })?;
    let response = controller.call(event, &payload)?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match &args.command {
        Commands::Dump { dataset } => dump(load_config(&args)?, *dataset),
        Commands::Watch => watch(load_config(&args)?).await,
        Commands::Inspect { path, values } => inspect(path.clone(), *values),
        Commands::Call { event, payload } => {
            call(load_config(&args)?, event, payload.as_deref())
        }
    }
}
