//! # Vigil: check-in watchdog
//!
//! Sends daily check-in reminders by push and alerts emergency contacts by
//! email when a user stops checking in.
//!
//! Usage:
//!   vigil                          # Run the driver until Ctrl-C
//!   vigil once                     # One scheduling + dispatch pass
//!   vigil list U1                  # Show a user's notifications
//!   vigil reclaim-stale --older-than-secs 600

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use vigil_core::config::VigilConfig;
use vigil_core::types::UserProfile;
use vigil_scheduler::{
    ChannelRegistry, Clock, Dispatcher, Driver, DriverConfig, NotificationStore, OccasionRules,
    OccasionScheduler, SqliteUserDirectory, SystemClock,
};

#[derive(Parser)]
#[command(name = "vigil", version, about = "⏰ Vigil: check-in reminders and missed check-in alerts")]
struct Cli {
    /// Config file (default: ~/.vigil/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the dispatch and scheduling loops until interrupted
    Run,
    /// Run one scheduling pass, then one dispatch pass
    Once,
    /// Run one dispatch pass
    Dispatch,
    /// Run one scheduling pass
    Schedule,
    /// List a user's notifications, newest first
    List {
        user_id: String,
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Notification counts per status
    Stats,
    /// Move rows stuck in `sending` back to the retry queue
    ReclaimStale {
        #[arg(long, default_value = "600")]
        older_than_secs: u64,
    },
    /// Create or update a user
    User {
        id: String,
        #[arg(long, default_value = "")]
        name: String,
        /// APNs device token
        #[arg(long)]
        token: Option<String>,
        #[arg(long, default_value = "UTC")]
        timezone: String,
        #[arg(long)]
        no_push: bool,
        /// Enable missed check-in emails
        #[arg(long)]
        email_alerts: bool,
        /// Emergency contact address (repeatable, at most 3 are used)
        #[arg(long = "contact")]
        contacts: Vec<String>,
    },
    /// Record a check-in for a user now
    CheckIn { user_id: String },
}

struct App {
    config: VigilConfig,
    store: Arc<NotificationStore>,
    directory: Arc<SqliteUserDirectory>,
    clock: Arc<dyn Clock>,
}

impl App {
    fn open(config: VigilConfig) -> Result<Self> {
        let db_path = PathBuf::from(shellexpand::tilde(&config.database.path).to_string());
        ensure_parent(&db_path)?;
        let store = Arc::new(NotificationStore::open(&db_path)?);
        let directory = Arc::new(SqliteUserDirectory::open(&db_path)?);
        tracing::debug!("🗄️ Database: {}", db_path.display());
        Ok(Self {
            config,
            store,
            directory,
            clock: Arc::new(SystemClock),
        })
    }

    fn dispatcher(&self) -> Arc<Dispatcher> {
        let registry: ChannelRegistry = vigil_channels::build_channels(&self.config)
            .into_iter()
            .collect();
        let s = &self.config.scheduler;
        Arc::new(
            Dispatcher::new(
                self.store.clone(),
                registry,
                self.directory.clone(),
                self.clock.clone(),
            )
            .with_batch_limit(s.batch_limit)
            .with_send_timeout(std::time::Duration::from_secs(s.send_timeout_secs)),
        )
    }

    fn occasions(&self) -> Arc<OccasionScheduler> {
        Arc::new(OccasionScheduler::new(
            self.store.clone(),
            self.directory.clone(),
            self.clock.clone(),
            OccasionRules::from(&self.config.scheduler),
        ))
    }

    fn driver(&self) -> Driver {
        Driver::new(
            self.dispatcher(),
            self.occasions(),
            DriverConfig::from(&self.config.scheduler),
        )
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<VigilConfig> {
    let config = match path {
        Some(path) => {
            let mut config = VigilConfig::load_from(path)?;
            config.apply_env_overrides(|key| std::env::var(key).ok());
            config.validate()?;
            config
        }
        None => VigilConfig::load()?,
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "vigil=debug,vigil_scheduler=debug,vigil_channels=debug"
    } else {
        "vigil=info,vigil_scheduler=info,vigil_channels=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config = load_config(cli.config.as_deref())?;
    let app = App::open(config)?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            println!("⏰ Vigil v{}", env!("CARGO_PKG_VERSION"));
            let mut driver = app.driver();
            driver.start();
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            driver.stop().await;
        }
        Command::Once => {
            let (scheduled, dispatched) = app.driver().run_once().await?;
            println!(
                "📅 created {} reminder(s), {} escalation email(s) ({} user(s) skipped)",
                scheduled.push_created, scheduled.email_created, scheduled.users_skipped
            );
            println!(
                "📬 sent {}, retrying {}, failed {}, skipped {}",
                dispatched.sent, dispatched.retried, dispatched.failed, dispatched.skipped
            );
        }
        Command::Dispatch => {
            let processed = app.dispatcher().run_dispatch_cycle().await?;
            println!("📬 processed {processed} notification(s)");
        }
        Command::Schedule => {
            let report = app.occasions().run_scheduling_cycle().await;
            println!(
                "📅 created {} reminder(s), {} escalation email(s)",
                report.push_created, report.email_created
            );
        }
        Command::List { user_id, limit } => {
            let rows = app.store.list_for_user(&user_id, limit)?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        Command::Stats => {
            for (status, count) in app.store.count_by_status()? {
                println!("{:<10} {count}", status.as_str());
            }
        }
        Command::ReclaimStale { older_than_secs } => {
            app.config.scheduler.check_stale_age(older_than_secs)?;
            let n = app
                .dispatcher()
                .reclaim_stale(std::time::Duration::from_secs(older_than_secs))?;
            println!("♻️ reclaimed {n} notification(s)");
        }
        Command::User {
            id,
            name,
            token,
            timezone,
            no_push,
            email_alerts,
            contacts,
        } => {
            let user = UserProfile {
                id,
                name,
                push_token: token,
                push_enabled: !no_push,
                email_enabled: email_alerts,
                emergency_contacts: contacts,
                timezone,
            };
            app.directory.upsert_user(&user)?;
            println!("✅ user {} saved", user.id);
        }
        Command::CheckIn { user_id } => {
            if app.directory.record_check_in(&user_id, app.clock.now())? {
                println!("✅ {user_id} checked in");
            } else {
                println!("ℹ️ {user_id} already checked in today");
            }
        }
    }
    Ok(())
}
