//! Reward Ledger - admin command line for the referral and task reward ledger
//!
//! Works directly on the ledger snapshot file. Do not run mutating commands
//! while a bot process holds the same snapshot open; its next autosave would
//! overwrite the change.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use reward_ledger::cli::commands;
use reward_ledger::config::EngineConfig;
use reward_ledger::ledger::TaskKind;

/// Reward Ledger - referral and task reward administration
#[derive(Parser)]
#[command(name = "ledger")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Admin user id to act as (default: first configured admin)
    #[arg(long, env = "LEDGER_ADMIN_ID")]
    admin: Option<i64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show current configuration
    Config,

    /// Show user, referral, task and withdrawal totals
    Stats,

    /// Show a user's account and recent transactions
    User {
        /// User id
        user_id: i64,

        /// Number of transactions to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// List all tasks
    Tasks,

    /// Create a task
    CreateTask {
        #[command(subcommand)]
        kind: NewTaskKind,
    },

    /// Reopen a task for users
    Activate {
        /// Task id
        task_id: String,
    },

    /// Close a task; running view countdowns are cancelled
    Deactivate {
        /// Task id
        task_id: String,
    },

    /// Show settings, or change one: referral_reward, min_withdrawal,
    /// payment_details, channel_to_join, admin_ids
    Set {
        /// Setting name
        name: Option<String>,

        /// New value
        value: Option<String>,
    },

    /// List pending withdrawal requests
    Pending {
        /// Number of requests to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Mark a pending withdrawal as paid
    Approve {
        /// Transaction id
        transaction_id: String,

        /// Skip confirmation prompt
        #[arg(long)]
        force: bool,
    },

    /// Reject a pending withdrawal and return the funds to the user
    Reject {
        /// Transaction id
        transaction_id: String,

        /// Reason shown to the user
        #[arg(long)]
        reason: String,

        /// Skip confirmation prompt
        #[arg(long)]
        force: bool,
    },

    /// Credit or debit a user's balance
    Adjust {
        /// User id
        user_id: i64,

        /// Amount, e.g. 0.5
        amount: String,

        /// Direction: add or sub
        direction: String,

        /// Skip confirmation prompt
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum NewTaskKind {
    /// Reward users for joining a channel
    Join {
        /// Channel handle or numeric id (default: configured channel_to_join)
        #[arg(long, default_value = "")]
        channel: String,

        /// Reward per completion
        #[arg(long)]
        reward: String,

        /// Stop after this many completions
        #[arg(long)]
        max: Option<u32>,
    },

    /// Reward users for viewing a post for a fixed time
    View {
        /// Post URL
        #[arg(long)]
        url: String,

        /// View duration in seconds
        #[arg(long, default_value = "30")]
        duration: u64,

        /// Reward per completion
        #[arg(long)]
        reward: String,

        /// Stop after this many completions
        #[arg(long)]
        max: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize tracing
    let directive = match "reward_ledger=info".parse::<tracing_subscriber::filter::Directive>() {
        Ok(directive) => directive,
        Err(e) => anyhow::bail!("Invalid log directive: {}", e),
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(directive))
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    let cli = Cli::parse();

    let config = match EngineConfig::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    startup_checks(&config);

    let admin = cli.admin;
    let result = match cli.command {
        Commands::Config => commands::show_config(&config),
        Commands::Stats => commands::stats(&config, admin).await,
        Commands::User { user_id, limit } => commands::user(&config, admin, user_id, limit).await,
        Commands::Tasks => commands::tasks(&config, admin).await,
        Commands::CreateTask { kind } => match kind {
            NewTaskKind::Join {
                channel,
                reward,
                max,
            } => {
                commands::create_task(&config, admin, TaskKind::JoinChannel { channel }, &reward, max)
                    .await
            }
            NewTaskKind::View {
                url,
                duration,
                reward,
                max,
            } => {
                let kind = TaskKind::ViewPost {
                    url,
                    duration_secs: duration,
                };
                commands::create_task(&config, admin, kind, &reward, max).await
            }
        },
        Commands::Activate { task_id } => commands::set_task_active(&config, admin, &task_id, true).await,
        Commands::Deactivate { task_id } => {
            commands::set_task_active(&config, admin, &task_id, false).await
        }
        Commands::Set { name, value } => {
            commands::set_setting(&config, admin, name.as_deref(), value.as_deref()).await
        }
        Commands::Pending { limit } => commands::pending(&config, admin, limit).await,
        Commands::Approve {
            transaction_id,
            force,
        } => commands::approve(&config, admin, &transaction_id, force).await,
        Commands::Reject {
            transaction_id,
            reason,
            force,
        } => commands::reject(&config, admin, &transaction_id, &reason, force).await,
        Commands::Adjust {
            user_id,
            amount,
            direction,
            force,
        } => commands::adjust(&config, admin, user_id, &amount, &direction, force).await,
    };

    if let Err(e) = result {
        match e.downcast_ref::<reward_ledger::Error>() {
            Some(err) if err.is_user_facing() => eprintln!("{}", err),
            _ => error!("Command failed: {:#}", e),
        }
        std::process::exit(1);
    }

    Ok(())
}

/// Report which snapshot the commands will act on
fn startup_checks(config: &EngineConfig) {
    match &config.store.snapshot_path {
        Some(path) if std::path::Path::new(path).exists() => info!("Using ledger snapshot {}", path),
        Some(path) => warn!("Ledger snapshot {} does not exist yet; starting empty", path),
        None => warn!("store.snapshot_path is not set; only `config` will work"),
    }
}
