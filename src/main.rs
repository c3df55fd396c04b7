use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use emma::config::{load_settings, load_settings_from, Settings};
use emma::daemon::EmmaService;
use emma::models::{ActionItemStatus, EmailPriority, Relevance};
use emma::store::{ActionItemFilter, LedgerStore};
use emma::EmmaError;

#[derive(Parser)]
#[command(name = "emma", version, about = "Personal email automation service")]
struct Cli {
    /// Config file path (default: ~/.config/emma/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the service until interrupted
    Run,
    /// Run selected jobs once and exit
    Once {
        /// Run a monitor cycle
        #[arg(long)]
        monitor: bool,
        /// Generate a digest
        #[arg(long)]
        digest: bool,
    },
    /// Show service configuration and ledger statistics
    Status,
    /// Digest operations
    Digest {
        #[command(subcommand)]
        command: DigestCommand,
    },
    /// Action item operations
    Actions {
        #[command(subcommand)]
        command: ActionsCommand,
    },
    /// Remove ledger data past the retention window
    Cleanup {
        /// Retention in days (default: configured retention_days)
        #[arg(long)]
        days: Option<u32>,
    },
}

#[derive(Subcommand)]
enum DigestCommand {
    /// Generate a digest now
    Generate,
    /// List recent digests
    List {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Show one digest's content
    Show { id: String },
    /// Re-deliver a stored digest to the configured targets
    Deliver { id: String },
}

#[derive(Subcommand)]
enum ActionsCommand {
    /// List action items (pending by default)
    List {
        /// Filter by status: pending, in_progress, completed, dismissed
        #[arg(long)]
        status: Option<String>,
        /// Include all statuses
        #[arg(long)]
        all: bool,
        #[arg(long, default_value_t = 25)]
        limit: usize,
    },
    /// Show one action item
    Show { id: String },
    /// Manually add an action item
    Add {
        title: String,
        #[arg(long)]
        description: Option<String>,
        /// low, normal, high, or urgent
        #[arg(long, default_value = "normal")]
        priority: String,
    },
    /// Mark an item in progress
    Start { id: String },
    /// Mark an item completed
    Complete { id: String },
    /// Dismiss an item
    Dismiss { id: String },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn settings_for(cli_config: &Option<PathBuf>) -> Result<Settings, EmmaError> {
    match cli_config {
        Some(path) => load_settings_from(path),
        None => load_settings(),
    }
}

async fn run(cli: Cli) -> Result<(), EmmaError> {
    let settings = settings_for(&cli.config)?;

    match cli.command {
        Command::Run => run_service(settings).await,
        Command::Once { monitor, digest } => {
            let both_unset = !monitor && !digest;
            let service = EmmaService::from_settings(settings)?;
            let (cycle, generated) = service
                .run_once(monitor || both_unset, digest || both_unset)
                .await?;
            if let Some(stats) = cycle {
                println!(
                    "Monitor: {} found, {} processed, {} action item(s), {} error(s)",
                    stats.emails_found,
                    stats.emails_processed,
                    stats.action_items_created,
                    stats.errors
                );
            }
            match generated {
                Some(digest) => println!("Digest {} ({} emails)", digest.id, digest.email_count),
                None => println!("No digest produced"),
            }
            Ok(())
        }
        Command::Status => {
            let service = EmmaService::from_settings(settings)?;
            let status = service.status()?;
            println!(
                "{}",
                serde_json::to_string_pretty(&status)
                    .map_err(|e| EmmaError::Config(e.to_string()))?
            );
            Ok(())
        }
        Command::Digest { command } => run_digest(settings, command).await,
        Command::Actions { command } => run_actions(settings, command),
        Command::Cleanup { days } => {
            let days = days.unwrap_or(settings.service.retention_days);
            let store = LedgerStore::open(&settings.db_path()?)?;
            let counts = store.cleanup(days)?;
            println!(
                "Removed {} email record(s), {} digest(s), {} action item(s) older than {days} day(s)",
                counts.processed_emails, counts.digests, counts.action_items
            );
            Ok(())
        }
    }
}

async fn run_service(settings: Settings) -> Result<(), EmmaError> {
    let service = Arc::new(EmmaService::from_settings(settings)?);

    let runner = {
        let service = service.clone();
        tokio::spawn(async move { service.run().await })
    };

    tokio::signal::ctrl_c().await?;
    log::info!("Interrupt received, shutting down");
    service.stop();

    runner
        .await
        .map_err(|e| EmmaError::Config(format!("Service task panicked: {e}")))?
}

async fn run_digest(settings: Settings, command: DigestCommand) -> Result<(), EmmaError> {
    match command {
        DigestCommand::Generate => {
            let service = EmmaService::from_settings(settings)?;
            let generated = service.generate_digest(true).await?;
            match generated {
                Some(digest) => {
                    println!("Digest {} ({} emails)", digest.id, digest.email_count);
                    println!("{}", digest.summary);
                }
                None => println!("No digest produced"),
            }
        }
        DigestCommand::List { limit } => {
            let store = LedgerStore::open(&settings.db_path()?)?;
            let digests = store.list_digests(limit)?;
            if digests.is_empty() {
                println!("No digests yet");
            }
            for digest in digests {
                println!(
                    "{}  {}  {:>4} emails  {}",
                    digest.id,
                    digest.created_at.format("%Y-%m-%d %H:%M"),
                    digest.email_count,
                    digest.delivery_status.as_str()
                );
            }
        }
        DigestCommand::Show { id } => {
            let store = LedgerStore::open(&settings.db_path()?)?;
            match store.get_digest(&id)? {
                Some(digest) => match digest.raw_content {
                    Some(content) => println!("{content}"),
                    None => println!("{}", digest.summary),
                },
                None => println!("No digest with id {id}"),
            }
        }
        DigestCommand::Deliver { id } => {
            let data_dir = settings.data_dir()?;
            let store = emma::store::new_shared_store(LedgerStore::open(&settings.db_path()?)?);
            let digest = {
                let s = store.lock().expect("store lock");
                s.get_digest(&id)?
            };
            match digest {
                Some(digest) => {
                    let generator = emma::digest::DigestGenerator::new(
                        store,
                        settings.service.digest.clone(),
                        &data_dir,
                    );
                    if generator.deliver(&digest)? {
                        println!("Digest {id} delivered");
                    } else {
                        println!("Delivery of digest {id} failed");
                    }
                }
                None => println!("No digest with id {id}"),
            }
        }
    }
    Ok(())
}

fn run_actions(settings: Settings, command: ActionsCommand) -> Result<(), EmmaError> {
    let service_config = settings.service.clone();
    let store = emma::store::new_shared_store(LedgerStore::open(&settings.db_path()?)?);
    let manager = emma::actions::ActionItemManager::new(
        store,
        service_config.action_items.confidence_threshold,
    );

    match command {
        ActionsCommand::List { status, all, limit } => {
            let filter = ActionItemFilter {
                status: match (&status, all) {
                    (Some(s), _) => Some(ActionItemStatus::parse(s)),
                    (None, true) => None,
                    (None, false) => Some(ActionItemStatus::Pending),
                },
                ..Default::default()
            };
            let items = manager.list(&filter, limit)?;
            if items.is_empty() {
                println!("No action items");
            }
            for item in items {
                let due = item
                    .due_date
                    .map(|d| format!("  due {}", d.format("%Y-%m-%d")))
                    .unwrap_or_default();
                let relevance = if item.relevance == Relevance::Informational {
                    "  [info]"
                } else {
                    ""
                };
                println!(
                    "{}  [{}] {}{due}{relevance}",
                    item.id,
                    item.status.as_str(),
                    item.title
                );
            }
        }
        ActionsCommand::Show { id } => match manager.get(&id)? {
            Some(item) => {
                println!("Title:    {}", item.title);
                println!("Status:   {}", item.status.as_str());
                println!("Priority: {}", item.priority.as_str());
                if let Some(description) = &item.description {
                    println!("Details:  {description}");
                }
                if let Some(due) = item.due_date {
                    println!("Due:      {}", due.format("%Y-%m-%d"));
                }
                if let Some(completed) = item.completed_at {
                    println!("Done at:  {}", completed.format("%Y-%m-%d %H:%M"));
                }
            }
            None => println!("No action item with id {id}"),
        },
        ActionsCommand::Add {
            title,
            description,
            priority,
        } => {
            let item = manager.create_manual(
                &title,
                description.as_deref(),
                EmailPriority::parse(&priority),
                None,
            )?;
            println!("Created {}", item.id);
        }
        ActionsCommand::Start { id } => transition(&manager, &id, "started", |m, i| m.start(i))?,
        ActionsCommand::Complete { id } => {
            transition(&manager, &id, "completed", |m, i| m.complete(i))?
        }
        ActionsCommand::Dismiss { id } => {
            transition(&manager, &id, "dismissed", |m, i| m.dismiss(i))?
        }
    }
    Ok(())
}

fn transition(
    manager: &emma::actions::ActionItemManager,
    id: &str,
    verb: &str,
    op: impl Fn(&emma::actions::ActionItemManager, &str) -> Result<bool, EmmaError>,
) -> Result<(), EmmaError> {
    if op(manager, id)? {
        println!("Item {id} {verb}");
    } else {
        println!("No action item with id {id}");
    }
    Ok(())
}
