//! # Coachcast CLI
//!
//! Daily coaching delivery: timezone-aware scheduler and multi-channel
//! notification queue.
//!
//! Usage:
//!   coachcast init                         # Write default config and database
//!   coachcast serve                        # Scheduler loop + HTTP gateway
//!   coachcast tick                         # Run one scheduling cycle
//!   coachcast subscriber add --id u1 ...   # Manage subscribers
//!   coachcast content add --subscriber u1  # Load a day's script/audio
//!   coachcast queue stats                  # Inspect the delivery queue
//!   coachcast send-test --subscriber u1 --channel email

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use coachcast_channels::{ChannelRegistry, render_notification};
use coachcast_core::CoachcastConfig;
use coachcast_core::types::{ChannelKind, DailyContent, DeliveryStatus, Notification, QuietHours, Subscriber};
use coachcast_gateway::AppState;
use coachcast_scheduler::SchedulerEngine;
use coachcast_scheduler::timezone::{local_date, parse_timezone};
use coachcast_store::DeliveryStore;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "coachcast",
    version,
    about = "🎧 Coachcast — daily coaching delivery scheduler",
    long_about = "Timezone-aware daily delivery of coaching sessions over email, SMS,\nWhatsApp, Telegram, push and an in-app inbox."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// First-time setup: default config and database
    Init,

    /// Run the scheduler loop and HTTP gateway
    Serve {
        /// Override gateway port
        #[arg(short, long)]
        port: Option<u16>,

        /// Run the scheduler without the HTTP gateway
        #[arg(long)]
        no_gateway: bool,
    },

    /// Run a single scheduling cycle and exit
    Tick,

    /// Manage subscribers
    Subscriber {
        #[command(subcommand)]
        action: SubscriberAction,
    },

    /// Manage daily content
    Content {
        #[command(subcommand)]
        action: ContentAction,
    },

    /// Inspect and repair the delivery queue
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Send the latest content to one subscriber on one channel, bypassing the queue
    SendTest {
        #[arg(short, long)]
        subscriber: String,

        /// email, sms, whatsapp, telegram, push or in_app
        #[arg(long)]
        channel: String,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show system info
    Info,
}

#[derive(Subcommand)]
enum SubscriberAction {
    /// Add or update a subscriber
    Add {
        #[arg(long)]
        id: String,
        #[arg(long)]
        name: String,
        /// IANA timezone, e.g. Europe/Berlin
        #[arg(long, default_value = "UTC")]
        timezone: String,
        /// Local delivery time, HH:MM
        #[arg(long, default_value = "07:00")]
        time: String,
        /// Channels in preference order, comma-separated
        #[arg(long, value_delimiter = ',', default_value = "in_app")]
        channels: Vec<String>,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        phone: Option<String>,
        #[arg(long)]
        telegram_chat_id: Option<String>,
        #[arg(long)]
        push_token: Option<String>,
        /// Quiet window, e.g. 22:00-07:00
        #[arg(long)]
        quiet: Option<String>,
    },
    /// List subscribers
    List,
    /// Pause deliveries through a date (inclusive)
    Pause {
        id: String,
        #[arg(long)]
        until: NaiveDate,
    },
    /// Resume paused deliveries
    Resume { id: String },
    /// Remove a subscriber and their open jobs
    Remove { id: String },
}

#[derive(Subcommand)]
enum ContentAction {
    /// Store the script (and audio link) for a subscriber's date
    Add {
        #[arg(short, long)]
        subscriber: String,
        /// Defaults to today in the subscriber's timezone
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long)]
        title: String,
        /// Script text
        #[arg(long, conflicts_with = "script_file")]
        script: Option<String>,
        /// Read the script from a file
        #[arg(long)]
        script_file: Option<String>,
        #[arg(long)]
        audio_url: Option<String>,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// Counts by status
    Stats,
    /// List jobs, newest first
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Requeue a failed job
    Retry { id: String },
    /// Cancel a pending job
    Cancel { id: String },
    /// Delete finished jobs older than N days
    Purge {
        #[arg(long)]
        days: Option<u64>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Check the configuration for errors
    Validate,
}

fn open_store(config: &CoachcastConfig) -> Result<Arc<DeliveryStore>> {
    let path = config.database.resolved_path();
    let store = DeliveryStore::open(&path).with_context(|| format!("opening database {}", path.display()))?;
    Ok(Arc::new(store))
}

fn build_engine(config: &CoachcastConfig, store: Arc<DeliveryStore>) -> Result<(Arc<SchedulerEngine>, Vec<ChannelKind>)> {
    let registry = ChannelRegistry::from_config(&config.channels, store.clone())?;
    let kinds = registry.kinds();
    let engine = SchedulerEngine::new(config, store, Arc::new(registry))?;
    Ok((Arc::new(engine), kinds))
}

fn yes_no(on: bool) -> &'static str {
    if on { "✅" } else { "⬜" }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "coachcast=debug,coachcast_scheduler=debug,coachcast_channels=debug,coachcast_store=debug,coachcast_gateway=debug,tower_http=debug"
    } else {
        "coachcast=info,coachcast_scheduler=info,coachcast_channels=info,coachcast_store=info,coachcast_gateway=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    // Load config
    let mut config = match &cli.config {
        Some(path) if matches!(cli.command, Commands::Init) && !std::path::Path::new(path).exists() => {
            CoachcastConfig::default()
        }
        Some(path) => CoachcastConfig::load_from(std::path::Path::new(path))?,
        None => CoachcastConfig::load()?,
    };
    config.apply_env_overrides();

    match cli.command {
        Commands::Init => {
            println!("🎧 Coachcast — First-time Setup\n");

            let path = cli
                .config
                .map(std::path::PathBuf::from)
                .unwrap_or_else(CoachcastConfig::default_path);
            if path.exists() {
                println!("✅ Config already exists: {}", path.display());
            } else {
                CoachcastConfig::default().save_to(&path)?;
                println!("✅ Config saved to: {}", path.display());
            }

            let store = open_store(&config)?;
            drop(store);
            println!("✅ Database ready: {}", config.database.resolved_path().display());

            println!("\n📋 Next steps:");
            println!("  1. Configure channels in {} ([channels.email], [channels.twilio], ...)", path.display());
            println!("  2. Add a subscriber: coachcast subscriber add --id u1 --name \"Ada\" --timezone Europe/Berlin --channels email,in_app --email ada@example.com");
            println!("  3. Load content:     coachcast content add --subscriber u1 --title \"Day 1\" --script \"...\"");
            println!("  4. Start delivering: coachcast serve");
        }

        Commands::Serve { port, no_gateway } => {
            config.validate()?;
            if let Some(p) = port {
                config.gateway.port = p;
            }
            let store = open_store(&config)?;
            let (engine, kinds) = build_engine(&config, store.clone())?;

            println!("🎧 Coachcast v{}", env!("CARGO_PKG_VERSION"));
            println!("   Channels: {}", kinds.iter().map(|k| k.as_str()).collect::<Vec<_>>().join(", "));
            println!("   Tick: every {}s", config.scheduler.tick_interval_secs);

            let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

            let scheduler = tokio::spawn({
                let engine = engine.clone();
                let shutdown = shutdown_rx.clone();
                async move { engine.run(shutdown).await }
            });

            let gateway = if no_gateway {
                None
            } else {
                let state = Arc::new(AppState::new(config.clone(), store, engine, kinds));
                Some(tokio::spawn(coachcast_gateway::start(state, shutdown_rx)))
            };

            println!("\nRunning. Press Ctrl+C to stop.");
            tokio::signal::ctrl_c().await?;
            println!("\n⏹️  Shutting down...");
            let _ = shutdown_tx.send(true);

            scheduler.await?;
            if let Some(gateway) = gateway {
                gateway.await??;
            }
            println!("👋 Stopped.");
        }

        Commands::Tick => {
            config.validate()?;
            let store = open_store(&config)?;
            let (engine, _) = build_engine(&config, store)?;
            let report = engine.tick(Utc::now()).await?;
            println!("⏰ Tick at {}", report.at.format("%Y-%m-%d %H:%M:%S UTC"));
            println!("   Released stale: {}", report.released);
            println!("   Planned: {} (new: {})", report.planned, report.enqueued);
            let d = &report.dispatch;
            println!(
                "   Claimed: {} → delivered {}, retried {}, fallbacks {}, deferred {}, failed {}, cancelled {}",
                d.claimed, d.delivered, d.retried, d.fallbacks, d.deferred, d.failed, d.cancelled
            );
            if report.purged > 0 {
                println!("   Purged: {}", report.purged);
            }
        }

        Commands::Subscriber { action } => {
            let store = open_store(&config)?;
            match action {
                SubscriberAction::Add {
                    id,
                    name,
                    timezone,
                    time,
                    channels,
                    email,
                    phone,
                    telegram_chat_id,
                    push_token,
                    quiet,
                } => {
                    parse_timezone(&timezone)?;
                    let delivery_time = coachcast_core::types::subscriber::hhmm::parse(&time)
                        .with_context(|| format!("invalid --time '{time}', expected HH:MM"))?;
                    let channels = channels
                        .iter()
                        .map(|c| c.parse::<ChannelKind>())
                        .collect::<std::result::Result<Vec<_>, _>>()?;

                    let mut subscriber = match store.get_subscriber(&id)? {
                        Some(existing) => existing,
                        None => Subscriber::new(id.clone(), name.clone(), timezone.clone(), delivery_time),
                    };
                    subscriber.name = name;
                    subscriber.timezone = timezone;
                    subscriber.delivery_time = delivery_time;
                    subscriber.channels = channels;
                    subscriber.email = email.or(subscriber.email);
                    subscriber.phone = phone.or(subscriber.phone);
                    subscriber.telegram_chat_id = telegram_chat_id.or(subscriber.telegram_chat_id);
                    subscriber.push_token = push_token.or(subscriber.push_token);
                    if let Some(q) = quiet {
                        subscriber.quiet_hours = Some(
                            QuietHours::parse_range(&q).with_context(|| format!("invalid --quiet '{q}', expected HH:MM-HH:MM"))?,
                        );
                    }
                    subscriber.updated_at = Utc::now();
                    store.upsert_subscriber(&subscriber)?;
                    println!("✅ Subscriber {} saved ({} at {})", subscriber.id, subscriber.timezone, time);
                }
                SubscriberAction::List => {
                    let subscribers = store.list_subscribers()?;
                    if subscribers.is_empty() {
                        println!("(no subscribers)");
                    }
                    for s in subscribers {
                        let channels: Vec<_> = s.channels.iter().map(|c| c.as_str()).collect();
                        let state = match (s.active, s.paused_until) {
                            (false, _) => "inactive".to_string(),
                            (true, Some(until)) => format!("paused until {until}"),
                            (true, None) => "active".to_string(),
                        };
                        println!(
                            "  {} {:<12} {:<20} {} {:<20} [{}] {}",
                            yes_no(s.active && s.paused_until.is_none()),
                            s.id,
                            s.name,
                            s.delivery_time.format("%H:%M"),
                            s.timezone,
                            channels.join(","),
                            state
                        );
                    }
                }
                SubscriberAction::Pause { id, until } => {
                    if store.set_paused_until(&id, Some(until))? {
                        println!("⏸️  {id} paused through {until}");
                    } else {
                        println!("❌ Unknown subscriber: {id}");
                    }
                }
                SubscriberAction::Resume { id } => {
                    if store.set_paused_until(&id, None)? {
                        println!("▶️  {id} resumed");
                    } else {
                        println!("❌ Unknown subscriber: {id}");
                    }
                }
                SubscriberAction::Remove { id } => {
                    if store.delete_subscriber(&id)? {
                        println!("🗑️  {id} removed");
                    } else {
                        println!("❌ Unknown subscriber: {id}");
                    }
                }
            }
        }

        Commands::Content { action } => {
            let store = open_store(&config)?;
            match action {
                ContentAction::Add { subscriber, date, title, script, script_file, audio_url } => {
                    let Some(sub) = store.get_subscriber(&subscriber)? else {
                        println!("❌ Unknown subscriber: {subscriber}");
                        return Ok(());
                    };
                    let script = match (script, script_file) {
                        (Some(s), _) => s,
                        (None, Some(path)) => std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?,
                        (None, None) => anyhow::bail!("one of --script or --script-file is required"),
                    };
                    let date = match date {
                        Some(d) => d,
                        None => local_date(Utc::now(), parse_timezone(&sub.timezone)?),
                    };
                    let mut content = DailyContent::new(sub.id.clone(), date, title, script);
                    content.audio_url = audio_url;
                    store.put_content(&content)?;
                    println!("✅ Content for {} on {date} saved", sub.id);
                }
            }
        }

        Commands::Queue { action } => {
            let store = open_store(&config)?;
            match action {
                QueueAction::Stats => {
                    let stats = store.queue_stats()?;
                    println!("📬 Delivery queue");
                    println!("   Pending:    {}", stats.pending);
                    println!("   Processing: {}", stats.processing);
                    println!("   Delivered:  {}", stats.delivered);
                    println!("   Failed:     {}", stats.failed);
                    println!("   Cancelled:  {}", stats.cancelled);
                    println!("   Total:      {}", stats.total());
                }
                QueueAction::List { status, limit } => {
                    let status = status.map(|s| s.parse::<DeliveryStatus>()).transpose()?;
                    let jobs = store.list_jobs(status, limit)?;
                    if jobs.is_empty() {
                        println!("(no jobs)");
                    }
                    for job in jobs {
                        println!(
                            "  {} {:<10} {:<12} {} next {} ch#{} {} tries{}",
                            job.id,
                            job.status,
                            job.subscriber_id,
                            job.content_date,
                            job.next_attempt_at.format("%m-%d %H:%M"),
                            job.channel_index,
                            job.total_attempts,
                            job.last_error.map(|e| format!(" — {e}")).unwrap_or_default()
                        );
                    }
                }
                QueueAction::Retry { id } => {
                    if store.retry_failed(&id, Utc::now())? {
                        println!("🔁 Job {id} requeued");
                    } else {
                        println!("❌ Job {id} is not a failed job");
                    }
                }
                QueueAction::Cancel { id } => {
                    if store.cancel(&id)? {
                        println!("🚫 Job {id} cancelled");
                    } else {
                        println!("❌ Job {id} already finished");
                    }
                }
                QueueAction::Purge { days } => {
                    let days = days.unwrap_or(config.scheduler.purge_after_days);
                    let cutoff = i64::try_from(days)
                        .ok()
                        .and_then(chrono::Duration::try_days)
                        .and_then(|retention| Utc::now().checked_sub_signed(retention))
                        .with_context(|| format!("--days {days} is out of range"))?;
                    let purged = store.purge_finished(cutoff)?;
                    println!("🧹 Purged {purged} finished jobs older than {days} days");
                }
            }
        }

        Commands::SendTest { subscriber, channel } => {
            let kind: ChannelKind = channel.parse()?;
            let store = open_store(&config)?;
            let registry = ChannelRegistry::from_config(&config.channels, store.clone())?;
            let Some(sub) = store.get_subscriber(&subscriber)? else {
                println!("❌ Unknown subscriber: {subscriber}");
                return Ok(());
            };
            let Some(ch) = registry.get(kind) else {
                println!("❌ Channel {kind} is not configured");
                return Ok(());
            };
            if !ch.can_reach(&sub) {
                println!("❌ {} has no address for {kind}", sub.id);
                return Ok(());
            }

            let notification = match store.list_content(&sub.id, 1)?.into_iter().next() {
                Some(content) => render_notification(&config.app, &sub, &content),
                None => Notification {
                    subscriber_id: sub.id.clone(),
                    title: format!("{}: test message", config.app.name),
                    body: format!("Hi {}, this is a test from {}.", sub.first_name(), config.app.name),
                    audio_url: None,
                    link: None,
                },
            };

            println!("📤 Sending via {} ({})...", kind, ch.name());
            match ch.deliver(&sub, &notification).await {
                Ok(receipt) => println!(
                    "✅ Delivered{}",
                    receipt.provider_message_id.map(|id| format!(" (id {id})")).unwrap_or_default()
                ),
                Err(e) => println!("❌ Failed ({}): {e}", if e.is_retryable() { "retryable" } else { "permanent" }),
            }
        }

        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let content = toml::to_string_pretty(&config)?;
                println!("{content}");
            }
            ConfigAction::Validate => {
                config.validate()?;
                println!("✅ Configuration is valid.");
            }
        },

        Commands::Info => {
            let c = &config.channels;
            println!("🎧 Coachcast v{}", env!("CARGO_PKG_VERSION"));
            println!("   Platform: {} / {}", std::env::consts::OS, std::env::consts::ARCH);
            println!("   Config: {}", CoachcastConfig::default_path().display());
            println!("   Database: {}", config.database.resolved_path().display());
            println!("   Default timezone: {}", config.app.default_timezone);
            println!(
                "   Gateway: {}:{} (auth {})",
                config.gateway.host,
                config.gateway.port,
                if config.gateway.api_token.is_some() { "on" } else { "off" }
            );
            println!("\n   Channels:");
            println!("   {} email     — {}", yes_no(c.email.as_ref().is_some_and(|e| e.enabled)),
                c.email.as_ref().map(|e| e.provider.to_string()).unwrap_or_else(|| "not configured".into()));
            let twilio = c.twilio.as_ref().filter(|t| t.enabled);
            println!("   {} sms       — Twilio", yes_no(twilio.is_some_and(|t| t.sms_from.is_some())));
            println!("   {} whatsapp  — Twilio", yes_no(twilio.is_some_and(|t| t.whatsapp_from.is_some())));
            println!("   {} telegram  — Bot API", yes_no(c.telegram.as_ref().is_some_and(|t| t.enabled)));
            println!("   {} push      — relay", yes_no(c.push.as_ref().is_some_and(|p| p.enabled)));
            println!("   {} in_app    — inbox", yes_no(c.in_app.enabled));
        }
    }

    Ok(())
}
