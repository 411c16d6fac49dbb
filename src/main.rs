use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{debug, info};

use convo_sync::config::AppConfig;
use convo_sync::logging::{init_logging, OperationTimer};
use convo_sync::metrics::SyncMetrics;
use convo_sync::models::{ContentKind, ConversationKind, MediaReference, MessageContent, ParticipantRole, Profile};
use convo_sync::{ChangeFeedHub, Database, MessagingService, Session, SqliteConversationStore};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Extra configuration file layered over the defaults
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Database path (overrides configuration)
    #[arg(long, global = true)]
    database: Option<String>,

    /// Acting user
    #[arg(short, long, global = true, default_value = "")]
    user: String,

    /// Tenant (school) of the acting user
    #[arg(short, long, global = true, default_value = "")]
    tenant: String,

    /// Role of the acting user: parent, teacher, principal or admin
    #[arg(short, long, global = true, default_value = "parent")]
    role: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and register display profiles
    Init {
        /// Profile as `user_id=Display Name`; repeatable
        #[arg(long = "profile")]
        profiles: Vec<String>,
    },
    /// Start a conversation
    Start {
        /// parent-teacher, parent-principal or general
        #[arg(short, long, default_value = "parent-teacher")]
        kind: String,

        /// Participant as `user_id:role`; repeatable
        #[arg(short, long = "with", required = true)]
        with: Vec<String>,

        /// Free-text subject
        #[arg(short, long)]
        subject: Option<String>,

        /// Entity the conversation is about, e.g. a student id
        #[arg(long)]
        about: Option<String>,

        /// Reuse the latest two-party thread with the participant when one exists
        #[arg(long)]
        reuse: bool,
    },
    /// Show the inbox for the acting user and role
    Inbox,
    /// Open a thread and print its messages
    Open {
        thread_id: String,

        /// Leave the read marker untouched
        #[arg(long)]
        no_mark_read: bool,
    },
    /// Send a text or media message
    Send {
        thread_id: String,

        /// Message text
        #[arg(long, conflicts_with = "media_url")]
        text: Option<String>,

        /// URL of an uploaded voice note or image
        #[arg(long, requires = "mime_type")]
        media_url: Option<String>,

        /// MIME type of the media
        #[arg(long)]
        mime_type: Option<String>,

        /// Size of the media in bytes
        #[arg(long)]
        size_bytes: Option<u64>,

        /// Duration of a voice note in milliseconds
        #[arg(long)]
        duration_ms: Option<u64>,
    },
    /// Mark a thread as read
    Read { thread_id: String },
    /// Print the aggregate unread badge
    Badge,
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse();

    // Load configuration
    let mut config = AppConfig::load_from(cli.config.as_deref())?;
    if let Some(database) = &cli.database {
        config.database.path.clone_from(database);
    }

    // Initialize logging
    let _log_guard = init_logging(
        Some(&config.get_log_level()),
        config.logging.file_path.as_deref().map(Path::new),
        &config.logging.format,
    )?;
    SyncMetrics::init()?;

    info!("Starting convo-sync");

    match &cli.command {
        Commands::Config => print_json(&serde_json::json!({ "yaml": config.to_yaml()? })),
        Commands::Init { profiles } => init_database(&config, &cli.tenant, profiles),
        command => {
            let service = build_service(&cli, config)?;
            run_session_command(&service, command).await
        },
    }
}

/// Create the database and register profiles
fn init_database(config: &AppConfig, tenant: &str, profiles: &[String]) -> Result<()> {
    let path = config.get_database_path();
    let db = Database::with_config(&path, &config.database).context("Failed to open database")?;

    for entry in profiles {
        let (user_id, display_name) = entry
            .split_once('=')
            .with_context(|| format!("Invalid profile {entry}, expected user_id=Display Name"))?;
        db.upsert_profile(
            tenant,
            &Profile {
                user_id: user_id.trim().to_string(),
                display_name: display_name.trim().to_string(),
                avatar_url: None,
            },
        )?;
        debug!(user_id, "Registered profile");
    }

    print_json(&serde_json::json!({ "database": path, "profiles": profiles.len() }))
}

fn build_service(cli: &Cli, config: AppConfig) -> Result<MessagingService> {
    let role: ParticipantRole = cli.role.parse()?;
    let db = Database::with_config(config.get_database_path(), &config.database).context("Failed to open database")?;
    let hub = Arc::new(ChangeFeedHub::new(config.sync.feed_capacity));
    let store = SqliteConversationStore::new(db)
        .with_feed(Arc::clone(&hub))
        .with_batch_mark_read(config.sync.use_batch_mark_read);

    let session = Session::new(cli.user.clone(), cli.tenant.clone(), role);
    MessagingService::new(Arc::new(store), hub, session, config).context("Failed to start messaging session")
}

async fn run_session_command(service: &MessagingService, command: &Commands) -> Result<()> {
    let timer = OperationTimer::new("command");

    match command {
        Commands::Start {
            kind,
            with,
            subject,
            about,
            reuse,
        } => {
            let kind: ConversationKind = kind.parse()?;
            let participants = with
                .iter()
                .map(|entry| parse_participant(entry))
                .collect::<Result<Vec<_>>>()?;

            let thread = match participants.as_slice() {
                [(user_id, role)] if *reuse => service.find_or_start_direct(kind, user_id, *role).await?,
                _ => {
                    service
                        .start_conversation(kind, participants, subject.clone(), about.clone())
                        .await?
                },
            };
            print_json(&thread)?;
        },
        Commands::Inbox => print_json(&service.get_inbox().await?)?,
        Commands::Open {
            thread_id,
            no_mark_read,
        } => {
            if *no_mark_read {
                let unread = service.unread_count(thread_id).await?;
                print_json(&serde_json::json!({ "thread_id": thread_id, "unread_count": unread }))?;
            } else {
                print_json(&service.open_thread(thread_id).await?)?;
            }
        },
        Commands::Send {
            thread_id,
            text,
            media_url,
            mime_type,
            size_bytes,
            duration_ms,
        } => {
            let content = match (text, media_url) {
                (Some(text), _) => MessageContent::Text(text.clone()),
                (None, Some(url)) => {
                    let mime_type = mime_type.clone().unwrap_or_default();
                    let kind = if mime_type.starts_with("audio/") {
                        ContentKind::Voice
                    } else {
                        ContentKind::Image
                    };
                    MessageContent::Media(MediaReference {
                        kind,
                        url: url.clone(),
                        mime_type,
                        size_bytes: *size_bytes,
                        duration_ms: *duration_ms,
                    })
                },
                (None, None) => anyhow::bail!("Provide --text or --media-url"),
            };
            print_json(&service.send_message(thread_id, &content).await?)?;
        },
        Commands::Read { thread_id } => print_json(&service.mark_read(thread_id).await?)?,
        Commands::Badge => {
            let badge = service.get_unread_badge_count().await?;
            print_json(&serde_json::json!({ "user_id": service.session().user_id, "unread": badge }))?;
        },
        Commands::Config | Commands::Init { .. } => {},
    }

    timer.finish();
    Ok(())
}

/// Parse `user_id:role`
fn parse_participant(entry: &str) -> Result<(String, ParticipantRole)> {
    let (user_id, role) = entry
        .rsplit_once(':')
        .with_context(|| format!("Invalid participant {entry}, expected user_id:role"))?;
    Ok((user_id.to_string(), role.parse()?))
}

#[allow(clippy::print_stdout)]
fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
