use anyhow::Context;
use clap::{Parser, Subcommand};
use parley_auth::JwtAuthority;
use parley_config::{load as load_config, AppConfig};
use parley_crypto::SymmetricKey;
use parley_gateway::{create_router, GatewayState};
use parley_protocol::{RoomId, UserId};
use parley_runtime::{shutdown_signal, telemetry, RelayServices};
use tokio::net::TcpListener;
use tracing::info;

#[derive(Parser)]
#[command(name = "parley-server")]
#[command(about = "Parley real-time message relay")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the relay (default)
    Serve,
    /// Print a bearer token for a user
    IssueToken {
        #[arg(long)]
        user: String,
        /// Lifetime in seconds, overriding `auth.token_ttl_seconds`
        #[arg(long)]
        ttl: Option<u64>,
    },
    /// Create a room, optionally bound to a key id from the keyring
    CreateRoom {
        #[arg(long)]
        room: String,
        #[arg(long)]
        key_id: Option<String>,
    },
    /// Allow a user to join a room
    AddMember {
        #[arg(long)]
        room: String,
        #[arg(long)]
        user: String,
    },
    /// Revoke a user's room membership
    RemoveMember {
        #[arg(long)]
        room: String,
        #[arg(long)]
        user: String,
    },
    /// List envelopes held for an offline user without delivering them
    Pending {
        #[arg(long)]
        user: String,
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
    /// Delete delivered envelopes older than the given number of days
    Purge {
        #[arg(long, default_value_t = 7)]
        older_than_days: u32,
    },
    /// Print a fresh base64 key for the keyring
    GenerateKey,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    telemetry::init_tracing().context("failed to initialise tracing")?;

    if let Some(Commands::GenerateKey) = cli.command {
        println!("{}", SymmetricKey::generate().to_base64());
        return Ok(());
    }

    let config = load_config().context("failed to load configuration")?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => run_server(config).await,
        Commands::IssueToken { user, ttl } => issue_token(&config, user, ttl).await,
        Commands::CreateRoom { room, key_id } => create_room(&config, room, key_id).await,
        Commands::AddMember { room, user } => add_member(&config, room, user).await,
        Commands::RemoveMember { room, user } => remove_member(&config, room, user).await,
        Commands::Pending { user, limit } => list_pending(&config, user, limit).await,
        Commands::Purge { older_than_days } => purge(&config, older_than_days).await,
        Commands::GenerateKey => Ok(()),
    }
}

async fn initialise(config: &AppConfig) -> anyhow::Result<RelayServices> {
    RelayServices::initialise(config)
        .await
        .context("failed to initialise relay services")
}

async fn run_server(config: AppConfig) -> anyhow::Result<()> {
    info!("starting Parley relay");

    let services = initialise(&config).await?;
    let state = GatewayState::new(services.relay.clone(), config.relay.clone())
        .with_pending(services.envelopes.clone());
    let app = create_router(state);

    let address = format!("{}:{}", config.http.address, config.http.port);
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind http listener on {address}"))?;

    info!(%address, "relay listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server error")?;

    info!("relay shut down");
    Ok(())
}

async fn issue_token(config: &AppConfig, user: String, ttl: Option<u64>) -> anyhow::Result<()> {
    let mut auth = config.auth.clone();
    if let Some(seconds) = ttl {
        auth.token_ttl_seconds = seconds;
    }

    let token = JwtAuthority::from_config(&auth)
        .issue_token(&UserId::new(user))
        .context("failed to issue token")?;

    println!("{token}");
    Ok(())
}

async fn create_room(
    config: &AppConfig,
    room: String,
    key_id: Option<String>,
) -> anyhow::Result<()> {
    let services = initialise(config).await?;
    let room = RoomId::new(room);

    if let Some(key_id) = &key_id {
        if !config.keys.keyring.contains_key(key_id) {
            println!("warning: key id {key_id} is not in the configured keyring");
        }
    }

    let created = services
        .rooms
        .create(&room, key_id.as_deref())
        .await
        .context("failed to create room")?;
    if created {
        println!("room {room} created");
    } else {
        println!("room {room} already exists");
    }
    Ok(())
}

async fn add_member(config: &AppConfig, room: String, user: String) -> anyhow::Result<()> {
    let services = initialise(config).await?;
    let (room, user) = (RoomId::new(room), UserId::new(user));

    let added = services
        .rooms
        .add_member(&room, &user)
        .await
        .context("failed to add member")?;
    if added {
        println!("{user} added to {room}");
    } else {
        println!("{user} is already a member of {room}");
    }
    Ok(())
}

async fn remove_member(config: &AppConfig, room: String, user: String) -> anyhow::Result<()> {
    let services = initialise(config).await?;
    let (room, user) = (RoomId::new(room), UserId::new(user));

    let removed = services
        .rooms
        .remove_member(&room, &user)
        .await
        .context("failed to remove member")?;
    if removed {
        println!("{user} removed from {room}");
    } else {
        println!("{user} was not a member of {room}");
    }
    Ok(())
}

async fn list_pending(config: &AppConfig, user: String, limit: u32) -> anyhow::Result<()> {
    let services = initialise(config).await?;
    let user = UserId::new(user);

    let total = services
        .envelopes
        .pending_count(&user)
        .await
        .context("failed to count pending envelopes")?;
    let pending = services
        .envelopes
        .list_pending(&user, limit)
        .await
        .context("failed to list pending envelopes")?;

    println!("{total} pending envelope(s) for {user}");
    if pending.is_empty() {
        return Ok(());
    }

    println!("{:<6} {:<28} {:<16} {:<10}", "ID", "Stored At", "Sender", "Encrypted");
    println!("{}", "-".repeat(64));
    for stored in pending {
        let sender = stored
            .envelope
            .sender
            .as_ref()
            .map(UserId::as_str)
            .unwrap_or("-");
        println!(
            "{:<6} {:<28} {:<16} {:<10}",
            stored.id,
            stored.created_at.to_rfc3339(),
            sender,
            stored.envelope.is_encrypted()
        );
    }
    Ok(())
}

async fn purge(config: &AppConfig, older_than_days: u32) -> anyhow::Result<()> {
    let services = initialise(config).await?;
    let cutoff = chrono::Utc::now() - chrono::Duration::days(i64::from(older_than_days));

    let removed = services
        .envelopes
        .purge_delivered(cutoff)
        .await
        .context("failed to purge delivered envelopes")?;
    println!("{removed} delivered envelope(s) removed");
    Ok(())
}
