use std::sync::Arc;

use anyhow::{Context, Result};
use parley_auth::JwtAuthority;
use parley_config::AppConfig;
use parley_database::{initialize_database, EnvelopeRepository, RoomRepository};
use parley_relay::{Collaborators, Relay, RelaySettings};
use sqlx::SqlitePool;
use tracing::info;

pub mod keys;

pub use keys::RoomKeyring;

pub mod telemetry {
    use anyhow::Result;
    use tracing::Level;
    use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

    pub fn init_tracing() -> Result<()> {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let subscriber = SubscriberBuilder::default()
            .with_max_level(Level::TRACE)
            .with_env_filter(env_filter)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .map_err(|error| anyhow::anyhow!("failed to set tracing subscriber: {error}"))
    }
}

/// The relay and the SQLite-backed collaborators it runs against.
#[derive(Clone)]
pub struct RelayServices {
    pub db_pool: SqlitePool,
    pub authority: Arc<JwtAuthority>,
    pub rooms: RoomRepository,
    pub envelopes: EnvelopeRepository,
    pub relay: Arc<Relay>,
}

impl RelayServices {
    pub async fn initialise(config: &AppConfig) -> Result<Self> {
        let db_pool = initialize_database(&config.database)
            .await
            .context("failed to initialise database")?;

        let authority = Arc::new(JwtAuthority::from_config(&config.auth));
        let rooms = RoomRepository::new(db_pool.clone());
        let envelopes = EnvelopeRepository::new(db_pool.clone());
        let keyring = RoomKeyring::from_config(rooms.clone(), &config.keys)
            .context("invalid room keyring")?;
        let key_count = keyring.len();

        let collaborators = Collaborators {
            verifier: authority.clone(),
            directory: Arc::new(rooms.clone()),
            keys: Arc::new(keyring),
            offline: Some(Arc::new(envelopes.clone())),
        };
        let relay = Arc::new(Relay::new(
            collaborators,
            RelaySettings::from(&config.relay),
        ));

        info!(
            keys = key_count,
            echo_to_sender = config.relay.echo_to_sender,
            verify_encrypted = config.relay.verify_encrypted,
            "relay services ready"
        );

        Ok(Self {
            db_pool,
            authority,
            rooms,
            envelopes,
            relay,
        })
    }
}

pub async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!(?error, "failed to listen for shutdown signal");
    }
    info!("shutdown signal received");
}
