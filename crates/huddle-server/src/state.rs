use crate::directory::{RoomAllowList, SessionDirectory};
use crate::sfu::{Coordinator, RelaySettings, RoomLifetime, WorkerAllocator};
use crate::ws::ConnectionManager;
use config::{Environment, File};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

const DEFAULT_JWT_SECRET: &str = "dev-secret-change-in-production";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind_address: String,
    pub jwt_secret: String,
    /// Rooms users may join; absent means every room
    pub allowed_rooms: Option<Vec<Uuid>>,
    pub room_lifetime: RoomLifetime,
    pub relay: RelaySettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            jwt_secret: DEFAULT_JWT_SECRET.to_string(),
            allowed_rooms: None,
            room_lifetime: RoomLifetime::default(),
            relay: RelaySettings::default(),
        }
    }
}

impl Config {
    /// Load from an optional `huddle.toml`, then `HUDDLE_*` environment
    /// variables (`HUDDLE_RELAY__WORKERS=4`, `HUDDLE_ROOM_LIFETIME__POLICY=linger`)
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config: Config = config::Config::builder()
            .add_source(File::with_name("huddle").required(false))
            .add_source(
                Environment::with_prefix("HUDDLE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("allowed_rooms"),
            )
            .build()?
            .try_deserialize()?;

        if config.jwt_secret == DEFAULT_JWT_SECRET {
            tracing::warn!("HUDDLE_JWT_SECRET not set, using default (insecure for production!)");
        }
        if config.relay.rtc_min_port > config.relay.rtc_max_port {
            anyhow::bail!(
                "relay RTC port range {}-{} is empty",
                config.relay.rtc_min_port,
                config.relay.rtc_max_port
            );
        }

        Ok(config)
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub connections: Arc<ConnectionManager>,
    pub directory: Arc<SessionDirectory>,
    pub allocator: Arc<WorkerAllocator>,
    pub coordinator: Coordinator,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let connections = Arc::new(ConnectionManager::new());
        let directory = Arc::new(SessionDirectory::new());
        let allocator = Arc::new(WorkerAllocator::with_rtc_workers(config.relay.clone()));
        let authorizer = Arc::new(RoomAllowList::new(config.allowed_rooms.clone()));

        let coordinator = Coordinator::new(
            allocator.clone(),
            connections.clone(),
            authorizer,
            directory.clone(),
            config.room_lifetime,
        );

        Self {
            config,
            connections,
            directory,
            allocator,
            coordinator,
        }
    }
}
