//! # banchess — authoritative real-time server for the ban-chess variant
//!
//! Ban-chess is two-player chess in which every move is preceded by the
//! opponent banning one of the mover's otherwise-legal moves. This server
//! owns the rules state machine, per-player Fischer clocks, a FIFO
//! matchmaking queue, reconnection-tolerant sessions over WebSocket, a
//! hot store of live game state with pub/sub fan-out, and an asynchronous
//! archival pipeline that drains finished games into durable storage.
//!
//! ## Architecture
//!
//! - **Single-writer rooms**: each game runs as an actor; every mutation
//!   for a game flows through its inbox in FIFO order, so all observers
//!   see transitions in the same order.
//! - **Session hub**: one authenticated connection per user
//!   (last-writer-wins takeover), heartbeats, reconnect restore, and
//!   fan-out of store-channel messages to local connections.
//! - **Archiver**: buffered, batched drain of finished games (and their
//!   action/event journals) into compressed on-disk archives plus
//!   per-player aggregates. Solo games are never archived.
//!
//! ## Usage
//!
//! ```bash
//! # Start the server (WebSocket on :3001, health on :3002)
//! banchess serve
//!
//! # Custom ports / storage directory
//! banchess serve --port 4001 --health-port 4002 --data-dir /var/lib/banchess
//!
//! # Export archived games
//! banchess export --list
//! banchess export --game-id <uuid> --format pgn
//! ```
//!
//! Configuration comes from the environment (`PORT`, `HEALTH_PORT`,
//! `ALLOWED_ORIGINS`, `SESSION_SECRET`, `DATA_DIR`); CLI flags override.

pub mod archive;
pub mod auth;
pub mod clock;
pub mod config;
pub mod export;
pub mod matchmaker;
pub mod notation;
pub mod protocol;
pub mod room;
pub mod rules;
pub mod store;
pub mod ws;

use actix::Actor;
use actix_cors::Cors;
use actix_web::{App, HttpResponse, HttpServer, middleware, web};
use clap::{Parser, Subcommand};
use std::str::FromStr;
use std::time::Duration;

use crate::archive::{ArchiveStorage, Archiver};
use crate::config::ServerConfig;
use crate::matchmaker::Matchmaker;
use crate::store::HotStore;
use crate::ws::{GetStats, SessionHub, SetMatchmaker, ShutdownAll};

/// banchess — real-time server for the ban-chess variant.
#[derive(Parser, Debug)]
#[command(name = "banchess")]
#[command(about = "Authoritative real-time ban-chess server")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the WebSocket + health servers.
    Serve {
        /// WebSocket port (overrides PORT).
        #[arg(short, long)]
        port: Option<u16>,

        /// Health endpoint port (overrides HEALTH_PORT).
        #[arg(long)]
        health_port: Option<u16>,

        /// Directory for durable game storage (overrides DATA_DIR).
        #[arg(long)]
        data_dir: Option<String>,
    },

    /// Export archived games in human-readable format.
    Export {
        /// Directory for durable game storage.
        #[arg(long, default_value = "data")]
        data_dir: String,

        /// Output format: text, pgn, or json.
        #[arg(short, long, default_value = "text")]
        format: String,

        /// Export a specific game by UUID.
        #[arg(short, long)]
        game_id: Option<String>,

        /// List all archived games (no export).
        #[arg(short, long)]
        list: bool,

        /// Export all archived games.
        #[arg(short, long)]
        all: bool,

        /// Write output to a file instead of stdout.
        #[arg(short, long)]
        output: Option<String>,
    },
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            port,
            health_port,
            data_dir,
        } => {
            let mut config = ServerConfig::from_env();
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(health_port) = health_port {
                config.health_port = health_port;
            }
            if let Some(data_dir) = data_dir {
                config.data_dir = data_dir;
            }
            run_server(config).await
        }
        Commands::Export {
            data_dir,
            format,
            game_id,
            list,
            all,
            output,
        } => {
            let fmt = export::ExportFormat::from_str(&format)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
            export::run_export(
                &data_dir,
                fmt,
                game_id.as_deref(),
                list,
                all,
                output.as_deref(),
            )
            .map_err(std::io::Error::other)
        }
    }
}

/// Health endpoint: `{status, connections, activeGames, timestamp}`.
async fn health(hub: web::Data<actix::Addr<SessionHub>>) -> HttpResponse {
    match hub.send(GetStats).await {
        Ok(stats) => HttpResponse::Ok().json(serde_json::json!({
            "status": "ok",
            "connections": stats.connections,
            "activeGames": stats.active_games,
            "timestamp": clock::wall_now_ms(),
        })),
        Err(_) => HttpResponse::ServiceUnavailable().json(serde_json::json!({
            "status": "degraded",
        })),
    }
}

/// Boots the actor system and both HTTP servers.
async fn run_server(config: ServerConfig) -> std::io::Result<()> {
    let storage = ArchiveStorage::new(&config.data_dir)
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    match storage.stats() {
        Ok(stats) => log::info!(
            "durable store: {} active journal(s), {} archived game(s)",
            stats.active_count,
            stats.archived_count
        ),
        Err(e) => log::warn!("could not read storage stats: {}", e),
    }

    let store = HotStore::new();
    let archiver = Archiver::new(storage).start();
    let hub = SessionHub::new(store.clone(), archiver).start();
    let matchmaker = Matchmaker::new(store.clone(), hub.clone().recipient()).start();
    hub.do_send(SetMatchmaker(matchmaker));

    // TTL sweep for hot-store keys.
    {
        let store = store.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                if let Err(e) = store.sweep() {
                    log::error!("store sweep failed: {}", e);
                }
            }
        });
    }

    log::info!(
        "starting banchess server: ws on :{}, health on :{} ({} mode)",
        config.port,
        config.health_port,
        if config.production {
            "production"
        } else {
            "development"
        }
    );
    log::info!("allowed origins: {:?}", config.allowed_origins);

    let hub_data = web::Data::new(hub.clone());
    let config_data = web::Data::new(config.clone());

    let ws_server = {
        let hub_data = hub_data.clone();
        let config_data = config_data.clone();
        HttpServer::new(move || {
            App::new()
                .wrap(middleware::Logger::default())
                .app_data(hub_data.clone())
                .app_data(config_data.clone())
                .route("/ws", web::get().to(ws::ws_connect))
        })
        .bind(("0.0.0.0", config.port))?
        .run()
    };

    let health_server = {
        let hub_data = hub_data.clone();
        HttpServer::new(move || {
            let cors = Cors::default()
                .allow_any_origin()
                .allow_any_method()
                .max_age(3600);
            App::new()
                .wrap(cors)
                .app_data(hub_data.clone())
                .route("/health", web::get().to(health))
        })
        .bind(("0.0.0.0", config.health_port))?
        .run()
    };

    let result = tokio::try_join!(ws_server, health_server).map(|_| ());

    // Graceful shutdown: close every connection with 1000 "server
    // shutting down" and stop the rooms.
    hub.do_send(ShutdownAll);
    tokio::time::sleep(Duration::from_millis(200)).await;
    result
}
