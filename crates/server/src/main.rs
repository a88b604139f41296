mod config;
mod server;

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use glam::Vec3;

use tandem::{GameBridge, NetConfig, PlayerId, PlayerInfo};

use config::ServerConfig;
use server::GameServer;

#[derive(Parser)]
#[command(name = "tandem-server")]
#[command(about = "Tandem co-op game server")]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    #[arg(short, long, default_value_t = tandem::DEFAULT_PORT)]
    port: u16,

    #[arg(short, long, default_value = "Server")]
    name: String,

    #[arg(long, default_value_t = 20, help = "Position broadcast rate in Hz")]
    replication_rate: u32,

    #[arg(long, default_value_t = 5, help = "Peer silence timeout in seconds")]
    disconnection_timeout: u64,
}

/// Routes replicated results into the operator log.
struct OperatorBridge;

impl GameBridge for OperatorBridge {
    fn apply_remote_position(&mut self, _player_id: PlayerId, _position: Vec3, _velocity: Vec3) {
        // Position traffic is too chatty for the operator log.
    }

    fn set_key_holder(&mut self, player_id: PlayerId, held: bool) {
        if held {
            log::info!("key is now held by player {}", player_id);
        }
    }

    fn on_push_received(&mut self, player_id: PlayerId, velocity: Vec3, duration_secs: f32) {
        log::info!(
            "player {} pushed with velocity {:?} for {:.2}s",
            player_id,
            velocity,
            duration_secs
        );
    }

    fn on_scene_load_requested(&mut self, scene: &str) {
        log::info!("loading scene {}", scene);
    }

    fn on_roster_changed(&mut self, roster: &[PlayerInfo]) {
        let names: Vec<&str> = roster.iter().map(|p| p.name.as_str()).collect();
        log::info!("roster: [{}]", names.join(", "));
    }

    fn on_chat_received(&mut self, sender: &str, text: &str) {
        log::info!("[chat] {}: {}", sender, text);
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let config = ServerConfig {
        bind: args.bind,
        server_name: args.name,
        net: NetConfig {
            port: args.port,
            replication_rate: args.replication_rate,
            disconnection_timeout: Duration::from_secs(args.disconnection_timeout),
            ..NetConfig::default()
        },
    };

    let mut server = GameServer::new(config)?;
    log::info!("server started on {}", server.local_addr());

    let mut bridge = OperatorBridge;
    server.run(&mut bridge);

    log::info!("server shutting down");
    Ok(())
}
