mod net;

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use glam::Vec3;

use tandem::{GameBridge, PlayerId, PlayerInfo, PositionSample};

use net::{ClientConfig, ConnectionState, LocalAvatar, NetworkClient, RemoteView, RemoteViewConfig};

#[derive(Parser)]
#[command(name = "tandem-client")]
#[command(about = "Tandem co-op game client (headless)")]
struct Args {
    #[arg(short, long, default_value = "127.0.0.1")]
    server: String,

    #[arg(short, long, default_value_t = tandem::DEFAULT_PORT)]
    port: u16,

    #[arg(short, long, default_value = "player")]
    name: String,

    #[arg(long, help = "Run the scripted co-op demo once the game starts")]
    demo: bool,
}

/// Stand-in for the externally simulated avatar: walks a slow circle so the
/// position stream carries real data.
struct ScriptedAvatar {
    start: Instant,
}

impl LocalAvatar for ScriptedAvatar {
    fn position(&self) -> Vec3 {
        let t = self.start.elapsed().as_secs_f32() * 0.5;
        Vec3::new(t.cos() * 3.0, 0.0, t.sin() * 3.0)
    }

    fn velocity(&self) -> Vec3 {
        let t = self.start.elapsed().as_secs_f32() * 0.5;
        Vec3::new(-t.sin() * 1.5, 0.0, t.cos() * 1.5)
    }
}

struct DemoBridge {
    view: RemoteView,
    now: Instant,
}

impl GameBridge for DemoBridge {
    fn apply_remote_position(&mut self, player_id: PlayerId, position: Vec3, velocity: Vec3) {
        self.view
            .apply_sample(player_id, PositionSample { position, velocity }, self.now);
    }

    fn set_key_holder(&mut self, player_id: PlayerId, held: bool) {
        if held {
            log::info!("key is now held by player {}", player_id);
        }
    }

    fn on_push_received(&mut self, player_id: PlayerId, _velocity: Vec3, duration_secs: f32) {
        log::info!("player {} got pushed for {:.2}s", player_id, duration_secs);
        self.view.note_push(player_id, duration_secs, self.now);
    }

    fn on_scene_load_requested(&mut self, scene: &str) {
        log::info!("loading scene {}", scene);
        self.view.clear();
    }

    fn on_roster_changed(&mut self, roster: &[PlayerInfo]) {
        let names: Vec<&str> = roster.iter().map(|p| p.name.as_str()).collect();
        log::info!("roster: [{}]", names.join(", "));
    }

    fn on_chat_received(&mut self, sender: &str, text: &str) {
        log::info!("[chat] {}: {}", sender, text);
    }
}

/// Walks the whole event surface on a timer: pick the key up, hand it over,
/// push the other player, finish the level and vote to continue.
fn run_demo_step(client: &mut NetworkClient, step: usize, elapsed: Duration) -> usize {
    let Some(player_id) = client.player_id() else {
        return step;
    };
    let other: PlayerId = if player_id == 1 { 2 } else { 1 };

    match step {
        0 if elapsed > Duration::from_secs(2) => {
            client.send_key_collected();
            step + 1
        }
        1 if elapsed > Duration::from_secs(4) => {
            if client.key_holder() == Some(player_id) {
                client.send_key_transfer(other);
            }
            step + 1
        }
        2 if elapsed > Duration::from_secs(6) => {
            client.send_push(other, Vec3::new(0.0, 2.0, -4.0), 0.5);
            step + 1
        }
        3 if elapsed > Duration::from_secs(8) => {
            if player_id == 1 {
                client.send_level_complete("Level2");
            }
            step + 1
        }
        4 if elapsed > Duration::from_secs(9) => {
            log::info!("voting to continue to {:?}", client.next_level());
            client.send_vote(true);
            step + 1
        }
        _ => step,
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let server: SocketAddr = format!("{}:{}", args.server, args.port)
        .parse()
        .context("invalid server address")?;

    let config = ClientConfig {
        username: args.name,
        ..ClientConfig::default()
    };

    let mut client = NetworkClient::connect(config, server)?;
    log::info!("client bound to {}", client.local_addr());

    let avatar = ScriptedAvatar {
        start: Instant::now(),
    };
    let mut bridge = DemoBridge {
        view: RemoteView::new(RemoteViewConfig::default()),
        now: Instant::now(),
    };

    let mut greeted = false;
    let mut retried = false;
    let mut game_started_at: Option<Instant> = None;
    let mut demo_step = 0;

    loop {
        let now = Instant::now();

        client.update(now, &avatar);
        bridge.view.set_local_player(client.player_id());
        bridge.now = now;
        client.drain_into(&mut bridge);
        bridge.view.update(now);

        if let Some(outcome) = client.take_vote_outcome() {
            log::info!(
                "level vote {}: next scene {}",
                if outcome.passed { "passed" } else { "failed" },
                outcome.scene
            );
        }

        if client.is_connected() && !greeted {
            greeted = true;
            log::info!(
                "joined {} ({} in lobby)",
                client.server_name().unwrap_or_else(|| "server".into()),
                client.roster().len()
            );
            client.send_chat("hello!");
            client.send_start_game();
        }

        if client.player_id().is_some() && game_started_at.is_none() {
            game_started_at = Some(now);
        }
        if args.demo {
            if let Some(started_at) = game_started_at {
                demo_step = run_demo_step(&mut client, demo_step, now.duration_since(started_at));
            }
        }

        if client.state() == ConnectionState::Disconnected {
            if !greeted && !retried {
                // One manual retry after a failed connection attempt.
                retried = true;
                client.reconnect();
            } else {
                log::info!("disconnected, exiting");
                break;
            }
        }

        std::thread::sleep(Duration::from_millis(16));
    }

    client.shutdown();
    Ok(())
}
