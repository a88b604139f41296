use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use glam::Vec3;

use tandem::{
    ChatLine, DispatchQueue, Frame, GameBridge, KeyUpdate, MAIN_MENU_SCENE, Message, PlayerId,
    PlayerInfo, PositionSample, PushEvent, ReliablePacket, ReliableReceiver, ReliableSender,
    TransportSender, UdpTransport, VoteOutcome, decode, encode,
};

use super::config::ClientConfig;

/// Per-tick source of the local avatar's kinematics, owned by whatever moves
/// the player (input/physics live outside this crate).
pub trait LocalAvatar {
    fn position(&self) -> Vec3;
    fn velocity(&self) -> Vec3;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Client state written by the receive thread and read by the game loop.
#[derive(Debug)]
struct ClientShared {
    state: ConnectionState,
    server_name: Option<String>,
    player_id: Option<PlayerId>,
    roster: Vec<PlayerInfo>,
    key_holder: Option<PlayerId>,
    next_level: Option<String>,
    push_until: Option<(PlayerId, Instant)>,
    last_server_seen: Instant,
    receiver: ReliableReceiver,
}

impl ClientShared {
    fn new(now: Instant) -> Self {
        Self {
            state: ConnectionState::Connecting,
            server_name: None,
            player_id: None,
            roster: Vec::new(),
            key_holder: None,
            next_level: None,
            push_until: None,
            last_server_seen: now,
            receiver: ReliableReceiver::new(),
        }
    }
}

/// Client half of the protocol: owns the socket, the single-peer reliability
/// state and the dispatch queue. The receive thread decodes and stages;
/// `update` drives heartbeat, position replication, the retransmission sweep
/// and the two timeouts.
pub struct NetworkClient {
    transport: UdpTransport,
    sender: TransportSender,
    config: ClientConfig,
    dispatch: Arc<DispatchQueue>,
    shared: Arc<Mutex<ClientShared>>,
    reliable: Arc<Mutex<ReliableSender>>,
    connect_started: Instant,
    last_ping: Instant,
    last_position_send: Instant,
}

impl NetworkClient {
    /// Binds an ephemeral port and opens the handshake. The attempt is
    /// reported failed if no reply arrives within the connection timeout;
    /// retrying is the caller's call via [`Self::reconnect`].
    pub fn connect(config: ClientConfig, server: SocketAddr) -> io::Result<Self> {
        let mut transport = UdpTransport::bind_ephemeral(server)?;
        let sender = transport.sender()?;
        let now = Instant::now();

        let dispatch = Arc::new(DispatchQueue::new());
        let shared = Arc::new(Mutex::new(ClientShared::new(now)));
        let reliable = Arc::new(Mutex::new(ReliableSender::new()));

        let recv_shared = Arc::clone(&shared);
        let recv_reliable = Arc::clone(&reliable);
        let recv_dispatch = Arc::clone(&dispatch);
        let ack_sender = transport.sender()?;
        transport.start_receive_loop(move |bytes, _from| {
            let frame = match decode(bytes) {
                Ok(frame) => frame,
                Err(e) => {
                    log::debug!("dropping malformed datagram: {}", e);
                    return;
                }
            };
            handle_frame(
                frame,
                Instant::now(),
                &recv_shared,
                &recv_reliable,
                &recv_dispatch,
                &ack_sender,
            );
        })?;

        let mut client = Self {
            transport,
            sender,
            config,
            dispatch,
            shared,
            reliable,
            connect_started: now,
            last_ping: now,
            last_position_send: now,
        };

        log::info!("connecting to {}", server);
        client.send_username();
        Ok(client)
    }

    fn send_username(&mut self) {
        self.send_event(Message::Username {
            name: self.config.username.clone(),
        });
    }

    /// Reopens the handshake after a reported connection failure.
    pub fn reconnect(&mut self) {
        let now = Instant::now();
        {
            let mut shared = self.lock_shared();
            *shared = ClientShared::new(now);
        }
        self.reliable
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.connect_started = now;
        log::info!("retrying connection");
        self.send_username();
    }

    /// Sends one user-triggered envelope, reliability-wrapped when the
    /// variant calls for it.
    pub fn send_event(&mut self, message: Message) {
        let frame = if message.needs_ack() {
            let packet = self
                .reliable
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .wrap(message, Instant::now());
            Frame::Reliable(packet)
        } else {
            Frame::Bare(message)
        };

        match encode(&frame) {
            Ok(bytes) => self.sender.send(&bytes),
            Err(e) => log::error!("failed to encode outgoing frame: {}", e),
        }
    }

    pub fn send_chat(&mut self, text: &str) {
        self.send_event(Message::Chat {
            sender: self.config.username.clone(),
            text: text.to_string(),
        });
    }

    pub fn send_start_game(&mut self) {
        self.send_event(Message::StartGame);
    }

    pub fn send_key_collected(&mut self) {
        if let Some(player_id) = self.player_id() {
            self.send_event(Message::KeyCollected { player_id });
        }
    }

    pub fn send_key_transfer(&mut self, to_id: PlayerId) {
        if let Some(from_id) = self.player_id() {
            self.send_event(Message::KeyTransfer { from_id, to_id });
        }
    }

    pub fn send_push(&mut self, target_id: PlayerId, velocity: Vec3, duration_secs: f32) {
        self.send_event(Message::Push {
            target_id,
            velocity,
            duration_secs,
        });
    }

    pub fn send_level_complete(&mut self, next_level: &str) {
        self.send_event(Message::LevelComplete {
            next_level: next_level.to_string(),
        });
    }

    pub fn send_vote(&mut self, proceed: bool) {
        if let Some(player_id) = self.player_id() {
            self.send_event(Message::LevelTransition { player_id, proceed });
        }
    }

    /// One game-loop step: timeouts, heartbeat, position replication and the
    /// retransmission sweep.
    pub fn update(&mut self, now: Instant, avatar: &dyn LocalAvatar) {
        let (state, last_server_seen, player_id) = {
            let shared = self.lock_shared();
            (shared.state, shared.last_server_seen, shared.player_id)
        };

        match state {
            ConnectionState::Connecting => {
                if now.duration_since(self.connect_started) > self.config.net.connection_timeout {
                    log::warn!("connection attempt timed out");
                    self.lock_shared().state = ConnectionState::Disconnected;
                    return;
                }
                self.sweep(now);
            }
            ConnectionState::Connected => {
                if now.duration_since(last_server_seen) > self.config.net.disconnection_timeout {
                    log::warn!("server connection lost");
                    self.lock_shared().state = ConnectionState::Disconnected;
                    return;
                }

                if now.duration_since(self.last_ping) >= self.config.net.ping_interval {
                    self.last_ping = now;
                    self.send_event(Message::Ping);
                }

                let send_interval = std::time::Duration::from_secs_f64(
                    1.0 / self.config.position_send_rate.max(1) as f64,
                );
                if let Some(player_id) = player_id {
                    if now.duration_since(self.last_position_send) >= send_interval {
                        self.last_position_send = now;
                        self.send_event(Message::Position {
                            player_id,
                            position: avatar.position(),
                            velocity: avatar.velocity(),
                        });
                    }
                }

                self.sweep(now);

                let mut shared = self.lock_shared();
                if shared.push_until.is_some_and(|(_, until)| now >= until) {
                    shared.push_until = None;
                }
            }
            ConnectionState::Disconnected => {}
        }
    }

    fn sweep(&mut self, now: Instant) {
        let due = self
            .reliable
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sweep(now, &self.config.net.retry_policy());
        for packet in due {
            match encode(&Frame::Reliable(packet)) {
                Ok(bytes) => self.sender.send(&bytes),
                Err(e) => log::error!("failed to encode retransmit: {}", e),
            }
        }
    }

    /// Drains the dispatch queue into the bridge; the game loop calls this
    /// once per tick.
    pub fn drain_into(&self, bridge: &mut dyn GameBridge) {
        self.dispatch.drain_into(bridge);
    }

    pub fn take_vote_outcome(&self) -> Option<VoteOutcome> {
        self.dispatch.take_vote_outcome()
    }

    pub fn state(&self) -> ConnectionState {
        self.lock_shared().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn player_id(&self) -> Option<PlayerId> {
        self.lock_shared().player_id
    }

    pub fn server_name(&self) -> Option<String> {
        self.lock_shared().server_name.clone()
    }

    pub fn roster(&self) -> Vec<PlayerInfo> {
        self.lock_shared().roster.clone()
    }

    pub fn key_holder(&self) -> Option<PlayerId> {
        self.lock_shared().key_holder
    }

    pub fn next_level(&self) -> Option<String> {
        self.lock_shared().next_level.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub fn shutdown(&mut self) {
        self.transport.shutdown();
    }

    fn lock_shared(&self) -> std::sync::MutexGuard<'_, ClientShared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Receive-thread entry: acknowledge, de-duplicate, then stage the payload.
fn handle_frame(
    frame: Frame,
    now: Instant,
    shared: &Mutex<ClientShared>,
    reliable: &Mutex<ReliableSender>,
    dispatch: &DispatchQueue,
    ack_sender: &TransportSender,
) {
    shared
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .last_server_seen = now;

    let message = match frame {
        Frame::Reliable(packet) if packet.is_ack => {
            reliable
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .on_ack(packet.ack_sequence);
            return;
        }
        Frame::Reliable(packet) => {
            // ACK before processing, and again for duplicates.
            match encode(&Frame::Reliable(ReliablePacket::ack(packet.sequence))) {
                Ok(bytes) => ack_sender.send(&bytes),
                Err(e) => log::error!("failed to encode ack: {}", e),
            }

            let fresh = shared
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .receiver
                .accept(packet.sequence);
            if !fresh {
                log::debug!("re-acked duplicate packet {}", packet.sequence);
                return;
            }

            match packet.payload {
                Some(message) => message,
                None => return,
            }
        }
        Frame::Bare(message) => message,
    };

    handle_message(message, now, shared, dispatch);
}

fn handle_message(
    message: Message,
    now: Instant,
    shared: &Mutex<ClientShared>,
    dispatch: &DispatchQueue,
) {
    let mut shared = shared.lock().unwrap_or_else(PoisonError::into_inner);

    match message {
        Message::ServerName { name } => {
            if shared.state == ConnectionState::Connecting {
                log::info!("connected to server {}", name);
                shared.state = ConnectionState::Connected;
            }
            shared.server_name = Some(name);
        }
        Message::PlayerList { players } => {
            if shared.state == ConnectionState::Connecting {
                shared.state = ConnectionState::Connected;
            }
            shared.roster = players.clone();
            dispatch.stage_roster(players);
        }
        Message::PlayerJoined { player } => {
            if !shared.roster.iter().any(|p| p.name == player.name) {
                shared.roster.push(player);
            }
            dispatch.stage_roster(shared.roster.clone());
        }
        Message::PlayerLeft { player } => {
            shared.roster.retain(|p| p.name != player.name);
            dispatch.stage_roster(shared.roster.clone());
        }
        Message::Chat { sender, text } => {
            dispatch.stage_chat(ChatLine { sender, text });
        }
        Message::GameStart { player_id } => {
            log::info!("game started, playing as player {}", player_id);
            shared.player_id = Some(player_id);
        }
        Message::Position {
            player_id,
            position,
            velocity,
        } => {
            // The local avatar is locally authoritative except while pushed,
            // when the server's relayed samples are applied directly.
            let local = shared.player_id == Some(player_id);
            let pushed = shared
                .push_until
                .is_some_and(|(target, until)| target == player_id && now < until);
            if !local || pushed {
                dispatch.stage_position(player_id, PositionSample { position, velocity });
            }
        }
        Message::KeyCollected { player_id } => {
            let previous = shared.key_holder.filter(|holder| *holder != player_id);
            shared.key_holder = Some(player_id);
            dispatch.stage_key(KeyUpdate {
                holder: player_id,
                previous,
            });
        }
        Message::HideKey => {
            // Ownership travels with KEY_COLLECTED; hiding the pickup is the
            // scene's business.
            log::debug!("key hidden");
        }
        Message::KeyTransfer { from_id, to_id } => {
            shared.key_holder = Some(to_id);
            dispatch.stage_key(KeyUpdate {
                holder: to_id,
                previous: Some(from_id),
            });
        }
        Message::Push {
            target_id,
            velocity,
            duration_secs,
        } => {
            let duration = std::time::Duration::from_secs_f32(duration_secs.max(0.0));
            shared.push_until = Some((target_id, now + duration));
            dispatch.stage_push(PushEvent {
                target: target_id,
                velocity,
                duration_secs,
            });
        }
        Message::LevelComplete { next_level } => {
            log::info!("next level announced: {}", next_level);
            shared.next_level = Some(next_level);
        }
        Message::LoadScene { scene } => {
            dispatch.stage_vote_outcome(VoteOutcome {
                passed: scene != MAIN_MENU_SCENE,
                scene: scene.clone(),
            });
            shared.key_holder = None;
            shared.push_until = None;
            shared.next_level = None;
            if scene == MAIN_MENU_SCENE {
                shared.player_id = None;
            }
            dispatch.stage_scene(scene);
        }
        Message::Ping => {}
        other => {
            log::debug!("ignoring unexpected {} from server", other.tag());
        }
    }
}
