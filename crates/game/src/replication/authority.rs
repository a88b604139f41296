use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use glam::Vec3;

use crate::config::NetConfig;
use crate::dispatch::{ChatLine, DispatchQueue, KeyUpdate, PushEvent, VoteOutcome};
use crate::net::codec::{self, Frame};
use crate::net::protocol::{MAIN_MENU_SCENE, MAX_PLAYERS, Message, PlayerId};
use crate::net::reliable::ReliablePacket;
use crate::net::session::SessionTable;
use crate::net::transport::TransportSender;
use crate::replication::state::{GamePhase, GameState, PositionSample, PushWindow};

/// One frame bound for one peer. The engine never touches a socket; callers
/// transmit the batch after releasing the engine lock.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub to: SocketAddr,
    pub frame: Frame,
}

impl Outbound {
    pub fn transmit(&self, sender: &TransportSender) {
        match codec::encode(&self.frame) {
            Ok(bytes) => sender.send_to(&bytes, self.to),
            Err(e) => log::error!("failed to encode outbound frame: {}", e),
        }
    }
}

pub fn transmit_all(sender: &TransportSender, batch: &[Outbound]) {
    for outbound in batch {
        outbound.transmit(sender);
    }
}

/// Server-authoritative replication and arbitration. Inbound frames mutate
/// the authoritative state and produce corrective or broadcast traffic;
/// `tick` drives heartbeats, the position broadcast, timeout eviction and the
/// retransmission sweep. Consumer-facing results are staged on the dispatch
/// queue.
pub struct ReplicationEngine {
    server_name: String,
    config: NetConfig,
    sessions: SessionTable,
    state: GameState,
    dispatch: Arc<DispatchQueue>,
    last_ping: Option<Instant>,
    last_replication: Option<Instant>,
}

impl ReplicationEngine {
    pub fn new(server_name: String, config: NetConfig, dispatch: Arc<DispatchQueue>) -> Self {
        // The protocol is two-peer; min_players only gates game start.
        Self {
            server_name,
            config,
            sessions: SessionTable::new(MAX_PLAYERS),
            state: GameState::new(),
            dispatch,
            last_ping: None,
            last_replication: None,
        }
    }

    pub fn phase(&self) -> GamePhase {
        self.state.phase
    }

    pub fn key_holder(&self) -> Option<PlayerId> {
        self.state.key_holder
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn state(&self) -> &GameState {
        &self.state
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    /// Drops every session and returns to an empty lobby.
    pub fn reset(&mut self) {
        self.sessions.clear();
        self.state.reset();
        self.dispatch.clear();
        log::info!("server state reset");
    }

    /// Decodes and handles one datagram. Malformed input is a dropped packet,
    /// never an error to the caller.
    pub fn handle_datagram(&mut self, from: SocketAddr, bytes: &[u8], now: Instant) -> Vec<Outbound> {
        match codec::decode(bytes) {
            Ok(frame) => self.handle_frame(from, frame, now),
            Err(e) => {
                log::debug!("dropping malformed datagram from {}: {}", from, e);
                Vec::new()
            }
        }
    }

    pub fn handle_frame(&mut self, from: SocketAddr, frame: Frame, now: Instant) -> Vec<Outbound> {
        let mut out = Vec::new();

        // Any first packet from an unseen address creates the session; at
        // capacity the packet is dropped without touching existing state.
        match self.sessions.get_or_create(from, now) {
            Ok(proxy) => proxy.touch(now),
            Err(reason) => {
                log::info!("dropping packet from {}: {}", from, reason);
                return out;
            }
        }

        let message = match frame {
            Frame::Reliable(packet) if packet.is_ack => {
                if let Some(proxy) = self.sessions.get_mut(&from) {
                    proxy.sender.on_ack(packet.ack_sequence);
                }
                return out;
            }
            Frame::Reliable(packet) => {
                // Acknowledge first, independent of payload processing.
                out.push(Outbound {
                    to: from,
                    frame: Frame::Reliable(ReliablePacket::ack(packet.sequence)),
                });

                let fresh = self
                    .sessions
                    .get_mut(&from)
                    .is_some_and(|p| p.receiver.accept(packet.sequence));
                if !fresh {
                    log::debug!(
                        "re-acked duplicate reliable packet {} from {}",
                        packet.sequence,
                        from
                    );
                    return out;
                }

                match packet.payload {
                    Some(message) => message,
                    None => return out,
                }
            }
            Frame::Bare(message) => message,
        };

        out.extend(self.handle_message(from, message, now));
        out
    }

    fn handle_message(&mut self, from: SocketAddr, message: Message, now: Instant) -> Vec<Outbound> {
        match message {
            Message::Username { name } => self.handle_username(from, &name, now),
            Message::Chat { text, .. } => self.handle_chat(from, text, now),
            Message::StartGame => self.handle_start_game(now),
            Message::Position {
                position, velocity, ..
            } => self.handle_position(from, position, velocity),
            Message::KeyCollected { .. } => self.handle_key_collected(from, now),
            Message::KeyTransfer { from_id, to_id } => {
                self.handle_key_transfer(from_id, to_id, now)
            }
            Message::Push {
                target_id,
                velocity,
                duration_secs,
            } => self.handle_push(target_id, velocity, duration_secs, now),
            Message::LevelComplete { next_level } => self.handle_level_complete(next_level, now),
            Message::LevelTransition { proceed, .. } => self.handle_vote(from, proceed, now),
            Message::Ping => Vec::new(),
            other => {
                log::debug!("ignoring unexpected {} from {}", other.tag(), from);
                Vec::new()
            }
        }
    }

    fn handle_username(&mut self, from: SocketAddr, name: &str, now: Instant) -> Vec<Outbound> {
        let Some(proxy) = self.sessions.get_mut(&from) else {
            return Vec::new();
        };
        let newly_named = proxy.set_username(name);
        if newly_named {
            log::info!("{} identified as {}", from, name);
        }

        let mut out = Vec::new();

        // Handshake reply; repeated for retransmitted USERNAMEs so a lossy
        // join still converges.
        let server_name = self.server_name.clone();
        out.extend(self.reliable_to(from, Message::ServerName { name: server_name }, now));
        let roster = self.sessions.roster();
        out.extend(self.reliable_to(
            from,
            Message::PlayerList {
                players: roster.clone(),
            },
            now,
        ));

        if newly_named {
            if let Some(info) = self.sessions.get(&from).map(|p| p.info()) {
                out.extend(self.broadcast_reliable_except(
                    from,
                    &Message::PlayerJoined { player: info },
                    now,
                ));
            }
            self.dispatch.stage_roster(roster);
        }

        out
    }

    fn handle_chat(&mut self, from: SocketAddr, text: String, now: Instant) -> Vec<Outbound> {
        let Some(sender_name) = self.sessions.get(&from).map(|p| p.display_name().to_string())
        else {
            return Vec::new();
        };

        self.dispatch.stage_chat(ChatLine {
            sender: sender_name.clone(),
            text: text.clone(),
        });

        self.broadcast_reliable_except(
            from,
            &Message::Chat {
                sender: sender_name,
                text,
            },
            now,
        )
    }

    fn handle_start_game(&mut self, now: Instant) -> Vec<Outbound> {
        if self.state.phase != GamePhase::Lobby {
            log::debug!("ignoring start request: game already running");
            return Vec::new();
        }
        if self.sessions.len() < self.config.min_players {
            log::debug!(
                "ignoring start request with {}/{} players",
                self.sessions.len(),
                self.config.min_players
            );
            return Vec::new();
        }
        if !self.sessions.names_are_unique() {
            log::warn!("ignoring start request: players are not uniquely named");
            return Vec::new();
        }

        self.state.reset_round();
        self.state.phase = GamePhase::GameStarted;

        let addrs: Vec<SocketAddr> = self.sessions.iter().map(|p| p.addr).collect();
        let mut out = Vec::new();
        for (index, addr) in addrs.iter().enumerate() {
            let player_id = (index + 1) as PlayerId;
            if let Some(proxy) = self.sessions.get_mut(addr) {
                proxy.player_id = player_id;
            }
            out.extend(self.reliable_to(*addr, Message::GameStart { player_id }, now));
        }

        self.dispatch.stage_roster(self.sessions.roster());
        log::info!("game started with {} players", addrs.len());
        out
    }

    fn handle_position(&mut self, from: SocketAddr, position: Vec3, velocity: Vec3) -> Vec<Outbound> {
        if self.state.phase != GamePhase::GameStarted {
            return Vec::new();
        }
        // The session's assigned ID is authoritative, not the claimed one.
        let Some(player_id) = self.sessions.get(&from).map(|p| p.player_id) else {
            return Vec::new();
        };
        if player_id == 0 {
            return Vec::new();
        }

        let sample = PositionSample { position, velocity };
        self.state.positions.insert(player_id, sample);
        self.dispatch.stage_position(player_id, sample);
        Vec::new()
    }

    fn handle_key_collected(&mut self, from: SocketAddr, now: Instant) -> Vec<Outbound> {
        if self.state.phase != GamePhase::GameStarted {
            log::debug!("ignoring key pickup outside a running game");
            return Vec::new();
        }
        let Some(requester) = self
            .sessions
            .get(&from)
            .map(|p| p.player_id)
            .filter(|id| *id != 0)
        else {
            return Vec::new();
        };

        match self.state.key_holder {
            None => {
                self.state.key_holder = Some(requester);
                log::info!("key granted to player {}", requester);

                let mut out = self.broadcast_reliable(
                    &Message::KeyCollected {
                        player_id: requester,
                    },
                    now,
                );
                out.extend(self.broadcast_reliable(&Message::HideKey, now));
                self.dispatch.stage_key(KeyUpdate {
                    holder: requester,
                    previous: None,
                });
                out
            }
            Some(holder) if holder == requester => Vec::new(),
            Some(holder) => {
                // Lost the race; correct only the requester. Both clients
                // believed they grabbed the key, receipt order decided.
                log::info!("key denied to player {}, held by {}", requester, holder);

                let mut out = self.reliable_to(from, Message::HideKey, now);
                out.extend(self.reliable_to(
                    from,
                    Message::KeyCollected { player_id: holder },
                    now,
                ));
                out
            }
        }
    }

    fn handle_key_transfer(
        &mut self,
        from_id: PlayerId,
        to_id: PlayerId,
        now: Instant,
    ) -> Vec<Outbound> {
        if self.state.phase != GamePhase::GameStarted {
            return Vec::new();
        }
        if self.state.key_holder != Some(from_id) {
            // No correction needed: the requester's view is overwritten by
            // the next authoritative broadcast.
            log::debug!(
                "rejecting key transfer {} -> {}: source does not hold the key",
                from_id,
                to_id
            );
            return Vec::new();
        }
        if self.sessions.by_player_id(to_id).is_none() {
            log::debug!("rejecting key transfer to unknown player {}", to_id);
            return Vec::new();
        }

        self.state.key_holder = Some(to_id);
        log::info!("key transferred from player {} to {}", from_id, to_id);
        self.dispatch.stage_key(KeyUpdate {
            holder: to_id,
            previous: Some(from_id),
        });
        self.broadcast_reliable(&Message::KeyTransfer { from_id, to_id }, now)
    }

    fn handle_push(
        &mut self,
        target_id: PlayerId,
        velocity: Vec3,
        duration_secs: f32,
        now: Instant,
    ) -> Vec<Outbound> {
        if self.state.phase != GamePhase::GameStarted {
            return Vec::new();
        }
        if self.sessions.by_player_id(target_id).is_none() {
            log::debug!("ignoring push against unknown player {}", target_id);
            return Vec::new();
        }

        // Trusted as sent; there is no physical validation of pushes.
        let duration = Duration::from_secs_f32(duration_secs.max(0.0));
        self.state.push = Some(PushWindow {
            target: target_id,
            velocity,
            until: now + duration,
        });
        self.dispatch.stage_push(PushEvent {
            target: target_id,
            velocity,
            duration_secs,
        });
        log::debug!("player {} pushed for {:.2}s", target_id, duration_secs);
        self.broadcast_reliable(
            &Message::Push {
                target_id,
                velocity,
                duration_secs,
            },
            now,
        )
    }

    fn handle_level_complete(&mut self, next_level: String, now: Instant) -> Vec<Outbound> {
        if self.state.phase != GamePhase::GameStarted {
            return Vec::new();
        }

        log::info!("next level announced: {}", next_level);
        self.state.next_level = Some(next_level.clone());
        // Echoed to every peer, announcer included, so both clients know the
        // pending level before voting.
        self.broadcast_reliable(&Message::LevelComplete { next_level }, now)
    }

    fn handle_vote(&mut self, from: SocketAddr, proceed: bool, now: Instant) -> Vec<Outbound> {
        if self.state.phase != GamePhase::GameStarted {
            log::debug!("ignoring level vote outside a running game");
            return Vec::new();
        }
        let Some(voter) = self
            .sessions
            .get(&from)
            .map(|p| p.player_id)
            .filter(|id| *id != 0)
        else {
            return Vec::new();
        };

        if self.state.votes.contains_key(&voter) {
            log::debug!("ignoring repeat vote from player {}", voter);
            return Vec::new();
        }

        self.state.votes.insert(voter, proceed);
        log::info!(
            "player {} voted to {}",
            voter,
            if proceed { "continue" } else { "stop" }
        );
        self.try_resolve_votes(now)
    }

    /// Resolves the vote once every active player has cast one.
    fn try_resolve_votes(&mut self, now: Instant) -> Vec<Outbound> {
        let active: Vec<PlayerId> = self
            .sessions
            .iter()
            .map(|p| p.player_id)
            .filter(|id| *id != 0)
            .collect();

        if active.is_empty()
            || !active.iter().all(|id| self.state.votes.contains_key(id))
        {
            return Vec::new();
        }

        let passed = self.state.votes.values().all(|v| *v);
        let scene = if passed {
            match self.state.next_level.clone() {
                Some(level) => level,
                None => {
                    log::warn!("vote passed with no announced next level");
                    MAIN_MENU_SCENE.to_string()
                }
            }
        } else {
            MAIN_MENU_SCENE.to_string()
        };

        log::info!("level vote resolved, loading {}", scene);
        let out = self.broadcast_reliable(
            &Message::LoadScene {
                scene: scene.clone(),
            },
            now,
        );

        self.dispatch.stage_vote_outcome(VoteOutcome {
            passed,
            scene: scene.clone(),
        });
        self.dispatch.stage_scene(scene.clone());

        if scene == MAIN_MENU_SCENE {
            self.state.reset();
            for proxy in self.sessions.iter_mut() {
                proxy.player_id = 0;
            }
        } else {
            self.state.reset_round();
        }

        out
    }

    pub fn tick(&mut self, now: Instant) -> Vec<Outbound> {
        let mut out = Vec::new();

        let evicted = self
            .sessions
            .evict_timed_out(now, self.config.disconnection_timeout);
        if !evicted.is_empty() {
            for proxy in &evicted {
                log::info!("session {} ({}) timed out", proxy.addr, proxy.display_name());
                if proxy.username.is_some() {
                    out.extend(self.broadcast_reliable(
                        &Message::PlayerLeft {
                            player: proxy.info(),
                        },
                        now,
                    ));
                }

                let id = proxy.player_id;
                if id != 0 {
                    if self.state.key_holder == Some(id) {
                        self.state.key_holder = None;
                    }
                    self.state.votes.remove(&id);
                    if self.state.push.is_some_and(|p| p.target == id) {
                        self.state.push = None;
                    }
                    self.state.positions.remove(&id);
                }
            }
            self.dispatch.stage_roster(self.sessions.roster());
            // A departure can complete a pending vote.
            out.extend(self.try_resolve_votes(now));
        }

        self.state.expire_push(now);

        if self
            .last_ping
            .is_none_or(|t| now.duration_since(t) >= self.config.ping_interval)
        {
            self.last_ping = Some(now);
            out.extend(self.broadcast_bare(&Message::Ping));
        }

        if self.state.phase == GamePhase::GameStarted
            && self
                .last_replication
                .is_none_or(|t| now.duration_since(t) >= self.config.replication_interval())
        {
            self.last_replication = Some(now);

            let mut samples: Vec<(PlayerId, PositionSample)> = self
                .state
                .positions
                .iter()
                .map(|(id, sample)| (*id, *sample))
                .collect();
            samples.sort_by_key(|(id, _)| *id);

            for (player_id, sample) in samples {
                out.extend(self.broadcast_bare(&Message::Position {
                    player_id,
                    position: sample.position,
                    velocity: sample.velocity,
                }));
            }
        }

        let policy = self.config.retry_policy();
        for proxy in self.sessions.iter_mut() {
            for packet in proxy.sender.sweep(now, &policy) {
                out.push(Outbound {
                    to: proxy.addr,
                    frame: Frame::Reliable(packet),
                });
            }
        }

        out
    }

    fn reliable_to(&mut self, addr: SocketAddr, message: Message, now: Instant) -> Vec<Outbound> {
        match self.sessions.get_mut(&addr) {
            Some(proxy) => vec![Outbound {
                to: addr,
                frame: Frame::Reliable(proxy.sender.wrap(message, now)),
            }],
            None => Vec::new(),
        }
    }

    fn broadcast_reliable(&mut self, message: &Message, now: Instant) -> Vec<Outbound> {
        self.sessions
            .iter_mut()
            .map(|proxy| Outbound {
                to: proxy.addr,
                frame: Frame::Reliable(proxy.sender.wrap(message.clone(), now)),
            })
            .collect()
    }

    fn broadcast_reliable_except(
        &mut self,
        except: SocketAddr,
        message: &Message,
        now: Instant,
    ) -> Vec<Outbound> {
        self.sessions
            .iter_mut()
            .filter(|proxy| proxy.addr != except)
            .map(|proxy| Outbound {
                to: proxy.addr,
                frame: Frame::Reliable(proxy.sender.wrap(message.clone(), now)),
            })
            .collect()
    }

    fn broadcast_bare(&self, message: &Message) -> Vec<Outbound> {
        self.sessions
            .iter()
            .map(|proxy| Outbound {
                to: proxy.addr,
                frame: Frame::Bare(message.clone()),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn engine() -> ReplicationEngine {
        ReplicationEngine::new(
            "test-server".into(),
            NetConfig::default(),
            Arc::new(DispatchQueue::new()),
        )
    }

    fn bare(message: Message) -> Frame {
        Frame::Bare(message)
    }

    /// Runs the lobby handshake for two players and starts the game.
    fn started_engine() -> (ReplicationEngine, SocketAddr, SocketAddr) {
        let mut engine = engine();
        let now = Instant::now();
        let alice = addr(6001);
        let bob = addr(6002);

        engine.handle_frame(alice, bare(Message::Username { name: "alice".into() }), now);
        engine.handle_frame(bob, bare(Message::Username { name: "bob".into() }), now);
        let out = engine.handle_frame(alice, bare(Message::StartGame), now);

        let ids: Vec<PlayerId> = out
            .iter()
            .filter_map(|o| match o.frame.payload() {
                Some(Message::GameStart { player_id }) => Some(*player_id),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(engine.phase(), GamePhase::GameStarted);

        (engine, alice, bob)
    }

    fn payloads_for<'a>(out: &'a [Outbound], to: SocketAddr) -> Vec<&'a Message> {
        out.iter()
            .filter(|o| o.to == to)
            .filter_map(|o| o.frame.payload())
            .collect()
    }

    #[test]
    fn test_handshake_replies_and_join_broadcast() {
        let mut engine = engine();
        let now = Instant::now();
        let alice = addr(6001);
        let bob = addr(6002);

        let out = engine.handle_frame(alice, bare(Message::Username { name: "alice".into() }), now);
        let to_alice = payloads_for(&out, alice);
        assert!(matches!(to_alice[0], Message::ServerName { name } if name == "test-server"));
        assert!(matches!(to_alice[1], Message::PlayerList { players } if players.len() == 1));

        let out = engine.handle_frame(bob, bare(Message::Username { name: "bob".into() }), now);
        let joined: Vec<&Message> = payloads_for(&out, alice);
        assert!(
            matches!(joined[0], Message::PlayerJoined { player } if player.name == "bob"),
            "existing peer should learn about the new one"
        );
    }

    #[test]
    fn test_third_handshake_rejected_without_mutation() {
        let (mut engine, _, _) = started_engine();
        let now = Instant::now();

        let out = engine.handle_frame(
            addr(6003),
            bare(Message::Username { name: "eve".into() }),
            now,
        );

        assert!(out.is_empty());
        assert_eq!(engine.session_count(), 2);
        assert_eq!(engine.phase(), GamePhase::GameStarted);
    }

    #[test]
    fn test_min_players_does_not_shrink_capacity() {
        let mut engine = ReplicationEngine::new(
            "test-server".into(),
            NetConfig {
                min_players: 1,
                ..NetConfig::default()
            },
            Arc::new(DispatchQueue::new()),
        );
        let now = Instant::now();

        engine.handle_frame(addr(6001), bare(Message::Username { name: "alice".into() }), now);
        let out = engine.handle_frame(addr(6002), bare(Message::Username { name: "bob".into() }), now);

        assert_eq!(engine.session_count(), 2);
        assert!(
            payloads_for(&out, addr(6002))
                .iter()
                .any(|m| matches!(m, Message::ServerName { .. })),
            "second peer is admitted regardless of the start threshold"
        );
    }

    #[test]
    fn test_start_requires_two_uniquely_named_players() {
        let mut engine = engine();
        let now = Instant::now();
        let alice = addr(6001);
        let bob = addr(6002);

        engine.handle_frame(alice, bare(Message::Username { name: "alice".into() }), now);
        assert!(engine.handle_frame(alice, bare(Message::StartGame), now).is_empty());

        engine.handle_frame(bob, bare(Message::Username { name: "alice".into() }), now);
        assert!(engine.handle_frame(alice, bare(Message::StartGame), now).is_empty());
        assert_eq!(engine.phase(), GamePhase::Lobby);
    }

    #[test]
    fn test_key_race_first_request_wins() {
        let (mut engine, alice, bob) = started_engine();
        let now = Instant::now();

        // Alice's pickup arrives first and is authorized for everyone.
        let out = engine.handle_frame(alice, bare(Message::KeyCollected { player_id: 1 }), now);
        assert_eq!(engine.key_holder(), Some(1));
        let to_bob = payloads_for(&out, bob);
        assert!(matches!(to_bob[0], Message::KeyCollected { player_id: 1 }));
        assert!(matches!(to_bob[1], Message::HideKey));

        // Bob raced and lost: the correction goes only to him.
        let out = engine.handle_frame(bob, bare(Message::KeyCollected { player_id: 2 }), now);
        assert_eq!(engine.key_holder(), Some(1));
        assert!(payloads_for(&out, alice).is_empty());
        let to_bob = payloads_for(&out, bob);
        assert!(matches!(to_bob[0], Message::HideKey));
        assert!(matches!(to_bob[1], Message::KeyCollected { player_id: 1 }));
    }

    #[test]
    fn test_key_transfer_from_non_holder_rejected() {
        let (mut engine, alice, bob) = started_engine();
        let now = Instant::now();

        engine.handle_frame(alice, bare(Message::KeyCollected { player_id: 1 }), now);

        let out = engine.handle_frame(
            bob,
            bare(Message::KeyTransfer {
                from_id: 2,
                to_id: 1,
            }),
            now,
        );
        assert!(out.is_empty());
        assert_eq!(engine.key_holder(), Some(1));

        let out = engine.handle_frame(
            alice,
            bare(Message::KeyTransfer {
                from_id: 1,
                to_id: 2,
            }),
            now,
        );
        assert_eq!(engine.key_holder(), Some(2));
        assert!(
            payloads_for(&out, bob)
                .iter()
                .any(|m| matches!(m, Message::KeyTransfer { from_id: 1, to_id: 2 }))
        );
    }

    #[test]
    fn test_push_is_trusted_and_rebroadcast() {
        let (mut engine, alice, bob) = started_engine();
        let now = Instant::now();

        let out = engine.handle_frame(
            alice,
            bare(Message::Push {
                target_id: 2,
                velocity: Vec3::new(0.0, 2.0, -4.0),
                duration_secs: 0.5,
            }),
            now,
        );

        assert!(engine.state().is_pushed(2, now));
        for peer in [alice, bob] {
            assert!(
                payloads_for(&out, peer)
                    .iter()
                    .any(|m| matches!(m, Message::Push { target_id: 2, .. }))
            );
        }
    }

    #[test]
    fn test_vote_rejected_loads_main_menu() {
        let (mut engine, alice, bob) = started_engine();
        let now = Instant::now();

        engine.handle_frame(
            alice,
            bare(Message::LevelComplete {
                next_level: "Level2".into(),
            }),
            now,
        );

        let out = engine.handle_frame(
            alice,
            bare(Message::LevelTransition {
                player_id: 1,
                proceed: true,
            }),
            now,
        );
        assert!(out.is_empty(), "vote must not resolve until both are in");

        let out = engine.handle_frame(
            bob,
            bare(Message::LevelTransition {
                player_id: 2,
                proceed: false,
            }),
            now,
        );

        for peer in [alice, bob] {
            assert!(
                payloads_for(&out, peer)
                    .iter()
                    .any(|m| matches!(m, Message::LoadScene { scene } if scene == MAIN_MENU_SCENE))
            );
        }
        assert!(engine.state().votes.is_empty());
        assert_eq!(engine.phase(), GamePhase::Lobby);
    }

    #[test]
    fn test_unanimous_vote_loads_next_level() {
        let (mut engine, alice, bob) = started_engine();
        let now = Instant::now();

        let out = engine.handle_frame(
            bob,
            bare(Message::LevelComplete {
                next_level: "Level2".into(),
            }),
            now,
        );
        // The announcement reaches every peer, the announcer included.
        for peer in [alice, bob] {
            assert!(
                payloads_for(&out, peer)
                    .iter()
                    .any(|m| matches!(m, Message::LevelComplete { next_level } if next_level == "Level2"))
            );
        }

        engine.handle_frame(
            alice,
            bare(Message::LevelTransition {
                player_id: 1,
                proceed: true,
            }),
            now,
        );
        let out = engine.handle_frame(
            bob,
            bare(Message::LevelTransition {
                player_id: 2,
                proceed: true,
            }),
            now,
        );

        assert!(
            payloads_for(&out, alice)
                .iter()
                .any(|m| matches!(m, Message::LoadScene { scene } if scene == "Level2"))
        );
        assert!(engine.state().votes.is_empty());
        assert!(engine.state().next_level.is_none());
        assert_eq!(engine.phase(), GamePhase::GameStarted);
    }

    #[test]
    fn test_repeat_vote_ignored() {
        let (mut engine, alice, _) = started_engine();
        let now = Instant::now();

        engine.handle_frame(
            alice,
            bare(Message::LevelTransition {
                player_id: 1,
                proceed: false,
            }),
            now,
        );
        let out = engine.handle_frame(
            alice,
            bare(Message::LevelTransition {
                player_id: 1,
                proceed: true,
            }),
            now,
        );

        assert!(out.is_empty());
        assert_eq!(engine.state().votes.get(&1), Some(&false));
    }

    #[test]
    fn test_timeout_evicts_with_single_player_left_broadcast() {
        let (mut engine, alice, bob) = started_engine();
        let start = Instant::now();

        // Bob keeps talking, alice goes silent.
        let later = start + Duration::from_secs(4);
        engine.handle_frame(bob, bare(Message::Ping), later);

        let past_timeout = start + Duration::from_secs(6);
        let out = engine.tick(past_timeout);

        assert_eq!(engine.session_count(), 1);
        let left_count = out
            .iter()
            .filter(|o| {
                matches!(
                    o.frame.payload(),
                    Some(Message::PlayerLeft { player }) if player.name == "alice"
                )
            })
            .count();
        assert_eq!(left_count, 1);

        // A later tick must not announce the departure again.
        let much_later = past_timeout + Duration::from_secs(1);
        let out = engine.tick(much_later);
        assert!(
            out.iter()
                .all(|o| !matches!(o.frame.payload(), Some(Message::PlayerLeft { .. })))
        );
    }

    #[test]
    fn test_duplicate_reliable_packet_is_reacked_not_reprocessed() {
        let (mut engine, alice, _) = started_engine();
        let now = Instant::now();

        let packet = ReliablePacket {
            sequence: 1,
            ack_sequence: 0,
            is_ack: false,
            needs_ack: true,
            payload: Some(Message::LevelTransition {
                player_id: 1,
                proceed: false,
            }),
            sent_at_ms: 0,
        };

        let out = engine.handle_frame(alice, Frame::Reliable(packet.clone()), now);
        assert!(matches!(
            &out[0].frame,
            Frame::Reliable(ack) if ack.is_ack && ack.ack_sequence == 1
        ));
        assert_eq!(engine.state().votes.len(), 1);

        // Retransmit of the same sequence: only the ACK goes out again.
        let out = engine.handle_frame(alice, Frame::Reliable(packet), now);
        assert_eq!(out.len(), 1);
        assert!(matches!(
            &out[0].frame,
            Frame::Reliable(ack) if ack.is_ack && ack.ack_sequence == 1
        ));
        assert_eq!(engine.state().votes.len(), 1);
    }

    #[test]
    fn test_position_broadcast_on_tick() {
        let (mut engine, alice, bob) = started_engine();
        let now = Instant::now();

        engine.handle_frame(
            alice,
            bare(Message::Position {
                player_id: 1,
                position: Vec3::new(3.0, 0.0, 1.0),
                velocity: Vec3::X,
            }),
            now,
        );

        let out = engine.tick(now + Duration::from_millis(100));
        for peer in [alice, bob] {
            assert!(
                payloads_for(&out, peer)
                    .iter()
                    .any(|m| matches!(m, Message::Position { player_id: 1, .. })),
                "positions go to every peer unreliably"
            );
        }
        // Position frames must not be reliability-wrapped.
        assert!(out.iter().all(|o| match &o.frame {
            Frame::Bare(_) => true,
            Frame::Reliable(p) => !matches!(p.payload, Some(Message::Position { .. })),
        }));
    }

    #[test]
    fn test_retransmission_sweep_resends_unacked_handshake() {
        let mut engine = engine();
        let now = Instant::now();
        let alice = addr(6001);

        engine.handle_frame(alice, bare(Message::Username { name: "alice".into() }), now);

        // Nothing was acked; past the ack timeout both handshake frames
        // come around again.
        let out = engine.tick(now + Duration::from_millis(600));
        let resent: Vec<&Message> = payloads_for(&out, alice)
            .into_iter()
            .filter(|m| !matches!(m, Message::Ping))
            .collect();
        assert!(resent.iter().any(|m| matches!(m, Message::ServerName { .. })));
        assert!(resent.iter().any(|m| matches!(m, Message::PlayerList { .. })));
    }
}
