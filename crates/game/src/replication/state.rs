use std::collections::HashMap;
use std::time::Instant;

use glam::Vec3;

use crate::net::protocol::PlayerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GamePhase {
    Lobby,
    GameStarted,
}

/// Latest replicated kinematics for one player. Last write wins; UDP gives no
/// ordering guarantee and none is needed here.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionSample {
    pub position: Vec3,
    pub velocity: Vec3,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PushWindow {
    pub target: PlayerId,
    pub velocity: Vec3,
    pub until: Instant,
}

/// Authoritative state shared by both sessions, server-side only. Key
/// ownership has a single writer: the authority engine, and only for a
/// validated request.
#[derive(Debug)]
pub struct GameState {
    pub phase: GamePhase,
    pub positions: HashMap<PlayerId, PositionSample>,
    pub key_holder: Option<PlayerId>,
    pub push: Option<PushWindow>,
    pub votes: HashMap<PlayerId, bool>,
    pub next_level: Option<String>,
}

impl Default for GameState {
    fn default() -> Self {
        Self::new()
    }
}

impl GameState {
    pub fn new() -> Self {
        Self {
            phase: GamePhase::Lobby,
            positions: HashMap::new(),
            key_holder: None,
            push: None,
            votes: HashMap::new(),
            next_level: None,
        }
    }

    pub fn is_pushed(&self, player_id: PlayerId, now: Instant) -> bool {
        self.push
            .is_some_and(|p| p.target == player_id && now < p.until)
    }

    pub fn expire_push(&mut self, now: Instant) {
        if self.push.is_some_and(|p| now >= p.until) {
            self.push = None;
        }
    }

    /// Clears per-level state when a new level begins.
    pub fn reset_round(&mut self) {
        self.key_holder = None;
        self.push = None;
        self.votes.clear();
        self.next_level = None;
    }

    /// Full reset back to the lobby.
    pub fn reset(&mut self) {
        self.reset_round();
        self.positions.clear();
        self.phase = GamePhase::Lobby;
    }
}
