use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use glam::Vec3;

use crate::net::protocol::{PlayerId, PlayerInfo};
use crate::replication::state::PositionSample;

/// Bounds for the FIFO cells; older entries are dropped once full.
const ROSTER_CELL_CAP: usize = 16;
const CHAT_CELL_CAP: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct ChatLine {
    pub sender: String,
    pub text: String,
}

/// Latest known key ownership. `previous` names a player whose claim this
/// update invalidates (the source of a transfer, or a corrected requester).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyUpdate {
    pub holder: PlayerId,
    pub previous: Option<PlayerId>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PushEvent {
    pub target: PlayerId,
    pub velocity: Vec3,
    pub duration_secs: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VoteOutcome {
    pub passed: bool,
    pub scene: String,
}

/// The narrow surface through which replicated results reach the rest of the
/// game. Called only from the game-loop consumer during a drain, never from
/// the receive thread.
pub trait GameBridge {
    fn apply_remote_position(&mut self, player_id: PlayerId, position: Vec3, velocity: Vec3);
    fn set_key_holder(&mut self, player_id: PlayerId, held: bool);
    fn on_push_received(&mut self, player_id: PlayerId, velocity: Vec3, duration_secs: f32);
    fn on_scene_load_requested(&mut self, scene: &str);
    fn on_roster_changed(&mut self, roster: &[PlayerInfo]);
    fn on_chat_received(&mut self, sender: &str, text: &str);
}

/// Hand-off point between the receive thread (single writer) and the
/// game-loop consumer. Each kind of event has its own cell behind its own
/// lock; critical sections only move values in or out. Coalescing cells keep
/// the latest value; roster and chat keep bounded FIFO history.
#[derive(Debug, Default)]
pub struct DispatchQueue {
    positions: Mutex<HashMap<PlayerId, PositionSample>>,
    roster: Mutex<VecDeque<Vec<PlayerInfo>>>,
    chat: Mutex<VecDeque<ChatLine>>,
    key: Mutex<Option<KeyUpdate>>,
    push: Mutex<Option<PushEvent>>,
    vote_outcome: Mutex<Option<VoteOutcome>>,
    scene: Mutex<Option<String>>,
}

impl DispatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage_position(&self, player_id: PlayerId, sample: PositionSample) {
        self.positions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(player_id, sample);
    }

    pub fn stage_roster(&self, roster: Vec<PlayerInfo>) {
        let mut cell = self
            .roster
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if cell.len() >= ROSTER_CELL_CAP {
            cell.pop_front();
        }
        cell.push_back(roster);
    }

    pub fn stage_chat(&self, line: ChatLine) {
        let mut cell = self.chat.lock().unwrap_or_else(PoisonError::into_inner);
        if cell.len() >= CHAT_CELL_CAP {
            cell.pop_front();
        }
        cell.push_back(line);
    }

    pub fn stage_key(&self, update: KeyUpdate) {
        *self.key.lock().unwrap_or_else(PoisonError::into_inner) = Some(update);
    }

    pub fn stage_push(&self, event: PushEvent) {
        *self.push.lock().unwrap_or_else(PoisonError::into_inner) = Some(event);
    }

    pub fn stage_vote_outcome(&self, outcome: VoteOutcome) {
        *self
            .vote_outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(outcome);
    }

    pub fn stage_scene(&self, scene: String) {
        *self.scene.lock().unwrap_or_else(PoisonError::into_inner) = Some(scene);
    }

    /// The resolved vote, if one completed since the last take. Informational
    /// beside the scene load itself.
    pub fn take_vote_outcome(&self) -> Option<VoteOutcome> {
        self.vote_outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Drains every cell once, in a fixed order, into the bridge. Scene loads
    /// come last: they may tear down the state the other cells refer to.
    pub fn drain_into(&self, bridge: &mut dyn GameBridge) {
        let positions = std::mem::take(
            &mut *self
                .positions
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        let mut positions: Vec<(PlayerId, PositionSample)> = positions.into_iter().collect();
        positions.sort_by_key(|(id, _)| *id);
        for (player_id, sample) in positions {
            bridge.apply_remote_position(player_id, sample.position, sample.velocity);
        }

        let rosters = std::mem::take(
            &mut *self.roster.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for roster in rosters {
            bridge.on_roster_changed(&roster);
        }

        let chat = std::mem::take(&mut *self.chat.lock().unwrap_or_else(PoisonError::into_inner));
        for line in chat {
            bridge.on_chat_received(&line.sender, &line.text);
        }

        if let Some(update) = self.key.lock().unwrap_or_else(PoisonError::into_inner).take() {
            if let Some(previous) = update.previous {
                bridge.set_key_holder(previous, false);
            }
            bridge.set_key_holder(update.holder, true);
        }

        if let Some(event) = self
            .push
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            bridge.on_push_received(event.target, event.velocity, event.duration_secs);
        }

        if let Some(scene) = self
            .scene
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            bridge.on_scene_load_requested(&scene);
        }
    }

    pub fn clear(&self) {
        self.positions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.roster
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.chat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        *self.key.lock().unwrap_or_else(PoisonError::into_inner) = None;
        *self.push.lock().unwrap_or_else(PoisonError::into_inner) = None;
        *self
            .vote_outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        *self.scene.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}
