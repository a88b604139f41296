use std::collections::HashMap;
use std::time::{Duration, Instant};

use tandem::{PlayerId, PositionSample};

#[derive(Debug, Clone)]
pub struct RemoteViewConfig {
    /// Blend rate toward the latest sample under normal replication.
    pub base_blend_rate: f32,
    /// Raised rate while a peer is being pushed, for responsiveness.
    pub pushed_blend_rate: f32,
}

impl Default for RemoteViewConfig {
    fn default() -> Self {
        Self {
            base_blend_rate: 10.0,
            pushed_blend_rate: 25.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RemoteEntity {
    pub player_id: PlayerId,
    pub target: PositionSample,
    pub blend_rate: f32,
    /// Apply the sample as-is instead of smoothing toward it. Set for the
    /// local player while a push makes the server's relay authoritative.
    pub direct: bool,
}

/// Tracks the latest replicated sample per player and how the renderer
/// should approach it. Rendering itself stays outside; this only decides the
/// per-entity mode.
#[derive(Debug, Default)]
pub struct RemoteView {
    config: RemoteViewConfig,
    entities: HashMap<PlayerId, RemoteEntity>,
    push_until: HashMap<PlayerId, Instant>,
    local_id: Option<PlayerId>,
}

impl RemoteView {
    pub fn new(config: RemoteViewConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn set_local_player(&mut self, player_id: Option<PlayerId>) {
        self.local_id = player_id;
    }

    pub fn note_push(&mut self, target: PlayerId, duration_secs: f32, now: Instant) {
        let duration = Duration::from_secs_f32(duration_secs.max(0.0));
        self.push_until.insert(target, now + duration);
    }

    pub fn apply_sample(&mut self, player_id: PlayerId, sample: PositionSample, now: Instant) {
        let pushed = self
            .push_until
            .get(&player_id)
            .is_some_and(|until| now < *until);
        let local = self.local_id == Some(player_id);

        self.entities.insert(
            player_id,
            RemoteEntity {
                player_id,
                target: sample,
                blend_rate: if pushed && !local {
                    self.config.pushed_blend_rate
                } else {
                    self.config.base_blend_rate
                },
                direct: pushed && local,
            },
        );
    }

    /// Drops expired push windows and restores normal blending.
    pub fn update(&mut self, now: Instant) {
        self.push_until.retain(|_, until| now < *until);
        for entity in self.entities.values_mut() {
            if !self.push_until.contains_key(&entity.player_id) {
                entity.blend_rate = self.config.base_blend_rate;
                entity.direct = false;
            }
        }
    }

    pub fn get(&self, player_id: PlayerId) -> Option<&RemoteEntity> {
        self.entities.get(&player_id)
    }

    pub fn entities(&self) -> impl Iterator<Item = &RemoteEntity> {
        self.entities.values()
    }

    pub fn clear(&mut self) {
        self.entities.clear();
        self.push_until.clear();
    }
}
