use glam::Vec3;
use serde::{Deserialize, Serialize};

pub const MAX_PACKET_SIZE: usize = 1200;
pub const DEFAULT_PORT: u16 = 9050;
pub const MAX_PLAYERS: usize = 2;

/// Scene loaded when a level-transition vote does not pass unanimously.
pub const MAIN_MENU_SCENE: &str = "MainMenu";

pub type PlayerId = u8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerInfo {
    pub id: PlayerId,
    pub name: String,
}

/// Every datagram carries exactly one envelope, either bare or wrapped in a
/// [`ReliablePacket`](super::reliable::ReliablePacket). The `type` tag makes
/// the wire format self-describing; tags a decoder does not know collapse to
/// [`Message::Unknown`] instead of failing the whole datagram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    Username {
        name: String,
    },
    ServerName {
        name: String,
    },
    PlayerList {
        players: Vec<PlayerInfo>,
    },
    PlayerJoined {
        player: PlayerInfo,
    },
    PlayerLeft {
        player: PlayerInfo,
    },
    Chat {
        sender: String,
        text: String,
    },
    StartGame,
    GameStart {
        player_id: PlayerId,
    },
    Position {
        player_id: PlayerId,
        position: Vec3,
        velocity: Vec3,
    },
    KeyCollected {
        player_id: PlayerId,
    },
    HideKey,
    KeyTransfer {
        from_id: PlayerId,
        to_id: PlayerId,
    },
    Push {
        target_id: PlayerId,
        velocity: Vec3,
        duration_secs: f32,
    },
    LevelComplete {
        next_level: String,
    },
    LevelTransition {
        player_id: PlayerId,
        proceed: bool,
    },
    LoadScene {
        scene: String,
    },
    Ping,
    #[serde(other)]
    Unknown,
}

impl Message {
    /// Delivery policy per variant. Position samples are superseded by the
    /// next tick and heartbeats by the next heartbeat; everything else must
    /// survive loss.
    pub fn needs_ack(&self) -> bool {
        !matches!(self, Self::Position { .. } | Self::Ping | Self::Unknown)
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Self::Username { .. } => "USERNAME",
            Self::ServerName { .. } => "SERVER_NAME",
            Self::PlayerList { .. } => "PLAYER_LIST",
            Self::PlayerJoined { .. } => "PLAYER_JOINED",
            Self::PlayerLeft { .. } => "PLAYER_LEFT",
            Self::Chat { .. } => "CHAT",
            Self::StartGame => "START_GAME",
            Self::GameStart { .. } => "GAME_START",
            Self::Position { .. } => "POSITION",
            Self::KeyCollected { .. } => "KEY_COLLECTED",
            Self::HideKey => "HIDE_KEY",
            Self::KeyTransfer { .. } => "KEY_TRANSFER",
            Self::Push { .. } => "PUSH",
            Self::LevelComplete { .. } => "LEVEL_COMPLETE",
            Self::LevelTransition { .. } => "LEVEL_TRANSITION",
            Self::LoadScene { .. } => "LOAD_SCENE",
            Self::Ping => "PING",
            Self::Unknown => "UNKNOWN",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_tag_matches_serialized_tag() {
        let msg = Message::KeyCollected { player_id: 1 };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"KEY_COLLECTED""#));
        assert_eq!(msg.tag(), "KEY_COLLECTED");
    }

    #[test]
    fn test_reliability_policy() {
        assert!(!Message::Ping.needs_ack());
        assert!(
            !Message::Position {
                player_id: 1,
                position: Vec3::ZERO,
                velocity: Vec3::ZERO,
            }
            .needs_ack()
        );
        assert!(Message::StartGame.needs_ack());
        assert!(
            Message::Push {
                target_id: 2,
                velocity: Vec3::X,
                duration_secs: 0.5,
            }
            .needs_ack()
        );
    }
}
