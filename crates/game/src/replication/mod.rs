pub mod authority;
pub mod state;

pub use authority::{Outbound, ReplicationEngine, transmit_all};
pub use state::{GamePhase, GameState, PositionSample, PushWindow};
