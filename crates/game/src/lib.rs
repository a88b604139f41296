pub mod config;
pub mod dispatch;
pub mod net;
pub mod replication;

pub use config::NetConfig;
pub use dispatch::{ChatLine, DispatchQueue, GameBridge, KeyUpdate, PushEvent, VoteOutcome};
pub use net::{
    ClientProxy, CodecError, DEFAULT_PORT, Frame, MAIN_MENU_SCENE, MAX_PACKET_SIZE, MAX_PLAYERS,
    Message, PlayerId, PlayerInfo, RELIABLE_TAG, ReliablePacket, ReliableReceiver, ReliableSender,
    RetryPolicy, SessionTable, TransportSender, UdpTransport, decode, encode, peek_tag,
};
pub use replication::{
    GamePhase, GameState, Outbound, PositionSample, PushWindow, ReplicationEngine, transmit_all,
};
