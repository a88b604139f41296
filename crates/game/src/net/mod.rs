pub mod codec;
pub mod protocol;
pub mod reliable;
pub mod session;
pub mod transport;

pub use codec::{CodecError, Frame, RELIABLE_TAG, decode, encode, peek_tag};
pub use protocol::{
    DEFAULT_PORT, MAIN_MENU_SCENE, MAX_PACKET_SIZE, MAX_PLAYERS, Message, PlayerId, PlayerInfo,
};
pub use reliable::{ReliablePacket, ReliableReceiver, ReliableSender, RetryPolicy};
pub use session::{ClientProxy, SessionTable};
pub use transport::{TransportSender, UdpTransport};
