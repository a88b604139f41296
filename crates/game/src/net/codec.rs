use serde::Deserialize;

use super::protocol::Message;
use super::reliable::ReliablePacket;

/// Wire tag of the reliable sub-protocol; every other tag is a bare envelope.
pub const RELIABLE_TAG: &str = "RELIABLE";

/// One decoded datagram: the two logical sub-protocols sharing one socket.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Bare(Message),
    Reliable(ReliablePacket),
}

impl Frame {
    /// The envelope carried by this frame, if any (ACKs carry none).
    pub fn payload(&self) -> Option<&Message> {
        match self {
            Self::Bare(msg) => Some(msg),
            Self::Reliable(packet) => packet.payload.as_ref(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("decode failed: {0}")]
    Decode(#[source] serde_json::Error),
}

pub fn encode(frame: &Frame) -> Result<Vec<u8>, CodecError> {
    match frame {
        Frame::Bare(msg) => serde_json::to_vec(msg),
        Frame::Reliable(packet) => serde_json::to_vec(packet),
    }
    .map_err(CodecError::Encode)
}

/// Partial decode of only the type tag, for dispatch without materializing
/// the full envelope.
pub fn peek_tag(bytes: &[u8]) -> Result<String, CodecError> {
    #[derive(Deserialize)]
    struct TagProbe {
        #[serde(rename = "type")]
        tag: String,
    }

    serde_json::from_slice::<TagProbe>(bytes)
        .map(|probe| probe.tag)
        .map_err(CodecError::Decode)
}

/// Decodes a complete datagram. Malformed or truncated input is an error the
/// caller treats as a dropped packet; an unknown tag is not an error and
/// yields [`Message::Unknown`].
pub fn decode(bytes: &[u8]) -> Result<Frame, CodecError> {
    if peek_tag(bytes)? == RELIABLE_TAG {
        serde_json::from_slice::<ReliablePacket>(bytes)
            .map(Frame::Reliable)
            .map_err(CodecError::Decode)
    } else {
        serde_json::from_slice::<Message>(bytes)
            .map(Frame::Bare)
            .map_err(CodecError::Decode)
    }
}
