use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::protocol::Message;

/// Optional wrapper giving any envelope at-least-once delivery. Framed on the
/// wire as a `"type": "RELIABLE"` object so both sub-protocols share one
/// socket. An ACK carries no payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "RELIABLE")]
pub struct ReliablePacket {
    pub sequence: u32,
    pub ack_sequence: u32,
    pub is_ack: bool,
    pub needs_ack: bool,
    pub payload: Option<Message>,
    pub sent_at_ms: u64,
}

impl ReliablePacket {
    pub fn ack(sequence: u32) -> Self {
        Self {
            sequence: 0,
            ack_sequence: sequence,
            is_ack: true,
            needs_ack: false,
            payload: None,
            sent_at_ms: now_unix_ms(),
        }
    }
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub ack_timeout: Duration,
    pub max_retransmits: u32,
    pub max_retransmit_time: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_millis(500),
            max_retransmits: 10,
            max_retransmit_time: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
struct PendingDelivery {
    packet: ReliablePacket,
    sent_at: Instant,
    first_sent_at: Instant,
    retries: u32,
}

/// Sender half of the reliability layer: assigns sequence numbers (monotonic,
/// starting at 1) and keeps unacknowledged packets in the pending-delivery
/// table until a matching ACK arrives or retries are exhausted.
#[derive(Debug)]
pub struct ReliableSender {
    pending: HashMap<u32, PendingDelivery>,
    next_sequence: u32,
}

impl Default for ReliableSender {
    fn default() -> Self {
        Self::new()
    }
}

impl ReliableSender {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
            next_sequence: 1,
        }
    }

    pub fn wrap(&mut self, payload: Message, now: Instant) -> ReliablePacket {
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let packet = ReliablePacket {
            sequence,
            ack_sequence: 0,
            is_ack: false,
            needs_ack: true,
            payload: Some(payload),
            sent_at_ms: now_unix_ms(),
        };

        self.pending.insert(
            sequence,
            PendingDelivery {
                packet: packet.clone(),
                sent_at: now,
                first_sent_at: now,
                retries: 0,
            },
        );

        packet
    }

    /// Removes the pending entry for an acknowledged sequence. Returns false
    /// for sequences no longer (or never) tracked.
    pub fn on_ack(&mut self, sequence: u32) -> bool {
        self.pending.remove(&sequence).is_some()
    }

    /// Collects packets due for retransmission and abandons the ones past
    /// their retry budget. Driven by the same tick that drives replication.
    pub fn sweep(&mut self, now: Instant, policy: &RetryPolicy) -> Vec<ReliablePacket> {
        let mut resend = Vec::new();

        self.pending.retain(|sequence, entry| {
            if now.duration_since(entry.sent_at) < policy.ack_timeout {
                return true;
            }

            if entry.retries >= policy.max_retransmits
                || now.duration_since(entry.first_sent_at) > policy.max_retransmit_time
            {
                log::warn!(
                    "abandoning reliable packet {} after {} retransmits",
                    sequence,
                    entry.retries
                );
                return false;
            }

            entry.retries += 1;
            entry.sent_at = now;
            resend.push(entry.packet.clone());
            true
        });

        resend.sort_by_key(|p| p.sequence);
        resend
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn retries(&self, sequence: u32) -> Option<u32> {
        self.pending.get(&sequence).map(|e| e.retries)
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Receiver half: a last-seen-sequence watermark. Retransmits of an already
/// processed sequence are re-ACKed by the caller but their payload must not
/// be applied twice.
#[derive(Debug, Default)]
pub struct ReliableReceiver {
    last_seen: u32,
}

impl ReliableReceiver {
    pub fn new() -> Self {
        Self { last_seen: 0 }
    }

    /// Returns true when the sequence is fresh and its payload should be
    /// processed.
    pub fn accept(&mut self, sequence: u32) -> bool {
        if sequence <= self.last_seen {
            return false;
        }
        self.last_seen = sequence;
        true
    }

    pub fn last_seen(&self) -> u32 {
        self.last_seen
    }
}
