use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use super::protocol::{PlayerId, PlayerInfo};
use super::reliable::{ReliableReceiver, ReliableSender};

/// One connected peer, identified by its network address. Created on the
/// first packet from an unseen address; every received packet refreshes the
/// heartbeat stamp. The username is set once by the handshake.
#[derive(Debug)]
pub struct ClientProxy {
    pub addr: SocketAddr,
    pub username: Option<String>,
    pub player_id: PlayerId,
    pub last_seen: Instant,
    pub sender: ReliableSender,
    pub receiver: ReliableReceiver,
    join_order: u32,
}

impl ClientProxy {
    fn new(addr: SocketAddr, join_order: u32, now: Instant) -> Self {
        Self {
            addr,
            username: None,
            player_id: 0,
            last_seen: now,
            sender: ReliableSender::new(),
            receiver: ReliableReceiver::new(),
            join_order,
        }
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_seen = now;
    }

    pub fn is_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        now.duration_since(self.last_seen) > timeout
    }

    /// Returns true when the name was newly set; a session keeps its first
    /// announced name.
    pub fn set_username(&mut self, name: &str) -> bool {
        if self.username.is_some() {
            return false;
        }
        self.username = Some(name.to_string());
        true
    }

    pub fn display_name(&self) -> &str {
        self.username.as_deref().unwrap_or("<unnamed>")
    }

    pub fn info(&self) -> PlayerInfo {
        PlayerInfo {
            id: self.player_id,
            name: self.display_name().to_string(),
        }
    }
}

/// Server-side session table, capped at the player capacity. A connecting
/// address beyond capacity is rejected without mutating existing sessions.
#[derive(Debug)]
pub struct SessionTable {
    sessions: HashMap<SocketAddr, ClientProxy>,
    capacity: usize,
    next_join_order: u32,
}

impl SessionTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            capacity,
            next_join_order: 0,
        }
    }

    pub fn get_or_create(
        &mut self,
        addr: SocketAddr,
        now: Instant,
    ) -> Result<&mut ClientProxy, &'static str> {
        if self.sessions.contains_key(&addr) {
            return Ok(self.sessions.get_mut(&addr).unwrap());
        }

        if self.sessions.len() >= self.capacity {
            return Err("session table full");
        }

        let join_order = self.next_join_order;
        self.next_join_order += 1;
        Ok(self
            .sessions
            .entry(addr)
            .or_insert_with(|| ClientProxy::new(addr, join_order, now)))
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<&ClientProxy> {
        self.sessions.get(addr)
    }

    pub fn get_mut(&mut self, addr: &SocketAddr) -> Option<&mut ClientProxy> {
        self.sessions.get_mut(addr)
    }

    pub fn by_player_id(&self, player_id: PlayerId) -> Option<&ClientProxy> {
        self.sessions.values().find(|p| p.player_id == player_id)
    }

    pub fn remove(&mut self, addr: &SocketAddr) -> Option<ClientProxy> {
        self.sessions.remove(addr)
    }

    /// Removes every session silent longer than the timeout and returns them;
    /// the removal discards the peer's reliability state with it.
    pub fn evict_timed_out(&mut self, now: Instant, timeout: Duration) -> Vec<ClientProxy> {
        let timed_out: Vec<SocketAddr> = self
            .sessions
            .values()
            .filter(|p| p.is_timed_out(now, timeout))
            .map(|p| p.addr)
            .collect();

        timed_out
            .iter()
            .filter_map(|addr| self.sessions.remove(addr))
            .collect()
    }

    /// Sessions in join order.
    pub fn iter(&self) -> impl Iterator<Item = &ClientProxy> {
        let mut proxies: Vec<&ClientProxy> = self.sessions.values().collect();
        proxies.sort_by_key(|p| p.join_order);
        proxies.into_iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ClientProxy> {
        let mut proxies: Vec<&mut ClientProxy> = self.sessions.values_mut().collect();
        proxies.sort_by_key(|p| p.join_order);
        proxies.into_iter()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn roster(&self) -> Vec<PlayerInfo> {
        self.iter().map(|p| p.info()).collect()
    }

    /// True when every session has announced a name and no two names match.
    pub fn names_are_unique(&self) -> bool {
        let names: Vec<&str> = self
            .sessions
            .values()
            .filter_map(|p| p.username.as_deref())
            .collect();

        if names.len() != self.sessions.len() {
            return false;
        }

        names
            .iter()
            .all(|name| names.iter().filter(|n| *n == name).count() == 1)
    }

    pub fn clear(&mut self) {
        self.sessions.clear();
    }
}
