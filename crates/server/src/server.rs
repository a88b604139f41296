use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tandem::{
    DispatchQueue, GameBridge, ReplicationEngine, TransportSender, UdpTransport, transmit_all,
};

use crate::config::ServerConfig;

/// Owns the transport, the authority engine and the dispatch queue. The
/// receive thread feeds datagrams to the engine and transmits the resulting
/// batch after the engine lock is released; the game loop calls `tick_once`
/// and drains the dispatch queue.
pub struct GameServer {
    transport: UdpTransport,
    sender: TransportSender,
    engine: Arc<Mutex<ReplicationEngine>>,
    dispatch: Arc<DispatchQueue>,
    tick_interval: Duration,
    last_tick: Instant,
    running: Arc<AtomicBool>,
}

impl GameServer {
    pub fn new(config: ServerConfig) -> io::Result<Self> {
        let mut transport = UdpTransport::bind((config.bind.as_str(), config.net.port))?;
        let sender = transport.sender()?;

        let dispatch = Arc::new(DispatchQueue::new());
        let engine = Arc::new(Mutex::new(ReplicationEngine::new(
            config.server_name.clone(),
            config.net.clone(),
            Arc::clone(&dispatch),
        )));

        let recv_engine = Arc::clone(&engine);
        let recv_sender = transport.sender()?;
        transport.start_receive_loop(move |bytes, from| {
            let outbound = recv_engine
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .handle_datagram(from, bytes, Instant::now());
            transmit_all(&recv_sender, &outbound);
        })?;

        let tick_interval = config.net.replication_interval();
        let running = transport.running();

        Ok(Self {
            transport,
            sender,
            engine,
            dispatch,
            tick_interval,
            last_tick: Instant::now(),
            running,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// Advances the replication tick when due and hands staged results to the
    /// bridge. Call this from the game loop as often as convenient.
    pub fn tick_once(&mut self, bridge: &mut dyn GameBridge) {
        let now = Instant::now();
        if now.duration_since(self.last_tick) >= self.tick_interval {
            self.last_tick = now;
            let outbound = self
                .engine
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .tick(now);
            transmit_all(&self.sender, &outbound);
        }

        self.dispatch.drain_into(bridge);
    }

    pub fn run(&mut self, bridge: &mut dyn GameBridge) {
        log::info!("server listening on {}", self.local_addr());
        while self.running.load(Ordering::SeqCst) {
            self.tick_once(bridge);
            std::thread::sleep(Duration::from_millis(1));
        }
        self.shutdown();
    }

    pub fn shutdown(&mut self) {
        self.engine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reset();
        self.transport.shutdown();
    }
}
