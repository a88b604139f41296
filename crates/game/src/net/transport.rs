use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use super::protocol::MAX_PACKET_SIZE;

/// How often the receive thread wakes to observe the running flag.
const RECV_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Cloneable sending half of the socket. Sends are fire-and-forget: failures
/// are logged and never surfaced to the caller.
#[derive(Debug)]
pub struct TransportSender {
    socket: UdpSocket,
    remote_addr: Option<SocketAddr>,
}

impl TransportSender {
    pub fn send_to(&self, bytes: &[u8], addr: SocketAddr) {
        if bytes.len() > MAX_PACKET_SIZE {
            log::warn!(
                "dropping oversized datagram to {} ({} bytes)",
                addr,
                bytes.len()
            );
            return;
        }

        if let Err(e) = self.socket.send_to(bytes, addr) {
            log::warn!("send to {} failed: {}", addr, e);
        }
    }

    pub fn send(&self, bytes: &[u8]) {
        match self.remote_addr {
            Some(addr) => self.send_to(bytes, addr),
            None => log::warn!("send with no remote address set"),
        }
    }
}

/// Owns one bound UDP socket and its receive thread. The server binds a fixed
/// port on all interfaces; a client binds an ephemeral port with a fixed
/// remote peer. Bind failure is fatal and reported once; there is no rebind
/// retry.
pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
    remote_addr: Option<SocketAddr>,
    running: Arc<AtomicBool>,
    receive_thread: Option<JoinHandle<()>>,
}

impl UdpTransport {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_read_timeout(Some(RECV_POLL_INTERVAL))?;

        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket,
            local_addr,
            remote_addr: None,
            running: Arc::new(AtomicBool::new(true)),
            receive_thread: None,
        })
    }

    /// Client-side bind: any free ephemeral port, fixed remote peer.
    pub fn bind_ephemeral(remote: SocketAddr) -> io::Result<Self> {
        let mut transport = Self::bind("0.0.0.0:0")?;
        transport.remote_addr = Some(remote);
        Ok(transport)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn sender(&self) -> io::Result<TransportSender> {
        Ok(TransportSender {
            socket: self.socket.try_clone()?,
            remote_addr: self.remote_addr,
        })
    }

    /// Spawns the receive thread. Every complete datagram is handed to the
    /// handler; the handler owns all routing and must not block for long.
    /// Datagram boundaries are preserved, so no reassembly happens here.
    pub fn start_receive_loop<F>(&mut self, mut handler: F) -> io::Result<()>
    where
        F: FnMut(&[u8], SocketAddr) + Send + 'static,
    {
        let socket = self.socket.try_clone()?;
        let running = Arc::clone(&self.running);

        let handle = std::thread::Builder::new()
            .name("net-recv".into())
            .spawn(move || {
                let mut buf = [0u8; MAX_PACKET_SIZE];
                while running.load(Ordering::SeqCst) {
                    match socket.recv_from(&mut buf) {
                        Ok((len, from)) => handler(&buf[..len], from),
                        Err(e)
                            if matches!(
                                e.kind(),
                                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                            ) => {}
                        Err(e) => {
                            if running.load(Ordering::SeqCst) {
                                log::warn!("receive failed: {}", e);
                            }
                        }
                    }
                }
            })?;

        self.receive_thread = Some(handle);
        Ok(())
    }

    pub fn running(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Idempotent: the first call stops the receive loop and joins it,
    /// further calls are no-ops.
    pub fn shutdown(&mut self) {
        if self.running.swap(false, Ordering::SeqCst) {
            log::info!("transport on {} shutting down", self.local_addr);
        }
        if let Some(handle) = self.receive_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}
