//! The relay daemon: accept, track, and fan out ciphertext.
//!
//! One task owns the listener, the dense peer-slot table, and the server
//! key, so there is no locking anywhere in the relay path. Each
//! loop iteration waits for readiness across the listener and every peer
//! socket, then handles exactly one event:
//!
//! - listener ready → accept, run the two-party exchange, admit the peer,
//!   rekey the group (or reject the socket outright at capacity),
//! - peer ready → relay one record to every other peer, or reap the peer and
//!   rekey the survivors.
//!
//! Disconnects compact the table by swapping the last slot into the hole, so
//! in-use slots stay contiguous and the readiness set stays exactly as large
//! as the peer count.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;

use anyhow::{bail, Context, Result};
use futures::future;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, info, warn};

use crate::crypto::{self, SecretKey, KEY_LEN};
use crate::kex::{self, Envelope, KexError};
use crate::wire::{self, WireError};

/// Default TCP port.
pub const DEFAULT_PORT: u16 = 2315;
/// Default `listen()` backlog.
pub const DEFAULT_BACKLOG: u32 = 32;
/// Default slot-table capacity, counting the listener's slot.
pub const DEFAULT_MAX_CONNECTIONS: usize = 64;

/// Daemon startup knobs.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Port to listen on.
    pub port: u16,
    /// Pending-connection queue limit.
    pub backlog: u32,
    /// Slot-table capacity; one slot is the listener's, the rest hold peers.
    pub max_connections: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            backlog: DEFAULT_BACKLOG,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

/// One connected peer.
struct PeerSlot {
    stream: TcpStream,
    ctrl_key: SecretKey,
    addr: SocketAddr,
}

/// What woke the relay loop.
enum Wake {
    Shutdown,
    Incoming(std::io::Result<(TcpStream, SocketAddr)>),
    Readable(usize),
}

/// The relay daemon.
pub struct Daemon {
    listener: TcpListener,
    slots: Vec<PeerSlot>,
    server_key: SecretKey,
    epoch: u64,
    max_peers: usize,
}

impl Daemon {
    /// Bind the listening socket and seed the server key.
    pub async fn bind(config: DaemonConfig) -> Result<Self> {
        if config.max_connections < 2 {
            bail!("connection cap must be at least 2 (listener plus one peer)");
        }

        let socket = TcpSocket::new_v4().context("creating listening socket")?;
        socket.set_reuseaddr(true)?;
        socket
            .bind(SocketAddr::from(([0, 0, 0, 0], config.port)))
            .with_context(|| format!("binding port {}", config.port))?;
        let listener = socket
            .listen(config.backlog)
            .context("listening on bound socket")?;

        Ok(Self {
            listener,
            slots: Vec::new(),
            server_key: SecretKey::random(),
            epoch: 0,
            max_peers: config.max_connections - 1,
        })
    }

    /// Address the daemon is listening on.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Largest number of peers the slot table admits.
    pub fn max_peers(&self) -> usize {
        self.max_peers
    }

    /// Run the relay loop until interrupted.
    pub async fn run(&mut self) -> Result<()> {
        info!(addr = %self.local_addr()?, max_peers = self.max_peers, "daemon started");
        loop {
            match self.next_wake().await {
                Wake::Shutdown => {
                    info!("interrupt received, shutting down");
                    return Ok(());
                }
                Wake::Incoming(Ok((stream, addr))) => self.admit(stream, addr).await?,
                Wake::Incoming(Err(e)) => warn!(error = %e, "accept failed"),
                Wake::Readable(index) => self.service(index).await?,
            }
        }
    }

    /// Wait for the next readiness event across the listener, every peer
    /// socket, and the interrupt signal.
    async fn next_wake(&self) -> Wake {
        let mut wakes: Vec<Pin<Box<dyn Future<Output = Wake> + Send + '_>>> =
            Vec::with_capacity(self.slots.len() + 2);
        wakes.push(Box::pin(async {
            let _ = tokio::signal::ctrl_c().await;
            Wake::Shutdown
        }));
        wakes.push(Box::pin(async {
            Wake::Incoming(self.listener.accept().await)
        }));
        for (index, slot) in self.slots.iter().enumerate() {
            let stream = &slot.stream;
            wakes.push(Box::pin(async move {
                let _ = stream.readable().await;
                Wake::Readable(index)
            }));
        }
        let (wake, _, _) = future::select_all(wakes).await;
        wake
    }

    /// Handle a pending connection on the listener.
    async fn admit(&mut self, mut stream: TcpStream, addr: SocketAddr) -> Result<()> {
        if self.slots.len() == self.max_peers {
            // Accept-then-close so the OS listen queue drains; the peer has
            // no key yet, so there is nothing it could read anyway.
            warn!(%addr, "at capacity, rejecting connection");
            return Ok(());
        }

        match kex::two_party_daemon(&mut stream, &self.server_key).await {
            Ok(ctrl_key) => {
                let slot = self.slots.len();
                self.slots.push(PeerSlot {
                    stream,
                    ctrl_key,
                    addr,
                });
                info!(%addr, slot, peers = self.slots.len(), "peer joined");
                self.rekey_all().await
            }
            Err(e) => {
                warn!(%addr, error = %e, "key exchange failed, dropping connection");
                Ok(())
            }
        }
    }

    /// Handle readiness on a peer slot: relay one record or reap the peer.
    async fn service(&mut self, index: usize) -> Result<()> {
        match wire::recv_frame(&mut self.slots[index].stream).await {
            Ok(frame) => {
                self.fan_out(index, &frame).await;
                debug!(slot = index, bytes = frame.len(), "record relayed");
                Ok(())
            }
            Err(WireError::Closed) => {
                info!(addr = %self.slots[index].addr, "peer disconnected");
                self.drop_slot(index);
                self.rekey_all().await
            }
            Err(e) => {
                warn!(addr = %self.slots[index].addr, error = %e, "dropping peer");
                self.drop_slot(index);
                self.rekey_all().await
            }
        }
    }

    /// Relay a raw record to every slot except the sender's.
    ///
    /// A failed write is logged and left alone; the peer behind it gets
    /// reaped when its own socket turns readable with an error.
    async fn fan_out(&mut self, sender: usize, frame: &[u8]) {
        for index in 0..self.slots.len() {
            if index == sender {
                continue;
            }
            if let Err(e) = wire::send_all(&mut self.slots[index].stream, frame).await {
                warn!(slot = index, error = %e, "fan-out write failed");
            }
        }
    }

    /// Compact the table: swap the last slot into the hole.
    fn drop_slot(&mut self, index: usize) {
        let slot = self.slots.swap_remove(index);
        debug!(addr = %slot.addr, peers = self.slots.len(), "slot compacted");
    }

    /// Rotate the group session key, restarting once without a peer that
    /// fails mid-exchange. A second consecutive failure is fatal.
    async fn rekey_all(&mut self) -> Result<()> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.rekey_once().await {
                Ok(()) => return Ok(()),
                Err(KexError::RekeyAborted { slot }) if attempts < 2 => {
                    warn!(slot, "peer failed mid-rekey, restarting with survivors");
                    self.drop_slot(slot);
                }
                Err(e) => bail!("catastrophic key exchange failure: {e}"),
            }
        }
    }

    /// One complete N-party exchange across the current peer set.
    ///
    /// Contribution chains start from the server key's public point and shift
    /// one slot per round, so after `peers` rounds every chain has passed
    /// through every peer exactly once. The daemon only ever routes sealed
    /// envelopes; the fully-mixed point stays on the peers.
    async fn rekey_once(&mut self) -> Result<(), KexError> {
        let peers = self.slots.len();
        if peers == 0 {
            return Ok(());
        }
        self.epoch += 1;
        debug!(epoch = self.epoch, peers, "rekey started");

        let start = crypto::public_point(&self.server_key);
        let mut outbound = vec![start; peers];

        for round in 1..=peers {
            let remaining = (peers - round + 1) as u64;
            for index in 0..peers {
                let envelope = if round == 1 {
                    Envelope::Begin {
                        epoch: self.epoch,
                        rounds: peers as u64,
                        point: outbound[index],
                    }
                } else {
                    Envelope::Round {
                        epoch: self.epoch,
                        remaining,
                        point: outbound[index],
                    }
                };
                self.send_envelope(index, &envelope).await?;
            }
            if remaining == 1 {
                break;
            }

            let mut replies = vec![[0u8; KEY_LEN]; peers];
            for index in 0..peers {
                replies[index] = self.collect_reply(index).await?;
            }
            for index in 0..peers {
                outbound[(index + 1) % peers] = replies[index];
            }
        }
        debug!(epoch = self.epoch, "rekey complete");
        Ok(())
    }

    async fn send_envelope(&mut self, index: usize, envelope: &Envelope) -> Result<(), KexError> {
        let frame = kex::seal_envelope(&self.slots[index].ctrl_key, envelope)
            .map_err(|_| KexError::RekeyAborted { slot: index })?;
        wire::send_all(&mut self.slots[index].stream, &frame)
            .await
            .map_err(|_| KexError::RekeyAborted { slot: index })
    }

    /// Read one peer's round reply, relaying any user records that were
    /// already in flight when the rekey started.
    async fn collect_reply(&mut self, index: usize) -> Result<[u8; KEY_LEN], KexError> {
        loop {
            let frame = match wire::recv_frame(&mut self.slots[index].stream).await {
                Ok(frame) => frame,
                Err(_) => return Err(KexError::RekeyAborted { slot: index }),
            };
            match kex::open_envelope(&self.slots[index].ctrl_key, &frame) {
                Ok(Envelope::Reply { epoch, point }) if epoch == self.epoch => return Ok(point),
                Ok(_) => debug!(slot = index, "dropping stale control envelope"),
                Err(KexError::Wire(WireError::AuthFailure)) => {
                    // A user record sealed before the peer learned of the
                    // rekey; relay it as usual and keep waiting.
                    self.fan_out(index, &frame).await;
                }
                Err(_) => return Err(KexError::RekeyAborted { slot: index }),
            }
        }
    }
}
