// Ephemeral host-port allocator. One instance per protocol.
//
// A spawned fountain task cycles through the dynamic port range forever,
// offering each port on a rendezvous channel; it parks there whenever no
// acquirer is waiting. Specific-port requests bypass the fountain and go
// straight to the in-use set.

use std::collections::HashSet;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{NetworkError, NetworkResult};

/// Start of the dynamic port range (inclusive).
pub const PORT_RANGE_START: u16 = 49153;
/// End of the dynamic port range (exclusive).
pub const PORT_RANGE_END: u16 = 65535;

pub struct PortAllocator {
    in_use: Mutex<HashSet<u16>>,
    fountain: tokio::sync::Mutex<mpsc::Receiver<u16>>,
    quit: mpsc::Sender<bool>,
}

impl PortAllocator {
    pub fn new() -> Self {
        let (fountain_tx, fountain_rx) = mpsc::channel(1);
        let (quit_tx, quit_rx) = mpsc::channel(1);

        tokio::spawn(run_fountain(fountain_tx, quit_rx));

        Self {
            in_use: Mutex::new(HashSet::new()),
            fountain: tokio::sync::Mutex::new(fountain_rx),
            quit: quit_tx,
        }
    }

    /// Acquire a host port. `port == 0` means "any": candidates are drawn
    /// from the fountain until a free one turns up. A specific port fails
    /// with `PortInUse` when it is already held.
    pub async fn acquire(&self, port: u16) -> NetworkResult<u16> {
        tracing::debug!("acquiring port {}", port);
        if port != 0 {
            return self.acquire_specific(port);
        }

        let mut fountain = self.fountain.lock().await;
        while let Some(candidate) = fountain.recv().await {
            if self.acquire_specific(candidate).is_ok() {
                return Ok(candidate);
            }
        }
        Err(NetworkError::ChannelClosed("port fountain"))
    }

    fn acquire_specific(&self, port: u16) -> NetworkResult<u16> {
        let mut in_use = self.in_use.lock();
        if !in_use.insert(port) {
            return Err(NetworkError::PortInUse(port));
        }
        Ok(port)
    }

    /// Return a port to the pool. It becomes eligible again once the
    /// fountain wraps around to it.
    pub fn release(&self, port: u16) {
        tracing::debug!("releasing port {}", port);
        self.in_use.lock().remove(&port);
    }

    /// Stop the fountain task. Later `acquire(0)` calls fail.
    pub async fn close(&self) -> NetworkResult<()> {
        self.quit
            .send(true)
            .await
            .map_err(|_| NetworkError::ChannelClosed("port allocator"))
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_fountain(fountain: mpsc::Sender<u16>, mut quit: mpsc::Receiver<bool>) {
    loop {
        for port in PORT_RANGE_START..PORT_RANGE_END {
            tokio::select! {
                sent = fountain.send(port) => {
                    if sent.is_err() {
                        return;
                    }
                }
                _ = quit.recv() => return,
            }
        }
    }
}
