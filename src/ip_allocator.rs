// Rotating-cursor IP allocator for the bridge subnet.
//
// A single spawned task owns all mutable state; callers talk to it over
// channels, so no lock ever guards `in_use` or the cursor. Each loop
// iteration precomputes the next candidate address, then waits for whichever
// comes first: an acquire request (the candidate is delivered and marked in
// use), a release (the address returns to the pool and the cursor rewinds),
// or shutdown.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use tokio::sync::{mpsc, oneshot};

use crate::cidr::{int_to_ip, ip_to_int, network_range, network_size};
use crate::error::{NetworkError, NetworkResult};

type AllocReply = oneshot::Sender<NetworkResult<Ipv4Addr>>;
// The ack makes a release a rendezvous: once it resolves, the loop has
// processed the return, so a following acquire can observe the address.
type Released = (Ipv4Addr, oneshot::Sender<()>);

pub struct IpAllocator {
    network: Ipv4Net,
    queue_alloc: mpsc::Sender<AllocReply>,
    queue_released: mpsc::Sender<Released>,
    quit: mpsc::Sender<bool>,
}

impl IpAllocator {
    pub fn new(network: Ipv4Net) -> Self {
        let (alloc_tx, alloc_rx) = mpsc::channel(1);
        let (released_tx, released_rx) = mpsc::channel(1);
        let (quit_tx, quit_rx) = mpsc::channel(1);

        tokio::spawn(run(network, alloc_rx, released_rx, quit_rx));

        Self {
            network,
            queue_alloc: alloc_tx,
            queue_released: released_tx,
            quit: quit_tx,
        }
    }

    /// The subnet this allocator hands addresses out of.
    pub fn network(&self) -> Ipv4Net {
        self.network
    }

    /// Request the next free address. Blocks until the allocator loop
    /// delivers one, or fails with `NoAvailableIps` when the subnet is
    /// exhausted.
    pub async fn acquire(&self) -> NetworkResult<Ipv4Addr> {
        let (tx, rx) = oneshot::channel();
        self.queue_alloc
            .send(tx)
            .await
            .map_err(|_| NetworkError::ChannelClosed("IP allocator"))?;
        rx.await
            .map_err(|_| NetworkError::ChannelClosed("IP allocator"))?
    }

    /// Return an address to the pool. Resolves once the allocator loop has
    /// taken the address back.
    pub async fn release(&self, ip: Ipv4Addr) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.queue_released.send((ip, ack_tx)).await.is_err() {
            tracing::warn!("released {} after IP allocator shutdown", ip);
            return;
        }
        let _ = ack_rx.await;
    }

    /// Stop the allocator loop. Pending and later acquires fail.
    pub async fn close(&self) -> NetworkResult<()> {
        self.quit
            .send(true)
            .await
            .map_err(|_| NetworkError::ChannelClosed("IP allocator"))
    }
}

async fn run(
    network: Ipv4Net,
    mut queue_alloc: mpsc::Receiver<AllocReply>,
    mut queue_released: mpsc::Receiver<Released>,
    mut quit: mpsc::Receiver<bool>,
) {
    let (first_ip, _) = network_range(&network);
    let ip_num = ip_to_int(first_ip);
    let own_ip = ip_to_int(network.addr());
    let size = network_size(&network);

    // -1 for the broadcast address, -1 for the gateway address
    let max = size - 2;
    let mut pos: i32 = 1;
    let mut in_use: HashSet<i32> = HashSet::new();

    loop {
        let mut new_num: i32 = 0;
        let mut taken = true;

        // Find the first unused address, giving up after one whole round.
        // A /31 or /32 has no usable slot at all (max <= 0) and reports
        // exhaustion straight away.
        let mut attempt: i32 = 0;
        while attempt < max {
            new_num = ip_num + pos;

            pos = pos % max + 1;

            // The bridge's own address is never handed out
            if new_num == own_ip {
                attempt += 1;
                continue;
            }

            taken = in_use.contains(&new_num);
            if !taken {
                break;
            }
            attempt += 1;
        }

        let result = if taken {
            Err(NetworkError::NoAvailableIps)
        } else {
            Ok(int_to_ip(new_num))
        };

        tokio::select! {
            _ = quit.recv() => return,
            request = queue_alloc.recv() => {
                let Some(reply) = request else { return };
                if !taken {
                    in_use.insert(new_num);
                }
                let _ = reply.send(result);
            }
            released = queue_released.recv() => {
                let Some((released, ack)) = released else { return };
                let r = ip_to_int(released);
                in_use.remove(&r);

                if taken {
                    // Nothing was free this round, so the released address
                    // is the only candidate now; point the cursor straight
                    // at it
                    pos = r - ip_num;
                } else {
                    // Step back so the staged candidate is offered again
                    // instead of being skipped
                    if pos == 1 {
                        pos = max;
                    } else {
                        pos -= 1;
                    }
                }
                let _ = ack.send(());
            }
        }
    }
}
