// Userspace proxies that forward published ports alongside the kernel DNAT
// rules. The kernel path covers remote traffic; the proxy covers the cases
// DNAT misses, such as host-local connections to a bound address.

use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};

use crate::manager::Protocol;

/// A UDP "connection" with no traffic in either direction for this long is
/// torn down.
const UDP_CONN_TRACK_TIMEOUT: Duration = Duration::from_secs(90);

const UDP_BUF_SIZE: usize = 65535;

/// A proxy with its frontend socket bound but not yet forwarding.
///
/// Binding happens at construction so that an unavailable host port
/// surfaces as an error before any mapping state is committed.
pub struct Proxy {
    frontend: SocketAddrV4,
    backend: SocketAddrV4,
    socket: FrontendSocket,
}

enum FrontendSocket {
    Tcp(TcpListener),
    Udp(UdpSocket),
}

impl Proxy {
    pub async fn new(
        proto: Protocol,
        frontend: SocketAddrV4,
        backend: SocketAddrV4,
    ) -> std::io::Result<Self> {
        let socket = match proto {
            Protocol::Tcp => FrontendSocket::Tcp(TcpListener::bind(frontend).await?),
            Protocol::Udp => FrontendSocket::Udp(UdpSocket::bind(frontend).await?),
        };
        Ok(Self {
            frontend,
            backend,
            socket,
        })
    }

    /// Launch the forwarding loop as a background task.
    pub fn spawn(self) -> ProxyHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let frontend = self.frontend;
        let backend = self.backend;
        let task = match self.socket {
            FrontendSocket::Tcp(listener) => {
                tokio::spawn(run_tcp(listener, backend, shutdown_rx))
            }
            FrontendSocket::Udp(socket) => {
                tokio::spawn(run_udp(socket, backend, shutdown_rx))
            }
        };
        tracing::debug!("proxying {} -> {}", frontend, backend);
        ProxyHandle {
            shutdown: shutdown_tx,
            _task: task,
        }
    }
}

/// Handle to a running proxy task. Dropping the handle also stops the proxy.
pub struct ProxyHandle {
    shutdown: watch::Sender<bool>,
    _task: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    /// Ask the forwarding loop to exit. Established TCP connections are
    /// left to drain on their own.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }
}

async fn run_tcp(
    listener: TcpListener,
    backend: SocketAddrV4,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                let (mut client, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!("tcp proxy accept failed: {}", e);
                        continue;
                    }
                };
                tokio::spawn(async move {
                    match TcpStream::connect(backend).await {
                        Ok(mut upstream) => {
                            let _ = copy_bidirectional(&mut client, &mut upstream).await;
                        }
                        Err(e) => {
                            tracing::debug!(
                                "tcp proxy: connect to backend {} for {} failed: {}",
                                backend,
                                peer,
                                e
                            );
                        }
                    }
                });
            }
        }
    }
}

async fn run_udp(socket: UdpSocket, backend: SocketAddrV4, mut shutdown: watch::Receiver<bool>) {
    let socket = Arc::new(socket);
    let mut clients: HashMap<SocketAddr, mpsc::Sender<Vec<u8>>> = HashMap::new();
    let mut buf = vec![0u8; UDP_BUF_SIZE];

    loop {
        let (len, client_addr) = tokio::select! {
            _ = shutdown.changed() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!("udp proxy recv failed: {}", e);
                    continue;
                }
            },
        };
        let datagram = buf[..len].to_vec();

        // Reuse the client's upstream flow when it is still alive; a closed
        // channel means the flow idled out and gets recreated.
        if let Some(tx) = clients.get(&client_addr) {
            if tx.try_send(datagram.clone()).is_ok() {
                continue;
            }
            clients.remove(&client_addr);
        }

        let upstream = match UdpSocket::bind("0.0.0.0:0").await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("udp proxy: upstream bind failed: {}", e);
                continue;
            }
        };
        if let Err(e) = upstream.connect(backend).await {
            tracing::warn!("udp proxy: connect to backend {} failed: {}", backend, e);
            continue;
        }

        let (tx, rx) = mpsc::channel(64);
        let _ = tx.try_send(datagram);
        clients.insert(client_addr, tx);
        tokio::spawn(udp_flow(upstream, Arc::clone(&socket), client_addr, rx));
    }
}

// One task per client address: forwards its datagrams upstream and relays
// replies back, until the conntrack timeout expires.
async fn udp_flow(
    upstream: UdpSocket,
    frontend: Arc<UdpSocket>,
    client_addr: SocketAddr,
    mut rx: mpsc::Receiver<Vec<u8>>,
) {
    let mut buf = vec![0u8; UDP_BUF_SIZE];
    loop {
        tokio::select! {
            outbound = rx.recv() => match outbound {
                Some(datagram) => {
                    if let Err(e) = upstream.send(&datagram).await {
                        tracing::debug!("udp proxy: send for {} failed: {}", client_addr, e);
                        break;
                    }
                }
                // Frontend loop gone; nothing more to forward.
                None => break,
            },
            reply = tokio::time::timeout(UDP_CONN_TRACK_TIMEOUT, upstream.recv(&mut buf)) => {
                match reply {
                    Ok(Ok(n)) => {
                        if let Err(e) = frontend.send_to(&buf[..n], client_addr).await {
                            tracing::debug!("udp proxy: reply to {} failed: {}", client_addr, e);
                            break;
                        }
                    }
                    Ok(Err(e)) => {
                        tracing::debug!("udp proxy: upstream recv for {} failed: {}", client_addr, e);
                        break;
                    }
                    Err(_) => break, // idled out
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn loopback(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
    }

    #[tokio::test]
    async fn tcp_proxy_forwards_both_ways() {
        let backend_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = match backend_listener.local_addr().unwrap() {
            SocketAddr::V4(a) => a,
            _ => unreachable!(),
        };
        tokio::spawn(async move {
            let (mut conn, _) = backend_listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            conn.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
            conn.write_all(b"pong").await.unwrap();
        });

        let proxy = Proxy::new(Protocol::Tcp, loopback(0), backend_addr)
            .await
            .unwrap();
        let front_addr = match &proxy.socket {
            FrontendSocket::Tcp(l) => l.local_addr().unwrap(),
            _ => unreachable!(),
        };
        let handle = proxy.spawn();

        let mut client = TcpStream::connect(front_addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"pong");

        handle.close();
    }

    #[tokio::test]
    async fn tcp_proxy_stops_accepting_after_close() {
        let backend = loopback(1); // nothing listening; irrelevant here
        let proxy = Proxy::new(Protocol::Tcp, loopback(0), backend)
            .await
            .unwrap();
        let front_addr = match &proxy.socket {
            FrontendSocket::Tcp(l) => l.local_addr().unwrap(),
            _ => unreachable!(),
        };
        let handle = proxy.spawn();
        handle.close();
        // Give the loop a moment to observe the shutdown signal.
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The listener is gone, so a fresh bind on the same port succeeds.
        let rebound = TcpListener::bind(front_addr).await;
        assert!(rebound.is_ok());
    }

    #[tokio::test]
    async fn udp_proxy_forwards_and_replies() {
        let backend_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = match backend_socket.local_addr().unwrap() {
            SocketAddr::V4(a) => a,
            _ => unreachable!(),
        };
        tokio::spawn(async move {
            let mut buf = [0u8; 16];
            let (n, from) = backend_socket.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"hello");
            backend_socket.send_to(b"world", from).await.unwrap();
        });

        let proxy = Proxy::new(Protocol::Udp, loopback(0), backend_addr)
            .await
            .unwrap();
        let front_addr = match &proxy.socket {
            FrontendSocket::Udp(s) => s.local_addr().unwrap(),
            _ => unreachable!(),
        };
        let handle = proxy.spawn();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"hello", front_addr).await.unwrap();
        let mut buf = [0u8; 16];
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .expect("timed out waiting for proxied reply")
            .unwrap();
        assert_eq!(&buf[..n], b"world");

        handle.close();
    }

    #[tokio::test]
    async fn bind_conflict_surfaces_at_construction() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = match taken.local_addr().unwrap() {
            SocketAddr::V4(a) => a,
            _ => unreachable!(),
        };
        let result = Proxy::new(Protocol::Tcp, addr, loopback(80)).await;
        assert!(result.is_err());
    }
}
