use crate::config::NetChannelConfig;
use anyhow::bail;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::{lookup_host, UdpSocket};
use tracing::{debug, info};

/// Abstraction for the bidirectional datagram transport a client runs on, introduced to
///  facilitate mocking the I/O part away for testing.
///
/// `receive` blocks until a datagram arrives; callers that need bounded cancellation latency
///  race it against a cancellation signal.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    async fn send(&self, packet_buf: &[u8]) -> anyhow::Result<()>;

    async fn receive(&self) -> anyhow::Result<Vec<u8>>;

    async fn close(&self);
}

/// The production transport: a UDP socket connected to a single peer.
pub struct UdpConnection {
    socket: UdpSocket,
    receive_buf_size: usize,
}

impl UdpConnection {
    pub async fn connect(host: &str, port: u16, config: &NetChannelConfig) -> anyhow::Result<UdpConnection> {
        let addr = format!("{}:{}", host, port);
        let peer_addr = match lookup_host(&addr).await?.next() {
            Some(peer_addr) => peer_addr,
            None => bail!("could not resolve {}", addr),
        };

        let socket = if peer_addr.is_ipv4() {
            UdpSocket::bind("0.0.0.0:0").await?
        }
        else {
            UdpSocket::bind("[::]:0").await?
        };
        socket.connect(peer_addr).await?;
        info!("connected to {:?} from {:?}", peer_addr, socket.local_addr()?);

        Ok(UdpConnection {
            socket,
            receive_buf_size: config.max_frame_size,
        })
    }
}

#[async_trait]
impl Connection for UdpConnection {
    async fn send(&self, packet_buf: &[u8]) -> anyhow::Result<()> {
        self.socket.send(packet_buf).await?;
        Ok(())
    }

    async fn receive(&self) -> anyhow::Result<Vec<u8>> {
        let mut buf = vec![0; self.receive_buf_size];
        let num_read = self.socket.recv(&mut buf).await?;
        buf.truncate(num_read);
        Ok(buf)
    }

    async fn close(&self) {
        // a UDP socket has no shutdown handshake; the socket is released on drop
        debug!("closing connection to {:?}", self.socket.peer_addr().ok());
    }
}
