//! Server configuration

use std::net::SocketAddr;
use std::time::Duration;

use crate::protocol::constants::*;

/// Server configuration options
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,

    /// Maximum concurrent connections (0 = unlimited)
    pub max_connections: usize,

    /// Outbound chunk size announced to clients after the handshake
    pub chunk_size: u32,

    /// Window acknowledgement size sent on connect
    pub window_ack_size: u32,

    /// Peer bandwidth limit sent on connect
    pub peer_bandwidth: u32,

    /// Largest inbound message accepted, in bytes
    pub max_message_size: u32,

    /// Connection timeout (handshake must complete within this time)
    pub connection_timeout: Duration,

    /// Idle timeout (disconnect if no traffic in either direction)
    pub idle_timeout: Duration,

    /// Enable TCP_NODELAY (disable Nagle's algorithm)
    pub tcp_nodelay: bool,

    /// Application-level read buffer size
    pub read_buffer_size: usize,

    /// Application-level write buffer size
    pub write_buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 1935)),
            max_connections: 0, // Unlimited
            chunk_size: RECOMMENDED_CHUNK_SIZE,
            window_ack_size: DEFAULT_WINDOW_ACK_SIZE,
            peer_bandwidth: DEFAULT_PEER_BANDWIDTH,
            max_message_size: MAX_MESSAGE_SIZE,
            connection_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
            tcp_nodelay: true, // Important for low latency
            read_buffer_size: 64 * 1024, // 64KB
            write_buffer_size: 64 * 1024,
        }
    }
}

impl ServerConfig {
    /// Create a new config with custom bind address
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            bind_addr: addr,
            ..Default::default()
        }
    }

    /// Set the bind address
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set maximum connections (0 = unlimited)
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set chunk size, clamped to `1..=MAX_CHUNK_SIZE`
    pub fn chunk_size(mut self, size: u32) -> Self {
        self.chunk_size = size.clamp(1, MAX_CHUNK_SIZE);
        self
    }

    /// Set the acknowledgement window announced after connect
    pub fn window_ack_size(mut self, size: u32) -> Self {
        self.window_ack_size = size;
        self
    }

    pub fn peer_bandwidth(mut self, size: u32) -> Self {
        self.peer_bandwidth = size;
        self
    }

    /// Set the inbound message size bound
    pub fn max_message_size(mut self, size: u32) -> Self {
        self.max_message_size = size;
        self
    }

    /// Set the deadline for the whole handshake
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set idle timeout (no traffic either way)
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();

        assert_eq!(config.bind_addr.port(), 1935);
        assert_eq!(config.max_connections, 0);
        assert_eq!(config.chunk_size, RECOMMENDED_CHUNK_SIZE);
        assert_eq!(config.window_ack_size, DEFAULT_WINDOW_ACK_SIZE);
        assert_eq!(config.peer_bandwidth, DEFAULT_PEER_BANDWIDTH);
        assert!(config.tcp_nodelay);
    }

    #[test]
    fn test_with_addr() {
        let addr: SocketAddr = "127.0.0.1:1936".parse().unwrap();
        let config = ServerConfig::with_addr(addr);

        assert_eq!(config.bind_addr.port(), 1936);
    }

    #[test]
    fn test_builder_chunk_size_clamped() {
        assert_eq!(ServerConfig::default().chunk_size(8192).chunk_size, 8192);
        assert_eq!(
            ServerConfig::default().chunk_size(u32::MAX).chunk_size,
            MAX_CHUNK_SIZE
        );
        assert_eq!(ServerConfig::default().chunk_size(0).chunk_size, 1);
    }

    #[test]
    fn test_builder_chaining() {
        let addr: SocketAddr = "127.0.0.1:1935".parse().unwrap();
        let config = ServerConfig::default()
            .bind(addr)
            .max_connections(50)
            .chunk_size(4096)
            .window_ack_size(1_000_000)
            .peer_bandwidth(5_000_000)
            .max_message_size(1 << 20)
            .connection_timeout(Duration::from_secs(5))
            .idle_timeout(Duration::from_secs(30));

        assert_eq!(config.bind_addr, addr);
        assert_eq!(config.max_connections, 50);
        assert_eq!(config.chunk_size, 4096);
        assert_eq!(config.window_ack_size, 1_000_000);
        assert_eq!(config.peer_bandwidth, 5_000_000);
        assert_eq!(config.max_message_size, 1 << 20);
        assert_eq!(config.connection_timeout, Duration::from_secs(5));
        assert_eq!(config.idle_timeout, Duration::from_secs(30));
    }
}
