//! Handler context
//!
//! Read-only view of a session handed to [`RtmpHandler`](crate::server::RtmpHandler)
//! callbacks.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::protocol::message::ConnectParams;
use crate::registry::StreamKey;

/// Context passed to RtmpHandler callbacks
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// Unique session ID
    pub session_id: u64,

    /// Remote peer address
    pub peer_addr: SocketAddr,

    /// Application name (from connect)
    pub app: String,

    /// Connect parameters (if available)
    pub connect_params: Option<Arc<ConnectParams>>,
}

impl SessionContext {
    pub fn new(session_id: u64, peer_addr: SocketAddr) -> Self {
        Self {
            session_id,
            peer_addr,
            app: String::new(),
            connect_params: None,
        }
    }

    /// Update with connect parameters
    pub fn with_connect(&mut self, params: ConnectParams) {
        self.app = params.app.clone();
        self.connect_params = Some(Arc::new(params));
    }

    pub fn tc_url(&self) -> Option<&str> {
        self.connect_params
            .as_ref()
            .and_then(|p| p.tc_url.as_deref())
    }

    pub fn flash_ver(&self) -> Option<&str> {
        self.connect_params
            .as_ref()
            .and_then(|p| p.flash_ver.as_deref())
    }

    /// Registry key for a stream name under this session's app
    pub fn stream_key(&self, name: &str) -> StreamKey {
        StreamKey::new(self.app.clone(), name)
    }
}

/// Stream context passed to publish/play callbacks
#[derive(Debug, Clone)]
pub struct StreamContext {
    /// Parent session context
    pub session: SessionContext,

    /// Message stream ID
    pub stream_id: u32,

    pub stream_key: StreamKey,

    /// Whether this is a publishing or playing stream
    pub is_publishing: bool,
}

impl StreamContext {
    pub fn new(
        session: SessionContext,
        stream_id: u32,
        stream_key: StreamKey,
        is_publishing: bool,
    ) -> Self {
        Self {
            session,
            stream_id,
            stream_key,
            is_publishing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_connect() {
        let mut ctx = SessionContext::new(7, "127.0.0.1:50000".parse().unwrap());
        assert_eq!(ctx.app, "");
        assert!(ctx.tc_url().is_none());

        ctx.with_connect(ConnectParams {
            app: "live".into(),
            tc_url: Some("rtmp://localhost/live".into()),
            ..Default::default()
        });
        assert_eq!(ctx.app, "live");
        assert_eq!(ctx.tc_url(), Some("rtmp://localhost/live"));
        assert_eq!(ctx.stream_key("cam"), StreamKey::new("live", "cam"));
    }
}
