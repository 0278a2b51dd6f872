//! Application hooks
//!
//! The hub makes no policy decisions of its own. An [`RtmpHandler`] answers
//! the authorization questions and observes session lifecycle events. Every
//! method has an accepting/no-op default.

use std::fmt;
use std::future::Future;

use crate::error::{Error, HandshakeError};
use crate::registry::CloseReason;
use crate::session::{SessionContext, StreamContext};

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Peer closed the transport
    PeerClosed,
    /// The stream being played ended or the player was evicted
    StreamEnded(CloseReason),
    /// Handshake deadline or idle timeout
    Timeout,
    /// A connect/publish/play was refused by the handler
    Rejected(String),
    /// Transport or protocol failure
    Error(String),
    /// The session task panicked
    Panicked,
    /// The handler declined the connection in `on_connection`
    Refused,
}

impl DisconnectReason {
    pub(crate) fn from_error(error: &Error) -> Self {
        match error {
            Error::ConnectionClosed => DisconnectReason::PeerClosed,
            Error::Timeout | Error::Handshake(HandshakeError::Timeout) => DisconnectReason::Timeout,
            Error::ConnectRejected(s) | Error::PublishRejected(s) | Error::PlayRejected(s) => {
                DisconnectReason::Rejected(s.clone())
            }
            other => DisconnectReason::Error(other.to_string()),
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::PeerClosed => write!(f, "peer closed"),
            DisconnectReason::StreamEnded(reason) => write!(f, "{}", reason),
            DisconnectReason::Timeout => write!(f, "timeout"),
            DisconnectReason::Rejected(what) => write!(f, "rejected: {}", what),
            DisconnectReason::Error(e) => write!(f, "error: {}", e),
            DisconnectReason::Panicked => write!(f, "session panicked"),
            DisconnectReason::Refused => write!(f, "refused"),
        }
    }
}

/// Authorization and lifecycle callbacks
///
/// Implementations may use `async fn` for any of these methods.
pub trait RtmpHandler: Send + Sync + 'static {
    /// Called right after accept; returning `false` drops the connection
    fn on_connection(&self, ctx: &SessionContext) -> impl Future<Output = bool> + Send {
        let _ = ctx;
        async { true }
    }

    /// May a client connect to `app`?
    fn is_application_allowed(&self, app: &str) -> impl Future<Output = bool> + Send {
        let _ = app;
        async { true }
    }

    /// May a client publish `key` under `app`?
    fn is_publish_allowed(&self, app: &str, key: &str) -> impl Future<Output = bool> + Send {
        let _ = (app, key);
        async { true }
    }

    /// May a client play `key` under `app`?
    fn is_play_allowed(&self, app: &str, key: &str) -> impl Future<Output = bool> + Send {
        let _ = (app, key);
        async { true }
    }

    fn on_publish_start(&self, ctx: &StreamContext) -> impl Future<Output = ()> + Send {
        let _ = ctx;
        async {}
    }

    fn on_play_start(&self, ctx: &StreamContext) -> impl Future<Output = ()> + Send {
        let _ = ctx;
        async {}
    }

    /// Called once per session, after its registry registrations are gone
    fn on_disconnect(
        &self,
        ctx: &SessionContext,
        reason: &DisconnectReason,
    ) -> impl Future<Output = ()> + Send {
        let _ = (ctx, reason);
        async {}
    }
}

/// Handler that allows everything
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl RtmpHandler for AcceptAll {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolError;

    #[test]
    fn test_reason_from_error() {
        assert_eq!(
            DisconnectReason::from_error(&Error::ConnectionClosed),
            DisconnectReason::PeerClosed
        );
        assert_eq!(
            DisconnectReason::from_error(&Error::Timeout),
            DisconnectReason::Timeout
        );
        assert_eq!(
            DisconnectReason::from_error(&Error::Handshake(HandshakeError::Timeout)),
            DisconnectReason::Timeout
        );
        assert_eq!(
            DisconnectReason::from_error(&Error::PublishRejected("live/cam".into())),
            DisconnectReason::Rejected("live/cam".into())
        );
        assert!(matches!(
            DisconnectReason::from_error(&Error::Protocol(ProtocolError::InvalidChunkSize(0))),
            DisconnectReason::Error(_)
        ));
    }

    #[tokio::test]
    async fn test_accept_all_defaults() {
        let handler = AcceptAll;
        assert!(handler.is_application_allowed("live").await);
        assert!(handler.is_publish_allowed("live", "cam").await);
        assert!(handler.is_play_allowed("live", "cam").await);
    }
}
