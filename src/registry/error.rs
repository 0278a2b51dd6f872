//! Registry error types

use thiserror::Error;

use super::key::StreamKey;

/// Error type for registry operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Another session holds the publisher slot
    #[error("stream already has a publisher: {0}")]
    AlreadyPublishing(StreamKey),

    /// No such stream, and no policy to wait for one
    #[error("stream not found: {0}")]
    StreamNotFound(StreamKey),

    /// Release attempted by a handle that no longer owns the slot
    #[error("publisher does not own stream: {0}")]
    PublisherMismatch(StreamKey),

    /// The publisher slot was taken away by an administrator
    #[error("publisher evicted from stream: {0}")]
    PublisherEvicted(StreamKey),
}
