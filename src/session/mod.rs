//! Per-connection session state
//!
//! A session owns its phase machine, its message streams and the
//! acknowledgement counters. Nothing here is shared across tasks.

pub mod context;
pub mod state;
pub mod stream;

pub use context::{SessionContext, StreamContext};
pub use state::{SessionPhase, SessionState};
pub use stream::{MessageStream, StreamMode};
