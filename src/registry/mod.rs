//! Stream registry for pub/sub routing
//!
//! The registry maps a stream identity to one publisher and any number of
//! subscribers, and owns each stream's GOP cache.
//!
//! # Architecture
//!
//! ```text
//!                        Arc<StreamRegistry>
//!                   ┌───────────────────────────┐
//!                   │ streams: HashMap<Key,     │
//!                   │   RwLock<StreamEntry {    │
//!                   │     gop: GopCache,        │
//!                   │     publisher: slot,      │
//!                   │     subscribers: [mpsc],  │
//!                   │   }>                      │
//!                   │ >                         │
//!                   └─────────────┬─────────────┘
//!                                 │
//!         ┌───────────────────────┼───────────────────────┐
//!         │                       │                       │
//!         ▼                       ▼                       ▼
//!    [Publisher]            [Subscription]          [Subscription]
//!    publisher.send()       sub.recv()              sub.recv()
//!         │                       │                       │
//!         └──► try_send per queue ┴──► own task writes ──►┘
//! ```
//!
//! # Backpressure
//!
//! Every subscriber has its own bounded queue and the publisher only ever
//! uses `try_send`. A full queue evicts that subscriber with
//! [`CloseReason::Overrun`]; nobody else notices. Payloads are `Bytes`, so
//! queuing a packet for N subscribers shares one allocation.

pub mod config;
mod entry;
pub mod error;
mod key;
mod store;
mod subscriber;

pub use config::RegistryConfig;
pub use entry::{FanOut, StreamSnapshot, StreamState};
pub use error::RegistryError;
pub use key::StreamKey;
pub use store::{Publisher, StreamRegistry};
pub use subscriber::{Capabilities, CloseReason, SubscriberId, Subscription};
