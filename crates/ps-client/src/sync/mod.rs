//! Pairing status synchronization
//!
//! Keeps a [`ConnectionState`](ps_core::ConnectionState) current using the
//! status push channel, falling back to timed polling while the channel is
//! unavailable.

mod machine;
mod synchronizer;

pub use machine::{Effect, FetchOrigin, StatusMachine, SyncEvent};
pub use synchronizer::StatusSynchronizer;
