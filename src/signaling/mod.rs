pub mod channel;
pub mod memory;
pub mod message;
pub mod relay;

pub use channel::{ChannelStatus, SignalingChannel};
pub use memory::{MemoryRelay, MemoryRelayHub};
pub use message::{Signal, SignalKind, SignalMessage};
pub use relay::{Relay, RelayInbox};
