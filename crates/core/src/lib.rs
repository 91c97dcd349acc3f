//! Automatic reconnection to keep-alive peers.
//!
//! Peers carrying the [`keep-alive`](peer::KEEP_ALIVE) tag in the
//! [peer directory](directory::PeerDirectory) are redialed whenever the node
//! loses its connection to them, and once when the [`ReconnectQueue`] starts.
//! The directory, the [dialer](dialer::Dialer) and the [event bus](events::EventBus)
//! are supplied by the embedding node.

/// Reconnection queue settings, loaded from files, environment and CLI flags.
pub mod config;

/// Outbound connection establishment.
pub mod dialer;

/// Known peers and their tags.
pub mod directory;

/// Node-wide connection events.
pub mod events;

pub mod peer;

/// The reconnection queue itself.
pub mod reconnect;

/// Log output setup.
pub mod tracing;

pub mod util;

pub use config::{ConfigArgs, ReconnectConfig};
pub use peer::{PeerId, PeerRecord, Tag, KEEP_ALIVE};
pub use reconnect::{QueueState, ReconnectError, ReconnectQueue, ReconnectStats};
