//! Parley secure peer messaging engine.
//! Host-driven: no I/O of its own; the host supplies a `Router` and calls `tick()`.

pub mod config;
pub mod core;
pub mod error;
pub mod events;
pub mod friends;
pub mod identity;
pub mod persistence;
pub mod protocol;
pub mod routing;
pub mod session;
pub mod transfer;
pub mod wire;

pub use crate::config::EngineConfig;
pub use crate::core::ParleyCore;
pub use crate::error::{EngineError, Result};
pub use crate::events::{Event, EventKind, Handler};
pub use crate::friends::FriendId;
pub use crate::identity::{Address, AddressError, Identity, Keypair, Nospam, PublicKey};
pub use crate::protocol::{Direction, FileControl, UserStatus, PROTOCOL_VERSION};
pub use crate::routing::{MemoryNetwork, MemoryRouter, NetworkLocation, RouteError, Router};
pub use crate::session::ConnectionState;
pub use crate::transfer::TransferStatus;
