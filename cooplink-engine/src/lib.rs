//! # cooplink-engine
//!
//! Runtime logic for cooplink, embedded into the CLI or any other host.
//!
//! This crate provides:
//! - **Engine**: one event loop that owns the session listener, the peer
//!   index (one live session per peer) and the discovery service, driven
//!   through a cloneable [`EngineHandle`]
//! - **Session actors**: the pairing handshake, response timeouts and
//!   heartbeats for one peer, over any transport (`Connection` trait)
//! - **Transfer engine**: offer / decision negotiation, chunked sending,
//!   verified receiving into part files, progress and cancellation
//! - **Share bridge**: ordered input forwarding and last-write-wins
//!   clipboard sync through the host's [`Peripherals`]
//! - **Discovery**: UDP multicast beacons, liveness aging, and the
//!   [`DeviceRegistry`]
//! - **Transport implementations**: TCP and QUIC
//! - **Event bus**: [`EngineEvent`]s (requests, offers, progress, state
//!   changes) consumed by CLI loggers or UI subscribers

pub mod discovery;
pub mod engine;
pub mod history;
mod link;
pub mod progress;
pub mod quic;
pub mod registry;
pub mod session;
pub mod share;
pub mod tcp;
mod transfer;

pub use discovery::{DiscoveryConfig, DiscoveryEvent, MulticastBinder};
pub use engine::{Engine, EngineConfig, EngineEvent, EngineHandle, Platform, SessionInfo};
pub use history::TransferRecord;
pub use progress::Progress;
pub use registry::DeviceRegistry;
pub use session::SessionEvent;
pub use share::{NullPeripherals, Peripherals};
