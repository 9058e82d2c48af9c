//! # cooplink-core
//!
//! Shared building blocks for cooplink, a LAN pairing, file transfer and
//! input/clipboard sharing protocol.
//!
//! This crate provides the foundational types used by [`cooplink-engine`]
//! and the `cooplink` CLI. It spawns no tasks.
//!
//! ## Responsibilities
//!
//! - **Protocol primitives** — frame format (magic / version / type / length),
//!   typed messages for the session handshake, transfers and sharing, JSON
//!   payload encoding and the binary file chunk layout.
//!
//! - **Transport traits** — `Connection`, `Listener`, `ListenerFactory`,
//!   `Connector`, implemented by the engine for TCP and QUIC.
//!
//! - **Domain model** — devices, settings, error codes, and the session and
//!   transfer state machines as explicit transition tables.
//!
//! - **Filesystem helpers** — filename sanitisation, collision rename
//!   (`file (1).ext`), verified part-file writes, free-space probing.

pub mod device;
pub mod error;
pub mod fs;
pub mod protocol;
pub mod settings;
pub mod state;
pub mod tls;
pub mod transport;
