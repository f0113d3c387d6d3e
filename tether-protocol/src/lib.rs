//! tether-protocol: Shared IPC definitions for client-server communication
//!
//! This crate defines all message types and data structures exchanged between
//! a tether client (the browser-extension gateway, or any other frontend) and
//! the tether broker daemon over Unix sockets.

pub mod codec;
pub mod messages;
pub mod types;

// Re-export main types at crate root
pub use codec::{ClientCodec, CodecError, ServerCodec};
pub use messages::{ClientMessage, ErrorCode, ServerMessage};
pub use types::{
    BackingMode, ProcessKind, ResizeSource, SpawnOptions, TerminalInfo, TerminalState,
};

/// Current protocol version
pub const PROTOCOL_VERSION: u32 = 1;
