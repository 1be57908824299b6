//! Wire types for the lab multiplayer channel bus.
//!
//! This crate defines the protocol spoken between web clients and the
//! backend over the single multiplexed WebSocket endpoint:
//!
//! ```text
//! Frontend <--[WS: subscribe/snapshot/delta/event]--> Backend
//! ```
//!
//! The channel set is closed and compile-time: every channel a client can
//! subscribe to is a [`ChannelKind`] variant, and a concrete subscription
//! target is a [`ChannelPath`] (a kind plus its optional `{uuid}` param).
//!
//! ## Design principles
//!
//! 1. **Snapshots first.** A subscriber always receives one snapshot for a
//!    channel before any delta on it.
//! 2. **Deltas are self-describing.** Array channels use add/remove/update/
//!    append, object channels use patch; clients fold them into the local
//!    snapshot without extra context.
//! 3. **Client events are scoped.** A client event is only accepted on a
//!    channel the socket is already subscribed to.

pub mod channels;
pub mod deltas;
pub mod events;
pub mod messages;

pub use channels::{ChannelKind, ChannelPath, ChannelPathError};
pub use deltas::Delta;
pub use events::{BrowserInputEvent, SetTypingEvent};
pub use messages::{ClientMessage, ServerMessage};
