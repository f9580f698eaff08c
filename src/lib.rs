//! Client for a ledger event hub's bidirectional event stream.
//!
//! The crate is organized by concern:
//! - `events`: stream client, handshake, dispatch loop and wire types.
//! - `signing`: identity and signing collaborators for control messages.
//! - `retry`: bounded connect-attempt planning and timeout helpers.

/// Event stream client, protocol types, and adapter plumbing.
pub mod events;
/// Connection fallback planning and timeout helpers.
pub mod retry;
/// Identity and message signing.
pub mod signing;
