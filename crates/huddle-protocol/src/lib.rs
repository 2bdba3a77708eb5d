//! Huddle signaling protocol
//!
//! Every frame on the signaling WebSocket is a JSON envelope of the form
//! `{ "type": "<kebab-case>", "payload": { ... } }`. [`ClientMessage`] covers
//! client to server frames and [`ServerMessage`] covers server to client frames.

mod messages;
mod types;

pub use messages::{ClientMessage, ServerMessage};
pub use types::*;
