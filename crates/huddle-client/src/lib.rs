//! Huddle client library
//!
//! This crate provides the voice room client: the signaling connection, the
//! device and capture abstractions, the session state machine and the room
//! view model a UI renders from.

pub mod media;
pub mod network;
pub mod state;
