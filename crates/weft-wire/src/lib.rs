//! weft-wire: Wire-level data model for the weft RPC protocol.
//!
//! This crate defines:
//! - The dynamic value tree ([`Value`]) that call arguments, results, and
//!   stream payloads are made of
//! - Protocol messages ([`Message`], [`Control`], [`Command`])
//! - The `{"streamRef": id}` reference-token encoding for live streams
//! - The JSON codec ([`encode`], [`decode`])
//!
//! Everything here is transport-agnostic: a message is a structural value
//! that some surrounding transport serializes and delivers in order, without
//! loss or duplication. The engine lives in `weft-session`.

mod message;
mod value;

pub use message::{Command, Control, Message, ReplyPayload, WireError, decode, encode};
pub use value::{StreamSlot, Value};
