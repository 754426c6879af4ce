//! Bidirectional RPC engine with live streams as first-class values.
//!
//! Two symmetric [`Engine`]s exchange three message kinds over any ordered,
//! message-framed transport: calls, correlated responses, and stream-control
//! tuples. Any call argument, result, or stream payload may itself contain a
//! live stream at arbitrary nesting depth; the conversion layer swaps streams
//! for reference tokens on the way out and for local proxies on the way in,
//! and the per-engine [`Registry`] keeps both sides' lifecycle tables in
//! step via subscribe/unsubscribe/next/error/completed control messages.

mod convert;
mod engine;
mod errors;
mod registry;
mod replay;
mod subject;

pub use engine::{BoxFuture, Call, Engine, EngineDriver, NoProvider, Provider, unknown_method};
pub use errors::CallError;
pub use registry::{Registry, RegistryStats};
pub use replay::{ReplayLatest, ReplaySubscription};
pub use subject::{
    Event, Publisher, StreamError, Subject, Subscription, as_stream, stream_value, subject,
};
