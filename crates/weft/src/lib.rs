//! Umbrella crate for the weft RPC engine.
//!
//! Pulls the wire model ([`weft_wire`]) and the session engine
//! ([`weft_session`]) into one dependency. A minimal endpoint:
//!
//! ```ignore
//! use weft::{Engine, NoProvider};
//!
//! let (engine, driver) = Engine::new(NoProvider);
//! tokio::spawn(driver.run());
//! // feed engine.inbound_sender() from a transport and drain
//! // engine.take_outbound() into it, then engine.call(..) away.
//! ```

pub use weft_wire::{
    Command, Control, Message, ReplyPayload, StreamSlot, Value, WireError, decode, encode,
};

pub use weft_session::{
    BoxFuture, Call, CallError, Engine, EngineDriver, Event, NoProvider, Provider, Publisher,
    Registry, RegistryStats, ReplayLatest, ReplaySubscription, StreamError, Subject, Subscription,
    as_stream, stream_value, subject, unknown_method,
};
