//! Message router and call engine.
//!
//! One [`Engine`] per peer endpoint. The engine's [`EngineDriver`] consumes
//! the inbound message sequence and demultiplexes it:
//!
//! ```text
//!                      ┌───────────────────────────────┐
//!                      │            Engine             │
//!                      ├───────────────────────────────┤
//!                      │  pending: key -> ReplayLatest │
//!                      │  registry: stream lifecycle   │
//!                      │  provider: dispatch target    │
//!                      └──────────────┬────────────────┘
//!                                     │
//!                               demux loop
//!                                     │
//!        ┌────────────────────────────┼────────────────────────────┐
//!        │                            │                            │
//!  call? (has name)          response? (pending)          control? (streamCtl)
//!        │                            │                            │
//!  ┌─────▼──────┐           ┌─────────▼─────────┐       ┌──────────▼─────────┐
//!  │ spawn      │           │ deliver into the  │       │ route to lifecycle │
//!  │ dispatch,  │           │ armed replay cell │       │ registry           │
//!  │ respond    │           └───────────────────┘       └────────────────────┘
//!  └────────────┘
//! ```
//!
//! A provider failure never terminates the demux loop: it becomes an error
//! response correlated by the call's key.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use ulid::Ulid;

use weft_wire::{Message, ReplyPayload, Value};

use crate::errors::CallError;
use crate::registry::{Registry, RegistryStats};
use crate::replay::{ReplayLatest, ReplaySubscription};
use crate::subject::{Event, StreamError, Subscription, as_stream};

/// Boxed future returned by provider dispatch.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// The set of locally callable methods.
///
/// A method's outcome may be a scalar, an async computation, or a live
/// stream (`stream_value(subject)`); the engine treats all three uniformly
/// through the conversion layer. Failures - including an unrecognized
/// method name - are reported as `Err` and become error responses.
pub trait Provider: Send + Sync + 'static {
    fn dispatch(&self, method: &str, args: Vec<Value>) -> BoxFuture<Result<Value, Value>>;
}

/// Conventional error payload for a method the provider does not implement.
pub fn unknown_method(method: &str) -> Value {
    Value::String(format!("unknown method: {method}"))
}

/// A provider with no methods. Useful for call-only endpoints.
pub struct NoProvider;

impl Provider for NoProvider {
    fn dispatch(&self, method: &str, _args: Vec<Value>) -> BoxFuture<Result<Value, Value>> {
        let err = unknown_method(method);
        Box::pin(async move { Err(err) })
    }
}

struct EngineShared {
    provider: Arc<dyn Provider>,
    registry: Registry,
    outbound_tx: mpsc::UnboundedSender<Message>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    inbound_tx: mpsc::UnboundedSender<Message>,
    pending: Mutex<HashMap<String, ReplayLatest>>,
}

impl EngineShared {
    fn handle(self: &Arc<Self>, message: Message) {
        match message {
            Message::Call { key, name, args } => {
                trace!(method = %name, %key, "inbound call");
                let args: Vec<Value> = args
                    .into_iter()
                    .map(|a| self.registry.unconvert(a))
                    .collect();
                let shared = Arc::clone(self);
                tokio::spawn(async move {
                    let outcome = shared.provider.dispatch(&name, args).await;
                    let result = match outcome {
                        Ok(value) => ReplyPayload::Value(shared.registry.convert(value)),
                        Err(error) => {
                            debug!(method = %name, %key, "provider dispatch failed");
                            ReplyPayload::Error(shared.registry.convert(error))
                        }
                    };
                    let _ = shared.outbound_tx.send(Message::Response { key, result });
                });
            }
            Message::Response { key, result } => {
                let cell = self.pending.lock().remove(&key);
                let Some(cell) = cell else {
                    warn!(%key, "response for unknown correlation key dropped");
                    return;
                };
                match result {
                    ReplyPayload::Value(v) => {
                        cell.next(self.registry.unconvert(v));
                        cell.complete();
                    }
                    ReplyPayload::Error(e) => cell.error(self.registry.unconvert(e)),
                }
            }
            Message::Control(control) => self.registry.handle_control(control),
        }
    }
}

/// Handle to one peer endpoint of the RPC engine.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<EngineShared>,
}

impl Engine {
    /// Create an engine around a provider. Spawn the returned driver to
    /// start processing inbound messages:
    ///
    /// ```ignore
    /// let (engine, driver) = Engine::new(MyProvider);
    /// tokio::spawn(driver.run());
    /// ```
    pub fn new(provider: impl Provider) -> (Engine, EngineDriver) {
        Self::with_provider(Arc::new(provider))
    }

    pub fn with_provider(provider: Arc<dyn Provider>) -> (Engine, EngineDriver) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(EngineShared {
            provider,
            registry: Registry::new(outbound_tx.clone()),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            inbound_tx,
            pending: Mutex::new(HashMap::new()),
        });
        (
            Engine {
                shared: shared.clone(),
            },
            EngineDriver {
                shared,
                inbound: inbound_rx,
            },
        )
    }

    /// Invoke method `name` on the peer's provider.
    ///
    /// The response listener is armed before the Call message is emitted, so
    /// a response can never be missed. The returned [`Call`] yields either a
    /// single value or, when the method resolved to a stream, that stream's
    /// ongoing events.
    pub fn call(&self, name: &str, args: Vec<Value>) -> Call {
        let key = Ulid::new().to_string();
        let cell = ReplayLatest::new();
        self.shared.pending.lock().insert(key.clone(), cell.clone());
        let args: Vec<Value> = args
            .into_iter()
            .map(|a| self.shared.registry.convert(a))
            .collect();
        debug!(method = name, %key, "outgoing call");
        let _ = self.shared.outbound_tx.send(Message::Call {
            key,
            name: name.to_string(),
            args,
        });
        Call {
            state: CallState::Waiting(cell.subscribe()),
        }
    }

    /// Sender for feeding inbound messages from a transport.
    pub fn inbound_sender(&self) -> mpsc::UnboundedSender<Message> {
        self.shared.inbound_tx.clone()
    }

    /// Claim the outbound message sequence. Returns `None` if a transport
    /// (or a previous `couple`) already claimed it.
    pub fn take_outbound(&self) -> Option<mpsc::UnboundedReceiver<Message>> {
        self.shared.outbound_rx.lock().take()
    }

    /// Wire two co-located engines directly together: each one's outbound
    /// sequence feeds the other's inbound sequence. Real deployments replace
    /// this with a transport adapter that preserves ordering and message
    /// boundaries.
    pub fn couple(&self, other: &Engine) {
        Self::pump(self, other);
        Self::pump(other, self);
    }

    fn pump(from: &Engine, to: &Engine) {
        let Some(mut rx) = from.take_outbound() else {
            warn!("outbound sequence already claimed; couple skipped one direction");
            return;
        };
        let tx = to.inbound_sender();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if tx.send(message).is_err() {
                    break;
                }
            }
        });
    }

    /// Current sizes of the lifecycle tables.
    pub fn registry_stats(&self) -> RegistryStats {
        self.shared.registry.stats()
    }
}

/// Owns the inbound sequence; `run()` is the engine's demux loop.
pub struct EngineDriver {
    shared: Arc<EngineShared>,
    inbound: mpsc::UnboundedReceiver<Message>,
}

impl EngineDriver {
    /// Process inbound messages until the inbound channel closes.
    pub async fn run(mut self) {
        while let Some(message) = self.inbound.recv().await {
            self.shared.handle(message);
        }
        debug!("inbound sequence closed; driver exiting");
    }
}

enum CallState {
    /// Waiting for the correlated response.
    Waiting(ReplaySubscription),
    /// The response was a stream; its events flow through.
    Streaming(Subscription),
    /// The response was a scalar, already delivered (or the call failed).
    Done,
}

/// The in-flight result of [`Engine::call`].
///
/// Behaves as a stream: a scalar response yields exactly one value and then
/// `None`; a stream response flattens into the stream's ongoing events. This
/// keeps a method's return type polymorphic between "scalar" and "stream"
/// without a distinct API.
pub struct Call {
    state: CallState,
}

impl Call {
    /// Next value of the result sequence.
    pub async fn recv(&mut self) -> Result<Option<Value>, CallError> {
        loop {
            match &mut self.state {
                CallState::Waiting(reply) => match reply.recv().await {
                    Some(Event::Next(value)) => {
                        if let Some(subject) = as_stream(&value) {
                            self.state = CallState::Streaming(subject.subscribe());
                            continue;
                        }
                        self.state = CallState::Done;
                        return Ok(Some(value));
                    }
                    Some(Event::Error(e)) => {
                        self.state = CallState::Done;
                        return Err(CallError::Remote(e));
                    }
                    Some(Event::Completed) | None => {
                        self.state = CallState::Done;
                        return Err(CallError::Disconnected);
                    }
                },
                CallState::Streaming(subscription) => match subscription.recv().await {
                    Ok(Some(value)) => return Ok(Some(value)),
                    Ok(None) => {
                        self.state = CallState::Done;
                        return Ok(None);
                    }
                    Err(StreamError::Errored(e)) => {
                        self.state = CallState::Done;
                        return Err(CallError::Stream(e));
                    }
                },
                CallState::Done => return Ok(None),
            }
        }
    }

    /// Resolve the call to its single value. Fails with
    /// [`CallError::Disconnected`] if the sequence ends without one.
    pub async fn value(&mut self) -> Result<Value, CallError> {
        match self.recv().await? {
            Some(value) => Ok(value),
            None => Err(CallError::Disconnected),
        }
    }
}
