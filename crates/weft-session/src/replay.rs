//! Latest-value replay primitive.
//!
//! [`ReplayLatest`] is a multicast cell that caches the most recent value:
//! a new subscriber immediately receives the latest value (if one arrived
//! already) followed by all subsequent events. Errors are forwarded, and
//! independent subscribers share the one upstream source.
//!
//! The call engine arms one of these per outstanding call *before* the Call
//! message is emitted, which closes the race between "send request" and
//! "start listening for the response": even if the response lands first, the
//! cached value is waiting for the eventual subscriber.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use weft_wire::Value;

use crate::subject::{Event, StreamError, Subject};

struct ReplayState {
    latest: Option<Value>,
    terminal: Option<Event>,
    subscribers: Vec<mpsc::UnboundedSender<Event>>,
}

/// Multicast, latest-value-caching event cell.
#[derive(Clone)]
pub struct ReplayLatest {
    state: Arc<Mutex<ReplayState>>,
}

impl ReplayLatest {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ReplayState {
                latest: None,
                terminal: None,
                subscribers: Vec::new(),
            })),
        }
    }

    /// Wrap an existing subject: a task forwards its events into the cell.
    pub fn wrap(subject: &Subject) -> Self {
        let cell = Self::new();
        let forward = cell.clone();
        let mut sub = subject.subscribe();
        tokio::spawn(async move {
            loop {
                match sub.recv().await {
                    Ok(Some(v)) => forward.next(v),
                    Ok(None) => {
                        forward.complete();
                        break;
                    }
                    Err(StreamError::Errored(v)) => {
                        forward.error(v);
                        break;
                    }
                }
            }
        });
        cell
    }

    pub fn next(&self, value: Value) {
        let senders: Vec<_> = {
            let mut st = self.state.lock();
            if st.terminal.is_some() {
                return;
            }
            st.latest = Some(value.clone());
            st.subscribers.retain(|tx| !tx.is_closed());
            st.subscribers.to_vec()
        };
        for tx in senders {
            let _ = tx.send(Event::Next(value.clone()));
        }
    }

    pub fn error(&self, value: Value) {
        self.terminate(Event::Error(value));
    }

    pub fn complete(&self) {
        self.terminate(Event::Completed);
    }

    fn terminate(&self, event: Event) {
        let senders: Vec<_> = {
            let mut st = self.state.lock();
            if st.terminal.is_some() {
                return;
            }
            st.terminal = Some(event.clone());
            st.subscribers.drain(..).collect()
        };
        for tx in senders {
            let _ = tx.send(event.clone());
        }
    }

    /// Subscribe; the latest cached value (if any) is delivered first.
    pub fn subscribe(&self) -> ReplaySubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut st = self.state.lock();
            if let Some(v) = &st.latest {
                let _ = tx.send(Event::Next(v.clone()));
            }
            match &st.terminal {
                Some(t) => {
                    let _ = tx.send(t.clone());
                }
                None => st.subscribers.push(tx),
            }
        }
        ReplaySubscription { rx }
    }
}

impl Default for ReplayLatest {
    fn default() -> Self {
        Self::new()
    }
}

/// A subscriber handle on a [`ReplayLatest`] cell.
pub struct ReplaySubscription {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl ReplaySubscription {
    /// Receive the next event; `None` when every cell handle is gone
    /// without a terminal event having been pushed.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}
