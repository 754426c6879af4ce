//! Stream lifecycle registry.
//!
//! One registry per engine, owning the three id-keyed tables:
//!
//! - `exposed`: locally owned streams offered for remote subscription
//! - `forwarding`: active subscriptions relaying an exposed stream's events
//!   to the peer as control messages
//! - `proxies`: locally created sink/source pairs standing in for streams
//!   the peer owns
//!
//! All transitions happen under short `parking_lot` lock scopes; nothing is
//! held across an await. Control messages for unknown ids are ignored - the
//! referenced stream may have legitimately terminated on one side before the
//! other side's message arrived.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use ulid::Ulid;

use weft_wire::{Command, Control, Message};

use crate::subject::{
    Publisher, StreamError, Subject, SubjectHooks, subject_with_hooks,
};

/// Abort-on-drop guard for a forwarding task.
struct ForwardingGuard {
    handle: JoinHandle<()>,
}

impl Drop for ForwardingGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

struct ProxyEntry {
    publisher: Publisher,
    subject: Subject,
}

pub(crate) struct RegistryInner {
    outbound: mpsc::UnboundedSender<Message>,
    exposed: Mutex<HashMap<String, Subject>>,
    forwarding: Mutex<HashMap<String, ForwardingGuard>>,
    proxies: Mutex<HashMap<String, ProxyEntry>>,
}

/// Snapshot of the registry's table sizes, for tests and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    pub exposed: usize,
    pub forwarding: usize,
    pub proxies: usize,
}

/// Per-engine stream lifecycle state.
#[derive(Clone)]
pub struct Registry {
    pub(crate) inner: Arc<RegistryInner>,
}

impl Registry {
    pub(crate) fn new(outbound: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                outbound,
                exposed: Mutex::new(HashMap::new()),
                forwarding: Mutex::new(HashMap::new()),
                proxies: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            exposed: self.inner.exposed.lock().len(),
            forwarding: self.inner.forwarding.lock().len(),
            proxies: self.inner.proxies.lock().len(),
        }
    }

    /// Expose a locally owned stream under a fresh id and arrange for the
    /// entry to disappear once the stream terminates, whether or not the
    /// peer ever subscribed.
    pub(crate) fn register_exposed(&self, subject: Subject) -> String {
        let id = Ulid::new().to_string();
        self.inner.exposed.lock().insert(id.clone(), subject.clone());
        let weak = Arc::downgrade(&self.inner);
        let watch_id = id.clone();
        subject.on_terminal(Box::new(move |_event| {
            if let Some(inner) = weak.upgrade() {
                let removed = inner.exposed.lock().remove(&watch_id);
                drop(removed);
            }
        }));
        trace!(%id, "exposed stream");
        id
    }

    /// Create (or reuse) the local proxy standing in for the peer's stream
    /// `id`. The first local subscriber emits `subscribe` exactly once; the
    /// last one to drop emits `unsubscribe` and removes the entry.
    pub(crate) fn proxy(&self, id: &str) -> Subject {
        let mut proxies = self.inner.proxies.lock();
        if let Some(entry) = proxies.get(id) {
            return entry.subject.clone();
        }
        let hooks = Arc::new(ProxyHooks {
            id: id.to_string(),
            outbound: self.inner.outbound.clone(),
            registry: Arc::downgrade(&self.inner),
        });
        let (publisher, subject) = subject_with_hooks(Some(hooks));
        proxies.insert(
            id.to_string(),
            ProxyEntry {
                publisher,
                subject: subject.clone(),
            },
        );
        trace!(%id, "created proxy");
        subject
    }

    /// React to an inbound stream-control message.
    pub(crate) fn handle_control(&self, control: Control) {
        let Control { command, id, value } = control;
        match command {
            Command::Subscribe => self.start_forwarding(&id),
            Command::Unsubscribe => {
                // Idempotent: absence of a forwarding entry is a no-op.
                let removed = self.inner.forwarding.lock().remove(&id);
                if removed.is_some() {
                    debug!(%id, "stopped forwarding on unsubscribe");
                }
                drop(removed);
            }
            Command::Next => {
                let Some(publisher) = self.proxy_publisher(&id) else {
                    trace!(%id, "next for unknown proxy dropped");
                    return;
                };
                let payload = self.unconvert(value.unwrap_or(weft_wire::Value::Null));
                publisher.next(payload);
            }
            Command::Error => {
                let Some(entry) = self.take_proxy(&id) else {
                    trace!(%id, "error for unknown proxy dropped");
                    return;
                };
                let payload = self.unconvert(value.unwrap_or(weft_wire::Value::Null));
                entry.publisher.error(payload);
            }
            Command::Completed => {
                let Some(entry) = self.take_proxy(&id) else {
                    trace!(%id, "completed for unknown proxy dropped");
                    return;
                };
                entry.publisher.complete();
            }
        }
    }

    fn proxy_publisher(&self, id: &str) -> Option<Publisher> {
        self.inner
            .proxies
            .lock()
            .get(id)
            .map(|entry| entry.publisher.clone())
    }

    fn take_proxy(&self, id: &str) -> Option<ProxyEntry> {
        self.inner.proxies.lock().remove(id)
    }

    /// Begin relaying the exposed stream `id` to the peer.
    fn start_forwarding(&self, id: &str) {
        let Some(subject) = self.inner.exposed.lock().get(id).cloned() else {
            warn!(%id, "subscribe for unknown stream ignored");
            return;
        };
        // Subscribe synchronously so no event published between now and the
        // task's first poll is missed.
        let mut subscription = subject.subscribe();
        let registry = self.clone();
        let outbound = self.inner.outbound.clone();
        let task_id = id.to_string();
        // Hold the table lock across spawn + insert so the task's own
        // terminal cleanup cannot race ahead of the insert.
        let mut forwarding = self.inner.forwarding.lock();
        let handle = tokio::spawn(async move {
            loop {
                match subscription.recv().await {
                    Ok(Some(value)) => {
                        let converted = registry.convert(value);
                        let _ = outbound.send(Message::control(
                            Command::Next,
                            task_id.clone(),
                            Some(converted),
                        ));
                    }
                    Ok(None) => {
                        let _ =
                            outbound.send(Message::control(Command::Completed, task_id.clone(), None));
                        break;
                    }
                    Err(StreamError::Errored(value)) => {
                        let converted = registry.convert(value);
                        let _ = outbound.send(Message::control(
                            Command::Error,
                            task_id.clone(),
                            Some(converted),
                        ));
                        break;
                    }
                }
            }
            // Terminal reached and reported; retire the forwarding entry.
            let removed = registry.inner.forwarding.lock().remove(&task_id);
            drop(removed);
        });
        let replaced = forwarding.insert(id.to_string(), ForwardingGuard { handle });
        drop(forwarding);
        if replaced.is_some() {
            debug!(%id, "duplicate subscribe replaced forwarding subscription");
        }
        drop(replaced);
        debug!(%id, "forwarding started");
    }
}

struct ProxyHooks {
    id: String,
    outbound: mpsc::UnboundedSender<Message>,
    registry: Weak<RegistryInner>,
}

impl SubjectHooks for ProxyHooks {
    fn on_first_subscribe(&self) {
        let _ = self
            .outbound
            .send(Message::control(Command::Subscribe, self.id.clone(), None));
    }

    fn on_last_unsubscribe(&self) {
        let _ = self
            .outbound
            .send(Message::control(Command::Unsubscribe, self.id.clone(), None));
        if let Some(inner) = self.registry.upgrade() {
            let removed = inner.proxies.lock().remove(&self.id);
            drop(removed);
        }
    }
}
