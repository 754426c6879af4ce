//! Dual-role stream primitive.
//!
//! The engine needs an entity that is simultaneously an event sink (inbound
//! control messages push into it) and an event source (local code subscribes
//! to it). That dual role is modelled explicitly as a pair: [`subject()`]
//! returns a [`Publisher`] (the sink half) and a [`Subject`] (the multicast
//! source half) sharing one core.
//!
//! Semantics:
//! - Multicast: every active subscription sees every event pushed after it
//!   subscribed.
//! - Warm-up buffer: events pushed before the *first ever* subscriber are
//!   retained and replayed to that first subscriber, so a producer may run
//!   ahead of the (asynchronous) remote subscription handshake.
//! - Sticky terminals: completion and error are final; later pushes are
//!   no-ops, and subscribing to a terminated subject yields the terminal
//!   event immediately.
//! - Dropping the last [`Publisher`] completes the subject if it has not
//!   already terminated.
//! - Dropping a [`Subscription`] detaches it (cooperative cancellation).

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use weft_wire::{StreamSlot, Value};

/// One event on a stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Next(Value),
    Error(Value),
    Completed,
}

/// Terminal error of a stream, surfaced by [`Subscription::recv`].
#[derive(Debug, Clone, PartialEq)]
pub enum StreamError {
    Errored(Value),
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::Errored(v) => write!(f, "stream errored: {v:?}"),
        }
    }
}

impl std::error::Error for StreamError {}

/// Observer of a subject's subscriber lifecycle.
///
/// The lifecycle registry installs these on proxy subjects so that local
/// subscribe/unsubscribe activity drives the wire protocol. Hooks are invoked
/// outside the subject lock and must not block.
pub(crate) trait SubjectHooks: Send + Sync {
    /// The subject gained its first ever subscriber (and is not terminal).
    fn on_first_subscribe(&self) {}
    /// The last subscriber dropped before the subject terminated.
    fn on_last_unsubscribe(&self) {}
}

struct SubjectState {
    subscribers: Vec<(u64, mpsc::UnboundedSender<Event>)>,
    backlog: VecDeque<Event>,
    terminal: Option<Event>,
    next_token: u64,
    active: usize,
    ever_subscribed: bool,
    publishers: usize,
    hooks: Option<Arc<dyn SubjectHooks>>,
    terminal_watchers: Vec<Box<dyn FnOnce(&Event) + Send>>,
}

struct SubjectCore {
    state: Mutex<SubjectState>,
}

impl SubjectCore {
    fn push_next(&self, value: Value) {
        let senders: Vec<_> = {
            let mut st = self.state.lock();
            if st.terminal.is_some() {
                return;
            }
            if !st.ever_subscribed {
                st.backlog.push_back(Event::Next(value));
                return;
            }
            st.subscribers.retain(|(_, tx)| !tx.is_closed());
            st.subscribers.iter().map(|(_, tx)| tx.clone()).collect()
        };
        for tx in senders {
            let _ = tx.send(Event::Next(value.clone()));
        }
    }

    fn terminate(&self, event: Event) {
        let (senders, watchers) = {
            let mut st = self.state.lock();
            if st.terminal.is_some() {
                return;
            }
            st.terminal = Some(event.clone());
            let senders: Vec<_> = st.subscribers.drain(..).map(|(_, tx)| tx).collect();
            // If nobody ever subscribed, the terminal (and the backlog ahead
            // of it) is still deliverable to a first subscriber; watchers are
            // deferred until that subscription happens.
            let watchers = if st.ever_subscribed {
                std::mem::take(&mut st.terminal_watchers)
            } else {
                Vec::new()
            };
            (senders, watchers)
        };
        for tx in senders {
            let _ = tx.send(event.clone());
        }
        for watcher in watchers {
            watcher(&event);
        }
    }
}

/// Create a sink/source pair sharing one stream core.
pub fn subject() -> (Publisher, Subject) {
    subject_with_hooks(None)
}

pub(crate) fn subject_with_hooks(hooks: Option<Arc<dyn SubjectHooks>>) -> (Publisher, Subject) {
    let core = Arc::new(SubjectCore {
        state: Mutex::new(SubjectState {
            subscribers: Vec::new(),
            backlog: VecDeque::new(),
            terminal: None,
            next_token: 0,
            active: 0,
            ever_subscribed: false,
            publishers: 1,
            hooks,
            terminal_watchers: Vec::new(),
        }),
    });
    (
        Publisher { core: core.clone() },
        Subject { core },
    )
}

/// The sink half: pushes events into the shared core.
pub struct Publisher {
    core: Arc<SubjectCore>,
}

impl Publisher {
    /// Push a value. Ignored after a terminal event.
    pub fn next(&self, value: Value) {
        self.core.push_next(value);
    }

    /// Terminate the stream with an error.
    pub fn error(&self, value: Value) {
        self.core.terminate(Event::Error(value));
    }

    /// Terminate the stream normally.
    pub fn complete(&self) {
        self.core.terminate(Event::Completed);
    }
}

impl Clone for Publisher {
    fn clone(&self) -> Self {
        self.core.state.lock().publishers += 1;
        Publisher {
            core: self.core.clone(),
        }
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        let last = {
            let mut st = self.core.state.lock();
            st.publishers -= 1;
            st.publishers == 0 && st.terminal.is_none()
        };
        if last {
            self.core.terminate(Event::Completed);
        }
    }
}

impl fmt::Debug for Publisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Publisher(..)")
    }
}

/// The multicast source half.
#[derive(Clone)]
pub struct Subject {
    core: Arc<SubjectCore>,
}

impl Subject {
    /// Attach a new subscriber.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut fire_first = false;
        let mut watchers = Vec::new();
        let mut terminal_event = None;
        let mut token = None;
        let hooks;
        {
            let mut st = self.core.state.lock();
            hooks = st.hooks.clone();
            if !st.ever_subscribed {
                st.ever_subscribed = true;
                for event in st.backlog.drain(..) {
                    let _ = tx.send(event);
                }
                if st.terminal.is_none() {
                    fire_first = true;
                } else {
                    watchers = std::mem::take(&mut st.terminal_watchers);
                    terminal_event = st.terminal.clone();
                }
            }
            if let Some(t) = &st.terminal {
                let _ = tx.send(t.clone());
            } else {
                let tok = st.next_token;
                st.next_token += 1;
                st.subscribers.push((tok, tx));
                st.active += 1;
                token = Some(tok);
            }
        }
        if fire_first && let Some(h) = &hooks {
            h.on_first_subscribe();
        }
        if let Some(event) = terminal_event {
            for watcher in watchers {
                watcher(&event);
            }
        }
        Subscription {
            core: self.core.clone(),
            rx,
            token,
        }
    }

    /// Whether the stream has reached a terminal state.
    pub fn is_terminated(&self) -> bool {
        self.core.state.lock().terminal.is_some()
    }

    /// Register a watcher invoked once when the stream terminates.
    ///
    /// A watcher on a never-subscribed subject is deferred until the first
    /// subscription drains the warm-up backlog, so a remote peer can still
    /// subscribe to a stream that completed before its `subscribe` arrived.
    pub(crate) fn on_terminal(&self, watcher: Box<dyn FnOnce(&Event) + Send>) {
        let fire_now = {
            let mut st = self.core.state.lock();
            match (&st.terminal, st.ever_subscribed) {
                (Some(event), true) => Some(event.clone()),
                _ => {
                    st.terminal_watchers.push(watcher);
                    return;
                }
            }
        };
        if let Some(event) = fire_now {
            watcher(&event);
        }
    }
}

impl fmt::Debug for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Subject(..)")
    }
}

/// An active subscription to a [`Subject`].
pub struct Subscription {
    core: Arc<SubjectCore>,
    rx: mpsc::UnboundedReceiver<Event>,
    token: Option<u64>,
}

impl Subscription {
    /// Receive the next event.
    ///
    /// `Ok(Some(v))` for a value, `Ok(None)` once the stream completes,
    /// `Err` if the stream terminated with an error.
    pub async fn recv(&mut self) -> Result<Option<Value>, StreamError> {
        match self.rx.recv().await {
            Some(Event::Next(v)) => Ok(Some(v)),
            Some(Event::Completed) | None => Ok(None),
            Some(Event::Error(v)) => Err(StreamError::Errored(v)),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(token) = self.token else {
            return;
        };
        let mut fire_last = false;
        let hooks;
        {
            let mut st = self.core.state.lock();
            hooks = st.hooks.clone();
            st.subscribers.retain(|(t, _)| *t != token);
            st.active = st.active.saturating_sub(1);
            if st.active == 0 && st.terminal.is_none() {
                fire_last = true;
            }
        }
        if fire_last && let Some(h) = hooks {
            h.on_last_unsubscribe();
        }
    }
}

/// Wrap a subject source as a [`Value`] so it can travel inside call
/// arguments, results, or stream payloads.
pub fn stream_value(subject: Subject) -> Value {
    Value::Stream(StreamSlot::new(subject))
}

/// Recover the subject from a stream-valued node, if it holds one.
pub fn as_stream(value: &Value) -> Option<Subject> {
    match value {
        Value::Stream(slot) => slot.downcast_ref::<Subject>().cloned(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn multicast_delivers_to_all_subscribers() {
        let (publisher, subject) = subject();
        let mut a = subject.subscribe();
        let mut b = subject.subscribe();
        publisher.next(Value::from(1));
        publisher.complete();
        assert_eq!(a.recv().await.unwrap(), Some(Value::from(1)));
        assert_eq!(a.recv().await.unwrap(), None);
        assert_eq!(b.recv().await.unwrap(), Some(Value::from(1)));
        assert_eq!(b.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn backlog_replays_to_first_subscriber() {
        let (publisher, subject) = subject();
        publisher.next(Value::from("a"));
        publisher.next(Value::from("b"));
        publisher.complete();
        let mut sub = subject.subscribe();
        assert_eq!(sub.recv().await.unwrap(), Some(Value::from("a")));
        assert_eq!(sub.recv().await.unwrap(), Some(Value::from("b")));
        assert_eq!(sub.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn terminal_is_sticky() {
        let (publisher, subject) = subject();
        let mut sub = subject.subscribe();
        publisher.complete();
        publisher.next(Value::from(99));
        assert_eq!(sub.recv().await.unwrap(), None);
        // Late subscriber sees the terminal immediately.
        let mut late = subject.subscribe();
        assert_eq!(late.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn error_surfaces_as_stream_error() {
        let (publisher, subject) = subject();
        let mut sub = subject.subscribe();
        publisher.error(Value::from("bad"));
        assert_eq!(
            sub.recv().await,
            Err(StreamError::Errored(Value::from("bad")))
        );
    }

    #[tokio::test]
    async fn dropping_last_publisher_completes() {
        let (publisher, subject) = subject();
        let second = publisher.clone();
        let mut sub = subject.subscribe();
        drop(publisher);
        second.next(Value::from(7));
        drop(second);
        assert_eq!(sub.recv().await.unwrap(), Some(Value::from(7)));
        assert_eq!(sub.recv().await.unwrap(), None);
    }

    struct CountingHooks {
        first: AtomicUsize,
        last: AtomicUsize,
    }

    impl SubjectHooks for CountingHooks {
        fn on_first_subscribe(&self) {
            self.first.fetch_add(1, Ordering::AcqRel);
        }
        fn on_last_unsubscribe(&self) {
            self.last.fetch_add(1, Ordering::AcqRel);
        }
    }

    #[tokio::test]
    async fn hooks_fire_once_for_shared_subscribers() {
        let hooks = Arc::new(CountingHooks {
            first: AtomicUsize::new(0),
            last: AtomicUsize::new(0),
        });
        let (_publisher, subject) = subject_with_hooks(Some(hooks.clone()));
        let a = subject.subscribe();
        let b = subject.subscribe();
        assert_eq!(hooks.first.load(Ordering::Acquire), 1);
        drop(a);
        assert_eq!(hooks.last.load(Ordering::Acquire), 0);
        drop(b);
        assert_eq!(hooks.last.load(Ordering::Acquire), 1);
    }

    #[tokio::test]
    async fn no_unsubscribe_hook_after_terminal() {
        let hooks = Arc::new(CountingHooks {
            first: AtomicUsize::new(0),
            last: AtomicUsize::new(0),
        });
        let (publisher, subject) = subject_with_hooks(Some(hooks.clone()));
        let sub = subject.subscribe();
        publisher.complete();
        drop(sub);
        assert_eq!(hooks.last.load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn deferred_terminal_watcher_fires_on_first_subscribe() {
        let fired = Arc::new(AtomicUsize::new(0));
        let (publisher, subject) = subject();
        publisher.next(Value::from(1));
        publisher.complete();
        let counter = fired.clone();
        subject.on_terminal(Box::new(move |_| {
            counter.fetch_add(1, Ordering::AcqRel);
        }));
        assert_eq!(fired.load(Ordering::Acquire), 0);
        let mut sub = subject.subscribe();
        assert_eq!(fired.load(Ordering::Acquire), 1);
        assert_eq!(sub.recv().await.unwrap(), Some(Value::from(1)));
        assert_eq!(sub.recv().await.unwrap(), None);
    }

    #[test]
    fn stream_value_roundtrips_through_slot() {
        let (_publisher, subj) = subject();
        let v = stream_value(subj);
        assert!(as_stream(&v).is_some());
        assert!(as_stream(&Value::from(1)).is_none());
    }
}
