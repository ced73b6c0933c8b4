//! Synchronous publish/subscribe on string topics.
//!
//! [`EventBus::emit`] runs every listener for the topic, in registration
//! order, before returning. A listener returning `Err` is logged and counted
//! but never stops the remaining listeners and never reaches the emitter.
//! Every emission is appended to a bounded trace of recent events.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// An event as seen by listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub topic: String,
    pub payload: serde_json::Value,
    /// Emission sequence number, unique per bus.
    pub seq: u64,
}

/// Handle returned by [`EventBus::on`], used to remove a single listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ListenerId(pub u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener#{}", self.0)
    }
}

/// A listener callback.
pub type ListenerFn = Box<dyn FnMut(&Event) -> anyhow::Result<()>>;

/// One entry of the recent-event trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventTraceEntry {
    pub seq: u64,
    pub topic: String,
    /// Listeners invoked for this emission.
    pub listeners: usize,
    /// Listeners that returned an error.
    pub failures: usize,
}

struct Listener {
    id: ListenerId,
    owner: Option<String>,
    func: ListenerFn,
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Topic-keyed listener table plus a bounded emission trace.
pub struct EventBus {
    /// Listeners per topic, each list in registration order.
    topics: BTreeMap<String, Vec<Listener>>,
    next_listener: u64,
    next_seq: u64,
    trace: VecDeque<EventTraceEntry>,
    trace_capacity: usize,
}

impl EventBus {
    /// Create a bus that keeps the last `trace_capacity` emissions.
    pub fn new(trace_capacity: usize) -> Self {
        Self {
            topics: BTreeMap::new(),
            next_listener: 0,
            next_seq: 0,
            trace: VecDeque::with_capacity(trace_capacity),
            trace_capacity,
        }
    }

    /// Subscribe `listener` to `topic`.
    pub fn on<F>(&mut self, topic: &str, listener: F) -> ListenerId
    where
        F: FnMut(&Event) -> anyhow::Result<()> + 'static,
    {
        self.insert(topic, None, Box::new(listener))
    }

    /// Subscribe `listener` to `topic` on behalf of `owner`, so that
    /// [`off_owner`](Self::off_owner) can release it in bulk.
    pub fn on_owned<F>(&mut self, topic: &str, owner: &str, listener: F) -> ListenerId
    where
        F: FnMut(&Event) -> anyhow::Result<()> + 'static,
    {
        self.insert(topic, Some(owner.to_owned()), Box::new(listener))
    }

    fn insert(&mut self, topic: &str, owner: Option<String>, func: ListenerFn) -> ListenerId {
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        self.topics
            .entry(topic.to_owned())
            .or_default()
            .push(Listener { id, owner, func });
        id
    }

    /// Remove one listener from `topic`, or every listener on it when `id` is
    /// `None`. Returns how many were removed.
    pub fn off(&mut self, topic: &str, id: Option<ListenerId>) -> usize {
        let Some(listeners) = self.topics.get_mut(topic) else {
            return 0;
        };
        let before = listeners.len();
        match id {
            Some(id) => listeners.retain(|l| l.id != id),
            None => listeners.clear(),
        }
        let removed = before - listeners.len();
        if listeners.is_empty() {
            self.topics.remove(topic);
        }
        removed
    }

    /// Remove every listener registered by `owner` on any topic.
    ///
    /// Safe to call for an owner with nothing registered.
    pub fn off_owner(&mut self, owner: &str) -> usize {
        let mut removed = 0;
        self.topics.retain(|_, listeners| {
            let before = listeners.len();
            listeners.retain(|l| l.owner.as_deref() != Some(owner));
            removed += before - listeners.len();
            !listeners.is_empty()
        });
        removed
    }

    /// Deliver `payload` to every listener of `topic`.
    ///
    /// Returns the number of listeners that failed.
    pub fn emit(&mut self, topic: &str, payload: serde_json::Value) -> usize {
        let event = Event {
            topic: topic.to_owned(),
            payload,
            seq: self.next_seq,
        };
        self.next_seq += 1;

        let mut invoked = 0;
        let mut failures = 0;
        if let Some(listeners) = self.topics.get_mut(topic) {
            for listener in listeners.iter_mut() {
                invoked += 1;
                if let Err(e) = (listener.func)(&event) {
                    failures += 1;
                    tracing::warn!(
                        topic,
                        listener = %listener.id,
                        error = %e,
                        "event listener failed"
                    );
                }
            }
        }

        self.record(EventTraceEntry {
            seq: event.seq,
            topic: event.topic,
            listeners: invoked,
            failures,
        });
        failures
    }

    fn record(&mut self, entry: EventTraceEntry) {
        if self.trace_capacity == 0 {
            return;
        }
        if self.trace.len() == self.trace_capacity {
            self.trace.pop_front();
        }
        self.trace.push_back(entry);
    }

    /// Recent emissions, oldest first.
    pub fn trace(&self) -> &VecDeque<EventTraceEntry> {
        &self.trace
    }

    pub fn listener_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, Vec::len)
    }

    /// Whether the listener `id` is still subscribed to any topic.
    pub fn is_subscribed(&self, id: ListenerId) -> bool {
        self.topics
            .values()
            .any(|listeners| listeners.iter().any(|l| l.id == id))
    }

    /// Drop every listener and the trace.
    pub fn clear(&mut self) {
        self.topics.clear();
        self.trace.clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(128)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("topics", &self.topics.keys().collect::<Vec<_>>())
            .field("next_seq", &self.next_seq)
            .field("trace_len", &self.trace.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn recorder() -> (Rc<RefCell<Vec<String>>>, impl Fn(&str) -> ListenerFn) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let handle = log.clone();
        let make = move |tag: &str| -> ListenerFn {
            let log = handle.clone();
            let tag = tag.to_owned();
            Box::new(move |event: &Event| {
                log.borrow_mut().push(format!("{tag}:{}", event.payload));
                anyhow::Ok(())
            })
        };
        (log, make)
    }

    // -- 1. Delivery ---------------------------------------------------------

    #[test]
    fn listeners_run_in_registration_order() {
        let (log, make) = recorder();
        let mut bus = EventBus::default();
        bus.on("hit", make("a"));
        bus.on("hit", make("b"));
        bus.on("miss", make("c"));

        bus.emit("hit", serde_json::json!(1));

        assert_eq!(*log.borrow(), vec!["a:1", "b:1"]);
    }

    #[test]
    fn failing_listener_does_not_block_others() {
        let (log, make) = recorder();
        let mut bus = EventBus::default();
        bus.on("hit", |_e: &Event| Err(anyhow::anyhow!("boom")));
        bus.on("hit", make("after"));

        let failures = bus.emit("hit", serde_json::json!(2));

        assert_eq!(failures, 1);
        assert_eq!(*log.borrow(), vec!["after:2"]);
        assert_eq!(bus.trace().back().unwrap().failures, 1);
    }

    // -- 2. Removal ----------------------------------------------------------

    #[test]
    fn off_by_id_and_all() {
        let (log, make) = recorder();
        let mut bus = EventBus::default();
        let a = bus.on("hit", make("a"));
        bus.on("hit", make("b"));
        bus.on("hit", make("c"));

        assert_eq!(bus.off("hit", Some(a)), 1);
        bus.emit("hit", serde_json::json!(0));
        assert_eq!(*log.borrow(), vec!["b:0", "c:0"]);

        assert_eq!(bus.off("hit", None), 2);
        assert_eq!(bus.listener_count("hit"), 0);
        assert_eq!(bus.off("nothing", None), 0);
    }

    #[test]
    fn off_owner_is_idempotent() {
        let (_log, make) = recorder();
        let mut bus = EventBus::default();
        bus.on_owned("a", "hud", make("x"));
        bus.on_owned("b", "hud", make("y"));
        bus.on("a", make("z"));

        assert_eq!(bus.off_owner("hud"), 2);
        assert_eq!(bus.off_owner("hud"), 0);
        assert_eq!(bus.listener_count("a"), 1);
        assert_eq!(bus.listener_count("b"), 0);
    }

    #[test]
    fn subscription_lookup_follows_removal() {
        let (_log, make) = recorder();
        let mut bus = EventBus::default();
        let kept = bus.on("a", make("x"));
        let owned = bus.on_owned("b", "hud", make("y"));

        assert!(bus.is_subscribed(owned));
        bus.off_owner("hud");
        assert!(!bus.is_subscribed(owned));
        assert!(bus.is_subscribed(kept));
    }

    // -- 3. Trace ------------------------------------------------------------

    #[test]
    fn trace_is_bounded() {
        let mut bus = EventBus::new(3);
        for i in 0..5 {
            bus.emit("tick", serde_json::json!(i));
        }
        let seqs: Vec<u64> = bus.trace().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![2, 3, 4]);
    }
}
