//! Listener tables for `on(event, listener)`.
//!
//! A small closed set of control notifications (`open`, `close`,
//! `reconnect`) sits next to an open, string-keyed map of application
//! events. On the client, registering an application listener is not
//! passive: it makes the session declare a subscription to the server.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Callback invoked with the event payload (`Null` for control events).
pub type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

/// Key of a listener table entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKey {
    Open,
    Close,
    Reconnect,
    App(String),
}

impl EventKey {
    pub fn parse(name: &str) -> Self {
        match name {
            "open" => EventKey::Open,
            "close" => EventKey::Close,
            "reconnect" => EventKey::Reconnect,
            other => EventKey::App(other.to_string()),
        }
    }

    pub fn is_reserved(&self) -> bool {
        !matches!(self, EventKey::App(_))
    }

    /// Application event name, if any.
    pub fn app_event(&self) -> Option<&str> {
        match self {
            EventKey::App(name) => Some(name),
            _ => None,
        }
    }
}

impl From<&str> for EventKey {
    fn from(name: &str) -> Self {
        EventKey::parse(name)
    }
}

impl From<String> for EventKey {
    fn from(name: String) -> Self {
        EventKey::parse(&name)
    }
}

/// Thread-safe listener table. Clones share listeners.
#[derive(Clone, Default)]
pub struct Dispatcher {
    listeners: Arc<RwLock<HashMap<EventKey, Vec<Listener>>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Returns true if it is the first one for `key`.
    pub fn on<F>(&self, key: EventKey, listener: F) -> bool
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let mut map = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        let entry = map.entry(key).or_default();
        entry.push(Arc::new(listener));
        entry.len() == 1
    }

    /// Invoke every listener for `key`. Returns how many ran.
    ///
    /// Listeners are called outside the table lock, so a listener may
    /// register further listeners.
    pub fn emit(&self, key: &EventKey, payload: &Value) -> usize {
        let snapshot: Vec<Listener> = {
            let map = self.listeners.read().unwrap_or_else(|e| e.into_inner());
            match map.get(key) {
                Some(list) => list.clone(),
                None => return 0,
            }
        };
        for listener in &snapshot {
            listener(payload);
        }
        snapshot.len()
    }

    pub fn has_listeners(&self, key: &EventKey) -> bool {
        let map = self.listeners.read().unwrap_or_else(|e| e.into_inner());
        map.get(key).is_some_and(|l| !l.is_empty())
    }

    /// Names of all application events with at least one listener.
    pub fn app_events(&self) -> Vec<String> {
        let map = self.listeners.read().unwrap_or_else(|e| e.into_inner());
        let mut events: Vec<String> = map
            .keys()
            .filter_map(|k| k.app_event().map(str::to_string))
            .collect();
        events.sort();
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_parse_reserved() {
        assert_eq!(EventKey::parse("open"), EventKey::Open);
        assert_eq!(EventKey::parse("close"), EventKey::Close);
        assert_eq!(EventKey::parse("reconnect"), EventKey::Reconnect);
        assert_eq!(EventKey::parse("event1"), EventKey::App("event1".into()));
        assert!(EventKey::Open.is_reserved());
        assert!(!EventKey::from("event1").is_reserved());
    }

    #[test]
    fn test_emit_reaches_matching_listeners() {
        let dispatcher = Dispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        assert!(dispatcher.on("a".into(), move |v| {
            assert_eq!(v["val"], 1);
            h.fetch_add(1, Ordering::SeqCst);
        }));
        let h = hits.clone();
        assert!(!dispatcher.on("a".into(), move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(dispatcher.emit(&"a".into(), &json!({"val": 1})), 2);
        assert_eq!(dispatcher.emit(&"b".into(), &json!({})), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_listener_may_register_listener() {
        let dispatcher = Dispatcher::new();
        let inner = dispatcher.clone();
        dispatcher.on(EventKey::Open, move |_| {
            inner.on("late".into(), |_| {});
        });

        dispatcher.emit(&EventKey::Open, &Value::Null);
        assert!(dispatcher.has_listeners(&"late".into()));
    }

    #[test]
    fn test_app_events_excludes_reserved() {
        let dispatcher = Dispatcher::new();
        dispatcher.on(EventKey::Open, |_| {});
        dispatcher.on("event2".into(), |_| {});
        dispatcher.on("event1".into(), |_| {});
        assert_eq!(dispatcher.app_events(), vec!["event1", "event2"]);
    }
}
