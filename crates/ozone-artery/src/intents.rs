use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use ozone_core::{Frame, Intent};
use serde_json::Value;
use tracing::trace;

use crate::connection::ConnectionHandle;
use crate::dispatch::{Flow, InboundHandler};

pub type IntentListener = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Emits each intent of an inbound frame to the listeners registered
/// under its name, in payload order.
#[derive(Default)]
pub struct IntentRouter {
    listeners: Mutex<HashMap<String, Vec<(ListenerId, IntentListener)>>>,
    next_id: AtomicU64,
}

impl fmt::Debug for IntentRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntentRouter")
            .field("intents", &self.lock().len())
            .finish()
    }
}

impl IntentRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener<F>(&self, intent: impl Into<String>, listener: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock()
            .entry(intent.into())
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    pub fn remove_listener(&self, intent: &str, id: ListenerId) -> bool {
        let mut listeners = self.lock();
        let Some(entries) = listeners.get_mut(intent) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            listeners.remove(intent);
        }
        removed
    }

    /// Invokes every listener for `intent`; returns how many ran.
    pub fn emit(&self, intent: &Intent) -> usize {
        let listeners: Vec<IntentListener> = self
            .lock()
            .get(&intent.intent)
            .map(|entries| entries.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default();
        for listener in &listeners {
            listener(&intent.data);
        }
        trace!(intent = %intent.intent, listeners = listeners.len(), "intent emitted");
        listeners.len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<(ListenerId, IntentListener)>>> {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl InboundHandler for IntentRouter {
    async fn handle(&self, _connection: &Arc<ConnectionHandle>, frame: &Frame) -> Flow {
        for intent in frame.payload() {
            self.emit(intent);
        }
        Flow::Continue
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use ozone_core::Intent;
    use serde_json::{json, Value};

    use super::IntentRouter;

    #[test]
    fn listeners_receive_data_for_their_intent_only() {
        let router = IntentRouter::new();
        let seen = Arc::new(Mutex::new(Vec::<Value>::new()));
        let sink = Arc::clone(&seen);
        router.add_listener("STATE", move |data| sink.lock().expect("seen").push(data.clone()));

        assert_eq!(router.emit(&Intent::new("STATE", json!({"v": 1}))), 1);
        assert_eq!(router.emit(&Intent::new("OTHER", json!({"v": 2}))), 0);
        assert_eq!(*seen.lock().expect("seen"), vec![json!({"v": 1})]);
    }

    #[test]
    fn removed_listener_no_longer_fires() {
        let router = IntentRouter::new();
        let first = router.add_listener("STATE", |_| {});
        router.add_listener("STATE", |_| {});

        assert!(router.remove_listener("STATE", first));
        assert!(!router.remove_listener("STATE", first));
        assert!(!router.remove_listener("MISSING", first));
        assert_eq!(router.emit(&Intent::new("STATE", json!(null))), 1);
    }
}
