use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use ozone_core::Frame;
use tracing::trace;

use crate::ack::AckResponder;
use crate::connection::ConnectionHandle;

/// Whether a frame continues down the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// One link of a [`DispatchChain`].
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle(&self, connection: &Arc<ConnectionHandle>, frame: &Frame) -> Flow;
}

/// Adapts a synchronous closure into an [`InboundHandler`].
pub struct FnHandler<F> {
    f: F,
}

pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(&Arc<ConnectionHandle>, &Frame) -> Flow + Send + Sync,
{
    FnHandler { f }
}

#[async_trait]
impl<F> InboundHandler for FnHandler<F>
where
    F: Fn(&Arc<ConnectionHandle>, &Frame) -> Flow + Send + Sync,
{
    async fn handle(&self, connection: &Arc<ConnectionHandle>, frame: &Frame) -> Flow {
        (self.f)(connection, frame)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Ordered inbound handlers shared by every connection of one endpoint.
///
/// Handlers run sequentially in registration order; the first to return
/// [`Flow::Stop`] ends the pass. Handlers added or removed while a frame is
/// being dispatched take effect from the next frame.
#[derive(Default)]
pub struct DispatchChain {
    handlers: Mutex<Vec<(HandlerId, Arc<dyn InboundHandler>)>>,
    next_id: AtomicU64,
}

impl fmt::Debug for DispatchChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchChain")
            .field("handlers", &self.len())
            .finish()
    }
}

impl DispatchChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// A chain whose first handler answers and consumes acks.
    pub fn with_ack_responder() -> Self {
        let chain = Self::new();
        chain.add_handler(Arc::new(AckResponder));
        chain
    }

    pub fn add_handler(&self, handler: Arc<dyn InboundHandler>) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push((id, handler));
        id
    }

    pub fn remove_handler(&self, id: HandlerId) -> bool {
        let mut handlers = self.lock();
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn dispatch(&self, connection: &Arc<ConnectionHandle>, frame: &Frame) -> Flow {
        let handlers: Vec<_> = self.lock().iter().map(|(_, h)| Arc::clone(h)).collect();
        for (position, handler) in handlers.iter().enumerate() {
            if handler.handle(connection, frame).await == Flow::Stop {
                trace!(peer = %connection.peer(), position, "dispatch stopped");
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(HandlerId, Arc<dyn InboundHandler>)>> {
        self.handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use ozone_core::{AckToken, Frame, Intent};
    use ozone_transport::link_pair;
    use serde_json::json;

    use super::{handler_fn, DispatchChain, Flow, InboundHandler};
    use crate::connection::ConnectionHandle;

    fn connection() -> Arc<ConnectionHandle> {
        let (local, _remote) = link_pair("core", "svc", 8);
        let (sender, _inbound) = local.into_parts();
        Arc::new(ConnectionHandle::new("svc", sender))
    }

    fn frame() -> Frame {
        Frame::intents(vec![Intent::new("X", json!({}))])
    }

    fn recorder(
        log: &Arc<Mutex<Vec<&'static str>>>,
        name: &'static str,
        flow: Flow,
    ) -> Arc<dyn InboundHandler> {
        let log = Arc::clone(log);
        Arc::new(handler_fn(move |_conn: &Arc<ConnectionHandle>, _frame: &Frame| {
            log.lock().expect("log").push(name);
            flow
        }))
    }

    #[tokio::test]
    async fn handlers_run_in_order_until_stop() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = DispatchChain::new();
        chain.add_handler(recorder(&log, "first", Flow::Continue));
        chain.add_handler(recorder(&log, "second", Flow::Stop));
        chain.add_handler(recorder(&log, "third", Flow::Continue));

        assert_eq!(chain.dispatch(&connection(), &frame()).await, Flow::Stop);
        assert_eq!(*log.lock().expect("log"), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn removed_handlers_are_skipped() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = DispatchChain::new();
        let stopper = chain.add_handler(recorder(&log, "stopper", Flow::Stop));
        chain.add_handler(recorder(&log, "after", Flow::Continue));

        assert!(chain.remove_handler(stopper));
        assert!(!chain.remove_handler(stopper));
        assert_eq!(chain.dispatch(&connection(), &frame()).await, Flow::Continue);
        assert_eq!(*log.lock().expect("log"), vec!["after"]);
    }

    #[tokio::test]
    async fn ack_responder_hides_replies_from_later_handlers() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = DispatchChain::with_ack_responder();
        chain.add_handler(recorder(&log, "app", Flow::Continue));
        assert_eq!(chain.len(), 2);

        let reply = Frame::ack_reply(AckToken::generate());
        assert_eq!(chain.dispatch(&connection(), &reply).await, Flow::Stop);
        assert!(log.lock().expect("log").is_empty());

        chain.dispatch(&connection(), &frame()).await;
        assert_eq!(*log.lock().expect("log"), vec!["app"]);
    }
}
