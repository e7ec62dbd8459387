//! Peer-side endpoint: accepts the core's connection and routes inbound
//! intents to listeners.

use std::sync::{Arc, Mutex, MutexGuard};

use ozone_core::{Frame, Intent};
use ozone_transport::{Acceptor, Link};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::ack::{request_ack, AckWait};
use crate::connection::{spawn_inbound, ConnectionHandle};
use crate::dispatch::DispatchChain;
use crate::error::ServiceError;
use crate::intents::{IntentRouter, ListenerId};

/// Holds at most one connection to the core at a time.
#[derive(Debug)]
pub struct ServiceEndpoint {
    chain: Arc<DispatchChain>,
    router: Arc<IntentRouter>,
    current: Mutex<Option<Arc<ConnectionHandle>>>,
    connected: watch::Sender<bool>,
}

impl ServiceEndpoint {
    pub fn new() -> Arc<Self> {
        let chain = Arc::new(DispatchChain::with_ack_responder());
        let router = Arc::new(IntentRouter::new());
        chain.add_handler(router.clone());
        let (connected, _) = watch::channel(false);
        Arc::new(Self {
            chain,
            router,
            current: Mutex::new(None),
            connected,
        })
    }

    /// Handlers after the ack responder and the intent router.
    pub fn chain(&self) -> &Arc<DispatchChain> {
        &self.chain
    }

    pub fn add_listener<F>(&self, intent: impl Into<String>, listener: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.router.add_listener(intent, listener)
    }

    pub fn remove_listener(&self, intent: &str, id: ListenerId) -> bool {
        self.router.remove_listener(intent, id)
    }

    /// Accepts links until the acceptor shuts down.
    pub async fn serve<A: Acceptor>(self: Arc<Self>, mut acceptor: A) {
        while let Some(link) = acceptor.accept().await {
            self.adopt(link);
        }
        info!("service acceptor closed");
    }

    /// Makes `link` the current core connection. Refused while another
    /// connection is still open.
    pub fn adopt(self: &Arc<Self>, link: Link) -> bool {
        let (handle, inbound) = {
            let mut current = self.lock();
            if current.as_ref().is_some_and(|c| c.is_open()) {
                warn!(from = %link.peer(), "already connected to the core, refusing extra link");
                link.sender().close();
                return false;
            }
            let peer = link.peer().to_string();
            let (sender, inbound) = link.into_parts();
            let handle = Arc::new(ConnectionHandle::new(peer, sender));
            *current = Some(Arc::clone(&handle));
            (handle, inbound)
        };
        info!(from = %handle.peer(), "core connected");
        self.connected.send_replace(true);

        let read_loop = spawn_inbound(&handle, inbound, Arc::clone(&self.chain));
        let endpoint = Arc::clone(self);
        let id = handle.id();
        tokio::spawn(async move {
            let _ = read_loop.await;
            endpoint.release(id);
        });
        true
    }

    pub fn is_connected(&self) -> bool {
        self.lock().as_ref().is_some_and(|c| c.is_open())
    }

    /// Resolves once the core has connected at least once.
    pub async fn wait_for_core(&self) {
        let mut connected = self.connected.subscribe();
        let _ = connected.wait_for(|connected| *connected).await;
    }

    pub fn send(&self, intent: impl Into<String>, data: Value) -> Result<(), ServiceError> {
        let connection = self.connection()?;
        connection.send_intents(vec![Intent::new(intent, data)])?;
        Ok(())
    }

    /// Sends one intent with an ack request; await the result for the reply.
    pub fn send_with_ack(&self, intent: impl Into<String>, data: Value) -> Result<AckWait, ServiceError> {
        let connection = self.connection()?;
        Ok(request_ack(&connection, vec![Intent::new(intent, data)])?)
    }

    pub fn send_frame(&self, frame: &Frame) -> Result<(), ServiceError> {
        self.connection()?.send_frame(frame)?;
        Ok(())
    }

    fn connection(&self) -> Result<Arc<ConnectionHandle>, ServiceError> {
        self.lock()
            .as_ref()
            .filter(|c| c.is_open())
            .cloned()
            .ok_or(ServiceError::NotConnected)
    }

    fn release(&self, id: u64) {
        let mut current = self.lock();
        if current.as_ref().is_some_and(|c| c.id() == id) {
            *current = None;
            info!("core connection closed");
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Arc<ConnectionHandle>>> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use ozone_core::{Frame, Intent};
    use ozone_transport::link_pair;
    use serde_json::json;

    use super::ServiceEndpoint;
    use crate::error::ServiceError;

    #[tokio::test]
    async fn sends_fail_until_the_core_connects() {
        let endpoint = ServiceEndpoint::new();
        assert!(matches!(
            endpoint.send("X", json!({})),
            Err(ServiceError::NotConnected)
        ));

        let (core, svc) = link_pair("core", "svc", 8);
        assert!(endpoint.adopt(svc));
        tokio::time::timeout(Duration::from_secs(1), endpoint.wait_for_core())
            .await
            .expect("connected");

        endpoint.send("X", json!({"k": 1})).expect("send");
        let (_tx, mut rx) = core.into_parts();
        let frame = Frame::decode(&rx.recv().await.expect("frame")).expect("decode");
        assert_eq!(frame.payload()[0].intent, "X");
    }

    #[tokio::test]
    async fn second_link_is_refused_while_first_is_open() {
        let endpoint = ServiceEndpoint::new();
        let (_core_a, svc_a) = link_pair("core", "svc", 8);
        let (core_b, svc_b) = link_pair("core", "svc", 8);

        assert!(endpoint.adopt(svc_a));
        assert!(!endpoint.adopt(svc_b));
        assert!(!core_b.sender().is_open());
        assert!(endpoint.is_connected());
    }

    #[tokio::test]
    async fn listeners_receive_intents_and_acks_are_answered() {
        let endpoint = ServiceEndpoint::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        endpoint.add_listener("STATE", move |data| sink.lock().expect("seen").push(data.clone()));

        let (core, svc) = link_pair("core", "svc", 8);
        endpoint.adopt(svc);
        let (core_tx, mut core_rx) = core.into_parts();

        let frame = Frame::intents(vec![
            Intent::new("STATE", json!(1)),
            Intent::new("OTHER", json!(2)),
            Intent::new("STATE", json!(3)),
        ])
        .with_ack_request("t-1".into());
        core_tx.send(frame.encode().expect("encode")).expect("send");

        let reply = Frame::decode(&core_rx.recv().await.expect("reply")).expect("decode");
        assert_eq!(reply.ack_reply_token().map(|t| t.as_str()), Some("t-1"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*seen.lock().expect("seen"), vec![json!(1), json!(3)]);
    }

    #[tokio::test]
    async fn closed_core_connection_is_released() {
        let endpoint = ServiceEndpoint::new();
        let (core, svc) = link_pair("core", "svc", 8);
        endpoint.adopt(svc);
        drop(core);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!endpoint.is_connected());

        let (_core, svc) = link_pair("core", "svc", 8);
        assert!(endpoint.adopt(svc));
    }
}
