use std::sync::Arc;
use std::time::Duration;

use ozone_core::OutboundEvent;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, trace};

use crate::queue::OutboundQueue;

/// Payload of the first heartbeat after start-up.
pub fn initial_heartbeat_data() -> Value {
    json!({ "requestingState": true })
}

/// Periodically enqueues a wildcard heartbeat. Stops when dropped.
#[derive(Debug)]
pub struct HeartbeatDriver {
    task: JoinHandle<()>,
}

impl HeartbeatDriver {
    /// Starts ticking; the first heartbeat is sent immediately.
    ///
    /// Each tick's enqueue runs on its own task, so a slow drain never
    /// delays the next tick.
    pub fn spawn(queue: Arc<OutboundQueue>, period: Duration) -> Self {
        let period = period.max(Duration::from_millis(1));
        info!(?period, "starting heartbeat");
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut data = initial_heartbeat_data();
            loop {
                ticker.tick().await;
                let event = OutboundEvent::heartbeat(std::mem::replace(&mut data, json!({})));
                let queue = Arc::clone(&queue);
                tokio::spawn(async move {
                    let report = queue.enqueue(None, event).await;
                    trace!(?report, "heartbeat drained");
                });
            }
        });
        Self { task }
    }

    pub fn stop(&self) {
        self.task.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for HeartbeatDriver {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use ozone_core::{PeerDescriptor, HEARTBEAT_INTENT};
    use ozone_transport::MemoryNetwork;
    use serde_json::{json, Value};

    use super::HeartbeatDriver;
    use crate::artery::{Artery, ArteryMap};
    use crate::delivery::Deliver;
    use crate::error::DeliveryError;
    use crate::queue::{Batch, OutboundQueue};

    #[derive(Default)]
    struct Collect {
        data: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl Deliver for Collect {
        async fn deliver(&self, batch: &Batch, _artery: &Arc<Artery>) -> Result<bool, DeliveryError> {
            assert!(batch.is_heartbeat());
            assert_eq!(batch.events()[0].intent, HEARTBEAT_INTENT);
            self.data.lock().expect("data").push(batch.events()[0].data.clone());
            Ok(true)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_tick_requests_state_then_empty_payloads() {
        let collect = Arc::new(Collect::default());
        let arteries = ArteryMap::new(
            [PeerDescriptor::new("a", "a")],
            Arc::new(MemoryNetwork::default()),
        )
        .expect("arteries");
        let queue = Arc::new(OutboundQueue::new(Arc::new(arteries), collect.clone()));

        let driver = HeartbeatDriver::spawn(queue, Duration::from_millis(3000));
        tokio::time::sleep(Duration::from_millis(6500)).await;
        driver.stop();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!driver.is_running());

        let data = collect.data.lock().expect("data").clone();
        assert_eq!(
            data,
            vec![json!({"requestingState": true}), json!({}), json!({})]
        );
    }
}
