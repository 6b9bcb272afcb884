use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;

use super::{Broker, BrokerEvent, Delivery, Headers, QueueStats};
use crate::error::BrokerError;

#[derive(Default)]
struct QueueState {
    entries: Vec<Delivery>,
    /// Index of the next entry to hand out to the consumer group.
    cursor: usize,
    /// Delivered ids and when they were last handed out.
    unacked: HashMap<String, Instant>,
}

impl QueueState {
    /// Oldest unacknowledged delivery idle for at least `idle`, marked as
    /// handed out again.
    fn claim(&mut self, idle: Duration) -> Option<Delivery> {
        let now = Instant::now();
        let id = self
            .entries
            .iter()
            .map(|d| &d.id)
            .find(|id| {
                self.unacked
                    .get(*id)
                    .is_some_and(|at| now.duration_since(*at) >= idle)
            })?
            .clone();
        self.unacked.insert(id.clone(), now);
        let mut delivery = self.entries.iter().find(|d| d.id == id)?.clone();
        delivery.redelivered = true;
        Some(delivery)
    }
}

#[derive(Default)]
struct State {
    queues: HashMap<String, QueueState>,
    kv: HashMap<String, Vec<u8>>,
    next_id: u64,
}

/// In-process broker with the same delivery model as the Redis adapter:
/// messages are retained after delivery and handed out once per group.
///
/// Unacknowledged deliveries are only claimed again when a claim idle time
/// is set with [`with_claim_idle`](Self::with_claim_idle).
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
    events: broadcast::Sender<BrokerEvent>,
    claim_idle: Option<Duration>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            state: Arc::new(Mutex::new(State::default())),
            notify: Arc::new(Notify::new()),
            events,
            claim_idle: None,
        }
    }

    pub fn with_claim_idle(mut self, idle: Duration) -> Self {
        self.claim_idle = Some(idle);
        self
    }

    /// Ids delivered but not yet acknowledged.
    pub fn unacked(&self, queue: &str) -> Vec<String> {
        let state = self.lock();
        let mut ids: Vec<String> = state
            .queues
            .get(queue)
            .map(|q| q.unacked.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Push a notification to subscribers, as a real connection would.
    pub fn emit(&self, event: BrokerEvent) {
        let _ = self.events.send(event);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A poisoned lock only means a panicking test thread; the data is still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn try_take(&self, queue: &str) -> Option<Delivery> {
        let mut state = self.lock();
        let q = state.queues.get_mut(queue)?;
        if let Some(idle) = self.claim_idle {
            if let Some(delivery) = q.claim(idle) {
                return Some(delivery);
            }
        }
        let delivery = q.entries.get(q.cursor)?.clone();
        q.cursor += 1;
        q.unacked.insert(delivery.id.clone(), Instant::now());
        Some(delivery)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn fetch(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(delivery) = self.try_take(queue) {
                return Ok(Some(delivery));
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return Ok(self.try_take(queue));
            }
        }
    }

    async fn ack(&self, queue: &str, id: &str) -> Result<(), BrokerError> {
        let mut state = self.lock();
        let removed = state
            .queues
            .get_mut(queue)
            .map(|q| q.unacked.remove(id).is_some())
            .unwrap_or(false);
        if removed {
            Ok(())
        } else {
            Err(BrokerError::UnknownDelivery(id.to_string()))
        }
    }

    async fn publish(
        &self,
        queue: &str,
        headers: &Headers,
        payload: &[u8],
    ) -> Result<String, BrokerError> {
        let id = {
            let mut state = self.lock();
            state.next_id += 1;
            let id = format!("{}-0", state.next_id);
            state
                .queues
                .entry(queue.to_string())
                .or_default()
                .entries
                .push(Delivery {
                    id: id.clone(),
                    headers: headers.clone(),
                    payload: payload.to_vec(),
                    redelivered: false,
                });
            id
        };
        self.notify.notify_one();
        Ok(id)
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), BrokerError> {
        self.lock().kv.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BrokerError> {
        Ok(self.lock().kv.get(key).cloned())
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats, BrokerError> {
        let state = self.lock();
        Ok(state
            .queues
            .get(queue)
            .map(|q| QueueStats {
                messages: q.entries.len() as u64,
                pending: (q.entries.len() - q.cursor) as u64,
            })
            .unwrap_or_default())
    }

    async fn replay(&self, queue: &str) -> Result<Vec<Headers>, BrokerError> {
        let state = self.lock();
        Ok(state
            .queues
            .get(queue)
            .map(|q| q.entries.iter().map(|d| d.headers.clone()).collect())
            .unwrap_or_default())
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }
}
