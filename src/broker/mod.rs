//! Durable queue and key-value store the worker consumes.
//!
//! The pipeline only talks to [`Broker`]; delivery guarantees, durability and
//! consumer-group load balancing belong to the implementation.
//!
//! - [`RedisBroker`]: Redis streams + consumer group, plain keys for status documents
//! - [`MemoryBroker`]: in-process implementation

pub mod memory;
pub mod redis;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::BrokerError;

pub use self::memory::MemoryBroker;
pub use self::redis::RedisBroker;

/// Message headers as carried on the wire.
pub type Headers = BTreeMap<String, String>;

/// Name of the durable consumer group all workers join.
pub const CONSUMER_GROUP: &str = "workers";

/// One message pulled from a queue.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Broker-assigned id, used to acknowledge.
    pub id: String,
    pub headers: Headers,
    pub payload: Vec<u8>,
    /// Claimed back from a consumer that never acknowledged it.
    pub redelivered: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Messages retained in the queue.
    pub messages: u64,
    /// Messages not yet delivered to the consumer group.
    pub pending: u64,
}

/// Connection notifications, replacing ambient error/reconnect callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Connected(String),
    Error(String),
    Reconnected(String),
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Pull at most one message, waiting up to `wait`. `Ok(None)` is a timeout.
    ///
    /// Deliveries left unacknowledged for longer than the broker's claim idle
    /// time are handed out again before new messages, flagged `redelivered`.
    async fn fetch(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, BrokerError>;

    /// Acknowledge a delivery by id, removing it from the group's pending list.
    async fn ack(&self, queue: &str, id: &str) -> Result<(), BrokerError>;

    async fn publish(
        &self,
        queue: &str,
        headers: &Headers,
        payload: &[u8],
    ) -> Result<String, BrokerError>;

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), BrokerError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BrokerError>;

    async fn stats(&self, queue: &str) -> Result<QueueStats, BrokerError>;

    /// Headers of every message still retained in `queue`, oldest first.
    async fn replay(&self, queue: &str) -> Result<Vec<Headers>, BrokerError>;

    /// Round-trip check used by readiness probes.
    async fn ping(&self) -> Result<(), BrokerError>;

    fn events(&self) -> broadcast::Receiver<BrokerEvent>;
}

/// How long a delivery stays unacknowledged before another consumer may claim it.
pub const DEFAULT_CLAIM_IDLE: Duration = Duration::from_secs(3600);

/// Stream key backing a queue.
pub fn stream_name(queue: &str) -> String {
    format!("{}-stream", queue)
}
