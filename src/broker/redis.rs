use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::streams::{StreamAutoClaimReply, StreamId, StreamRangeReply, StreamReadReply};
use ::redis::{AsyncCommands, Client, Value};
use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{
    stream_name, Broker, BrokerEvent, Delivery, Headers, QueueStats, CONSUMER_GROUP,
    DEFAULT_CLAIM_IDLE,
};
use crate::error::BrokerError;

/// Stream field carrying the raw message body; every other field is a header.
const PAYLOAD_FIELD: &str = "payload";

/// Connection health as seen through call results. Emits `Error` on every
/// failure and `Reconnected` on the first success after one.
struct LinkState {
    address: String,
    degraded: AtomicBool,
    events: broadcast::Sender<BrokerEvent>,
}

impl LinkState {
    fn new(address: &str) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            address: address.to_string(),
            degraded: AtomicBool::new(false),
            events,
        }
    }

    fn emit(&self, event: BrokerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn observe<T>(&self, result: Result<T, BrokerError>) -> Result<T, BrokerError> {
        match &result {
            Ok(_) => {
                if self.degraded.swap(false, Ordering::SeqCst) {
                    info!(address = %self.address, "Queue server reachable again");
                    self.emit(BrokerEvent::Reconnected(self.address.clone()));
                }
            }
            Err(e) => {
                self.degraded.store(true, Ordering::SeqCst);
                self.emit(BrokerEvent::Error(e.to_string()));
            }
        }
        result
    }
}

/// Broker backed by Redis streams.
///
/// Each queue is a stream `{queue}-stream` consumed through the `workers`
/// group, so every message goes to exactly one worker. Status documents live
/// under `{bucket}:{key}`.
///
/// Blocking reads get a connection of their own so probes and record writes
/// are never queued behind an `XREADGROUP ... BLOCK`. Both connections
/// reconnect on their own after the server goes away.
pub struct RedisBroker {
    con: ConnectionManager,
    reader: ConnectionManager,
    bucket: String,
    consumer: String,
    claim_idle: Duration,
    link: LinkState,
}

impl RedisBroker {
    /// Connect to `address`. `consumer` names this process inside the group.
    pub async fn connect(address: &str, bucket: &str, consumer: &str) -> Result<Self, BrokerError> {
        let connection_error = |e: ::redis::RedisError| BrokerError::Connection(format!("{}: {}", address, e));
        let client = Client::open(address).map_err(connection_error)?;
        let con = ConnectionManager::new(client.clone())
            .await
            .map_err(connection_error)?;
        let reader = ConnectionManager::new(client)
            .await
            .map_err(connection_error)?;

        let broker = Self {
            con,
            reader,
            bucket: bucket.to_string(),
            consumer: consumer.to_string(),
            claim_idle: DEFAULT_CLAIM_IDLE,
            link: LinkState::new(address),
        };
        broker.ping().await?;
        info!(address, "Connected to queue server");
        broker.link.emit(BrokerEvent::Connected(address.to_string()));
        Ok(broker)
    }

    /// Deliveries unacknowledged for longer than `idle` are claimed by this
    /// consumer. Must exceed the longest job when acking after processing.
    pub fn with_claim_idle(mut self, idle: Duration) -> Self {
        self.claim_idle = idle;
        self
    }

    fn kv_key(&self, key: &str) -> String {
        format!("{}:{}", self.bucket, key)
    }

    /// Create the stream and consumer group if they do not exist yet.
    /// The group starts at the beginning so messages published before any
    /// worker joined are still delivered.
    async fn ensure_group(&self, stream: &str) -> Result<(), BrokerError> {
        let mut con = self.con.clone();
        let created: Result<(), _> = con.xgroup_create_mkstream(stream, CONSUMER_GROUP, "0").await;
        match created {
            Ok(()) => {
                debug!(stream, group = CONSUMER_GROUP, "Created consumer group");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Take over one entry another consumer left pending for too long.
    async fn claim_one(&self, stream: &str) -> Result<Option<Delivery>, BrokerError> {
        let mut con = self.con.clone();
        let reply: StreamAutoClaimReply = ::redis::cmd("XAUTOCLAIM")
            .arg(stream)
            .arg(CONSUMER_GROUP)
            .arg(&self.consumer)
            .arg(self.claim_idle.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(1)
            .query_async(&mut con)
            .await?;

        if !reply.deleted_ids.is_empty() {
            debug!(stream, deleted = ?reply.deleted_ids, "Pending entries no longer in the stream");
        }
        match reply.claimed.first() {
            Some(entry) => {
                let mut delivery = decode_entry(entry)?;
                delivery.redelivered = true;
                warn!(stream, id = %delivery.id, "Claimed an unacknowledged delivery");
                Ok(Some(delivery))
            }
            None => Ok(None),
        }
    }

    async fn read_one(&self, stream: &str, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        self.ensure_group(stream).await?;
        if let Some(delivery) = self.claim_one(stream).await? {
            return Ok(Some(delivery));
        }

        let mut reader = self.reader.clone();
        let reply: Option<StreamReadReply> = ::redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(CONSUMER_GROUP)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(wait.as_millis() as u64)
            .arg("STREAMS")
            .arg(stream)
            .arg(">")
            .query_async(&mut reader)
            .await?;

        let entry = reply
            .into_iter()
            .flat_map(|r| r.keys)
            .flat_map(|k| k.ids)
            .next();
        entry.as_ref().map(decode_entry).transpose()
    }

    /// Entries after `last_delivered`, counted the slow way for servers
    /// that do not report a group lag.
    async fn count_undelivered(&self, stream: &str, last_delivered: &str) -> Result<u64, BrokerError> {
        let mut con = self.con.clone();
        // Exclusive range start needs Redis >= 6.2.
        let undelivered: StreamRangeReply = con
            .xrange(stream, format!("({}", last_delivered), "+")
            .await?;
        Ok(undelivered.ids.len() as u64)
    }
}

fn value_to_bytes(value: &Value) -> Option<Vec<u8>> {
    ::redis::from_redis_value::<Vec<u8>>(value).ok()
}

fn decode_entry(entry: &StreamId) -> Result<Delivery, BrokerError> {
    let mut headers = Headers::new();
    let mut payload = Vec::new();
    for (field, value) in &entry.map {
        let bytes = value_to_bytes(value).ok_or_else(|| BrokerError::Malformed {
            id: entry.id.clone(),
            reason: format!("field {} is not a string", field),
        })?;
        if field == PAYLOAD_FIELD {
            payload = bytes;
        } else {
            headers.insert(field.clone(), String::from_utf8_lossy(&bytes).into_owned());
        }
    }
    Ok(Delivery {
        id: entry.id.clone(),
        headers,
        payload,
        redelivered: false,
    })
}

/// One `XINFO GROUPS` entry, keyed by field name.
type GroupInfo = HashMap<String, Value>;

fn group_field<T: ::redis::FromRedisValue>(group: &GroupInfo, field: &str) -> Option<T> {
    group
        .get(field)
        .and_then(|v| ::redis::from_redis_value::<Option<T>>(v).ok())
        .flatten()
}

#[async_trait]
impl Broker for RedisBroker {
    async fn fetch(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        let result = self.read_one(&stream_name(queue), wait).await;
        self.link.observe(result)
    }

    async fn ack(&self, queue: &str, id: &str) -> Result<(), BrokerError> {
        let mut con = self.con.clone();
        let acked: u64 = con.xack(stream_name(queue), CONSUMER_GROUP, &[id]).await?;
        if acked == 0 {
            warn!(id, "Acknowledge matched no pending message");
        }
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        headers: &Headers,
        payload: &[u8],
    ) -> Result<String, BrokerError> {
        let stream = stream_name(queue);
        self.ensure_group(&stream).await?;

        let mut items: Vec<(String, Vec<u8>)> = headers
            .iter()
            .map(|(k, v)| (k.clone(), v.as_bytes().to_vec()))
            .collect();
        items.push((PAYLOAD_FIELD.to_string(), payload.to_vec()));

        let mut con = self.con.clone();
        let id: String = con.xadd(&stream, "*", &items).await?;
        Ok(id)
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), BrokerError> {
        let mut con = self.con.clone();
        let _: () = con.set(self.kv_key(key), value).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BrokerError> {
        let mut con = self.con.clone();
        let value: Option<Vec<u8>> = con.get(self.kv_key(key)).await?;
        Ok(value)
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats, BrokerError> {
        let stream = stream_name(queue);
        self.ensure_group(&stream).await?;
        let mut con = self.con.clone();

        let messages: u64 = con.xlen(&stream).await?;
        let groups: Vec<GroupInfo> = ::redis::cmd("XINFO")
            .arg("GROUPS")
            .arg(&stream)
            .query_async(&mut con)
            .await?;
        let group = groups
            .iter()
            .find(|g| group_field::<String>(g, "name").as_deref() == Some(CONSUMER_GROUP));

        // `lag` is reported from Redis 7 on, and is nil when it cannot be
        // computed cheaply.
        let pending = match group.and_then(|g| group_field::<u64>(g, "lag")) {
            Some(lag) => lag,
            None => {
                let last_delivered = group
                    .and_then(|g| group_field::<String>(g, "last-delivered-id"))
                    .unwrap_or_else(|| "0-0".to_string());
                self.count_undelivered(&stream, &last_delivered).await?
            }
        };

        Ok(QueueStats { messages, pending })
    }

    async fn replay(&self, queue: &str) -> Result<Vec<Headers>, BrokerError> {
        let mut con = self.con.clone();
        let range: StreamRangeReply = con.xrange_all(stream_name(queue)).await?;
        range
            .ids
            .iter()
            .map(|entry| decode_entry(entry).map(|d| d.headers))
            .collect()
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        let mut con = self.con.clone();
        let pong: Result<String, _> = ::redis::cmd("PING").query_async(&mut con).await;
        self.link.observe(pong.map(|_| ()).map_err(BrokerError::from))
    }

    fn events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.link.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut broadcast::Receiver<BrokerEvent>) -> Vec<BrokerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn link_reports_errors_and_the_first_success_after_them() {
        let link = LinkState::new("redis://queue:6379");
        let mut rx = link.events.subscribe();

        assert!(link.observe(Ok(())).is_ok());
        assert!(drain(&mut rx).is_empty());

        let failed: Result<(), _> = link.observe(Err(BrokerError::Connection("reset".to_string())));
        assert!(failed.is_err());
        let _ = link.observe::<()>(Err(BrokerError::Connection("refused".to_string())));
        assert!(link.observe(Ok(1)).is_ok());
        assert!(link.observe(Ok(2)).is_ok());

        assert_eq!(
            drain(&mut rx),
            vec![
                BrokerEvent::Error("Connection error: reset".to_string()),
                BrokerEvent::Error("Connection error: refused".to_string()),
                BrokerEvent::Reconnected("redis://queue:6379".to_string()),
            ]
        );
    }

    #[test]
    fn group_fields_tolerate_nil_and_missing_values() {
        let mut group = GroupInfo::new();
        group.insert("name".to_string(), Value::BulkString(b"workers".to_vec()));
        group.insert("lag".to_string(), Value::Int(4));
        group.insert("entries-read".to_string(), Value::Nil);

        assert_eq!(group_field::<String>(&group, "name").as_deref(), Some("workers"));
        assert_eq!(group_field::<u64>(&group, "lag"), Some(4));
        assert_eq!(group_field::<u64>(&group, "entries-read"), None);
        assert_eq!(group_field::<u64>(&group, "pending"), None);
    }
}
