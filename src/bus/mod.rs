//! Vote bus: the durable channel between the ingester and the tally worker.
//!
//! One named broker stream carries vote events at-least-once with no
//! ordering guarantee and no deduplication. The publisher drains an
//! in-process channel into the stream; the consumer joins a named group so
//! multiple tally workers can split the load, and acknowledges each entry
//! only after it has been recorded. Redelivery shows up as over-counting
//! downstream; that is the documented cost of at-least-once delivery.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Field name carrying the option string inside a stream entry.
///
/// Stream entries are field/value maps, so the raw option string rides in a
/// single field; there is no envelope and no schema versioning.
const OPTION_FIELD: &str = "option";

/// How long one blocking read waits before the loop re-checks the stop
/// signal.
const READ_BLOCK: Duration = Duration::from_secs(1);

/// Max entries fetched per read.
const READ_BATCH: usize = 32;

/// Delay before retrying after a failed read.
const READ_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("broker error: {0}")]
    Broker(#[from] redis::RedisError),
}

/// One detected mention of a tracked option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteEvent {
    option: String,
}

impl VoteEvent {
    pub fn new(option: impl Into<String>) -> Self {
        Self {
            option: option.into(),
        }
    }

    pub fn option(&self) -> &str {
        &self.option
    }
}

/// Broker-facing side of the publisher, factored out so the drain loop can
/// be exercised without a live broker.
#[async_trait]
pub trait VoteTransport: Send {
    async fn publish(&mut self, event: &VoteEvent) -> Result<(), BusError>;

    /// Stop the underlying client once the drain is complete.
    async fn stop(&mut self) -> Result<(), BusError>;
}

/// Publishes vote events onto one named broker stream.
pub struct RedisTransport {
    conn: ConnectionManager,
    topic: String,
}

impl RedisTransport {
    /// Connect the producer. Failure here is fatal at startup.
    pub async fn connect(url: &str, topic: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            conn,
            topic: topic.to_string(),
        })
    }
}

#[async_trait]
impl VoteTransport for RedisTransport {
    async fn publish(&mut self, event: &VoteEvent) -> Result<(), BusError> {
        let _id: String = self
            .conn
            .xadd(&self.topic, "*", &[(OPTION_FIELD, event.option())])
            .await?;
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), BusError> {
        // The managed connection has no explicit close; dropping it
        // disconnects.
        Ok(())
    }
}

/// Spawn the publisher loop.
///
/// Drains `votes` into the transport until the channel is closed, then stops
/// the transport and resolves the returned future. Every event queued before
/// the channel closed is published before the stop signal fires; a failed
/// publish is logged and the event dropped.
pub fn publish_votes<T>(
    mut transport: T,
    mut votes: mpsc::UnboundedReceiver<VoteEvent>,
) -> oneshot::Receiver<()>
where
    T: VoteTransport + 'static,
{
    let (stopped_tx, stopped_rx) = oneshot::channel();
    tokio::spawn(async move {
        while let Some(event) = votes.recv().await {
            if let Err(e) = transport.publish(&event).await {
                warn!(option = event.option(), error = %e, "failed to publish vote");
            }
        }
        info!("publisher stopping");
        if let Err(e) = transport.stop().await {
            warn!(error = %e, "failed to stop publisher transport");
        }
        info!("publisher stopped");
        let _ = stopped_tx.send(());
    });
    stopped_rx
}

/// Handles one delivered vote event.
///
/// Called from the consumer loop; implementations must tolerate any delivery
/// rate and any interleaving, which the tally buffer's lock provides.
pub trait VoteHandler: Send + Sync {
    fn handle(&self, option: &str);
}

/// Group consumer over the vote stream.
pub struct VoteConsumer {
    conn: ConnectionManager,
    topic: String,
    group: String,
    consumer: String,
}

impl VoteConsumer {
    /// Connect and join `group` on `topic`, creating both if needed.
    ///
    /// Group creation is idempotent: an already-existing group is not an
    /// error. Failure to connect is fatal at startup.
    pub async fn connect(
        url: &str,
        topic: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Self, BusError> {
        let client = redis::Client::open(url)?;
        let mut conn = client.get_connection_manager().await?;

        let created: Result<String, redis::RedisError> =
            conn.xgroup_create_mkstream(topic, group, "$").await;
        match created {
            Ok(_) => info!(topic, group, "created consumer group"),
            Err(e) if e.code() == Some("BUSYGROUP") => {}
            Err(e) => return Err(e.into()),
        }

        Ok(Self {
            conn,
            topic: topic.to_string(),
            group: group.to_string(),
            consumer: consumer.to_string(),
        })
    }

    /// Deliver vote events to `handler` until `stop` is cancelled.
    ///
    /// Entries are acknowledged after the handler has recorded them, so a
    /// crash between handling and ack redelivers — at-least-once, duplicates
    /// possible.
    pub async fn run(mut self, handler: Arc<dyn VoteHandler>, stop: CancellationToken) {
        let options = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .block(READ_BLOCK.as_millis() as usize)
            .count(READ_BATCH);

        loop {
            if stop.is_cancelled() {
                info!("vote consumer stopping");
                return;
            }

            let topics = [&self.topic];
            let ids = [">"];
            let reply = tokio::select! {
                reply = self
                    .conn
                    .xread_options::<_, _, StreamReadReply>(&topics, &ids, &options) => reply,
                _ = stop.cancelled() => {
                    info!("vote consumer stopping");
                    return;
                }
            };
            let reply = match reply {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(error = %e, "vote read failed");
                    tokio::select! {
                        _ = tokio::time::sleep(READ_RETRY_DELAY) => continue,
                        _ = stop.cancelled() => return,
                    }
                }
            };

            for key in reply.keys {
                for entry in key.ids {
                    match entry_option(&entry.map) {
                        Some(option) => handler.handle(&option),
                        None => warn!(id = %entry.id, "dropping malformed vote entry"),
                    }
                    let acked: Result<i64, redis::RedisError> = self
                        .conn
                        .xack(&self.topic, &self.group, &[&entry.id])
                        .await;
                    if let Err(e) = acked {
                        warn!(id = %entry.id, error = %e, "failed to ack vote");
                    }
                }
            }
        }
    }
}

/// Extract the option payload from a stream entry's field map.
fn entry_option(map: &HashMap<String, redis::Value>) -> Option<String> {
    match map.get(OPTION_FIELD) {
        Some(redis::Value::BulkString(bytes)) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Some(redis::Value::SimpleString(s)) => Some(s.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Clone, Default)]
    struct RecordingTransport {
        published: Arc<Mutex<Vec<String>>>,
        stopped: Arc<Mutex<bool>>,
    }

    #[async_trait]
    impl VoteTransport for RecordingTransport {
        async fn publish(&mut self, event: &VoteEvent) -> Result<(), BusError> {
            assert!(!*self.stopped.lock(), "publish after stop");
            self.published.lock().push(event.option().to_string());
            Ok(())
        }

        async fn stop(&mut self) -> Result<(), BusError> {
            *self.stopped.lock() = true;
            Ok(())
        }
    }

    #[tokio::test]
    async fn publisher_drains_queued_events_before_stopping() {
        let transport = RecordingTransport::default();
        let published = transport.published.clone();
        let stopped_flag = transport.stopped.clone();

        let (tx, rx) = mpsc::unbounded_channel();
        // Queue a burst before the publisher even starts; the channel is
        // unbounded, so the sender never blocks on a slow publisher.
        for option in ["a", "b", "a", "c"] {
            tx.send(VoteEvent::new(option)).unwrap();
        }
        let stopped = publish_votes(transport, rx);

        drop(tx);
        stopped.await.unwrap();

        assert_eq!(*published.lock(), vec!["a", "b", "a", "c"]);
        assert!(*stopped_flag.lock());
    }

    #[tokio::test]
    async fn publisher_stops_promptly_on_empty_channel() {
        let transport = RecordingTransport::default();
        let published = transport.published.clone();

        let (tx, rx) = mpsc::unbounded_channel::<VoteEvent>();
        let stopped = publish_votes(transport, rx);
        drop(tx);

        stopped.await.unwrap();
        assert!(published.lock().is_empty());
    }

    #[test]
    fn entry_option_reads_bulk_and_simple_strings() {
        let mut map = HashMap::new();
        map.insert(
            OPTION_FIELD.to_string(),
            redis::Value::BulkString(b"love".to_vec()),
        );
        assert_eq!(entry_option(&map), Some("love".to_string()));

        map.insert(
            OPTION_FIELD.to_string(),
            redis::Value::SimpleString("hate".to_string()),
        );
        assert_eq!(entry_option(&map), Some("hate".to_string()));
    }

    #[test]
    fn entry_option_rejects_missing_or_odd_payloads() {
        let empty = HashMap::new();
        assert_eq!(entry_option(&empty), None);

        let mut map = HashMap::new();
        map.insert(OPTION_FIELD.to_string(), redis::Value::Int(7));
        assert_eq!(entry_option(&map), None);
    }
}
