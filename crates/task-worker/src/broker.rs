//! The broker port (spec §6): transport for delivering `Signature`s to
//! workers and accepting new ones from producers/callbacks.
//!
//! Grounded in the teacher's split between `StreamConsumer` (group
//! management, pending/new reads, ack) and `StreamProducer` (`XADD` with
//! `MAXLEN ~`), folded into one trait here because the worker lifecycle
//! both consumes deliveries and publishes retries/callbacks through the
//! same transport.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::WorkerError;
use crate::signature::Signature;

/// An unacknowledged delivery: the transport-level message id (opaque to
/// everything above this layer) paired with the decoded signature.
pub type Delivery = (String, Signature);

#[async_trait]
pub trait Broker: Send + Sync {
    /// Create whatever server-side state the transport needs (a consumer
    /// group, a queue) before the first read. Idempotent.
    async fn ensure_ready(&self) -> Result<(), WorkerError>;

    /// Publish a signature for delivery. Used both for the initial
    /// dispatch and for everything the callback orchestrator re-submits
    /// (retries, chain children, chord callbacks).
    async fn publish(&self, sig: &Signature) -> Result<(), WorkerError>;

    /// Read messages already delivered to this consumer but not yet
    /// acknowledged (recovery after a crash mid-processing).
    async fn read_pending(&self, batch_size: usize) -> Result<Vec<Delivery>, WorkerError>;

    /// Read new messages, blocking up to `block` if given. `None` polls
    /// without blocking.
    async fn read_new(
        &self,
        batch_size: usize,
        block: Option<Duration>,
    ) -> Result<Vec<Delivery>, WorkerError>;

    async fn ack(&self, message_id: &str) -> Result<(), WorkerError>;

    /// Spec §6: "must cause the in-flight `start_consuming` call to
    /// return with `retry == false`." This crate's consumer loop lives in
    /// `Worker`, not in the broker port, and is unblocked by its own
    /// shutdown watch channel; this hook exists for transports that hold
    /// connection-level state (a blocking read, a subscription) that must
    /// itself be torn down for the loop to notice shutdown promptly. A
    /// no-op is always a safe implementation.
    async fn stop_consuming(&self) -> Result<(), WorkerError> {
        Ok(())
    }
}

/// In-memory broker backed by an unbounded channel, reference
/// implementation and the workhorse of the test suite. Delivered messages
/// that are not acked are simply gone (no redelivery) since there is no
/// process boundary to crash across.
pub mod in_memory {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::sync::mpsc;
    use tokio::sync::Mutex;

    pub struct InMemoryBroker {
        tx: mpsc::UnboundedSender<Delivery>,
        rx: Mutex<mpsc::UnboundedReceiver<Delivery>>,
        next_id: AtomicU64,
    }

    impl Default for InMemoryBroker {
        fn default() -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            Self {
                tx,
                rx: Mutex::new(rx),
                next_id: AtomicU64::new(1),
            }
        }
    }

    impl InMemoryBroker {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl Broker for InMemoryBroker {
        async fn ensure_ready(&self) -> Result<(), WorkerError> {
            Ok(())
        }

        async fn publish(&self, sig: &Signature) -> Result<(), WorkerError> {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
            self.tx
                .send((id, sig.clone()))
                .map_err(|e| WorkerError::Broker(e.to_string()))
        }

        async fn read_pending(&self, _batch_size: usize) -> Result<Vec<Delivery>, WorkerError> {
            Ok(Vec::new())
        }

        async fn read_new(
            &self,
            batch_size: usize,
            block: Option<Duration>,
        ) -> Result<Vec<Delivery>, WorkerError> {
            let mut rx = self.rx.lock().await;
            let mut out = Vec::new();

            let first = if let Some(timeout) = block {
                tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
            } else {
                rx.try_recv().ok()
            };
            let Some(first) = first else {
                return Ok(out);
            };
            out.push(first);

            while out.len() < batch_size {
                match rx.try_recv() {
                    Ok(delivery) => out.push(delivery),
                    Err(_) => break,
                }
            }
            Ok(out)
        }

        async fn ack(&self, _message_id: &str) -> Result<(), WorkerError> {
            Ok(())
        }
    }

}

#[cfg(feature = "redis-backend")]
pub mod redis_stream {
    //! Redis Streams broker, grounded in the teacher's `StreamConsumer`
    //! (`ensure_consumer_group`'s `XGROUP CREATE ... MKSTREAM`,
    //! `read_pending_messages`'s `XREADGROUP ... 0`, `read_new_messages`'s
    //! `XREADGROUP ... BLOCK ... >`, `ack_message`'s `XACK`) and
    //! `StreamProducer`'s `XADD ... MAXLEN ~`.

    use super::*;
    use redis::aio::ConnectionManager;
    use redis::streams::{StreamReadOptions, StreamReadReply};
    use redis::AsyncCommands;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    pub struct RedisStreamBroker {
        redis: Arc<Mutex<ConnectionManager>>,
        stream_name: String,
        consumer_group: String,
        consumer_id: String,
        max_length: Option<i64>,
    }

    impl RedisStreamBroker {
        pub fn new(
            redis: ConnectionManager,
            stream_name: impl Into<String>,
            consumer_group: impl Into<String>,
            consumer_id: impl Into<String>,
        ) -> Self {
            Self {
                redis: Arc::new(Mutex::new(redis)),
                stream_name: stream_name.into(),
                consumer_group: consumer_group.into(),
                consumer_id: consumer_id.into(),
                max_length: Some(100_000),
            }
        }

        pub fn with_max_length(mut self, max_length: i64) -> Self {
            self.max_length = Some(max_length);
            self
        }

        fn parse_messages(&self, reply: StreamReadReply) -> Result<Vec<Delivery>, WorkerError> {
            let mut out = Vec::new();
            for stream_key in reply.keys {
                for message in stream_key.ids {
                    let sig = self.parse_signature(&message.map)?;
                    out.push((message.id, sig));
                }
            }
            Ok(out)
        }

        fn parse_signature(
            &self,
            map: &HashMap<String, redis::Value>,
        ) -> Result<Signature, WorkerError> {
            let value = map
                .get("signature")
                .ok_or_else(|| WorkerError::Broker("missing 'signature' field".into()))?;
            let raw = match value {
                redis::Value::BulkString(bytes) => String::from_utf8_lossy(bytes).to_string(),
                redis::Value::SimpleString(s) => s.clone(),
                _ => return Err(WorkerError::Broker("invalid 'signature' field type".into())),
            };
            Ok(serde_json::from_str(&raw)?)
        }
    }

    #[async_trait]
    impl Broker for RedisStreamBroker {
        async fn ensure_ready(&self) -> Result<(), WorkerError> {
            let mut conn = self.redis.lock().await;
            let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
                .arg("CREATE")
                .arg(&self.stream_name)
                .arg(&self.consumer_group)
                .arg("$")
                .arg("MKSTREAM")
                .query_async(&mut *conn)
                .await;

            match result {
                Ok(()) => Ok(()),
                Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
                Err(e) => Err(WorkerError::Broker(e.to_string())),
            }
        }

        async fn publish(&self, sig: &Signature) -> Result<(), WorkerError> {
            let mut conn = self.redis.lock().await;
            let payload = serde_json::to_string(sig)?;

            let mut cmd = redis::cmd("XADD");
            cmd.arg(&self.stream_name);
            if let Some(max_len) = self.max_length {
                cmd.arg("MAXLEN").arg("~").arg(max_len);
            }
            cmd.arg("*").arg("signature").arg(&payload);

            let _id: String = cmd
                .query_async(&mut *conn)
                .await
                .map_err(|e| WorkerError::Broker(e.to_string()))?;
            Ok(())
        }

        async fn read_pending(&self, batch_size: usize) -> Result<Vec<Delivery>, WorkerError> {
            let mut conn = self.redis.lock().await;
            let opts = StreamReadOptions::default()
                .group(&self.consumer_group, &self.consumer_id)
                .count(batch_size);

            let result: Result<StreamReadReply, _> = conn
                .xread_options(&[&self.stream_name], &["0"], &opts)
                .await;

            match result {
                Ok(reply) => self.parse_messages(reply),
                Err(e) if e.to_string().to_lowercase().contains("timeout") => Ok(Vec::new()),
                Err(e) => Err(WorkerError::Broker(e.to_string())),
            }
        }

        async fn read_new(
            &self,
            batch_size: usize,
            block: Option<Duration>,
        ) -> Result<Vec<Delivery>, WorkerError> {
            let mut conn = self.redis.lock().await;
            let mut opts = StreamReadOptions::default()
                .group(&self.consumer_group, &self.consumer_id)
                .count(batch_size);
            if let Some(timeout) = block {
                opts = opts.block(timeout.as_millis() as usize);
            }

            let result: Result<StreamReadReply, _> = conn
                .xread_options(&[&self.stream_name], &[">"], &opts)
                .await;

            match result {
                Ok(reply) => self.parse_messages(reply),
                Err(e) => {
                    let err = e.to_string().to_lowercase();
                    if err.contains("timeout") || err.contains("timed out") || err.contains("nil") {
                        Ok(Vec::new())
                    } else {
                        Err(WorkerError::Broker(e.to_string()))
                    }
                }
            }
        }

        async fn ack(&self, message_id: &str) -> Result<(), WorkerError> {
            let mut conn = self.redis.lock().await;
            conn.xack::<_, _, _, ()>(&self.stream_name, &self.consumer_group, &[message_id])
                .await
                .map_err(|e| WorkerError::Broker(e.to_string()))
        }
    }
}
