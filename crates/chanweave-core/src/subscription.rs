//! Live subscription tracking
//!
//! The `SubscriptionManager` binds this process to (topic, partition) pairs
//! and routes decoded payloads to handlers.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  SubscriptionManager                                            │
//! │  └── topics: HashMap<TopicId, HashMap<Partition, Handle>>       │
//! │      └── at most one substrate subscription per pair            │
//! │                                                                 │
//! │  Record ──► decode_payload ──► PayloadHandler                   │
//! │             ├── decrypt with channel secret (if any)            │
//! │             └── attach `senderId` from the publisher identity   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each pair holds a slot that is filled once by the substrate `subscribe`
//! call. Concurrent requests for the same pair wait on that slot and share
//! its handle; requests for other pairs do not wait for it.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::context::EngineContext;
use crate::crypto::decrypt_json;
use crate::error::{ChannelError, ChannelResult};
use crate::naming;
use crate::substrate::{Record, RecordHandler, SubscriptionHandle};
use crate::types::MEDIA_PARTITION;

/// Callback receiving decoded payloads.
pub type PayloadHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Field attached to decoded objects carrying the publisher identity.
pub const SENDER_ID_FIELD: &str = "senderId";

/// Decode one inbound payload.
///
/// With a secret the payload must be an encrypted string; anything else is a
/// [`ChannelError::DecryptionFailure`]. Decoded objects get a `senderId`
/// field when the substrate reports a publisher.
pub fn decode_payload(
    payload: Value,
    publisher: Option<&str>,
    secret: Option<&str>,
) -> ChannelResult<Value> {
    let mut value = match (secret, payload) {
        (Some(secret), Value::String(opaque)) => decrypt_json(&opaque, secret)?,
        (Some(_), _) => {
            return Err(ChannelError::DecryptionFailure(
                "expected an encrypted payload".to_string(),
            ))
        }
        (None, payload) => payload,
    };

    if let (Value::Object(map), Some(publisher)) = (&mut value, publisher) {
        map.insert(
            SENDER_ID_FIELD.to_string(),
            Value::String(publisher.to_string()),
        );
    }
    Ok(value)
}

/// Decode a record, logging and dropping it on failure.
pub(crate) fn decode_record(record: Record, secret: Option<&str>) -> Option<Value> {
    let topic = record.topic;
    let timestamp = record.timestamp;
    match decode_payload(record.payload, record.publisher.as_deref(), secret) {
        Ok(value) => Some(value),
        Err(e) => {
            debug!(topic = %topic, timestamp, error = %e, "Dropping undecodable record");
            None
        }
    }
}

/// One (topic, partition) binding: empty until the substrate subscribe
/// completes, shared by every caller waiting on it.
type Slot = Arc<OnceCell<SubscriptionHandle>>;

/// Per-session map of live subscriptions.
pub struct SubscriptionManager {
    ctx: EngineContext,
    topics: Mutex<HashMap<String, HashMap<u32, Slot>>>,
}

/// Take the bound handles out of a topic's partitions. Empty slots are kept
/// while another caller still holds them (a subscribe is in flight).
fn take_bound(partitions: &mut HashMap<u32, Slot>) -> Vec<SubscriptionHandle> {
    let mut taken = Vec::new();
    partitions.retain(|_, slot| match slot.get() {
        Some(handle) => {
            taken.push(handle.clone());
            false
        }
        None => Arc::strong_count(slot) > 1,
    });
    taken
}

impl SubscriptionManager {
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            ctx,
            topics: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to one partition, or return the existing handle.
    ///
    /// A repeated call for an already-bound pair makes no substrate call and
    /// keeps the original handler.
    pub async fn subscribe_to_partition(
        &self,
        topic_id: &str,
        partition: u32,
        handler: PayloadHandler,
        secret: Option<String>,
    ) -> ChannelResult<SubscriptionHandle> {
        let on_record: RecordHandler = Arc::new(move |record: Record| {
            if let Some(value) = decode_record(record, secret.as_deref()) {
                handler(value);
            }
        });
        self.bind(topic_id, partition, on_record).await
    }

    /// Bind a raw record handler to a pair at most once.
    ///
    /// The map lock covers only the slot lookup. Callers racing on the same
    /// pair wait on its slot; other pairs proceed independently.
    pub(crate) async fn bind(
        &self,
        topic_id: &str,
        partition: u32,
        on_record: RecordHandler,
    ) -> ChannelResult<SubscriptionHandle> {
        let slot = self
            .topics
            .lock()
            .entry(topic_id.to_string())
            .or_default()
            .entry(partition)
            .or_default()
            .clone();

        if let Some(existing) = slot.get() {
            debug!(topic = topic_id, partition, handle = %existing, "Already subscribed");
            return Ok(existing.clone());
        }

        let substrate = &self.ctx.substrate;
        let handle = slot
            .get_or_try_init(|| async move {
                let handle = substrate.subscribe(topic_id, partition, on_record).await?;
                info!(topic = topic_id, partition, handle = %handle, "Subscribed");
                Ok::<_, ChannelError>(handle)
            })
            .await?;
        Ok(handle.clone())
    }

    /// Bind the ephemeral topic's media partition on first use.
    pub async fn ensure_media_subscription(
        &self,
        ephemeral_id: &str,
        handler: PayloadHandler,
        secret: Option<String>,
    ) -> ChannelResult<SubscriptionHandle> {
        if !naming::is_ephemeral(ephemeral_id) {
            warn!(
                error = %ChannelError::InvalidIdentifierFormat(ephemeral_id.to_string()),
                "Media subscription on a non-ephemeral topic id"
            );
        }
        self.subscribe_to_partition(ephemeral_id, MEDIA_PARTITION, handler, secret)
            .await
    }

    pub async fn is_subscribed(&self, topic_id: &str, partition: u32) -> bool {
        self.topics
            .lock()
            .get(topic_id)
            .and_then(|p| p.get(&partition))
            .is_some_and(|slot| slot.initialized())
    }

    /// Partitions currently bound for a topic, ascending.
    pub async fn subscribed_partitions(&self, topic_id: &str) -> Vec<u32> {
        let mut partitions: Vec<u32> = self
            .topics
            .lock()
            .get(topic_id)
            .map(|p| {
                p.iter()
                    .filter(|(_, slot)| slot.initialized())
                    .map(|(partition, _)| *partition)
                    .collect()
            })
            .unwrap_or_default();
        partitions.sort_unstable();
        partitions
    }

    /// Release every bound partition of a topic.
    ///
    /// All partitions are released even if one fails; the first failure is
    /// returned and the handles that could not be released stay tracked.
    pub async fn unsubscribe(&self, topic_id: &str) -> ChannelResult<()> {
        let handles = {
            let mut topics = self.topics.lock();
            let Some(partitions) = topics.get_mut(topic_id) else {
                return Ok(());
            };
            let handles = take_bound(partitions);
            if partitions.is_empty() {
                topics.remove(topic_id);
            }
            handles
        };

        let result = self.release(handles).await;
        info!(topic = topic_id, "Unsubscribed");
        result
    }

    /// Release everything this manager holds.
    pub async fn disconnect(&self) -> ChannelResult<()> {
        let all: Vec<SubscriptionHandle> = {
            let mut topics = self.topics.lock();
            let all = topics.values_mut().flat_map(take_bound).collect();
            topics.retain(|_, partitions| !partitions.is_empty());
            all
        };

        let count = all.len();
        let result = self.release(all).await;
        info!(count, "Disconnected all subscriptions");
        result
    }

    async fn release(&self, handles: Vec<SubscriptionHandle>) -> ChannelResult<()> {
        let mut first_error = None;
        let mut kept = Vec::new();
        for handle in handles {
            if let Err(e) = self.ctx.substrate.unsubscribe(&handle).await {
                warn!(handle = %handle, error = %e, "Failed to release subscription");
                first_error.get_or_insert(e);
                kept.push(handle);
            }
        }
        self.restore(kept);
        first_error.map_or(Ok(()), Err)
    }

    /// Track handles again after a failed release.
    fn restore(&self, handles: Vec<SubscriptionHandle>) {
        if handles.is_empty() {
            return;
        }
        let mut topics = self.topics.lock();
        for handle in handles {
            let partitions = topics.entry(handle.topic.clone()).or_default();
            let occupied = partitions
                .get(&handle.partition)
                .is_some_and(|slot| slot.initialized() || Arc::strong_count(slot) > 1);
            if occupied {
                warn!(handle = %handle, "Pair rebound during release, handle no longer tracked");
                continue;
            }
            partitions.insert(handle.partition, Arc::new(OnceCell::new_with(Some(handle))));
        }
    }
}
