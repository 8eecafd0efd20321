//! History replay from the persistent topic
//!
//! Replays stored records, decodes them, and keeps only chat content (see
//! [`is_history_record`]). Replay degrades instead of failing: a substrate
//! error mid-stream yields the records collected so far, and records that
//! cannot be decrypted are dropped without leaving a gap marker.

use std::collections::HashSet;
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::context::EngineContext;
use crate::error::{ChannelError, ChannelResult};
use crate::message::is_history_record;
use crate::naming;
use crate::substrate::{Record, RecordHandler, ResendOptions, SubscriptionHandle};
use crate::subscription::{decode_record, PayloadHandler, SubscriptionManager};
use crate::types::MESSAGES_PARTITION;

/// A decoded, accepted history record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryRecord {
    /// Substrate timestamp (ms)
    pub timestamp: i64,
    pub publisher: Option<String>,
    pub content: Value,
}

/// One backward page of history.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    /// Oldest first, all strictly before the requested boundary
    pub messages: Vec<HistoryRecord>,
    /// More accepted records exist before the oldest one returned
    pub has_more: bool,
}

impl HistoryPage {
    /// Boundary to pass for the next older page.
    pub fn oldest_timestamp(&self) -> Option<i64> {
        self.messages.first().map(|m| m.timestamp)
    }
}

/// A live subscription plus its optional background history load.
pub struct HistorySubscription {
    pub handle: SubscriptionHandle,
    /// Resolves to the number of history records delivered
    pub history: Option<JoinHandle<usize>>,
}

/// Fetches and filters stored records.
#[derive(Debug, Clone)]
pub struct HistoryReplayer {
    ctx: EngineContext,
}

fn accept(record: Record, secret: Option<&str>) -> Option<HistoryRecord> {
    let timestamp = record.timestamp;
    let publisher = record.publisher.clone();
    let content = decode_record(record, secret)?;

    if !is_history_record(&content) {
        debug!(timestamp, "Filtered non-message record from history");
        return None;
    }
    Some(HistoryRecord {
        timestamp,
        publisher,
        content,
    })
}

/// Holds live records while history replays; `None` once opened.
#[derive(Clone)]
struct ReplayGate {
    held: Arc<Mutex<Option<Vec<Record>>>>,
}

impl ReplayGate {
    fn new() -> Self {
        Self {
            held: Arc::new(Mutex::new(Some(Vec::new()))),
        }
    }

    fn live_handler(&self, handler: PayloadHandler, secret: Option<String>) -> RecordHandler {
        let gate = self.clone();
        Arc::new(move |record: Record| {
            {
                let mut held = gate.held.lock();
                if let Some(pending) = held.as_mut() {
                    pending.push(record);
                    return;
                }
            }
            if let Some(value) = decode_record(record, secret.as_deref()) {
                handler(value);
            }
        })
    }

    /// Stop holding and hand back what arrived meanwhile.
    fn open(&self) -> Vec<Record> {
        self.held.lock().take().unwrap_or_default()
    }
}

fn warn_if_not_persistent(topic_id: &str) {
    if !naming::is_persistent(topic_id) {
        warn!(
            error = %ChannelError::InvalidIdentifierFormat(topic_id.to_string()),
            "History requested for a non-persistent topic id"
        );
    }
}

impl HistoryReplayer {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// The last `count` stored records of the messages partition, filtered.
    ///
    /// Never fails: substrate errors end the fetch with what was collected.
    pub async fn fetch_recent(
        &self,
        topic_id: &str,
        count: usize,
        secret: Option<&str>,
    ) -> Vec<HistoryRecord> {
        self.fetch_last(topic_id, MESSAGES_PARTITION, count, secret)
            .await
    }

    async fn fetch_last(
        &self,
        topic_id: &str,
        partition: u32,
        count: usize,
        secret: Option<&str>,
    ) -> Vec<HistoryRecord> {
        warn_if_not_persistent(topic_id);
        if count == 0 {
            return Vec::new();
        }

        let mut stream = match self
            .ctx
            .substrate
            .resend(topic_id, ResendOptions::Last { count, partition })
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                warn!(topic = topic_id, error = %e, "History fetch failed");
                return Vec::new();
            }
        };

        let mut collected = Vec::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(record) => collected.extend(accept(record, secret)),
                Err(e) => {
                    warn!(
                        topic = topic_id,
                        collected = collected.len(),
                        error = %e,
                        "History stream interrupted, returning partial result"
                    );
                    break;
                }
            }
        }

        debug!(topic = topic_id, count = collected.len(), "Fetched recent history");
        collected
    }

    /// Up to `count` accepted records strictly older than `before_timestamp`.
    ///
    /// The full stored range before the boundary is fetched and filtered, and
    /// the `count` records closest to the boundary are kept. `has_more` is set
    /// when the filtered range held more than that; it is also set when the
    /// stream broke off early, since older records may exist.
    pub async fn fetch_older(
        &self,
        topic_id: &str,
        before_timestamp: i64,
        count: usize,
        secret: Option<&str>,
    ) -> ChannelResult<HistoryPage> {
        warn_if_not_persistent(topic_id);
        if before_timestamp <= 0 {
            debug!(topic = topic_id, before_timestamp, "Boundary precedes every stored record");
            return Ok(HistoryPage::default());
        }

        let options = ResendOptions::Range {
            partition: MESSAGES_PARTITION,
            from: 0,
            to: before_timestamp - 1,
        };
        let mut stream = self.ctx.substrate.resend(topic_id, options).await?;

        let mut filtered = Vec::new();
        let mut interrupted = false;
        while let Some(item) = stream.next().await {
            match item {
                Ok(record) if record.timestamp >= before_timestamp => {
                    debug!(timestamp = record.timestamp, "Skipping record at or after boundary");
                }
                Ok(record) => filtered.extend(accept(record, secret)),
                Err(e) => {
                    warn!(topic = topic_id, error = %e, "Older history interrupted");
                    interrupted = true;
                    break;
                }
            }
        }

        let has_more = interrupted || filtered.len() > count;
        let skip = filtered.len().saturating_sub(count);
        let messages: Vec<HistoryRecord> = filtered.into_iter().skip(skip).collect();

        debug!(
            topic = topic_id,
            before_timestamp,
            returned = messages.len(),
            has_more,
            "Fetched older history"
        );
        Ok(HistoryPage { messages, has_more })
    }

    /// Subscribe live, then replay up to `history_count` records through the
    /// same handler in the background.
    ///
    /// The live binding is made first so nothing published during the
    /// replay is missed. Live records arriving before the replay finishes
    /// are held and delivered after it, minus any the replay already carried,
    /// so each record reaches the handler once. A failed replay leaves the
    /// live subscription intact.
    pub async fn subscribe_with_history(
        &self,
        subscriptions: &SubscriptionManager,
        topic_id: &str,
        partition: u32,
        handler: PayloadHandler,
        history_count: usize,
        secret: Option<String>,
    ) -> ChannelResult<HistorySubscription> {
        if history_count == 0 {
            let handle = subscriptions
                .subscribe_to_partition(topic_id, partition, handler, secret)
                .await?;
            return Ok(HistorySubscription {
                handle,
                history: None,
            });
        }

        let gate = ReplayGate::new();
        let handle = subscriptions
            .bind(
                topic_id,
                partition,
                gate.live_handler(handler.clone(), secret.clone()),
            )
            .await?;

        let replayer = self.clone();
        let topic_id = topic_id.to_string();
        let history = tokio::spawn(async move {
            let records = replayer
                .fetch_last(&topic_id, partition, history_count, secret.as_deref())
                .await;
            let replayed: HashSet<(i64, Option<String>)> = records
                .iter()
                .map(|r| (r.timestamp, r.publisher.clone()))
                .collect();
            let delivered = records.len();
            for record in records {
                handler(record.content);
            }

            let mut duplicates = 0usize;
            for record in gate.open() {
                if replayed.contains(&(record.timestamp, record.publisher.clone())) {
                    duplicates += 1;
                    continue;
                }
                if let Some(value) = decode_record(record, secret.as_deref()) {
                    handler(value);
                }
            }
            if duplicates > 0 {
                debug!(topic = %topic_id, duplicates, "Live records already covered by replay");
            }
            delivered
        });

        Ok(HistorySubscription {
            handle,
            history: Some(history),
        })
    }
}
