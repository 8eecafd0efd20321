//! ChannelEngine - the entry point applications talk to
//!
//! ChannelEngine composes the provisioner, permission manager, subscription
//! manager and history replayer over one [`EngineContext`]:
//! - Channel lifecycle (create, repair, delete)
//! - Dual-topic subscriptions with history replay on join
//! - Typed publishing to the persistent and ephemeral topics
//! - Channel-level grants and capability checks
//!
//! # Example
//!
//! ```ignore
//! use chanweave_core::{ChannelEngine, CreateChannelRequest, ChannelType};
//!
//! let engine = ChannelEngine::connect(substrate, owner, EngineConfig::default())?;
//!
//! let created = engine
//!     .create_channel(&CreateChannelRequest::new("Team Chat", ChannelType::Public))
//!     .await?;
//!
//! engine
//!     .subscribe_to_dual_topics(
//!         &created.persistent_id,
//!         created.ephemeral_id.as_deref(),
//!         DualTopicHandlers::new(on_message),
//!         None,
//!         None,
//!     )
//!     .await?;
//!
//! engine.publish_message(&created.persistent_id, "hello", None).await?;
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::context::EngineContext;
use crate::crypto::encrypt_json;
use crate::error::{ChannelError, ChannelResult};
use crate::history::{HistoryPage, HistoryRecord, HistoryReplayer, HistorySubscription};
use crate::message::ChatRecord;
use crate::naming;
use crate::permissions::PermissionManager;
use crate::provisioner::{sibling_pair, ChannelProvisioner};
use crate::subscription::{PayloadHandler, SubscriptionManager};
use crate::substrate::{Substrate, SubscriptionHandle};
use crate::types::permission::read_write;
use crate::types::{
    Address, CapabilitySummary, CreateChannelRequest, ProvisionState, ProvisionedChannel,
    CONTROL_PARTITION, MEDIA_PARTITION, MESSAGES_PARTITION,
};

/// Notifications about channel lifecycle and access changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Both topics exist and initial permissions are set
    Created {
        persistent_id: String,
        ephemeral_id: String,
    },
    /// Channel usable for messaging only; the ephemeral topic is missing
    Degraded { persistent_id: String },
    Deleted { persistent_id: String },
    /// Members were granted or had their access revoked
    PermissionsChanged {
        persistent_id: String,
        principals: Vec<Address>,
        granted: bool,
    },
}

/// Handlers for the three streams of a channel.
#[derive(Clone)]
pub struct DualTopicHandlers {
    /// Chat content from the persistent topic, history first
    pub on_message: PayloadHandler,
    /// Presence and typing from the ephemeral control partition
    pub on_control: Option<PayloadHandler>,
    /// Media chunks; bound lazily by [`ChannelEngine::ensure_media_subscription`]
    pub on_media: Option<PayloadHandler>,
}

impl DualTopicHandlers {
    pub fn new(on_message: PayloadHandler) -> Self {
        Self {
            on_message,
            on_control: None,
            on_media: None,
        }
    }

    pub fn with_control(mut self, handler: PayloadHandler) -> Self {
        self.on_control = Some(handler);
        self
    }

    pub fn with_media(mut self, handler: PayloadHandler) -> Self {
        self.on_media = Some(handler);
        self
    }
}

/// What [`ChannelEngine::subscribe_to_dual_topics`] bound.
pub struct DualSubscription {
    /// Live persistent subscription and its history load
    pub messages: HistorySubscription,
    /// `None` when there is no ephemeral topic, no control handler, or the
    /// ephemeral subscribe failed
    pub control: Option<SubscriptionHandle>,
}

/// Media handler waiting for its first transfer.
#[derive(Clone)]
struct MediaBinding {
    handler: PayloadHandler,
    secret: Option<String>,
}

/// Main entry point for channel orchestration
pub struct ChannelEngine {
    ctx: EngineContext,
    provisioner: ChannelProvisioner,
    permissions: PermissionManager,
    subscriptions: SubscriptionManager,
    history: HistoryReplayer,
    /// Ephemeral topic id -> pending media handler
    media: Mutex<HashMap<String, MediaBinding>>,
    event_tx: broadcast::Sender<ChannelEvent>,
}

impl ChannelEngine {
    /// Build an engine over an existing context.
    pub fn new(ctx: EngineContext) -> Self {
        let (event_tx, _) = broadcast::channel(ctx.config.event_channel_capacity.max(1));
        Self {
            provisioner: ChannelProvisioner::new(ctx.clone()),
            permissions: PermissionManager::new(ctx.clone()),
            subscriptions: SubscriptionManager::new(ctx.clone()),
            history: HistoryReplayer::new(ctx.clone()),
            media: Mutex::new(HashMap::new()),
            event_tx,
            ctx,
        }
    }

    /// Build the context and the engine in one step.
    pub fn connect(
        substrate: Arc<dyn Substrate>,
        owner: Address,
        config: EngineConfig,
    ) -> ChannelResult<Self> {
        info!(owner = %owner, "Initializing ChannelEngine");
        Ok(Self::new(EngineContext::new(substrate, owner, config)?))
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    pub fn owner(&self) -> &Address {
        &self.ctx.owner
    }

    pub fn provisioner(&self) -> &ChannelProvisioner {
        &self.provisioner
    }

    pub fn permissions(&self) -> &PermissionManager {
        &self.permissions
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    pub fn history(&self) -> &HistoryReplayer {
        &self.history
    }

    /// Subscribe to lifecycle and permission events.
    pub fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.event_tx.subscribe()
    }

    fn emit(&self, event: ChannelEvent) {
        // No receivers is fine.
        let _ = self.event_tx.send(event);
    }

    fn emit_outcome(&self, provisioned: &ProvisionedChannel) {
        match &provisioned.ephemeral_id {
            Some(ephemeral_id) => self.emit(ChannelEvent::Created {
                persistent_id: provisioned.persistent_id.clone(),
                ephemeral_id: ephemeral_id.clone(),
            }),
            None => self.emit(ChannelEvent::Degraded {
                persistent_id: provisioned.persistent_id.clone(),
            }),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Channel Lifecycle
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn create_channel(
        &self,
        request: &CreateChannelRequest,
    ) -> ChannelResult<ProvisionedChannel> {
        let provisioned = self.provisioner.create_channel(request).await?;
        self.emit_outcome(&provisioned);
        Ok(provisioned)
    }

    /// Retry ephemeral creation for a degraded channel.
    pub async fn repair_channel<S: AsRef<str>>(
        &self,
        persistent_id: &str,
        members: &[S],
    ) -> ChannelResult<ProvisionedChannel> {
        let provisioned = self.provisioner.repair(persistent_id, members).await?;
        self.emit_outcome(&provisioned);
        Ok(provisioned)
    }

    pub async fn inspect_channel(&self, topic_id: &str) -> ChannelResult<ProvisionState> {
        self.provisioner.inspect(topic_id).await
    }

    /// Delete a channel given either of its topic ids.
    pub async fn delete_channel(&self, topic_id: &str) -> ChannelResult<()> {
        let (persistent_id, ephemeral_id) = sibling_pair(topic_id);
        self.provisioner
            .delete_channel(topic_id, &self.subscriptions)
            .await?;
        self.media.lock().await.remove(&ephemeral_id);
        self.emit(ChannelEvent::Deleted { persistent_id });
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Subscriptions
    // ═══════════════════════════════════════════════════════════════════════

    /// Join a channel: messages with history, control live, media on demand.
    ///
    /// `history_count` of `None` uses the configured default. A failure on
    /// the ephemeral topic is logged and leaves the message subscription in
    /// place; only a failure on the persistent topic is returned.
    pub async fn subscribe_to_dual_topics(
        &self,
        persistent_id: &str,
        ephemeral_id: Option<&str>,
        handlers: DualTopicHandlers,
        secret: Option<&str>,
        history_count: Option<usize>,
    ) -> ChannelResult<DualSubscription> {
        let history_count = history_count.unwrap_or(self.ctx.config.default_history_count);
        let secret = secret.map(str::to_string);

        let messages = self
            .history
            .subscribe_with_history(
                &self.subscriptions,
                persistent_id,
                MESSAGES_PARTITION,
                handlers.on_message,
                history_count,
                secret.clone(),
            )
            .await?;

        let Some(ephemeral_id) = ephemeral_id else {
            debug!(channel = persistent_id, "No ephemeral topic, messages only");
            return Ok(DualSubscription {
                messages,
                control: None,
            });
        };

        if let Some(on_media) = handlers.on_media {
            self.media.lock().await.insert(
                ephemeral_id.to_string(),
                MediaBinding {
                    handler: on_media,
                    secret: secret.clone(),
                },
            );
        }

        let control = match handlers.on_control {
            Some(on_control) => match self
                .subscriptions
                .subscribe_to_partition(ephemeral_id, CONTROL_PARTITION, on_control, secret)
                .await
            {
                Ok(handle) => Some(handle),
                Err(e) => {
                    warn!(
                        topic = ephemeral_id,
                        error = %e,
                        "Control subscription failed, continuing with messages only"
                    );
                    None
                }
            },
            None => None,
        };

        Ok(DualSubscription { messages, control })
    }

    /// Bind the media partition registered by `subscribe_to_dual_topics`.
    pub async fn ensure_media_subscription(
        &self,
        ephemeral_id: &str,
    ) -> ChannelResult<SubscriptionHandle> {
        let binding = self.media.lock().await.get(ephemeral_id).cloned();
        let Some(binding) = binding else {
            return Err(ChannelError::InvalidOperation(format!(
                "no media handler registered for {}",
                ephemeral_id
            )));
        };
        self.subscriptions
            .ensure_media_subscription(ephemeral_id, binding.handler, binding.secret)
            .await
    }

    /// Drop every subscription of a channel without deleting it.
    pub async fn leave_channel(&self, topic_id: &str) -> ChannelResult<()> {
        let (persistent_id, ephemeral_id) = sibling_pair(topic_id);
        self.media.lock().await.remove(&ephemeral_id);
        let persistent = self.subscriptions.unsubscribe(&persistent_id).await;
        let ephemeral = self.subscriptions.unsubscribe(&ephemeral_id).await;
        persistent.and(ephemeral)
    }

    /// Release every subscription held by this engine.
    pub async fn disconnect(&self) -> ChannelResult<()> {
        self.media.lock().await.clear();
        self.subscriptions.disconnect().await
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Publishing
    // ═══════════════════════════════════════════════════════════════════════

    /// Publish a raw payload, encrypting it when a secret is given.
    ///
    /// Not retried: a failed publish may already have been delivered.
    pub async fn publish(
        &self,
        topic_id: &str,
        partition: u32,
        payload: Value,
        secret: Option<&str>,
    ) -> ChannelResult<()> {
        let payload = match secret {
            Some(secret) => Value::String(encrypt_json(&payload, secret)?),
            None => payload,
        };
        self.ctx
            .substrate
            .publish(topic_id, partition, payload)
            .await
    }

    async fn publish_record(
        &self,
        topic_id: &str,
        partition: u32,
        record: ChatRecord,
        secret: Option<&str>,
    ) -> ChannelResult<ChatRecord> {
        let expected = if record.is_ephemeral() {
            naming::is_ephemeral(topic_id)
        } else {
            naming::is_persistent(topic_id)
        };
        if !expected {
            warn!(
                error = %ChannelError::InvalidIdentifierFormat(topic_id.to_string()),
                "Record published to a topic of the other kind"
            );
        }

        self.publish(topic_id, partition, record.to_value(), secret)
            .await?;
        Ok(record)
    }

    fn sender(&self) -> String {
        self.ctx.owner.to_string()
    }

    pub async fn publish_message(
        &self,
        persistent_id: &str,
        text: &str,
        secret: Option<&str>,
    ) -> ChannelResult<ChatRecord> {
        let record = ChatRecord::text(self.sender(), text);
        self.publish_record(persistent_id, MESSAGES_PARTITION, record, secret)
            .await
    }

    pub async fn publish_reaction(
        &self,
        persistent_id: &str,
        message_id: &str,
        emoji: &str,
        secret: Option<&str>,
    ) -> ChannelResult<ChatRecord> {
        let record = ChatRecord::reaction(self.sender(), message_id, emoji);
        self.publish_record(persistent_id, MESSAGES_PARTITION, record, secret)
            .await
    }

    pub async fn publish_image(
        &self,
        persistent_id: &str,
        image_id: &str,
        caption: Option<String>,
        secret: Option<&str>,
    ) -> ChannelResult<ChatRecord> {
        let record = ChatRecord::image(self.sender(), image_id, caption);
        self.publish_record(persistent_id, MESSAGES_PARTITION, record, secret)
            .await
    }

    /// Announce a media file in the chat history.
    pub async fn publish_media(
        &self,
        persistent_id: &str,
        metadata: Value,
        secret: Option<&str>,
    ) -> ChannelResult<ChatRecord> {
        let record = ChatRecord::media(self.sender(), metadata);
        self.publish_record(persistent_id, MESSAGES_PARTITION, record, secret)
            .await
    }

    /// Publish an arbitrary control payload on the ephemeral topic.
    pub async fn publish_control(
        &self,
        ephemeral_id: &str,
        payload: Value,
        secret: Option<&str>,
    ) -> ChannelResult<()> {
        self.publish(ephemeral_id, CONTROL_PARTITION, payload, secret)
            .await
    }

    pub async fn publish_presence(
        &self,
        ephemeral_id: &str,
        status: &str,
        secret: Option<&str>,
    ) -> ChannelResult<ChatRecord> {
        let record = ChatRecord::presence(self.sender(), status);
        self.publish_record(ephemeral_id, CONTROL_PARTITION, record, secret)
            .await
    }

    pub async fn publish_typing(
        &self,
        ephemeral_id: &str,
        typing: bool,
        secret: Option<&str>,
    ) -> ChannelResult<ChatRecord> {
        let record = ChatRecord::typing(self.sender(), typing);
        self.publish_record(ephemeral_id, CONTROL_PARTITION, record, secret)
            .await
    }

    /// Send one chunk of a peer-to-peer transfer on the media partition.
    pub async fn publish_media_chunk(
        &self,
        ephemeral_id: &str,
        transfer_id: &str,
        index: u32,
        total: u32,
        data: String,
        secret: Option<&str>,
    ) -> ChannelResult<ChatRecord> {
        let record = ChatRecord::MediaChunk {
            transfer_id: transfer_id.to_string(),
            index,
            total,
            data,
            sender: self.sender(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        self.publish_record(ephemeral_id, MEDIA_PARTITION, record, secret)
            .await
    }

    // ═══════════════════════════════════════════════════════════════════════
    // History
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn fetch_recent_history(
        &self,
        persistent_id: &str,
        count: usize,
        secret: Option<&str>,
    ) -> Vec<HistoryRecord> {
        self.history.fetch_recent(persistent_id, count, secret).await
    }

    pub async fn fetch_older_history(
        &self,
        persistent_id: &str,
        before_timestamp: i64,
        count: usize,
        secret: Option<&str>,
    ) -> ChannelResult<HistoryPage> {
        self.history
            .fetch_older(persistent_id, before_timestamp, count, secret)
            .await
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Permissions
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn check_capabilities(
        &self,
        topic_id: &str,
        principal: &str,
    ) -> ChannelResult<CapabilitySummary> {
        self.permissions.check_capabilities(topic_id, principal).await
    }

    /// Grant publish and subscribe on both topics, persistent first.
    ///
    /// Pass `None` for a degraded channel's ephemeral topic. Every address is
    /// validated before the first call.
    pub async fn grant_permissions_to_addresses<S: AsRef<str>>(
        &self,
        persistent_id: &str,
        ephemeral_id: Option<&str>,
        addresses: &[S],
    ) -> ChannelResult<()> {
        let principals = Address::parse_all(addresses)?;

        self.permissions
            .grant_to_addresses(persistent_id, addresses, &read_write())
            .await?;
        if let Some(ephemeral_id) = ephemeral_id {
            self.permissions
                .grant_to_addresses(ephemeral_id, addresses, &read_write())
                .await?;
        }

        info!(channel = persistent_id, count = principals.len(), "Members granted");
        self.emit(ChannelEvent::PermissionsChanged {
            persistent_id: persistent_id.to_string(),
            principals,
            granted: true,
        });
        Ok(())
    }

    /// Revoke all access of the listed addresses on both topics.
    pub async fn revoke_permissions_from_addresses<S: AsRef<str>>(
        &self,
        persistent_id: &str,
        ephemeral_id: Option<&str>,
        addresses: &[S],
    ) -> ChannelResult<()> {
        let principals = Address::parse_all(addresses)?;

        self.permissions.revoke(persistent_id, addresses).await?;
        if let Some(ephemeral_id) = ephemeral_id {
            self.permissions.revoke(ephemeral_id, addresses).await?;
        }

        self.emit(ChannelEvent::PermissionsChanged {
            persistent_id: persistent_id.to_string(),
            principals,
            granted: false,
        });
        Ok(())
    }
}

impl std::fmt::Debug for ChannelEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelEngine")
            .field("ctx", &self.ctx)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::{MemoryNetwork, SubstrateOp};
    use crate::types::ChannelType;
    use serde_json::json;

    fn owner() -> Address {
        Address::parse("0x00000000000000000000000000000000000000aa").unwrap()
    }

    fn engine(net: &MemoryNetwork) -> ChannelEngine {
        ChannelEngine::connect(
            Arc::new(net.connect(owner())),
            owner(),
            EngineConfig::default().with_storage_node("0xstorage"),
        )
        .unwrap()
    }

    fn collector() -> (Arc<parking_lot::Mutex<Vec<Value>>>, PayloadHandler) {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let s = seen.clone();
        (seen, Arc::new(move |v: Value| s.lock().push(v)))
    }

    #[tokio::test]
    async fn test_create_emits_event() {
        let net = MemoryNetwork::new();
        let engine = engine(&net);
        let mut events = engine.events();

        let created = engine
            .create_channel(&CreateChannelRequest::new("room", ChannelType::Public))
            .await
            .unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            ChannelEvent::Created {
                persistent_id: created.persistent_id.clone(),
                ephemeral_id: created.ephemeral_id.clone().unwrap(),
            }
        );
    }

    #[tokio::test]
    async fn test_media_bound_lazily() {
        let net = MemoryNetwork::new();
        let engine = engine(&net);
        let created = engine
            .create_channel(&CreateChannelRequest::new("room", ChannelType::Public))
            .await
            .unwrap();
        let ephemeral = created.ephemeral_id.clone().unwrap();

        let (_, on_message) = collector();
        let (_, on_control) = collector();
        let (media, on_media) = collector();
        let handlers = DualTopicHandlers::new(on_message)
            .with_control(on_control)
            .with_media(on_media);

        let sub = engine
            .subscribe_to_dual_topics(&created.persistent_id, Some(&ephemeral), handlers, None, Some(0))
            .await
            .unwrap();
        assert!(sub.control.is_some());
        assert_eq!(net.subscription_count(&ephemeral, MEDIA_PARTITION), 0);

        engine.ensure_media_subscription(&ephemeral).await.unwrap();
        engine.ensure_media_subscription(&ephemeral).await.unwrap();
        assert_eq!(net.subscription_count(&ephemeral, MEDIA_PARTITION), 1);

        engine
            .publish_media_chunk(&ephemeral, "t1", 0, 1, "AAAA".to_string(), None)
            .await
            .unwrap();
        assert_eq!(media.lock().len(), 1);
        assert_eq!(media.lock()[0]["type"], "media_chunk");
    }

    #[tokio::test]
    async fn test_media_without_handler_is_rejected() {
        let net = MemoryNetwork::new();
        let engine = engine(&net);
        let err = engine
            .ensure_media_subscription("0xaa/room-2")
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::InvalidOperation(_)));
        assert_eq!(net.call_count(SubstrateOp::Subscribe), 0);
    }

    #[tokio::test]
    async fn test_encrypted_round_trip() {
        let net = MemoryNetwork::new();
        let engine = engine(&net);
        let created = engine
            .create_channel(&CreateChannelRequest::new("vault", ChannelType::Password))
            .await
            .unwrap();

        let (seen, on_message) = collector();
        engine
            .subscribe_to_dual_topics(
                &created.persistent_id,
                None,
                DualTopicHandlers::new(on_message),
                Some("hunter2"),
                Some(0),
            )
            .await
            .unwrap();

        engine
            .publish_message(&created.persistent_id, "secret hello", Some("hunter2"))
            .await
            .unwrap();

        let stored = net.stored_records(&created.persistent_id);
        assert!(stored[0].payload.is_string());
        assert!(!stored[0].payload.to_string().contains("secret hello"));

        let seen = seen.lock();
        assert_eq!(seen[0]["text"], "secret hello");
        assert_eq!(seen[0]["senderId"], json!(owner().as_str()));
    }

    #[tokio::test]
    async fn test_leave_keeps_channel() {
        let net = MemoryNetwork::new();
        let engine = engine(&net);
        let created = engine
            .create_channel(&CreateChannelRequest::new("room", ChannelType::Public))
            .await
            .unwrap();
        let (_, on_message) = collector();
        engine
            .subscribe_to_dual_topics(
                &created.persistent_id,
                created.ephemeral_id.as_deref(),
                DualTopicHandlers::new(on_message),
                None,
                Some(0),
            )
            .await
            .unwrap();

        engine.leave_channel(&created.persistent_id).await.unwrap();
        assert_eq!(net.subscription_count(&created.persistent_id, 0), 0);
        assert!(net.topic_exists(&created.persistent_id));
    }
}
