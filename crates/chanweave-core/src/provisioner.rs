//! Channel provisioning
//!
//! Creates the two topics of a channel, enables storage on the persistent
//! one, and sets initial permissions, then recovers from partial failure.
//!
//! ## State machine
//!
//! ```text
//! UNCREATED ─► PERSISTENT_CREATING ─► PERSISTENT_CREATED ─► EPHEMERAL_CREATING
//!                                                                 │
//!             PERMISSIONS_SET ◄── BOTH_CREATED ◄──────────────────┘
//!
//! any failure ─► recover: persistent exists?
//!                 ├── no  ─► fail with the original error
//!                 └── yes ─► re-apply permissions, retry ephemeral
//!                             ├── ok   ─► PERMISSIONS_SET
//!                             └── fail ─► DEGRADED_PERSISTENT_ONLY
//! ```
//!
//! Every substrate call is issued strictly one after another. The substrate
//! orders transactions per identity, and overlapping calls from one creator
//! conflict with each other.

use tracing::{debug, info, warn};

use crate::context::EngineContext;
use crate::crypto::random_hex;
use crate::error::{ChannelError, ChannelResult};
use crate::naming::{self, sanitize_path, TopicKind};
use crate::permissions::PermissionManager;
use crate::subscription::SubscriptionManager;
use crate::substrate::Topic;
use crate::types::permission::{read_only, read_write};
use crate::types::{
    Address, Capability, Channel, ChannelType, CreateChannelRequest, Exposure,
    PermissionAssignment, Principal, ProvisionState, ProvisionedChannel, TopicMetadata,
};

/// Length of the random token in a channel's base identifier.
const BASE_TOKEN_LEN: usize = 16;

/// Everything needed to (re)provision one channel.
struct ChannelPlan {
    channel: Channel,
    persistent_id: String,
    ephemeral_id: String,
    persistent_meta: serde_json::Value,
    ephemeral_meta: serde_json::Value,
    assignments: Vec<PermissionAssignment>,
}

impl ChannelPlan {
    fn new(
        request: &CreateChannelRequest,
        members: Vec<Address>,
        base_id: String,
        owner: &Address,
        created_at: i64,
    ) -> ChannelResult<Self> {
        let persistent_meta =
            serde_json::to_value(request.metadata(TopicKind::Persistent, owner, created_at))?;
        let ephemeral_meta =
            serde_json::to_value(request.metadata(TopicKind::Ephemeral, owner, created_at))?;

        let assignments = match request.channel_type {
            ChannelType::Public | ChannelType::Password => {
                let capabilities = if request.read_only {
                    read_only()
                } else {
                    read_write()
                };
                vec![PermissionAssignment::public(capabilities)]
            }
            ChannelType::Restricted => members
                .iter()
                .map(|m| PermissionAssignment::address(m.clone(), read_write()))
                .collect(),
        };

        let channel = Channel {
            base_id,
            name: (request.exposure == Exposure::Visible).then(|| request.name.clone()),
            channel_type: request.channel_type,
            exposure: request.exposure,
            read_only: request.read_only,
            members,
            created_at,
        };

        Ok(Self {
            persistent_id: channel.persistent_id(),
            ephemeral_id: channel.ephemeral_id(),
            channel,
            persistent_meta,
            ephemeral_meta,
            assignments,
        })
    }

    fn result(self, state: ProvisionState) -> ProvisionedChannel {
        let degraded = state == ProvisionState::DegradedPersistentOnly;
        ProvisionedChannel {
            channel: self.channel,
            persistent_id: self.persistent_id,
            ephemeral_id: (!degraded).then_some(self.ephemeral_id),
            degraded,
            state,
        }
    }
}

fn transition(channel: &str, state: &mut ProvisionState, next: ProvisionState) {
    debug!(channel, from = %state, to = %next, "Provisioning transition");
    *state = next;
}

/// Creates, inspects, repairs and deletes channels.
#[derive(Debug, Clone)]
pub struct ChannelProvisioner {
    ctx: EngineContext,
    permissions: PermissionManager,
}

impl ChannelProvisioner {
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            permissions: PermissionManager::new(ctx.clone()),
            ctx,
        }
    }

    /// Fresh base identifier in the owner's namespace.
    ///
    /// Hidden channels get a purely random path so the name never appears
    /// in a topic id.
    pub fn generate_base_id(&self, request: &CreateChannelRequest) -> String {
        let token = random_hex(BASE_TOKEN_LEN);
        match request.exposure {
            Exposure::Visible => format!(
                "{}/{}-{}",
                self.ctx.owner,
                sanitize_path(&request.name),
                token
            ),
            Exposure::Hidden => format!("{}/{}", self.ctx.owner, token),
        }
    }

    /// Create both topics of a new channel and grant initial permissions.
    ///
    /// If the ephemeral topic cannot be created even after recovery, the
    /// channel is returned degraded (`ephemeral_id == None`) rather than as
    /// an error. Failure before the persistent topic exists is an error.
    pub async fn create_channel(
        &self,
        request: &CreateChannelRequest,
    ) -> ChannelResult<ProvisionedChannel> {
        let members = Address::parse_all(&request.members)?;
        let base_id = self.generate_base_id(request);
        let created_at = chrono::Utc::now().timestamp_millis();
        let plan = ChannelPlan::new(request, members, base_id, &self.ctx.owner, created_at)?;

        let mut state = ProvisionState::Uncreated;
        match self.provision(&plan, &mut state).await {
            Ok(()) => {
                info!(
                    channel = %plan.persistent_id,
                    channel_type = %request.channel_type,
                    "Channel created"
                );
                Ok(plan.result(state))
            }
            Err(e) => {
                warn!(
                    channel = %plan.persistent_id,
                    state = %state,
                    error = %e,
                    "Channel creation failed, attempting recovery"
                );
                self.recover(plan, state, e).await
            }
        }
    }

    async fn provision(&self, plan: &ChannelPlan, state: &mut ProvisionState) -> ChannelResult<()> {
        let channel = plan.persistent_id.as_str();

        transition(channel, state, ProvisionState::PersistentCreating);
        self.create_topic(&plan.persistent_id, &plan.persistent_meta, TopicKind::Persistent)
            .await?;
        transition(channel, state, ProvisionState::PersistentCreated);
        self.enable_storage(&plan.persistent_id).await;

        transition(channel, state, ProvisionState::EphemeralCreating);
        self.create_topic(&plan.ephemeral_id, &plan.ephemeral_meta, TopicKind::Ephemeral)
            .await?;
        transition(channel, state, ProvisionState::BothCreated);

        self.permissions
            .apply(&plan.persistent_id, plan.assignments.clone())
            .await?;
        self.permissions
            .apply(&plan.ephemeral_id, plan.assignments.clone())
            .await?;
        transition(channel, state, ProvisionState::PermissionsSet);
        Ok(())
    }

    async fn recover(
        &self,
        plan: ChannelPlan,
        mut state: ProvisionState,
        original: ChannelError,
    ) -> ChannelResult<ProvisionedChannel> {
        match self.lookup(&plan.persistent_id).await {
            Ok(Some(_)) => {}
            Ok(None) => return Err(original),
            Err(e) => {
                warn!(channel = %plan.persistent_id, error = %e, "Existence check failed");
                return Err(original);
            }
        }

        transition(&plan.persistent_id, &mut state, ProvisionState::PersistentCreated);
        self.resume(plan, state, Some(original)).await
    }

    /// Continue from a state where the persistent topic is known to exist.
    ///
    /// With `original` set (a failed creation), a persistent topic that still
    /// cannot be granted is deleted again and `original` is returned. Without
    /// it (repair of an existing channel), the grant error is returned and
    /// the topics are left in place.
    async fn resume(
        &self,
        plan: ChannelPlan,
        mut state: ProvisionState,
        original: Option<ChannelError>,
    ) -> ChannelResult<ProvisionedChannel> {
        let channel = plan.persistent_id.clone();

        match self.lookup(&plan.persistent_id).await {
            Ok(Some(topic)) => {
                if let Some(node) = &self.ctx.config.storage_node {
                    if !topic.storage_nodes.contains(node) {
                        self.enable_storage(&plan.persistent_id).await;
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(channel = %channel, error = %e, "Storage check skipped");
            }
        }

        if let Err(e) = self
            .permissions
            .apply(&plan.persistent_id, plan.assignments.clone())
            .await
        {
            let Some(original) = original else {
                return Err(e);
            };
            warn!(
                channel = %channel,
                state = %state,
                error = %e,
                "Persistent topic cannot be granted, discarding channel"
            );
            self.discard(&plan).await;
            return Err(original);
        }

        transition(&channel, &mut state, ProvisionState::EphemeralCreating);
        let ephemeral_ready = match self.lookup(&plan.ephemeral_id).await {
            Ok(Some(_)) => Ok(()),
            _ => self
                .create_topic(&plan.ephemeral_id, &plan.ephemeral_meta, TopicKind::Ephemeral)
                .await
                .map(|_| ()),
        };

        let ephemeral_ready = match ephemeral_ready {
            Ok(()) => {
                transition(&channel, &mut state, ProvisionState::BothCreated);
                self.permissions
                    .apply(&plan.ephemeral_id, plan.assignments.clone())
                    .await
            }
            Err(e) => Err(e),
        };

        match ephemeral_ready {
            Ok(()) => {
                transition(&channel, &mut state, ProvisionState::PermissionsSet);
                info!(channel = %channel, "Channel recovered");
                Ok(plan.result(state))
            }
            Err(e) => {
                transition(&channel, &mut state, ProvisionState::DegradedPersistentOnly);
                warn!(
                    channel = %channel,
                    error = %e,
                    "Ephemeral topic unavailable, channel degraded to messaging only"
                );
                Ok(plan.result(state))
            }
        }
    }

    /// Re-run recovery for an existing (typically degraded) channel.
    ///
    /// Channel attributes come from the persistent topic's metadata;
    /// restricted channels need their member list passed back in.
    pub async fn repair<S: AsRef<str>>(
        &self,
        persistent_id: &str,
        members: &[S],
    ) -> ChannelResult<ProvisionedChannel> {
        let members = Address::parse_all(members)?;
        let topic = self
            .lookup(persistent_id)
            .await?
            .ok_or_else(|| ChannelError::TopicNotFound(persistent_id.to_string()))?;
        let metadata: TopicMetadata = serde_json::from_value(topic.metadata)?;

        let request = CreateChannelRequest {
            name: metadata.name.clone().unwrap_or_default(),
            description: metadata.description.clone(),
            channel_type: metadata.channel_type,
            members: Vec::new(),
            exposure: metadata.exposure,
            read_only: metadata.read_only,
        };
        let plan = ChannelPlan::new(
            &request,
            members,
            naming::base_id(persistent_id).to_string(),
            &self.ctx.owner,
            metadata.created_at,
        )?;

        info!(channel = persistent_id, "Repairing channel");
        self.resume(plan, ProvisionState::PersistentCreated, None).await
    }

    /// Where an existing channel stands, from either topic id.
    pub async fn inspect(&self, topic_id: &str) -> ChannelResult<ProvisionState> {
        let (persistent_id, ephemeral_id) = sibling_pair(topic_id);

        let Some(persistent) = self.lookup(&persistent_id).await? else {
            return Ok(ProvisionState::Uncreated);
        };
        if self.lookup(&ephemeral_id).await?.is_none() {
            return Ok(ProvisionState::DegradedPersistentOnly);
        }

        let restricted = serde_json::from_value::<TopicMetadata>(persistent.metadata)
            .map(|m| m.channel_type == ChannelType::Restricted)
            .unwrap_or(false);

        let mut granted = true;
        for topic in [&persistent_id, &ephemeral_id] {
            granted &= if restricted {
                self.has_member_grants(topic).await?
            } else {
                self.ctx
                    .substrate
                    .has_permission(topic, Capability::Subscribe, &Principal::Public, true)
                    .await?
            };
        }

        Ok(if granted {
            ProvisionState::PermissionsSet
        } else {
            ProvisionState::BothCreated
        })
    }

    async fn has_member_grants(&self, topic_id: &str) -> ChannelResult<bool> {
        let owner = Principal::Address(self.ctx.owner.clone());
        let assignments = self.permissions.query(topic_id).await?;
        if assignments.is_empty() {
            // No enumeration: assume grants were made.
            return Ok(true);
        }
        Ok(assignments
            .iter()
            .any(|a| a.principal != owner && !a.capabilities.is_empty()))
    }

    /// Tear down a channel from either of its topic ids.
    ///
    /// Unsubscribing is best-effort. Failing to delete the persistent topic
    /// is fatal; failing to delete the ephemeral one is only logged.
    pub async fn delete_channel(
        &self,
        topic_id: &str,
        subscriptions: &SubscriptionManager,
    ) -> ChannelResult<()> {
        let (persistent_id, ephemeral_id) = sibling_pair(topic_id);

        for topic in [&persistent_id, &ephemeral_id] {
            if let Err(e) = subscriptions.unsubscribe(topic).await {
                warn!(topic = %topic, error = %e, "Unsubscribe before delete failed");
            }
        }

        self.delete_topic(&persistent_id).await?;

        match self.delete_topic(&ephemeral_id).await {
            Ok(()) => {}
            Err(ChannelError::TopicNotFound(_)) => {
                debug!(topic = %ephemeral_id, "No ephemeral topic to delete");
            }
            Err(e) => {
                warn!(topic = %ephemeral_id, error = %e, "Failed to delete ephemeral topic");
            }
        }

        info!(channel = %persistent_id, "Channel deleted");
        Ok(())
    }

    /// Best-effort removal of a half-provisioned channel, ephemeral first.
    async fn discard(&self, plan: &ChannelPlan) {
        for id in [&plan.ephemeral_id, &plan.persistent_id] {
            match self.lookup(id).await {
                Ok(None) => continue,
                Ok(Some(_)) => {}
                Err(e) => {
                    warn!(topic = %id, error = %e, "Cannot check topic before discarding");
                    continue;
                }
            }
            match self.delete_topic(id).await {
                Ok(()) => debug!(topic = %id, "Discarded topic"),
                Err(e) => warn!(topic = %id, error = %e, "Failed to discard topic"),
            }
        }
    }

    /// Create a topic, treating "failed but exists" as success.
    async fn create_topic(
        &self,
        id: &str,
        metadata: &serde_json::Value,
        kind: TopicKind,
    ) -> ChannelResult<Topic> {
        let substrate = &self.ctx.substrate;
        self.ctx
            .retry("create_topic", id, |_| async move {
                match substrate
                    .create_topic(id, metadata.clone(), kind.partition_count())
                    .await
                {
                    Ok(topic) => Ok(topic),
                    Err(e) => match substrate.get_topic(id).await {
                        Ok(Some(topic)) => {
                            warn!(
                                error = %ChannelError::PartialCreationConflict(id.to_string()),
                                reported = %e,
                                "Topic exists despite reported failure"
                            );
                            Ok(topic)
                        }
                        _ => Err(e),
                    },
                }
            })
            .await
    }

    /// Delete a topic; on a retry, "not found" means an earlier attempt landed.
    async fn delete_topic(&self, id: &str) -> ChannelResult<()> {
        let substrate = &self.ctx.substrate;
        self.ctx
            .retry("delete_topic", id, |attempt| async move {
                match substrate.delete_topic(id).await {
                    Err(ChannelError::TopicNotFound(_)) if attempt > 1 => Ok(()),
                    other => other,
                }
            })
            .await
    }

    /// Attach the storage node and retention. Failure leaves the channel
    /// usable for live traffic, so it is logged rather than returned.
    async fn enable_storage(&self, persistent_id: &str) {
        let Some(node) = self.ctx.config.storage_node.as_deref() else {
            return;
        };
        let substrate = &self.ctx.substrate;

        let added = self
            .ctx
            .retry("add_to_storage", persistent_id, |_| {
                substrate.add_to_storage(persistent_id, node)
            })
            .await;
        if let Err(e) = added {
            warn!(topic = persistent_id, error = %e, "Failed to enable storage");
            return;
        }

        let days = self.ctx.config.retention_days;
        if let Err(e) = self
            .ctx
            .retry("set_retention_days", persistent_id, |_| {
                substrate.set_retention_days(persistent_id, days)
            })
            .await
        {
            warn!(topic = persistent_id, error = %e, "Failed to set retention");
        }
    }

    async fn lookup(&self, id: &str) -> ChannelResult<Option<Topic>> {
        let substrate = &self.ctx.substrate;
        self.ctx
            .retry("get_topic", id, |_| substrate.get_topic(id))
            .await
    }
}

/// (persistent, ephemeral) ids for either member of the pair.
pub(crate) fn sibling_pair(topic_id: &str) -> (String, String) {
    match TopicKind::of(topic_id) {
        Some(TopicKind::Persistent) => (topic_id.to_string(), naming::derive_ephemeral(topic_id)),
        Some(TopicKind::Ephemeral) => (naming::derive_persistent(topic_id), topic_id.to_string()),
        None => (
            naming::derive_persistent(topic_id),
            naming::derive_ephemeral(topic_id),
        ),
    }
}
