//! In-process substrate
//!
//! [`MemoryNetwork`] holds topics, permissions, stored records and live
//! subscriptions for any number of identities. Each identity gets its own
//! [`MemorySubstrate`] view via [`MemoryNetwork::connect`], so permission
//! enforcement and publisher attribution behave like the real network.
//!
//! Faults can be injected per operation (optionally only for topics with a
//! given suffix) to exercise retry and recovery paths, including failures
//! reported after the operation already committed.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, trace};

use super::{RecordHandler, RecordStream, ResendOptions, Substrate, SubscriptionHandle, Topic};
use crate::error::{ChannelError, ChannelResult};
use crate::substrate::Record;
use crate::types::{Address, Capability, CapabilitySet, PermissionAssignment, Principal};

/// Substrate operations, for fault targeting and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubstrateOp {
    CreateTopic,
    GetTopic,
    DeleteTopic,
    SetPermissions,
    HasPermission,
    Permissions,
    Publish,
    Subscribe,
    Unsubscribe,
    AddToStorage,
    SetRetentionDays,
    Resend,
}

impl fmt::Display for SubstrateOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SubstrateOp::CreateTopic => "create_topic",
            SubstrateOp::GetTopic => "get_topic",
            SubstrateOp::DeleteTopic => "delete_topic",
            SubstrateOp::SetPermissions => "set_permissions",
            SubstrateOp::HasPermission => "has_permission",
            SubstrateOp::Permissions => "permissions",
            SubstrateOp::Publish => "publish",
            SubstrateOp::Subscribe => "subscribe",
            SubstrateOp::Unsubscribe => "unsubscribe",
            SubstrateOp::AddToStorage => "add_to_storage",
            SubstrateOp::SetRetentionDays => "set_retention_days",
            SubstrateOp::Resend => "resend",
        };
        f.write_str(s)
    }
}

/// An injected failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    op: SubstrateOp,
    topic_suffix: Option<String>,
    /// `None` fails forever
    remaining: Option<u32>,
    commit: bool,
    yield_before_fail: usize,
}

impl Fault {
    /// Fail the next call of `op`.
    pub fn once(op: SubstrateOp) -> Self {
        Self::times(op, 1)
    }

    /// Fail the next `n` calls of `op`.
    pub fn times(op: SubstrateOp, n: u32) -> Self {
        Self {
            op,
            topic_suffix: None,
            remaining: Some(n),
            commit: false,
            yield_before_fail: 0,
        }
    }

    /// Fail every call of `op`.
    pub fn always(op: SubstrateOp) -> Self {
        Self {
            remaining: None,
            ..Self::once(op)
        }
    }

    /// Only apply to topics whose id ends with `suffix`.
    pub fn on_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.topic_suffix = Some(suffix.into());
        self
    }

    /// Perform the operation, then report failure anyway.
    pub fn after_commit(mut self) -> Self {
        self.commit = true;
        self
    }

    /// For `Resend`: deliver `n` records before the stream errors.
    pub fn after_records(mut self, n: usize) -> Self {
        self.yield_before_fail = n;
        self
    }

    fn matches(&self, op: SubstrateOp, topic_id: &str) -> bool {
        self.op == op
            && self.remaining != Some(0)
            && self
                .topic_suffix
                .as_deref()
                .map_or(true, |s| topic_id.ends_with(s))
    }

    fn error(&self, topic_id: &str) -> ChannelError {
        ChannelError::SubstrateUnavailable(format!("injected {} failure on {}", self.op, topic_id))
    }
}

struct TopicState {
    topic: Topic,
    permissions: BTreeMap<Principal, CapabilitySet>,
    records: Vec<Record>,
}

impl TopicState {
    fn allows(&self, identity: &Principal, capability: Capability, allow_public: bool) -> bool {
        let holds = |p: &Principal| {
            self.permissions
                .get(p)
                .is_some_and(|caps| caps.contains(&capability))
        };
        holds(identity) || (allow_public && holds(&Principal::Public))
    }
}

struct SubscriptionEntry {
    handle: SubscriptionHandle,
    handler: RecordHandler,
}

#[derive(Default)]
struct NetworkState {
    topics: HashMap<String, TopicState>,
    subscriptions: Vec<SubscriptionEntry>,
    faults: Vec<Fault>,
    calls: HashMap<SubstrateOp, usize>,
    last_timestamp: i64,
    enumeration_disabled: bool,
}

impl NetworkState {
    /// Count the call and consume a matching fault, if any.
    fn enter(&mut self, op: SubstrateOp, topic_id: &str) -> Option<Fault> {
        *self.calls.entry(op).or_insert(0) += 1;

        let fault = self.faults.iter_mut().find(|f| f.matches(op, topic_id))?;
        if let Some(n) = fault.remaining.as_mut() {
            *n -= 1;
        }
        Some(fault.clone())
    }

    fn topic(&self, id: &str) -> ChannelResult<&TopicState> {
        self.topics
            .get(id)
            .ok_or_else(|| ChannelError::TopicNotFound(id.to_string()))
    }

    fn topic_mut(&mut self, id: &str) -> ChannelResult<&mut TopicState> {
        self.topics
            .get_mut(id)
            .ok_or_else(|| ChannelError::TopicNotFound(id.to_string()))
    }

    fn require(
        &self,
        id: &str,
        identity: &Principal,
        capability: Capability,
        op: SubstrateOp,
    ) -> ChannelResult<()> {
        if self.topic(id)?.allows(identity, capability, true) {
            Ok(())
        } else {
            Err(ChannelError::denied(op.to_string(), id))
        }
    }

    fn next_timestamp(&mut self) -> i64 {
        let now = chrono::Utc::now().timestamp_millis();
        self.last_timestamp = now.max(self.last_timestamp + 1);
        self.last_timestamp
    }
}

/// Shared in-process network state.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
    next_subscription: Arc<AtomicU64>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A substrate view acting as `identity`.
    pub fn connect(&self, identity: Address) -> MemorySubstrate {
        MemorySubstrate {
            network: self.clone(),
            identity: Principal::Address(identity),
        }
    }

    /// Register a fault; faults are consulted in insertion order.
    pub fn inject_fault(&self, fault: Fault) {
        self.state.lock().faults.push(fault);
    }

    pub fn clear_faults(&self) {
        self.state.lock().faults.clear();
    }

    /// Make `permissions()` behave like a substrate without enumeration.
    pub fn disable_enumeration(&self) {
        self.state.lock().enumeration_disabled = true;
    }

    /// Number of calls made to `op` across every identity.
    pub fn call_count(&self, op: SubstrateOp) -> usize {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn topic_exists(&self, id: &str) -> bool {
        self.state.lock().topics.contains_key(id)
    }

    /// Ids of every existing topic, sorted.
    pub fn topic_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.lock().topics.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn topic(&self, id: &str) -> Option<Topic> {
        self.state.lock().topics.get(id).map(|t| t.topic.clone())
    }

    /// Current assignments of a topic, bypassing faults and counters.
    pub fn assignments(&self, id: &str) -> Vec<PermissionAssignment> {
        self.state
            .lock()
            .topics
            .get(id)
            .map(|t| to_assignments(&t.permissions))
            .unwrap_or_default()
    }

    /// Stored records of a topic, oldest first.
    pub fn stored_records(&self, id: &str) -> Vec<Record> {
        self.state
            .lock()
            .topics
            .get(id)
            .map(|t| t.records.clone())
            .unwrap_or_default()
    }

    /// Live subscriptions on a (topic, partition).
    pub fn subscription_count(&self, id: &str, partition: u32) -> usize {
        self.state
            .lock()
            .subscriptions
            .iter()
            .filter(|s| s.handle.topic == id && s.handle.partition == partition)
            .count()
    }

    /// Insert a historical record with an explicit timestamp.
    ///
    /// Bypasses permissions and storage settings; the topic must exist.
    pub fn store_record(
        &self,
        topic_id: &str,
        partition: u32,
        payload: Value,
        timestamp: i64,
        publisher: Option<&str>,
    ) -> ChannelResult<()> {
        let mut state = self.state.lock();
        state.last_timestamp = state.last_timestamp.max(timestamp);
        let topic = state.topic_mut(topic_id)?;
        topic.records.push(Record {
            topic: topic_id.to_string(),
            partition,
            timestamp,
            publisher: publisher.map(str::to_string),
            payload,
        });
        topic.records.sort_by_key(|r| r.timestamp);
        Ok(())
    }
}

fn to_assignments(permissions: &BTreeMap<Principal, CapabilitySet>) -> Vec<PermissionAssignment> {
    permissions
        .iter()
        .map(|(principal, capabilities)| PermissionAssignment {
            principal: principal.clone(),
            capabilities: capabilities.clone(),
        })
        .collect()
}

/// One identity's view of a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemorySubstrate {
    network: MemoryNetwork,
    identity: Principal,
}

impl MemorySubstrate {
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }

    pub fn identity(&self) -> &Principal {
        &self.identity
    }

    /// Run `op` under the network lock, honouring injected faults.
    fn run<T>(
        &self,
        op: SubstrateOp,
        topic_id: &str,
        body: impl FnOnce(&mut NetworkState) -> ChannelResult<T>,
    ) -> ChannelResult<T> {
        let mut state = self.network.state.lock();
        let fault = state.enter(op, topic_id);

        match fault {
            Some(f) if !f.commit => {
                trace!(%op, topic = topic_id, "Injected failure before commit");
                Err(f.error(topic_id))
            }
            Some(f) => {
                let _ = body(&mut state)?;
                trace!(%op, topic = topic_id, "Injected failure after commit");
                Err(f.error(topic_id))
            }
            None => body(&mut state),
        }
    }
}

#[async_trait]
impl Substrate for MemorySubstrate {
    async fn create_topic(&self, id: &str, metadata: Value, partitions: u32) -> ChannelResult<Topic> {
        let identity = self.identity.clone();
        self.run(SubstrateOp::CreateTopic, id, |state| {
            if state.topics.contains_key(id) {
                return Err(ChannelError::TopicExists(id.to_string()));
            }
            let topic = Topic {
                id: id.to_string(),
                partitions: partitions.max(1),
                metadata,
                storage_nodes: Vec::new(),
                retention_days: None,
            };
            let mut permissions = BTreeMap::new();
            permissions.insert(identity, Capability::ALL.into_iter().collect());
            state.topics.insert(
                id.to_string(),
                TopicState {
                    topic: topic.clone(),
                    permissions,
                    records: Vec::new(),
                },
            );
            debug!(topic = id, partitions, "Topic created");
            Ok(topic)
        })
    }

    async fn get_topic(&self, id: &str) -> ChannelResult<Option<Topic>> {
        self.run(SubstrateOp::GetTopic, id, |state| {
            Ok(state.topics.get(id).map(|t| t.topic.clone()))
        })
    }

    async fn delete_topic(&self, id: &str) -> ChannelResult<()> {
        self.run(SubstrateOp::DeleteTopic, id, |state| {
            state.require(id, &self.identity, Capability::Delete, SubstrateOp::DeleteTopic)?;
            state.topics.remove(id);
            state.subscriptions.retain(|s| s.handle.topic != id);
            debug!(topic = id, "Topic deleted");
            Ok(())
        })
    }

    async fn set_permissions(
        &self,
        topic_id: &str,
        assignments: Vec<PermissionAssignment>,
    ) -> ChannelResult<()> {
        self.run(SubstrateOp::SetPermissions, topic_id, |state| {
            state.require(topic_id, &self.identity, Capability::Grant, SubstrateOp::SetPermissions)?;
            let topic = state.topic_mut(topic_id)?;
            for assignment in assignments {
                topic
                    .permissions
                    .insert(assignment.principal, assignment.capabilities);
            }
            Ok(())
        })
    }

    async fn has_permission(
        &self,
        topic_id: &str,
        capability: Capability,
        principal: &Principal,
        allow_public: bool,
    ) -> ChannelResult<bool> {
        self.run(SubstrateOp::HasPermission, topic_id, |state| {
            Ok(state.topic(topic_id)?.allows(principal, capability, allow_public))
        })
    }

    async fn permissions(&self, topic_id: &str) -> ChannelResult<Vec<PermissionAssignment>> {
        self.run(SubstrateOp::Permissions, topic_id, |state| {
            if state.enumeration_disabled {
                return Err(ChannelError::Unsupported(format!(
                    "permission enumeration on {}",
                    topic_id
                )));
            }
            Ok(to_assignments(&state.topic(topic_id)?.permissions))
        })
    }

    async fn publish(&self, topic_id: &str, partition: u32, payload: Value) -> ChannelResult<()> {
        let publisher = match &self.identity {
            Principal::Address(a) => Some(a.to_string()),
            Principal::Public => None,
        };

        let (record, handlers) = self.run(SubstrateOp::Publish, topic_id, |state| {
            state.require(topic_id, &self.identity, Capability::Publish, SubstrateOp::Publish)?;
            let partitions = state.topic(topic_id)?.topic.partitions;
            if partition >= partitions {
                return Err(ChannelError::InvalidOperation(format!(
                    "partition {} out of range for {} ({} partitions)",
                    partition, topic_id, partitions
                )));
            }

            let record = Record {
                topic: topic_id.to_string(),
                partition,
                timestamp: state.next_timestamp(),
                publisher: publisher.clone(),
                payload,
            };

            let topic = state.topic_mut(topic_id)?;
            if !topic.topic.storage_nodes.is_empty() {
                topic.records.push(record.clone());
            }

            let handlers: Vec<RecordHandler> = state
                .subscriptions
                .iter()
                .filter(|s| s.handle.topic == topic_id && s.handle.partition == partition)
                .map(|s| s.handler.clone())
                .collect();
            Ok((record, handlers))
        })?;

        // Deliver outside the lock; handlers may call back into the network.
        for handler in handlers {
            handler(record.clone());
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        topic_id: &str,
        partition: u32,
        handler: RecordHandler,
    ) -> ChannelResult<SubscriptionHandle> {
        let id = self.network.next_subscription.fetch_add(1, Ordering::Relaxed) + 1;
        self.run(SubstrateOp::Subscribe, topic_id, |state| {
            state.require(topic_id, &self.identity, Capability::Subscribe, SubstrateOp::Subscribe)?;
            if partition >= state.topic(topic_id)?.topic.partitions {
                return Err(ChannelError::InvalidOperation(format!(
                    "partition {} out of range for {}",
                    partition, topic_id
                )));
            }
            let handle = SubscriptionHandle {
                id,
                topic: topic_id.to_string(),
                partition,
            };
            state.subscriptions.push(SubscriptionEntry {
                handle: handle.clone(),
                handler,
            });
            Ok(handle)
        })
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> ChannelResult<()> {
        self.run(SubstrateOp::Unsubscribe, &handle.topic, |state| {
            state.subscriptions.retain(|s| s.handle.id != handle.id);
            Ok(())
        })
    }

    async fn add_to_storage(&self, topic_id: &str, node_address: &str) -> ChannelResult<()> {
        self.run(SubstrateOp::AddToStorage, topic_id, |state| {
            state.require(topic_id, &self.identity, Capability::Edit, SubstrateOp::AddToStorage)?;
            let nodes = &mut state.topic_mut(topic_id)?.topic.storage_nodes;
            if !nodes.iter().any(|n| n == node_address) {
                nodes.push(node_address.to_string());
            }
            Ok(())
        })
    }

    async fn set_retention_days(&self, topic_id: &str, days: u32) -> ChannelResult<()> {
        self.run(SubstrateOp::SetRetentionDays, topic_id, |state| {
            state.require(topic_id, &self.identity, Capability::Edit, SubstrateOp::SetRetentionDays)?;
            state.topic_mut(topic_id)?.topic.retention_days = Some(days);
            Ok(())
        })
    }

    async fn resend(&self, topic_id: &str, options: ResendOptions) -> ChannelResult<RecordStream> {
        let mut state = self.network.state.lock();
        let fault = state.enter(SubstrateOp::Resend, topic_id);
        if let Some(f) = &fault {
            if f.yield_before_fail == 0 {
                return Err(f.error(topic_id));
            }
        }

        state.require(topic_id, &self.identity, Capability::Subscribe, SubstrateOp::Resend)?;
        let partition = options.partition();
        let in_partition = state
            .topic(topic_id)?
            .records
            .iter()
            .filter(|r| r.partition == partition);

        let selected: Vec<Record> = match options {
            ResendOptions::Last { count, .. } => {
                let all: Vec<Record> = in_partition.cloned().collect();
                let skip = all.len().saturating_sub(count);
                all.into_iter().skip(skip).collect()
            }
            ResendOptions::Range { from, to, .. } => in_partition
                .filter(|r| r.timestamp >= from && r.timestamp <= to)
                .cloned()
                .collect(),
        };

        let mut items: Vec<ChannelResult<Record>> = Vec::with_capacity(selected.len() + 1);
        match fault {
            Some(f) => {
                items.extend(selected.into_iter().take(f.yield_before_fail).map(Ok));
                items.push(Err(f.error(topic_id)));
            }
            None => items.extend(selected.into_iter().map(Ok)),
        }

        Ok(futures::stream::iter(items).boxed())
    }
}
