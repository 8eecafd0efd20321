//! Pub/sub substrate seam
//!
//! The engine never talks to a network directly: every topic, permission,
//! storage and delivery operation goes through the [`Substrate`] trait.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Substrate (trait object in EngineContext)                      │
//! │  ├── topics:      create_topic / get_topic / delete_topic       │
//! │  ├── permissions: set_permissions / has_permission / permissions│
//! │  ├── storage:     add_to_storage / set_retention_days           │
//! │  └── delivery:    publish / subscribe / unsubscribe / resend    │
//! │                                                                 │
//! │  MemoryNetwork (in-process implementation)                      │
//! │  └── connect(address) -> MemorySubstrate acting as `address`    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod memory;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ChannelError, ChannelResult};
use crate::types::{Capability, PermissionAssignment, Principal};

pub use memory::{Fault, MemoryNetwork, MemorySubstrate, SubstrateOp};

/// A topic as reported by the substrate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    pub id: String,
    pub partitions: u32,
    /// Metadata document written at creation
    pub metadata: Value,
    /// Storage nodes currently persisting this topic
    pub storage_nodes: Vec<String>,
    pub retention_days: Option<u32>,
}

/// One record delivered by the substrate, live or replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub topic: String,
    pub partition: u32,
    /// Unix timestamp (ms) assigned by the substrate
    pub timestamp: i64,
    /// Publisher identity, when the substrate exposes it
    pub publisher: Option<String>,
    /// Raw payload: a JSON value, or an opaque string for encrypted channels
    pub payload: Value,
}

/// Which stored records to replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResendOptions {
    /// The newest `count` records of a partition
    Last { count: usize, partition: u32 },
    /// Records with `from <= timestamp <= to`
    Range { partition: u32, from: i64, to: i64 },
}

impl ResendOptions {
    pub fn partition(&self) -> u32 {
        match self {
            ResendOptions::Last { partition, .. } | ResendOptions::Range { partition, .. } => {
                *partition
            }
        }
    }
}

/// Callback receiving live records for one (topic, partition).
pub type RecordHandler = Arc<dyn Fn(Record) + Send + Sync>;

/// Substrate-side identity of a live subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub id: u64,
    pub topic: String,
    pub partition: u32,
}

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub_{}@{}#{}", self.id, self.topic, self.partition)
    }
}

/// Replayed records, oldest first. An `Err` item ends the stream.
pub type RecordStream = BoxStream<'static, ChannelResult<Record>>;

/// Operations consumed from the decentralized pub/sub network.
#[async_trait]
pub trait Substrate: Send + Sync {
    /// Create a topic. Fails with `TopicExists` if the id is taken.
    async fn create_topic(&self, id: &str, metadata: Value, partitions: u32) -> ChannelResult<Topic>;

    /// Look up a topic; `Ok(None)` when it does not exist.
    async fn get_topic(&self, id: &str) -> ChannelResult<Option<Topic>>;

    async fn delete_topic(&self, id: &str) -> ChannelResult<()>;

    /// Replace the capability set of every listed principal in one call.
    async fn set_permissions(
        &self,
        topic_id: &str,
        assignments: Vec<PermissionAssignment>,
    ) -> ChannelResult<()>;

    /// Point check of one capability. With `allow_public`, a public grant counts.
    async fn has_permission(
        &self,
        topic_id: &str,
        capability: Capability,
        principal: &Principal,
        allow_public: bool,
    ) -> ChannelResult<bool>;

    /// Enumerate assignments. Substrates that cannot enumerate keep the default.
    async fn permissions(&self, topic_id: &str) -> ChannelResult<Vec<PermissionAssignment>> {
        Err(ChannelError::Unsupported(format!(
            "permission enumeration on {}",
            topic_id
        )))
    }

    async fn publish(&self, topic_id: &str, partition: u32, payload: Value) -> ChannelResult<()>;

    async fn subscribe(
        &self,
        topic_id: &str,
        partition: u32,
        handler: RecordHandler,
    ) -> ChannelResult<SubscriptionHandle>;

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> ChannelResult<()>;

    async fn add_to_storage(&self, topic_id: &str, node_address: &str) -> ChannelResult<()>;

    async fn set_retention_days(&self, topic_id: &str, days: u32) -> ChannelResult<()>;

    /// Replay stored records matching `options`, oldest first.
    async fn resend(&self, topic_id: &str, options: ResendOptions) -> ChannelResult<RecordStream>;
}
