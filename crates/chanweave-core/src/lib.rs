//! Chanweave Core Library
//!
//! Chat channel orchestration over a decentralized pub/sub substrate.
//!
//! ## Overview
//!
//! A channel is a pair of topics sharing one base identifier: a durable
//! persistent topic (`-1`) carrying chat content, and an ephemeral topic
//! (`-2`) carrying presence, typing and peer-to-peer media with no storage.
//! The engine provisions both, grants access, subscribes to them with history
//! replay, and recovers when the substrate reports failures that may or may
//! not have committed.
//!
//! ## Core Principles
//!
//! - **Sequential provisioning**: topics and grants are created one call at a time
//! - **Degrade, don't fail**: a channel without its ephemeral topic still carries messages
//! - **Private by default**: hidden channels never write their name to the substrate
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use chanweave_core::{Address, ChannelEngine, ChannelType, CreateChannelRequest, EngineConfig};
//! use chanweave_core::substrate::MemoryNetwork;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let network = MemoryNetwork::new();
//!     let owner = Address::parse("0x00000000000000000000000000000000000000aa")?;
//!     let engine = ChannelEngine::connect(
//!         Arc::new(network.connect(owner.clone())),
//!         owner,
//!         EngineConfig::default(),
//!     )?;
//!
//!     let channel = engine
//!         .create_channel(&CreateChannelRequest::new("Team Chat", ChannelType::Public))
//!         .await?;
//!     engine.publish_message(&channel.persistent_id, "hello", None).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod history;
pub mod message;
pub mod naming;
pub mod permissions;
pub mod provisioner;
pub mod retry;
pub mod subscription;
pub mod substrate;
pub mod types;

// Re-exports
pub use config::{EngineConfig, RetryPolicy};
pub use context::EngineContext;
pub use engine::{ChannelEngine, ChannelEvent, DualSubscription, DualTopicHandlers};
pub use error::{ChannelError, ChannelResult};
pub use history::{HistoryPage, HistoryRecord, HistoryReplayer, HistorySubscription};
pub use message::{is_history_record, ChatRecord};
pub use permissions::{PermissionManager, PermissionRequest};
pub use provisioner::ChannelProvisioner;
pub use subscription::{PayloadHandler, SubscriptionManager};
pub use substrate::{Record, ResendOptions, Substrate, SubscriptionHandle, Topic};
pub use types::*;
