//! Core types for Chanweave

pub mod permission;

use serde::{Deserialize, Serialize};

use crate::naming::{self, TopicKind};
pub use permission::{
    Address, Capability, CapabilitySet, CapabilitySummary, PermissionAssignment, Principal,
};

/// Persistent topic partition carrying chat content.
pub const MESSAGES_PARTITION: u32 = 0;

/// Ephemeral topic partition carrying presence/typing records.
pub const CONTROL_PARTITION: u32 = 0;

/// Ephemeral topic partition carrying peer-to-peer media chunks.
pub const MEDIA_PARTITION: u32 = 1;

/// Access model of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    /// Anyone may read and write
    Public,
    /// Anyone may connect; payloads are encrypted with a shared secret
    Password,
    /// Only listed members may read and write
    Restricted,
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelType::Public => write!(f, "public"),
            ChannelType::Password => write!(f, "password"),
            ChannelType::Restricted => write!(f, "restricted"),
        }
    }
}

/// Whether a channel's descriptive metadata is published.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exposure {
    /// Name and description are written to topic metadata
    #[default]
    Visible,
    /// Name and description are never written anywhere on the substrate
    Hidden,
}

/// Metadata document written when a topic is created.
///
/// For hidden channels `name` and `description` are `None` and are skipped
/// during serialization, so they never reach the substrate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicMetadata {
    #[serde(rename = "type")]
    pub channel_type: ChannelType,
    pub exposure: Exposure,
    pub read_only: bool,
    /// Unix timestamp (ms) of channel creation
    pub created_at: i64,
    /// Lowercase address of the creator
    pub created_by: String,
    /// Which of the two topics this is
    pub role: TopicRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Serializable mirror of [`TopicKind`] used in metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicRole {
    Persistent,
    Ephemeral,
}

impl From<TopicKind> for TopicRole {
    fn from(kind: TopicKind) -> Self {
        match kind {
            TopicKind::Persistent => TopicRole::Persistent,
            TopicKind::Ephemeral => TopicRole::Ephemeral,
        }
    }
}

/// Parameters for creating a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateChannelRequest {
    /// Display name; stays local when the channel is hidden
    pub name: String,
    /// Optional description; also withheld for hidden channels
    pub description: Option<String>,
    pub channel_type: ChannelType,
    /// Members granted access on restricted channels (raw, validated at create)
    pub members: Vec<String>,
    pub exposure: Exposure,
    /// Public principals get subscribe only
    pub read_only: bool,
}

impl CreateChannelRequest {
    /// Visible, writable channel of the given type with no members.
    pub fn new(name: impl Into<String>, channel_type: ChannelType) -> Self {
        Self {
            name: name.into(),
            description: None,
            channel_type,
            members: Vec::new(),
            exposure: Exposure::Visible,
            read_only: false,
        }
    }

    pub fn with_members<S: Into<String>>(mut self, members: impl IntoIterator<Item = S>) -> Self {
        self.members = members.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn hidden(mut self) -> Self {
        self.exposure = Exposure::Hidden;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Metadata for one of the channel's topics.
    pub fn metadata(&self, kind: TopicKind, created_by: &Address, created_at: i64) -> TopicMetadata {
        let visible = self.exposure == Exposure::Visible;
        TopicMetadata {
            channel_type: self.channel_type,
            exposure: self.exposure,
            read_only: self.read_only,
            created_at,
            created_by: created_by.to_string(),
            role: kind.into(),
            name: visible.then(|| self.name.clone()),
            description: if visible {
                self.description.clone()
            } else {
                None
            },
        }
    }
}

/// Position in the provisioning state machine, from the creator's view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProvisionState {
    Uncreated,
    PersistentCreating,
    PersistentCreated,
    EphemeralCreating,
    BothCreated,
    PermissionsSet,
    /// Persistent topic usable, ephemeral topic could not be created
    DegradedPersistentOnly,
}

impl ProvisionState {
    /// Terminal states `create_channel` can return with.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProvisionState::PermissionsSet | ProvisionState::DegradedPersistentOnly
        )
    }
}

impl std::fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProvisionState::Uncreated => "UNCREATED",
            ProvisionState::PersistentCreating => "PERSISTENT_CREATING",
            ProvisionState::PersistentCreated => "PERSISTENT_CREATED",
            ProvisionState::EphemeralCreating => "EPHEMERAL_CREATING",
            ProvisionState::BothCreated => "BOTH_CREATED",
            ProvisionState::PermissionsSet => "PERMISSIONS_SET",
            ProvisionState::DegradedPersistentOnly => "DEGRADED_PERSISTENT_ONLY",
        };
        f.write_str(s)
    }
}

/// A logical conversation owning one persistent and one ephemeral topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    /// Owner-namespaced base identifier, without kind suffix
    pub base_id: String,
    /// Display name, `None` when withheld
    pub name: Option<String>,
    pub channel_type: ChannelType,
    pub exposure: Exposure,
    pub read_only: bool,
    /// Members of a restricted channel
    pub members: Vec<Address>,
    /// Unix timestamp (ms)
    pub created_at: i64,
}

impl Channel {
    pub fn persistent_id(&self) -> String {
        naming::topic_for(&self.base_id, TopicKind::Persistent)
    }

    pub fn ephemeral_id(&self) -> String {
        naming::topic_for(&self.base_id, TopicKind::Ephemeral)
    }
}

/// Outcome of provisioning a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedChannel {
    pub channel: Channel,
    pub persistent_id: String,
    /// `None` when the channel is degraded
    pub ephemeral_id: Option<String>,
    pub degraded: bool,
    pub state: ProvisionState,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creator() -> Address {
        Address::parse("0x00000000000000000000000000000000000000aa").unwrap()
    }

    #[test]
    fn test_visible_metadata_carries_name() {
        let req = CreateChannelRequest::new("Team Chat", ChannelType::Public)
            .with_description("daily standup");
        let meta = req.metadata(TopicKind::Persistent, &creator(), 10);
        assert_eq!(meta.name.as_deref(), Some("Team Chat"));
        assert_eq!(meta.description.as_deref(), Some("daily standup"));
        assert_eq!(meta.role, TopicRole::Persistent);
    }

    #[test]
    fn test_hidden_metadata_never_serializes_name() {
        let req = CreateChannelRequest::new("Secret Plans", ChannelType::Password)
            .with_description("do not leak")
            .hidden();
        let meta = req.metadata(TopicKind::Ephemeral, &creator(), 10);
        let json = serde_json::to_string(&meta).unwrap();

        assert!(meta.name.is_none());
        assert!(!json.contains("Secret Plans"));
        assert!(!json.contains("do not leak"));
        assert!(!json.contains("\"name\""));
        assert!(json.contains("\"type\":\"password\""));
    }

    #[test]
    fn test_channel_topic_ids() {
        let channel = Channel {
            base_id: "0xaa/room-abc".to_string(),
            name: None,
            channel_type: ChannelType::Public,
            exposure: Exposure::Visible,
            read_only: false,
            members: vec![],
            created_at: 0,
        };
        assert_eq!(channel.persistent_id(), "0xaa/room-abc-1");
        assert_eq!(channel.ephemeral_id(), "0xaa/room-abc-2");
    }

    #[test]
    fn test_state_display() {
        assert_eq!(
            ProvisionState::DegradedPersistentOnly.to_string(),
            "DEGRADED_PERSISTENT_ONLY"
        );
        assert!(ProvisionState::PermissionsSet.is_terminal());
        assert!(!ProvisionState::BothCreated.is_terminal());
    }
}
