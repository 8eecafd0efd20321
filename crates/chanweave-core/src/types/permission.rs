//! Permission types
//!
//! Capabilities are attached to topics per principal. A principal is either
//! the public (anyone) or a specific substrate address.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ChannelError, ChannelResult};

/// Length of the hex part of a substrate address.
const ADDRESS_HEX_LEN: usize = 40;

/// A validated, lowercase substrate address (`0x` + 40 hex digits).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    /// Validate and normalise an address.
    ///
    /// Fails with [`ChannelError::InvalidPrincipal`] for anything that is not
    /// `0x` followed by 40 hex digits; case is ignored and the stored form is
    /// lowercase.
    pub fn parse(raw: &str) -> ChannelResult<Self> {
        let normalized = raw.trim().to_ascii_lowercase();
        let hex_part = normalized
            .strip_prefix("0x")
            .ok_or_else(|| ChannelError::InvalidPrincipal(raw.to_string()))?;

        if hex_part.len() != ADDRESS_HEX_LEN || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ChannelError::InvalidPrincipal(raw.to_string()));
        }

        Ok(Self(normalized))
    }

    /// Validate a batch of addresses, failing on the first bad one.
    pub fn parse_all<S: AsRef<str>>(raw: &[S]) -> ChannelResult<Vec<Self>> {
        raw.iter().map(|a| Self::parse(a.as_ref())).collect()
    }

    /// Lowercase string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Address {
    type Error = ChannelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who a permission assignment applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Principal {
    /// Anyone, including unauthenticated readers
    Public,
    /// One specific address
    Address(Address),
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Principal::Public => f.write_str("public"),
            Principal::Address(a) => write!(f, "{}", a),
        }
    }
}

/// A single capability on a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// Publish records
    Publish,
    /// Subscribe to and resend records
    Subscribe,
    /// Change permissions (administer)
    Grant,
    /// Edit topic metadata and storage
    Edit,
    /// Delete the topic
    Delete,
}

impl Capability {
    /// Every capability, in probe order.
    pub const ALL: [Capability; 5] = [
        Capability::Publish,
        Capability::Subscribe,
        Capability::Grant,
        Capability::Edit,
        Capability::Delete,
    ];

    /// The administrative capabilities whose conjunction means ownership.
    pub const ADMIN: [Capability; 3] = [Capability::Grant, Capability::Edit, Capability::Delete];
}

/// Ordered, duplicate-free capability set.
pub type CapabilitySet = BTreeSet<Capability>;

/// Subscribe + publish.
pub fn read_write() -> CapabilitySet {
    [Capability::Subscribe, Capability::Publish].into_iter().collect()
}

/// Subscribe only.
pub fn read_only() -> CapabilitySet {
    [Capability::Subscribe].into_iter().collect()
}

/// A (principal, capability-set) pair attached to a topic.
///
/// An empty set is a revocation, not a removal of the assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionAssignment {
    /// Who the capabilities apply to
    pub principal: Principal,
    /// The full capability set for that principal
    pub capabilities: CapabilitySet,
}

impl PermissionAssignment {
    /// Assignment for the public principal.
    pub fn public(capabilities: CapabilitySet) -> Self {
        Self {
            principal: Principal::Public,
            capabilities,
        }
    }

    /// Assignment for a specific address.
    pub fn address(address: Address, capabilities: CapabilitySet) -> Self {
        Self {
            principal: Principal::Address(address),
            capabilities,
        }
    }

    /// Revocation of everything for a principal.
    pub fn revoke(principal: Principal) -> Self {
        Self {
            principal,
            capabilities: CapabilitySet::new(),
        }
    }
}

/// Structured result of probing a principal's capabilities on a topic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilitySummary {
    pub can_publish: bool,
    pub can_subscribe: bool,
    pub can_administer: bool,
    pub can_edit: bool,
    pub can_delete: bool,
    /// Derived: administer, edit and delete all held
    pub is_owner: bool,
}

impl CapabilitySummary {
    /// Build a summary from the five probe results; `is_owner` is derived.
    pub fn from_probes(
        can_publish: bool,
        can_subscribe: bool,
        can_administer: bool,
        can_edit: bool,
        can_delete: bool,
    ) -> Self {
        Self {
            can_publish,
            can_subscribe,
            can_administer,
            can_edit,
            can_delete,
            is_owner: can_administer && can_edit && can_delete,
        }
    }
}
