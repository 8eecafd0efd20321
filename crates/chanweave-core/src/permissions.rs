//! Permission management for channel topics
//!
//! Grants, revocations and capability queries against the substrate. All
//! caller-supplied addresses are lowercased and validated before the first
//! network call; a bad address fails with `InvalidPrincipal` and costs no
//! retries. Requested assignments are batched into one `set_permissions`
//! call per topic.

use tracing::{debug, info};

use crate::context::EngineContext;
use crate::error::{ChannelError, ChannelResult};
use crate::types::{
    Address, Capability, CapabilitySet, CapabilitySummary, PermissionAssignment, Principal,
};

/// Assignments to apply to one topic in a single call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionRequest {
    /// Capability set for the public principal, if it should change
    pub public: Option<CapabilitySet>,
    /// Raw member addresses and their capability sets
    pub members: Vec<(String, CapabilitySet)>,
}

impl PermissionRequest {
    pub fn public(capabilities: CapabilitySet) -> Self {
        Self {
            public: Some(capabilities),
            members: Vec::new(),
        }
    }

    /// Give every listed member the same capability set.
    pub fn members<S: AsRef<str>>(members: &[S], capabilities: &CapabilitySet) -> Self {
        Self {
            public: None,
            members: members
                .iter()
                .map(|m| (m.as_ref().to_string(), capabilities.clone()))
                .collect(),
        }
    }

    /// Validate addresses and flatten into substrate assignments.
    pub fn into_assignments(self) -> ChannelResult<Vec<PermissionAssignment>> {
        let mut assignments = Vec::with_capacity(self.members.len() + 1);
        if let Some(capabilities) = self.public {
            assignments.push(PermissionAssignment::public(capabilities));
        }
        for (raw, capabilities) in self.members {
            assignments.push(PermissionAssignment::address(Address::parse(&raw)?, capabilities));
        }
        Ok(assignments)
    }
}

/// Grants, revokes and queries capabilities on topics.
#[derive(Debug, Clone)]
pub struct PermissionManager {
    ctx: EngineContext,
}

impl PermissionManager {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Apply every requested assignment to `topic_id` in one substrate call.
    pub async fn set_permissions(
        &self,
        topic_id: &str,
        request: PermissionRequest,
    ) -> ChannelResult<()> {
        let assignments = request.into_assignments()?;
        self.apply(topic_id, assignments).await
    }

    /// Apply already-validated assignments.
    pub(crate) async fn apply(
        &self,
        topic_id: &str,
        assignments: Vec<PermissionAssignment>,
    ) -> ChannelResult<()> {
        if assignments.is_empty() {
            return Ok(());
        }

        debug!(
            topic = topic_id,
            count = assignments.len(),
            "Setting permissions"
        );
        let substrate = &self.ctx.substrate;
        self.ctx
            .retry("set_permissions", topic_id, |_| {
                substrate.set_permissions(topic_id, assignments.clone())
            })
            .await
    }

    pub async fn grant_public(
        &self,
        topic_id: &str,
        capabilities: CapabilitySet,
    ) -> ChannelResult<()> {
        self.set_permissions(topic_id, PermissionRequest::public(capabilities))
            .await
    }

    pub async fn grant_to_addresses<S: AsRef<str>>(
        &self,
        topic_id: &str,
        addresses: &[S],
        capabilities: &CapabilitySet,
    ) -> ChannelResult<()> {
        self.set_permissions(topic_id, PermissionRequest::members(addresses, capabilities))
            .await
    }

    /// Revoke everything from the listed addresses.
    ///
    /// Each principal keeps an (empty) assignment rather than being removed.
    pub async fn revoke<S: AsRef<str>>(&self, topic_id: &str, principals: &[S]) -> ChannelResult<()> {
        let assignments = Address::parse_all(principals)?
            .into_iter()
            .map(|a| PermissionAssignment::revoke(Principal::Address(a)))
            .collect();
        self.apply(topic_id, assignments).await?;
        info!(topic = topic_id, count = principals.len(), "Permissions revoked");
        Ok(())
    }

    /// Revoke everything from the public principal.
    pub async fn revoke_public(&self, topic_id: &str) -> ChannelResult<()> {
        self.apply(topic_id, vec![PermissionAssignment::revoke(Principal::Public)])
            .await
    }

    /// Add or remove the administrative capabilities (grant, edit, delete)
    /// for `principal`, keeping whatever else it already holds.
    pub async fn update_admin_capability(
        &self,
        topic_id: &str,
        principal: &str,
        grant: bool,
    ) -> ChannelResult<()> {
        let address = Address::parse(principal)?;
        let target = Principal::Address(address.clone());

        let mut capabilities = CapabilitySet::new();
        for capability in Capability::ALL {
            if self
                .ctx
                .substrate
                .has_permission(topic_id, capability, &target, false)
                .await?
            {
                capabilities.insert(capability);
            }
        }

        for capability in Capability::ADMIN {
            if grant {
                capabilities.insert(capability);
            } else {
                capabilities.remove(&capability);
            }
        }

        self.apply(
            topic_id,
            vec![PermissionAssignment::address(address, capabilities)],
        )
        .await?;
        info!(topic = topic_id, principal = %target, grant, "Admin capability updated");
        Ok(())
    }

    /// Current assignments on a topic.
    ///
    /// Substrates that cannot enumerate yield an empty list; callers then
    /// fall back to [`check_capabilities`](Self::check_capabilities).
    pub async fn query(&self, topic_id: &str) -> ChannelResult<Vec<PermissionAssignment>> {
        match self.ctx.substrate.permissions(topic_id).await {
            Ok(assignments) => Ok(assignments),
            Err(ChannelError::Unsupported(reason)) => {
                debug!(topic = topic_id, %reason, "Permission enumeration unsupported");
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Probe all five capabilities of `principal` concurrently.
    pub async fn check_capabilities(
        &self,
        topic_id: &str,
        principal: &str,
    ) -> ChannelResult<CapabilitySummary> {
        let target = Principal::Address(Address::parse(principal)?);
        let substrate = &self.ctx.substrate;

        let (publish, subscribe, grant, edit, delete) = tokio::try_join!(
            substrate.has_permission(topic_id, Capability::Publish, &target, true),
            substrate.has_permission(topic_id, Capability::Subscribe, &target, true),
            substrate.has_permission(topic_id, Capability::Grant, &target, false),
            substrate.has_permission(topic_id, Capability::Edit, &target, false),
            substrate.has_permission(topic_id, Capability::Delete, &target, false),
        )?;

        Ok(CapabilitySummary::from_probes(
            publish, subscribe, grant, edit, delete,
        ))
    }
}
