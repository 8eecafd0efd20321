//! Edge case and boundary condition tests
//!
//! These tests verify the system handles unusual inputs,
//! error conditions, and boundary values correctly.

use std::sync::Arc;
use std::time::Duration;

use chanweave_core::naming::{
    base_id, derive_ephemeral, derive_ephemeral_opt, derive_persistent, derive_persistent_opt,
    sanitize_path, DEFAULT_PATH_SEGMENT, MAX_PATH_SEGMENT_LEN,
};
use chanweave_core::substrate::{Fault, MemoryNetwork, SubstrateOp};
use chanweave_core::types::permission::read_write;
use chanweave_core::{
    Address, ChannelEngine, ChannelError, ChannelEvent, ChannelType, CreateChannelRequest,
    EngineConfig, EngineContext, Principal, RetryPolicy,
};

const OWNER: &str = "0x00000000000000000000000000000000000000aa";
const BOB: &str = "0x00000000000000000000000000000000000000bb";

fn engine(net: &MemoryNetwork, config: EngineConfig) -> ChannelEngine {
    let owner = Address::parse(OWNER).unwrap();
    ChannelEngine::connect(Arc::new(net.connect(owner.clone())), owner, config).unwrap()
}

// ============================================================================
// Naming Edge Cases
// ============================================================================

#[test]
fn test_sanitize_degenerate_inputs() {
    for name in ["", "   ", "\t\n", "---", "!!!", "日本語", "- - -"] {
        assert_eq!(sanitize_path(name), DEFAULT_PATH_SEGMENT, "input {:?}", name);
    }
}

#[test]
fn test_sanitize_mixed_input() {
    assert_eq!(sanitize_path("  Team   Chat  "), "Team-Chat");
    assert_eq!(sanitize_path("a--b__c"), "a-b__c");
    assert_eq!(sanitize_path("café ☕ talk"), "caf-talk");
    assert_eq!(sanitize_path("-leading and trailing-"), "leading-and-trailing");
}

#[test]
fn test_sanitize_truncation_never_ends_in_hyphen() {
    let name = format!("{} tail", "x".repeat(MAX_PATH_SEGMENT_LEN - 1));
    let result = sanitize_path(&name);
    assert!(result.len() <= MAX_PATH_SEGMENT_LEN);
    assert!(!result.ends_with('-'));
    assert_eq!(result, "x".repeat(MAX_PATH_SEGMENT_LEN - 1));

    let long = "a".repeat(500);
    assert_eq!(sanitize_path(&long).len(), MAX_PATH_SEGMENT_LEN);
}

#[test]
fn test_derive_unsuffixed_id_treated_as_base() {
    assert_eq!(derive_ephemeral("0xaa/room"), "0xaa/room-2");
    assert_eq!(derive_persistent("0xaa/room"), "0xaa/room-1");
    assert_eq!(base_id("0xaa/room"), "0xaa/room");
}

#[test]
fn test_derive_only_touches_final_suffix() {
    assert_eq!(derive_ephemeral("0xaa/room-1-1"), "0xaa/room-1-2");
    assert_eq!(derive_persistent("0xaa/v-2-2"), "0xaa/v-2-1");
}

#[test]
fn test_derive_none_propagates() {
    assert_eq!(derive_ephemeral_opt(None), None);
    assert_eq!(derive_persistent_opt(None), None);
    assert_eq!(
        derive_ephemeral_opt(Some("0xaa/r-1")).as_deref(),
        Some("0xaa/r-2")
    );
}

// ============================================================================
// Principal Edge Cases
// ============================================================================

#[test]
fn test_address_validation() {
    let upper = "0x00000000000000000000000000000000000000AB";
    assert_eq!(Address::parse(upper).unwrap().as_str(), upper.to_lowercase());

    for bad in [
        "",
        "0x",
        "00000000000000000000000000000000000000aa",
        "0x0000000000000000000000000000000000000aa",
        "0x00000000000000000000000000000000000000aaa",
        "0x00000000000000000000000000000000000000zz",
        "public",
    ] {
        assert!(
            matches!(Address::parse(bad), Err(ChannelError::InvalidPrincipal(_))),
            "accepted {:?}",
            bad
        );
    }
}

// ============================================================================
// Permission Edge Cases
// ============================================================================

#[tokio::test]
async fn test_grant_twice_is_idempotent_on_both_topics() {
    let net = MemoryNetwork::new();
    let engine = engine(&net, EngineConfig::default());
    let created = engine
        .create_channel(&CreateChannelRequest::new("room", ChannelType::Restricted))
        .await
        .unwrap();
    let ephemeral = created.ephemeral_id.clone().unwrap();

    engine
        .grant_permissions_to_addresses(&created.persistent_id, Some(&ephemeral), &[BOB])
        .await
        .unwrap();
    let before = (
        net.assignments(&created.persistent_id),
        net.assignments(&ephemeral),
    );

    engine
        .grant_permissions_to_addresses(&created.persistent_id, Some(&ephemeral), &[BOB])
        .await
        .unwrap();
    let after = (
        net.assignments(&created.persistent_id),
        net.assignments(&ephemeral),
    );

    assert_eq!(before, after);
    let bob = Principal::Address(Address::parse(BOB).unwrap());
    let entry = after.0.iter().find(|a| a.principal == bob).unwrap();
    assert_eq!(entry.capabilities, read_write());
}

#[tokio::test(start_paused = true)]
async fn test_degraded_grant_touches_persistent_only() {
    let net = MemoryNetwork::new();
    let engine = engine(
        &net,
        EngineConfig::default().with_retry(RetryPolicy::new(2, Duration::from_millis(10))),
    );
    net.inject_fault(Fault::always(SubstrateOp::CreateTopic).on_suffix("-2"));
    let created = engine
        .create_channel(&CreateChannelRequest::new("room", ChannelType::Restricted))
        .await
        .unwrap();
    assert!(created.degraded);

    let mut events = engine.events();
    let calls_before = net.call_count(SubstrateOp::SetPermissions);
    engine
        .grant_permissions_to_addresses(&created.persistent_id, None, &[BOB])
        .await
        .unwrap();

    assert_eq!(net.call_count(SubstrateOp::SetPermissions), calls_before + 1);
    assert_eq!(
        events.recv().await.unwrap(),
        ChannelEvent::PermissionsChanged {
            persistent_id: created.persistent_id.clone(),
            principals: vec![Address::parse(BOB).unwrap()],
            granted: true,
        }
    );
}

#[tokio::test]
async fn test_grant_validates_before_first_topic() {
    let net = MemoryNetwork::new();
    let engine = engine(&net, EngineConfig::default());
    let created = engine
        .create_channel(&CreateChannelRequest::new("room", ChannelType::Restricted))
        .await
        .unwrap();
    let calls_before = net.call_count(SubstrateOp::SetPermissions);

    let err = engine
        .grant_permissions_to_addresses(
            &created.persistent_id,
            created.ephemeral_id.as_deref(),
            &[BOB, "bogus"],
        )
        .await
        .unwrap_err();

    assert!(matches!(err, ChannelError::InvalidPrincipal(_)));
    assert_eq!(net.call_count(SubstrateOp::SetPermissions), calls_before);
}

#[tokio::test]
async fn test_revoke_then_capabilities() {
    let net = MemoryNetwork::new();
    let engine = engine(&net, EngineConfig::default());
    let created = engine
        .create_channel(
            &CreateChannelRequest::new("room", ChannelType::Restricted).with_members([BOB]),
        )
        .await
        .unwrap();

    let summary = engine
        .check_capabilities(&created.persistent_id, BOB)
        .await
        .unwrap();
    assert!(summary.can_publish && summary.can_subscribe && !summary.is_owner);

    engine
        .revoke_permissions_from_addresses(
            &created.persistent_id,
            created.ephemeral_id.as_deref(),
            &[BOB],
        )
        .await
        .unwrap();

    for topic in [&created.persistent_id, created.ephemeral_id.as_ref().unwrap()] {
        let summary = engine.check_capabilities(topic, BOB).await.unwrap();
        assert!(!summary.can_publish && !summary.can_subscribe);
    }
}

#[tokio::test]
async fn test_capabilities_of_missing_topic() {
    let net = MemoryNetwork::new();
    let engine = engine(&net, EngineConfig::default());
    let err = engine
        .check_capabilities("0xaa/none-1", BOB)
        .await
        .unwrap_err();
    assert!(matches!(err, ChannelError::TopicNotFound(_)));
}

#[tokio::test]
async fn test_admin_promotion_makes_owner() {
    let net = MemoryNetwork::new();
    let engine = engine(&net, EngineConfig::default());
    let created = engine
        .create_channel(&CreateChannelRequest::new("room", ChannelType::Public))
        .await
        .unwrap();

    engine
        .permissions()
        .update_admin_capability(&created.persistent_id, BOB, true)
        .await
        .unwrap();
    let summary = engine
        .check_capabilities(&created.persistent_id, BOB)
        .await
        .unwrap();
    assert!(summary.is_owner && summary.can_administer);
    assert!(summary.can_edit && summary.can_delete);
}

// ============================================================================
// Retry Edge Cases
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_retry_schedule_is_linear() {
    let net = MemoryNetwork::new();
    let engine = engine(
        &net,
        EngineConfig::default().with_retry(RetryPolicy::new(4, Duration::from_millis(100))),
    );
    let created = engine
        .create_channel(&CreateChannelRequest::new("room", ChannelType::Restricted))
        .await
        .unwrap();
    net.inject_fault(Fault::times(SubstrateOp::SetPermissions, 3));

    let start = tokio::time::Instant::now();
    engine
        .permissions()
        .grant_to_addresses(&created.persistent_id, &[BOB], &read_write())
        .await
        .unwrap();

    // 100 + 200 + 300 ms between the four attempts.
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(600));
    assert!(elapsed < Duration::from_millis(610));
}

#[tokio::test(start_paused = true)]
async fn test_retry_exhaustion_reports_context() {
    let net = MemoryNetwork::new();
    let engine = engine(
        &net,
        EngineConfig::default().with_retry(RetryPolicy::new(3, Duration::from_millis(100))),
    );
    let created = engine
        .create_channel(&CreateChannelRequest::new("room", ChannelType::Public))
        .await
        .unwrap();
    net.inject_fault(Fault::always(SubstrateOp::SetPermissions));

    let err = engine
        .permissions()
        .grant_public(&created.persistent_id, read_write())
        .await
        .unwrap_err();

    let message = err.to_string();
    assert!(message.contains("set_permissions"));
    assert!(message.contains(&created.persistent_id));
    assert!(message.contains("3 attempts"));
    assert!(matches!(err.root(), ChannelError::SubstrateUnavailable(_)));
}

// ============================================================================
// Configuration Edge Cases
// ============================================================================

#[test]
fn test_zero_attempts_rejected_by_context() {
    let net = MemoryNetwork::new();
    let owner = Address::parse(OWNER).unwrap();
    let config = EngineConfig::from_json_str(r#"{"retry": {"max_attempts": 0}}"#);

    let result =
        config.and_then(|c| EngineContext::new(Arc::new(net.connect(owner.clone())), owner, c));
    assert!(matches!(result, Err(ChannelError::Config(_))));
}

#[tokio::test]
async fn test_zero_history_makes_no_resend() {
    let net = MemoryNetwork::new();
    let engine = engine(&net, EngineConfig::default());
    let created = engine
        .create_channel(&CreateChannelRequest::new("room", ChannelType::Public))
        .await
        .unwrap();

    assert!(engine
        .fetch_recent_history(&created.persistent_id, 0, None)
        .await
        .is_empty());
    assert_eq!(net.call_count(SubstrateOp::Resend), 0);
}
