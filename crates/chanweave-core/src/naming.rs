//! Topic naming
//!
//! A channel owns two topics whose identifiers differ only by a fixed suffix:
//! `-1` for the persistent (durable message) topic and `-2` for the ephemeral
//! (presence/media) topic. The sibling is always derived, never stored.
//!
//! ```text
//! 0x71c7…3a9f/team-chat-5e1d08aa-1   persistent, partition 0 = MESSAGES
//! 0x71c7…3a9f/team-chat-5e1d08aa-2   ephemeral,  partition 0 = CONTROL
//!                                                 partition 1 = MEDIA
//! ```

use tracing::warn;

use crate::error::ChannelError;

/// Suffix of the persistent topic identifier.
pub const PERSISTENT_SUFFIX: &str = "-1";

/// Suffix of the ephemeral topic identifier.
pub const EPHEMERAL_SUFFIX: &str = "-2";

/// Fallback path segment when sanitizing leaves nothing.
pub const DEFAULT_PATH_SEGMENT: &str = "channel";

/// Maximum length of a sanitized path segment.
pub const MAX_PATH_SEGMENT_LEN: usize = 50;

/// Which of a channel's two topics an identifier names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKind {
    /// Durable single-partition message topic (`-1`)
    Persistent,
    /// Non-durable control/media topic (`-2`)
    Ephemeral,
}

impl TopicKind {
    /// Classify an identifier by its suffix.
    pub fn of(topic_id: &str) -> Option<Self> {
        if topic_id.ends_with(PERSISTENT_SUFFIX) {
            Some(TopicKind::Persistent)
        } else if topic_id.ends_with(EPHEMERAL_SUFFIX) {
            Some(TopicKind::Ephemeral)
        } else {
            None
        }
    }

    /// Number of partitions a topic of this kind is created with.
    pub fn partition_count(&self) -> u32 {
        match self {
            TopicKind::Persistent => 1,
            TopicKind::Ephemeral => 2,
        }
    }

    fn suffix(&self) -> &'static str {
        match self {
            TopicKind::Persistent => PERSISTENT_SUFFIX,
            TopicKind::Ephemeral => EPHEMERAL_SUFFIX,
        }
    }
}

/// True if the identifier names a persistent topic.
pub fn is_persistent(topic_id: &str) -> bool {
    TopicKind::of(topic_id) == Some(TopicKind::Persistent)
}

/// True if the identifier names an ephemeral topic.
pub fn is_ephemeral(topic_id: &str) -> bool {
    TopicKind::of(topic_id) == Some(TopicKind::Ephemeral)
}

/// Strip the kind suffix, returning the channel's base identifier.
///
/// Identifiers without a recognised suffix are returned unchanged.
pub fn base_id(topic_id: &str) -> &str {
    topic_id
        .strip_suffix(PERSISTENT_SUFFIX)
        .or_else(|| topic_id.strip_suffix(EPHEMERAL_SUFFIX))
        .unwrap_or(topic_id)
}

/// Identifier of the given kind for a base identifier.
pub fn topic_for(base: &str, kind: TopicKind) -> String {
    format!("{}{}", base, kind.suffix())
}

/// Ephemeral sibling of a persistent topic identifier.
///
/// An identifier already naming the ephemeral topic is returned as is. One
/// without any suffix is treated as a base identifier (logged as a warning).
pub fn derive_ephemeral(persistent_id: &str) -> String {
    derive(persistent_id, TopicKind::Ephemeral)
}

/// Persistent sibling of an ephemeral topic identifier.
pub fn derive_persistent(ephemeral_id: &str) -> String {
    derive(ephemeral_id, TopicKind::Persistent)
}

/// `None`-propagating form of [`derive_ephemeral`].
pub fn derive_ephemeral_opt(persistent_id: Option<&str>) -> Option<String> {
    persistent_id.map(derive_ephemeral)
}

/// `None`-propagating form of [`derive_persistent`].
pub fn derive_persistent_opt(ephemeral_id: Option<&str>) -> Option<String> {
    ephemeral_id.map(derive_persistent)
}

fn derive(topic_id: &str, kind: TopicKind) -> String {
    if TopicKind::of(topic_id).is_none() {
        warn!(
            error = %ChannelError::InvalidIdentifierFormat(topic_id.to_string()),
            "Topic id has no kind suffix, treating it as a base id"
        );
    }
    topic_for(base_id(topic_id), kind)
}

/// Turn a user-supplied name into a substrate-safe path segment.
///
/// Whitespace runs become one hyphen, everything outside `[A-Za-z0-9_-]` is
/// dropped, hyphen runs collapse, and leading/trailing hyphens are trimmed.
/// The result is at most [`MAX_PATH_SEGMENT_LEN`] characters and never
/// empty. Applying it twice gives the same result as applying it once.
pub fn sanitize_path(name: &str) -> String {
    let mut out = String::with_capacity(name.len().min(MAX_PATH_SEGMENT_LEN * 2));
    let mut last_was_hyphen = false;

    for c in name.chars() {
        let mapped = if c.is_whitespace() {
            '-'
        } else if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
            c
        } else {
            continue;
        };

        if mapped == '-' {
            if last_was_hyphen {
                continue;
            }
            last_was_hyphen = true;
        } else {
            last_was_hyphen = false;
        }
        out.push(mapped);
    }

    // Output is ASCII, so byte truncation is char truncation.
    let trimmed = out.trim_matches('-');
    let truncated = &trimmed[..trimmed.len().min(MAX_PATH_SEGMENT_LEN)];
    let result = truncated.trim_end_matches('-');

    if result.is_empty() {
        DEFAULT_PATH_SEGMENT.to_string()
    } else {
        result.to_string()
    }
}
