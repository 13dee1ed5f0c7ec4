//! Member identity lookup
//!
//! Member ids are opaque strings owned by the surrounding chat system.
//! Profiles are only used to label peers in user-facing output; session
//! logic never depends on them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Display information for a member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberProfile {
    /// Opaque member id
    pub id: String,

    /// Human-readable name
    pub display_name: String,

    /// Avatar image URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// Resolves member ids to profiles
#[async_trait]
pub trait MemberDirectory: Send + Sync {
    async fn resolve(&self, id: &str) -> Option<MemberProfile>;
}

/// In-memory directory
#[derive(Debug, Clone, Default)]
pub struct StaticMemberDirectory {
    profiles: HashMap<String, MemberProfile>,
}

impl StaticMemberDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a profile
    pub fn insert(&mut self, profile: MemberProfile) {
        self.profiles.insert(profile.id.clone(), profile);
    }

    /// Builder-style variant of [`insert`](Self::insert) for a bare display name
    pub fn with_member(mut self, id: &str, display_name: &str) -> Self {
        self.insert(MemberProfile {
            id: id.to_string(),
            display_name: display_name.to_string(),
            avatar_url: None,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

#[async_trait]
impl MemberDirectory for StaticMemberDirectory {
    async fn resolve(&self, id: &str) -> Option<MemberProfile> {
        self.profiles.get(id).cloned()
    }
}

/// Display label for `id`, falling back to the raw id
///
/// ```
/// use securedrop::identity::{label_for, StaticMemberDirectory};
///
/// # tokio_test::block_on(async {
/// let directory = StaticMemberDirectory::new().with_member("u-7", "Grace");
/// assert_eq!(label_for(&directory, "u-7").await, "Grace");
/// assert_eq!(label_for(&directory, "u-8").await, "u-8");
/// # });
/// ```
pub async fn label_for(directory: &dyn MemberDirectory, id: &str) -> String {
    match directory.resolve(id).await {
        Some(profile) => profile.display_name,
        None => id.to_string(),
    }
}
