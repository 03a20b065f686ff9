//! Recipient directory: profiles, channel addresses, opt-outs and groups.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::notification::ChannelKind;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("Failed to read directory seed {path}: {reason}")]
    Seed { path: String, reason: String },

    #[error("Invalid recipient profile: {0}")]
    InvalidProfile(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipientProfile {
    pub id: String,
    #[serde(default)]
    pub addresses: HashMap<ChannelKind, String>,
    #[serde(default)]
    pub opted_out: HashSet<ChannelKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
}

impl RecipientProfile {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            addresses: HashMap::new(),
            opted_out: HashSet::new(),
            locale: None,
        }
    }

    pub fn with_address(mut self, channel: ChannelKind, address: impl Into<String>) -> Self {
        self.addresses.insert(channel, address.into());
        self
    }

    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = Some(locale.into());
        self
    }

    pub fn opt_out(mut self, channel: ChannelKind) -> Self {
        self.opted_out.insert(channel);
        self
    }

    /// Address for `channel` unless missing, blank or opted out.
    pub fn eligible_address(&self, channel: ChannelKind) -> Option<&str> {
        if self.opted_out.contains(&channel) {
            return None;
        }
        self.addresses
            .get(&channel)
            .map(|a| a.trim())
            .filter(|a| !a.is_empty())
    }
}

/// Source of recipient profiles and group membership.
#[async_trait]
pub trait RecipientDirectory: Send + Sync {
    async fn profile(&self, recipient_id: &str) -> Option<RecipientProfile>;

    /// Member ids of `group`, `None` when the group is unknown.
    async fn group_members(&self, group: &str) -> Option<Vec<String>>;

    /// Every known recipient id, for broadcast targets.
    async fn all_recipient_ids(&self) -> Vec<String>;
}

/// Seed file layout
#[derive(Debug, Default, Deserialize)]
pub struct DirectorySeed {
    #[serde(default)]
    pub recipients: Vec<RecipientProfile>,
    #[serde(default)]
    pub groups: HashMap<String, Vec<String>>,
}

/// Directory held in memory, seeded from a file or populated by the host.
#[derive(Default)]
pub struct InMemoryDirectory {
    profiles: DashMap<String, RecipientProfile>,
    groups: DashMap<String, Vec<String>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: DirectorySeed) -> Result<Self, DirectoryError> {
        let directory = Self::new();
        for profile in seed.recipients {
            directory.upsert_profile(profile)?;
        }
        for (group, members) in seed.groups {
            directory.set_group(group, members);
        }
        Ok(directory)
    }

    pub fn load_seed_file(path: impl AsRef<Path>) -> Result<Self, DirectoryError> {
        let path = path.as_ref();
        let seed_error = |reason: String| DirectoryError::Seed {
            path: path.display().to_string(),
            reason,
        };
        let raw = std::fs::read_to_string(path).map_err(|e| seed_error(e.to_string()))?;
        let seed: DirectorySeed = serde_json::from_str(&raw).map_err(|e| seed_error(e.to_string()))?;

        let directory = Self::from_seed(seed)?;
        tracing::info!(
            path = %path.display(),
            recipients = directory.profiles.len(),
            groups = directory.groups.len(),
            "Recipient directory loaded from seed file"
        );
        Ok(directory)
    }

    pub fn upsert_profile(&self, profile: RecipientProfile) -> Result<(), DirectoryError> {
        if profile.id.trim().is_empty() {
            return Err(DirectoryError::InvalidProfile("recipient id is empty".into()));
        }
        self.profiles.insert(profile.id.clone(), profile);
        Ok(())
    }

    pub fn remove_profile(&self, recipient_id: &str) -> Option<RecipientProfile> {
        self.profiles.remove(recipient_id).map(|(_, p)| p)
    }

    pub fn set_group(&self, group: impl Into<String>, members: Vec<String>) {
        self.groups.insert(group.into(), members);
    }

    pub fn add_to_group(&self, group: &str, recipient_id: impl Into<String>) {
        let recipient_id = recipient_id.into();
        let mut members = self.groups.entry(group.to_string()).or_default();
        if !members.contains(&recipient_id) {
            members.push(recipient_id);
        }
    }

    /// Returns false when the recipient is unknown.
    pub fn set_opt_out(&self, recipient_id: &str, channel: ChannelKind, opted_out: bool) -> bool {
        match self.profiles.get_mut(recipient_id) {
            Some(mut profile) => {
                if opted_out {
                    profile.opted_out.insert(channel);
                } else {
                    profile.opted_out.remove(&channel);
                }
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

#[async_trait]
impl RecipientDirectory for InMemoryDirectory {
    async fn profile(&self, recipient_id: &str) -> Option<RecipientProfile> {
        self.profiles.get(recipient_id).map(|p| p.clone())
    }

    async fn group_members(&self, group: &str) -> Option<Vec<String>> {
        self.groups.get(group).map(|m| m.clone())
    }

    async fn all_recipient_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.profiles.iter().map(|p| p.key().clone()).collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eligible_address() {
        let profile = RecipientProfile::new("alice")
            .with_address(ChannelKind::Email, "alice@example.com")
            .with_address(ChannelKind::Sms, "   ")
            .with_address(ChannelKind::Push, "device-token")
            .opt_out(ChannelKind::Push);

        assert_eq!(
            profile.eligible_address(ChannelKind::Email),
            Some("alice@example.com")
        );
        assert_eq!(profile.eligible_address(ChannelKind::Sms), None);
        assert_eq!(profile.eligible_address(ChannelKind::Push), None);
        assert_eq!(profile.eligible_address(ChannelKind::Webhook), None);
    }

    #[tokio::test]
    async fn test_groups_and_opt_out() {
        let directory = InMemoryDirectory::new();
        directory
            .upsert_profile(RecipientProfile::new("bob").with_address(ChannelKind::Sms, "+15550100"))
            .unwrap();
        directory.add_to_group("ops", "bob");
        directory.add_to_group("ops", "bob");

        assert_eq!(directory.group_members("ops").await, Some(vec!["bob".to_string()]));
        assert!(directory.group_members("sales").await.is_none());

        assert!(directory.set_opt_out("bob", ChannelKind::Sms, true));
        let bob = directory.profile("bob").await.unwrap();
        assert_eq!(bob.eligible_address(ChannelKind::Sms), None);
        assert!(!directory.set_opt_out("carol", ChannelKind::Sms, true));
    }

    #[test]
    fn test_rejects_empty_id() {
        let directory = InMemoryDirectory::new();
        assert!(directory.upsert_profile(RecipientProfile::new(" ")).is_err());
    }

    #[tokio::test]
    async fn test_seed_parsing() {
        let seed: DirectorySeed = serde_json::from_str(
            r#"{
                "recipients": [
                    {"id": "alice", "addresses": {"email": "alice@example.com"}, "locale": "fr"},
                    {"id": "bob", "addresses": {"sms": "+15550100"}, "opted_out": ["sms"]}
                ],
                "groups": {"team": ["alice", "bob"]}
            }"#,
        )
        .unwrap();
        let directory = InMemoryDirectory::from_seed(seed).unwrap();

        assert_eq!(directory.len(), 2);
        assert_eq!(directory.all_recipient_ids().await, vec!["alice", "bob"]);
        let alice = directory.profile("alice").await.unwrap();
        assert_eq!(alice.locale.as_deref(), Some("fr"));
    }
}
