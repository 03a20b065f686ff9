use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;

use crate::notification::{ChannelKind, DeliveryMode, NotificationTarget};

use super::RecipientDirectory;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("No eligible recipients")]
    NoEligibleRecipients,
}

/// One concrete (recipient, channel, address) delivery destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRecipient {
    pub recipient_id: String,
    pub channel: ChannelKind,
    pub address: String,
    pub locale: Option<String>,
}

/// Expands logical targets into per-channel addresses.
#[derive(Clone)]
pub struct RecipientResolver {
    directory: Arc<dyn RecipientDirectory>,
}

impl RecipientResolver {
    pub fn new(directory: Arc<dyn RecipientDirectory>) -> Self {
        Self { directory }
    }

    /// Resolve `target` for the requested channels (in preference order).
    ///
    /// Unknown recipients are skipped; an empty result is
    /// `NoEligibleRecipients`.
    pub async fn resolve(
        &self,
        target: &NotificationTarget,
        channels: &[ChannelKind],
        mode: DeliveryMode,
    ) -> Result<Vec<ResolvedRecipient>, ResolveError> {
        target
            .validate()
            .map_err(|e| ResolveError::InvalidTarget(e.to_string()))?;

        let ids = match target {
            NotificationTarget::User(id) => vec![id.clone()],
            NotificationTarget::Users(ids) => ids.clone(),
            NotificationTarget::Group(group) => match self.directory.group_members(group).await {
                Some(members) => members,
                None => {
                    tracing::debug!(group = %group, "Unknown group resolves to no recipients");
                    Vec::new()
                }
            },
            NotificationTarget::Broadcast => self.directory.all_recipient_ids().await,
        };

        let mut seen = HashSet::new();
        let mut resolved = Vec::new();
        for id in ids {
            if !seen.insert(id.clone()) {
                continue;
            }
            let Some(profile) = self.directory.profile(&id).await else {
                tracing::debug!(recipient_id = %id, "Skipping unknown recipient");
                continue;
            };

            for channel in channels {
                let Some(address) = profile.eligible_address(*channel) else {
                    continue;
                };
                resolved.push(ResolvedRecipient {
                    recipient_id: profile.id.clone(),
                    channel: *channel,
                    address: address.to_string(),
                    locale: profile.locale.clone(),
                });
                if mode == DeliveryMode::FirstAvailable {
                    break;
                }
            }
        }

        if resolved.is_empty() {
            return Err(ResolveError::NoEligibleRecipients);
        }
        Ok(resolved)
    }
}
