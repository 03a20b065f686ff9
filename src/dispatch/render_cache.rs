use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;

use crate::notification::{ChannelKind, NotificationId};
use crate::template::RenderedContent;

pub(crate) type RenderKey = (ChannelKind, String);

/// Content rendered at intake, keyed by notification then (channel, locale).
///
/// Entries live until the notification is terminal. A miss (after a restart
/// or eviction) is re-rendered from the template store.
#[derive(Default)]
pub struct RenderCache {
    entries: DashMap<NotificationId, HashMap<RenderKey, Arc<RenderedContent>>>,
}

impl RenderCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(
        &self,
        id: &NotificationId,
        channel: ChannelKind,
        locale: &str,
    ) -> Option<Arc<RenderedContent>> {
        self.entries
            .get(id)
            .and_then(|rendered| rendered.get(&(channel, locale.to_string())).cloned())
    }

    pub(crate) fn insert_all(&self, id: NotificationId, rendered: HashMap<RenderKey, Arc<RenderedContent>>) {
        if !rendered.is_empty() {
            self.entries.insert(id, rendered);
        }
    }

    pub fn insert(
        &self,
        id: &NotificationId,
        channel: ChannelKind,
        locale: &str,
        content: Arc<RenderedContent>,
    ) {
        self.entries
            .entry(id.clone())
            .or_default()
            .insert((channel, locale.to_string()), content);
    }

    pub fn evict(&self, id: &NotificationId) {
        self.entries.remove(id);
    }

    /// Number of notifications with cached content
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_channel_and_locale() {
        let cache = RenderCache::new();
        let id = NotificationId::from("n-1");
        cache.insert(&id, ChannelKind::Email, "en", Arc::new(RenderedContent::text("hi")));

        assert_eq!(
            cache.get(&id, ChannelKind::Email, "en").map(|c| c.body.clone()),
            Some("hi".to_string())
        );
        assert!(cache.get(&id, ChannelKind::Email, "fr").is_none());
        assert!(cache.get(&id, ChannelKind::Sms, "en").is_none());

        cache.evict(&id);
        assert!(cache.is_empty());
    }
}
