use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SubmitError;

/// Longest accepted notification id (idempotency key)
pub const MAX_NOTIFICATION_ID_LEN: usize = 128;

/// Caller-supplied notification id, doubling as the idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotificationId(String);

impl NotificationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NotificationId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for NotificationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl AsRef<str> for NotificationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Delivery channel kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Email,
    Sms,
    Push,
    Webhook,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 4] = [
        ChannelKind::Email,
        ChannelKind::Sms,
        ChannelKind::Push,
        ChannelKind::Webhook,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Email => "email",
            ChannelKind::Sms => "sms",
            ChannelKind::Push => "push",
            ChannelKind::Webhook => "webhook",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "email" => Ok(ChannelKind::Email),
            "sms" => Ok(ChannelKind::Sms),
            "push" => Ok(ChannelKind::Push),
            "webhook" => Ok(ChannelKind::Webhook),
            other => Err(format!("unknown channel kind: {}", other)),
        }
    }
}

/// Logical recipient of a notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "target")]
pub enum NotificationTarget {
    /// A single recipient id
    User(String),
    /// Several recipient ids
    Users(Vec<String>),
    /// Every member of a named group
    Group(String),
    /// Every recipient in the directory
    Broadcast,
}

impl NotificationTarget {
    pub fn kind(&self) -> &'static str {
        match self {
            NotificationTarget::User(_) => "user",
            NotificationTarget::Users(_) => "users",
            NotificationTarget::Group(_) => "group",
            NotificationTarget::Broadcast => "broadcast",
        }
    }

    /// Structural checks that do not need the directory.
    pub fn validate(&self) -> Result<(), SubmitError> {
        match self {
            NotificationTarget::User(id) if id.trim().is_empty() => {
                Err(SubmitError::InvalidTarget("user id is empty".into()))
            }
            NotificationTarget::Users(ids) if ids.is_empty() => {
                Err(SubmitError::InvalidTarget("user list is empty".into()))
            }
            NotificationTarget::Users(ids) if ids.iter().any(|id| id.trim().is_empty()) => {
                Err(SubmitError::InvalidTarget("user list contains an empty id".into()))
            }
            NotificationTarget::Group(name) if name.trim().is_empty() => {
                Err(SubmitError::InvalidTarget("group name is empty".into()))
            }
            _ => Ok(()),
        }
    }
}

/// How requested channels are turned into jobs per recipient
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// One job for every requested channel the recipient is eligible for
    #[default]
    AllChannels,
    /// Only the first eligible channel in preference order
    FirstAvailable,
}

/// A request to deliver one notification. Immutable once accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub id: NotificationId,
    pub template_id: String,
    #[serde(default = "empty_payload")]
    pub payload: serde_json::Value,
    pub target: NotificationTarget,
    /// Ordered preference list
    pub channels: Vec<ChannelKind>,
    /// Overrides the recipient's locale when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(default)]
    pub delivery_mode: DeliveryMode,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn empty_payload() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl NotificationRequest {
    pub fn builder(id: impl Into<String>, template_id: impl Into<String>) -> NotificationRequestBuilder {
        NotificationRequestBuilder::new(id, template_id)
    }

    /// Validate the request shape and collapse duplicate channels, keeping
    /// the first occurrence of each.
    pub fn normalized(mut self) -> Result<Self, SubmitError> {
        let id_len = self.id.as_str().chars().count();
        if id_len == 0 || id_len > MAX_NOTIFICATION_ID_LEN {
            return Err(SubmitError::InvalidRequest(format!(
                "id must be 1-{} characters",
                MAX_NOTIFICATION_ID_LEN
            )));
        }
        if self.template_id.trim().is_empty() {
            return Err(SubmitError::InvalidRequest("template_id is empty".into()));
        }
        if self.channels.is_empty() {
            return Err(SubmitError::InvalidRequest(
                "at least one channel must be requested".into(),
            ));
        }
        match self.payload {
            serde_json::Value::Object(_) => {}
            serde_json::Value::Null => self.payload = empty_payload(),
            _ => {
                return Err(SubmitError::InvalidRequest(
                    "payload must be a JSON object".into(),
                ))
            }
        }
        if matches!(self.locale.as_deref(), Some(l) if l.trim().is_empty()) {
            self.locale = None;
        }
        self.target.validate()?;

        let mut seen = Vec::with_capacity(self.channels.len());
        self.channels.retain(|c| {
            if seen.contains(c) {
                false
            } else {
                seen.push(*c);
                true
            }
        });

        Ok(self)
    }
}

/// Builder for notification requests
#[derive(Debug, Clone)]
pub struct NotificationRequestBuilder {
    id: String,
    template_id: String,
    payload: serde_json::Value,
    target: NotificationTarget,
    channels: Vec<ChannelKind>,
    locale: Option<String>,
    delivery_mode: DeliveryMode,
}

impl NotificationRequestBuilder {
    pub fn new(id: impl Into<String>, template_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            template_id: template_id.into(),
            payload: empty_payload(),
            target: NotificationTarget::Broadcast,
            channels: Vec::new(),
            locale: None,
            delivery_mode: DeliveryMode::default(),
        }
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Set the payload from a serializable value
    pub fn payload_from<T: Serialize>(mut self, payload: &T) -> Result<Self, serde_json::Error> {
        self.payload = serde_json::to_value(payload)?;
        Ok(self)
    }

    pub fn target(mut self, target: NotificationTarget) -> Self {
        self.target = target;
        self
    }

    pub fn to_user(self, user_id: impl Into<String>) -> Self {
        self.target(NotificationTarget::User(user_id.into()))
    }

    pub fn to_users<I, S>(self, user_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target(NotificationTarget::Users(
            user_ids.into_iter().map(Into::into).collect(),
        ))
    }

    pub fn to_group(self, group: impl Into<String>) -> Self {
        self.target(NotificationTarget::Group(group.into()))
    }

    pub fn channel(mut self, channel: ChannelKind) -> Self {
        self.channels.push(channel);
        self
    }

    pub fn channels(mut self, channels: impl IntoIterator<Item = ChannelKind>) -> Self {
        self.channels.extend(channels);
        self
    }

    pub fn locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = Some(locale.into());
        self
    }

    pub fn delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    pub fn build(self) -> NotificationRequest {
        NotificationRequest {
            id: NotificationId(self.id),
            template_id: self.template_id,
            payload: self.payload,
            target: self.target,
            channels: self.channels,
            locale: self.locale,
            delivery_mode: self.delivery_mode,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builder_defaults() {
        let request = NotificationRequest::builder("n-1", "welcome")
            .to_user("alice")
            .channel(ChannelKind::Email)
            .build();

        assert_eq!(request.id.as_str(), "n-1");
        assert_eq!(request.target, NotificationTarget::User("alice".into()));
        assert_eq!(request.delivery_mode, DeliveryMode::AllChannels);
        assert!(request.payload.as_object().unwrap().is_empty());
    }

    #[test]
    fn test_normalized_collapses_duplicate_channels() {
        let request = NotificationRequest::builder("n-1", "welcome")
            .to_user("alice")
            .channels([ChannelKind::Sms, ChannelKind::Email, ChannelKind::Sms])
            .build()
            .normalized()
            .unwrap();

        assert_eq!(request.channels, vec![ChannelKind::Sms, ChannelKind::Email]);
    }

    #[test]
    fn test_normalized_rejects_bad_shapes() {
        let no_channels = NotificationRequest::builder("n-1", "welcome")
            .to_user("alice")
            .build();
        assert!(matches!(
            no_channels.normalized(),
            Err(SubmitError::InvalidRequest(_))
        ));

        let long_id = NotificationRequest::builder("x".repeat(129), "welcome")
            .to_user("alice")
            .channel(ChannelKind::Push)
            .build();
        assert!(matches!(
            long_id.normalized(),
            Err(SubmitError::InvalidRequest(_))
        ));

        let array_payload = NotificationRequest::builder("n-1", "welcome")
            .to_user("alice")
            .channel(ChannelKind::Push)
            .payload(json!([1, 2]))
            .build();
        assert!(matches!(
            array_payload.normalized(),
            Err(SubmitError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_normalized_rejects_empty_targets() {
        let empty_users = NotificationRequest::builder("n-1", "welcome")
            .to_users(Vec::<String>::new())
            .channel(ChannelKind::Email)
            .build();
        assert!(matches!(
            empty_users.normalized(),
            Err(SubmitError::InvalidTarget(_))
        ));

        let empty_group = NotificationRequest::builder("n-1", "welcome")
            .to_group("  ")
            .channel(ChannelKind::Email)
            .build();
        assert!(matches!(
            empty_group.normalized(),
            Err(SubmitError::InvalidTarget(_))
        ));
    }

    #[test]
    fn test_request_deserializes_with_defaults() {
        let request: NotificationRequest = serde_json::from_value(json!({
            "id": "order-42",
            "template_id": "order_shipped",
            "target": {"type": "Group", "target": "ops"},
            "channels": ["email", "webhook"]
        }))
        .unwrap();

        assert_eq!(request.target, NotificationTarget::Group("ops".into()));
        assert_eq!(request.channels, vec![ChannelKind::Email, ChannelKind::Webhook]);
        assert!(request.payload.is_object());
        assert!(request.locale.is_none());
    }

    #[test]
    fn test_channel_kind_parse() {
        assert_eq!("SMS".parse::<ChannelKind>().unwrap(), ChannelKind::Sms);
        assert!("fax".parse::<ChannelKind>().is_err());
        assert_eq!(ChannelKind::Webhook.to_string(), "webhook");
    }
}
