//! Notification templates.
//!
//! This module provides:
//! - Template definitions with per-(channel, locale) variants
//! - In-memory template storage with CRUD operations
//! - Rendering of `{{ field }}` placeholders against a request payload
//!
//! # Example
//!
//! ```ignore
//! let store = TemplateStore::new();
//! store.create(Template::new("order_shipped", "Order shipped", "en")
//!     .with_variant(TemplateVariant::new(ChannelKind::Email, "en", "Order {{order.id}} shipped")
//!         .with_subject("Your order is on its way")))?;
//!
//! let content = store.render("order_shipped", ChannelKind::Email, "en-GB", &json!({
//!     "order": {"id": "ORD-123"}
//! }))?;
//! ```

mod render;

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::notification::ChannelKind;

pub use render::{placeholders, render_text, RenderedAttachment, RenderedContent};

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("Template not found: {0}")]
    NotFound(String),

    #[error("Template already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid template ID: {0}")]
    InvalidId(String),

    #[error("Invalid template: {0}")]
    InvalidTemplate(String),

    #[error("Missing payload field: {0}")]
    MissingPayloadField(String),

    #[error("Template {template_id} has no {channel} variant")]
    NoVariant {
        template_id: String,
        channel: ChannelKind,
    },

    #[error("Malformed placeholder: {0}")]
    Malformed(String),

    #[error("Failed to read template seed: {0}")]
    Seed(String),
}

pub type TemplateResult<T> = Result<T, TemplateError>;

/// Content for one channel in one locale
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateVariant {
    pub channel: ChannelKind,
    pub locale: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub body: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentTemplate>,
}

impl TemplateVariant {
    pub fn new(channel: ChannelKind, locale: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            channel,
            locale: locale.into(),
            subject: None,
            body: body.into(),
            attachments: Vec::new(),
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_attachment(mut self, attachment: AttachmentTemplate) -> Self {
        self.attachments.push(attachment);
        self
    }

    fn texts(&self) -> impl Iterator<Item = &str> {
        self.subject
            .as_deref()
            .into_iter()
            .chain(std::iter::once(self.body.as_str()))
            .chain(
                self.attachments
                    .iter()
                    .flat_map(|a| [a.filename.as_str(), a.content.as_str()]),
            )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentTemplate {
    pub filename: String,
    pub content_type: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    /// Unique template identifier (alphanumeric, dash, underscore)
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Locale used when no variant matches the requested one
    pub default_locale: String,
    pub variants: Vec<TemplateVariant>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Template {
    pub fn new(id: impl Into<String>, name: impl Into<String>, default_locale: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            default_locale: default_locale.into(),
            variants: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_variant(mut self, variant: TemplateVariant) -> Self {
        self.variants.push(variant);
        self
    }

    pub fn validate(&self) -> TemplateResult<()> {
        if self.id.is_empty() || self.id.len() > 64 {
            return Err(TemplateError::InvalidId(
                "ID must be 1-64 characters".to_string(),
            ));
        }

        if !self
            .id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(TemplateError::InvalidId(
                "ID must contain only alphanumeric, dash, or underscore".to_string(),
            ));
        }

        if self.name.is_empty() || self.name.len() > 256 {
            return Err(TemplateError::InvalidTemplate(
                "Name must be 1-256 characters".to_string(),
            ));
        }

        if self.default_locale.trim().is_empty() {
            return Err(TemplateError::InvalidTemplate(
                "Default locale must not be empty".to_string(),
            ));
        }

        if self.variants.is_empty() {
            return Err(TemplateError::InvalidTemplate(
                "At least one variant is required".to_string(),
            ));
        }

        for (i, variant) in self.variants.iter().enumerate() {
            if variant.locale.trim().is_empty() {
                return Err(TemplateError::InvalidTemplate(format!(
                    "Variant {} has an empty locale",
                    i
                )));
            }
            let duplicate = self.variants[..i].iter().any(|other| {
                other.channel == variant.channel && other.locale.eq_ignore_ascii_case(&variant.locale)
            });
            if duplicate {
                return Err(TemplateError::InvalidTemplate(format!(
                    "Duplicate {} variant for locale {}",
                    variant.channel, variant.locale
                )));
            }
            for text in variant.texts() {
                placeholders(text)?;
            }
        }

        Ok(())
    }

    /// Pick the variant for `channel`, falling back from the exact locale to
    /// its language subtag and then to the default locale.
    pub fn variant_for(&self, channel: ChannelKind, locale: &str) -> Option<&TemplateVariant> {
        let for_channel = || self.variants.iter().filter(move |v| v.channel == channel);
        let find = |wanted: &str| for_channel().find(|v| v.locale.eq_ignore_ascii_case(wanted));

        find(locale)
            .or_else(|| language_subtag(locale).and_then(find))
            .or_else(|| find(&self.default_locale))
            .or_else(|| language_subtag(&self.default_locale).and_then(find))
    }

    /// Channels this template can render.
    pub fn channels(&self) -> Vec<ChannelKind> {
        let mut channels: Vec<ChannelKind> = self.variants.iter().map(|v| v.channel).collect();
        channels.sort();
        channels.dedup();
        channels
    }
}

/// `pt-BR` -> `pt`; `None` when the locale has no region part.
fn language_subtag(locale: &str) -> Option<&str> {
    locale
        .split(['-', '_'])
        .next()
        .filter(|lang| lang.len() < locale.len() && !lang.is_empty())
}

/// Request to create a new template
#[derive(Debug, Deserialize)]
pub struct CreateTemplateRequest {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub default_locale: String,
    pub variants: Vec<TemplateVariant>,
}

impl From<CreateTemplateRequest> for Template {
    fn from(req: CreateTemplateRequest) -> Self {
        let now = Utc::now();
        Template {
            id: req.id,
            name: req.name,
            description: req.description,
            default_locale: req.default_locale,
            variants: req.variants,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Request to update an existing template
#[derive(Debug, Default, Deserialize)]
pub struct UpdateTemplateRequest {
    pub name: Option<String>,
    /// Use null to clear
    pub description: Option<Option<String>>,
    pub default_locale: Option<String>,
    /// Replaces the whole variant list
    pub variants: Option<Vec<TemplateVariant>>,
}

/// In-memory template storage
pub struct TemplateStore {
    templates: DashMap<String, Template>,
}

impl Default for TemplateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateStore {
    pub fn new() -> Self {
        Self {
            templates: DashMap::new(),
        }
    }

    pub fn create(&self, template: Template) -> TemplateResult<Template> {
        template.validate()?;

        match self.templates.entry(template.id.clone()) {
            Entry::Occupied(_) => Err(TemplateError::AlreadyExists(template.id)),
            Entry::Vacant(slot) => {
                slot.insert(template.clone());
                Ok(template)
            }
        }
    }

    pub fn get(&self, id: &str) -> TemplateResult<Template> {
        self.templates
            .get(id)
            .map(|t| t.clone())
            .ok_or_else(|| TemplateError::NotFound(id.to_string()))
    }

    pub fn list(&self) -> Vec<Template> {
        let mut templates: Vec<Template> = self
            .templates
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        templates.sort_by(|a, b| a.id.cmp(&b.id));
        templates
    }

    pub fn update(&self, id: &str, updates: UpdateTemplateRequest) -> TemplateResult<Template> {
        let mut entry = self
            .templates
            .get_mut(id)
            .ok_or_else(|| TemplateError::NotFound(id.to_string()))?;

        let mut template = entry.clone();
        if let Some(name) = updates.name {
            template.name = name;
        }
        if let Some(description) = updates.description {
            template.description = description;
        }
        if let Some(default_locale) = updates.default_locale {
            template.default_locale = default_locale;
        }
        if let Some(variants) = updates.variants {
            template.variants = variants;
        }
        template.updated_at = Utc::now();
        template.validate()?;

        *entry = template.clone();
        Ok(template)
    }

    pub fn delete(&self, id: &str) -> TemplateResult<()> {
        self.templates
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| TemplateError::NotFound(id.to_string()))
    }

    pub fn exists(&self, id: &str) -> bool {
        self.templates.contains_key(id)
    }

    pub fn count(&self) -> usize {
        self.templates.len()
    }

    /// Render the `channel` variant of template `id` for `locale`.
    pub fn render(
        &self,
        id: &str,
        channel: ChannelKind,
        locale: &str,
        payload: &serde_json::Value,
    ) -> TemplateResult<RenderedContent> {
        let template = self
            .templates
            .get(id)
            .ok_or_else(|| TemplateError::NotFound(id.to_string()))?;

        let variant = template
            .variant_for(channel, locale)
            .ok_or_else(|| TemplateError::NoVariant {
                template_id: id.to_string(),
                channel,
            })?;

        RenderedContent::render(variant, payload)
    }

    /// Load templates from a JSON array file, replacing same-id entries.
    pub fn load_seed_file(&self, path: impl AsRef<Path>) -> TemplateResult<usize> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| TemplateError::Seed(format!("{}: {}", path.display(), e)))?;
        let templates: Vec<Template> = serde_json::from_str(&raw)
            .map_err(|e| TemplateError::Seed(format!("{}: {}", path.display(), e)))?;

        let count = templates.len();
        for template in templates {
            template.validate()?;
            self.templates.insert(template.id.clone(), template);
        }

        tracing::info!(path = %path.display(), count = count, "Templates loaded from seed file");
        Ok(count)
    }
}

pub fn create_template_store() -> Arc<TemplateStore> {
    Arc::new(TemplateStore::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn shipped() -> Template {
        Template::new("order_shipped", "Order shipped", "en")
            .with_variant(
                TemplateVariant::new(ChannelKind::Email, "en", "Order {{order.id}} is on its way")
                    .with_subject("Shipped: {{ order.id }}"),
            )
            .with_variant(TemplateVariant::new(
                ChannelKind::Email,
                "pt",
                "Pedido {{order.id}} enviado",
            ))
            .with_variant(TemplateVariant::new(ChannelKind::Sms, "en", "Order {{order.id}} shipped"))
    }

    #[test]
    fn test_validation_rejects_bad_ids() {
        let mut template = shipped();
        template.id = "".into();
        assert!(matches!(template.validate(), Err(TemplateError::InvalidId(_))));

        template.id = "invalid/id".into();
        assert!(matches!(template.validate(), Err(TemplateError::InvalidId(_))));
    }

    #[test]
    fn test_validation_requires_variants() {
        let template = Template::new("empty", "Empty", "en");
        assert!(matches!(
            template.validate(),
            Err(TemplateError::InvalidTemplate(_))
        ));
    }

    #[test]
    fn test_validation_rejects_duplicate_variant() {
        let template = shipped().with_variant(TemplateVariant::new(ChannelKind::Sms, "EN", "dup"));
        assert!(matches!(
            template.validate(),
            Err(TemplateError::InvalidTemplate(_))
        ));
    }

    #[test]
    fn test_validation_rejects_unclosed_placeholder() {
        let template = Template::new("broken", "Broken", "en")
            .with_variant(TemplateVariant::new(ChannelKind::Push, "en", "Hi {{name"));
        assert!(matches!(template.validate(), Err(TemplateError::Malformed(_))));
    }

    #[test]
    fn test_locale_fallback() {
        let template = shipped();
        let variant = template.variant_for(ChannelKind::Email, "pt-BR").unwrap();
        assert_eq!(variant.locale, "pt");

        let variant = template.variant_for(ChannelKind::Email, "de").unwrap();
        assert_eq!(variant.locale, "en");

        let variant = template.variant_for(ChannelKind::Sms, "pt").unwrap();
        assert_eq!(variant.locale, "en");

        assert!(template.variant_for(ChannelKind::Webhook, "en").is_none());
    }

    #[test]
    fn test_store_crud() {
        let store = TemplateStore::new();
        store.create(shipped()).unwrap();
        assert!(store.exists("order_shipped"));
        assert_eq!(store.count(), 1);

        assert!(matches!(
            store.create(shipped()),
            Err(TemplateError::AlreadyExists(_))
        ));

        let updated = store
            .update(
                "order_shipped",
                UpdateTemplateRequest {
                    name: Some("Shipping update".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.name, "Shipping update");
        assert_eq!(store.get("order_shipped").unwrap().name, "Shipping update");

        store.delete("order_shipped").unwrap();
        assert!(!store.exists("order_shipped"));
        assert!(matches!(
            store.delete("order_shipped"),
            Err(TemplateError::NotFound(_))
        ));
    }

    #[test]
    fn test_invalid_update_leaves_template_untouched() {
        let store = TemplateStore::new();
        store.create(shipped()).unwrap();

        let result = store.update(
            "order_shipped",
            UpdateTemplateRequest {
                variants: Some(vec![]),
                ..Default::default()
            },
        );
        assert!(result.is_err());
        assert_eq!(store.get("order_shipped").unwrap().variants.len(), 3);
    }

    #[test]
    fn test_store_render() {
        let store = TemplateStore::new();
        store.create(shipped()).unwrap();

        let content = store
            .render(
                "order_shipped",
                ChannelKind::Email,
                "en-US",
                &json!({"order": {"id": "ORD-9"}}),
            )
            .unwrap();
        assert_eq!(content.subject.as_deref(), Some("Shipped: ORD-9"));
        assert_eq!(content.body, "Order ORD-9 is on its way");

        let err = store
            .render("order_shipped", ChannelKind::Push, "en", &json!({}))
            .unwrap_err();
        assert!(matches!(err, TemplateError::NoVariant { .. }));

        let err = store
            .render("missing", ChannelKind::Email, "en", &json!({}))
            .unwrap_err();
        assert!(matches!(err, TemplateError::NotFound(_)));
    }

    #[test]
    fn test_load_seed_file() {
        let path = std::env::temp_dir().join(format!("templates-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            serde_json::to_string(&vec![shipped()]).unwrap(),
        )
        .unwrap();

        let store = TemplateStore::new();
        assert_eq!(store.load_seed_file(&path).unwrap(), 1);
        assert!(store.exists("order_shipped"));
        std::fs::remove_file(&path).ok();

        assert!(matches!(
            store.load_seed_file("/nonexistent/templates.json"),
            Err(TemplateError::Seed(_))
        ));
    }
}
