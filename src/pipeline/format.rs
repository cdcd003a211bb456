//! Item preprocessing and delivery formatting.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::error::PipelineError;
use crate::pipeline::types::Item;

/// Appended to bodies cut at the character cap.
pub const TRUNCATION_MARKER: &str = "\n\n[Content truncated]";

/// `{{ name }}` placeholders in delivery templates.
static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").unwrap());

/// Reject blank items and cap over-long bodies.
pub fn validate(item: &Item, max_chars: usize) -> Result<Item, PipelineError> {
    if item.is_blank() {
        return Err(PipelineError::InvalidItem(format!(
            "item {} has neither subject nor body",
            item.id
        )));
    }

    Ok(match truncate_body(&item.body, max_chars) {
        Some(body) => item.with_body(body),
        None => item.clone(),
    })
}

/// Cut `body` to `max_chars` characters plus the marker, or `None` if it fits.
pub fn truncate_body(body: &str, max_chars: usize) -> Option<String> {
    let (cut, _) = body.char_indices().nth(max_chars)?;
    let mut truncated = String::with_capacity(cut + TRUNCATION_MARKER.len());
    truncated.push_str(&body[..cut]);
    truncated.push_str(TRUNCATION_MARKER);
    Some(truncated)
}

/// Display template that merges item metadata with the processed text.
#[derive(Debug, Clone)]
pub struct DeliveryTemplate {
    template: String,
}

impl DeliveryTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    /// Fill placeholders from `delivery_metadata(item)` plus `summary`.
    /// Unknown placeholders render as empty strings.
    pub fn render(&self, item: &Item, summary: &str) -> String {
        let mut values = delivery_metadata(item);
        values.insert("summary".into(), summary.to_string());

        PLACEHOLDER
            .replace_all(&self.template, |caps: &Captures| {
                values.get(&caps[1]).cloned().unwrap_or_default()
            })
            .into_owned()
    }
}

/// Metadata handed to the sink: the item's own metadata plus id and subject.
pub fn delivery_metadata(item: &Item) -> BTreeMap<String, String> {
    let mut meta = item.metadata.clone();
    meta.insert("id".into(), item.id.clone());
    meta.insert("subject".into(), item.subject.clone());
    meta
}
