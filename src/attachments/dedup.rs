//! Stable attachment signatures and per-list deduplication.

use std::collections::HashSet;

use serde_json::{Map, Value};

use super::resolve::{identity, raw_url, type_name, Media};
use crate::models::Attachment;

/// Deduplication key for a raw attachment record.
///
/// First applicable rule wins: platform identity, sticker identity, URL,
/// then the canonical JSON of the whole record.
pub fn signature(raw: &Value) -> String {
    let type_name = type_name(raw);
    if let Some((owner_id, id, access_key)) = identity(raw) {
        return format!(
            "{type_name}:{owner_id}_{id}_{}",
            access_key.unwrap_or_default()
        );
    }
    let mut url = None;
    if let Media::Sticker(sticker) = Media::from_raw(raw) {
        if let Some(sticker_id) = sticker.sticker_id {
            let product_id = sticker.product_id.map(|id| id.to_string()).unwrap_or_default();
            return format!("sticker:{sticker_id}:{product_id}");
        }
        url = sticker.image_url;
    }
    if let Some(url) = url.or_else(|| raw_url(raw)) {
        return format!("{type_name}:{url}");
    }
    canonical_json(raw)
}

/// JSON text with object keys sorted at every level.
pub fn canonical_json(value: &Value) -> String {
    canonicalize(value).to_string()
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Keep the first attachment for every signature, preserving order.
pub fn dedup(attachments: Vec<Attachment>) -> Vec<Attachment> {
    let mut seen = HashSet::new();
    attachments
        .into_iter()
        .filter(|attachment| seen.insert(attachment.signature.clone()))
        .collect()
}
