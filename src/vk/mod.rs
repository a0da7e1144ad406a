//! VK API client.

pub mod longpoll;
pub mod scraper;

use std::time::Duration;

use reqwest::blocking::Client as BlockingHttpClient;
use serde_json::Value;
use tracing::debug;

use crate::attachments::resolve::VideoLookup;
use crate::error::VkError;

pub const API_BASE_URL: &str = "https://api.vk.com/method";

/// Peer ids at or above this value are group chats.
pub const CHAT_PEER_OFFSET: i64 = 2_000_000_000;

/// Name lookups used to label stored events.
pub trait Directory: Send + Sync {
    fn user_name(&self, user_id: i64) -> Result<Option<String>, VkError>;
    fn group_name(&self, group_id: i64) -> Result<Option<String>, VkError>;
    fn chat_title(&self, peer_id: i64) -> Result<Option<String>, VkError>;
}

pub struct VkClient {
    http: BlockingHttpClient,
    token: String,
    version: String,
    base_url: String,
}

impl VkClient {
    pub fn new(token: String, version: String, timeout: Duration) -> Result<Self, VkError> {
        let http = BlockingHttpClient::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            token,
            version,
            base_url: API_BASE_URL.to_string(),
        })
    }

    /// Call an API method and return its `response` field.
    pub fn method(&self, name: &str, params: &[(&str, String)]) -> Result<Value, VkError> {
        let mut form: Vec<(&str, String)> = params.to_vec();
        form.push(("access_token", self.token.clone()));
        form.push(("v", self.version.clone()));

        let response = self
            .http
            .post(format!("{}/{}", self.base_url, name))
            .form(&form)
            .send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(VkError::Decode(format!("{name} returned HTTP {status}")));
        }
        let body: Value = response.json()?;
        unwrap_response(body)
    }

    pub fn group_profile(&self, group_id: i64) -> Result<Value, VkError> {
        let response = self.method(
            "groups.getById",
            &[
                ("group_id", group_id.to_string()),
                ("fields", "description,contacts,members_count".to_string()),
            ],
        )?;
        Ok(first_group(&response).unwrap_or_else(|| Value::Object(Default::default())))
    }

    pub fn recent_conversations(&self, limit: u32) -> Result<Vec<Value>, VkError> {
        let response = self.method(
            "messages.getConversations",
            &[("count", limit.to_string()), ("filter", "all".to_string())],
        )?;
        Ok(response
            .get("items")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }
}

impl VideoLookup for VkClient {
    fn lookup_video(
        &self,
        owner_id: i64,
        video_id: i64,
        access_key: Option<&str>,
    ) -> Result<Option<Value>, VkError> {
        let mut videos = format!("{owner_id}_{video_id}");
        if let Some(key) = access_key.filter(|key| !key.is_empty()) {
            videos.push('_');
            videos.push_str(key);
        }
        debug!("video.get {videos}");
        let response = self.method("video.get", &[("videos", videos)])?;
        Ok(response
            .get("items")
            .and_then(Value::as_array)
            .and_then(|items| items.first())
            .cloned())
    }
}

impl Directory for VkClient {
    fn user_name(&self, user_id: i64) -> Result<Option<String>, VkError> {
        let response = self.method("users.get", &[("user_ids", user_id.to_string())])?;
        let Some(user) = response.as_array().and_then(|users| users.first()) else {
            return Ok(None);
        };
        let first = user.get("first_name").and_then(Value::as_str).unwrap_or_default();
        let last = user.get("last_name").and_then(Value::as_str).unwrap_or_default();
        let name = format!("{first} {last}").trim().to_string();
        Ok(Some(name))
    }

    fn group_name(&self, group_id: i64) -> Result<Option<String>, VkError> {
        let response = self.method("groups.getById", &[("group_id", group_id.abs().to_string())])?;
        Ok(first_group(&response)
            .and_then(|group| group.get("name").and_then(Value::as_str).map(str::to_string)))
    }

    fn chat_title(&self, peer_id: i64) -> Result<Option<String>, VkError> {
        let response = self.method(
            "messages.getConversationsById",
            &[("peer_ids", peer_id.to_string())],
        )?;
        Ok(response
            .get("items")
            .and_then(Value::as_array)
            .and_then(|items| items.first())
            .and_then(|item| item.get("chat_settings"))
            .and_then(|settings| settings.get("title"))
            .and_then(Value::as_str)
            .filter(|title| !title.is_empty())
            .map(str::to_string))
    }
}

fn unwrap_response(body: Value) -> Result<Value, VkError> {
    if let Some(error) = body.get("error") {
        return Err(VkError::Api {
            code: error.get("error_code").and_then(Value::as_i64).unwrap_or(0),
            message: error
                .get("error_msg")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        });
    }
    match body {
        Value::Object(mut map) => map
            .remove("response")
            .ok_or_else(|| VkError::Decode("missing `response` field".to_string())),
        other => Err(VkError::Decode(format!("expected an object, got {other}"))),
    }
}

/// `groups.getById` answers with a bare array on old API versions and with
/// `{"groups": [...]}` on newer ones.
fn first_group(response: &Value) -> Option<Value> {
    response
        .as_array()
        .or_else(|| response.get("groups").and_then(Value::as_array))
        .and_then(|groups| groups.first())
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn api_errors_are_typed() {
        let err = unwrap_response(json!({"error": {"error_code": 5, "error_msg": "User authorization failed"}}))
            .unwrap_err();
        assert!(matches!(err, VkError::Api { code: 5, ref message } if message.contains("authorization")));
    }

    #[test]
    fn response_field_is_unwrapped() {
        assert_eq!(unwrap_response(json!({"response": [1, 2]})).unwrap(), json!([1, 2]));
        assert!(matches!(unwrap_response(json!({})), Err(VkError::Decode(_))));
    }

    #[test]
    fn group_lists_in_both_shapes() {
        assert_eq!(first_group(&json!([{"name": "a"}])).unwrap()["name"], "a");
        assert_eq!(first_group(&json!({"groups": [{"name": "b"}]})).unwrap()["name"], "b");
        assert!(first_group(&json!({})).is_none());
    }
}
