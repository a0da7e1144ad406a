use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Photo,
    Video,
    AudioMessage,
    Doc,
    Sticker,
    Other,
}

impl AttachmentKind {
    pub fn from_type(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "photo" => AttachmentKind::Photo,
            "video" => AttachmentKind::Video,
            "audio_message" => AttachmentKind::AudioMessage,
            "doc" => AttachmentKind::Doc,
            "sticker" => AttachmentKind::Sticker,
            _ => AttachmentKind::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    Pending,
    Ready,
    Failed,
    Missing,
}

/// One media reference of a message, annotated with its download outcome.
///
/// `local_path` is only ever set together with `DownloadState::Ready`; the
/// `mark_*` transitions are the only writers of the outcome fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    /// Type string as sent by the platform (`photo`, `wall`, `link`, ...).
    #[serde(rename = "type")]
    pub type_name: String,
    pub kind: AttachmentKind,
    pub raw: Value,
    pub resolved_url: Option<String>,
    pub local_path: Option<String>,
    pub download_state: DownloadState,
    pub download_error: Option<String>,
    pub signature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl Attachment {
    pub fn mark_ready(&mut self, local_path: String, size_bytes: Option<u64>, sha256: Option<String>) {
        self.download_state = DownloadState::Ready;
        self.local_path = Some(local_path);
        self.download_error = None;
        self.size_bytes = size_bytes;
        self.sha256 = sha256;
    }

    pub fn mark_failed(&mut self, error: String) {
        self.download_state = DownloadState::Failed;
        self.local_path = None;
        self.download_error = Some(crate::error::truncate_error(&error));
    }

    pub fn mark_missing(&mut self, reason: String) {
        self.download_state = DownloadState::Missing;
        self.local_path = None;
        self.download_error = Some(crate::error::truncate_error(&reason));
    }
}

/// A message or forwarded entry. `A` is the attachment representation:
/// raw JSON on the way in, [`Attachment`] once normalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(serialize = "A: Serialize", deserialize = "A: Deserialize<'de>"))]
pub struct MessageNode<A> {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default)]
    pub attachments: Vec<A>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fwd_messages: Vec<MessageNode<A>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub copy_history: Vec<MessageNode<A>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_message: Option<Box<MessageNode<A>>>,
    /// Set when nested entries were dropped at the depth ceiling.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub nesting_truncated: bool,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

pub type RawMessage = MessageNode<Value>;
pub type AnnotatedMessage = MessageNode<Attachment>;

impl<A> MessageNode<A> {
    /// Every attachment in the tree: own list first, then forwarded entries
    /// and reposts depth-first, then the quoted reply.
    pub fn flatten_attachments(&self) -> Vec<&A> {
        let mut out = Vec::new();
        self.collect_attachments(&mut out);
        out
    }

    fn collect_attachments<'a>(&'a self, out: &mut Vec<&'a A>) {
        out.extend(self.attachments.iter());
        for child in self.fwd_messages.iter().chain(self.copy_history.iter()) {
            child.collect_attachments(out);
        }
        if let Some(reply) = self.reply_message.as_deref() {
            reply.collect_attachments(out);
        }
    }
}

/// Stored event with the JSON columns decoded for the dashboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: i64,
    pub created_at: String,
    pub event_type: String,
    pub peer_id: Option<i64>,
    pub peer_title: Option<String>,
    pub from_id: Option<i64>,
    pub from_name: Option<String>,
    pub message_id: Option<i64>,
    pub reply_to: Option<i64>,
    pub is_bot: bool,
    pub text: Option<String>,
    pub attachments: Value,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    pub id: i64,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageInfo {
    pub path: String,
    pub exists: bool,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageSummary {
    pub id: Option<i64>,
    pub from_id: Option<i64>,
    pub from_name: Option<String>,
    pub peer_id: Option<i64>,
    pub peer_title: Option<String>,
    pub text: Option<String>,
    pub attachments: Vec<Attachment>,
    pub reply_message: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelinePoint {
    pub time: String,
    pub events: u64,
    pub messages: u64,
    pub invites: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsResponse {
    pub events: u64,
    pub messages: u64,
    pub invites: u64,
    pub errors: u64,
    pub last_messages: Vec<MessageSummary>,
    pub timeline: Vec<TimelinePoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupResponse {
    pub path: String,
}
