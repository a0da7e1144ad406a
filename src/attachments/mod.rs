//! Attachment resolution and local caching.
//!
//! For every message node: build annotated attachments, drop duplicate
//! signatures, resolve a URL per attachment, materialize the bytes, then do
//! the same for forwarded entries and reposts. Failures stay attached to the
//! attachment they belong to.

pub mod dedup;
pub mod download;
pub mod files;
pub mod resolve;
pub mod stickers;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::{AnnotatedMessage, Attachment, AttachmentKind, DownloadState, RawMessage};
use download::Downloader;
use resolve::{Resolution, VideoLookup};
use stickers::StickerCache;

/// Forwarded/repost nesting deeper than this is dropped.
pub const MAX_NESTING_DEPTH: usize = 16;

/// Wrap a raw record as a pending attachment with its signature computed.
pub fn new_attachment(raw: Value) -> Attachment {
    let type_name = resolve::type_name(&raw);
    Attachment {
        kind: AttachmentKind::from_type(&type_name),
        signature: dedup::signature(&raw),
        type_name,
        raw,
        resolved_url: None,
        local_path: None,
        download_state: DownloadState::Pending,
        download_error: None,
        size_bytes: None,
        sha256: None,
    }
}

pub struct AttachmentPipeline {
    root: PathBuf,
    lookup: Arc<dyn VideoLookup>,
    downloader: Downloader,
    stickers: StickerCache,
}

impl AttachmentPipeline {
    pub fn new(
        root: PathBuf,
        lookup: Arc<dyn VideoLookup>,
        downloader: Downloader,
        stickers: StickerCache,
    ) -> Self {
        Self {
            root,
            lookup,
            downloader,
            stickers,
        }
    }

    /// Per-(peer, message) cache directory.
    pub fn message_dir(&self, peer_id: Option<i64>, message_id: Option<i64>) -> PathBuf {
        let part = |value: Option<i64>| {
            value
                .map(|id| id.to_string())
                .unwrap_or_else(|| "unknown".to_string())
        };
        self.root.join(part(peer_id)).join(part(message_id))
    }

    /// Annotate a whole message tree.
    pub fn normalize_message(&self, message: RawMessage) -> AnnotatedMessage {
        let dir = self.message_dir(message.peer_id, message.id);
        let (peer_id, message_id) = (message.peer_id, message.id);
        let annotated = self.normalize_node(message, &dir, 0, true);

        let all = annotated.flatten_attachments();
        if !all.is_empty() {
            let ready = all
                .iter()
                .filter(|a| a.download_state == DownloadState::Ready)
                .count();
            info!(
                "message {message_id:?} in peer {peer_id:?}: {ready}/{} attachments cached",
                all.len()
            );
        }
        annotated
    }

    /// Annotate a single raw attachment for the given message.
    pub fn normalize_attachment(
        &self,
        raw: Value,
        peer_id: Option<i64>,
        message_id: Option<i64>,
    ) -> Attachment {
        let dir = self.message_dir(peer_id, message_id);
        self.materialize(new_attachment(raw), &dir)
    }

    fn normalize_node(
        &self,
        node: RawMessage,
        dir: &Path,
        depth: usize,
        recurse: bool,
    ) -> AnnotatedMessage {
        let attachments = dedup::dedup(node.attachments.into_iter().map(new_attachment).collect())
            .into_iter()
            .map(|attachment| self.materialize(attachment, dir))
            .collect();

        let has_children = !node.fwd_messages.is_empty() || !node.copy_history.is_empty();
        let descend = recurse && depth < MAX_NESTING_DEPTH;
        if has_children && !descend {
            if recurse {
                warn!("nesting deeper than {MAX_NESTING_DEPTH} levels dropped");
            } else {
                debug!("nested entries of a quoted reply dropped");
            }
        }

        let children = |list: Vec<RawMessage>| -> Vec<AnnotatedMessage> {
            if !descend {
                return Vec::new();
            }
            list.into_iter()
                .map(|child| self.normalize_node(child, dir, depth + 1, true))
                .collect()
        };
        let fwd_messages = children(node.fwd_messages);
        let copy_history = children(node.copy_history);

        // A quoted reply is handled one level deep only.
        let had_reply = node.reply_message.is_some();
        let reply_message = node
            .reply_message
            .filter(|_| recurse)
            .map(|reply| Box::new(self.normalize_node(*reply, dir, depth + 1, false)));

        AnnotatedMessage {
            id: node.id,
            peer_id: node.peer_id,
            from_id: node.from_id,
            text: node.text,
            attachments,
            fwd_messages,
            copy_history,
            reply_message,
            nesting_truncated: node.nesting_truncated
                || (has_children && !descend)
                || (had_reply && !recurse),
            rest: node.rest,
        }
    }

    /// Resolve and download one attachment, recording the terminal state.
    fn materialize(&self, mut attachment: Attachment, dir: &Path) -> Attachment {
        let resolution = resolve::resolve(&attachment.raw, self.lookup.as_ref());
        attachment.resolved_url = resolution.url().map(str::to_string);

        match resolution {
            Resolution::Gap(gap) => attachment.mark_missing(gap.reason),
            Resolution::Direct(url) => {
                match self
                    .downloader
                    .download_direct(&url, dir, &attachment.type_name)
                {
                    Ok(done) => attachment.mark_ready(
                        path_string(&done.path),
                        Some(done.size_bytes),
                        Some(done.sha256),
                    ),
                    Err(err) => attachment.mark_failed(err.to_string()),
                }
            }
            Resolution::Player(url) => {
                let stem = player_stem(&attachment.raw);
                match self.downloader.download_player(&url, dir, &stem) {
                    Ok(path) => {
                        let size = std::fs::metadata(&path).ok().map(|meta| meta.len());
                        attachment.mark_ready(path_string(&path), size, None);
                    }
                    Err(err) => attachment.mark_failed(err.to_string()),
                }
            }
            Resolution::Sticker { sticker_id, url } => {
                match self.stickers.materialize(sticker_id, url.as_deref()) {
                    Ok(path) => {
                        let size = std::fs::metadata(&path).ok().map(|meta| meta.len());
                        attachment.mark_ready(path_string(&path), size, None);
                    }
                    Err(err) => attachment.mark_failed(err.to_string()),
                }
            }
        }

        if attachment.download_state != DownloadState::Ready {
            warn!(
                "attachment {} ({}) not cached in {}: {:?}: {}",
                attachment.signature,
                attachment.type_name,
                dir.display(),
                attachment.download_state,
                attachment.download_error.as_deref().unwrap_or_default()
            );
        }
        attachment
    }
}

fn player_stem(raw: &Value) -> String {
    match resolve::identity(raw) {
        Some((owner_id, id, _)) => format!("video_{owner_id}_{id}"),
        None => format!("video_{}", Uuid::new_v4().simple()),
    }
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().to_string()
}
