//! Background event worker and the state it feeds.

pub mod names;
pub mod state;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::attachments::AttachmentPipeline;
use crate::db::{EventLog, INVITE_EVENT, MESSAGE_EVENT};
use crate::error::AppError;
use crate::models::{MessageSummary, RawMessage};
use crate::vk::longpoll::EventSource;
use crate::vk::Directory;
use names::NameCache;
use state::{summarize, BotState, EventKind, SharedState};

const MEMBERSHIP_ACTIONS: [&str; 3] = ["chat_invite_user", "chat_invite_user_by_link", "chat_kick_user"];
const SOURCE_BACKOFF: Duration = Duration::from_secs(3);

#[derive(Debug)]
pub enum Update {
    Message(Box<RawMessage>),
    Invite(Value),
    Other(String),
}

/// Sort one raw long-poll update. Membership changes arrive either as their
/// own event type or as `message_new` carrying an `action`.
pub fn classify_update(update: Value) -> Result<Update, AppError> {
    let event_type = update
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let object = match update {
        Value::Object(mut map) => map.remove("object").unwrap_or(Value::Null),
        _ => Value::Null,
    };

    if MEMBERSHIP_ACTIONS.contains(&event_type.as_str()) {
        return Ok(Update::Invite(object));
    }
    if event_type != "message_new" {
        return Ok(Update::Other(event_type));
    }

    // Current API versions wrap the message as `{message, client_info}`.
    let message = match object {
        Value::Object(mut map) if map.contains_key("message") => {
            map.remove("message").unwrap_or(Value::Null)
        }
        other => other,
    };
    let action = message
        .get("action")
        .and_then(|action| action.get("type"))
        .and_then(Value::as_str);
    if action.is_some_and(|action| MEMBERSHIP_ACTIONS.contains(&action)) {
        return Ok(Update::Invite(message));
    }
    Ok(Update::Message(Box::new(serde_json::from_value(message)?)))
}

pub struct BotMonitor {
    source: Box<dyn EventSource>,
    pipeline: Arc<AttachmentPipeline>,
    log: Arc<EventLog>,
    directory: Arc<dyn Directory>,
    names: NameCache,
    state: SharedState,
    stop: Arc<AtomicBool>,
    backoff: Duration,
}

impl BotMonitor {
    pub fn new(
        source: Box<dyn EventSource>,
        pipeline: Arc<AttachmentPipeline>,
        log: Arc<EventLog>,
        directory: Arc<dyn Directory>,
        state: SharedState,
    ) -> Self {
        Self {
            source,
            pipeline,
            log,
            directory,
            names: NameCache::default(),
            state,
            stop: Arc::new(AtomicBool::new(false)),
            backoff: SOURCE_BACKOFF,
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Setting the flag ends the loop after the current batch.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("vk-monitor".to_string())
            .spawn(move || self.run())
    }

    pub fn run(mut self) {
        info!("event worker started");
        while !self.stop.load(Ordering::SeqCst) {
            self.poll_once();
        }
        info!("event worker stopped");
    }

    /// Fetch and handle one batch. Returns the number of handled updates.
    pub fn poll_once(&mut self) -> usize {
        let batch = match self.source.next_batch() {
            Ok(batch) => batch,
            Err(err) => {
                error!("long poll failed: {err}");
                self.with_state(BotState::mark_error);
                thread::sleep(self.backoff);
                return 0;
            }
        };

        let mut handled = 0;
        for update in batch {
            match self.handle_update(update) {
                Ok(_) => handled += 1,
                Err(err) => {
                    error!("event handling failed: {err}");
                    self.with_state(BotState::mark_error);
                }
            }
        }
        handled
    }

    pub fn handle_update(&mut self, update: Value) -> Result<EventKind, AppError> {
        match classify_update(update)? {
            Update::Message(message) => {
                self.handle_message(*message)?;
                Ok(EventKind::Message)
            }
            Update::Invite(payload) => {
                self.with_state(|state| state.mark_event(EventKind::Invite, None));
                let peer_id = payload.get("peer_id").and_then(Value::as_i64);
                info!("membership event in peer {peer_id:?}");
                self.log.log_event(INVITE_EVENT, &payload, None, None)?;
                Ok(EventKind::Invite)
            }
            Update::Other(event_type) => {
                self.with_state(|state| state.mark_event(EventKind::Other, None));
                info!("event received: {event_type}");
                Ok(EventKind::Other)
            }
        }
    }

    fn handle_message(&mut self, message: RawMessage) -> Result<(), AppError> {
        let directory = self.directory.as_ref();
        let from_name = self.names.sender_name(directory, message.from_id);
        let peer_title = self
            .names
            .peer_title(directory, message.peer_id, from_name.as_deref());

        let annotated = self.pipeline.normalize_message(message);
        let summary = summarize(&annotated, from_name.as_deref(), peer_title.as_deref());
        self.with_state(|state| state.mark_event(EventKind::Message, Some(summary)));

        self.log
            .log_message(&annotated, peer_title.as_deref(), from_name.as_deref())?;
        info!(
            "message: peer {:?} -> {}",
            annotated.peer_id,
            annotated.text.as_deref().unwrap_or_default()
        );
        Ok(())
    }

    fn with_state(&self, update: impl FnOnce(&mut BotState)) {
        match self.state.lock() {
            Ok(mut state) => update(&mut *state),
            Err(_) => warn!("bot state lock poisoned; update dropped"),
        }
    }
}

/// Group profile and conversations shown on the overview page.
#[derive(Debug, Clone, Default)]
pub struct Overview {
    pub group: Value,
    pub conversations: Vec<Value>,
}

/// Fill the state and the log with sample data for running without a token.
pub fn seed_demo(state: &SharedState, log: &EventLog) -> Result<Overview, AppError> {
    let demo_messages = [
        json!({"id": 1, "from_id": 111, "peer_id": 1, "text": "First demo message", "attachments": []}),
        json!({"id": 2, "from_id": 222, "peer_id": 2, "text": "Another demo", "attachments": []}),
    ];
    let names = [("Ivan Ivanov", "Demo dialog"), ("Maria Petrova", "Demo chat")];

    let mut guard = state.lock().map_err(|_| AppError::LockPoisoned)?;
    for (message, (from_name, peer_title)) in demo_messages.iter().zip(names) {
        guard.mark_event(
            EventKind::Message,
            Some(MessageSummary {
                id: message["id"].as_i64(),
                from_id: message["from_id"].as_i64(),
                from_name: Some(from_name.to_string()),
                peer_id: message["peer_id"].as_i64(),
                peer_title: Some(peer_title.to_string()),
                text: message["text"].as_str().map(str::to_string),
                attachments: Vec::new(),
                reply_message: None,
            }),
        );
        log.log_event(MESSAGE_EVENT, message, Some(peer_title), Some(from_name))?;
    }
    guard.mark_event(EventKind::Invite, None);

    Ok(Overview {
        group: json!({
            "name": "Demo community",
            "description": "Sample data without a VK connection",
            "members_count": 1234,
            "screen_name": "club_demo",
        }),
        conversations: vec![
            json!({"conversation": {"peer": {"id": 1, "type": "chat"}, "chat_settings": {"title": "Demo chat"}}}),
            json!({"conversation": {"peer": {"id": 2, "type": "user"}, "can_write": true}}),
        ],
    })
}
