use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::Utc;

use crate::models::{AnnotatedMessage, MessageSummary, StatsResponse, TimelinePoint};

pub const LAST_MESSAGES_KEEP: usize = 10;
pub const TIMELINE_POINTS: usize = 50;

pub type SharedState = Arc<Mutex<BotState>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Message,
    Invite,
    Other,
}

/// Running counters shown on the dashboard.
#[derive(Debug, Default)]
pub struct BotState {
    pub total_events: u64,
    pub new_messages: u64,
    pub invites: u64,
    pub errors: u64,
    last_messages: VecDeque<MessageSummary>,
    timeline: VecDeque<TimelinePoint>,
}

impl BotState {
    pub fn shared() -> SharedState {
        Arc::new(Mutex::new(Self::default()))
    }

    pub fn mark_event(&mut self, kind: EventKind, summary: Option<MessageSummary>) {
        self.total_events += 1;
        match kind {
            EventKind::Message => {
                self.new_messages += 1;
                if let Some(summary) = summary {
                    self.last_messages.push_back(summary);
                    while self.last_messages.len() > LAST_MESSAGES_KEEP {
                        self.last_messages.pop_front();
                    }
                }
            }
            EventKind::Invite => self.invites += 1,
            EventKind::Other => {}
        }

        self.timeline.push_back(TimelinePoint {
            time: Utc::now().format("%H:%M:%S").to_string(),
            events: self.total_events,
            messages: self.new_messages,
            invites: self.invites,
        });
        while self.timeline.len() > TIMELINE_POINTS {
            self.timeline.pop_front();
        }
    }

    pub fn mark_error(&mut self) {
        self.errors += 1;
    }

    pub fn snapshot(&self) -> StatsResponse {
        StatsResponse {
            events: self.total_events,
            messages: self.new_messages,
            invites: self.invites,
            errors: self.errors,
            last_messages: self.last_messages.iter().cloned().collect(),
            timeline: self.timeline.iter().cloned().collect(),
        }
    }
}

pub fn summarize(
    message: &AnnotatedMessage,
    from_name: Option<&str>,
    peer_title: Option<&str>,
) -> MessageSummary {
    MessageSummary {
        id: message.id,
        from_id: message.from_id,
        from_name: from_name.map(str::to_string),
        peer_id: message.peer_id,
        peer_title: peer_title.map(str::to_string),
        text: message.text.clone(),
        attachments: message.attachments.clone(),
        reply_message: message
            .reply_message
            .as_deref()
            .and_then(|reply| serde_json::to_value(reply).ok()),
    }
}
