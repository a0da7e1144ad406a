//! Bots Long Poll event source.

use std::sync::Arc;
use std::time::Duration;

use reqwest::blocking::Client as BlockingHttpClient;
use serde_json::Value;
use tracing::{debug, info};

use super::VkClient;
use crate::error::VkError;

const WAIT_SECS: u64 = 25;

/// A source of raw platform updates.
pub trait EventSource: Send {
    /// Block until the next batch of updates is available. An empty batch is
    /// a normal outcome (timeout or session refresh).
    fn next_batch(&mut self) -> Result<Vec<Value>, VkError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Session {
    server: String,
    key: String,
    ts: String,
}

impl Session {
    fn from_response(response: &Value) -> Result<Self, VkError> {
        let field = |name: &str| {
            response
                .get(name)
                .and_then(|value| match value {
                    Value::String(text) => Some(text.clone()),
                    Value::Number(number) => Some(number.to_string()),
                    _ => None,
                })
                .ok_or_else(|| VkError::Decode(format!("long poll server without `{name}`")))
        };
        Ok(Self {
            server: field("server")?,
            key: field("key")?,
            ts: field("ts")?,
        })
    }

    /// A freshly requested session, continuing from `resume_ts` if one is kept.
    fn resumed(self, resume_ts: Option<String>) -> Self {
        match resume_ts {
            Some(ts) => Self { ts, ..self },
            None => self,
        }
    }
}

/// What to do after one `a_check` answer.
#[derive(Debug, PartialEq)]
enum PollOutcome {
    Updates { ts: String, updates: Vec<Value> },
    /// History gap: continue from the given `ts`.
    Resync(Option<String>),
    /// Key expired: request a new key, keep reading from the current `ts`.
    RefreshKey,
    /// Data lost: request a new session and start from its `ts`.
    Reconnect,
}

fn interpret(body: Value) -> Result<PollOutcome, VkError> {
    let ts = body.get("ts").and_then(|ts| match ts {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    });
    if let Some(failed) = body.get("failed").and_then(Value::as_i64) {
        return match failed {
            1 => Ok(PollOutcome::Resync(ts)),
            2 => Ok(PollOutcome::RefreshKey),
            3 => Ok(PollOutcome::Reconnect),
            other => Err(VkError::Decode(format!("unknown long poll failure code {other}"))),
        };
    }
    let ts = ts.ok_or_else(|| VkError::Decode("long poll answer without `ts`".to_string()))?;
    let updates = match body {
        Value::Object(mut map) => match map.remove("updates") {
            Some(Value::Array(updates)) => updates,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    };
    Ok(PollOutcome::Updates { ts, updates })
}

pub struct LongPoll {
    client: Arc<VkClient>,
    http: BlockingHttpClient,
    group_id: i64,
    session: Option<Session>,
    resume_ts: Option<String>,
}

impl LongPoll {
    pub fn new(client: Arc<VkClient>, group_id: i64) -> Result<Self, VkError> {
        let http = BlockingHttpClient::builder()
            .timeout(Duration::from_secs(WAIT_SECS + 10))
            .build()?;
        Ok(Self {
            client,
            http,
            group_id,
            session: None,
            resume_ts: None,
        })
    }

    fn connect(&mut self) -> Result<Session, VkError> {
        let response = self.client.method(
            "groups.getLongPollServer",
            &[("group_id", self.group_id.to_string())],
        )?;
        let session = Session::from_response(&response)?;
        info!("long poll session opened for group {}", self.group_id);
        Ok(session)
    }
}

impl EventSource for LongPoll {
    fn next_batch(&mut self) -> Result<Vec<Value>, VkError> {
        let session = match self.session.take() {
            Some(session) => session,
            None => {
                let fresh = self.connect()?;
                fresh.resumed(self.resume_ts.take())
            }
        };

        let wait = WAIT_SECS.to_string();
        let body: Value = self
            .http
            .get(&session.server)
            .query(&[
                ("act", "a_check"),
                ("key", session.key.as_str()),
                ("ts", session.ts.as_str()),
                ("wait", wait.as_str()),
            ])
            .send()?
            .json()?;

        match interpret(body)? {
            PollOutcome::Updates { ts, updates } => {
                self.session = Some(Session { ts, ..session });
                Ok(updates)
            }
            PollOutcome::Resync(ts) => {
                debug!("long poll history gap, resyncing");
                let ts = ts.unwrap_or(session.ts.clone());
                self.session = Some(Session { ts, ..session });
                Ok(Vec::new())
            }
            PollOutcome::RefreshKey => {
                debug!("long poll key expired, refreshing");
                self.resume_ts = Some(session.ts);
                Ok(Vec::new())
            }
            PollOutcome::Reconnect => {
                debug!("long poll history lost, reconnecting");
                Ok(Vec::new())
            }
        }
    }
}
