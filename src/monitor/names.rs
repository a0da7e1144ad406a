//! Display names for senders and conversations.

use std::collections::HashMap;

use tracing::debug;

use crate::vk::{Directory, CHAT_PEER_OFFSET};

/// Successful lookups keyed by platform id. Failures are not cached so the
/// next message retries them.
#[derive(Debug, Default)]
pub struct NameCache {
    users: HashMap<i64, String>,
    groups: HashMap<i64, String>,
    peers: HashMap<i64, String>,
}

impl NameCache {
    /// `first last` for users, the community name for negative ids.
    pub fn sender_name(&mut self, directory: &dyn Directory, from_id: Option<i64>) -> Option<String> {
        let from_id = from_id?;
        if let Some(name) = self.users.get(&from_id).or_else(|| self.groups.get(&from_id)) {
            return Some(name.clone());
        }

        let lookup = if from_id > 0 {
            directory.user_name(from_id)
        } else {
            directory.group_name(from_id)
        };
        match lookup {
            Ok(Some(name)) => {
                let cache = if from_id > 0 { &mut self.users } else { &mut self.groups };
                cache.insert(from_id, name.clone());
                Some(name)
            }
            Ok(None) => None,
            Err(err) => {
                debug!("sender name lookup for {from_id} failed: {err}");
                None
            }
        }
    }

    /// Chat title for group chats, otherwise the user or community name.
    /// Falls back to `fallback` when nothing is found.
    pub fn peer_title(
        &mut self,
        directory: &dyn Directory,
        peer_id: Option<i64>,
        fallback: Option<&str>,
    ) -> Option<String> {
        let fallback = fallback.map(str::to_string);
        let Some(peer_id) = peer_id else {
            return fallback;
        };
        if let Some(title) = self.peers.get(&peer_id) {
            return Some(title.clone());
        }

        let title = if peer_id >= CHAT_PEER_OFFSET {
            match directory.chat_title(peer_id) {
                Ok(title) => title,
                Err(err) => {
                    debug!("chat title lookup for {peer_id} failed: {err}");
                    None
                }
            }
        } else {
            self.sender_name(directory, Some(peer_id))
        };

        match title.filter(|title| !title.is_empty()) {
            Some(title) => {
                self.peers.insert(peer_id, title.clone());
                Some(title)
            }
            None => fallback,
        }
    }
}
