/// In-memory conversation cache
///
/// One reader/writer lock covers the whole map. A refresh cycle holds the
/// write side for its entire duration, so a reader sees either the state
/// before the cycle or the state after it.
use crate::models::{Attachment, Conversation};
use std::collections::HashMap;
use tokio::sync::{RwLock, RwLockWriteGuard};

#[derive(Default)]
pub struct ConversationCache {
    conversations: RwLock<HashMap<String, Conversation>>,
}

impl ConversationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current view, newest activity first.
    ///
    /// Order among conversations sharing a timestamp is unspecified.
    pub async fn snapshot(&self) -> Vec<Conversation> {
        let map = self.conversations.read().await;
        let mut list: Vec<Conversation> = map.values().cloned().collect();
        list.sort_by(|a, b| b.last_message_date.cmp(&a.last_message_date));
        list
    }

    /// Insert or wholesale-replace the entry with the same identifier
    pub async fn upsert(&self, conversation: Conversation) {
        let mut map = self.conversations.write().await;
        insert_normalized(&mut map, conversation);
    }

    pub async fn get(&self, id: &str) -> Option<Conversation> {
        self.conversations.read().await.get(id).cloned()
    }

    /// Newest attachment carried by a cached message, searched across all
    /// conversations
    pub async fn find_attachment(&self, message_id: i64) -> Option<Attachment> {
        let map = self.conversations.read().await;
        map.values()
            .flat_map(|c| c.messages.iter())
            .find(|m| m.row_id == message_id)
            .and_then(|m| m.attachments.first().cloned())
    }

    pub async fn len(&self) -> usize {
        self.conversations.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.conversations.read().await.is_empty()
    }

    /// Take the write lock for a whole refresh cycle
    pub async fn lock_for_refresh(&self) -> RefreshGuard<'_> {
        RefreshGuard {
            map: self.conversations.write().await,
        }
    }
}

/// Exclusive access to the cache while a refresh cycle runs
pub struct RefreshGuard<'a> {
    map: RwLockWriteGuard<'a, HashMap<String, Conversation>>,
}

impl RefreshGuard<'_> {
    pub fn get(&self, id: &str) -> Option<&Conversation> {
        self.map.get(id)
    }

    pub fn upsert(&mut self, conversation: Conversation) {
        insert_normalized(&mut self.map, conversation);
    }
}

fn insert_normalized(map: &mut HashMap<String, Conversation>, mut conversation: Conversation) {
    let messages = std::mem::take(&mut conversation.messages);
    conversation.set_messages(messages);
    map.insert(conversation.id.clone(), conversation);
}
