/// Flat attachment table keyed by owning message
///
/// Bounded: once `capacity` owners are tracked, recording a new one evicts
/// the least recently recorded.
use crate::models::{Attachment, Message};
use indexmap::IndexMap;
use std::sync::Mutex;
use tracing::debug;

pub struct AttachmentIndex {
    capacity: usize,
    entries: Mutex<IndexMap<i64, Attachment>>,
}

impl AttachmentIndex {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(IndexMap::new()),
        }
    }

    /// Record every attachment carried by `messages` (newest first, as
    /// fetched). Recorded oldest first so the newest survive eviction.
    pub fn record_messages(&self, messages: &[Message]) {
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        let oldest_first = messages.iter().rev().flat_map(|m| m.attachments.iter().rev());
        for attachment in oldest_first {
            Self::insert(&mut entries, self.capacity, attachment.clone());
        }
    }

    pub fn record(&self, attachment: Attachment) {
        if let Ok(mut entries) = self.entries.lock() {
            Self::insert(&mut entries, self.capacity, attachment);
        }
    }

    fn insert(entries: &mut IndexMap<i64, Attachment>, capacity: usize, attachment: Attachment) {
        // Re-recording moves the owner to the young end
        entries.shift_remove(&attachment.message_id);
        while entries.len() >= capacity {
            if let Some((evicted, _)) = entries.shift_remove_index(0) {
                debug!("Evicted attachment entry for message {}", evicted);
            }
        }
        entries.insert(attachment.message_id, attachment);
    }

    pub fn get(&self, message_id: i64) -> Option<Attachment> {
        self.entries.lock().ok()?.get(&message_id).cloned()
    }

    /// All tracked attachments, oldest recorded first
    pub fn list(&self) -> Vec<Attachment> {
        self.entries
            .lock()
            .map(|entries| entries.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
