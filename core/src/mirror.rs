/// The mirror service: cache + store adapter + attachment index, and the
/// read-only query facade the transport layer calls into.
///
/// Built once at startup and shared behind an `Arc`; there is no global
/// state.
use crate::attachments::AttachmentIndex;
use crate::bridge::{OutboundBridge, OutboundMessage};
use crate::cache::ConversationCache;
use crate::config::Config;
use crate::error::{MirrorError, Result};
use crate::models::{Attachment, Conversation, Message};
use crate::queries::{self, ChatSelector};
use crate::refresh::{self, RefreshReport, RefreshState};
use crate::store::{StoreAdapter, StoreOptions};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Point-in-time service status
#[derive(Debug, Clone, Serialize)]
pub struct MirrorStatus {
    pub state: RefreshState,
    pub store: PathBuf,
    pub conversations: usize,
    pub attachments: usize,
    pub last_refresh: Option<RefreshReport>,
}

pub struct Mirror {
    store: StoreAdapter,
    cache: ConversationCache,
    attachments: AttachmentIndex,
    bridge: Arc<dyn OutboundBridge>,
    service: String,
    message_limit: usize,
    gate: tokio::sync::Mutex<()>,
    refreshing: AtomicBool,
    last_report: Mutex<Option<RefreshReport>>,
}

/// Resets the refreshing flag even if the cycle future is dropped
struct RefreshingFlag<'a>(&'a AtomicBool);

impl Drop for RefreshingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Mirror {
    pub fn new(config: &Config, bridge: Arc<dyn OutboundBridge>) -> Self {
        let store = StoreAdapter::new(StoreOptions {
            path: config.db_path.clone(),
            pool_size: config.pool_size,
            query_timeout: config.query_timeout,
        });
        Self {
            store,
            cache: ConversationCache::new(),
            attachments: AttachmentIndex::new(config.attachment_cache_size),
            bridge,
            service: config.service.clone(),
            message_limit: config.message_limit,
            gate: tokio::sync::Mutex::new(()),
            refreshing: AtomicBool::new(false),
            last_report: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &StoreAdapter {
        &self.store
    }

    pub fn cache(&self) -> &ConversationCache {
        &self.cache
    }

    pub fn attachments(&self) -> &AttachmentIndex {
        &self.attachments
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn message_limit(&self) -> usize {
        self.message_limit
    }

    pub fn refresh_state(&self) -> RefreshState {
        if self.refreshing.load(Ordering::SeqCst) {
            RefreshState::Refreshing
        } else {
            RefreshState::Idle
        }
    }

    pub fn last_report(&self) -> Option<RefreshReport> {
        self.last_report.lock().ok().and_then(|r| r.clone())
    }

    /// Run one refresh cycle. Concurrent callers queue; at most one cycle is
    /// in flight.
    pub async fn refresh(&self) -> Result<RefreshReport> {
        let _gate = self.gate.lock().await;
        self.refreshing.store(true, Ordering::SeqCst);
        let _flag = RefreshingFlag(&self.refreshing);

        let report = refresh::run_cycle(self).await?;
        if let Ok(mut last) = self.last_report.lock() {
            *last = Some(report.clone());
        }
        Ok(report)
    }

    // ─── Query facade ───────────────────────────────────────────────────────

    /// All conversations, newest activity first.
    ///
    /// With `force`, a refresh cycle runs first; if it fails the last good
    /// state is served.
    pub async fn list_conversations(&self, force: bool) -> Vec<Conversation> {
        if force {
            if let Err(e) = self.refresh().await {
                warn!("Forced refresh failed, serving cached state: {}", e);
            }
        }
        self.cache.snapshot().await
    }

    /// Message window for one conversation, newest first.
    ///
    /// A cache miss is answered straight from the store.
    pub async fn get_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        if let Some(conversation) = self.cache.get(conversation_id).await {
            return Ok(conversation.messages);
        }
        debug!("Cache miss for {}, querying store", conversation_id);
        self.fetch_direct(conversation_id, self.message_limit).await
    }

    /// Newest message of one conversation, `None` when it has none
    pub async fn get_last_message(&self, conversation_id: &str) -> Result<Option<Message>> {
        if let Some(conversation) = self.cache.get(conversation_id).await {
            return Ok(conversation.messages.into_iter().next());
        }
        debug!("Cache miss for {}, querying store", conversation_id);
        Ok(self.fetch_direct(conversation_id, 1).await?.into_iter().next())
    }

    async fn fetch_direct(&self, conversation_id: &str, limit: usize) -> Result<Vec<Message>> {
        let selector = ChatSelector::Identifier(conversation_id.to_string());
        let messages = self
            .store
            .execute("on-demand messages", move |c| {
                queries::messages_for(c, &selector, limit)
            })
            .await?;
        self.attachments.record_messages(&messages);
        Ok(messages)
    }

    pub fn list_attachments(&self) -> Vec<Attachment> {
        self.attachments.list()
    }

    /// Attachment owned by `message_id`.
    ///
    /// The flat table is bounded, so a miss falls back to the attachment
    /// lists of the cached messages.
    pub async fn get_attachment(&self, message_id: i64) -> Option<Attachment> {
        if let Some(attachment) = self.attachments.get(message_id) {
            return Some(attachment);
        }
        self.cache.find_attachment(message_id).await
    }

    /// Hand `text` and/or `file` to the outbound bridge. Never retried.
    pub async fn send(
        &self,
        conversation_id: &str,
        text: &str,
        file: Option<PathBuf>,
    ) -> Result<()> {
        if conversation_id.is_empty() {
            return Err(MirrorError::Send("empty conversation id".to_string()));
        }
        if text.is_empty() && file.is_none() {
            return Err(MirrorError::Send("nothing to send".to_string()));
        }
        let conversation = self.cache.get(conversation_id).await.ok_or_else(|| {
            MirrorError::NotFound(format!(
                "conversation {} is not in the cache; refresh or check the id",
                conversation_id
            ))
        })?;

        let message = OutboundMessage {
            conversation_id: conversation.id.clone(),
            is_group: conversation.is_group(),
            guid: conversation.guid,
            recipients: conversation.recipients,
            text: text.to_string(),
            file,
        };

        let bridge = self.bridge.clone();
        tokio::task::spawn_blocking(move || bridge.send(&message))
            .await
            .map_err(|e| MirrorError::Send(format!("send task failed: {}", e)))??;
        info!("Delivered outbound message to {}", conversation_id);
        Ok(())
    }

    pub async fn status(&self) -> MirrorStatus {
        MirrorStatus {
            state: self.refresh_state(),
            store: self.store.path().to_path_buf(),
            conversations: self.cache.len().await,
            attachments: self.attachments.len(),
            last_refresh: self.last_report(),
        }
    }
}
