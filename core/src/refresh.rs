/// Refresh engine: polling loop plus the incremental refresh cycle
use crate::config::Config;
use crate::error::Result;
use crate::mirror::Mirror;
use crate::queries::{self, ChatSelector};
use crate::watcher::SourceWatcher;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshState {
    Idle,
    Refreshing,
}

/// Outcome of one refresh cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshReport {
    /// Conversations returned by the list scan
    pub scanned: usize,
    /// Conversations whose message window was re-pulled
    pub refetched: usize,
    /// Conversations skipped by the staleness check
    pub unchanged: usize,
    /// Conversations left at their prior state after a query error
    pub failed: usize,
    pub elapsed_ms: u64,
    pub finished_at: DateTime<Utc>,
}

/// One full pass: list, staleness check, selective re-fetch, commit.
///
/// Holds the cache write lock and the store's cycle guard from start to
/// finish. If the conversation list cannot be read the cache is untouched.
pub(crate) async fn run_cycle(mirror: &Mirror) -> Result<RefreshReport> {
    let started = Instant::now();
    // Checked before the write lock so readers are never held up by it
    mirror.store().check_source()?;
    let mut cache = mirror.cache().lock_for_refresh().await;
    let cycle = mirror.store().begin_cycle()?;
    let store = cycle.adapter();

    let service = mirror.service().to_string();
    let conversations = store
        .execute("conversation list", move |c| {
            queries::list_conversations(c, &service)
        })
        .await?;

    let limit = mirror.message_limit();
    let mut scanned = 0;
    let mut refetched = 0;
    let mut unchanged = 0;
    let mut failed = 0;

    for mut conversation in conversations {
        scanned += 1;
        let row_id = conversation.row_id;

        if let Some(cached) = cache.get(&conversation.id) {
            let cached_date = cached.last_message_date;
            match store
                .execute("latest message date", move |c| {
                    queries::latest_message_date(c, row_id)
                })
                .await
            {
                Ok(latest) if latest == cached_date => {
                    unchanged += 1;
                    let metadata_changed = cached.display_name != conversation.display_name
                        || cached.recipients != conversation.recipients;
                    if metadata_changed {
                        let mut updated = cached.clone();
                        updated.display_name = conversation.display_name;
                        updated.recipients = conversation.recipients;
                        cache.upsert(updated);
                    }
                    continue;
                }
                Ok(latest) => {
                    debug!(
                        "{} advanced: cached {} vs store {}",
                        conversation.id, cached_date, latest
                    );
                }
                Err(e) => {
                    warn!("Staleness check failed for {}: {}", conversation.id, e);
                    failed += 1;
                    continue;
                }
            }
        }

        let selector = ChatSelector::RowId(row_id);
        match store
            .execute("message window", move |c| {
                queries::messages_for(c, &selector, limit)
            })
            .await
        {
            Ok(messages) => {
                if messages.is_empty() {
                    debug!("0 messages in row {} ({})", row_id, conversation.id);
                }
                mirror.attachments().record_messages(&messages);
                conversation.set_messages(messages);
                cache.upsert(conversation);
                refetched += 1;
            }
            Err(e) => {
                error!("Message fetch failed for {}: {}", conversation.id, e);
                failed += 1;
            }
        }
    }

    drop(cycle);
    drop(cache);

    let report = RefreshReport {
        scanned,
        refetched,
        unchanged,
        failed,
        elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        finished_at: Utc::now(),
    };
    info!(
        "Refresh took {}ms: {} scanned, {} re-fetched, {} failed",
        report.elapsed_ms, report.scanned, report.refetched, report.failed
    );
    Ok(report)
}

/// Timer-driven refresh loop
pub struct RefreshEngine {
    mirror: Arc<Mirror>,
    watcher: SourceWatcher,
    poll_interval: Duration,
    rescan_interval: Duration,
    last_cycle: Option<Instant>,
}

impl RefreshEngine {
    pub fn new(mirror: Arc<Mirror>, config: &Config) -> Self {
        Self {
            watcher: SourceWatcher::new(mirror.store().path()),
            mirror,
            poll_interval: config.poll_interval,
            rescan_interval: config.rescan_interval,
            last_cycle: None,
        }
    }

    /// One poll: refresh if the source changed or a rescan is due.
    ///
    /// Returns `None` when nothing triggered.
    pub async fn tick(&mut self) -> Option<Result<RefreshReport>> {
        let modified = self.watcher.has_been_modified();
        let rescan_due = self
            .last_cycle
            .map_or(true, |at| at.elapsed() >= self.rescan_interval);
        if !modified && !rescan_due {
            return None;
        }

        if modified {
            debug!("Refresh triggered by source modification");
        } else {
            debug!("Refresh triggered by rescan interval");
        }

        let result = self.mirror.refresh().await;
        self.last_cycle = Some(Instant::now());
        if let Err(e) = &result {
            error!("Refresh cycle aborted, keeping last good state: {}", e);
        }
        Some(result)
    }

    /// Poll until `shutdown` flips to true (or its sender goes away)
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Checking {} every {}ms",
            self.mirror.store().path().display(),
            self.poll_interval.as_millis()
        );

        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Refresh engine stopped");
    }
}
