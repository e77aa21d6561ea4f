//! Periodic sweep: dispatch due polling syncs and renew expiring watches.
//!
//! Explicitly constructed and cancellable; nothing starts at import time.
//! Sweeps never overlap: a tick that lands while the previous sweep is still
//! running is dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::domains::sync::SyncDispatcher;
use crate::domains::watch::{WatchManager, RENEWAL_WINDOW_HOURS};
use crate::kernel::deps::EngineDeps;

pub struct PollingScheduler {
    deps: Arc<EngineDeps>,
    tick: Duration,
    cancel: CancellationToken,
    sweeping: AtomicBool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    pub sweep_id: Uuid,
    /// Sync jobs dispatched this sweep (duplicates absorbed by the queue
    /// still count as dispatched).
    pub dispatched: usize,
    pub renewed_watches: usize,
    /// True when this call found a sweep already in progress and did nothing.
    pub skipped: bool,
}

impl PollingScheduler {
    pub fn new(deps: Arc<EngineDeps>, tick: Duration) -> Self {
        Self {
            deps,
            tick,
            cancel: CancellationToken::new(),
            sweeping: AtomicBool::new(false),
        }
    }

    /// Spawn the tick loop. Runs until [`PollingScheduler::stop`].
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(scheduler.tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = scheduler.cancel.cancelled() => {
                        tracing::info!("polling scheduler stopped");
                        return;
                    }
                    _ = interval.tick() => {
                        if let Err(e) = scheduler.trigger_check().await {
                            tracing::error!(error = %e, "scheduler sweep failed");
                        }
                    }
                }
            }
        })
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Run one sweep now. Shared by the tick loop and `POST /sync/trigger`.
    pub async fn trigger_check(&self) -> Result<SweepReport> {
        if self
            .sweeping
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(SweepReport {
                sweep_id: Uuid::new_v4(),
                dispatched: 0,
                renewed_watches: 0,
                skipped: true,
            });
        }
        let result = self.sweep().await;
        self.sweeping.store(false, Ordering::SeqCst);
        result
    }

    async fn sweep(&self) -> Result<SweepReport> {
        let sweep_id = Uuid::new_v4();
        let now = Utc::now();
        let dispatcher = SyncDispatcher::new(self.deps.queue.clone());

        let mut dispatched = 0usize;
        for preference in self.deps.store.auto_sync_users().await? {
            if !preference.strategy.uses_polling() {
                continue;
            }
            let cursor = self.deps.store.get_cursor(preference.user_id).await?;
            let due = cursor.last_sync_at.map_or(true, |last| {
                now - last >= chrono::Duration::minutes(preference.polling_interval_minutes)
            });
            if !due {
                continue;
            }
            dispatcher.dispatch(preference.user_id, false).await?;
            dispatched += 1;
        }

        let mut renewed = 0usize;
        let watch_manager = WatchManager::new(
            self.deps.store.clone(),
            self.deps.mailbox.clone(),
            self.deps.retry,
            self.deps.settings.push_topic.clone(),
        );
        let horizon = now + chrono::Duration::hours(RENEWAL_WINDOW_HOURS);
        for watch in self.deps.store.expiring_watches(horizon).await? {
            let preference = self.deps.store.get_preferences(watch.user_id).await?;
            if !preference.webhook_enabled || !preference.strategy.uses_webhook() {
                continue;
            }
            match watch_manager.renew(watch.user_id).await {
                Ok(_) => renewed += 1,
                Err(e) => {
                    // Recorded on the watch row; the next sweep tries again.
                    tracing::warn!(user_id = %watch.user_id, error = %e, "watch renewal failed");
                }
            }
        }

        tracing::debug!(
            sweep_id = %sweep_id,
            dispatched,
            renewed_watches = renewed,
            "scheduler sweep finished"
        );
        Ok(SweepReport {
            sweep_id,
            dispatched,
            renewed_watches: renewed,
            skipped: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::sync::{SyncPreference, SyncStrategy};
    use crate::domains::watch::{WatchState, WatchSubscription};
    use crate::kernel::jobs::{QueueMode, QueueName};
    use crate::kernel::test_dependencies::TestEngine;

    fn scheduler(engine: &TestEngine) -> PollingScheduler {
        PollingScheduler::new(engine.deps.clone(), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn never_synced_user_is_dispatched() {
        let engine = TestEngine::new(QueueMode::Queue);
        let user_id = Uuid::new_v4();
        engine
            .store
            .set_preferences(SyncPreference::builder().user_id(user_id).build());

        let report = scheduler(&engine).trigger_check().await.unwrap();

        assert_eq!(report.dispatched, 1);
        assert!(!report.skipped);
        let counts = engine.deps.queue.stats(QueueName::Sync).await.unwrap();
        assert_eq!(counts.waiting, 1);
    }

    #[tokio::test]
    async fn recently_synced_user_is_not_due() {
        let engine = TestEngine::new(QueueMode::Queue);
        let user_id = Uuid::new_v4();
        engine
            .store
            .set_preferences(SyncPreference::builder().user_id(user_id).build());
        engine.deps.store.try_begin_sync(user_id).await.unwrap();
        engine
            .deps
            .store
            .complete_sync(user_id, "h-1", 0)
            .await
            .unwrap();

        let report = scheduler(&engine).trigger_check().await.unwrap();
        assert_eq!(report.dispatched, 0);
    }

    #[tokio::test]
    async fn webhook_only_users_are_not_polled() {
        let engine = TestEngine::new(QueueMode::Queue);
        engine.store.set_preferences(
            SyncPreference::builder()
                .user_id(Uuid::new_v4())
                .strategy(SyncStrategy::Webhook)
                .build(),
        );

        let report = scheduler(&engine).trigger_check().await.unwrap();
        assert_eq!(report.dispatched, 0);
    }

    #[tokio::test]
    async fn expiring_watch_is_renewed() {
        let engine = TestEngine::new(QueueMode::Queue);
        let user_id = Uuid::new_v4();
        engine
            .store
            .set_preferences(SyncPreference::builder().user_id(user_id).build());
        let now = Utc::now();
        engine
            .deps
            .store
            .upsert_watch(&WatchSubscription {
                user_id,
                watch_id: "w-old".to_string(),
                topic: "mail-notifications".to_string(),
                state: WatchState::Active,
                expires_at: now + chrono::Duration::hours(6),
                last_notified_at: None,
                last_error: None,
                renewal_attempts: 0,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();

        let report = scheduler(&engine).trigger_check().await.unwrap();

        assert_eq!(report.renewed_watches, 1);
        let watch = engine.deps.store.get_watch(user_id).await.unwrap().unwrap();
        assert_ne!(watch.watch_id, "w-old");
        assert!(watch.expires_at > now + chrono::Duration::hours(RENEWAL_WINDOW_HOURS));
    }

    #[tokio::test]
    async fn stop_terminates_the_tick_loop() {
        let engine = TestEngine::new(QueueMode::Queue);
        let scheduler = Arc::new(PollingScheduler::new(
            engine.deps.clone(),
            Duration::from_millis(5),
        ));

        let handle = scheduler.start();
        tokio::time::sleep(Duration::from_millis(20)).await;
        scheduler.stop();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop did not stop")
            .unwrap();
    }
}
