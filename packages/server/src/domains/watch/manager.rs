use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::kernel::retry::RetryPolicy;
use crate::kernel::traits::MailboxProvider;
use crate::store::RecordStore;

use super::models::{WatchState, WatchSubscription};

/// Watches expiring within this window are renewed by the scheduler sweep.
pub const RENEWAL_WINDOW_HOURS: i64 = 24;

pub struct WatchManager {
    store: Arc<dyn RecordStore>,
    mailbox: Arc<dyn MailboxProvider>,
    retry: RetryPolicy,
    topic: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct WatchStatusReport {
    pub watch: WatchSubscription,
    pub hours_until_expiration: i64,
    pub is_expiring_soon: bool,
}

impl WatchManager {
    pub fn new(
        store: Arc<dyn RecordStore>,
        mailbox: Arc<dyn MailboxProvider>,
        retry: RetryPolicy,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            store,
            mailbox,
            retry,
            topic: topic.into(),
        }
    }

    /// Register a provider-side watch and persist it as active.
    ///
    /// On provider failure the stored watch (if any) is marked inactive with
    /// the error recorded, then the error is returned.
    pub async fn start(&self, user_id: Uuid) -> Result<WatchSubscription> {
        let registration = self
            .retry
            .execute(|| self.mailbox.register_watch(user_id, &self.topic))
            .await;

        let registration = match registration {
            Ok(r) => r,
            Err(e) => {
                self.store
                    .record_watch_failure(user_id, &e.to_string())
                    .await?;
                return Err(e).context("watch registration failed");
            }
        };

        let now = Utc::now();
        let existing = self.store.get_watch(user_id).await?;
        let watch = WatchSubscription {
            user_id,
            watch_id: registration.watch_id,
            topic: self.topic.clone(),
            state: WatchState::Active,
            expires_at: registration.expires_at,
            last_notified_at: existing.as_ref().and_then(|w| w.last_notified_at),
            last_error: None,
            renewal_attempts: 0,
            created_at: existing.map(|w| w.created_at).unwrap_or(now),
            updated_at: now,
        };
        self.store.upsert_watch(&watch).await?;

        tracing::info!(user_id = %user_id, expires_at = %watch.expires_at, "watch registered");
        Ok(watch)
    }

    /// Deregister the provider-side watch. A missing or already-inactive
    /// watch is a no-op.
    pub async fn stop(&self, user_id: Uuid) -> Result<()> {
        match self.store.get_watch(user_id).await? {
            Some(watch) if watch.is_active() => {}
            _ => return Ok(()),
        }

        self.retry
            .execute(|| self.mailbox.deregister_watch(user_id))
            .await
            .context("watch deregistration failed")?;
        self.store.mark_watch_inactive(user_id).await?;

        tracing::info!(user_id = %user_id, "watch stopped");
        Ok(())
    }

    pub async fn status(&self, user_id: Uuid) -> Result<Option<WatchStatusReport>> {
        let Some(watch) = self.store.get_watch(user_id).await? else {
            return Ok(None);
        };
        let hours = watch.hours_until_expiration(Utc::now());
        Ok(Some(WatchStatusReport {
            is_expiring_soon: hours <= RENEWAL_WINDOW_HOURS,
            hours_until_expiration: hours,
            watch,
        }))
    }

    /// Re-register an expiring watch. The old registration is torn down best
    /// effort; a fresh registration supersedes it provider-side anyway.
    pub async fn renew(&self, user_id: Uuid) -> Result<WatchSubscription> {
        if let Err(e) = self
            .retry
            .execute(|| self.mailbox.deregister_watch(user_id))
            .await
        {
            tracing::warn!(user_id = %user_id, error = %e, "stale watch teardown failed");
        }
        self.start(user_id).await
    }
}
