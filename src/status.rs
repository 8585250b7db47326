use crate::error::{Error, Result};
use crate::models::{StatusItem, Visibility};
use crate::store::{MediaHost, Progress, StatusStore};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

pub const DEFAULT_STATUS_TTL_HOURS: i64 = 24;

/// Short-lived media posts ("stories").
pub struct StatusService {
    statuses: Arc<dyn StatusStore>,
    media: Arc<dyn MediaHost>,
    ttl: Duration,
}

impl StatusService {
    pub fn new(statuses: Arc<dyn StatusStore>, media: Arc<dyn MediaHost>, ttl: Duration) -> Self {
        StatusService {
            statuses,
            media,
            ttl,
        }
    }

    pub async fn post(
        &self,
        user_id: Uuid,
        bytes: &[u8],
        caption: &str,
        visibility: Visibility,
        progress: Progress<'_>,
    ) -> Result<StatusItem> {
        if bytes.is_empty() {
            return Err(Error::invalid("Status media is empty"));
        }

        let created_at = crate::storage::now();
        let expires_at = created_at
            .checked_add_signed(self.ttl)
            .filter(|expires| *expires > created_at)
            .ok_or_else(|| Error::invalid(format!("Status lifetime {} is out of range", self.ttl)))?;

        let uploaded = self.media.upload(bytes, progress).await?;
        let item = StatusItem {
            id: Uuid::new_v4(),
            user_id,
            thumbnail_url: self.media.thumbnail_url(&uploaded),
            media_url: uploaded.url,
            public_id: uploaded.id,
            caption: caption.trim().to_string(),
            visibility,
            created_at,
            expires_at,
            viewers: BTreeSet::new(),
        };
        self.statuses.create(&item).await?;

        log::info!("User {user_id} posted status {} until {}", item.id, item.expires_at);
        Ok(item)
    }

    pub async fn active_for(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<Vec<StatusItem>> {
        Ok(self.statuses.active_for(user_id, now).await?)
    }

    /// Records that `viewer` saw `item`. Owners viewing their own status are not recorded.
    pub async fn mark_viewed(&self, item: &StatusItem, viewer: Uuid) -> Result<()> {
        if item.user_id == viewer || item.viewers.contains(&viewer) {
            return Ok(());
        }
        Ok(self.statuses.add_viewer(item.id, viewer).await?)
    }

    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let purged = self.statuses.delete_expired(now).await?;
        if purged > 0 {
            log::info!("Purged {purged} expired status items");
        }
        Ok(purged)
    }
}
