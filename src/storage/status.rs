use super::{json_at, time_at, uuid_at, Storage};
use crate::error::{StoreError, StoreResult};
use crate::models::StatusItem;
use crate::store::StatusStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use std::collections::BTreeSet;
use uuid::Uuid;

const STATUS_COLUMNS: &str = "id, user_id, media_url, public_id, thumbnail_url, caption, visibility, created_at, expires_at, viewers";

fn status_from_row(row: &Row) -> rusqlite::Result<StatusItem> {
    Ok(StatusItem {
        id: uuid_at(row, 0)?,
        user_id: uuid_at(row, 1)?,
        media_url: row.get(2)?,
        public_id: row.get(3)?,
        thumbnail_url: row.get(4)?,
        caption: row.get(5)?,
        visibility: json_at(row, 6)?,
        created_at: time_at(row, 7)?,
        expires_at: time_at(row, 8)?,
        viewers: json_at(row, 9)?,
    })
}

#[async_trait]
impl StatusStore for Storage {
    async fn create(&self, item: &StatusItem) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO status_items ({STATUS_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                ),
                params![
                    item.id.to_string(),
                    item.user_id.to_string(),
                    item.media_url,
                    item.public_id,
                    item.thumbnail_url,
                    item.caption,
                    serde_json::to_string(&item.visibility)?,
                    item.created_at.timestamp_millis(),
                    item.expires_at.timestamp_millis(),
                    serde_json::to_string(&item.viewers)?,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn active_for(&self, user_id: Uuid, now: DateTime<Utc>) -> StoreResult<Vec<StatusItem>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {STATUS_COLUMNS} FROM status_items
                 WHERE user_id = ?1 AND expires_at > ?2
                 ORDER BY expires_at DESC, created_at DESC"
            ))?;
            let items = stmt
                .query_map(
                    params![user_id.to_string(), now.timestamp_millis()],
                    status_from_row,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(items)
        })
        .await
    }

    async fn add_viewer(&self, item_id: Uuid, viewer: Uuid) -> StoreResult<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let mut viewers: BTreeSet<Uuid> = tx
                .query_row(
                    "SELECT viewers FROM status_items WHERE id = ?1",
                    [item_id.to_string()],
                    |row| json_at(row, 0),
                )
                .optional()?
                .ok_or_else(|| StoreError::NotFound(format!("status item {item_id}")))?;

            if viewers.insert(viewer) {
                tx.execute(
                    "UPDATE status_items SET viewers = ?2 WHERE id = ?1",
                    params![item_id.to_string(), serde_json::to_string(&viewers)?],
                )?;
                tx.commit()?;
            }
            Ok(())
        })
        .await
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        self.with_conn(|conn| {
            let deleted = conn.execute(
                "DELETE FROM status_items WHERE expires_at <= ?1",
                [now.timestamp_millis()],
            )?;
            Ok(deleted)
        })
        .await
    }
}
