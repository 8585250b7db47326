use super::{json_at, now, time_at, uuid_at, Storage, Table};
use crate::error::{StoreError, StoreResult};
use crate::models::{Message, MessageDraft, MessagePatch};
use crate::store::MessageStore;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

const MESSAGE_COLUMNS: &str =
    "id, chat_id, sender_id, content, attachments, created_at, delivered_to, read_by";

fn message_from_row(row: &Row) -> rusqlite::Result<Message> {
    Ok(Message {
        id: uuid_at(row, 0)?,
        chat_id: uuid_at(row, 1)?,
        sender_id: uuid_at(row, 2)?,
        content: row.get(3)?,
        attachments: json_at(row, 4)?,
        created_at: time_at(row, 5)?,
        delivered_to: json_at(row, 6)?,
        read_by: json_at(row, 7)?,
    })
}

fn recent(conn: &Connection, chat_id: Uuid, limit: usize) -> StoreResult<Vec<Message>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE chat_id = ?1
         ORDER BY created_at DESC, rowid DESC LIMIT ?2"
    ))?;
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let mut messages = stmt
        .query_map(params![chat_id.to_string(), limit], message_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    messages.reverse();
    Ok(messages)
}

#[async_trait]
impl MessageStore for Storage {
    async fn recent(&self, chat_id: Uuid, limit: usize) -> StoreResult<Vec<Message>> {
        self.with_conn(|conn| recent(conn, chat_id, limit)).await
    }

    fn subscribe(&self, chat_id: Uuid, limit: usize) -> BoxStream<'static, StoreResult<Vec<Message>>> {
        let storage = self.clone();
        self.watch(Table::Messages, move || {
            let storage = storage.clone();
            async move { storage.with_conn(|conn| recent(conn, chat_id, limit)).await }
        })
    }

    async fn inbound(&self, chat_id: Uuid, excluding_sender: Uuid) -> StoreResult<Vec<Message>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE chat_id = ?1 AND sender_id != ?2"
            ))?;
            let messages = stmt
                .query_map(
                    params![chat_id.to_string(), excluding_sender.to_string()],
                    message_from_row,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(messages)
        })
        .await
    }

    async fn create(
        &self,
        chat_id: Uuid,
        sender_id: Uuid,
        draft: MessageDraft,
    ) -> StoreResult<Message> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;

            // created_at never goes backwards within a chat
            let latest: Option<i64> = tx
                .query_row(
                    "SELECT MAX(created_at) FROM messages WHERE chat_id = ?1",
                    [chat_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?
                .flatten();
            let mut created_at = now();
            if let Some(latest) = latest {
                created_at = created_at.max(super::from_millis(latest));
            }

            let message = Message {
                id: Uuid::new_v4(),
                chat_id,
                sender_id,
                content: draft.content,
                attachments: draft.attachments,
                created_at,
                delivered_to: BTreeSet::new(),
                read_by: BTreeMap::from([(sender_id, created_at)]),
            };

            tx.execute(
                &format!(
                    "INSERT INTO messages ({MESSAGE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                ),
                params![
                    message.id.to_string(),
                    chat_id.to_string(),
                    sender_id.to_string(),
                    message.content,
                    serde_json::to_string(&message.attachments)?,
                    message.created_at.timestamp_millis(),
                    serde_json::to_string(&message.delivered_to)?,
                    serde_json::to_string(&message.read_by)?,
                ],
            )?;
            tx.commit()?;
            Ok(message)
        })
        .await
    }

    async fn update(&self, chat_id: Uuid, id: Uuid, patch: MessagePatch) -> StoreResult<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let (mut delivered_to, mut read_by) = tx
                .query_row(
                    "SELECT delivered_to, read_by FROM messages WHERE id = ?1 AND chat_id = ?2",
                    [id.to_string(), chat_id.to_string()],
                    |row| {
                        Ok((
                            json_at::<BTreeSet<Uuid>>(row, 0)?,
                            json_at::<BTreeMap<Uuid, chrono::DateTime<chrono::Utc>>>(row, 1)?,
                        ))
                    },
                )
                .optional()?
                .ok_or_else(|| StoreError::NotFound(format!("message {id} in chat {chat_id}")))?;

            match patch {
                MessagePatch::DeliverTo(user_id) => {
                    if !delivered_to.insert(user_id) {
                        return Ok(());
                    }
                }
                MessagePatch::ReadBy(user_id, at) => {
                    read_by.insert(user_id, at);
                }
            }

            tx.execute(
                "UPDATE messages SET delivered_to = ?2, read_by = ?3 WHERE id = ?1",
                params![
                    id.to_string(),
                    serde_json::to_string(&delivered_to)?,
                    serde_json::to_string(&read_by)?,
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn test_create_sets_sender_receipt() {
        let storage = Storage::open_in_memory().unwrap();
        let (chat_id, alice) = (Uuid::new_v4(), Uuid::new_v4());

        let message = storage
            .create(chat_id, alice, MessageDraft::text("hi"))
            .await
            .unwrap();
        assert!(message.delivered_to.is_empty());
        assert_eq!(message.read_by.get(&alice), Some(&message.created_at));

        let stored = storage.recent(chat_id, 10).await.unwrap();
        assert_eq!(stored, vec![message]);
    }

    #[tokio::test]
    async fn test_recent_keeps_latest_in_order() {
        let storage = Storage::open_in_memory().unwrap();
        let (chat_id, alice) = (Uuid::new_v4(), Uuid::new_v4());
        for text in ["one", "two", "three"] {
            storage
                .create(chat_id, alice, MessageDraft::text(text))
                .await
                .unwrap();
        }

        let recent = storage.recent(chat_id, 2).await.unwrap();
        let texts: Vec<_> = recent.iter().filter_map(|m| m.content.as_deref()).collect();
        assert_eq!(texts, vec!["two", "three"]);
        assert!(recent[0].created_at <= recent[1].created_at);
    }

    #[tokio::test]
    async fn test_inbound_excludes_sender() {
        let storage = Storage::open_in_memory().unwrap();
        let (chat_id, alice, bob) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        storage.create(chat_id, alice, MessageDraft::text("from alice")).await.unwrap();
        storage.create(chat_id, bob, MessageDraft::text("from bob")).await.unwrap();
        storage.create(Uuid::new_v4(), bob, MessageDraft::text("elsewhere")).await.unwrap();

        let inbound = storage.inbound(chat_id, alice).await.unwrap();
        assert_eq!(inbound.len(), 1);
        assert_eq!(inbound[0].content.as_deref(), Some("from bob"));
    }

    #[tokio::test]
    async fn test_deliver_is_set_union() {
        let storage = Storage::open_in_memory().unwrap();
        let (chat_id, alice, bob) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let message = storage.create(chat_id, alice, MessageDraft::text("hi")).await.unwrap();

        storage.update(chat_id, message.id, MessagePatch::DeliverTo(bob)).await.unwrap();
        storage.update(chat_id, message.id, MessagePatch::DeliverTo(bob)).await.unwrap();

        let stored = storage.recent(chat_id, 1).await.unwrap().remove(0);
        assert_eq!(stored.delivered_to, BTreeSet::from([bob]));
    }

    #[tokio::test]
    async fn test_update_unknown_message() {
        let storage = Storage::open_in_memory().unwrap();
        let result = storage
            .update(Uuid::new_v4(), Uuid::new_v4(), MessagePatch::DeliverTo(Uuid::new_v4()))
            .await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_subscribe_sees_receipts() {
        let storage = Storage::open_in_memory().unwrap();
        let (chat_id, alice, bob) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let message = storage.create(chat_id, alice, MessageDraft::text("hi")).await.unwrap();

        let mut feed = MessageStore::subscribe(&storage, chat_id, 50);
        let first = feed.next().await.unwrap().unwrap();
        assert!(!first[0].is_read_by(&bob));

        let at = now();
        storage.update(chat_id, message.id, MessagePatch::ReadBy(bob, at)).await.unwrap();
        let second = feed.next().await.unwrap().unwrap();
        assert_eq!(second[0].read_by.get(&bob), Some(&at));
    }
}
