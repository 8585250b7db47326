use super::{json_at, json_opt_at, time_at, uuid_at, Storage, Table};
use crate::error::{StoreError, StoreResult};
use crate::models::{Conversation, ConversationPatch, CounterOp, MessagePreview};
use crate::store::ConversationStore;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use uuid::Uuid;

const CHAT_COLUMNS: &str =
    "id, is_group, name, avatar_url, members, last_message_preview, unread_counts, created_at, updated_at";

fn chat_from_row(row: &Row) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: uuid_at(row, 0)?,
        is_group: row.get(1)?,
        name: row.get(2)?,
        avatar_url: row.get(3)?,
        members: json_at(row, 4)?,
        last_message_preview: json_opt_at(row, 5)?,
        unread_counts: json_at(row, 6)?,
        created_at: time_at(row, 7)?,
        updated_at: time_at(row, 8)?,
    })
}

fn list_for_member(conn: &Connection, member: Uuid) -> StoreResult<Vec<Conversation>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CHAT_COLUMNS} FROM chats
         WHERE EXISTS (SELECT 1 FROM json_each(chats.members) WHERE json_each.value = ?1)
         ORDER BY updated_at DESC, rowid DESC"
    ))?;
    let chats = stmt
        .query_map([member.to_string()], chat_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(chats)
}

fn get(conn: &Connection, id: Uuid) -> StoreResult<Option<Conversation>> {
    let chat = conn
        .query_row(
            &format!("SELECT {CHAT_COLUMNS} FROM chats WHERE id = ?1"),
            [id.to_string()],
            chat_from_row,
        )
        .optional()?;
    Ok(chat)
}

fn insert(conn: &Connection, chat: &Conversation, or_ignore: bool) -> StoreResult<usize> {
    let verb = if or_ignore { "INSERT OR IGNORE" } else { "INSERT" };
    let preview = chat
        .last_message_preview
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let inserted = conn.execute(
        &format!(
            "{verb} INTO chats ({CHAT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
        ),
        params![
            chat.id.to_string(),
            chat.is_group,
            chat.name,
            chat.avatar_url,
            serde_json::to_string(&chat.members)?,
            preview,
            serde_json::to_string(&chat.unread_counts)?,
            chat.created_at.timestamp_millis(),
            chat.updated_at.timestamp_millis(),
        ],
    )?;
    Ok(inserted)
}

fn apply_counters(counts: &mut BTreeMap<Uuid, u32>, ops: &[(Uuid, CounterOp)]) {
    for (member, op) in ops {
        match op {
            CounterOp::Reset => {
                counts.insert(*member, 0);
            }
            CounterOp::Increment(n) => {
                let count = counts.entry(*member).or_insert(0);
                *count = count.saturating_add(*n);
            }
        }
    }
}

#[async_trait]
impl ConversationStore for Storage {
    async fn list_for_member(&self, member: Uuid) -> StoreResult<Vec<Conversation>> {
        self.with_conn(|conn| list_for_member(conn, member)).await
    }

    fn subscribe(&self, member: Uuid) -> BoxStream<'static, StoreResult<Vec<Conversation>>> {
        let storage = self.clone();
        self.watch(Table::Chats, move || {
            let storage = storage.clone();
            async move { storage.list_for_member(member).await }
        })
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<Conversation>> {
        self.with_conn(|conn| get(conn, id)).await
    }

    async fn create(&self, conversation: Conversation) -> StoreResult<Uuid> {
        self.with_conn(|conn| {
            insert(conn, &conversation, false)?;
            Ok(conversation.id)
        })
        .await
    }

    async fn create_if_absent(&self, conversation: Conversation) -> StoreResult<bool> {
        self.with_conn(|conn| Ok(insert(conn, &conversation, true)? > 0))
            .await
    }

    async fn update(&self, id: Uuid, patch: ConversationPatch) -> StoreResult<()> {
        if patch.is_empty() {
            return Ok(());
        }

        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let mut chat =
                get(&tx, id)?.ok_or_else(|| StoreError::NotFound(format!("chat {id}")))?;

            apply_counters(&mut chat.unread_counts, &patch.unread);
            if let Some(preview) = patch.last_message_preview {
                chat.last_message_preview = Some(preview);
            }
            if let Some(updated_at) = patch.updated_at {
                chat.updated_at = updated_at;
            }

            tx.execute(
                "UPDATE chats SET last_message_preview = ?2, unread_counts = ?3, updated_at = ?4
                 WHERE id = ?1",
                params![
                    id.to_string(),
                    chat.last_message_preview
                        .as_ref()
                        .map(serde_json::to_string::<MessagePreview>)
                        .transpose()?,
                    serde_json::to_string(&chat.unread_counts)?,
                    chat.updated_at.timestamp_millis(),
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
    use crate::storage::now;
    use chrono::Duration;
    use futures_util::StreamExt;

    fn direct(a: Uuid, b: Uuid) -> Conversation {
        let mut chat = Conversation::direct(Uuid::new_v4(), a, b);
        chat.created_at = now();
        chat.updated_at = chat.created_at;
        chat
    }

    #[tokio::test]
    async fn test_create_and_list_by_member() {
        let storage = Storage::open_in_memory().unwrap();
        let (alice, bob, carol) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        let older = direct(alice, bob);
        let mut newer = direct(alice, carol);
        newer.updated_at = older.updated_at + Duration::seconds(5);
        storage.create(older.clone()).await.unwrap();
        storage.create(newer.clone()).await.unwrap();

        let for_alice = storage.list_for_member(alice).await.unwrap();
        let ids: Vec<_> = for_alice.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![newer.id, older.id]);

        let for_bob = storage.list_for_member(bob).await.unwrap();
        assert_eq!(for_bob, vec![older]);
    }

    #[tokio::test]
    async fn test_create_if_absent_is_conditional() {
        let storage = Storage::open_in_memory().unwrap();
        let chat = direct(Uuid::new_v4(), Uuid::new_v4());

        assert!(storage.create_if_absent(chat.clone()).await.unwrap());
        assert!(!storage.create_if_absent(chat.clone()).await.unwrap());
        assert!(storage.create(chat).await.is_err());
    }

    #[tokio::test]
    async fn test_unread_counters() {
        let storage = Storage::open_in_memory().unwrap();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let chat = direct(alice, bob);
        storage.create(chat.clone()).await.unwrap();

        let bump = ConversationPatch {
            unread: vec![(bob, CounterOp::Increment(1))],
            ..Default::default()
        };
        storage.update(chat.id, bump.clone()).await.unwrap();
        storage.update(chat.id, bump).await.unwrap();
        let stored = storage.get(chat.id).await.unwrap().unwrap();
        assert_eq!(stored.unread_for(&bob), 2);
        assert_eq!(stored.unread_for(&alice), 0);

        storage
            .update(chat.id, ConversationPatch::reset_unread(bob))
            .await
            .unwrap();
        let stored = storage.get(chat.id).await.unwrap().unwrap();
        assert_eq!(stored.unread_for(&bob), 0);
    }

    #[tokio::test]
    async fn test_update_missing_chat() {
        let storage = Storage::open_in_memory().unwrap();
        let result = storage
            .update(Uuid::new_v4(), ConversationPatch::reset_unread(Uuid::new_v4()))
            .await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_subscribe_emits_on_change() {
        let storage = Storage::open_in_memory().unwrap();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let mut chats = storage.subscribe(alice);

        assert!(chats.next().await.unwrap().unwrap().is_empty());

        let chat = direct(alice, bob);
        storage.create(chat.clone()).await.unwrap();
        assert_eq!(chats.next().await.unwrap().unwrap(), vec![chat]);
    }
}
