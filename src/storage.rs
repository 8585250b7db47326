use crate::error::StoreResult;
use crate::models::User;
use crate::store::UserStore;
use async_stream::stream;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::stream::BoxStream;
use rusqlite::hooks::Action;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

mod chats;
mod messages;
mod status;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        email TEXT NOT NULL,
        about TEXT,
        avatar_url TEXT,
        is_online INTEGER NOT NULL DEFAULT 0,
        last_seen INTEGER NOT NULL,
        created_at INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS chats (
        id TEXT PRIMARY KEY,
        is_group INTEGER NOT NULL,
        name TEXT,
        avatar_url TEXT,
        members TEXT NOT NULL,
        last_message_preview TEXT,
        unread_counts TEXT NOT NULL DEFAULT '{}',
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS messages (
        id TEXT PRIMARY KEY,
        chat_id TEXT NOT NULL,
        sender_id TEXT NOT NULL,
        content TEXT,
        attachments TEXT NOT NULL DEFAULT '[]',
        created_at INTEGER NOT NULL,
        delivered_to TEXT NOT NULL DEFAULT '[]',
        read_by TEXT NOT NULL DEFAULT '{}'
    );
    CREATE INDEX IF NOT EXISTS messages_by_chat ON messages (chat_id, created_at);
    CREATE TABLE IF NOT EXISTS status_items (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        media_url TEXT NOT NULL,
        public_id TEXT NOT NULL,
        thumbnail_url TEXT NOT NULL,
        caption TEXT NOT NULL,
        visibility TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        expires_at INTEGER NOT NULL,
        viewers TEXT NOT NULL DEFAULT '[]'
    );
";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Table {
    Users,
    Chats,
    Messages,
    StatusItems,
}

impl Table {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "users" => Some(Table::Users),
            "chats" => Some(Table::Chats),
            "messages" => Some(Table::Messages),
            "status_items" => Some(Table::StatusItems),
            _ => None,
        }
    }
}

/// SQLite-backed implementation of every store trait.
///
/// Cloning is cheap and shares the connection. Each write notifies
/// subscribers through a table-change broadcast fed by SQLite's update hook.
#[derive(Clone)]
pub struct Storage {
    conn: Arc<Mutex<Connection>>,
    changes: broadcast::Sender<Table>,
}

impl Storage {
    pub fn new(db_path: &str) -> StoreResult<Self> {
        let conn = Connection::open(db_path)?;
        conn.execute_batch(SCHEMA)?;

        let (changes, _) = broadcast::channel(64);
        let hook_tx = changes.clone();
        conn.update_hook(Some(move |_: Action, _: &str, table: &str, _: i64| {
            if let Some(table) = Table::from_name(table) {
                let _ = hook_tx.send(table);
            }
        }));

        Ok(Storage {
            conn: Arc::new(Mutex::new(conn)),
            changes,
        })
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::new(":memory:")
    }

    pub fn changes(&self) -> broadcast::Receiver<Table> {
        self.changes.subscribe()
    }

    async fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut conn = self.conn.lock().await;
        f(&mut conn)
    }

    /// Yields `produce()` once, then again whenever `table` changes.
    fn watch<T, F, Fut>(&self, table: Table, mut produce: F) -> BoxStream<'static, StoreResult<T>>
    where
        T: Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = StoreResult<T>> + Send + 'static,
    {
        let mut changes = self.changes.subscribe();
        Box::pin(stream! {
            loop {
                yield produce().await;

                if !wait_for(&mut changes, table).await {
                    break;
                }
            }
        })
    }
}

async fn wait_for(receiver: &mut broadcast::Receiver<Table>, table: Table) -> bool {
    loop {
        match receiver.recv().await {
            Ok(changed) if changed == table => break,
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(_)) => break,
            Err(broadcast::error::RecvError::Closed) => return false,
        }
    }

    // Coalesce a burst of writes into one snapshot
    while receiver.try_recv().is_ok() {}
    true
}

pub(crate) fn now() -> DateTime<Utc> {
    from_millis(Utc::now().timestamp_millis())
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn conversion_error(idx: usize, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

pub(crate) fn uuid_at(row: &Row, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|e| conversion_error(idx, e))
}

pub(crate) fn time_at(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    Ok(from_millis(row.get(idx)?))
}

pub(crate) fn json_at<T: DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

pub(crate) fn json_opt_at<T: DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(|e| conversion_error(idx, e))
}

const USER_COLUMNS: &str = "id, name, email, about, avatar_url, is_online, last_seen, created_at";

fn user_from_row(row: &Row) -> rusqlite::Result<User> {
    Ok(User {
        id: uuid_at(row, 0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        about: row.get(3)?,
        avatar_url: row.get(4)?,
        is_online: row.get(5)?,
        last_seen: time_at(row, 6)?,
        created_at: time_at(row, 7)?,
    })
}

#[async_trait]
impl UserStore for Storage {
    async fn upsert(&self, user: &User) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, name, email, about, avatar_url, is_online, last_seen, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    email = excluded.email,
                    about = excluded.about,
                    avatar_url = excluded.avatar_url,
                    is_online = excluded.is_online,
                    last_seen = excluded.last_seen",
                params![
                    user.id.to_string(),
                    user.name,
                    user.email,
                    user.about,
                    user.avatar_url,
                    user.is_online,
                    user.last_seen.timestamp_millis(),
                    user.created_at.timestamp_millis(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<User>> {
        self.with_conn(|conn| {
            let user = conn
                .query_row(
                    &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                    [id.to_string()],
                    user_from_row,
                )
                .optional()?;
            Ok(user)
        })
        .await
    }

    async fn find_by_name(&self, name: &str) -> StoreResult<Option<User>> {
        self.with_conn(|conn| {
            let user = conn
                .query_row(
                    &format!("SELECT {USER_COLUMNS} FROM users WHERE name = ?1"),
                    [name],
                    user_from_row,
                )
                .optional()?;
            Ok(user)
        })
        .await
    }

    async fn list(&self) -> StoreResult<Vec<User>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {USER_COLUMNS} FROM users ORDER BY name ASC"))?;
            let users = stmt
                .query_map([], user_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(users)
        })
        .await
    }

    async fn set_presence(&self, id: Uuid, is_online: bool, at: DateTime<Utc>) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET is_online = ?2, last_seen = ?3 WHERE id = ?1",
                params![id.to_string(), is_online, at.timestamp_millis()],
            )?;
            Ok(())
        })
        .await
    }
}
