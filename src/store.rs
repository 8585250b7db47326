//! Boundary traits for the collaborators the client talks to.
//!
//! Everything that touches a database, a media host, or the signed-in user goes
//! through one of these, so the receipt and chat logic can run against any
//! backing store. [`crate::storage::Storage`] implements the store traits on
//! SQLite.

use crate::error::StoreResult;
use crate::models::{
    Conversation, ConversationPatch, Message, MessageDraft, MessagePatch, StatusItem,
    UploadedMedia, User,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use tokio::sync::watch;
use uuid::Uuid;

/// Upload progress in percent, `0.0..=100.0`.
pub type Progress<'a> = Option<&'a (dyn Fn(f32) + Send + Sync)>;

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Conversations containing `member`, most recently updated first.
    async fn list_for_member(&self, member: Uuid) -> StoreResult<Vec<Conversation>>;

    /// Emits the `list_for_member` snapshot now and again after every change.
    fn subscribe(&self, member: Uuid) -> BoxStream<'static, StoreResult<Vec<Conversation>>>;

    async fn get(&self, id: Uuid) -> StoreResult<Option<Conversation>>;

    async fn create(&self, conversation: Conversation) -> StoreResult<Uuid>;

    /// Inserts only when no record with the same id exists. Returns whether it inserted.
    async fn create_if_absent(&self, conversation: Conversation) -> StoreResult<bool>;

    async fn update(&self, id: Uuid, patch: ConversationPatch) -> StoreResult<()>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// The latest `limit` messages in ascending `created_at` order.
    async fn recent(&self, chat_id: Uuid, limit: usize) -> StoreResult<Vec<Message>>;

    fn subscribe(&self, chat_id: Uuid, limit: usize) -> BoxStream<'static, StoreResult<Vec<Message>>>;

    /// Point-in-time query for messages not sent by `excluding_sender`.
    async fn inbound(&self, chat_id: Uuid, excluding_sender: Uuid) -> StoreResult<Vec<Message>>;

    /// Stores a new message, assigning its id and `created_at`.
    async fn create(&self, chat_id: Uuid, sender_id: Uuid, draft: MessageDraft)
        -> StoreResult<Message>;

    async fn update(&self, chat_id: Uuid, id: Uuid, patch: MessagePatch) -> StoreResult<()>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn upsert(&self, user: &User) -> StoreResult<()>;

    async fn get(&self, id: Uuid) -> StoreResult<Option<User>>;

    async fn find_by_name(&self, name: &str) -> StoreResult<Option<User>>;

    /// All users ordered by name.
    async fn list(&self) -> StoreResult<Vec<User>>;

    async fn set_presence(&self, id: Uuid, is_online: bool, at: DateTime<Utc>) -> StoreResult<()>;
}

#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn create(&self, item: &StatusItem) -> StoreResult<()>;

    /// Unexpired items of `user_id`, by `expires_at` then `created_at`, newest first.
    async fn active_for(&self, user_id: Uuid, now: DateTime<Utc>) -> StoreResult<Vec<StatusItem>>;

    async fn add_viewer(&self, item_id: Uuid, viewer: Uuid) -> StoreResult<()>;

    async fn delete_expired(&self, now: DateTime<Utc>) -> StoreResult<usize>;
}

pub trait IdentityProvider: Send + Sync {
    fn current_user_id(&self) -> Option<Uuid>;

    /// Observes sign-in and sign-out.
    fn watch(&self) -> watch::Receiver<Option<Uuid>>;
}

#[async_trait]
pub trait MediaHost: Send + Sync {
    async fn upload(&self, bytes: &[u8], progress: Progress<'_>) -> StoreResult<UploadedMedia>;

    fn thumbnail_url(&self, media: &UploadedMedia) -> String {
        media.url.clone()
    }
}
