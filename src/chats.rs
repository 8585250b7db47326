use crate::error::{Error, Result};
use crate::models::{
    Conversation, ConversationPatch, CounterOp, Message, MessageDraft, MessagePreview,
};
use crate::store::{ConversationStore, IdentityProvider, MessageStore};
use chrono::Utc;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

/// Namespace for direct-chat ids derived from the member pair.
const DIRECT_CHAT_NAMESPACE: Uuid = Uuid::from_u128(0x5a1c_03e2_77b4_4f0e_9c4d_2e8b_61a0_d7f3);

/// How a new direct conversation gets its id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChatIdStrategy {
    /// Id derived from the sorted member pair and created conditionally, so
    /// concurrent callers end up with the same conversation.
    #[default]
    Deterministic,
    /// Random id and unconditional create. Two concurrent callers for the same
    /// pair can both create a conversation.
    Scan,
}

impl FromStr for ChatIdStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "deterministic" => Ok(ChatIdStrategy::Deterministic),
            "scan" => Ok(ChatIdStrategy::Scan),
            other => Err(format!("unknown chat id strategy '{other}'")),
        }
    }
}

/// The id a direct conversation between `a` and `b` gets under
/// [`ChatIdStrategy::Deterministic`]. Symmetric in its arguments.
pub fn direct_chat_id(a: Uuid, b: Uuid) -> Uuid {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    let mut name = [0u8; 32];
    name[..16].copy_from_slice(low.as_bytes());
    name[16..].copy_from_slice(high.as_bytes());
    Uuid::new_v5(&DIRECT_CHAT_NAMESPACE, &name)
}

pub struct ChatService {
    chats: Arc<dyn ConversationStore>,
    messages: Arc<dyn MessageStore>,
    strategy: ChatIdStrategy,
}

impl ChatService {
    pub fn new(
        chats: Arc<dyn ConversationStore>,
        messages: Arc<dyn MessageStore>,
        strategy: ChatIdStrategy,
    ) -> Self {
        ChatService {
            chats,
            messages,
            strategy,
        }
    }

    /// Returns the direct conversation between the two users, creating it if needed.
    pub async fn get_or_create_chat(&self, current: Uuid, other: Uuid) -> Result<Uuid> {
        if current == other {
            return Err(Error::invalid("Cannot chat with yourself"));
        }

        let existing = self
            .chats
            .list_for_member(current)
            .await?
            .into_iter()
            .find(|chat| !chat.is_group && chat.is_member(&other));
        if let Some(chat) = existing {
            return Ok(chat.id);
        }

        let id = match self.strategy {
            ChatIdStrategy::Deterministic => {
                let id = direct_chat_id(current, other);
                if self
                    .chats
                    .create_if_absent(Conversation::direct(id, current, other))
                    .await?
                {
                    log::info!("Created direct chat {id} between {current} and {other}");
                }
                id
            }
            ChatIdStrategy::Scan => {
                let id = self
                    .chats
                    .create(Conversation::direct(Uuid::new_v4(), current, other))
                    .await?;
                log::info!("Created direct chat {id} between {current} and {other}");
                id
            }
        };
        Ok(id)
    }

    pub async fn create_group_chat(
        &self,
        creator: Uuid,
        name: &str,
        members: &[Uuid],
    ) -> Result<Uuid> {
        let mut all = vec![creator];
        for member in members {
            if !all.contains(member) {
                all.push(*member);
            }
        }
        if all.len() < 2 {
            return Err(Error::invalid("A group needs at least two members"));
        }

        let name = Some(name.trim().to_string()).filter(|n| !n.is_empty());
        let id = self
            .chats
            .create(Conversation::group(Uuid::new_v4(), name, all))
            .await?;
        log::info!("Created group chat {id}");
        Ok(id)
    }

    /// Stores a message and updates the chat's preview and unread counters.
    pub async fn send_message(
        &self,
        chat_id: Uuid,
        sender: Uuid,
        draft: MessageDraft,
    ) -> Result<Message> {
        let draft = draft
            .normalized()
            .ok_or_else(|| Error::invalid("Message is empty"))?;
        let chat = self
            .chats
            .get(chat_id)
            .await?
            .ok_or_else(|| Error::invalid(format!("Chat {chat_id} does not exist")))?;
        if !chat.is_member(&sender) {
            return Err(Error::invalid("You are not a member of this chat"));
        }

        let message = self.messages.create(chat_id, sender, draft).await?;

        let attachment_kind = message.attachments.first().map(|a| a.kind);
        let text = match (&message.content, attachment_kind) {
            (Some(content), _) => content.clone(),
            (None, Some(kind)) => kind.preview_label().to_string(),
            (None, None) => String::new(),
        };
        let patch = ConversationPatch {
            last_message_preview: Some(MessagePreview {
                text,
                sender_id: sender,
                created_at: message.created_at,
                attachment_kind,
            }),
            updated_at: Some(Utc::now().max(message.created_at)),
            unread: chat
                .members
                .iter()
                .filter(|member| **member != sender)
                .map(|member| (*member, CounterOp::Increment(1)))
                .collect(),
        };
        self.chats.update(chat_id, patch).await?;

        log::debug!("Sent message {} to chat {chat_id}", message.id);
        Ok(message)
    }

    pub async fn send_current(
        &self,
        identity: &dyn IdentityProvider,
        chat_id: Uuid,
        draft: MessageDraft,
    ) -> Result<Message> {
        let sender = identity.current_user_id().ok_or(Error::Unauthenticated)?;
        self.send_message(chat_id, sender, draft).await
    }
}
