use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub about: Option<String>,
    pub avatar_url: Option<String>,
    pub is_online: bool,
    pub last_seen: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        let now = Utc::now();
        User {
            id: Uuid::new_v4(),
            name: name.into(),
            email: email.into(),
            about: None,
            avatar_url: None,
            is_online: false,
            last_seen: now,
            created_at: now,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Image,
    Video,
    Audio,
    File,
    Location,
    Sticker,
}

impl AttachmentKind {
    /// Text shown in the chat list for a message with no text content.
    pub fn preview_label(self) -> &'static str {
        match self {
            AttachmentKind::Image => "📷 Photo",
            AttachmentKind::Video => "🎥 Video",
            AttachmentKind::Audio => "🎤 Audio",
            AttachmentKind::File => "📎 File",
            AttachmentKind::Location => "📍 Location",
            AttachmentKind::Sticker => "Sticker",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Attachment {
    pub id: String,
    pub url: String,
    pub thumbnail_url: Option<String>,
    pub kind: AttachmentKind,
    pub size: Option<u64>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct MessagePreview {
    pub text: String,
    pub sender_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub attachment_kind: Option<AttachmentKind>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Conversation {
    pub id: Uuid,
    pub members: Vec<Uuid>,
    pub is_group: bool,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
    pub last_message_preview: Option<MessagePreview>,
    pub unread_counts: BTreeMap<Uuid, u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn direct(id: Uuid, a: Uuid, b: Uuid) -> Self {
        let now = Utc::now();
        Conversation {
            id,
            members: vec![a, b],
            is_group: false,
            name: None,
            avatar_url: None,
            last_message_preview: None,
            unread_counts: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn group(id: Uuid, name: Option<String>, members: Vec<Uuid>) -> Self {
        let now = Utc::now();
        Conversation {
            id,
            members,
            is_group: true,
            name,
            avatar_url: None,
            last_message_preview: None,
            unread_counts: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_member(&self, user_id: &Uuid) -> bool {
        self.members.contains(user_id)
    }

    pub fn unread_for(&self, user_id: &Uuid) -> u32 {
        self.unread_counts.get(user_id).copied().unwrap_or(0)
    }

    /// The other member of a direct conversation.
    pub fn peer_of(&self, user_id: &Uuid) -> Option<Uuid> {
        if self.is_group {
            return None;
        }
        self.members.iter().find(|id| *id != user_id).copied()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
    pub id: Uuid,
    pub chat_id: Uuid,
    pub sender_id: Uuid,
    pub content: Option<String>,
    pub attachments: Vec<Attachment>,
    pub created_at: DateTime<Utc>,
    pub delivered_to: BTreeSet<Uuid>,
    pub read_by: BTreeMap<Uuid, DateTime<Utc>>,
}

impl Message {
    pub fn is_delivered_to(&self, user_id: &Uuid) -> bool {
        self.delivered_to.contains(user_id)
    }

    pub fn is_read_by(&self, user_id: &Uuid) -> bool {
        self.read_by.contains_key(user_id)
    }
}

/// A message as submitted by its sender, before the store assigns id and time.
#[derive(Clone, Debug, Default)]
pub struct MessageDraft {
    pub content: Option<String>,
    pub attachments: Vec<Attachment>,
}

impl MessageDraft {
    pub fn text(content: impl Into<String>) -> Self {
        MessageDraft {
            content: Some(content.into()),
            attachments: vec![],
        }
    }

    pub fn attachment(attachment: Attachment) -> Self {
        MessageDraft {
            content: None,
            attachments: vec![attachment],
        }
    }

    /// Trims the text and drops it when blank. Returns `None` for an empty draft.
    pub fn normalized(self) -> Option<Self> {
        let content = self
            .content
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());
        if content.is_none() && self.attachments.is_empty() {
            return None;
        }
        Some(MessageDraft {
            content,
            attachments: self.attachments,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum MessagePatch {
    /// Set union into `delivered_to`.
    DeliverTo(Uuid),
    /// Map assignment into `read_by`.
    ReadBy(Uuid, DateTime<Utc>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CounterOp {
    Reset,
    Increment(u32),
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConversationPatch {
    pub last_message_preview: Option<MessagePreview>,
    pub updated_at: Option<DateTime<Utc>>,
    pub unread: Vec<(Uuid, CounterOp)>,
}

impl ConversationPatch {
    pub fn reset_unread(user_id: Uuid) -> Self {
        ConversationPatch {
            unread: vec![(user_id, CounterOp::Reset)],
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.last_message_preview.is_none() && self.updated_at.is_none() && self.unread.is_empty()
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Everyone,
    Contacts,
    CloseContacts,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StatusItem {
    pub id: Uuid,
    pub user_id: Uuid,
    pub media_url: String,
    pub public_id: String,
    pub thumbnail_url: String,
    pub caption: String,
    pub visibility: Visibility,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub viewers: BTreeSet<Uuid>,
}

impl StatusItem {
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct UploadedMedia {
    pub url: String,
    pub id: String,
    pub size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_draft_normalization() {
        let draft = MessageDraft::text("  hello  ").normalized().unwrap();
        assert_eq!(draft.content.as_deref(), Some("hello"));

        assert!(MessageDraft::text("   ").normalized().is_none());
        assert!(MessageDraft::default().normalized().is_none());

        let photo = Attachment {
            id: "a1".to_string(),
            url: "file:///a1".to_string(),
            thumbnail_url: None,
            kind: AttachmentKind::Image,
            size: Some(3),
        };
        let draft = MessageDraft {
            content: Some(" ".to_string()),
            attachments: vec![photo],
        }
        .normalized()
        .unwrap();
        assert!(draft.content.is_none());
        assert_eq!(draft.attachments.len(), 1);
    }

    #[test]
    fn test_peer_of_direct_chat() {
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let mut chat = Conversation::direct(Uuid::new_v4(), alice, bob);
        assert_eq!(chat.peer_of(&alice), Some(bob));
        assert_eq!(chat.peer_of(&bob), Some(alice));

        chat.is_group = true;
        assert_eq!(chat.peer_of(&alice), None);
    }
}
