use crate::models::{Conversation, User};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum EntryTarget {
    /// An existing conversation.
    Chat(Uuid),
    /// A user without a direct conversation yet; selecting them starts one.
    User(Uuid),
}

/// One row of the chat list.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatListEntry {
    pub target: EntryTarget,
    pub name: String,
    pub avatar_url: Option<String>,
    pub last_message: String,
    pub last_message_at: Option<DateTime<Utc>>,
    pub unread_count: u32,
    /// Presence of the other member; `None` for groups and unknown users.
    pub is_online: Option<bool>,
}

/// Merges `me`'s conversations with the user directory into one sorted list.
pub fn build_entries(me: Uuid, chats: &[Conversation], users: &[User]) -> Vec<ChatListEntry> {
    let profiles: HashMap<Uuid, &User> = users.iter().map(|u| (u.id, u)).collect();
    let mut users_with_chats = HashSet::new();
    let mut entries = Vec::with_capacity(chats.len() + users.len());

    for chat in chats.iter().filter(|c| c.is_member(&me)) {
        let preview = chat.last_message_preview.as_ref();
        let last_message = preview
            .map(|p| p.text.clone())
            .unwrap_or_else(|| "No messages yet".to_string());
        let last_message_at = preview.map(|p| p.created_at);
        let unread_count = chat.unread_for(&me);

        if chat.is_group {
            entries.push(ChatListEntry {
                target: EntryTarget::Chat(chat.id),
                name: chat.name.clone().unwrap_or_else(|| "Group Chat".to_string()),
                avatar_url: chat.avatar_url.clone(),
                last_message,
                last_message_at,
                unread_count,
                is_online: None,
            });
            continue;
        }

        let Some(peer) = chat.peer_of(&me) else {
            continue;
        };
        users_with_chats.insert(peer);
        let profile = profiles.get(&peer);
        entries.push(ChatListEntry {
            target: EntryTarget::Chat(chat.id),
            name: profile
                .map(|u| u.name.clone())
                .unwrap_or_else(|| peer.to_string()),
            avatar_url: profile.and_then(|u| u.avatar_url.clone()),
            last_message,
            last_message_at,
            unread_count,
            is_online: profile.map(|u| u.is_online),
        });
    }

    for user in users {
        if user.id == me || users_with_chats.contains(&user.id) {
            continue;
        }
        entries.push(ChatListEntry {
            target: EntryTarget::User(user.id),
            name: user.name.clone(),
            avatar_url: user.avatar_url.clone(),
            last_message: user
                .about
                .clone()
                .unwrap_or_else(|| "Click to start chatting".to_string()),
            last_message_at: None,
            unread_count: 0,
            is_online: Some(user.is_online),
        });
    }

    entries.sort_by(compare_entries);
    entries
}

fn compare_entries(a: &ChatListEntry, b: &ChatListEntry) -> Ordering {
    match (&a.target, &b.target) {
        (EntryTarget::Chat(_), EntryTarget::User(_)) => Ordering::Less,
        (EntryTarget::User(_), EntryTarget::Chat(_)) => Ordering::Greater,
        (EntryTarget::Chat(_), EntryTarget::Chat(_)) => {
            match (a.last_message_at, b.last_message_at) {
                (Some(a), Some(b)) => b.cmp(&a),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
        }
        (EntryTarget::User(_), EntryTarget::User(_)) => a.name.cmp(&b.name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessagePreview;
    use chrono::Duration;

    fn user(name: &str, online: bool) -> User {
        let mut user = User::new(name, format!("{name}@example.com"));
        user.is_online = online;
        user
    }

    fn with_preview(mut chat: Conversation, text: &str, at: DateTime<Utc>) -> Conversation {
        chat.last_message_preview = Some(MessagePreview {
            text: text.to_string(),
            sender_id: chat.members[1],
            created_at: at,
            attachment_kind: None,
        });
        chat
    }

    #[test]
    fn test_ordering_and_fallbacks() {
        let me = user("me", true);
        let bob = user("bob", true);
        let carol = user("carol", false);
        let dave = user("dave", false);
        let alice = user("alice", false);
        let now = Utc::now();

        let older = with_preview(
            Conversation::direct(Uuid::new_v4(), me.id, bob.id),
            "old news",
            now - Duration::minutes(5),
        );
        let mut newer = with_preview(
            Conversation::direct(Uuid::new_v4(), me.id, carol.id),
            "fresh",
            now,
        );
        newer.unread_counts.insert(me.id, 4);
        let mut group = Conversation::group(Uuid::new_v4(), None, vec![me.id, bob.id, carol.id]);
        group.unread_counts.insert(bob.id, 9);
        let not_mine = Conversation::direct(Uuid::new_v4(), bob.id, carol.id);

        let users = vec![me.clone(), bob.clone(), carol.clone(), dave.clone(), alice.clone()];
        let entries = build_entries(me.id, &[older.clone(), group.clone(), newer.clone(), not_mine], &users);

        let targets: Vec<_> = entries.iter().map(|e| e.target.clone()).collect();
        assert_eq!(
            targets,
            vec![
                EntryTarget::Chat(newer.id),
                EntryTarget::Chat(older.id),
                EntryTarget::Chat(group.id),
                EntryTarget::User(alice.id),
                EntryTarget::User(dave.id),
            ]
        );

        assert_eq!(entries[0].name, "carol");
        assert_eq!(entries[0].unread_count, 4);
        assert_eq!(entries[0].is_online, Some(false));
        assert_eq!(entries[1].name, "bob");
        assert_eq!(entries[1].unread_count, 0);
        assert_eq!(entries[2].name, "Group Chat");
        assert_eq!(entries[2].last_message, "No messages yet");
        assert_eq!(entries[2].unread_count, 0);
        assert_eq!(entries[2].is_online, None);
        assert_eq!(entries[3].last_message, "Click to start chatting");
    }

    #[test]
    fn test_unknown_peer_uses_id() {
        let me = Uuid::new_v4();
        let stranger = Uuid::new_v4();
        let chat = Conversation::direct(Uuid::new_v4(), me, stranger);

        let entries = build_entries(me, &[chat], &[]);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, stranger.to_string());
        assert_eq!(entries[0].is_online, None);
    }

    #[test]
    fn test_about_text_for_users_without_chat() {
        let me = Uuid::new_v4();
        let mut erin = user("erin", true);
        erin.about = Some("Hey there!".to_string());

        let entries = build_entries(me, &[], &[erin]);
        assert_eq!(entries[0].last_message, "Hey there!");
        assert_eq!(entries[0].is_online, Some(true));
    }
}
