use crate::error::{Error, Result};
use crate::store::{IdentityProvider, UserStore};
use chrono::Utc;
use tokio::sync::watch;
use uuid::Uuid;

/// Who is signed in on this client.
///
/// Every component that needs the local user receives a `Session` (or any
/// other [`IdentityProvider`]) explicitly. Watchers observe changes through
/// [`IdentityProvider::watch`] and stop when the user changes.
pub struct Session {
    current: watch::Sender<Option<Uuid>>,
}

impl Default for Session {
    fn default() -> Self {
        let (current, _) = watch::channel(None);
        Session { current }
    }
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the user online and makes them the current user. A different
    /// user signed in before is marked offline.
    pub async fn sign_in(&self, users: &dyn UserStore, user_id: Uuid) -> Result<()> {
        if users.get(user_id).await?.is_none() {
            return Err(Error::invalid(format!("unknown user {user_id}")));
        }
        let now = Utc::now();
        if let Some(previous) = self.current_user_id().filter(|prev| *prev != user_id) {
            users.set_presence(previous, false, now).await?;
            log::info!("Signed out {previous}");
        }
        users.set_presence(user_id, true, now).await?;
        self.current.send_replace(Some(user_id));
        log::info!("Signed in as {user_id}");
        Ok(())
    }

    /// Clears the current user, then records them as offline.
    pub async fn sign_out(&self, users: &dyn UserStore) -> Result<()> {
        let Some(user_id) = self.current.send_replace(None) else {
            return Err(Error::Unauthenticated);
        };
        log::info!("Signed out {user_id}");
        users.set_presence(user_id, false, Utc::now()).await?;
        Ok(())
    }

    pub fn require_user(&self) -> Result<Uuid> {
        self.current_user_id().ok_or(Error::Unauthenticated)
    }
}

impl IdentityProvider for Session {
    fn current_user_id(&self) -> Option<Uuid> {
        *self.current.borrow()
    }

    fn watch(&self) -> watch::Receiver<Option<Uuid>> {
        self.current.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::User;
    use crate::storage::Storage;

    #[tokio::test]
    async fn test_sign_in_and_out_tracks_presence() {
        let storage = Storage::open_in_memory().unwrap();
        let alice = User::new("alice", "alice@example.com");
        storage.upsert(&alice).await.unwrap();

        let session = Session::new();
        assert!(session.current_user_id().is_none());
        assert!(matches!(session.require_user(), Err(Error::Unauthenticated)));

        let mut watcher = session.watch();
        session.sign_in(&storage, alice.id).await.unwrap();
        assert_eq!(session.current_user_id(), Some(alice.id));
        assert!(watcher.has_changed().unwrap());
        assert_eq!(*watcher.borrow_and_update(), Some(alice.id));
        assert!(storage.get(alice.id).await.unwrap().unwrap().is_online);

        session.sign_out(&storage).await.unwrap();
        assert!(session.current_user_id().is_none());
        assert!(!storage.get(alice.id).await.unwrap().unwrap().is_online);
    }

    #[tokio::test]
    async fn test_switching_user_marks_previous_offline() {
        let storage = Storage::open_in_memory().unwrap();
        let alice = User::new("alice", "alice@example.com");
        let bob = User::new("bob", "bob@example.com");
        storage.upsert(&alice).await.unwrap();
        storage.upsert(&bob).await.unwrap();

        let session = Session::new();
        session.sign_in(&storage, alice.id).await.unwrap();
        session.sign_in(&storage, bob.id).await.unwrap();
        assert_eq!(session.current_user_id(), Some(bob.id));
        assert!(!storage.get(alice.id).await.unwrap().unwrap().is_online);
        assert!(storage.get(bob.id).await.unwrap().unwrap().is_online);

        // Signing in again as the same user keeps them online
        session.sign_in(&storage, bob.id).await.unwrap();
        assert!(storage.get(bob.id).await.unwrap().unwrap().is_online);

        session.sign_out(&storage).await.unwrap();
        assert!(!storage.get(alice.id).await.unwrap().unwrap().is_online);
        assert!(!storage.get(bob.id).await.unwrap().unwrap().is_online);
    }

    #[tokio::test]
    async fn test_sign_in_unknown_user() {
        let storage = Storage::open_in_memory().unwrap();
        let session = Session::new();
        let result = session.sign_in(&storage, Uuid::new_v4()).await;
        assert!(matches!(result, Err(Error::InvalidOperation(_))));
        assert!(session.current_user_id().is_none());
    }

    #[tokio::test]
    async fn test_sign_out_without_user() {
        let storage = Storage::open_in_memory().unwrap();
        let session = Session::new();
        assert!(matches!(
            session.sign_out(&storage).await,
            Err(Error::Unauthenticated)
        ));
    }
}
