//! Delivery and read receipts for the conversation the user has open.
//!
//! A reconciliation cycle looks at every inbound message (sent by someone
//! else), marks it delivered to and read by the local user where that is not
//! yet recorded, and zeroes the local user's unread counter when it had
//! anything to mark. Every write is a set union, a map assignment, or a reset
//! to zero, so cycles may repeat or race with other devices freely.
//!
//! [`ReceiptWatcher`] repeats the cycle on a fixed interval for as long as the
//! conversation stays open.

use crate::error::{Error, Result, StoreError};
use crate::models::{ConversationPatch, MessagePatch};
use crate::store::{ConversationStore, IdentityProvider, MessageStore};
use chrono::Utc;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Outcome of one reconciliation cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Inbound messages fetched.
    pub inspected: usize,
    /// Successful delivery markings.
    pub delivered: usize,
    /// Successful read markings.
    pub read: usize,
    /// Marking writes that failed and will be retried next cycle.
    pub failed: usize,
    /// Whether the local user's unread counter was set back to zero.
    pub unread_reset: bool,
}

impl CycleReport {
    pub fn scheduled(&self) -> usize {
        self.delivered + self.read + self.failed
    }
}

enum Marking {
    Delivered,
    Read,
}

pub struct ReceiptReconciler {
    messages: Arc<dyn MessageStore>,
    chats: Arc<dyn ConversationStore>,
}

impl ReceiptReconciler {
    pub fn new(messages: Arc<dyn MessageStore>, chats: Arc<dyn ConversationStore>) -> Self {
        ReceiptReconciler { messages, chats }
    }

    /// Runs one cycle for whoever is signed in.
    pub async fn reconcile_current(
        &self,
        identity: &dyn IdentityProvider,
        chat_id: Uuid,
    ) -> Result<CycleReport> {
        let user_id = identity.current_user_id().ok_or(Error::Unauthenticated)?;
        self.reconcile(chat_id, user_id).await
    }

    pub async fn reconcile(&self, chat_id: Uuid, user_id: Uuid) -> Result<CycleReport> {
        self.reconcile_while(chat_id, user_id, || true).await
    }

    /// Runs one cycle, issuing writes only while `is_active()` holds.
    ///
    /// Writes already started when `is_active()` turns false still complete,
    /// but nothing further is issued, including the unread reset.
    pub async fn reconcile_while(
        &self,
        chat_id: Uuid,
        user_id: Uuid,
        is_active: impl Fn() -> bool,
    ) -> Result<CycleReport> {
        let chat = self
            .chats
            .get(chat_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("chat {chat_id}")))?;
        if !chat.is_member(&user_id) {
            return Err(Error::invalid(format!("{user_id} is not a member of chat {chat_id}")));
        }

        let inbound = self.messages.inbound(chat_id, user_id).await?;
        let mut report = CycleReport {
            inspected: inbound.len(),
            ..Default::default()
        };

        let now = Utc::now();
        let mut writes = Vec::new();
        for message in &inbound {
            if !message.is_delivered_to(&user_id) {
                writes.push((
                    Marking::Delivered,
                    message.id,
                    self.messages
                        .update(chat_id, message.id, MessagePatch::DeliverTo(user_id)),
                ));
            }
            if !message.is_read_by(&user_id) {
                writes.push((
                    Marking::Read,
                    message.id,
                    self.messages
                        .update(chat_id, message.id, MessagePatch::ReadBy(user_id, now)),
                ));
            }
        }

        if writes.is_empty() {
            log::debug!("Chat {chat_id}: {} inbound messages, nothing to mark", report.inspected);
            return Ok(report);
        }
        if !is_active() {
            log::debug!("Chat {chat_id}: closed before marking, skipping {} writes", writes.len());
            return Ok(report);
        }

        let (kinds, futures): (Vec<_>, Vec<_>) = writes
            .into_iter()
            .map(|(kind, message_id, write)| ((kind, message_id), write))
            .unzip();
        let results = join_all(futures).await;

        for ((kind, message_id), result) in kinds.into_iter().zip(results) {
            match result {
                Ok(()) => match kind {
                    Marking::Delivered => report.delivered += 1,
                    Marking::Read => report.read += 1,
                },
                Err(e) => {
                    log::warn!("Chat {chat_id}: failed to mark message {message_id}: {e}");
                    report.failed += 1;
                }
            }
        }

        if !is_active() {
            log::debug!("Chat {chat_id}: closed during marking, leaving unread counter");
            return Ok(report);
        }

        self.chats
            .update(chat_id, ConversationPatch::reset_unread(user_id))
            .await?;
        report.unread_reset = true;

        log::debug!(
            "Chat {chat_id}: marked {} delivered, {} read, {} failed",
            report.delivered,
            report.read,
            report.failed
        );
        Ok(report)
    }
}

/// Keeps receipts current for one open conversation.
///
/// Runs a cycle right away and then every `interval`. Stops on [`stop`](Self::stop),
/// on drop, or as soon as the signed-in user changes.
pub struct ReceiptWatcher {
    chat_id: Uuid,
    shutdown: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl ReceiptWatcher {
    pub fn start(
        reconciler: Arc<ReceiptReconciler>,
        identity: &dyn IdentityProvider,
        chat_id: Uuid,
        interval: Duration,
    ) -> Result<Self> {
        let mut identity_rx = identity.watch();
        let user_id = (*identity_rx.borrow_and_update()).ok_or(Error::Unauthenticated)?;
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        log::info!("Watching receipts for chat {chat_id} as {user_id} every {interval:?}");

        let handle = tokio::spawn(async move {
            let lease = Lease {
                user_id,
                shutdown: shutdown_rx.clone(),
                identity: identity_rx.clone(),
            };

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || lease.is_cancelled() {
                            break;
                        }
                    }
                    changed = identity_rx.changed() => {
                        if changed.is_err() || lease.is_cancelled() {
                            log::info!("Signed-in user changed, stop watching chat {chat_id}");
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if lease.is_cancelled() {
                            break;
                        }
                        match reconciler
                            .reconcile_while(chat_id, user_id, || !lease.is_cancelled())
                            .await
                        {
                            Ok(report) if report.scheduled() > 0 => {
                                log::info!(
                                    "Chat {chat_id}: {} delivered, {} read, {} failed",
                                    report.delivered,
                                    report.read,
                                    report.failed
                                );
                            }
                            Ok(_) => {}
                            Err(e) if e.is_retryable() => {
                                log::warn!("Receipt cycle for chat {chat_id} failed, will retry: {e}");
                            }
                            Err(e) => {
                                log::error!("Receipt cycle for chat {chat_id} failed: {e}");
                                break;
                            }
                        }
                    }
                }
            }

            log::info!("Stopped watching receipts for chat {chat_id}");
        });

        Ok(ReceiptWatcher {
            chat_id,
            shutdown,
            handle: Some(handle),
        })
    }

    /// Stops the loop and waits for any cycle in progress to wind down.
    pub async fn stop(mut self) {
        self.shutdown.send_replace(true);
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                log::error!("Receipt watcher for chat {} panicked: {e}", self.chat_id);
            }
        }
    }
}

impl Drop for ReceiptWatcher {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

struct Lease {
    user_id: Uuid,
    shutdown: watch::Receiver<bool>,
    identity: watch::Receiver<Option<Uuid>>,
}

impl Lease {
    fn is_cancelled(&self) -> bool {
        *self.shutdown.borrow() || *self.identity.borrow() != Some(self.user_id)
    }
}
