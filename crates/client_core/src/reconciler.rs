use std::sync::Arc;

use futures::{pin_mut, Stream, StreamExt};
use shared::{domain::MessageKind, protocol::PushEvent};
use tracing::{debug, info, warn};

use crate::{
    conversations::{ConversationEvent, ConversationStore},
    error::ClientError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Applied,
    Duplicate,
    /// Unknown conversation; the catalog was re-fetched instead.
    Resynced,
    Dropped,
}

pub struct EventReconciler {
    store: Arc<ConversationStore>,
}

impl EventReconciler {
    pub fn new(store: Arc<ConversationStore>) -> Self {
        Self { store }
    }

    pub async fn run<S>(&self, frames: S)
    where
        S: Stream<Item = String>,
    {
        pin_mut!(frames);
        while let Some(raw) = frames.next().await {
            self.handle_raw(&raw).await;
        }
        info!("push: event stream ended");
    }

    pub async fn handle_raw(&self, raw: &str) -> ReconcileOutcome {
        let event = match serde_json::from_str::<PushEvent>(raw) {
            Ok(event) => event,
            Err(err) => {
                warn!("push: dropping malformed payload: {err}");
                return ReconcileOutcome::Dropped;
            }
        };
        let conversation_id = event.message.conversation_id;
        match self.apply(event).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(conversation_id = conversation_id.0, "push: event not applied: {err}");
                ReconcileOutcome::Dropped
            }
        }
    }

    pub async fn apply(&self, event: PushEvent) -> Result<ReconcileOutcome, ClientError> {
        if !self.store.gateway().is_logged_in().await {
            debug!("push: no session; dropping event");
            return Ok(ReconcileOutcome::Dropped);
        }

        let id = event.message.conversation_id;
        let kind = event.message.kind;
        let mut state = self.store.lock_state().await;
        if !state.conversations.contains_key(&id) {
            drop(state);
            info!(conversation_id = id.0, ?kind, "push: unknown conversation; resynchronizing catalog");
            self.store.fetch_catalog().await?;
            return Ok(ReconcileOutcome::Resynced);
        }
        let is_active = state.active == Some(id);
        let Some(conversation) = state.conversations.get_mut(&id) else {
            return Ok(ReconcileOutcome::Dropped);
        };

        let mut notify = Vec::new();
        let mut acknowledge = false;
        match kind {
            MessageKind::MemberAdded => {
                if conversation.add_members(event.members.unwrap_or_default()) {
                    notify.push(ConversationEvent::ConversationUpdated(id));
                }
            }
            MessageKind::MemberRemoved => {
                let removed = event.removed_member_ids.unwrap_or_default();
                if conversation.remove_members(&removed) {
                    notify.push(ConversationEvent::ConversationUpdated(id));
                }
            }
            MessageKind::GroupUpdated => {
                if let Some(name) = event.name {
                    conversation.name = name;
                }
                if let Some(image_url) = event.image_url {
                    conversation.image_url = Some(image_url);
                }
                if let Some(muted) = event.muted {
                    conversation.muted = muted;
                }
                notify.push(ConversationEvent::ConversationUpdated(id));
            }
            MessageKind::Chat | MessageKind::System => {
                let message = event.message;
                if conversation.has_message(&message) {
                    return Ok(ReconcileOutcome::Duplicate);
                }
                if kind == MessageKind::Chat {
                    conversation.note_last_message(&message);
                }
                conversation.insert_message(message);
                notify.push(ConversationEvent::MessagesChanged(id));

                if is_active {
                    acknowledge = true;
                } else if kind == MessageKind::Chat {
                    conversation.unread_count = conversation.unread_count.saturating_add(1);
                }
                if kind == MessageKind::Chat {
                    notify.push(ConversationEvent::ConversationUpdated(id));
                }
            }
        }
        // Armed under the state lock so a concurrent switch cancels it.
        if acknowledge {
            self.store.receipts().trigger(id).await;
        }
        drop(state);

        for change in notify {
            self.store.emit(change);
        }
        Ok(ReconcileOutcome::Applied)
    }
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;
