use std::{sync::Arc, time::Duration};

use shared::domain::ConversationId;
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{error::ClientError, gateway::RequestGateway, transport::ApiRequest};

struct Pending {
    conversation_id: ConversationId,
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Slot {
    pending: Option<Pending>,
    generation: u64,
}

/// Single-slot debouncer. Each trigger replaces the pending acknowledgement;
/// only a full quiet period without triggers sends one.
pub struct ReadReceiptDebouncer {
    gateway: Arc<RequestGateway>,
    quiet_period: Duration,
    slot: Arc<Mutex<Slot>>,
}

impl ReadReceiptDebouncer {
    pub fn new(gateway: Arc<RequestGateway>, quiet_period: Duration) -> Self {
        Self {
            gateway,
            quiet_period,
            slot: Arc::new(Mutex::new(Slot::default())),
        }
    }

    pub fn quiet_period(&self) -> Duration {
        self.quiet_period
    }

    pub async fn trigger(&self, conversation_id: ConversationId) {
        let mut slot = self.slot.lock().await;
        if let Some(previous) = slot.pending.take() {
            previous.handle.abort();
        }
        slot.generation += 1;
        let generation = slot.generation;

        let epoch = self.gateway.session_epoch();
        let gateway = Arc::clone(&self.gateway);
        let shared = Arc::clone(&self.slot);
        let quiet_period = self.quiet_period;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(quiet_period).await;
            {
                let mut slot = shared.lock().await;
                let current = slot
                    .pending
                    .as_ref()
                    .is_some_and(|pending| pending.generation == generation);
                if !current {
                    return;
                }
                slot.pending = None;
            }
            if !gateway.is_current(epoch) {
                debug!(conversation_id = conversation_id.0, "read: session changed; dropping acknowledgement");
                return;
            }
            info!(conversation_id = conversation_id.0, "read: quiet period elapsed; acknowledging");
            if let Err(err) = acknowledge(&gateway, conversation_id).await {
                warn!(conversation_id = conversation_id.0, "read: acknowledgement failed: {err}");
            }
        });

        slot.pending = Some(Pending {
            conversation_id,
            generation,
            handle,
        });
    }

    pub async fn cancel(&self) -> Option<ConversationId> {
        let pending = self.slot.lock().await.pending.take()?;
        pending.handle.abort();
        debug!(conversation_id = pending.conversation_id.0, "read: pending acknowledgement cancelled");
        Some(pending.conversation_id)
    }

    pub async fn pending(&self) -> Option<ConversationId> {
        self.slot
            .lock()
            .await
            .pending
            .as_ref()
            .map(|pending| pending.conversation_id)
    }

    pub async fn acknowledge_now(&self, conversation_id: ConversationId) -> Result<(), ClientError> {
        acknowledge(&self.gateway, conversation_id).await
    }
}

async fn acknowledge(
    gateway: &Arc<RequestGateway>,
    conversation_id: ConversationId,
) -> Result<(), ClientError> {
    gateway
        .send_unit(ApiRequest::post(format!("/conversations/{conversation_id}/read")))
        .await
}
