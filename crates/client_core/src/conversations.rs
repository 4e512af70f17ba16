use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Weak},
};

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, Member, UserId},
    protocol::{
        AddMembersRequest, ConversationSummary, CreateConversationRequest, MessagePayload,
        SendMessageRequest, SetAdminRequest, SetMutedRequest, UpdateConversationRequest,
    },
};
use tokio::{
    sync::{broadcast, Mutex, MutexGuard},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    config::ClientSettings,
    durable::DurableState,
    error::ClientError,
    gateway::{RequestGateway, SessionEvent},
    paginator::{merge_older_page, replace_window, revoked_on_access_loss, HistoryPaginator},
    read_receipts::ReadReceiptDebouncer,
    transport::ApiRequest,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    pub id: ConversationId,
    pub name: String,
    pub image_url: Option<String>,
    pub members: Vec<Member>,
    /// Ascending by timestamp; ties keep arrival order.
    pub messages: Vec<MessagePayload>,
    pub last_message: Option<String>,
    pub last_message_time: Option<DateTime<Utc>>,
    pub unread_count: u32,
    pub page: u32,
    pub has_more: bool,
    pub muted: bool,
}

impl Conversation {
    pub fn from_summary(summary: ConversationSummary) -> Self {
        Self {
            id: summary.id,
            name: summary.name,
            image_url: summary.image_url,
            members: summary.members,
            messages: Vec::new(),
            last_message: summary.last_message,
            last_message_time: summary.last_message_time,
            unread_count: summary.unread_count,
            page: 0,
            has_more: true,
            muted: summary.muted,
        }
    }

    pub fn apply_summary(&mut self, summary: ConversationSummary) {
        self.name = summary.name;
        self.image_url = summary.image_url;
        self.members = summary.members;
        self.last_message = summary.last_message;
        self.last_message_time = summary.last_message_time;
        self.muted = summary.muted;
    }

    pub fn add_members(&mut self, members: impl IntoIterator<Item = Member>) -> bool {
        let mut known: HashSet<UserId> = self.members.iter().map(|member| member.id).collect();
        let before = self.members.len();
        for member in members {
            if known.insert(member.id) {
                self.members.push(member);
            }
        }
        self.members.len() != before
    }

    pub fn remove_members(&mut self, removed: &[UserId]) -> bool {
        let before = self.members.len();
        self.members.retain(|member| !removed.contains(&member.id));
        self.members.len() != before
    }

    pub fn has_message(&self, message: &MessagePayload) -> bool {
        self.messages.iter().any(|held| held.id == message.id)
    }

    /// Inserts after every message with a timestamp not later than this one.
    /// Returns `false` for an id already in the window.
    pub fn insert_message(&mut self, message: MessagePayload) -> bool {
        if self.has_message(&message) {
            return false;
        }
        let at = self
            .messages
            .partition_point(|held| held.timestamp <= message.timestamp);
        self.messages.insert(at, message);
        true
    }

    pub fn note_last_message(&mut self, message: &MessagePayload) {
        if self
            .last_message_time
            .is_some_and(|current| current > message.timestamp)
        {
            return;
        }
        self.last_message = Some(message.content.clone());
        self.last_message_time = Some(message.timestamp);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationEvent {
    CatalogReplaced,
    ConversationUpdated(ConversationId),
    ConversationRemoved(ConversationId),
    MessagesChanged(ConversationId),
    ActiveChanged(Option<ConversationId>),
}

#[derive(Default)]
pub(crate) struct StoreState {
    pub(crate) conversations: HashMap<ConversationId, Conversation>,
    pub(crate) active: Option<ConversationId>,
}

pub struct ConversationStore {
    gateway: Arc<RequestGateway>,
    durable: Arc<dyn DurableState>,
    paginator: HistoryPaginator,
    receipts: ReadReceiptDebouncer,
    state: Mutex<StoreState>,
    events: broadcast::Sender<ConversationEvent>,
}

impl ConversationStore {
    pub fn new(
        gateway: Arc<RequestGateway>,
        durable: Arc<dyn DurableState>,
        settings: &ClientSettings,
    ) -> Result<Arc<Self>, ClientError> {
        if settings.page_size == 0 {
            return Err(ClientError::Validation("page_size must be at least 1".into()));
        }
        let (events, _) = broadcast::channel(256);
        Ok(Arc::new(Self {
            paginator: HistoryPaginator::new(Arc::clone(&gateway), settings.page_size),
            receipts: ReadReceiptDebouncer::new(
                Arc::clone(&gateway),
                settings.read_receipt_quiet_period,
            ),
            gateway,
            durable,
            state: Mutex::new(StoreState::default()),
            events,
        }))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConversationEvent> {
        self.events.subscribe()
    }

    pub fn gateway(&self) -> &Arc<RequestGateway> {
        &self.gateway
    }

    pub fn receipts(&self) -> &ReadReceiptDebouncer {
        &self.receipts
    }

    pub(crate) async fn lock_state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().await
    }

    pub(crate) fn emit(&self, event: ConversationEvent) {
        let _ = self.events.send(event);
    }

    pub async fn sorted_conversations(&self) -> Vec<Conversation> {
        let mut conversations: Vec<Conversation> =
            self.state.lock().await.conversations.values().cloned().collect();
        // Option orders None first, so descending puts silent conversations last.
        conversations.sort_by(|a, b| {
            b.last_message_time
                .cmp(&a.last_message_time)
                .then(a.id.cmp(&b.id))
        });
        conversations
    }

    pub async fn conversation(&self, id: ConversationId) -> Option<Conversation> {
        self.state.lock().await.conversations.get(&id).cloned()
    }

    pub async fn active_conversation_id(&self) -> Option<ConversationId> {
        self.state.lock().await.active
    }

    pub async fn active_messages(&self) -> Vec<MessagePayload> {
        let state = self.state.lock().await;
        state
            .active
            .and_then(|id| state.conversations.get(&id))
            .map(|conversation| conversation.messages.clone())
            .unwrap_or_default()
    }

    pub async fn fetch_catalog(&self) -> Result<(), ClientError> {
        let epoch = self.gateway.session_epoch();
        let summaries: Vec<ConversationSummary> = self
            .gateway
            .fetch_json(ApiRequest::get("/conversations"))
            .await?;
        if !self.gateway.is_current(epoch) {
            return Err(ClientError::LoggedOut);
        }

        let persisted = match self.durable.load_active_conversation().await {
            Ok(id) => id,
            Err(err) => {
                warn!("catalog: failed to read persisted active conversation: {err:#}");
                None
            }
        };

        let (restore, previous_active, count) = {
            let mut state = self.state.lock().await;
            let previous_active = state.active.take();
            state.conversations = summaries
                .into_iter()
                .map(|summary| (summary.id, Conversation::from_summary(summary)))
                .collect();
            let restore = previous_active
                .or(persisted)
                .filter(|id| state.conversations.contains_key(id));
            (restore, previous_active, state.conversations.len())
        };
        info!(conversations = count, "catalog: replaced");
        self.emit(ConversationEvent::CatalogReplaced);

        match restore {
            Some(id) => {
                if let Err(err) = self.set_active_conversation(id).await {
                    warn!(conversation_id = id.0, "catalog: could not restore active conversation: {err}");
                }
            }
            None if previous_active.is_some() => {
                self.receipts.cancel().await;
                self.emit(ConversationEvent::ActiveChanged(None));
            }
            None => {}
        }
        Ok(())
    }

    pub async fn set_active_conversation(&self, id: ConversationId) -> Result<(), ClientError> {
        let unread = {
            let mut state = self.state.lock().await;
            if state.active == Some(id) {
                return Ok(());
            }
            let Some(conversation) = state.conversations.get(&id) else {
                return Err(ClientError::Validation(format!("unknown conversation {id}")));
            };
            let unread = conversation.unread_count;
            self.receipts.cancel().await;
            state.active = Some(id);
            unread
        };

        if let Err(err) = self.durable.save_active_conversation(id).await {
            warn!(conversation_id = id.0, "store: failed to persist active conversation: {err:#}");
        }
        info!(conversation_id = id.0, unread, "store: active conversation switched");
        self.emit(ConversationEvent::ActiveChanged(Some(id)));

        let epoch = self.gateway.session_epoch();
        if unread > 0 {
            if let Err(err) = self.receipts.acknowledge_now(id).await {
                warn!(conversation_id = id.0, "read: acknowledgement failed: {err}");
            }
            if let Some(conversation) = self.state.lock().await.conversations.get_mut(&id) {
                conversation.unread_count = 0;
            }
            self.emit(ConversationEvent::ConversationUpdated(id));
        }

        let items = match self.paginator.fetch_page(id, 0).await {
            Ok(items) => items,
            Err(err) => return Err(self.handle_access_loss(err).await),
        };
        if !self.gateway.is_current(epoch) {
            return Err(ClientError::LoggedOut);
        }

        let page_size = self.paginator.page_size();
        if let Some(conversation) = self.state.lock().await.conversations.get_mut(&id) {
            replace_window(conversation, items, page_size);
        }
        self.emit(ConversationEvent::MessagesChanged(id));
        Ok(())
    }

    pub async fn load_more_messages(&self) -> Result<usize, ClientError> {
        let (id, next_page) = {
            let state = self.state.lock().await;
            let Some(id) = state.active else {
                return Err(ClientError::Validation("no active conversation".into()));
            };
            match state.conversations.get(&id) {
                Some(conversation) if conversation.has_more => (id, conversation.page + 1),
                Some(_) => return Ok(0),
                None => return Err(ClientError::Validation(format!("unknown conversation {id}"))),
            }
        };

        let epoch = self.gateway.session_epoch();
        let items = match self.paginator.fetch_page(id, next_page).await {
            Ok(items) => items,
            Err(err) => return Err(self.handle_access_loss(err).await),
        };
        if !self.gateway.is_current(epoch) {
            return Err(ClientError::LoggedOut);
        }

        let page_size = self.paginator.page_size();
        let added = match self.state.lock().await.conversations.get_mut(&id) {
            Some(conversation) => merge_older_page(conversation, next_page, items, page_size),
            None => 0,
        };
        debug!(conversation_id = id.0, page = next_page, added, "history: older page merged");
        if added > 0 {
            self.emit(ConversationEvent::MessagesChanged(id));
        }
        Ok(added)
    }

    pub async fn refresh_conversation(&self, id: ConversationId) -> Result<(), ClientError> {
        let epoch = self.gateway.session_epoch();
        let summary: ConversationSummary = match self
            .gateway
            .fetch_json(ApiRequest::get(format!("/conversations/{id}")))
            .await
        {
            Ok(summary) => summary,
            Err(err) => return Err(self.handle_access_loss(revoked_on_access_loss(err, id)).await),
        };
        if !self.gateway.is_current(epoch) {
            return Err(ClientError::LoggedOut);
        }

        {
            let mut state = self.state.lock().await;
            match state.conversations.get_mut(&id) {
                Some(conversation) => conversation.apply_summary(summary),
                None => {
                    state
                        .conversations
                        .insert(id, Conversation::from_summary(summary));
                }
            }
        }
        self.emit(ConversationEvent::ConversationUpdated(id));
        Ok(())
    }

    async fn handle_access_loss(&self, err: ClientError) -> ClientError {
        if let ClientError::AccessRevoked(id) = err {
            warn!(conversation_id = id.0, "store: access revoked; removing conversation");
            self.remove_conversation(id).await;
        }
        err
    }

    pub async fn remove_conversation(&self, id: ConversationId) -> bool {
        let (removed, was_active) = {
            let mut state = self.state.lock().await;
            let removed = state.conversations.remove(&id).is_some();
            let was_active = state.active == Some(id);
            if was_active {
                state.active = None;
                self.receipts.cancel().await;
            }
            (removed, was_active)
        };

        if was_active {
            if let Err(err) = self.durable.clear_active_conversation().await {
                warn!("store: failed to clear persisted active conversation: {err:#}");
            }
            self.emit(ConversationEvent::ActiveChanged(None));
        }
        if removed {
            self.emit(ConversationEvent::ConversationRemoved(id));
        }
        removed
    }

    pub async fn reset(&self) {
        self.receipts.cancel().await;
        let had_state = {
            let mut state = self.state.lock().await;
            let had_state = !state.conversations.is_empty() || state.active.is_some();
            *state = StoreState::default();
            had_state
        };
        if had_state {
            self.emit(ConversationEvent::CatalogReplaced);
            self.emit(ConversationEvent::ActiveChanged(None));
        }
    }

    pub fn spawn_session_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let mut session_events = self.gateway.subscribe();
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                match session_events.recv().await {
                    Ok(SessionEvent::LoggedOut) => {
                        let Some(store) = store.upgrade() else { break };
                        info!("store: session ended; clearing conversations");
                        store.reset().await;
                    }
                    Ok(SessionEvent::TokensRotated) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "store: session events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn ensure_known(&self, id: ConversationId) -> Result<(), ClientError> {
        if self.state.lock().await.conversations.contains_key(&id) {
            Ok(())
        } else {
            Err(ClientError::Validation(format!("unknown conversation {id}")))
        }
    }

    async fn mutate(&self, id: ConversationId, request: ApiRequest) -> Result<(), ClientError> {
        if let Err(err) = self.gateway.send_unit(request).await {
            return Err(self.handle_access_loss(revoked_on_access_loss(err, id)).await);
        }
        self.refresh_conversation(id).await
    }

    pub async fn create_conversation(
        &self,
        name: &str,
        member_ids: Vec<UserId>,
    ) -> Result<ConversationId, ClientError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ClientError::Validation("conversation name must not be empty".into()));
        }
        let request = ApiRequest::post("/conversations").with_json(&CreateConversationRequest {
            name: name.to_string(),
            member_ids,
        })?;
        let summary: ConversationSummary = self.gateway.fetch_json(request).await?;
        let id = summary.id;
        self.state
            .lock()
            .await
            .conversations
            .insert(id, Conversation::from_summary(summary));
        info!(conversation_id = id.0, "store: conversation created");
        self.emit(ConversationEvent::ConversationUpdated(id));
        self.set_active_conversation(id).await?;
        Ok(id)
    }

    pub async fn send_message(&self, content: &str) -> Result<(), ClientError> {
        if content.trim().is_empty() {
            return Err(ClientError::Validation("message content must not be empty".into()));
        }
        let Some(id) = self.active_conversation_id().await else {
            return Err(ClientError::Validation("no active conversation".into()));
        };
        let request = ApiRequest::post(format!("/conversations/{id}/messages"))
            .with_json(&SendMessageRequest {
                content: content.to_string(),
            })?;
        match self.gateway.send_unit(request).await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.handle_access_loss(revoked_on_access_loss(err, id)).await),
        }
    }

    pub async fn add_members(
        &self,
        id: ConversationId,
        member_ids: Vec<UserId>,
    ) -> Result<(), ClientError> {
        if member_ids.is_empty() {
            return Err(ClientError::Validation("no members to add".into()));
        }
        self.ensure_known(id).await?;
        let request = ApiRequest::post(format!("/conversations/{id}/members"))
            .with_json(&AddMembersRequest { member_ids })?;
        self.mutate(id, request).await
    }

    pub async fn remove_member(&self, id: ConversationId, user_id: UserId) -> Result<(), ClientError> {
        self.ensure_known(id).await?;
        self.mutate(id, ApiRequest::delete(format!("/conversations/{id}/members/{user_id}")))
            .await
    }

    /// Leaving ends in loss of access; that outcome is success here.
    pub async fn leave_conversation(&self, id: ConversationId) -> Result<(), ClientError> {
        self.ensure_known(id).await?;
        match self
            .mutate(id, ApiRequest::post(format!("/conversations/{id}/leave")))
            .await
        {
            Ok(()) | Err(ClientError::AccessRevoked(_)) => {
                self.remove_conversation(id).await;
                info!(conversation_id = id.0, "store: left conversation");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    pub async fn set_admin(
        &self,
        id: ConversationId,
        user_id: UserId,
        admin: bool,
    ) -> Result<(), ClientError> {
        self.ensure_known(id).await?;
        let request = ApiRequest::put(format!("/conversations/{id}/members/{user_id}/admin"))
            .with_json(&SetAdminRequest { admin })?;
        self.mutate(id, request).await
    }

    pub async fn set_muted(&self, id: ConversationId, muted: bool) -> Result<(), ClientError> {
        self.ensure_known(id).await?;
        let request = ApiRequest::put(format!("/conversations/{id}/mute"))
            .with_json(&SetMutedRequest { muted })?;
        self.mutate(id, request).await
    }

    pub async fn rename_conversation(&self, id: ConversationId, name: &str) -> Result<(), ClientError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ClientError::Validation("conversation name must not be empty".into()));
        }
        self.ensure_known(id).await?;
        let request = ApiRequest::patch(format!("/conversations/{id}")).with_json(
            &UpdateConversationRequest {
                name: Some(name.to_string()),
                image_url: None,
            },
        )?;
        self.mutate(id, request).await
    }
}

#[cfg(test)]
#[path = "tests/conversations_tests.rs"]
mod tests;
