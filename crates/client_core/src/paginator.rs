use std::{collections::HashSet, sync::Arc};

use shared::{domain::ConversationId, protocol::MessagePayload};

use crate::{
    conversations::Conversation, error::ClientError, gateway::RequestGateway,
    transport::ApiRequest,
};

pub struct HistoryPaginator {
    gateway: Arc<RequestGateway>,
    page_size: u32,
}

impl HistoryPaginator {
    pub fn new(gateway: Arc<RequestGateway>, page_size: u32) -> Self {
        Self { gateway, page_size }
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// `GET /conversations/{id}/history?page&size`. Pages come back ascending;
    /// page 0 is the most recent window.
    pub async fn fetch_page(
        &self,
        conversation_id: ConversationId,
        page: u32,
    ) -> Result<Vec<MessagePayload>, ClientError> {
        let request = ApiRequest::get(format!("/conversations/{conversation_id}/history"))
            .with_query("page", page)
            .with_query("size", self.page_size);
        self.gateway
            .fetch_json(request)
            .await
            .map_err(|err| revoked_on_access_loss(err, conversation_id))
    }
}

pub(crate) fn revoked_on_access_loss(err: ClientError, conversation_id: ConversationId) -> ClientError {
    if err.is_access_loss() {
        ClientError::AccessRevoked(conversation_id)
    } else {
        err
    }
}

pub fn replace_window(conversation: &mut Conversation, items: Vec<MessagePayload>, page_size: u32) {
    conversation.has_more = items.len() == page_size as usize;
    conversation.messages = items
        .into_iter()
        .filter(|message| message.kind.is_windowed())
        .collect();
    conversation.page = 0;
}

pub fn merge_older_page(
    conversation: &mut Conversation,
    page: u32,
    items: Vec<MessagePayload>,
    page_size: u32,
) -> usize {
    let has_more = items.len() == page_size as usize;
    let mut seen: HashSet<_> = conversation.messages.iter().map(|m| m.id).collect();
    let mut older: Vec<MessagePayload> = items
        .into_iter()
        .filter(|message| message.kind.is_windowed() && seen.insert(message.id))
        .collect();
    let added = older.len();

    older.append(&mut conversation.messages);
    conversation.messages = older;
    conversation.page = conversation.page.max(page);
    conversation.has_more = has_more;
    added
}
