use std::sync::Arc;

use anyhow::Context;
use storage::Storage;
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::info;

pub mod config;
pub mod conversations;
pub mod durable;
pub mod error;
pub mod gateway;
pub mod paginator;
pub mod push;
pub mod read_receipts;
pub mod reconciler;
pub mod refresh;
pub mod session_timer;
pub mod token_store;
pub mod transport;

pub use config::{load_settings, ClientSettings};
pub use conversations::{Conversation, ConversationEvent, ConversationStore};
pub use durable::{DurableState, MemoryDurableState};
pub use error::ClientError;
pub use gateway::{RequestGateway, SessionEvent};
pub use reconciler::{EventReconciler, ReconcileOutcome};
pub use refresh::{RefreshCoordinator, RefreshState};
pub use token_store::TokenPair;
pub use transport::{ApiRequest, ApiResponse, HttpTransport, ReqwestTransport};

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

pub struct ChatClient {
    settings: ClientSettings,
    gateway: Arc<RequestGateway>,
    store: Arc<ConversationStore>,
    reconciler: Arc<EventReconciler>,
    push_task: Mutex<Option<JoinHandle<()>>>,
    session_watcher: JoinHandle<()>,
}

impl ChatClient {
    pub async fn connect(settings: ClientSettings) -> anyhow::Result<Arc<Self>> {
        let storage = Storage::new(&settings.database_url)
            .await
            .with_context(|| format!("failed to open client state at {}", settings.database_url))?;
        storage.health_check().await?;
        let transport = Arc::new(ReqwestTransport::new(settings.server_url.clone()));
        Ok(Self::with_parts(settings, transport, Arc::new(storage))?)
    }

    pub fn with_parts(
        settings: ClientSettings,
        transport: Arc<dyn HttpTransport>,
        durable: Arc<dyn DurableState>,
    ) -> Result<Arc<Self>, ClientError> {
        let gateway = RequestGateway::new(
            transport,
            Arc::clone(&durable),
            settings.refresh_safety_buffer,
        );
        let store = ConversationStore::new(Arc::clone(&gateway), durable, &settings)?;
        let session_watcher = store.spawn_session_watcher();
        let reconciler = Arc::new(EventReconciler::new(Arc::clone(&store)));

        Ok(Arc::new(Self {
            settings,
            gateway,
            store,
            reconciler,
            push_task: Mutex::new(None),
            session_watcher,
        }))
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn gateway(&self) -> &Arc<RequestGateway> {
        &self.gateway
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    pub fn reconciler(&self) -> &Arc<EventReconciler> {
        &self.reconciler
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<(), ClientError> {
        self.gateway.login(username, password).await?;
        self.store.fetch_catalog().await
    }

    pub async fn restore_session(&self) -> Result<bool, ClientError> {
        if !self.gateway.restore_session().await? {
            return Ok(false);
        }
        self.store.fetch_catalog().await?;
        Ok(true)
    }

    pub async fn logout(&self) {
        self.stop_push().await;
        self.gateway.logout().await;
        self.store.reset().await;
    }

    pub async fn start_push(&self) -> Result<(), ClientError> {
        let access_token = self
            .gateway
            .tokens()
            .access_token()
            .await
            .ok_or(ClientError::LoggedOut)?;
        let base = self
            .settings
            .push_url
            .as_deref()
            .unwrap_or(&self.settings.server_url);
        let frames = push::connect(base, &access_token).await?;

        let reconciler = Arc::clone(&self.reconciler);
        let task = tokio::spawn(async move {
            reconciler.run(frames).await;
        });
        if let Some(previous) = self.push_task.lock().await.replace(task) {
            previous.abort();
        }
        info!("push: reconciler attached");
        Ok(())
    }

    pub async fn stop_push(&self) {
        if let Some(task) = self.push_task.lock().await.take() {
            task.abort();
        }
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        if let Some(task) = self.push_task.get_mut().take() {
            task.abort();
        }
        self.session_watcher.abort();
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
