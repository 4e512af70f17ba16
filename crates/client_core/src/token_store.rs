use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use tokio::sync::RwLock;
use tracing::warn;

use crate::durable::DurableState;

#[derive(Clone, PartialEq, Eq)]
pub struct TokenPair {
    access_token: String,
    refresh_token: String,
}

impl TokenPair {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn refresh_token(&self) -> &str {
        &self.refresh_token
    }
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

/// The session epoch increases on every login and logout. Anything that
/// suspends across a network call captures the epoch first and drops its
/// result if the epoch moved.
pub struct TokenStore {
    current: RwLock<Option<TokenPair>>,
    epoch: AtomicU64,
    durable: Arc<dyn DurableState>,
}

impl TokenStore {
    pub fn new(durable: Arc<dyn DurableState>) -> Self {
        Self {
            current: RwLock::new(None),
            epoch: AtomicU64::new(0),
            durable,
        }
    }

    pub async fn access_token(&self) -> Option<String> {
        self.current
            .read()
            .await
            .as_ref()
            .map(|pair| pair.access_token.clone())
    }

    pub async fn refresh_token(&self) -> Option<String> {
        self.current
            .read()
            .await
            .as_ref()
            .map(|pair| pair.refresh_token.clone())
    }

    pub async fn pair(&self) -> Option<TokenPair> {
        self.current.read().await.clone()
    }

    pub async fn is_present(&self) -> bool {
        self.current.read().await.is_some()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub(crate) fn advance_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) async fn write(&self, pair: TokenPair) {
        if let Err(err) = self.durable.save_tokens(&pair).await {
            warn!("auth: failed to persist token pair: {err:#}");
        }
        *self.current.write().await = Some(pair);
    }

    /// Clears memory and durable copies. Returns whether a pair was held.
    pub(crate) async fn clear(&self) -> bool {
        let previous = self.current.write().await.take();
        if let Err(err) = self.durable.clear_tokens().await {
            warn!("auth: failed to clear persisted token pair: {err:#}");
        }
        previous.is_some()
    }

    pub(crate) async fn load_persisted(&self) -> Option<TokenPair> {
        match self.durable.load_tokens().await {
            Ok(pair) => pair,
            Err(err) => {
                warn!("auth: failed to load persisted token pair: {err:#}");
                None
            }
        }
    }
}
