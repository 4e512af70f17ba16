use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use shared::protocol::{LoginRequest, RefreshRequest, TokenResponse};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::{
    durable::DurableState,
    error::ClientError,
    refresh::{RefreshCoordinator, RefreshState},
    session_timer::{access_token_expiry, renewal_delay, SessionTimer},
    token_store::{TokenPair, TokenStore},
    transport::{ApiRequest, ApiResponse, HttpTransport},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    TokensRotated,
    LoggedOut,
}

pub struct RequestGateway {
    transport: Arc<dyn HttpTransport>,
    durable: Arc<dyn DurableState>,
    tokens: TokenStore,
    refresh: RefreshCoordinator,
    timer: SessionTimer,
    timer_wakes: mpsc::UnboundedSender<()>,
    events: broadcast::Sender<SessionEvent>,
}

impl RequestGateway {
    /// Must be called inside a tokio runtime: the session timer's wakes are
    /// driven by a background task that lives as long as the gateway.
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        durable: Arc<dyn DurableState>,
        refresh_safety_buffer: Duration,
    ) -> Arc<Self> {
        let (timer_wakes, mut wake_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);
        let gateway = Arc::new(Self {
            transport,
            tokens: TokenStore::new(Arc::clone(&durable)),
            durable,
            refresh: RefreshCoordinator::new(),
            timer: SessionTimer::new(refresh_safety_buffer),
            timer_wakes,
            events,
        });

        let weak = Arc::downgrade(&gateway);
        tokio::spawn(async move {
            while wake_rx.recv().await.is_some() {
                let Some(gateway) = weak.upgrade() else {
                    break;
                };
                if !gateway.is_logged_in().await {
                    continue;
                }
                info!("auth: session timer fired; renewing ahead of expiry");
                if let Err(err) = gateway.request_refresh().await {
                    warn!("auth: scheduled renewal failed: {err}");
                }
            }
        });

        gateway
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    pub fn session_epoch(&self) -> u64 {
        self.tokens.epoch()
    }

    /// Whether a response obtained under `epoch` may still be applied.
    pub fn is_current(&self, epoch: u64) -> bool {
        self.tokens.epoch() == epoch
    }

    pub async fn is_logged_in(&self) -> bool {
        self.tokens.is_present().await
    }

    pub async fn refresh_state(&self) -> RefreshState {
        self.refresh.state().await
    }

    pub async fn session_timer_armed(&self) -> bool {
        self.timer.is_armed().await
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<(), ClientError> {
        if username.trim().is_empty() {
            return Err(ClientError::Validation("username must not be empty".into()));
        }
        if password.is_empty() {
            return Err(ClientError::Validation("password must not be empty".into()));
        }

        let request = ApiRequest::post("/auth/login").with_json(&LoginRequest {
            username: username.to_string(),
            password: password.to_string(),
        })?;
        let body: TokenResponse = self
            .transport
            .execute(&request)
            .await?
            .into_result()?
            .json()?;
        let refresh_token = body
            .refresh_token
            .ok_or_else(|| ClientError::Decode("login response missing refreshToken".into()))?;

        self.tokens.advance_epoch();
        self.refresh.reset().await;
        self.set_tokens(TokenPair::new(body.token, refresh_token))
            .await?;
        info!(username, "auth: logged in");
        Ok(())
    }

    pub async fn restore_session(&self) -> Result<bool, ClientError> {
        let Some(pair) = self.tokens.load_persisted().await else {
            return Ok(false);
        };
        self.tokens.advance_epoch();
        self.refresh.reset().await;
        self.set_tokens(pair).await?;
        info!("auth: persisted session restored");
        Ok(true)
    }

    pub async fn set_tokens(&self, pair: TokenPair) -> Result<(), ClientError> {
        let expiry = match access_token_expiry(pair.access_token()) {
            Ok(expiry) => expiry,
            Err(err) => {
                error!("auth: {err}; ending session");
                self.end_session().await;
                return Err(err);
            }
        };

        self.tokens.write(pair).await;
        let _ = self.events.send(SessionEvent::TokensRotated);
        self.arm_session_timer(expiry).await;
        Ok(())
    }

    async fn arm_session_timer(&self, expiry: DateTime<Utc>) {
        let delay = renewal_delay(expiry, Utc::now(), self.timer.safety_buffer())
            .unwrap_or(Duration::ZERO);
        info!(
            delay_secs = delay.as_secs(),
            expires_at = %expiry,
            "auth: session timer armed"
        );
        let wakes = self.timer_wakes.clone();
        self.timer
            .arm(delay, async move {
                let _ = wakes.send(());
            })
            .await;
    }

    pub async fn logout(&self) {
        if let Some(access_token) = self.tokens.access_token().await {
            let mut request = ApiRequest::post("/auth/logout");
            request.bearer = Some(access_token);
            match self.transport.execute(&request).await {
                Ok(response) if !response.is_success() => {
                    warn!(status = response.status, "auth: logout notification rejected");
                }
                Ok(_) => {}
                Err(err) => warn!("auth: logout notification failed: {err}"),
            }
        }

        self.end_session().await;
        self.refresh.shut_down().await;
        info!("auth: logged out");
    }

    async fn end_session(&self) {
        self.timer.cancel().await;
        let had_session = self.tokens.clear().await;
        if let Err(err) = self.durable.clear_active_conversation().await {
            warn!("auth: failed to clear persisted active conversation: {err:#}");
        }
        self.tokens.advance_epoch();
        if had_session {
            let _ = self.events.send(SessionEvent::LoggedOut);
        }
    }

    pub async fn request_refresh(self: &Arc<Self>) -> Result<String, ClientError> {
        let gateway = Arc::clone(self);
        self.refresh
            .request_refresh(move || gateway.renew_session())
            .await
    }

    async fn renew_session(self: Arc<Self>) -> Result<String, ClientError> {
        let epoch = self.tokens.epoch();
        let Some(refresh_token) = self.tokens.refresh_token().await else {
            return Err(ClientError::LoggedOut);
        };

        let body = match self.call_refresh_endpoint(epoch, &refresh_token).await {
            Ok(body) => body,
            Err(err @ ClientError::RefreshInvalid(_)) => return Err(err),
            Err(err) if !self.is_current(epoch) => {
                debug!("auth: renewal from an ended session failed: {err}; ignoring");
                return Err(ClientError::LoggedOut);
            }
            Err(err) => {
                self.end_session().await;
                return Err(err);
            }
        };

        if !self.is_current(epoch) {
            debug!("auth: renewal settled after logout; discarding");
            return Err(ClientError::LoggedOut);
        }

        let access_token = body.token.clone();
        let pair = TokenPair::new(body.token, body.refresh_token.unwrap_or(refresh_token));
        self.set_tokens(pair).await?;
        Ok(access_token)
    }

    async fn call_refresh_endpoint(
        &self,
        epoch: u64,
        refresh_token: &str,
    ) -> Result<TokenResponse, ClientError> {
        let mut request = ApiRequest::post("/auth/refresh")
            .with_json(&RefreshRequest {
                refresh_token: refresh_token.to_string(),
            })?
            .renewal();
        request.bearer = self.tokens.access_token().await;

        let response = self.transport.execute(&request).await?;
        if response.is_auth_failure() {
            return Err(self.reject_renewal(epoch, response.status).await);
        }
        response.into_result()?.json()
    }

    /// Ends the session the renewal belonged to. A rejection arriving after
    /// that session already ended leaves the current one alone.
    async fn reject_renewal(&self, epoch: u64, status: u16) -> ClientError {
        if !self.is_current(epoch) {
            debug!(status, "auth: renewal from an ended session rejected; ignoring");
            return ClientError::LoggedOut;
        }
        warn!(status, "auth: renewal rejected; logging out");
        self.end_session().await;
        ClientError::RefreshInvalid(format!("refresh endpoint answered {status}"))
    }

    pub async fn send(self: &Arc<Self>, mut request: ApiRequest) -> Result<ApiResponse, ClientError> {
        let epoch = self.tokens.epoch();
        if !request.retried {
            request.bearer = self.tokens.access_token().await;
        }
        let response = self.transport.execute(&request).await?;
        if !response.is_auth_failure() || request.retried {
            return response.into_result();
        }
        if request.is_renewal {
            return Err(self.reject_renewal(epoch, response.status).await);
        }

        let original = ClientError::AuthExpired {
            status: response.status,
        };

        // A renewal may have landed while this call was in flight.
        let current = self.tokens.access_token().await;
        let renewed = match current {
            Some(token) if Some(&token) != request.bearer.as_ref() => {
                debug!(path = %request.path, "gateway: retrying with already renewed token");
                Ok(token)
            }
            _ => {
                debug!(path = %request.path, status = response.status, "gateway: awaiting renewal");
                self.request_refresh().await
            }
        };

        match renewed {
            Ok(access_token) => self
                .transport
                .execute(&request.retry_with(access_token))
                .await?
                .into_result(),
            Err(err) => {
                warn!(path = %request.path, "gateway: renewal unavailable: {err}");
                Err(original)
            }
        }
    }

    pub async fn fetch_json<T: DeserializeOwned>(
        self: &Arc<Self>,
        request: ApiRequest,
    ) -> Result<T, ClientError> {
        self.send(request).await?.json()
    }

    pub async fn send_unit(self: &Arc<Self>, request: ApiRequest) -> Result<(), ClientError> {
        self.send(request).await.map(|_| ())
    }
}

#[cfg(test)]
#[path = "tests/gateway_tests.rs"]
mod tests;
