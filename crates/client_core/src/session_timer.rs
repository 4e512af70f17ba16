use std::{future::Future, time::Duration};

use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, decode_header, DecodingKey, Validation};
use serde::Deserialize;
use tokio::{sync::Mutex, task::JoinHandle};

use crate::error::ClientError;

#[derive(Debug, Deserialize)]
struct ExpiryClaim {
    exp: i64,
}

/// Reads the `exp` claim without verifying the signature; the client has no
/// key and only needs the schedule.
pub fn access_token_expiry(access_token: &str) -> Result<DateTime<Utc>, ClientError> {
    let header =
        decode_header(access_token).map_err(|err| ClientError::InvalidToken(err.to_string()))?;
    let mut validation = Validation::new(header.alg);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.set_required_spec_claims(&["exp"]);

    let data = decode::<ExpiryClaim>(access_token, &DecodingKey::from_secret(&[]), &validation)
        .map_err(|err| ClientError::InvalidToken(err.to_string()))?;
    DateTime::from_timestamp(data.claims.exp, 0)
        .ok_or_else(|| ClientError::InvalidToken(format!("exp out of range: {}", data.claims.exp)))
}

pub fn renewal_delay(
    expiry: DateTime<Utc>,
    now: DateTime<Utc>,
    safety_buffer: Duration,
) -> Option<Duration> {
    let buffer = chrono::Duration::from_std(safety_buffer).ok()?;
    let remaining = expiry.signed_duration_since(now).checked_sub(&buffer)?;
    if remaining <= chrono::Duration::zero() {
        return None;
    }
    remaining.to_std().ok()
}

pub struct SessionTimer {
    safety_buffer: Duration,
    slot: Mutex<Option<JoinHandle<()>>>,
}

impl SessionTimer {
    pub fn new(safety_buffer: Duration) -> Self {
        Self {
            safety_buffer,
            slot: Mutex::new(None),
        }
    }

    pub fn safety_buffer(&self) -> Duration {
        self.safety_buffer
    }

    pub async fn arm<F>(&self, delay: Duration, wake: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.slot.lock().await;
        if let Some(previous) = slot.take() {
            previous.abort();
        }
        *slot = Some(tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            wake.await;
        }));
    }

    pub async fn cancel(&self) -> bool {
        match self.slot.lock().await.take() {
            Some(handle) => {
                let pending = !handle.is_finished();
                handle.abort();
                pending
            }
            None => false,
        }
    }

    pub async fn is_armed(&self) -> bool {
        self.slot
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

#[cfg(test)]
#[path = "tests/session_timer_tests.rs"]
mod tests;
