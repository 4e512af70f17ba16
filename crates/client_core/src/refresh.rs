use std::{collections::VecDeque, future::Future, sync::Arc};

use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::error::ClientError;

type Waiter = oneshot::Sender<Result<String, ClientError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    Idle,
    Refreshing,
    LoggedOut,
}

// Idle -> Refreshing -> Idle on success, LoggedOut on failure.
enum Phase {
    Idle,
    Refreshing {
        generation: u64,
        waiters: VecDeque<Waiter>,
    },
    LoggedOut,
}

struct Inner {
    phase: Phase,
    generation: u64,
}

#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Mutex<Inner>>,
}

impl Default for RefreshCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl RefreshCoordinator {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                phase: Phase::Idle,
                generation: 0,
            })),
        }
    }

    pub async fn state(&self) -> RefreshState {
        match self.inner.lock().await.phase {
            Phase::Idle => RefreshState::Idle,
            Phase::Refreshing { .. } => RefreshState::Refreshing,
            Phase::LoggedOut => RefreshState::LoggedOut,
        }
    }

    /// Resolves to the renewed access token. The first caller while idle
    /// starts `renew` on its own task; everyone else joins it. `renew` is
    /// never invoked when a renewal is already in flight.
    pub async fn request_refresh<F, Fut>(&self, renew: F) -> Result<String, ClientError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, ClientError>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let started = {
            let mut guard = self.inner.lock().await;
            let inner = &mut *guard;
            match inner.phase {
                Phase::LoggedOut => return Err(ClientError::LoggedOut),
                Phase::Refreshing {
                    ref mut waiters, ..
                } => {
                    waiters.push_back(tx);
                    debug!(waiters = waiters.len(), "refresh: joined in-flight renewal");
                    None
                }
                Phase::Idle => {
                    inner.generation += 1;
                    let generation = inner.generation;
                    inner.phase = Phase::Refreshing {
                        generation,
                        waiters: VecDeque::from([tx]),
                    };
                    Some(generation)
                }
            }
        };

        if let Some(generation) = started {
            info!(generation, "refresh: renewal started");
            let renewal = renew();
            let coordinator = self.clone();
            tokio::spawn(async move {
                let outcome = renewal.await;
                coordinator.settle(generation, outcome).await;
            });
        }

        rx.await.unwrap_or(Err(ClientError::LoggedOut))
    }

    async fn settle(&self, generation: u64, outcome: Result<String, ClientError>) {
        let mut inner = self.inner.lock().await;
        let waiters = match &mut inner.phase {
            Phase::Refreshing {
                generation: current,
                waiters,
            } if *current == generation => std::mem::take(waiters),
            _ => {
                debug!(generation, "refresh: stale renewal settled after reset");
                return;
            }
        };

        match &outcome {
            Ok(_) => {
                info!(generation, waiters = waiters.len(), "refresh: renewal succeeded");
                inner.phase = Phase::Idle;
            }
            Err(err) => {
                warn!(generation, waiters = waiters.len(), "refresh: renewal failed: {err}");
                inner.phase = Phase::LoggedOut;
            }
        }

        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }

    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        if let Phase::Refreshing { waiters, .. } = std::mem::replace(&mut inner.phase, Phase::Idle)
        {
            reject_all(waiters);
        }
    }

    pub async fn shut_down(&self) {
        let mut inner = self.inner.lock().await;
        if let Phase::Refreshing { waiters, .. } =
            std::mem::replace(&mut inner.phase, Phase::LoggedOut)
        {
            reject_all(waiters);
        }
    }
}

fn reject_all(waiters: VecDeque<Waiter>) {
    for waiter in waiters {
        let _ = waiter.send(Err(ClientError::LoggedOut));
    }
}

#[cfg(test)]
#[path = "tests/refresh_tests.rs"]
mod tests;
