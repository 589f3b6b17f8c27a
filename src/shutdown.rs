use std::future::Future;
use std::sync::{Mutex, PoisonError};

use tokio::sync::watch;

use crate::error::TelemetryError;

type Outcome = Option<Result<(), TelemetryError>>;

enum GateState {
    Open,
    Started(watch::Receiver<Outcome>),
}

/// Runs a teardown exactly once.
///
/// The first caller spawns the teardown onto the runtime, so it finishes even
/// if that caller is dropped mid-wait. Every caller, concurrent or later,
/// waits for and receives a clone of the single outcome.
pub struct ShutdownGate {
    state: Mutex<GateState>,
}

impl ShutdownGate {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState::Open),
        }
    }

    pub async fn run<F, Fut>(&self, teardown: F) -> Result<(), TelemetryError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), TelemetryError>> + Send + 'static,
    {
        let mut outcome = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match &*state {
                GateState::Started(rx) => rx.clone(),
                GateState::Open => {
                    let (tx, rx) = watch::channel(None);
                    let teardown = teardown();
                    tokio::spawn(async move {
                        let _ = tx.send(Some(teardown.await));
                    });
                    *state = GateState::Started(rx.clone());
                    rx
                }
            }
        };

        let settled = match outcome.wait_for(Option::is_some).await {
            Ok(settled) => settled.clone(),
            Err(_) => None,
        };
        settled.unwrap_or_else(|| {
            Err(TelemetryError::Shutdown(
                "shutdown task ended without an outcome".to_string(),
            ))
        })
    }

    /// True once a teardown has been started.
    pub fn is_closed(&self) -> bool {
        matches!(
            &*self.state.lock().unwrap_or_else(PoisonError::into_inner),
            GateState::Started(_)
        )
    }
}

impl Default for ShutdownGate {
    fn default() -> Self {
        Self::new()
    }
}
