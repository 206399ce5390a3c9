//! Cancellation and deadlines for dials.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{OutboundError, Stage};

/// Caller-supplied cancellation token plus an optional deadline.
///
/// Every connect, handshake and header step runs under [`DialContext::run`].
/// When the token fires or the deadline passes, the step's future is dropped,
/// which closes whatever socket it owned.
#[derive(Debug, Clone, Default)]
pub struct DialContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl DialContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn deadline_at(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Drives `fut` unless the context is cancelled or expires first.
    pub async fn run<F, T>(&self, stage: Stage, fut: F) -> Result<T, OutboundError>
    where
        F: Future<Output = Result<T, OutboundError>>,
    {
        if self.cancel.is_cancelled() {
            return Err(OutboundError::Cancelled { stage });
        }
        let deadline = async {
            match self.deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                debug!(%stage, "dial cancelled");
                Err(OutboundError::Cancelled { stage })
            }
            _ = deadline => {
                debug!(%stage, "dial deadline exceeded");
                Err(OutboundError::TimedOut { stage })
            }
            res = fut => res,
        }
    }
}
