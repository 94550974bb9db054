//! Cancellation and deadlines for cluster calls
//!
//! Every cluster interaction in an upgrade goes through [`CallContext::run`],
//! so a Ctrl-C or an expired deadline fails the whole invocation instead of
//! letting it continue with partial data.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Cancellation token plus an optional deadline shared by one upgrade run
#[derive(Clone, Debug, Default)]
pub struct CallContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    /// A context that is never cancelled and has no deadline
    pub fn background() -> Self {
        Self::default()
    }

    /// A context whose calls fail once `timeout` has elapsed from now
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// Token that cancels this context when triggered
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel all in-flight and future calls made through this context
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the context has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run one cluster call, failing fast on cancellation or deadline
    pub async fn run<T, F>(&self, operation: &str, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let guarded = async {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(Error::ContextCanceled {
                    operation: operation.to_string(),
                    reason: "context canceled",
                }),
                result = call => result,
            }
        };

        match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, guarded)
                .await
                .map_err(|_| Error::ContextCanceled {
                    operation: operation.to_string(),
                    reason: "deadline exceeded",
                })?,
            None => guarded.await,
        }
    }
}
