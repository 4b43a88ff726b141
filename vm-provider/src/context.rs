//! Call context for bounding remote gateway calls
//!
//! Every awaitable gateway call made by the core runs through
//! `CallContext::guard`, which races the call against the caller's deadline
//! and cancellation signal. An abandoned call says nothing about whether the
//! remote side completed it.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use vm_core::error::{Result, VmError};

/// Runtime limits for gateway calls made on behalf of one request
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    deadline: Option<Instant>,
    cancel: Option<watch::Receiver<bool>>,
}

/// Caller-side handle that cancels every call sharing its context
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl CallContext {
    /// Create a context with no deadline and no cancellation
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a deadline `timeout` from now
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Set an absolute deadline, keeping the earlier one if already set
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        });
        self
    }

    /// Apply `timeout` only when no deadline has been set yet
    pub fn with_default_timeout(self, timeout: Option<Duration>) -> Self {
        match (self.deadline, timeout) {
            (None, Some(timeout)) => self.with_timeout(timeout),
            _ => self,
        }
    }

    /// Attach a cancellation signal and return the handle that fires it
    pub fn cancellable(mut self) -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        self.cancel = Some(rx);
        (self, CancelHandle { tx })
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Run `call`, giving up when the deadline passes or the caller cancels.
    pub async fn guard<T, F>(&self, operation: &str, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.is_cancelled() {
            return Err(VmError::Cancelled {
                operation: operation.to_string(),
            });
        }
        if self.is_expired() {
            return Err(VmError::DeadlineExceeded {
                operation: operation.to_string(),
            });
        }

        let cancelled = wait_for_cancel(self.cancel.clone());
        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            result = call => result,
            _ = cancelled => {
                tracing::warn!(operation, "gateway call cancelled by caller");
                Err(VmError::Cancelled { operation: operation.to_string() })
            }
            _ = expired => {
                tracing::warn!(operation, "gateway call exceeded its deadline");
                Err(VmError::DeadlineExceeded { operation: operation.to_string() })
            }
        }
    }
}

async fn wait_for_cancel(rx: Option<watch::Receiver<bool>>) {
    let Some(mut rx) = rx else {
        return std::future::pending().await;
    };
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            // Handle dropped without cancelling
            return std::future::pending().await;
        }
    }
}
