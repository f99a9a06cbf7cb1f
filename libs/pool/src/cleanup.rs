//! Deferred teardown actions.
//!
//! A [`CleanupStack`] stores actions unevaluated: registering an action
//! never runs any of it. [`CleanupStack::run_all`] drains the stack and runs
//! each action exactly once, in registration order. A failing action is
//! recorded and the remaining actions still run.

use std::fmt;
use std::future::Future;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Serialize;
use tracing::{debug, warn};

type Action = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

struct Entry {
    label: String,
    action: Action,
}

#[derive(Default)]
pub struct CleanupStack {
    entries: Vec<Entry>,
}

impl fmt::Debug for CleanupStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CleanupStack")
            .field(
                "labels",
                &self.entries.iter().map(|e| e.label.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Labels of actions that completed, in run order.
    pub succeeded: Vec<String>,
    pub failed: Vec<CleanupFailure>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupFailure {
    pub label: String,
    pub error: String,
}

impl CleanupStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action. `action` is called only by [`run_all`](Self::run_all).
    pub fn register<F, Fut>(&mut self, label: impl Into<String>, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let label = label.into();
        debug!(label = %label, "Registered cleanup action");
        self.entries.push(Entry {
            label,
            action: Box::new(move || action().boxed()),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run every registered action once, in registration order.
    pub async fn run_all(&mut self) -> CleanupReport {
        let mut report = CleanupReport::default();

        for Entry { label, action } in std::mem::take(&mut self.entries) {
            match action().await {
                Ok(()) => {
                    debug!(label = %label, "Cleanup action finished");
                    report.succeeded.push(label);
                }
                Err(e) => {
                    warn!(label = %label, error = %format!("{e:#}"), "Cleanup action failed");
                    report.failed.push(CleanupFailure {
                        label,
                        error: format!("{e:#}"),
                    });
                }
            }
        }

        report
    }
}
