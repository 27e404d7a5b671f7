//! Execution environment handed down to merge stages

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tracing::debug;

/// How an engine performs inner-stream subscriptions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatcherKind {
    /// Subscribe on the caller's thread
    #[default]
    Inline,
    /// Subscribe on a task spawned onto the tokio runtime
    Tokio,
}

/// Execution context for a merge stage
#[derive(Debug, Clone, Default)]
pub struct Environment {
    runtime: Option<Handle>,
}

impl Environment {
    /// Run everything inline on the signalling thread
    pub fn inline() -> Self {
        debug!("Environment::inline: called");
        Self { runtime: None }
    }

    /// Spawn inner subscriptions onto the given runtime
    pub fn tokio(handle: Handle) -> Self {
        debug!("Environment::tokio: called");
        Self { runtime: Some(handle) }
    }

    /// Build an environment for `kind`, picking up the ambient runtime if there is one
    pub fn from_kind(kind: DispatcherKind) -> Self {
        debug!(?kind, "Environment::from_kind: called");
        match kind {
            DispatcherKind::Inline => Self::inline(),
            DispatcherKind::Tokio => match Handle::try_current() {
                Ok(handle) => Self::tokio(handle),
                Err(_) => {
                    tracing::warn!("No tokio runtime available, falling back to inline dispatch");
                    Self::inline()
                }
            },
        }
    }

    pub fn kind(&self) -> DispatcherKind {
        if self.runtime.is_some() {
            DispatcherKind::Tokio
        } else {
            DispatcherKind::Inline
        }
    }

    /// Run `work` according to this environment
    pub fn dispatch<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match &self.runtime {
            Some(handle) => {
                handle.spawn(async move { work() });
            }
            None => work(),
        }
    }
}
