//! Event vocabulary shared by the status reporter and the controller.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// `Normal` / `Info`
    Info,
    /// `Warning` / `Error`
    Error,
    /// `Warning` / `StatusFailure`
    StatusFailure,
}

impl EventKind {
    pub fn type_str(self) -> &'static str {
        match self {
            EventKind::Info => "Normal",
            EventKind::Error | EventKind::StatusFailure => "Warning",
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            EventKind::Info => "Info",
            EventKind::Error => "Error",
            EventKind::StatusFailure => "StatusFailure",
        }
    }

    pub fn is_warning(self) -> bool {
        !matches!(self, EventKind::Info)
    }
}

/// Publishes free-text events about an object. Publishing is best effort:
/// implementations log their own failures and never fail the caller.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, regarding: &ObjectReference, kind: EventKind, message: String);
}
