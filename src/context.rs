use tokio_util::sync::CancellationToken;

use crate::model::{generate_id, Id};

/// Per request (or per job) values handed to every hook.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub correlation_id: String,
    /// Operation tracking the current mutation, if it runs as an async operation
    pub operation_id: Option<Id>,
    pub cancellation: CancellationToken,
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            correlation_id: generate_id(),
            operation_id: None,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn with_operation(mut self, operation_id: Id) -> Self {
        self.operation_id = Some(operation_id);
        self
    }

    /// Copy whose cancellation is triggered with, but not propagated to, this context.
    pub fn child(&self) -> Self {
        Self {
            correlation_id: self.correlation_id.clone(),
            operation_id: self.operation_id.clone(),
            cancellation: self.cancellation.child_token(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}
