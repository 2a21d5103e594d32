use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::model::{generate_id, now, Id, ObjectType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationType::Create => "create",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationState {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "in progress")]
    InProgress,
    #[serde(rename = "succeeded")]
    Succeeded,
    #[serde(rename = "failed")]
    Failed,
}

impl OperationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationState::Pending => "pending",
            OperationState::InProgress => "in progress",
            OperationState::Succeeded => "succeeded",
            OperationState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationState::Succeeded | OperationState::Failed)
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationError {
    #[serde(rename = "error")]
    pub error_type: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    #[serde(default = "generate_id")]
    pub id: Id,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    pub state: OperationState,
    pub resource_id: Id,
    pub resource_type: ObjectType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_id: Option<Id>,
    #[serde(default)]
    pub correlation_id: String,
    /// Operation key returned by the broker for async requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    /// The next execution resumes polling instead of sending the broker request again
    #[serde(default)]
    pub reschedule: bool,
    /// Set when orphan mitigation is pending for the resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_scheduled: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cascade_root_id: Option<Id>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<OperationError>,
    #[serde(default = "now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "now")]
    pub updated_at: DateTime<Utc>,
}

impl Operation {
    pub fn new(op_type: OperationType, resource_type: ObjectType, resource_id: Id) -> Self {
        Self {
            id: generate_id(),
            op_type,
            state: OperationState::Pending,
            resource_id,
            resource_type,
            platform_id: None,
            correlation_id: String::new(),
            external_id: None,
            reschedule: false,
            deletion_scheduled: None,
            cascade_root_id: None,
            errors: Vec::new(),
            created_at: now(),
            updated_at: now(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn fail(&mut self, error_type: &str, description: String) {
        self.state = OperationState::Failed;
        self.reschedule = false;
        self.errors.push(OperationError {
            error_type: error_type.to_string(),
            description,
        });
    }
}
