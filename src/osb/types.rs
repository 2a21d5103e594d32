use serde::{Deserialize, Serialize};
use serde_json::Value;

// Catalog

#[derive(Debug, Clone, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub services: Vec<CatalogService>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogService {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub bindable: Option<bool>,
    #[serde(default)]
    pub plan_updateable: Option<bool>,
    #[serde(default)]
    pub instances_retrievable: Option<bool>,
    #[serde(default)]
    pub bindings_retrievable: Option<bool>,
    #[serde(default)]
    pub tags: Option<Value>,
    #[serde(default)]
    pub requires: Option<Value>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub plans: Vec<CatalogPlan>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogPlan {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub free: Option<bool>,
    #[serde(default)]
    pub bindable: Option<bool>,
    #[serde(default)]
    pub plan_updateable: Option<bool>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub schemas: Option<Value>,
    #[serde(default)]
    pub maximum_polling_duration: Option<u64>,
    #[serde(default)]
    pub maintenance_info: Option<Value>,
}

// Instances

#[derive(Debug, Clone, Serialize)]
pub struct ProvisionRequest {
    #[serde(skip)]
    pub instance_id: String,
    pub service_id: String,
    pub plan_id: String,
    pub organization_guid: String,
    pub space_guid: String,
    pub context: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maintenance_info: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProvisionResponse {
    pub is_async: bool,
    pub dashboard_url: Option<String>,
    pub operation_key: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PreviousValuesRequest {
    pub plan_id: String,
    pub service_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maintenance_info: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateInstanceRequest {
    #[serde(skip)]
    pub instance_id: String,
    pub service_id: String,
    pub plan_id: String,
    pub context: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maintenance_info: Option<Value>,
    pub previous_values: PreviousValuesRequest,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateInstanceResponse {
    pub is_async: bool,
    pub dashboard_url: Option<String>,
    pub operation_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DeprovisionRequest {
    pub instance_id: String,
    pub service_id: String,
    pub plan_id: String,
}

/// Response of an asynchronous-capable delete (deprovision or unbind).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeleteResponse {
    pub is_async: bool,
    pub operation_key: Option<String>,
}

// Bindings

#[derive(Debug, Clone, Serialize)]
pub struct BindRequest {
    #[serde(skip)]
    pub instance_id: String,
    #[serde(skip)]
    pub binding_id: String,
    pub service_id: String,
    pub plan_id: String,
    pub context: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_resource: Option<Value>,
}

/// Binding payload returned by bind and by fetching an existing binding.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BindingDetails {
    #[serde(default)]
    pub credentials: Option<Value>,
    #[serde(default)]
    pub syslog_drain_url: Option<String>,
    #[serde(default)]
    pub route_service_url: Option<String>,
    #[serde(default)]
    pub volume_mounts: Option<Value>,
    #[serde(default)]
    pub endpoints: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BindResponse {
    pub is_async: bool,
    pub operation_key: Option<String>,
    pub details: BindingDetails,
}

#[derive(Debug, Clone)]
pub struct UnbindRequest {
    pub instance_id: String,
    pub binding_id: String,
    pub service_id: String,
    pub plan_id: String,
}

#[derive(Debug, Clone)]
pub struct GetBindingRequest {
    pub instance_id: String,
    pub binding_id: String,
}

// Polling

#[derive(Debug, Clone)]
pub struct LastOperationRequest {
    pub instance_id: String,
    /// Set when polling a binding operation
    pub binding_id: Option<String>,
    pub service_id: String,
    pub plan_id: String,
    pub operation_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum LastOperationState {
    #[serde(rename = "in progress")]
    InProgress,
    #[serde(rename = "succeeded")]
    Succeeded,
    #[serde(rename = "failed")]
    Failed,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LastOperationResponse {
    pub state: LastOperationState,
    #[serde(default)]
    pub description: Option<String>,
}

/// Error body defined by the OSB API.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BrokerErrorBody {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}
