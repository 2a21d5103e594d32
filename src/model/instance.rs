use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{generate_id, now, Id, Labels, SM_PLATFORM};

fn default_platform() -> Id {
    SM_PLATFORM.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    #[serde(default = "generate_id")]
    pub id: Id,
    pub name: String,
    pub service_plan_id: Id,
    #[serde(default = "default_platform")]
    pub platform_id: Id,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
    /// Provisioning parameters; forwarded to the broker, never stored
    #[serde(default, skip_serializing)]
    pub parameters: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dashboard_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintenance_info: Option<serde_json::Value>,
    /// Snapshot taken before an update so a failed update can be rolled back
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_values: Option<serde_json::Value>,
    #[serde(default)]
    pub usable: bool,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default = "now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "now")]
    pub updated_at: DateTime<Utc>,
}

impl ServiceInstance {
    pub fn new(name: String, service_plan_id: Id) -> Self {
        Self {
            id: generate_id(),
            name,
            service_plan_id,
            platform_id: default_platform(),
            context: None,
            parameters: None,
            dashboard_url: None,
            maintenance_info: None,
            previous_values: None,
            usable: false,
            ready: false,
            labels: Labels::new(),
            created_at: now(),
            updated_at: now(),
        }
    }

    pub fn is_managed(&self) -> bool {
        self.platform_id == SM_PLATFORM
    }
}

/// Values restored when an instance update fails at the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviousValues {
    pub service_plan_id: Id,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintenance_info: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceBinding {
    #[serde(default = "generate_id")]
    pub id: Id,
    pub name: String,
    pub service_instance_id: Id,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
    /// Binding parameters; forwarded to the broker, never stored
    #[serde(default, skip_serializing)]
    pub parameters: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_resource: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub syslog_drain_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_service_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_mounts: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoints: Option<serde_json::Value>,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default = "now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "now")]
    pub updated_at: DateTime<Utc>,
}

impl ServiceBinding {
    pub fn new(name: String, service_instance_id: Id) -> Self {
        Self {
            id: generate_id(),
            name,
            service_instance_id,
            context: None,
            parameters: None,
            bind_resource: None,
            credentials: None,
            syslog_drain_url: None,
            route_service_url: None,
            volume_mounts: None,
            endpoints: None,
            ready: false,
            labels: Labels::new(),
            created_at: now(),
            updated_at: now(),
        }
    }
}
