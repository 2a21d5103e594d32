use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{generate_id, now, Id, Labels};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Visibility {
    #[serde(default = "generate_id")]
    pub id: Id,
    /// None makes the plan visible on every platform
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_id: Option<Id>,
    pub service_plan_id: Id,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default = "now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "now")]
    pub updated_at: DateTime<Utc>,
}

impl Visibility {
    pub fn new(service_plan_id: Id, platform_id: Option<Id>) -> Self {
        Self {
            id: generate_id(),
            platform_id,
            service_plan_id,
            labels: Labels::new(),
            created_at: now(),
            updated_at: now(),
        }
    }

    pub fn is_public(&self) -> bool {
        self.platform_id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Platform {
    #[serde(default = "generate_id")]
    pub id: Id,
    pub name: String,
    #[serde(rename = "type")]
    pub platform_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default = "now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "now")]
    pub updated_at: DateTime<Utc>,
}

impl Platform {
    pub fn new(name: String, platform_type: String) -> Self {
        Self {
            id: generate_id(),
            name,
            platform_type,
            description: None,
            labels: Labels::new(),
            created_at: now(),
            updated_at: now(),
        }
    }
}
