use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{generate_id, now, Id, Platform};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceOffering {
    #[serde(default = "generate_id")]
    pub id: Id,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub catalog_id: String,
    pub catalog_name: String,
    pub broker_id: Id,
    #[serde(default)]
    pub bindable: bool,
    #[serde(default)]
    pub plan_updatable: bool,
    #[serde(default)]
    pub instances_retrievable: bool,
    #[serde(default)]
    pub bindings_retrievable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default = "now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "now")]
    pub updated_at: DateTime<Utc>,
    /// Plans carried alongside the offering during catalog sync. Never persisted.
    #[serde(skip)]
    pub plans: Vec<ServicePlan>,
}

impl ServiceOffering {
    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("service offering id missing".to_string());
        }
        if self.catalog_id.is_empty() {
            return Err(format!("service offering '{}' has no catalog id", self.name));
        }
        if self.catalog_name.is_empty() {
            return Err(format!(
                "service offering with catalog id '{}' has no catalog name",
                self.catalog_id
            ));
        }
        if self.broker_id.is_empty() {
            return Err(format!(
                "service offering '{}' is not attached to a broker",
                self.catalog_name
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServicePlan {
    #[serde(default = "generate_id")]
    pub id: Id,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub catalog_id: String,
    pub catalog_name: String,
    pub service_offering_id: Id,
    #[serde(default = "default_free")]
    pub free: bool,
    /// Overrides the offering when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bindable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_updatable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schemas: Option<serde_json::Value>,
    /// Seconds; zero or absent means no plan specific bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum_polling_duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintenance_info: Option<serde_json::Value>,
    #[serde(default = "now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "now")]
    pub updated_at: DateTime<Utc>,
}

fn default_free() -> bool {
    true
}

impl ServicePlan {
    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("service plan id missing".to_string());
        }
        if self.catalog_id.is_empty() {
            return Err(format!("service plan '{}' has no catalog id", self.name));
        }
        if self.catalog_name.is_empty() {
            return Err(format!(
                "service plan with catalog id '{}' has no catalog name",
                self.catalog_id
            ));
        }
        if self.service_offering_id.is_empty() {
            return Err(format!(
                "service plan '{}' is not attached to a service offering",
                self.catalog_name
            ));
        }
        Ok(())
    }

    pub fn is_bindable(&self, offering: &ServiceOffering) -> bool {
        self.bindable.unwrap_or(offering.bindable)
    }

    /// Platform types listed under `metadata.supportedPlatforms`.
    pub fn supported_platform_types(&self) -> Option<Vec<String>> {
        self.metadata_strings("supportedPlatforms")
    }

    /// Platform names listed under `metadata.supportedPlatformNames`.
    pub fn supported_platform_names(&self) -> Option<Vec<String>> {
        self.metadata_strings("supportedPlatformNames")
    }

    pub fn supports_all_platforms(&self) -> bool {
        self.supported_platform_types().is_none() && self.supported_platform_names().is_none()
    }

    pub fn supports_platform(&self, platform: &Platform) -> bool {
        if self.supports_all_platforms() {
            return true;
        }
        let by_type = self
            .supported_platform_types()
            .is_some_and(|types| types.contains(&platform.platform_type));
        let by_name = self
            .supported_platform_names()
            .is_some_and(|names| names.contains(&platform.name));
        by_type || by_name
    }

    fn metadata_strings(&self, key: &str) -> Option<Vec<String>> {
        let values = self.metadata.as_ref()?.get(key)?.as_array()?;
        Some(
            values
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn plan(metadata: Option<serde_json::Value>) -> ServicePlan {
        ServicePlan {
            id: "p".to_string(),
            name: "small".to_string(),
            description: None,
            catalog_id: "plan-1".to_string(),
            catalog_name: "small".to_string(),
            service_offering_id: "o".to_string(),
            free: true,
            bindable: None,
            plan_updatable: None,
            metadata,
            schemas: None,
            maximum_polling_duration: None,
            maintenance_info: None,
            created_at: now(),
            updated_at: now(),
        }
    }

    fn platform(name: &str, platform_type: &str) -> Platform {
        let mut platform = Platform::new(name.to_string(), platform_type.to_string());
        platform.id = name.to_string();
        platform
    }

    #[test]
    fn plan_without_platform_metadata_supports_everything() {
        let plan = plan(None);
        assert!(plan.supports_all_platforms());
        assert!(plan.supports_platform(&platform("cf-eu", "cloudfoundry")));
    }

    #[test]
    fn plan_restricted_by_type_or_name() {
        let plan = plan(Some(json!({
            "supportedPlatforms": ["kubernetes"],
            "supportedPlatformNames": ["cf-special"]
        })));
        assert!(!plan.supports_all_platforms());
        assert!(plan.supports_platform(&platform("k8s-1", "kubernetes")));
        assert!(plan.supports_platform(&platform("cf-special", "cloudfoundry")));
        assert!(!plan.supports_platform(&platform("cf-eu", "cloudfoundry")));
    }

    #[test]
    fn validation_names_missing_fields() {
        let mut plan = plan(None);
        plan.catalog_name.clear();
        let err = plan.validate().unwrap_err();
        assert!(err.contains("plan-1"));
    }
}
