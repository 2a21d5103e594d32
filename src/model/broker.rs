use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{generate_id, now, Credentials, Id, Labels, ServiceOffering};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceBroker {
    #[serde(default = "generate_id")]
    pub id: Id,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub broker_url: String,
    #[serde(default)]
    pub credentials: Credentials,
    /// Raw catalog as last fetched from the broker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog: Option<serde_json::Value>,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default = "now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "now")]
    pub updated_at: DateTime<Utc>,
    /// Offerings (with plans) built during catalog sync. Never persisted.
    #[serde(skip)]
    pub services: Vec<ServiceOffering>,
}

impl ServiceBroker {
    pub fn new(name: String, broker_url: String, credentials: Credentials) -> Self {
        Self {
            id: generate_id(),
            name,
            description: None,
            broker_url,
            credentials,
            catalog: None,
            labels: Labels::new(),
            created_at: now(),
            updated_at: now(),
            services: Vec::new(),
        }
    }

    /// Copy suitable for API responses: credentials are never echoed back.
    pub fn redacted(&self) -> Self {
        let mut broker = self.clone();
        broker.credentials = Credentials::default();
        broker
    }
}
