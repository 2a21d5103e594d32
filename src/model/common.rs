use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

pub type Id = String;

/// Label key -> values, attached to tenant-scoped entities.
pub type Labels = BTreeMap<String, Vec<String>>;

/// Platform id used for instances and bindings managed by the control plane itself.
pub const SM_PLATFORM: &str = "service-manager";

pub fn generate_id() -> Id {
    Uuid::new_v4().to_string()
}

pub fn now() -> DateTime<Utc> {
    Utc::now()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicCredentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TlsCredentials {
    /// PEM encoded client certificate
    pub certificate: String,
    /// PEM encoded private key
    pub key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic: Option<BasicCredentials>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsCredentials>,
}

/// Returns the first value of `key`, if the label is present.
pub fn label_value<'a>(labels: &'a Labels, key: &str) -> Option<&'a str> {
    labels
        .get(key)
        .and_then(|values| values.first())
        .map(String::as_str)
}
