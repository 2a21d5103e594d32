use serde_json::{Map, Value};

use crate::model::{label_value, Labels};

/// Builds the OSB `context` object sent with provision, update and bind requests.
///
/// Starts from the context stored on the resource and adds the platform, the resource name
/// under `name_key` and, when configured, the tenant label value.
pub fn osb_context(
    existing: Option<&Value>,
    platform: &str,
    name_key: &str,
    name: &str,
    labels: &Labels,
    tenant_label_key: Option<&str>,
) -> Value {
    let mut context = match existing {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    };
    context.insert("platform".to_string(), Value::String(platform.to_string()));
    context.insert(name_key.to_string(), Value::String(name.to_string()));
    if let Some(key) = tenant_label_key {
        if let Some(tenant) = label_value(labels, key) {
            context.insert(key.to_string(), Value::String(tenant.to_string()));
        }
    }
    Value::Object(context)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn injects_platform_name_and_tenant() {
        let mut labels = Labels::new();
        labels.insert("tenant".to_string(), vec!["t-1".to_string()]);
        let existing = json!({"origin": "api"});

        let context = osb_context(
            Some(&existing),
            "service-manager",
            "instance_name",
            "db",
            &labels,
            Some("tenant"),
        );
        assert_eq!(
            context,
            json!({
                "origin": "api",
                "platform": "service-manager",
                "instance_name": "db",
                "tenant": "t-1"
            })
        );
    }

    #[test]
    fn tenant_is_skipped_when_label_missing() {
        let context = osb_context(None, "sm", "binding_name", "b", &Labels::new(), Some("tenant"));
        assert!(context.get("tenant").is_none());
        assert_eq!(context["binding_name"], "b");
    }
}
