use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::model::{
    now, Operation, Platform, ServiceBinding, ServiceBroker, ServiceInstance, ServiceOffering,
    ServicePlan, Visibility,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    ServiceBroker,
    ServiceOffering,
    ServicePlan,
    ServiceInstance,
    ServiceBinding,
    Operation,
    Visibility,
    Platform,
}

impl ObjectType {
    pub const ALL: [ObjectType; 8] = [
        ObjectType::ServiceBroker,
        ObjectType::ServiceOffering,
        ObjectType::ServicePlan,
        ObjectType::ServiceInstance,
        ObjectType::ServiceBinding,
        ObjectType::Operation,
        ObjectType::Visibility,
        ObjectType::Platform,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::ServiceBroker => "service_broker",
            ObjectType::ServiceOffering => "service_offering",
            ObjectType::ServicePlan => "service_plan",
            ObjectType::ServiceInstance => "service_instance",
            ObjectType::ServiceBinding => "service_binding",
            ObjectType::Operation => "operation",
            ObjectType::Visibility => "visibility",
            ObjectType::Platform => "platform",
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Any storable entity. Dispatch on the variant replaces runtime downcasts.
#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    ServiceBroker(ServiceBroker),
    ServiceOffering(ServiceOffering),
    ServicePlan(ServicePlan),
    ServiceInstance(ServiceInstance),
    ServiceBinding(ServiceBinding),
    Operation(Operation),
    Visibility(Visibility),
    Platform(Platform),
}

macro_rules! each_object {
    ($object:expr, $inner:ident => $body:expr) => {
        match $object {
            Object::ServiceBroker($inner) => $body,
            Object::ServiceOffering($inner) => $body,
            Object::ServicePlan($inner) => $body,
            Object::ServiceInstance($inner) => $body,
            Object::ServiceBinding($inner) => $body,
            Object::Operation($inner) => $body,
            Object::Visibility($inner) => $body,
            Object::Platform($inner) => $body,
        }
    };
}

impl Object {
    pub fn object_type(&self) -> ObjectType {
        match self {
            Object::ServiceBroker(_) => ObjectType::ServiceBroker,
            Object::ServiceOffering(_) => ObjectType::ServiceOffering,
            Object::ServicePlan(_) => ObjectType::ServicePlan,
            Object::ServiceInstance(_) => ObjectType::ServiceInstance,
            Object::ServiceBinding(_) => ObjectType::ServiceBinding,
            Object::Operation(_) => ObjectType::Operation,
            Object::Visibility(_) => ObjectType::Visibility,
            Object::Platform(_) => ObjectType::Platform,
        }
    }

    pub fn id(&self) -> &str {
        each_object!(self, o => o.id.as_str())
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        each_object!(self, o => o.created_at)
    }

    pub fn set_created_at(&mut self, created_at: DateTime<Utc>) {
        each_object!(self, o => o.created_at = created_at)
    }

    pub fn touch(&mut self) {
        each_object!(self, o => o.updated_at = now())
    }

    /// Key that must be unique among objects of the same type, if the type has one.
    pub fn unique_key(&self) -> Option<String> {
        match self {
            Object::ServiceBroker(b) => Some(format!("name={}", b.name)),
            Object::Platform(p) => Some(format!("name={}", p.name)),
            Object::ServiceOffering(o) => {
                Some(format!("broker_id={}/catalog_id={}", o.broker_id, o.catalog_id))
            }
            Object::ServicePlan(p) => Some(format!(
                "service_offering_id={}/catalog_id={}",
                p.service_offering_id, p.catalog_id
            )),
            _ => None,
        }
    }

    pub fn to_value(&self) -> serde_json::Result<serde_json::Value> {
        each_object!(self, o => serde_json::to_value(o))
    }

    pub fn from_value(
        object_type: ObjectType,
        value: serde_json::Value,
    ) -> serde_json::Result<Object> {
        Ok(match object_type {
            ObjectType::ServiceBroker => Object::ServiceBroker(serde_json::from_value(value)?),
            ObjectType::ServiceOffering => Object::ServiceOffering(serde_json::from_value(value)?),
            ObjectType::ServicePlan => Object::ServicePlan(serde_json::from_value(value)?),
            ObjectType::ServiceInstance => Object::ServiceInstance(serde_json::from_value(value)?),
            ObjectType::ServiceBinding => Object::ServiceBinding(serde_json::from_value(value)?),
            ObjectType::Operation => Object::Operation(serde_json::from_value(value)?),
            ObjectType::Visibility => Object::Visibility(serde_json::from_value(value)?),
            ObjectType::Platform => Object::Platform(serde_json::from_value(value)?),
        })
    }
}

/// A concrete entity type that can travel through the repository and interceptor pipelines.
pub trait Resource:
    Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const OBJECT_TYPE: ObjectType;

    fn id(&self) -> &str;
    fn into_object(self) -> Object;
    /// Gives the object back when it holds a different entity type.
    fn from_object(object: Object) -> Result<Self, Object>;
}

macro_rules! impl_resource {
    ($ty:ident) => {
        impl Resource for $ty {
            const OBJECT_TYPE: ObjectType = ObjectType::$ty;

            fn id(&self) -> &str {
                &self.id
            }

            fn into_object(self) -> Object {
                Object::$ty(self)
            }

            fn from_object(object: Object) -> Result<Self, Object> {
                match object {
                    Object::$ty(inner) => Ok(inner),
                    other => Err(other),
                }
            }
        }

        impl From<$ty> for Object {
            fn from(value: $ty) -> Self {
                Object::$ty(value)
            }
        }
    };
}

impl_resource!(ServiceBroker);
impl_resource!(ServiceOffering);
impl_resource!(ServicePlan);
impl_resource!(ServiceInstance);
impl_resource!(ServiceBinding);
impl_resource!(Operation);
impl_resource!(Visibility);
impl_resource!(Platform);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_fields_do_not_survive_serialization() {
        let mut instance = ServiceInstance::new("db".to_string(), "plan".to_string());
        instance.parameters = Some(serde_json::json!({"size": 3}));
        let object = Object::from(instance.clone());

        let value = object.to_value().unwrap();
        assert!(value.get("parameters").is_none());

        let restored = Object::from_value(ObjectType::ServiceInstance, value).unwrap();
        let restored = ServiceInstance::from_object(restored).unwrap();
        assert_eq!(restored.id, instance.id);
        assert_eq!(restored.parameters, None);
    }

    #[test]
    fn mismatched_variant_is_returned() {
        let object = Object::from(Platform::new("cf".to_string(), "cloudfoundry".to_string()));
        let err = ServiceBroker::from_object(object).unwrap_err();
        assert_eq!(err.object_type(), ObjectType::Platform);
    }
}
