use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    Json as RequestJson,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::context::RequestContext;
use crate::error::ApiError;
use crate::interceptors::InterceptableRepository;
use crate::model::{
    Id, ObjectType, Operation, OperationType, Platform, Resource, ServiceBinding,
    ServiceBroker, ServiceInstance, ServiceOffering, ServicePlan, Visibility,
};
use crate::operations::{start_operation, Job, JobAction, Scheduler};
use crate::store::{Criterion, RepositoryExt};

pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

#[derive(Clone)]
pub struct AppState {
    pub repository: Arc<InterceptableRepository>,
    pub scheduler: Arc<Scheduler>,
}

impl AppState {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self {
            repository: scheduler.repository().clone(),
            scheduler,
        }
    }
}

/// Simple health check endpoint
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

#[derive(Debug, Serialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
    pub total: usize,
}

impl<T> From<Vec<T>> for ListResponse<T> {
    fn from(items: Vec<T>) -> Self {
        let total = items.len();
        Self { items, total }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct AsyncQuery {
    /// `false` runs the operation before responding
    #[serde(rename = "async")]
    pub is_async: Option<bool>,
}

fn request_context(headers: &HeaderMap) -> RequestContext {
    let ctx = RequestContext::new();
    match headers
        .get(CORRELATION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
    {
        Some(id) if !id.is_empty() => ctx.with_correlation_id(id),
        _ => ctx,
    }
}

fn equality_filters(filters: HashMap<String, String>) -> Vec<Criterion> {
    filters
        .into_iter()
        .map(|(field, value)| Criterion::equals(&field, value))
        .collect()
}

async fn list_of<T: Resource>(
    state: &AppState,
    criteria: &[Criterion],
) -> Result<Json<ListResponse<T>>, ApiError> {
    let items: Vec<T> = state.repository.raw().list_typed(criteria).await?;
    Ok(Json(items.into()))
}

async fn get_of<T: Resource>(state: &AppState, id: &str) -> Result<T, ApiError> {
    state.repository.raw().get_by_id(id).await.map_err(|e| {
        if e.is_not_found() {
            ApiError::not_found(format!("{} {} not found", T::OBJECT_TYPE, id))
        } else {
            e.into()
        }
    })
}

fn merge_json(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                if value.is_null() {
                    target.remove(&key);
                } else {
                    merge_json(target.entry(key).or_insert(Value::Null), value);
                }
            }
        }
        (target, patch) => *target = patch,
    }
}

/// Applies a JSON merge patch to `stored`. The id is never patched.
fn patched<T: Resource>(stored: &T, patch: Value) -> Result<T, ApiError> {
    let mut value = serde_json::to_value(stored).map_err(|e| ApiError::Internal(e.into()))?;
    merge_json(&mut value, patch);
    let updated: T = serde_json::from_value(value)
        .map_err(|e| ApiError::bad_request(format!("invalid {}: {}", T::OBJECT_TYPE, e)))?;
    if updated.id() != stored.id() {
        return Err(ApiError::bad_request("the id of an object cannot be changed"));
    }
    Ok(updated)
}

/// Instance fields owned by the control plane and the broker.
const INSTANCE_MANAGED_FIELDS: &[&str] = &[
    "ready",
    "usable",
    "previous_values",
    "platform_id",
    "dashboard_url",
];

fn reject_managed_fields(patch: &Value, fields: &[&str]) -> Result<(), ApiError> {
    let Some(patch) = patch.as_object() else {
        return Ok(());
    };
    let managed: Vec<&str> = fields
        .iter()
        .copied()
        .filter(|field| patch.contains_key(*field))
        .collect();
    if managed.is_empty() {
        return Ok(());
    }
    Err(ApiError::bad_request(format!(
        "fields cannot be changed: {}",
        managed.join(", ")
    )))
}

/// Starts an operation for `action` and schedules it, or runs it inline for `?async=false`.
async fn run_operation(
    state: &AppState,
    ctx: RequestContext,
    query: &AsyncQuery,
    operation: Operation,
    action: JobAction,
) -> Result<Response, ApiError> {
    let resource_type = operation.resource_type;
    let resource_id = operation.resource_id.clone();
    let operation = start_operation(state.repository.raw().as_ref(), &ctx, operation).await?;

    if query.is_async.unwrap_or(true) {
        let scheduler = &state.scheduler;
        let operation_id = operation.id.clone();
        match action {
            JobAction::Create(object) => scheduler.schedule_create(&ctx, object, operation_id),
            JobAction::Update(object) => scheduler.schedule_update(&ctx, object, operation_id),
            JobAction::Delete {
                object_type,
                criteria,
            } => scheduler.schedule_delete(&ctx, object_type, criteria, operation_id),
        }
        return Ok((StatusCode::ACCEPTED, Json(operation)).into_response());
    }

    let is_delete = matches!(action, JobAction::Delete { .. });
    state
        .scheduler
        .execute(Job::new(&ctx, operation.id.clone(), action))
        .await?;
    if is_delete {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }
    let object = state
        .repository
        .raw()
        .get(resource_type, &[Criterion::equals("id", resource_id)])
        .await?;
    let body = object.to_value().map_err(|e| ApiError::Internal(e.into()))?;
    Ok((StatusCode::CREATED, Json(body)).into_response())
}

// Brokers

pub async fn list_brokers(
    State(state): State<AppState>,
) -> Result<Json<ListResponse<ServiceBroker>>, ApiError> {
    let brokers: Vec<ServiceBroker> = state.repository.raw().list_typed(&[]).await?;
    Ok(Json(
        brokers
            .iter()
            .map(ServiceBroker::redacted)
            .collect::<Vec<_>>()
            .into(),
    ))
}

pub async fn get_broker(
    State(state): State<AppState>,
    Path(id): Path<Id>,
) -> Result<Json<ServiceBroker>, ApiError> {
    let broker: ServiceBroker = get_of(&state, &id).await?;
    Ok(Json(broker.redacted()))
}

pub async fn create_broker(
    State(state): State<AppState>,
    headers: HeaderMap,
    RequestJson(broker): RequestJson<ServiceBroker>,
) -> Result<(StatusCode, Json<ServiceBroker>), ApiError> {
    let ctx = request_context(&headers);
    let created = state.repository.create(&ctx, broker.into_object()).await?;
    let broker = ServiceBroker::from_object(created)
        .map_err(|_| ApiError::Internal(anyhow::anyhow!("broker pipeline returned another type")))?;
    Ok((StatusCode::CREATED, Json(broker.redacted())))
}

pub async fn update_broker(
    State(state): State<AppState>,
    Path(id): Path<Id>,
    headers: HeaderMap,
    RequestJson(patch): RequestJson<Value>,
) -> Result<Json<ServiceBroker>, ApiError> {
    let ctx = request_context(&headers);
    let stored: ServiceBroker = get_of(&state, &id).await?;
    let broker = patched(&stored, patch)?;
    let updated = state.repository.update(&ctx, broker.into_object()).await?;
    let broker = ServiceBroker::from_object(updated)
        .map_err(|_| ApiError::Internal(anyhow::anyhow!("broker pipeline returned another type")))?;
    Ok(Json(broker.redacted()))
}

pub async fn delete_broker(
    State(state): State<AppState>,
    Path(id): Path<Id>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let ctx = request_context(&headers);
    state
        .repository
        .delete(&ctx, ObjectType::ServiceBroker, &[Criterion::equals("id", id)])
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// Platforms

pub async fn list_platforms(
    State(state): State<AppState>,
) -> Result<Json<ListResponse<Platform>>, ApiError> {
    list_of(&state, &[]).await
}

pub async fn create_platform(
    State(state): State<AppState>,
    headers: HeaderMap,
    RequestJson(platform): RequestJson<Platform>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let ctx = request_context(&headers);
    let created = state.repository.create(&ctx, platform.into_object()).await?;
    let body = created.to_value().map_err(|e| ApiError::Internal(e.into()))?;
    Ok((StatusCode::CREATED, Json(body)))
}

// Catalog listings

pub async fn list_offerings(
    State(state): State<AppState>,
    Query(filters): Query<HashMap<String, String>>,
) -> Result<Json<ListResponse<ServiceOffering>>, ApiError> {
    list_of(&state, &equality_filters(filters)).await
}

pub async fn list_plans(
    State(state): State<AppState>,
    Query(filters): Query<HashMap<String, String>>,
) -> Result<Json<ListResponse<ServicePlan>>, ApiError> {
    list_of(&state, &equality_filters(filters)).await
}

pub async fn list_visibilities(
    State(state): State<AppState>,
    Query(filters): Query<HashMap<String, String>>,
) -> Result<Json<ListResponse<Visibility>>, ApiError> {
    list_of(&state, &equality_filters(filters)).await
}

// Instances

pub async fn list_instances(
    State(state): State<AppState>,
) -> Result<Json<ListResponse<ServiceInstance>>, ApiError> {
    list_of(&state, &[]).await
}

pub async fn get_instance(
    State(state): State<AppState>,
    Path(id): Path<Id>,
) -> Result<Json<ServiceInstance>, ApiError> {
    Ok(Json(get_of(&state, &id).await?))
}

pub async fn create_instance(
    State(state): State<AppState>,
    Query(query): Query<AsyncQuery>,
    headers: HeaderMap,
    RequestJson(instance): RequestJson<ServiceInstance>,
) -> Result<Response, ApiError> {
    let ctx = request_context(&headers);
    let _: ServicePlan = get_of(&state, &instance.service_plan_id).await?;
    let operation = Operation::new(
        OperationType::Create,
        ObjectType::ServiceInstance,
        instance.id.clone(),
    );
    run_operation(&state, ctx, &query, operation, JobAction::Create(instance.into_object())).await
}

pub async fn update_instance(
    State(state): State<AppState>,
    Path(id): Path<Id>,
    Query(query): Query<AsyncQuery>,
    headers: HeaderMap,
    RequestJson(patch): RequestJson<Value>,
) -> Result<Response, ApiError> {
    let ctx = request_context(&headers);
    reject_managed_fields(&patch, INSTANCE_MANAGED_FIELDS)?;
    let stored: ServiceInstance = get_of(&state, &id).await?;
    let instance = patched(&stored, patch)?;
    let operation = Operation::new(OperationType::Update, ObjectType::ServiceInstance, id);
    run_operation(&state, ctx, &query, operation, JobAction::Update(instance.into_object())).await
}

pub async fn delete_instance(
    State(state): State<AppState>,
    Path(id): Path<Id>,
    Query(query): Query<AsyncQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let ctx = request_context(&headers);
    let _: ServiceInstance = get_of(&state, &id).await?;
    let operation = Operation::new(OperationType::Delete, ObjectType::ServiceInstance, id.clone());
    let action = JobAction::Delete {
        object_type: ObjectType::ServiceInstance,
        criteria: vec![Criterion::equals("id", id)],
    };
    run_operation(&state, ctx, &query, operation, action).await
}

// Bindings

pub async fn list_bindings(
    State(state): State<AppState>,
) -> Result<Json<ListResponse<ServiceBinding>>, ApiError> {
    list_of(&state, &[]).await
}

pub async fn get_binding(
    State(state): State<AppState>,
    Path(id): Path<Id>,
) -> Result<Json<ServiceBinding>, ApiError> {
    Ok(Json(get_of(&state, &id).await?))
}

pub async fn create_binding(
    State(state): State<AppState>,
    Query(query): Query<AsyncQuery>,
    headers: HeaderMap,
    RequestJson(binding): RequestJson<ServiceBinding>,
) -> Result<Response, ApiError> {
    let ctx = request_context(&headers);
    let _: ServiceInstance = get_of(&state, &binding.service_instance_id).await?;
    let operation = Operation::new(
        OperationType::Create,
        ObjectType::ServiceBinding,
        binding.id.clone(),
    );
    run_operation(&state, ctx, &query, operation, JobAction::Create(binding.into_object())).await
}

pub async fn delete_binding(
    State(state): State<AppState>,
    Path(id): Path<Id>,
    Query(query): Query<AsyncQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let ctx = request_context(&headers);
    let _: ServiceBinding = get_of(&state, &id).await?;
    let operation = Operation::new(OperationType::Delete, ObjectType::ServiceBinding, id.clone());
    let action = JobAction::Delete {
        object_type: ObjectType::ServiceBinding,
        criteria: vec![Criterion::equals("id", id)],
    };
    run_operation(&state, ctx, &query, operation, action).await
}

// Operations

pub async fn get_operation(
    State(state): State<AppState>,
    Path(id): Path<Id>,
) -> Result<Json<Operation>, ApiError> {
    Ok(Json(get_of(&state, &id).await?))
}
