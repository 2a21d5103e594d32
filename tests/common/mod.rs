#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use osb_manager::context::RequestContext;
use osb_manager::error::ApiError;
use osb_manager::interceptors::{InterceptableRepository, InterceptorRegistry};
use osb_manager::model::{
    Credentials, Object, ObjectType, Operation, OperationType, Resource, ServiceBroker,
    ServiceOffering, ServicePlan,
};
use osb_manager::operations::{start_operation, Job, JobAction, Scheduler, SchedulerSettings};
use osb_manager::osb::types::*;
use osb_manager::osb::{BrokerClient, ClientFactory, OsbError, OsbSettings};
use osb_manager::store::{Criterion, InMemoryRepository, RepositoryExt, TransactionalRepository};

type Script<T> = Mutex<VecDeque<Result<T, OsbError>>>;

/// Broker double. Each endpoint answers from its script, or with a synchronous success once
/// the script is exhausted. Every call is recorded.
#[derive(Default)]
pub struct FakeBroker {
    pub catalog: Mutex<Value>,
    pub catalog_error: Mutex<Option<OsbError>>,
    pub provision: Script<ProvisionResponse>,
    pub update: Script<UpdateInstanceResponse>,
    pub deprovision: Script<DeleteResponse>,
    pub bind: Script<BindResponse>,
    pub unbind: Script<DeleteResponse>,
    pub last_operation: Script<LastOperationResponse>,
    pub binding: Script<BindingDetails>,
    pub calls: Mutex<Vec<String>>,
    pub polled_keys: Mutex<Vec<Option<String>>>,
    /// How long the broker takes to answer a last operation poll
    pub poll_delay: Mutex<Option<Duration>>,
}

fn next<T: Default>(script: &Script<T>) -> Result<T, OsbError> {
    script.lock().pop_front().unwrap_or_else(|| Ok(T::default()))
}

impl FakeBroker {
    pub fn new(catalog: Value) -> Arc<Self> {
        let broker = Self::default();
        *broker.catalog.lock() = catalog;
        Arc::new(broker)
    }

    pub fn set_catalog(&self, catalog: Value) {
        *self.catalog.lock() = catalog;
    }

    pub fn calls_to(&self, endpoint: &str) -> usize {
        self.calls.lock().iter().filter(|c| *c == endpoint).count()
    }

    fn record(&self, endpoint: &str) {
        self.calls.lock().push(endpoint.to_string());
    }
}

pub fn succeeded() -> LastOperationResponse {
    LastOperationResponse {
        state: LastOperationState::Succeeded,
        description: None,
    }
}

pub fn in_progress() -> LastOperationResponse {
    LastOperationResponse {
        state: LastOperationState::InProgress,
        description: None,
    }
}

pub fn failed(description: &str) -> LastOperationResponse {
    LastOperationResponse {
        state: LastOperationState::Failed,
        description: Some(description.to_string()),
    }
}

pub fn accepted(operation: &str) -> ProvisionResponse {
    ProvisionResponse {
        is_async: true,
        dashboard_url: None,
        operation_key: Some(operation.to_string()),
    }
}

#[async_trait::async_trait]
impl BrokerClient for FakeBroker {
    async fn get_catalog(&self) -> Result<Value, OsbError> {
        self.record("catalog");
        if let Some(err) = self.catalog_error.lock().clone() {
            return Err(err);
        }
        Ok(self.catalog.lock().clone())
    }

    async fn provision_instance(
        &self,
        _: &ProvisionRequest,
    ) -> Result<ProvisionResponse, OsbError> {
        self.record("provision");
        next(&self.provision)
    }

    async fn update_instance(
        &self,
        _: &UpdateInstanceRequest,
    ) -> Result<UpdateInstanceResponse, OsbError> {
        self.record("update");
        next(&self.update)
    }

    async fn deprovision_instance(
        &self,
        _: &DeprovisionRequest,
    ) -> Result<DeleteResponse, OsbError> {
        self.record("deprovision");
        next(&self.deprovision)
    }

    async fn bind(&self, _: &BindRequest) -> Result<BindResponse, OsbError> {
        self.record("bind");
        next(&self.bind)
    }

    async fn unbind(&self, _: &UnbindRequest) -> Result<DeleteResponse, OsbError> {
        self.record("unbind");
        next(&self.unbind)
    }

    async fn poll_last_operation(
        &self,
        request: &LastOperationRequest,
    ) -> Result<LastOperationResponse, OsbError> {
        self.record("last_operation");
        self.polled_keys.lock().push(request.operation_key.clone());
        let delay = *self.poll_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.last_operation
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(succeeded()))
    }

    async fn poll_binding_last_operation(
        &self,
        request: &LastOperationRequest,
    ) -> Result<LastOperationResponse, OsbError> {
        self.record("binding_last_operation");
        self.polled_keys.lock().push(request.operation_key.clone());
        self.last_operation
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(succeeded()))
    }

    async fn get_binding(&self, _: &GetBindingRequest) -> Result<BindingDetails, OsbError> {
        self.record("get_binding");
        next(&self.binding)
    }
}

pub struct FakeClientFactory {
    pub broker: Arc<FakeBroker>,
}

impl ClientFactory for FakeClientFactory {
    fn client_for(&self, _: &ServiceBroker) -> Result<Arc<dyn BrokerClient>, OsbError> {
        Ok(self.broker.clone())
    }
}

/// Catalog with the given services, each listing its plan catalog ids.
pub fn catalog(services: &[(&str, &[&str])]) -> Value {
    let services: Vec<Value> = services
        .iter()
        .map(|(service, plans)| {
            let plans: Vec<Value> = plans
                .iter()
                .map(|plan| json!({"id": plan, "name": format!("{}-name", plan)}))
                .collect();
            json!({
                "id": service,
                "name": format!("{}-name", service),
                "bindable": true,
                "plans": plans,
            })
        })
        .collect();
    json!({ "services": services })
}

pub fn osb_settings() -> OsbSettings {
    OsbSettings {
        polling_interval: Duration::from_millis(10),
        default_max_polling: None,
        tenant_label_key: None,
    }
}

/// In-memory control plane wired to one fake broker.
pub struct Harness {
    pub repository: Arc<InMemoryRepository>,
    pub broker: Arc<FakeBroker>,
    pub interceptable: Arc<InterceptableRepository>,
    pub scheduler: Arc<Scheduler>,
    pub shutdown: CancellationToken,
}

impl Harness {
    pub fn new(catalog: Value) -> Self {
        Self::with_settings(catalog, osb_settings())
    }

    pub fn with_settings(catalog: Value, settings: OsbSettings) -> Self {
        let repository = Arc::new(InMemoryRepository::new());
        let broker = FakeBroker::new(catalog);
        let clients = Arc::new(FakeClientFactory {
            broker: broker.clone(),
        });
        let mut registry = InterceptorRegistry::new();
        osb_manager::register_interceptors(
            &mut registry,
            repository.clone(),
            clients,
            settings,
            osb_manager::catalog::free_plans_are_public(),
        );
        let interceptable = Arc::new(
            registry
                .build(repository.clone())
                .expect("interceptor chains resolve"),
        );
        let shutdown = CancellationToken::new();
        let scheduler = Arc::new(Scheduler::new(
            interceptable.clone(),
            SchedulerSettings {
                pool_size: 4,
                queue_size: 16,
                job_timeout: Duration::from_secs(5),
            },
            shutdown.clone(),
        ));
        Self {
            repository,
            broker,
            interceptable,
            scheduler,
            shutdown,
        }
    }

    pub fn raw(&self) -> &dyn TransactionalRepository {
        self.repository.as_ref()
    }

    pub async fn register_broker(&self, name: &str) -> Result<ServiceBroker, ApiError> {
        let broker = ServiceBroker::new(
            name.to_string(),
            "http://broker.example".to_string(),
            Credentials::default(),
        );
        let created = self
            .interceptable
            .create(&RequestContext::new(), broker.into_object())
            .await?;
        Ok(ServiceBroker::from_object(created).expect("broker"))
    }

    pub async fn resync_broker(&self, broker: &ServiceBroker) -> Result<ServiceBroker, ApiError> {
        let updated = self
            .interceptable
            .update(&RequestContext::new(), broker.clone().into_object())
            .await?;
        Ok(ServiceBroker::from_object(updated).expect("broker"))
    }

    pub async fn offerings(&self) -> Vec<ServiceOffering> {
        self.repository.list_typed(&[]).await.unwrap()
    }

    pub async fn plans(&self) -> Vec<ServicePlan> {
        self.repository.list_typed(&[]).await.unwrap()
    }

    pub async fn plan(&self, catalog_id: &str) -> ServicePlan {
        self.repository
            .get_typed(&[Criterion::equals("catalog_id", catalog_id)])
            .await
            .unwrap()
    }

    /// Starts an operation and executes its job on the current task.
    pub async fn run(
        &self,
        op_type: OperationType,
        resource_type: ObjectType,
        resource_id: &str,
        action: JobAction,
    ) -> (Operation, Result<(), ApiError>) {
        self.run_with_context(&RequestContext::new(), op_type, resource_type, resource_id, action)
            .await
    }

    pub async fn run_with_context(
        &self,
        ctx: &RequestContext,
        op_type: OperationType,
        resource_type: ObjectType,
        resource_id: &str,
        action: JobAction,
    ) -> (Operation, Result<(), ApiError>) {
        let operation = start_operation(
            self.raw(),
            ctx,
            Operation::new(op_type, resource_type, resource_id.to_string()),
        )
        .await
        .unwrap();
        let result = self
            .scheduler
            .execute(Job::new(ctx, operation.id.clone(), action))
            .await;
        let operation = self.repository.get_by_id(&operation.id).await.unwrap();
        (operation, result)
    }

    pub async fn create(&self, object: impl Resource) -> (Operation, Result<(), ApiError>) {
        let id = object.id().to_string();
        let object: Object = object.into_object();
        self.run(
            OperationType::Create,
            object.object_type(),
            &id,
            JobAction::Create(object),
        )
        .await
    }

    pub async fn delete(
        &self,
        object_type: ObjectType,
        id: &str,
    ) -> (Operation, Result<(), ApiError>) {
        self.run(
            OperationType::Delete,
            object_type,
            id,
            JobAction::Delete {
                object_type,
                criteria: vec![Criterion::equals("id", id)],
            },
        )
        .await
    }
}
