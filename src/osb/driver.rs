use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::context::RequestContext;
use crate::error::ApiError;
use crate::model::{
    now, Operation, OperationState, OperationType, ObjectType, ServiceBroker, ServiceOffering,
    ServicePlan,
};
use crate::osb::{BrokerClient, ClientFactory, OsbError};
use crate::store::{Criterion, RepositoryExt, TransactionalRepository};

/// Settings shared by the instance and binding drivers.
#[derive(Debug, Clone)]
pub struct OsbSettings {
    pub polling_interval: Duration,
    /// Bound used when a plan declares no maximum polling duration
    pub default_max_polling: Option<Duration>,
    pub tenant_label_key: Option<String>,
}

impl Default for OsbSettings {
    fn default() -> Self {
        Self {
            polling_interval: Duration::from_secs(1),
            default_max_polling: None,
            tenant_label_key: None,
        }
    }
}

impl OsbSettings {
    pub fn max_polling_for(&self, plan: &ServicePlan) -> Option<Duration> {
        match plan.maximum_polling_duration {
            Some(secs) if secs > 0 => Some(Duration::from_secs(secs)),
            _ => self.default_max_polling,
        }
    }
}

/// Plan, offering and broker behind a resource, with a client for the broker.
pub struct BrokerTarget {
    pub plan: ServicePlan,
    pub offering: ServiceOffering,
    pub broker: ServiceBroker,
    pub client: Arc<dyn BrokerClient>,
}

/// Repository and client access common to the OSB interceptors.
#[derive(Clone)]
pub struct DriverContext {
    pub repository: Arc<dyn TransactionalRepository>,
    pub clients: Arc<dyn ClientFactory>,
    pub settings: OsbSettings,
}

impl DriverContext {
    pub fn new(
        repository: Arc<dyn TransactionalRepository>,
        clients: Arc<dyn ClientFactory>,
        settings: OsbSettings,
    ) -> Self {
        Self {
            repository,
            clients,
            settings,
        }
    }

    pub async fn resolve_target(&self, plan_id: &str) -> Result<BrokerTarget, ApiError> {
        let plan: ServicePlan = self.repository.get_by_id(plan_id).await.map_err(|e| {
            if e.is_not_found() {
                ApiError::not_found(format!("service plan {} not found", plan_id))
            } else {
                e.into()
            }
        })?;
        let offering: ServiceOffering = self
            .repository
            .get_by_id(&plan.service_offering_id)
            .await?;
        let broker: ServiceBroker = self.repository.get_by_id(&offering.broker_id).await?;
        let client = self.clients.client_for(&broker).map_err(|e| {
            ApiError::broker(format!(
                "could not create client for broker {}: {}",
                broker.name, e
            ))
        })?;
        Ok(BrokerTarget {
            plan,
            offering,
            broker,
            client,
        })
    }

    /// The operation driving the current request.
    pub async fn load_operation(&self, ctx: &RequestContext) -> Result<Operation, ApiError> {
        let id = ctx.operation_id.as_deref().ok_or_else(|| {
            ApiError::Internal(anyhow::anyhow!(
                "broker request issued without an operation in context"
            ))
        })?;
        Ok(self.repository.get_by_id(id).await?)
    }

    /// Stores the operation and refreshes the caller's copy.
    pub async fn save_operation(&self, operation: &mut Operation) -> Result<(), ApiError> {
        *operation = self.repository.update_typed(operation.clone()).await?;
        Ok(())
    }

    /// Marks the operation for orphan mitigation and stores it.
    pub async fn schedule_orphan_mitigation(
        &self,
        operation: &mut Operation,
    ) -> Result<(), ApiError> {
        operation.deletion_scheduled = Some(now());
        operation.reschedule = false;
        self.save_operation(operation).await
    }

    /// Whether a delete operation for `resource_id` is running.
    pub async fn deletion_in_progress(&self, resource_id: &str) -> Result<bool, ApiError> {
        let count = self
            .repository
            .count(
                ObjectType::Operation,
                &[
                    Criterion::equals("resource_id", resource_id),
                    Criterion::equals("type", OperationType::Delete.to_string()),
                    Criterion::in_values(
                        "state",
                        [
                            OperationState::Pending.as_str(),
                            OperationState::InProgress.as_str(),
                        ],
                    ),
                ],
            )
            .await?;
        Ok(count > 0)
    }
}

/// Races a broker call against request cancellation.
pub async fn call_broker<T, F>(ctx: &RequestContext, call: F) -> Result<T, OsbError>
where
    F: Future<Output = Result<T, OsbError>>,
{
    tokio::select! {
        _ = ctx.cancellation.cancelled() => Err(OsbError::Transport {
            message: "request cancelled".to_string(),
            timeout: false,
        }),
        result = call => result,
    }
}

/// BrokerError carrying the broker and request for diagnosis.
pub fn broker_error(broker: &ServiceBroker, request: &str, err: &OsbError) -> ApiError {
    ApiError::broker(format!(
        "{} failed: broker {} at {} responded: {}",
        request, broker.name, broker.broker_url, err
    ))
}
