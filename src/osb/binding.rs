use crate::context::RequestContext;
use crate::error::ApiError;
use crate::interceptors::{AroundCreateNext, AroundDeleteNext, CreateInterceptor, DeleteInterceptor};
use crate::model::{ServiceBinding, ServiceInstance, SM_PLATFORM};
use crate::osb::context::osb_context;
use crate::osb::driver::{broker_error, call_broker, DriverContext};
use crate::osb::poller::{poll_operation, PollOutcome, PollRequest};
use crate::osb::types::{BindRequest, BindingDetails, GetBindingRequest, UnbindRequest};
use crate::osb::should_start_orphan_mitigation;
use crate::store::RepositoryExt;

pub const OSB_BINDING_INTERCEPTOR: &str = "osb-service-binding";

/// Forwards bind and unbind of bindings on control plane instances to their broker.
pub struct ServiceBindingInterceptor {
    driver: DriverContext,
}

fn apply_details(binding: &mut ServiceBinding, details: BindingDetails) {
    binding.credentials = details.credentials;
    binding.syslog_drain_url = details.syslog_drain_url;
    binding.route_service_url = details.route_service_url;
    binding.volume_mounts = details.volume_mounts;
    binding.endpoints = details.endpoints;
}

impl ServiceBindingInterceptor {
    pub fn new(driver: DriverContext) -> Self {
        Self { driver }
    }

    async fn unbind(
        &self,
        ctx: &RequestContext,
        binding: &ServiceBinding,
    ) -> Result<PollOutcome, ApiError> {
        let instance: ServiceInstance = self
            .driver
            .repository
            .get_by_id(&binding.service_instance_id)
            .await?;
        if !instance.is_managed() {
            return Ok(PollOutcome::Succeeded);
        }
        let target = self.driver.resolve_target(&instance.service_plan_id).await?;
        let mut operation = self.driver.load_operation(ctx).await?;

        if !operation.reschedule {
            let request = UnbindRequest {
                instance_id: instance.id.clone(),
                binding_id: binding.id.clone(),
                service_id: target.offering.catalog_id.clone(),
                plan_id: target.plan.catalog_id.clone(),
            };
            match call_broker(ctx, target.client.unbind(&request)).await {
                Err(err) if err.is_gone() => return Ok(PollOutcome::Gone),
                Err(err) => {
                    if should_start_orphan_mitigation(&err) {
                        self.driver.schedule_orphan_mitigation(&mut operation).await?;
                    }
                    return Err(broker_error(&target.broker, "unbind", &err));
                }
                Ok(response) if response.is_async => {
                    operation.external_id = response.operation_key;
                    operation.reschedule = true;
                    self.driver.save_operation(&mut operation).await?;
                }
                Ok(_) => return Ok(PollOutcome::Succeeded),
            }
        }

        poll_operation(
            &self.driver,
            ctx,
            &mut operation,
            PollRequest {
                target: &target,
                instance_id: &instance.id,
                binding_id: Some(&binding.id),
                orphan_mitigation: false,
            },
        )
        .await
    }
}

#[async_trait::async_trait]
impl CreateInterceptor<ServiceBinding> for ServiceBindingInterceptor {
    async fn around_tx(
        &self,
        ctx: &RequestContext,
        mut binding: ServiceBinding,
        next: AroundCreateNext<'_, ServiceBinding>,
    ) -> Result<ServiceBinding, ApiError> {
        let instance: ServiceInstance = self
            .driver
            .repository
            .get_by_id(&binding.service_instance_id)
            .await?;
        if !instance.is_managed() {
            return next.run(ctx, binding).await;
        }

        let target = self.driver.resolve_target(&instance.service_plan_id).await?;
        if !target.plan.is_bindable(&target.offering) {
            return Err(ApiError::broker(format!(
                "plan {} of service {} is not bindable",
                target.plan.catalog_name, target.offering.catalog_name
            )));
        }
        if !instance.ready {
            return Err(ApiError::instance_not_ready(&instance.id));
        }
        if self.driver.deletion_in_progress(&instance.id).await? {
            return Err(ApiError::deletion_in_progress(&instance.id));
        }

        let mut operation = self.driver.load_operation(ctx).await?;

        let stored = if operation.reschedule {
            match self.driver.repository.get_by_id::<ServiceBinding>(&binding.id).await {
                Ok(existing) => existing,
                Err(e) if e.is_not_found() => next.run(ctx, binding).await?,
                Err(e) => return Err(e.into()),
            }
        } else {
            let request = BindRequest {
                instance_id: instance.id.clone(),
                binding_id: binding.id.clone(),
                service_id: target.offering.catalog_id.clone(),
                plan_id: target.plan.catalog_id.clone(),
                context: osb_context(
                    binding.context.as_ref(),
                    SM_PLATFORM,
                    "binding_name",
                    &binding.name,
                    &binding.labels,
                    self.driver.settings.tenant_label_key.as_deref(),
                ),
                parameters: binding.parameters.clone(),
                bind_resource: binding.bind_resource.clone(),
            };
            log::info!(
                "[{}] Binding {} ({}) to instance {} at broker {}",
                ctx.correlation_id,
                binding.name,
                binding.id,
                instance.id,
                target.broker.name
            );

            match call_broker(ctx, target.client.bind(&request)).await {
                Err(err) => {
                    if should_start_orphan_mitigation(&err) {
                        binding.ready = false;
                        next.run(ctx, binding).await?;
                        self.driver.schedule_orphan_mitigation(&mut operation).await?;
                    }
                    return Err(broker_error(&target.broker, "bind", &err));
                }
                Ok(response) if response.is_async => {
                    operation.external_id = response.operation_key;
                    operation.reschedule = true;
                    self.driver.save_operation(&mut operation).await?;

                    binding.ready = false;
                    next.run(ctx, binding).await?
                }
                Ok(response) => {
                    apply_details(&mut binding, response.details);
                    binding.ready = true;
                    return next.run(ctx, binding).await;
                }
            }
        };

        let outcome = poll_operation(
            &self.driver,
            ctx,
            &mut operation,
            PollRequest {
                target: &target,
                instance_id: &instance.id,
                binding_id: Some(&stored.id),
                orphan_mitigation: true,
            },
        )
        .await?;
        if outcome == PollOutcome::Canceled {
            return Ok(stored);
        }

        let request = GetBindingRequest {
            instance_id: instance.id.clone(),
            binding_id: stored.id.clone(),
        };
        let details = match call_broker(ctx, target.client.get_binding(&request)).await {
            Ok(details) => details,
            Err(err) => {
                self.driver.schedule_orphan_mitigation(&mut operation).await?;
                return Err(broker_error(&target.broker, "fetch binding", &err));
            }
        };

        let mut stored = stored;
        apply_details(&mut stored, details);
        stored.ready = true;
        Ok(self.driver.repository.update_typed(stored).await?)
    }
}

#[async_trait::async_trait]
impl DeleteInterceptor<ServiceBinding> for ServiceBindingInterceptor {
    async fn around_tx(
        &self,
        ctx: &RequestContext,
        bindings: &[ServiceBinding],
        next: AroundDeleteNext<'_, ServiceBinding>,
    ) -> Result<(), ApiError> {
        for binding in bindings {
            if self.unbind(ctx, binding).await? == PollOutcome::Canceled {
                return Ok(());
            }
        }
        next.run(ctx, bindings).await
    }
}
