use crate::context::RequestContext;
use crate::error::ApiError;
use crate::interceptors::{
    AroundCreateNext, AroundDeleteNext, AroundUpdateNext, CreateInterceptor, DeleteInterceptor,
    UpdateInterceptor,
};
use crate::model::{ObjectType, PreviousValues, ServiceInstance, SM_PLATFORM};
use crate::osb::context::osb_context;
use crate::osb::driver::{broker_error, call_broker, BrokerTarget, DriverContext};
use crate::osb::poller::{poll_operation, PollOutcome, PollRequest};
use crate::osb::types::{
    DeprovisionRequest, PreviousValuesRequest, ProvisionRequest, UpdateInstanceRequest,
};
use crate::osb::should_start_orphan_mitigation;
use crate::store::{Criterion, RepositoryExt};

pub const OSB_INSTANCE_INTERCEPTOR: &str = "osb-service-instance";

/// Forwards provision, update and deprovision of control plane instances to their broker.
pub struct ServiceInstanceInterceptor {
    driver: DriverContext,
}

impl ServiceInstanceInterceptor {
    pub fn new(driver: DriverContext) -> Self {
        Self { driver }
    }

    fn context_for(&self, instance: &ServiceInstance) -> serde_json::Value {
        osb_context(
            instance.context.as_ref(),
            SM_PLATFORM,
            "instance_name",
            &instance.name,
            &instance.labels,
            self.driver.settings.tenant_label_key.as_deref(),
        )
    }

    async fn mark_ready(&self, mut instance: ServiceInstance) -> Result<ServiceInstance, ApiError> {
        instance.ready = true;
        instance.usable = true;
        Ok(self.driver.repository.update_typed(instance).await?)
    }

    async fn deprovision(
        &self,
        ctx: &RequestContext,
        instance: &ServiceInstance,
    ) -> Result<PollOutcome, ApiError> {
        let bindings = self
            .driver
            .repository
            .count(
                ObjectType::ServiceBinding,
                &[Criterion::equals("service_instance_id", &instance.id)],
            )
            .await?;
        if bindings > 0 {
            return Err(ApiError::bad_request(format!(
                "could not delete service instance {}: it has {} binding(s)",
                instance.id, bindings
            )));
        }

        let target = self.driver.resolve_target(&instance.service_plan_id).await?;
        let mut operation = self.driver.load_operation(ctx).await?;

        if !operation.reschedule {
            let request = DeprovisionRequest {
                instance_id: instance.id.clone(),
                service_id: target.offering.catalog_id.clone(),
                plan_id: target.plan.catalog_id.clone(),
            };
            match call_broker(ctx, target.client.deprovision_instance(&request)).await {
                Err(err) if err.is_gone() => {
                    log::info!(
                        "[{}] Broker {} no longer knows instance {}; treating deprovision as done",
                        ctx.correlation_id,
                        target.broker.name,
                        instance.id
                    );
                    return Ok(PollOutcome::Gone);
                }
                Err(err) => {
                    if should_start_orphan_mitigation(&err) {
                        self.driver.schedule_orphan_mitigation(&mut operation).await?;
                    }
                    return Err(broker_error(&target.broker, "deprovision", &err));
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
                binding_id: None,
                orphan_mitigation: false,
            },
        )
        .await
    }

    fn update_request(
        &self,
        target: &BrokerTarget,
        old_target: &BrokerTarget,
        old: &ServiceInstance,
        new: &ServiceInstance,
    ) -> UpdateInstanceRequest {
        UpdateInstanceRequest {
            instance_id: new.id.clone(),
            service_id: target.offering.catalog_id.clone(),
            plan_id: target.plan.catalog_id.clone(),
            context: self.context_for(new),
            parameters: new.parameters.clone(),
            maintenance_info: new.maintenance_info.clone(),
            previous_values: PreviousValuesRequest {
                plan_id: old_target.plan.catalog_id.clone(),
                service_id: old_target.offering.catalog_id.clone(),
                maintenance_info: old.maintenance_info.clone(),
            },
        }
    }
}

#[async_trait::async_trait]
impl CreateInterceptor<ServiceInstance> for ServiceInstanceInterceptor {
    async fn around_tx(
        &self,
        ctx: &RequestContext,
        mut instance: ServiceInstance,
        next: AroundCreateNext<'_, ServiceInstance>,
    ) -> Result<ServiceInstance, ApiError> {
        if !instance.is_managed() {
            return next.run(ctx, instance).await;
        }

        let target = self.driver.resolve_target(&instance.service_plan_id).await?;
        let mut operation = self.driver.load_operation(ctx).await?;

        let stored = if operation.reschedule {
            // The instance was stored by the attempt that started the broker operation
            match self.driver.repository.get_by_id::<ServiceInstance>(&instance.id).await {
                Ok(existing) => existing,
                Err(e) if e.is_not_found() => next.run(ctx, instance).await?,
                Err(e) => return Err(e.into()),
            }
        } else {
            let request = ProvisionRequest {
                instance_id: instance.id.clone(),
                service_id: target.offering.catalog_id.clone(),
                plan_id: target.plan.catalog_id.clone(),
                organization_guid: "-".to_string(),
                space_guid: "-".to_string(),
                context: self.context_for(&instance),
                parameters: instance.parameters.clone(),
                maintenance_info: instance.maintenance_info.clone(),
            };
            log::info!(
                "[{}] Provisioning instance {} ({}) at broker {}",
                ctx.correlation_id,
                instance.name,
                instance.id,
                target.broker.name
            );

            match call_broker(ctx, target.client.provision_instance(&request)).await {
                Err(err) => {
                    if should_start_orphan_mitigation(&err) {
                        log::warn!(
                            "[{}] Ambiguous provision failure for {}; scheduling orphan mitigation",
                            ctx.correlation_id,
                            instance.id
                        );
                        instance.ready = false;
                        instance.usable = false;
                        next.run(ctx, instance).await?;
                        self.driver.schedule_orphan_mitigation(&mut operation).await?;
                    }
                    return Err(broker_error(&target.broker, "provision", &err));
                }
                Ok(response) if response.is_async => {
                    operation.external_id = response.operation_key;
                    operation.reschedule = true;
                    self.driver.save_operation(&mut operation).await?;

                    instance.dashboard_url = response.dashboard_url;
                    instance.ready = false;
                    instance.usable = false;
                    next.run(ctx, instance).await?
                }
                Ok(response) => {
                    instance.dashboard_url = response.dashboard_url;
                    instance.ready = true;
                    instance.usable = true;
                    return next.run(ctx, instance).await;
                }
            }
        };

        let outcome = poll_operation(
            &self.driver,
            ctx,
            &mut operation,
            PollRequest {
                target: &target,
                instance_id: &stored.id,
                binding_id: None,
                orphan_mitigation: true,
            },
        )
        .await?;

        match outcome {
            PollOutcome::Canceled => Ok(stored),
            PollOutcome::Succeeded | PollOutcome::Gone => self.mark_ready(stored).await,
        }
    }
}

#[async_trait::async_trait]
impl UpdateInterceptor<ServiceInstance> for ServiceInstanceInterceptor {
    async fn around_tx(
        &self,
        ctx: &RequestContext,
        mut instance: ServiceInstance,
        next: AroundUpdateNext<'_, ServiceInstance>,
    ) -> Result<ServiceInstance, ApiError> {
        if !instance.is_managed() {
            return next.run(ctx, instance).await;
        }

        let old: ServiceInstance = self.driver.repository.get_by_id(&instance.id).await?;
        let target = self.driver.resolve_target(&instance.service_plan_id).await?;
        let mut operation = self.driver.load_operation(ctx).await?;

        let stored = if operation.reschedule {
            self.driver
                .repository
                .get_by_id::<ServiceInstance>(&instance.id)
                .await?
        } else {
            let old_target = if old.service_plan_id == instance.service_plan_id {
                None
            } else {
                Some(self.driver.resolve_target(&old.service_plan_id).await?)
            };
            let previous_target = old_target.as_ref().unwrap_or(&target);
            let request = self.update_request(&target, previous_target, &old, &instance);

            match call_broker(ctx, target.client.update_instance(&request)).await {
                Err(err) => return Err(broker_error(&target.broker, "update", &err)),
                Ok(response) if response.is_async => {
                    operation.external_id = response.operation_key;
                    operation.reschedule = true;
                    self.driver.save_operation(&mut operation).await?;

                    let previous = PreviousValues {
                        service_plan_id: old.service_plan_id.clone(),
                        maintenance_info: old.maintenance_info.clone(),
                    };
                    instance.previous_values = Some(
                        serde_json::to_value(previous).map_err(|e| ApiError::Internal(e.into()))?,
                    );
                    instance.usable = false;
                    if response.dashboard_url.is_some() {
                        instance.dashboard_url = response.dashboard_url;
                    }
                    next.run(ctx, instance).await?
                }
                Ok(response) => {
                    if response.dashboard_url.is_some() {
                        instance.dashboard_url = response.dashboard_url;
                    }
                    instance.previous_values = None;
                    instance.usable = true;
                    return next.run(ctx, instance).await;
                }
            }
        };

        let polled = poll_operation(
            &self.driver,
            ctx,
            &mut operation,
            PollRequest {
                target: &target,
                instance_id: &stored.id,
                binding_id: None,
                orphan_mitigation: false,
            },
        )
        .await;

        let mut stored = stored;
        match polled {
            Ok(PollOutcome::Canceled) => Ok(stored),
            Ok(_) => {
                stored.previous_values = None;
                stored.usable = true;
                Ok(self.driver.repository.update_typed(stored).await?)
            }
            Err(err) => {
                if let Some(previous) = stored.previous_values.take() {
                    match serde_json::from_value::<PreviousValues>(previous) {
                        Ok(previous) => {
                            stored.service_plan_id = previous.service_plan_id;
                            stored.maintenance_info = previous.maintenance_info;
                        }
                        Err(e) => log::warn!(
                            "[{}] Could not restore previous values of instance {}: {}",
                            ctx.correlation_id,
                            stored.id,
                            e
                        ),
                    }
                }
                stored.usable = false;
                self.driver.repository.update_typed(stored).await?;
                Err(err)
            }
        }
    }
}

#[async_trait::async_trait]
impl DeleteInterceptor<ServiceInstance> for ServiceInstanceInterceptor {
    async fn around_tx(
        &self,
        ctx: &RequestContext,
        instances: &[ServiceInstance],
        next: AroundDeleteNext<'_, ServiceInstance>,
    ) -> Result<(), ApiError> {
        for instance in instances.iter().filter(|i| i.is_managed()) {
            if self.deprovision(ctx, instance).await? == PollOutcome::Canceled {
                return Ok(());
            }
        }
        next.run(ctx, instances).await
    }
}
