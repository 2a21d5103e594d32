use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::context::RequestContext;
use crate::error::ApiError;
use crate::interceptors::{
    AroundCreateNext, AroundUpdateNext, CreateInterceptor, DeleteInterceptor, OnCreateNext,
    OnDeleteNext, OnUpdateNext, UpdateInterceptor,
};
use crate::model::{
    generate_id, now, ObjectType, ServiceBroker, ServiceOffering, ServicePlan,
};
use crate::osb::types::{Catalog, CatalogPlan, CatalogService};
use crate::osb::ClientFactory;
use crate::store::{Criterion, Repository, RepositoryExt};

pub const CATALOG_INTERCEPTOR: &str = "broker-catalog";

/// Builds offerings (with their plans) from a raw OSB catalog. Every entity gets a fresh id.
pub fn convert_catalog(
    broker: &ServiceBroker,
    catalog: &Value,
) -> Result<Vec<ServiceOffering>, ApiError> {
    let catalog: Catalog = serde_json::from_value(catalog.clone()).map_err(|e| {
        ApiError::broker(format!(
            "catalog of broker {} at {} is malformed: {}",
            broker.name, broker.broker_url, e
        ))
    })?;
    Ok(catalog
        .services
        .iter()
        .map(|service| convert_service(&broker.id, service))
        .collect())
}

fn convert_service(broker_id: &str, service: &CatalogService) -> ServiceOffering {
    let mut offering = ServiceOffering {
        id: generate_id(),
        name: service.name.clone(),
        description: service.description.clone(),
        catalog_id: service.id.clone(),
        catalog_name: service.name.clone(),
        broker_id: broker_id.to_string(),
        bindable: service.bindable.unwrap_or(false),
        plan_updatable: service.plan_updateable.unwrap_or(false),
        instances_retrievable: service.instances_retrievable.unwrap_or(false),
        bindings_retrievable: service.bindings_retrievable.unwrap_or(false),
        tags: service.tags.clone(),
        requires: service.requires.clone(),
        metadata: service.metadata.clone(),
        created_at: now(),
        updated_at: now(),
        plans: Vec::new(),
    };
    offering.plans = service
        .plans
        .iter()
        .map(|plan| convert_plan(&offering, plan))
        .collect();
    offering
}

fn convert_plan(offering: &ServiceOffering, plan: &CatalogPlan) -> ServicePlan {
    ServicePlan {
        id: generate_id(),
        name: plan.name.clone(),
        description: plan.description.clone(),
        catalog_id: plan.id.clone(),
        catalog_name: plan.name.clone(),
        service_offering_id: offering.id.clone(),
        free: plan.free.unwrap_or(true),
        // Unset flags inherit the offering's value
        bindable: Some(plan.bindable.unwrap_or(offering.bindable)),
        plan_updatable: Some(plan.plan_updateable.unwrap_or(offering.plan_updatable)),
        metadata: plan.metadata.clone(),
        schemas: plan.schemas.clone(),
        maximum_polling_duration: plan.maximum_polling_duration,
        maintenance_info: plan.maintenance_info.clone(),
        created_at: now(),
        updated_at: now(),
    }
}

fn invalid_catalog(broker: &ServiceBroker, reason: String) -> ApiError {
    ApiError::bad_request(format!(
        "catalog of broker {} is invalid: {}",
        broker.name, reason
    ))
}

fn validate_broker(broker: &ServiceBroker) -> Result<(), ApiError> {
    if broker.name.trim().is_empty() {
        return Err(ApiError::bad_request("broker name is required"));
    }
    if !(broker.broker_url.starts_with("http://") || broker.broker_url.starts_with("https://")) {
        return Err(ApiError::bad_request(format!(
            "broker url '{}' must be an http(s) url",
            broker.broker_url
        )));
    }
    Ok(())
}

async fn plans_of(
    tx: &dyn Repository,
    offering_ids: Vec<String>,
) -> Result<Vec<ServicePlan>, ApiError> {
    if offering_ids.is_empty() {
        return Ok(Vec::new());
    }
    Ok(tx
        .list_typed(&[Criterion::in_values("service_offering_id", offering_ids)])
        .await?)
}

/// Fails with 409 when any service instance still uses one of `plans`.
async fn ensure_plans_unused(
    tx: &dyn Repository,
    broker: &ServiceBroker,
    plans: &[ServicePlan],
) -> Result<(), ApiError> {
    if plans.is_empty() {
        return Ok(());
    }
    let plan_ids: Vec<String> = plans.iter().map(|p| p.id.clone()).collect();
    let in_use = tx
        .count(
            ObjectType::ServiceInstance,
            &[Criterion::in_values("service_plan_id", plan_ids)],
        )
        .await?;
    if in_use > 0 {
        let names: Vec<&str> = plans.iter().map(|p| p.catalog_name.as_str()).collect();
        return Err(ApiError::conflict(format!(
            "broker {} has {} service instance(s) using plans {:?}",
            broker.name, in_use, names
        )));
    }
    Ok(())
}

/// Deletes plans together with their visibilities. Plans already gone are skipped.
async fn delete_plans(tx: &dyn Repository, plans: &[ServicePlan]) -> Result<(), ApiError> {
    if plans.is_empty() {
        return Ok(());
    }
    let plan_ids: Vec<String> = plans.iter().map(|p| p.id.clone()).collect();
    tx.delete_matching(
        ObjectType::Visibility,
        &[Criterion::in_values("service_plan_id", plan_ids.clone())],
    )
    .await?;
    tx.delete_matching(
        ObjectType::ServicePlan,
        &[Criterion::in_values("id", plan_ids)],
    )
    .await?;
    Ok(())
}

/// Stores the offerings and plans of a newly registered broker.
async fn create_catalog(
    tx: &dyn Repository,
    broker: &ServiceBroker,
    services: Vec<ServiceOffering>,
) -> Result<Vec<ServiceOffering>, ApiError> {
    let mut created = Vec::with_capacity(services.len());
    for mut offering in services {
        offering.validate().map_err(|e| invalid_catalog(broker, e))?;
        let plans = std::mem::take(&mut offering.plans);
        let mut stored = tx.create_typed(offering).await?;
        for plan in plans {
            plan.validate().map_err(|e| invalid_catalog(broker, e))?;
            stored.plans.push(tx.create_typed(plan).await?);
        }
        created.push(stored);
    }
    Ok(created)
}

/// Diffs the fetched catalog against the stored one by catalog id.
///
/// Offerings are reconciled completely before plans, since plans point at the offerings'
/// final ids. Plans are matched by (offering catalog id, plan catalog id).
async fn update_catalog(
    tx: &dyn Repository,
    broker: &ServiceBroker,
    services: Vec<ServiceOffering>,
) -> Result<Vec<ServiceOffering>, ApiError> {
    let existing: Vec<ServiceOffering> = tx
        .list_typed(&[Criterion::equals("broker_id", &broker.id)])
        .await?;
    let existing_plans = plans_of(tx, existing.iter().map(|o| o.id.clone()).collect()).await?;

    let mut plans_by_offering: HashMap<String, Vec<ServicePlan>> = HashMap::new();
    for plan in existing_plans {
        plans_by_offering
            .entry(plan.service_offering_id.clone())
            .or_default()
            .push(plan);
    }
    let mut existing_by_catalog_id: HashMap<String, ServiceOffering> = existing
        .into_iter()
        .map(|o| (o.catalog_id.clone(), o))
        .collect();

    // Offerings
    let mut reconciled: Vec<(ServiceOffering, Vec<ServicePlan>, Vec<ServicePlan>)> = Vec::new();
    for mut offering in services {
        let new_plans = std::mem::take(&mut offering.plans);
        match existing_by_catalog_id.remove(&offering.catalog_id) {
            Some(old) => {
                offering.id = old.id.clone();
                offering.created_at = old.created_at;
                offering.validate().map_err(|e| invalid_catalog(broker, e))?;
                let stored = tx.update_typed(offering).await?;
                let old_plans = plans_by_offering.remove(&old.id).unwrap_or_default();
                reconciled.push((stored, new_plans, old_plans));
            }
            None => {
                offering.validate().map_err(|e| invalid_catalog(broker, e))?;
                let stored = tx.create_typed(offering).await?;
                reconciled.push((stored, new_plans, Vec::new()));
            }
        }
    }
    for (_, removed) in existing_by_catalog_id {
        let plans = plans_by_offering.remove(&removed.id).unwrap_or_default();
        ensure_plans_unused(tx, broker, &plans).await?;
        delete_plans(tx, &plans).await?;
        tx.delete_matching(
            ObjectType::ServiceOffering,
            &[Criterion::equals("id", &removed.id)],
        )
        .await?;
        log::info!(
            "Removed service offering {} of broker {}",
            removed.catalog_name,
            broker.name
        );
    }

    // Plans, scoped to their offering
    let mut result = Vec::with_capacity(reconciled.len());
    for (mut offering, new_plans, old_plans) in reconciled {
        let mut old_by_catalog_id: HashMap<String, ServicePlan> = old_plans
            .into_iter()
            .map(|p| (p.catalog_id.clone(), p))
            .collect();
        for mut plan in new_plans {
            plan.service_offering_id = offering.id.clone();
            let stored = match old_by_catalog_id.remove(&plan.catalog_id) {
                Some(old) => {
                    plan.id = old.id;
                    plan.created_at = old.created_at;
                    plan.validate().map_err(|e| invalid_catalog(broker, e))?;
                    tx.update_typed(plan).await?
                }
                None => {
                    plan.validate().map_err(|e| invalid_catalog(broker, e))?;
                    tx.create_typed(plan).await?
                }
            };
            offering.plans.push(stored);
        }
        let removed: Vec<ServicePlan> = old_by_catalog_id.into_values().collect();
        ensure_plans_unused(tx, broker, &removed).await?;
        delete_plans(tx, &removed).await?;
        result.push(offering);
    }
    Ok(result)
}

/// Keeps a broker's offerings and plans in line with its catalog.
pub struct CatalogInterceptor {
    clients: Arc<dyn ClientFactory>,
}

impl CatalogInterceptor {
    pub fn new(clients: Arc<dyn ClientFactory>) -> Self {
        Self { clients }
    }

    /// Fetches the broker's catalog and attaches it, raw and converted, to the broker.
    async fn fetch_catalog(
        &self,
        ctx: &RequestContext,
        broker: &mut ServiceBroker,
    ) -> Result<(), ApiError> {
        let client = self.clients.client_for(broker).map_err(|e| {
            ApiError::broker(format!(
                "could not create client for broker {}: {}",
                broker.name, e
            ))
        })?;
        log::info!(
            "[{}] Fetching catalog of broker {} at {}",
            ctx.correlation_id,
            broker.name,
            broker.broker_url
        );
        let catalog = client.get_catalog().await.map_err(|e| {
            ApiError::broker(format!(
                "could not fetch catalog of broker {} at {}: {}",
                broker.name, broker.broker_url, e
            ))
        })?;
        broker.services = convert_catalog(broker, &catalog)?;
        broker.catalog = Some(catalog);
        Ok(())
    }
}

#[async_trait::async_trait]
impl CreateInterceptor<ServiceBroker> for CatalogInterceptor {
    async fn around_tx(
        &self,
        ctx: &RequestContext,
        mut broker: ServiceBroker,
        next: AroundCreateNext<'_, ServiceBroker>,
    ) -> Result<ServiceBroker, ApiError> {
        validate_broker(&broker)?;
        self.fetch_catalog(ctx, &mut broker).await?;
        next.run(ctx, broker).await
    }

    async fn on_tx(
        &self,
        ctx: &RequestContext,
        tx: &dyn Repository,
        mut broker: ServiceBroker,
        next: OnCreateNext<'_, ServiceBroker>,
    ) -> Result<ServiceBroker, ApiError> {
        let services = std::mem::take(&mut broker.services);
        let mut stored = next.run(ctx, tx, broker).await?;
        stored.services = create_catalog(tx, &stored, services).await?;
        log::info!(
            "[{}] Registered broker {} with {} service offering(s)",
            ctx.correlation_id,
            stored.name,
            stored.services.len()
        );
        Ok(stored)
    }
}

#[async_trait::async_trait]
impl UpdateInterceptor<ServiceBroker> for CatalogInterceptor {
    async fn around_tx(
        &self,
        ctx: &RequestContext,
        mut broker: ServiceBroker,
        next: AroundUpdateNext<'_, ServiceBroker>,
    ) -> Result<ServiceBroker, ApiError> {
        validate_broker(&broker)?;
        self.fetch_catalog(ctx, &mut broker).await?;
        next.run(ctx, broker).await
    }

    async fn on_tx(
        &self,
        ctx: &RequestContext,
        tx: &dyn Repository,
        old: &ServiceBroker,
        mut broker: ServiceBroker,
        next: OnUpdateNext<'_, ServiceBroker>,
    ) -> Result<ServiceBroker, ApiError> {
        broker.created_at = old.created_at;
        let services = std::mem::take(&mut broker.services);
        let mut stored = next.run(ctx, tx, old, broker).await?;
        stored.services = update_catalog(tx, &stored, services).await?;
        log::info!(
            "[{}] Resynced catalog of broker {}",
            ctx.correlation_id,
            stored.name
        );
        Ok(stored)
    }
}

#[async_trait::async_trait]
impl DeleteInterceptor<ServiceBroker> for CatalogInterceptor {
    async fn on_tx(
        &self,
        ctx: &RequestContext,
        tx: &dyn Repository,
        brokers: &[ServiceBroker],
        next: OnDeleteNext<'_, ServiceBroker>,
    ) -> Result<(), ApiError> {
        for broker in brokers {
            let offerings: Vec<ServiceOffering> = tx
                .list_typed(&[Criterion::equals("broker_id", &broker.id)])
                .await?;
            let offering_ids: Vec<String> = offerings.iter().map(|o| o.id.clone()).collect();
            let plans = plans_of(tx, offering_ids.clone()).await?;
            ensure_plans_unused(tx, broker, &plans).await?;
            delete_plans(tx, &plans).await?;
            if !offering_ids.is_empty() {
                tx.delete_matching(
                    ObjectType::ServiceOffering,
                    &[Criterion::in_values("id", offering_ids)],
                )
                .await?;
            }
            log::info!(
                "[{}] Removed catalog of broker {}",
                ctx.correlation_id,
                broker.name
            );
        }
        next.run(ctx, tx, brokers).await
    }
}
