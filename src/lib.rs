pub mod api;
pub mod catalog;
pub mod config;
pub mod context;
pub mod error;
pub mod interceptors;
pub mod model;
pub mod operations;
pub mod osb;
pub mod store;

use std::sync::Arc;

use catalog::{
    free_plans_are_public, CatalogInterceptor, PublicPlanPredicate,
    PublicPlanVisibilityInterceptor, CATALOG_INTERCEPTOR, PUBLIC_PLAN_VISIBILITY_INTERCEPTOR,
};
use interceptors::{
    CreateInterceptor, DeleteInterceptor, InterceptableRepository, InterceptorError,
    InterceptorRegistry, OperationGuardInterceptor, Ordering, Position, Provider,
    SharedProvider, UpdateInterceptor, OPERATION_GUARD,
};
use model::{ServiceBinding, ServiceBroker, ServiceInstance};
use osb::{
    ClientFactory, DriverContext, OsbSettings, ServiceBindingInterceptor,
    ServiceInstanceInterceptor, OSB_BINDING_INTERCEPTOR, OSB_INSTANCE_INTERCEPTOR,
};
use store::TransactionalRepository;

// Export API types
pub use api::handlers;
pub use api::routes;

pub use error::ApiError;
pub use model::*;

fn provider<I: ?Sized + Send + Sync + 'static>(
    name: &str,
    interceptor: Arc<I>,
    ordering: Ordering,
) -> Arc<dyn Provider<I>> {
    Arc::new(SharedProvider::new(name, interceptor).ordered(ordering))
}

/// Registers the built-in interceptors: catalog sync and visibility resync for brokers,
/// the operation guard and OSB forwarding for instances and bindings.
pub fn register_interceptors(
    registry: &mut InterceptorRegistry,
    repository: Arc<dyn TransactionalRepository>,
    clients: Arc<dyn ClientFactory>,
    settings: OsbSettings,
    is_public: PublicPlanPredicate,
) {
    let catalog = Arc::new(CatalogInterceptor::new(clients.clone()));
    let visibility = Arc::new(PublicPlanVisibilityInterceptor::new(
        is_public,
        settings.tenant_label_key.clone(),
    ));
    // Outer on-tx hook, so the resync sees the reconciled catalog
    let after_catalog = Ordering {
        around_tx: Position::Default,
        on_tx: Position::Before(CATALOG_INTERCEPTOR.to_string()),
    };
    registry
        .brokers
        .add_create_interceptor_providers([
            provider::<dyn CreateInterceptor<ServiceBroker>>(
                CATALOG_INTERCEPTOR,
                catalog.clone(),
                Ordering::default(),
            ),
            provider::<dyn CreateInterceptor<ServiceBroker>>(
                PUBLIC_PLAN_VISIBILITY_INTERCEPTOR,
                visibility.clone(),
                after_catalog.clone(),
            ),
        ])
        .add_update_interceptor_providers([
            provider::<dyn UpdateInterceptor<ServiceBroker>>(
                CATALOG_INTERCEPTOR,
                catalog.clone(),
                Ordering::default(),
            ),
            provider::<dyn UpdateInterceptor<ServiceBroker>>(
                PUBLIC_PLAN_VISIBILITY_INTERCEPTOR,
                visibility,
                after_catalog,
            ),
        ])
        .add_delete_interceptor_providers([provider::<dyn DeleteInterceptor<ServiceBroker>>(
            CATALOG_INTERCEPTOR,
            catalog,
            Ordering::default(),
        )]);

    let driver = DriverContext::new(repository, clients, settings);

    let instances = Arc::new(ServiceInstanceInterceptor::new(driver.clone()));
    let instance_guard = Arc::new(OperationGuardInterceptor::<ServiceInstance>::new());
    registry
        .instances
        .add_create_interceptor_providers([provider::<dyn CreateInterceptor<ServiceInstance>>(
            OSB_INSTANCE_INTERCEPTOR,
            instances.clone(),
            Ordering::default(),
        )])
        .add_update_interceptor_providers([
            provider::<dyn UpdateInterceptor<ServiceInstance>>(
                OPERATION_GUARD,
                instance_guard.clone(),
                Ordering::default(),
            ),
            provider::<dyn UpdateInterceptor<ServiceInstance>>(
                OSB_INSTANCE_INTERCEPTOR,
                instances.clone(),
                Ordering::default(),
            ),
        ])
        .add_delete_interceptor_providers([
            provider::<dyn DeleteInterceptor<ServiceInstance>>(
                OPERATION_GUARD,
                instance_guard,
                Ordering::default(),
            ),
            provider::<dyn DeleteInterceptor<ServiceInstance>>(
                OSB_INSTANCE_INTERCEPTOR,
                instances,
                Ordering::default(),
            ),
        ]);

    let bindings = Arc::new(ServiceBindingInterceptor::new(driver));
    let binding_guard = Arc::new(OperationGuardInterceptor::<ServiceBinding>::new());
    registry
        .bindings
        .add_create_interceptor_providers([provider::<dyn CreateInterceptor<ServiceBinding>>(
            OSB_BINDING_INTERCEPTOR,
            bindings.clone(),
            Ordering::default(),
        )])
        .add_delete_interceptor_providers([
            provider::<dyn DeleteInterceptor<ServiceBinding>>(
                OPERATION_GUARD,
                binding_guard,
                Ordering::default(),
            ),
            provider::<dyn DeleteInterceptor<ServiceBinding>>(
                OSB_BINDING_INTERCEPTOR,
                bindings,
                Ordering::default(),
            ),
        ]);
}

/// Builds the interceptable repository with the built-in interceptors and the default
/// public plan policy.
pub fn build_interceptors(
    repository: Arc<dyn TransactionalRepository>,
    clients: Arc<dyn ClientFactory>,
    settings: OsbSettings,
) -> Result<InterceptableRepository, InterceptorError> {
    let mut registry = InterceptorRegistry::new();
    register_interceptors(
        &mut registry,
        repository.clone(),
        clients,
        settings,
        free_plans_are_public(),
    );
    registry.build(repository)
}
