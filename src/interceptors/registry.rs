use std::sync::Arc;

use crate::context::RequestContext;
use crate::error::ApiError;
use crate::interceptors::create::{CreatePipeline, CreateProvider};
use crate::interceptors::delete::{DeletePipeline, DeleteProvider};
use crate::interceptors::order::InterceptorError;
use crate::interceptors::update::{UpdatePipeline, UpdateProvider};
use crate::model::{
    Object, ObjectType, Platform, Resource, ServiceBinding, ServiceBroker, ServiceInstance,
    Visibility,
};
use crate::store::{Criterion, TransactionalRepository};

/// Collects interceptor providers for one object type.
pub struct InterceptorChainBuilder<T: Resource> {
    create: Vec<CreateProvider<T>>,
    update: Vec<UpdateProvider<T>>,
    delete: Vec<DeleteProvider<T>>,
}

impl<T: Resource> Default for InterceptorChainBuilder<T> {
    fn default() -> Self {
        Self {
            create: Vec::new(),
            update: Vec::new(),
            delete: Vec::new(),
        }
    }
}

impl<T: Resource> InterceptorChainBuilder<T> {
    pub fn add_create_interceptor_providers(
        &mut self,
        providers: impl IntoIterator<Item = CreateProvider<T>>,
    ) -> &mut Self {
        self.create.extend(providers);
        self
    }

    pub fn add_update_interceptor_providers(
        &mut self,
        providers: impl IntoIterator<Item = UpdateProvider<T>>,
    ) -> &mut Self {
        self.update.extend(providers);
        self
    }

    pub fn add_delete_interceptor_providers(
        &mut self,
        providers: impl IntoIterator<Item = DeleteProvider<T>>,
    ) -> &mut Self {
        self.delete.extend(providers);
        self
    }

    fn build(
        &self,
        repository: &Arc<dyn TransactionalRepository>,
    ) -> Result<ObjectPipelines<T>, InterceptorError> {
        Ok(ObjectPipelines {
            create: CreatePipeline::new(repository.clone(), &self.create)?,
            update: UpdatePipeline::new(repository.clone(), &self.update)?,
            delete: DeletePipeline::new(repository.clone(), &self.delete)?,
        })
    }
}

pub struct ObjectPipelines<T: Resource> {
    pub create: CreatePipeline<T>,
    pub update: UpdatePipeline<T>,
    pub delete: DeletePipeline<T>,
}

/// Registration surface for every intercepted object type.
#[derive(Default)]
pub struct InterceptorRegistry {
    pub brokers: InterceptorChainBuilder<ServiceBroker>,
    pub platforms: InterceptorChainBuilder<Platform>,
    pub visibilities: InterceptorChainBuilder<Visibility>,
    pub instances: InterceptorChainBuilder<ServiceInstance>,
    pub bindings: InterceptorChainBuilder<ServiceBinding>,
}

impl InterceptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves every chain. Ordering problems surface here, before anything is served.
    pub fn build(
        &self,
        repository: Arc<dyn TransactionalRepository>,
    ) -> Result<InterceptableRepository, InterceptorError> {
        Ok(InterceptableRepository {
            brokers: self.brokers.build(&repository)?,
            platforms: self.platforms.build(&repository)?,
            visibilities: self.visibilities.build(&repository)?,
            instances: self.instances.build(&repository)?,
            bindings: self.bindings.build(&repository)?,
            repository,
        })
    }
}

/// Repository front that routes mutations through the interceptor pipelines of their type.
/// Offerings, plans and operations have no pipelines and are written directly.
pub struct InterceptableRepository {
    repository: Arc<dyn TransactionalRepository>,
    brokers: ObjectPipelines<ServiceBroker>,
    platforms: ObjectPipelines<Platform>,
    visibilities: ObjectPipelines<Visibility>,
    instances: ObjectPipelines<ServiceInstance>,
    bindings: ObjectPipelines<ServiceBinding>,
}

impl InterceptableRepository {
    /// The underlying repository, without interceptors.
    pub fn raw(&self) -> &Arc<dyn TransactionalRepository> {
        &self.repository
    }

    pub async fn create(&self, ctx: &RequestContext, object: Object) -> Result<Object, ApiError> {
        let created = match object {
            Object::ServiceBroker(o) => self.brokers.create.create(ctx, o).await?.into_object(),
            Object::Platform(o) => self.platforms.create.create(ctx, o).await?.into_object(),
            Object::Visibility(o) => self.visibilities.create.create(ctx, o).await?.into_object(),
            Object::ServiceInstance(o) => self.instances.create.create(ctx, o).await?.into_object(),
            Object::ServiceBinding(o) => self.bindings.create.create(ctx, o).await?.into_object(),
            other => self.repository.create(other).await?,
        };
        Ok(created)
    }

    pub async fn update(&self, ctx: &RequestContext, object: Object) -> Result<Object, ApiError> {
        let updated = match object {
            Object::ServiceBroker(o) => self.brokers.update.update(ctx, o).await?.into_object(),
            Object::Platform(o) => self.platforms.update.update(ctx, o).await?.into_object(),
            Object::Visibility(o) => self.visibilities.update.update(ctx, o).await?.into_object(),
            Object::ServiceInstance(o) => self.instances.update.update(ctx, o).await?.into_object(),
            Object::ServiceBinding(o) => self.bindings.update.update(ctx, o).await?.into_object(),
            other => self.repository.update(other).await?,
        };
        Ok(updated)
    }

    pub async fn delete(
        &self,
        ctx: &RequestContext,
        object_type: ObjectType,
        criteria: &[Criterion],
    ) -> Result<(), ApiError> {
        match object_type {
            ObjectType::ServiceBroker => self.brokers.delete.delete(ctx, criteria).await,
            ObjectType::Platform => self.platforms.delete.delete(ctx, criteria).await,
            ObjectType::Visibility => self.visibilities.delete.delete(ctx, criteria).await,
            ObjectType::ServiceInstance => self.instances.delete.delete(ctx, criteria).await,
            ObjectType::ServiceBinding => self.bindings.delete.delete(ctx, criteria).await,
            ObjectType::ServiceOffering | ObjectType::ServicePlan | ObjectType::Operation => {
                self.repository.delete(object_type, criteria).await?;
                Ok(())
            }
        }
    }
}
