use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::context::RequestContext;
use crate::error::ApiError;
use crate::interceptors::order::{build_stages, InterceptorError, Provider};
use crate::model::Resource;
use crate::store::{Repository, RepositoryExt, TransactionalRepository};

pub type CreateFuture<'r, T> = Pin<Box<dyn Future<Output = Result<T, ApiError>> + Send + 'r>>;

/// Hooks around the creation of a `T`.
#[async_trait::async_trait]
pub trait CreateInterceptor<T: Resource>: Send + Sync {
    /// Runs outside the storage transaction and wraps it.
    async fn around_tx(
        &self,
        ctx: &RequestContext,
        object: T,
        next: AroundCreateNext<'_, T>,
    ) -> Result<T, ApiError> {
        next.run(ctx, object).await
    }

    /// Runs inside the storage transaction.
    async fn on_tx(
        &self,
        ctx: &RequestContext,
        tx: &dyn Repository,
        object: T,
        next: OnCreateNext<'_, T>,
    ) -> Result<T, ApiError> {
        next.run(ctx, tx, object).await
    }
}

pub type CreateProvider<T> = Arc<dyn Provider<dyn CreateInterceptor<T>>>;

/// Ordered create stages for one object type.
pub struct CreatePipeline<T: Resource> {
    repository: Arc<dyn TransactionalRepository>,
    around: Vec<Arc<dyn CreateInterceptor<T>>>,
    on_tx: Vec<Arc<dyn CreateInterceptor<T>>>,
}

impl<T: Resource> CreatePipeline<T> {
    pub fn new(
        repository: Arc<dyn TransactionalRepository>,
        providers: &[CreateProvider<T>],
    ) -> Result<Self, InterceptorError> {
        let (around, on_tx) = build_stages(providers)?;
        Ok(Self {
            repository,
            around,
            on_tx,
        })
    }

    pub async fn create(&self, ctx: &RequestContext, object: T) -> Result<T, ApiError> {
        AroundCreateNext {
            pipeline: self,
            position: 0,
        }
        .run(ctx, object)
        .await
    }

    async fn in_transaction(&self, ctx: &RequestContext, object: T) -> Result<T, ApiError> {
        let tx = self.repository.begin().await?;
        let result = OnCreateNext {
            pipeline: self,
            position: 0,
        }
        .run(ctx, tx.repository(), object)
        .await;

        match result {
            Ok(created) => {
                tx.commit().await?;
                Ok(created)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    log::warn!("[{}] Rollback failed: {}", ctx.correlation_id, rollback_err);
                }
                Err(err)
            }
        }
    }
}

/// Remaining around-tx stages; the last one opens the transaction.
pub struct AroundCreateNext<'a, T: Resource> {
    pipeline: &'a CreatePipeline<T>,
    position: usize,
}

impl<'a, T: Resource> AroundCreateNext<'a, T> {
    pub fn run<'r>(self, ctx: &'r RequestContext, object: T) -> CreateFuture<'r, T>
    where
        'a: 'r,
    {
        Box::pin(async move {
            match self.pipeline.around.get(self.position) {
                Some(interceptor) => {
                    let next = AroundCreateNext {
                        pipeline: self.pipeline,
                        position: self.position + 1,
                    };
                    interceptor.around_tx(ctx, object, next).await
                }
                None => self.pipeline.in_transaction(ctx, object).await,
            }
        })
    }
}

/// Remaining on-tx stages; the last one stores the object.
pub struct OnCreateNext<'a, T: Resource> {
    pipeline: &'a CreatePipeline<T>,
    position: usize,
}

impl<'a, T: Resource> OnCreateNext<'a, T> {
    pub fn run<'r>(
        self,
        ctx: &'r RequestContext,
        tx: &'r dyn Repository,
        object: T,
    ) -> CreateFuture<'r, T>
    where
        'a: 'r,
    {
        Box::pin(async move {
            match self.pipeline.on_tx.get(self.position) {
                Some(interceptor) => {
                    let next = OnCreateNext {
                        pipeline: self.pipeline,
                        position: self.position + 1,
                    };
                    interceptor.on_tx(ctx, tx, object, next).await
                }
                None => Ok(tx.create_typed(object).await?),
            }
        })
    }
}
