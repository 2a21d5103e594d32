use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::context::RequestContext;
use crate::error::ApiError;
use crate::interceptors::order::{build_stages, InterceptorError, Provider};
use crate::model::Resource;
use crate::store::{Repository, RepositoryExt, TransactionalRepository};

pub type UpdateFuture<'r, T> = Pin<Box<dyn Future<Output = Result<T, ApiError>> + Send + 'r>>;

/// Hooks around the update of a `T`.
#[async_trait::async_trait]
pub trait UpdateInterceptor<T: Resource>: Send + Sync {
    async fn around_tx(
        &self,
        ctx: &RequestContext,
        object: T,
        next: AroundUpdateNext<'_, T>,
    ) -> Result<T, ApiError> {
        next.run(ctx, object).await
    }

    /// `old` is the stored version, read inside the transaction.
    async fn on_tx(
        &self,
        ctx: &RequestContext,
        tx: &dyn Repository,
        old: &T,
        new: T,
        next: OnUpdateNext<'_, T>,
    ) -> Result<T, ApiError> {
        next.run(ctx, tx, old, new).await
    }
}

pub type UpdateProvider<T> = Arc<dyn Provider<dyn UpdateInterceptor<T>>>;

pub struct UpdatePipeline<T: Resource> {
    repository: Arc<dyn TransactionalRepository>,
    around: Vec<Arc<dyn UpdateInterceptor<T>>>,
    on_tx: Vec<Arc<dyn UpdateInterceptor<T>>>,
}

impl<T: Resource> UpdatePipeline<T> {
    pub fn new(
        repository: Arc<dyn TransactionalRepository>,
        providers: &[UpdateProvider<T>],
    ) -> Result<Self, InterceptorError> {
        let (around, on_tx) = build_stages(providers)?;
        Ok(Self {
            repository,
            around,
            on_tx,
        })
    }

    pub async fn update(&self, ctx: &RequestContext, object: T) -> Result<T, ApiError> {
        AroundUpdateNext {
            pipeline: self,
            position: 0,
        }
        .run(ctx, object)
        .await
    }

    async fn in_transaction(&self, ctx: &RequestContext, object: T) -> Result<T, ApiError> {
        let tx = self.repository.begin().await?;
        let result = async {
            let old: T = tx.repository().get_by_id(object.id()).await?;
            OnUpdateNext {
                pipeline: self,
                position: 0,
            }
            .run(ctx, tx.repository(), &old, object)
            .await
        }
        .await;

        match result {
            Ok(updated) => {
                tx.commit().await?;
                Ok(updated)
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

pub struct AroundUpdateNext<'a, T: Resource> {
    pipeline: &'a UpdatePipeline<T>,
    position: usize,
}

impl<'a, T: Resource> AroundUpdateNext<'a, T> {
    pub fn run<'r>(self, ctx: &'r RequestContext, object: T) -> UpdateFuture<'r, T>
    where
        'a: 'r,
    {
        Box::pin(async move {
            match self.pipeline.around.get(self.position) {
                Some(interceptor) => {
                    let next = AroundUpdateNext {
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

pub struct OnUpdateNext<'a, T: Resource> {
    pipeline: &'a UpdatePipeline<T>,
    position: usize,
}

impl<'a, T: Resource> OnUpdateNext<'a, T> {
    pub fn run<'r>(
        self,
        ctx: &'r RequestContext,
        tx: &'r dyn Repository,
        old: &'r T,
        new: T,
    ) -> UpdateFuture<'r, T>
    where
        'a: 'r,
    {
        Box::pin(async move {
            match self.pipeline.on_tx.get(self.position) {
                Some(interceptor) => {
                    let next = OnUpdateNext {
                        pipeline: self.pipeline,
                        position: self.position + 1,
                    };
                    interceptor.on_tx(ctx, tx, old, new, next).await
                }
                None => Ok(tx.update_typed(new).await?),
            }
        })
    }
}
