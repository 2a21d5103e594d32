use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::context::RequestContext;
use crate::error::ApiError;
use crate::interceptors::order::{build_stages, InterceptorError, Provider};
use crate::model::Resource;
use crate::store::{Criterion, Repository, RepositoryExt, StoreError, TransactionalRepository};

pub type DeleteFuture<'r> = Pin<Box<dyn Future<Output = Result<(), ApiError>> + Send + 'r>>;

/// Hooks around the deletion of the `T`s matched by a delete request.
#[async_trait::async_trait]
pub trait DeleteInterceptor<T: Resource>: Send + Sync {
    async fn around_tx(
        &self,
        ctx: &RequestContext,
        objects: &[T],
        next: AroundDeleteNext<'_, T>,
    ) -> Result<(), ApiError> {
        next.run(ctx, objects).await
    }

    /// `objects` are re-read inside the transaction.
    async fn on_tx(
        &self,
        ctx: &RequestContext,
        tx: &dyn Repository,
        objects: &[T],
        next: OnDeleteNext<'_, T>,
    ) -> Result<(), ApiError> {
        next.run(ctx, tx, objects).await
    }
}

pub type DeleteProvider<T> = Arc<dyn Provider<dyn DeleteInterceptor<T>>>;

pub struct DeletePipeline<T: Resource> {
    repository: Arc<dyn TransactionalRepository>,
    around: Vec<Arc<dyn DeleteInterceptor<T>>>,
    on_tx: Vec<Arc<dyn DeleteInterceptor<T>>>,
}

fn ids<T: Resource>(objects: &[T]) -> Vec<String> {
    objects.iter().map(|o| o.id().to_string()).collect()
}

fn nothing_matched<T: Resource>() -> ApiError {
    StoreError::NotFound {
        object_type: T::OBJECT_TYPE,
    }
    .into()
}

impl<T: Resource> DeletePipeline<T> {
    pub fn new(
        repository: Arc<dyn TransactionalRepository>,
        providers: &[DeleteProvider<T>],
    ) -> Result<Self, InterceptorError> {
        let (around, on_tx) = build_stages(providers)?;
        Ok(Self {
            repository,
            around,
            on_tx,
        })
    }

    /// Deletes everything matching `criteria`. Nothing matching is `NotFound`.
    pub async fn delete(
        &self,
        ctx: &RequestContext,
        criteria: &[Criterion],
    ) -> Result<(), ApiError> {
        let objects: Vec<T> = self.repository.list_typed(criteria).await?;
        if objects.is_empty() {
            return Err(nothing_matched::<T>());
        }
        AroundDeleteNext {
            pipeline: self,
            position: 0,
        }
        .run(ctx, &objects)
        .await
    }

    async fn in_transaction(&self, ctx: &RequestContext, objects: &[T]) -> Result<(), ApiError> {
        let tx = self.repository.begin().await?;
        let result = async {
            let id_criteria = [Criterion::in_values("id", ids(objects))];
            let current: Vec<T> = tx.repository().list_typed(&id_criteria).await?;
            if current.is_empty() {
                return Err(nothing_matched::<T>());
            }
            OnDeleteNext {
                pipeline: self,
                position: 0,
            }
            .run(ctx, tx.repository(), &current)
            .await
        }
        .await;

        match result {
            Ok(()) => {
                tx.commit().await?;
                Ok(())
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

pub struct AroundDeleteNext<'a, T: Resource> {
    pipeline: &'a DeletePipeline<T>,
    position: usize,
}

impl<'a, T: Resource> AroundDeleteNext<'a, T> {
    pub fn run<'r>(self, ctx: &'r RequestContext, objects: &'r [T]) -> DeleteFuture<'r>
    where
        'a: 'r,
    {
        Box::pin(async move {
            match self.pipeline.around.get(self.position) {
                Some(interceptor) => {
                    let next = AroundDeleteNext {
                        pipeline: self.pipeline,
                        position: self.position + 1,
                    };
                    interceptor.around_tx(ctx, objects, next).await
                }
                None => self.pipeline.in_transaction(ctx, objects).await,
            }
        })
    }
}

pub struct OnDeleteNext<'a, T: Resource> {
    pipeline: &'a DeletePipeline<T>,
    position: usize,
}

impl<'a, T: Resource> OnDeleteNext<'a, T> {
    pub fn run<'r>(
        self,
        ctx: &'r RequestContext,
        tx: &'r dyn Repository,
        objects: &'r [T],
    ) -> DeleteFuture<'r>
    where
        'a: 'r,
    {
        Box::pin(async move {
            match self.pipeline.on_tx.get(self.position) {
                Some(interceptor) => {
                    let next = OnDeleteNext {
                        pipeline: self.pipeline,
                        position: self.position + 1,
                    };
                    interceptor.on_tx(ctx, tx, objects, next).await
                }
                None => {
                    tx.delete(T::OBJECT_TYPE, &[Criterion::in_values("id", ids(objects))])
                        .await?;
                    Ok(())
                }
            }
        })
    }
}
