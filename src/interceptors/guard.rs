use std::marker::PhantomData;

use crate::context::RequestContext;
use crate::error::ApiError;
use crate::interceptors::delete::{DeleteInterceptor, OnDeleteNext};
use crate::interceptors::update::{OnUpdateNext, UpdateInterceptor};
use crate::model::Resource;
use crate::operations::ensure_no_operation_in_progress;
use crate::store::Repository;

pub const OPERATION_GUARD: &str = "operation-guard";

/// Rejects updates and deletes of a resource while another operation on it is unfinished.
pub struct OperationGuardInterceptor<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> OperationGuardInterceptor<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for OperationGuardInterceptor<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl<T: Resource> UpdateInterceptor<T> for OperationGuardInterceptor<T> {
    async fn on_tx(
        &self,
        ctx: &RequestContext,
        tx: &dyn Repository,
        old: &T,
        new: T,
        next: OnUpdateNext<'_, T>,
    ) -> Result<T, ApiError> {
        ensure_no_operation_in_progress(tx, old.id(), ctx.operation_id.as_deref()).await?;
        next.run(ctx, tx, old, new).await
    }
}

#[async_trait::async_trait]
impl<T: Resource> DeleteInterceptor<T> for OperationGuardInterceptor<T> {
    async fn on_tx(
        &self,
        ctx: &RequestContext,
        tx: &dyn Repository,
        objects: &[T],
        next: OnDeleteNext<'_, T>,
    ) -> Result<(), ApiError> {
        for object in objects {
            ensure_no_operation_in_progress(tx, object.id(), ctx.operation_id.as_deref()).await?;
        }
        next.run(ctx, tx, objects).await
    }
}
