//! Operation records, the job scheduler that executes them and the maintainer that reaps them.

pub mod maintainer;
pub mod scheduler;

pub use maintainer::*;
pub use scheduler::*;

use crate::context::RequestContext;
use crate::error::ApiError;
use crate::model::{ObjectType, Operation, OperationState};
use crate::store::{in_transaction, Criterion, Repository, RepositoryExt, TransactionalRepository};

fn unfinished_states() -> [&'static str; 2] {
    [
        OperationState::Pending.as_str(),
        OperationState::InProgress.as_str(),
    ]
}

/// Fails with 422 when `resource_id` has a pending or in progress operation other than `exclude`.
pub async fn ensure_no_operation_in_progress(
    repository: &dyn Repository,
    resource_id: &str,
    exclude: Option<&str>,
) -> Result<(), ApiError> {
    let mut criteria = vec![
        Criterion::equals("resource_id", resource_id),
        Criterion::in_values("state", unfinished_states()),
    ];
    if let Some(id) = exclude {
        criteria.push(Criterion::not_equals("id", id));
    }
    let count = repository.count(ObjectType::Operation, &criteria).await?;
    if count > 0 {
        return Err(ApiError::concurrent_operation(resource_id));
    }
    Ok(())
}

/// Stores `operation` as PENDING. The uniqueness check and the insert share a transaction.
pub async fn start_operation(
    repository: &dyn TransactionalRepository,
    ctx: &RequestContext,
    mut operation: Operation,
) -> Result<Operation, ApiError> {
    operation.state = OperationState::Pending;
    operation.correlation_id = ctx.correlation_id.clone();
    in_transaction::<_, ApiError, _>(repository, move |tx| {
        Box::pin(async move {
            ensure_no_operation_in_progress(tx, &operation.resource_id, None).await?;
            Ok(tx.create_typed(operation).await?)
        })
    })
    .await
}
