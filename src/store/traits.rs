use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

use crate::model::{Object, ObjectType, Resource};
use crate::store::Criterion;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{object_type} not found")]
    NotFound { object_type: ObjectType },
    #[error("{object_type} with {key} already exists")]
    UniqueViolation { object_type: ObjectType, key: String },
    #[error("expected {expected} but storage returned {actual}")]
    TypeMismatch {
        expected: ObjectType,
        actual: ObjectType,
    },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Internal(err.into())
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Storage contract shared by the plain repository and transaction scoped handles.
#[async_trait::async_trait]
pub trait Repository: Send + Sync {
    async fn create(&self, object: Object) -> StoreResult<Object>;
    /// First object matching the criteria, or `NotFound`.
    async fn get(&self, object_type: ObjectType, criteria: &[Criterion]) -> StoreResult<Object>;
    async fn list(&self, object_type: ObjectType, criteria: &[Criterion])
        -> StoreResult<Vec<Object>>;
    async fn count(&self, object_type: ObjectType, criteria: &[Criterion]) -> StoreResult<usize>;
    /// Replaces the stored object with the same id and bumps `updated_at`.
    async fn update(&self, object: Object) -> StoreResult<Object>;
    /// Deletes every match and returns how many were removed. `NotFound` when nothing matched.
    async fn delete(&self, object_type: ObjectType, criteria: &[Criterion]) -> StoreResult<usize>;
}

#[async_trait::async_trait]
pub trait Transaction: Send + Sync {
    fn repository(&self) -> &dyn Repository;
    async fn commit(self: Box<Self>) -> StoreResult<()>;
    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}

#[async_trait::async_trait]
pub trait TransactionalRepository: Repository {
    async fn begin(&self) -> StoreResult<Box<dyn Transaction>>;
}

pub type TxFuture<'t, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 't>>;

/// Runs `work` inside a transaction, committing on success and rolling back on error.
pub async fn in_transaction<T, E, F>(
    repository: &dyn TransactionalRepository,
    work: F,
) -> Result<T, E>
where
    F: for<'t> FnOnce(&'t dyn Repository) -> TxFuture<'t, T, E> + Send,
    E: From<StoreError>,
{
    let tx = repository.begin().await?;
    let result = work(tx.repository()).await;
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                log::warn!("Failed to roll back transaction: {}", rollback_err);
            }
            Err(err)
        }
    }
}

fn downcast<T: Resource>(object: Object) -> StoreResult<T> {
    T::from_object(object).map_err(|other| StoreError::TypeMismatch {
        expected: T::OBJECT_TYPE,
        actual: other.object_type(),
    })
}

/// Typed helpers over any repository.
#[async_trait::async_trait]
pub trait RepositoryExt: Repository {
    async fn get_typed<T: Resource>(&self, criteria: &[Criterion]) -> StoreResult<T> {
        let object = self.get(T::OBJECT_TYPE, criteria).await?;
        downcast(object)
    }

    async fn get_by_id<T: Resource>(&self, id: &str) -> StoreResult<T> {
        self.get_typed::<T>(&[Criterion::equals("id", id)]).await
    }

    async fn list_typed<T: Resource>(&self, criteria: &[Criterion]) -> StoreResult<Vec<T>> {
        self.list(T::OBJECT_TYPE, criteria)
            .await?
            .into_iter()
            .map(downcast)
            .collect()
    }

    async fn create_typed<T: Resource>(&self, value: T) -> StoreResult<T> {
        let object = self.create(value.into_object()).await?;
        downcast(object)
    }

    async fn update_typed<T: Resource>(&self, value: T) -> StoreResult<T> {
        let object = self.update(value.into_object()).await?;
        downcast(object)
    }

    /// Like `delete`, but an empty match is not an error.
    async fn delete_matching(
        &self,
        object_type: ObjectType,
        criteria: &[Criterion],
    ) -> StoreResult<usize> {
        match self.delete(object_type, criteria).await {
            Ok(count) => Ok(count),
            Err(StoreError::NotFound { .. }) => Ok(0),
            Err(err) => Err(err),
        }
    }
}

impl<R: Repository + ?Sized> RepositoryExt for R {}
