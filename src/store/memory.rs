use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::model::{Object, ObjectType};
use crate::store::criteria::{matches, order_and_limit};
use crate::store::{
    Criterion, Repository, StoreError, StoreResult, Transaction, TransactionalRepository,
};

#[derive(Debug, Clone)]
struct Entry {
    id: String,
    unique_key: Option<String>,
    document: Value,
}

/// JSON documents per object type, kept in insertion order.
#[derive(Debug, Default)]
struct Documents {
    tables: RwLock<HashMap<ObjectType, Vec<Entry>>>,
}

impl Documents {
    fn snapshot(&self) -> Documents {
        Documents {
            tables: RwLock::new(self.tables.read().clone()),
        }
    }

    fn matching(&self, object_type: ObjectType, criteria: &[Criterion]) -> Vec<Value> {
        let tables = self.tables.read();
        let documents = tables
            .get(&object_type)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|entry| matches(&entry.document, criteria))
                    .map(|entry| entry.document.clone())
                    .collect()
            })
            .unwrap_or_default();
        order_and_limit(documents, criteria)
    }

    fn insert(&self, object: Object) -> StoreResult<Object> {
        let object_type = object.object_type();
        let entry = Entry {
            id: object.id().to_string(),
            unique_key: object.unique_key(),
            document: object.to_value()?,
        };

        let mut tables = self.tables.write();
        let entries = tables.entry(object_type).or_default();
        if entries.iter().any(|existing| existing.id == entry.id) {
            return Err(StoreError::UniqueViolation {
                object_type,
                key: format!("id={}", entry.id),
            });
        }
        check_unique_key(object_type, entries, &entry)?;

        let document = entry.document.clone();
        entries.push(entry);
        Ok(Object::from_value(object_type, document)?)
    }

    fn replace(&self, mut object: Object) -> StoreResult<Object> {
        object.touch();
        let object_type = object.object_type();
        let entry = Entry {
            id: object.id().to_string(),
            unique_key: object.unique_key(),
            document: object.to_value()?,
        };

        let mut tables = self.tables.write();
        let entries = tables.entry(object_type).or_default();
        check_unique_key(object_type, entries, &entry)?;
        let slot = entries
            .iter_mut()
            .find(|existing| existing.id == entry.id)
            .ok_or(StoreError::NotFound { object_type })?;

        let document = entry.document.clone();
        *slot = entry;
        Ok(Object::from_value(object_type, document)?)
    }

    fn remove(&self, object_type: ObjectType, criteria: &[Criterion]) -> StoreResult<usize> {
        let mut tables = self.tables.write();
        let entries = tables.entry(object_type).or_default();
        let before = entries.len();
        entries.retain(|entry| !matches(&entry.document, criteria));
        let removed = before - entries.len();
        if removed == 0 {
            return Err(StoreError::NotFound { object_type });
        }
        Ok(removed)
    }
}

fn check_unique_key(object_type: ObjectType, entries: &[Entry], entry: &Entry) -> StoreResult<()> {
    let Some(key) = &entry.unique_key else {
        return Ok(());
    };
    let taken = entries
        .iter()
        .any(|existing| existing.id != entry.id && existing.unique_key.as_ref() == Some(key));
    if taken {
        return Err(StoreError::UniqueViolation {
            object_type,
            key: key.clone(),
        });
    }
    Ok(())
}

#[async_trait::async_trait]
impl Repository for Documents {
    async fn create(&self, object: Object) -> StoreResult<Object> {
        self.insert(object)
    }

    async fn get(&self, object_type: ObjectType, criteria: &[Criterion]) -> StoreResult<Object> {
        let document = self
            .matching(object_type, criteria)
            .into_iter()
            .next()
            .ok_or(StoreError::NotFound { object_type })?;
        Ok(Object::from_value(object_type, document)?)
    }

    async fn list(
        &self,
        object_type: ObjectType,
        criteria: &[Criterion],
    ) -> StoreResult<Vec<Object>> {
        self.matching(object_type, criteria)
            .into_iter()
            .map(|document| Ok(Object::from_value(object_type, document)?))
            .collect()
    }

    async fn count(&self, object_type: ObjectType, criteria: &[Criterion]) -> StoreResult<usize> {
        Ok(self.matching(object_type, criteria).len())
    }

    async fn update(&self, object: Object) -> StoreResult<Object> {
        self.replace(object)
    }

    async fn delete(&self, object_type: ObjectType, criteria: &[Criterion]) -> StoreResult<usize> {
        self.remove(object_type, criteria)
    }
}

/// Process local repository used by tests and the `memory` storage backend.
///
/// Transactions are serialized: `begin` takes an owned lock and works on a snapshot that
/// replaces the committed documents on commit. Plain writes wait for any open transaction.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRepository {
    committed: Arc<Documents>,
    write_lock: Arc<Mutex<()>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Repository for InMemoryRepository {
    async fn create(&self, object: Object) -> StoreResult<Object> {
        let _guard = self.write_lock.lock().await;
        self.committed.insert(object)
    }

    async fn get(&self, object_type: ObjectType, criteria: &[Criterion]) -> StoreResult<Object> {
        self.committed.get(object_type, criteria).await
    }

    async fn list(
        &self,
        object_type: ObjectType,
        criteria: &[Criterion],
    ) -> StoreResult<Vec<Object>> {
        self.committed.list(object_type, criteria).await
    }

    async fn count(&self, object_type: ObjectType, criteria: &[Criterion]) -> StoreResult<usize> {
        self.committed.count(object_type, criteria).await
    }

    async fn update(&self, object: Object) -> StoreResult<Object> {
        let _guard = self.write_lock.lock().await;
        self.committed.replace(object)
    }

    async fn delete(&self, object_type: ObjectType, criteria: &[Criterion]) -> StoreResult<usize> {
        let _guard = self.write_lock.lock().await;
        self.committed.remove(object_type, criteria)
    }
}

#[async_trait::async_trait]
impl TransactionalRepository for InMemoryRepository {
    async fn begin(&self) -> StoreResult<Box<dyn Transaction>> {
        let guard = self.write_lock.clone().lock_owned().await;
        Ok(Box::new(MemoryTransaction {
            working: self.committed.snapshot(),
            committed: self.committed.clone(),
            _guard: guard,
        }))
    }
}

struct MemoryTransaction {
    working: Documents,
    committed: Arc<Documents>,
    _guard: OwnedMutexGuard<()>,
}

#[async_trait::async_trait]
impl Transaction for MemoryTransaction {
    fn repository(&self) -> &dyn Repository {
        &self.working
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let MemoryTransaction {
            working,
            committed,
            _guard,
        } = *self;
        *committed.tables.write() = working.tables.into_inner();
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }
}
