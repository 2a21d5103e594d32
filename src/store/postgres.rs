use anyhow::Context;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgConnection, PgPool, Postgres, QueryBuilder, Row};
use tokio::sync::Mutex;

use crate::model::{Object, ObjectType};
use crate::store::criteria::{Operator, SortOrder};
use crate::store::{
    Criterion, Repository, StoreError, StoreResult, Transaction, TransactionalRepository,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sm_objects (
    seq BIGSERIAL,
    object_type TEXT NOT NULL,
    id TEXT NOT NULL,
    unique_key TEXT,
    data JSONB NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (object_type, id)
);
CREATE UNIQUE INDEX IF NOT EXISTS sm_objects_unique_key ON sm_objects (object_type, unique_key);
"#;

#[derive(Debug, Clone)]
pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    /// Create a new PostgreSQL repository with the given database URL
    pub async fn new(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to create PostgreSQL connection pool")?;

        Ok(Self { pool })
    }

    /// Creates the object table when it does not exist yet
    pub async fn migrate(&self) -> anyhow::Result<()> {
        self.pool
            .execute(SCHEMA)
            .await
            .context("Failed to create sm_objects table")?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn connection(&self) -> StoreResult<sqlx::pool::PoolConnection<Postgres>> {
        self.pool
            .acquire()
            .await
            .context("Failed to acquire connection")
            .map_err(StoreError::from)
    }
}

fn is_timestamp_field(field: &str) -> bool {
    field.ends_with("_at") || field == "deletion_scheduled"
}

/// `data->>'field'`, cast to timestamptz for timestamp fields so comparisons are chronological.
fn push_field(builder: &mut QueryBuilder<'_, Postgres>, field: &str) {
    builder.push("(data->>");
    builder.push_bind(field.to_string());
    builder.push(")");
    if is_timestamp_field(field) {
        builder.push("::timestamptz");
    }
}

fn push_value(builder: &mut QueryBuilder<'_, Postgres>, field: &str, value: &str) {
    builder.push_bind(value.to_string());
    if is_timestamp_field(field) {
        builder.push("::timestamptz");
    }
}

fn push_criteria(
    builder: &mut QueryBuilder<'_, Postgres>,
    object_type: ObjectType,
    criteria: &[Criterion],
) {
    builder.push(" WHERE object_type = ");
    builder.push_bind(object_type.as_str());

    for criterion in criteria {
        let Criterion::Field { field, op, values } = criterion else {
            continue;
        };
        let first = values.first().map(String::as_str).unwrap_or_default();
        builder.push(" AND ");
        match op {
            Operator::Equals => {
                push_field(builder, field);
                builder.push(" = ");
                push_value(builder, field, first);
            }
            Operator::NotEquals => {
                builder.push("(data->>");
                builder.push_bind(field.clone());
                builder.push(") IS DISTINCT FROM ");
                builder.push_bind(first.to_string());
            }
            Operator::In => {
                builder.push("(data->>");
                builder.push_bind(field.clone());
                builder.push(") = ANY(");
                builder.push_bind(values.clone());
                builder.push(")");
            }
            Operator::LessThan => {
                push_field(builder, field);
                builder.push(" < ");
                push_value(builder, field, first);
            }
            Operator::GreaterThan => {
                push_field(builder, field);
                builder.push(" > ");
                push_value(builder, field, first);
            }
        }
    }
}

fn push_order_and_limit(builder: &mut QueryBuilder<'_, Postgres>, criteria: &[Criterion]) {
    let mut ordered = false;
    for criterion in criteria {
        if let Criterion::OrderBy { field, order } = criterion {
            builder.push(if ordered { ", " } else { " ORDER BY " });
            push_field(builder, field);
            builder.push(match order {
                SortOrder::Asc => " ASC",
                SortOrder::Desc => " DESC",
            });
            ordered = true;
        }
    }
    builder.push(if ordered { ", seq" } else { " ORDER BY seq" });

    if let Some(limit) = criteria.iter().find_map(|c| match c {
        Criterion::Limit(limit) => Some(*limit as i64),
        _ => None,
    }) {
        builder.push(" LIMIT ");
        builder.push_bind(limit);
    }
}

fn map_write_error(err: sqlx::Error, object_type: ObjectType, key: String) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return StoreError::UniqueViolation { object_type, key };
        }
    }
    internal(err, "Failed to write object")
}

fn internal(err: sqlx::Error, action: &'static str) -> StoreError {
    StoreError::Internal(anyhow::Error::new(err).context(action))
}

// Statement helpers shared by pooled connections and open transactions

async fn select(
    conn: &mut PgConnection,
    object_type: ObjectType,
    criteria: &[Criterion],
) -> StoreResult<Vec<Object>> {
    let mut builder = QueryBuilder::new("SELECT data FROM sm_objects");
    push_criteria(&mut builder, object_type, criteria);
    push_order_and_limit(&mut builder, criteria);

    let rows = builder
        .build()
        .fetch_all(conn)
        .await
        .map_err(|e| internal(e, "Failed to list objects"))?;

    rows.into_iter()
        .map(|row| {
            let data: Value = row
                .try_get("data")
                .map_err(|e| internal(e, "Failed to decode object"))?;
            Ok(Object::from_value(object_type, data)?)
        })
        .collect()
}

async fn count(
    conn: &mut PgConnection,
    object_type: ObjectType,
    criteria: &[Criterion],
) -> StoreResult<usize> {
    let mut builder = QueryBuilder::new("SELECT COUNT(*) AS total FROM sm_objects");
    push_criteria(&mut builder, object_type, criteria);

    let row = builder
        .build()
        .fetch_one(conn)
        .await
        .map_err(|e| internal(e, "Failed to count objects"))?;
    let total: i64 = row
        .try_get("total")
        .map_err(|e| internal(e, "Failed to decode count"))?;
    Ok(total as usize)
}

async fn insert(conn: &mut PgConnection, object: Object) -> StoreResult<Object> {
    let object_type = object.object_type();
    let unique_key = object.unique_key();
    let data = object.to_value()?;

    sqlx::query(
        "INSERT INTO sm_objects (object_type, id, unique_key, data, created_at) \
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(object_type.as_str())
    .bind(object.id())
    .bind(&unique_key)
    .bind(sqlx::types::Json(&data))
    .bind(object.created_at())
    .execute(conn)
    .await
    .map_err(|e| {
        let key = unique_key.clone().unwrap_or_else(|| format!("id={}", object.id()));
        map_write_error(e, object_type, key)
    })?;

    Ok(Object::from_value(object_type, data)?)
}

async fn replace(conn: &mut PgConnection, mut object: Object) -> StoreResult<Object> {
    object.touch();
    let object_type = object.object_type();
    let unique_key = object.unique_key();
    let data = object.to_value()?;

    let result = sqlx::query(
        "UPDATE sm_objects SET unique_key = $3, data = $4 WHERE object_type = $1 AND id = $2",
    )
    .bind(object_type.as_str())
    .bind(object.id())
    .bind(&unique_key)
    .bind(sqlx::types::Json(&data))
    .execute(conn)
    .await
    .map_err(|e| map_write_error(e, object_type, unique_key.clone().unwrap_or_default()))?;

    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound { object_type });
    }
    Ok(Object::from_value(object_type, data)?)
}

async fn remove(
    conn: &mut PgConnection,
    object_type: ObjectType,
    criteria: &[Criterion],
) -> StoreResult<usize> {
    let mut builder = QueryBuilder::new("DELETE FROM sm_objects");
    push_criteria(&mut builder, object_type, criteria);

    let result = builder
        .build()
        .execute(conn)
        .await
        .map_err(|e| internal(e, "Failed to delete objects"))?;

    match result.rows_affected() {
        0 => Err(StoreError::NotFound { object_type }),
        n => Ok(n as usize),
    }
}

async fn first(
    conn: &mut PgConnection,
    object_type: ObjectType,
    criteria: &[Criterion],
) -> StoreResult<Object> {
    let mut limited = criteria.to_vec();
    limited.retain(|c| !matches!(c, Criterion::Limit(_)));
    limited.push(Criterion::limit(1));
    select(conn, object_type, &limited)
        .await?
        .into_iter()
        .next()
        .ok_or(StoreError::NotFound { object_type })
}

#[async_trait::async_trait]
impl Repository for PostgresRepository {
    async fn create(&self, object: Object) -> StoreResult<Object> {
        let mut conn = self.connection().await?;
        insert(&mut conn, object).await
    }

    async fn get(&self, object_type: ObjectType, criteria: &[Criterion]) -> StoreResult<Object> {
        let mut conn = self.connection().await?;
        first(&mut conn, object_type, criteria).await
    }

    async fn list(
        &self,
        object_type: ObjectType,
        criteria: &[Criterion],
    ) -> StoreResult<Vec<Object>> {
        let mut conn = self.connection().await?;
        select(&mut conn, object_type, criteria).await
    }

    async fn count(&self, object_type: ObjectType, criteria: &[Criterion]) -> StoreResult<usize> {
        let mut conn = self.connection().await?;
        count(&mut conn, object_type, criteria).await
    }

    async fn update(&self, object: Object) -> StoreResult<Object> {
        let mut conn = self.connection().await?;
        replace(&mut conn, object).await
    }

    async fn delete(&self, object_type: ObjectType, criteria: &[Criterion]) -> StoreResult<usize> {
        let mut conn = self.connection().await?;
        remove(&mut conn, object_type, criteria).await
    }
}

#[async_trait::async_trait]
impl TransactionalRepository for PostgresRepository {
    async fn begin(&self) -> StoreResult<Box<dyn Transaction>> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| internal(e, "Failed to begin transaction"))?;
        Ok(Box::new(PostgresTransaction {
            tx: Mutex::new(Some(tx)),
        }))
    }
}

struct PostgresTransaction {
    tx: Mutex<Option<sqlx::Transaction<'static, Postgres>>>,
}

impl PostgresTransaction {
    fn closed() -> StoreError {
        StoreError::Internal(anyhow::anyhow!("transaction already finished"))
    }
}

#[async_trait::async_trait]
impl Repository for PostgresTransaction {
    async fn create(&self, object: Object) -> StoreResult<Object> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(Self::closed)?;
        insert(&mut **tx, object).await
    }

    async fn get(&self, object_type: ObjectType, criteria: &[Criterion]) -> StoreResult<Object> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(Self::closed)?;
        first(&mut **tx, object_type, criteria).await
    }

    async fn list(
        &self,
        object_type: ObjectType,
        criteria: &[Criterion],
    ) -> StoreResult<Vec<Object>> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(Self::closed)?;
        select(&mut **tx, object_type, criteria).await
    }

    async fn count(&self, object_type: ObjectType, criteria: &[Criterion]) -> StoreResult<usize> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(Self::closed)?;
        count(&mut **tx, object_type, criteria).await
    }

    async fn update(&self, object: Object) -> StoreResult<Object> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(Self::closed)?;
        replace(&mut **tx, object).await
    }

    async fn delete(&self, object_type: ObjectType, criteria: &[Criterion]) -> StoreResult<usize> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(Self::closed)?;
        remove(&mut **tx, object_type, criteria).await
    }
}

#[async_trait::async_trait]
impl Transaction for PostgresTransaction {
    fn repository(&self) -> &dyn Repository {
        self
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let tx = self.tx.into_inner().ok_or_else(Self::closed)?;
        tx.commit()
            .await
            .map_err(|e| internal(e, "Failed to commit transaction"))
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        let tx = self.tx.into_inner().ok_or_else(Self::closed)?;
        tx.rollback()
            .await
            .map_err(|e| internal(e, "Failed to roll back transaction"))
    }
}
