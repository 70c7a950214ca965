//! The Postgres document store backend. Record documents live as JSONB rows
//! keyed by (database, id), with the version and staged flag mirrored into
//! columns for scanning.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use sqlx::migrate::{MigrateDatabase, Migrator};
use sqlx::pool::PoolOptions;
use sqlx::types::Json;
use sqlx::{Executor, Pool, Postgres, Row};
use tracing::{info, instrument, warn};

use super::{DatabaseStatus, DocumentStore, LockDoc, RecordStream};
use crate::config::StoreConfig;
use crate::errors::StoreError;
use crate::parser::options::ParsingOptions;
use crate::record::{StoredRecord, Version};

// Statically link in migration files
static MIGRATOR: Migrator = sqlx::migrate!("schemas/store");

/// Page size used by the change stream's keyset pagination.
const STREAM_PAGE_SIZE: i64 = 1_000;

pub struct PostgresStore {
    pub pool: Pool<Postgres>,
}

impl PostgresStore {
    #[instrument(skip_all)]
    pub async fn connect(config: &StoreConfig) -> anyhow::Result<Self> {
        info!(url = %config.database, "Connecting to document store");

        // Create database if requested and does not exist
        if config.migrate && !Postgres::database_exists(&config.database).await? {
            warn!(url = %config.database, "Database does not exist, creating database");
            Postgres::create_database(&config.database).await?;
        }

        let pool = PoolOptions::<Postgres>::new()
            .max_connections(config.max_connections)
            .after_connect(|conn, _| {
                Box::pin(async move {
                    conn.execute("SET DEFAULT_TRANSACTION_ISOLATION TO 'SERIALIZABLE'")
                        .await?;
                    Ok(())
                })
            })
            .connect(&config.database)
            .await?;

        if config.migrate {
            info!(url = %config.database, "Running migrations");
            MIGRATOR.run(&pool).await?;
        }

        Ok(PostgresStore { pool })
    }
}

#[async_trait]
impl DocumentStore for PostgresStore {
    #[instrument(skip(self), level = "debug")]
    async fn get_record(
        &self,
        database: &str,
        id: &str,
    ) -> Result<Option<StoredRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT doc
            FROM   sg_records
            WHERE  database = $1 AND id = $2
            "#,
        )
        .bind(database)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| row.get::<Json<StoredRecord>, _>(0).0))
    }

    #[instrument(skip(self, ids), level = "debug")]
    async fn get_records(
        &self,
        database: &str,
        ids: &[String],
    ) -> Result<Vec<StoredRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT doc
            FROM   sg_records
            WHERE  database = $1 AND id = ANY($2)
            "#,
        )
        .bind(database)
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| row.get::<Json<StoredRecord>, _>(0).0)
            .collect())
    }

    #[instrument(skip(self, records), level = "debug")]
    async fn upsert_records(
        &self,
        database: &str,
        records: Vec<StoredRecord>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for record in &records {
            sqlx::query(
                r#"
                INSERT INTO sg_records (database, id, doc, version, staged)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (database, id)
                DO UPDATE SET doc = EXCLUDED.doc,
                              version = EXCLUDED.version,
                              staged = EXCLUDED.staged
                "#,
            )
            .bind(database)
            .bind(&record.id)
            .bind(Json(record))
            .bind(record.version)
            .bind(record.has_uncommitted())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn count_staged(&self, database: &str) -> Result<u64, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*)
            FROM   sg_records
            WHERE  database = $1 AND staged
            "#,
        )
        .bind(database)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get::<i64, _>(0) as u64)
    }

    #[instrument(skip(self), level = "debug")]
    async fn reserve_staged(&self, database: &str, version: Version) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sg_records
            SET    doc = jsonb_set(doc, '{next_version}', to_jsonb($2::bigint))
            WHERE  database = $1 AND staged
            "#,
        )
        .bind(database)
        .bind(version)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), level = "debug")]
    async fn commit_staged(&self, database: &str, version: Version) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            r#"
            SELECT doc
            FROM   sg_records
            WHERE  database = $1 AND staged
            FOR UPDATE
            "#,
        )
        .bind(database)
        .fetch_all(&mut *tx)
        .await?;

        let mut committed = 0;
        for row in rows {
            let mut record = row.get::<Json<StoredRecord>, _>(0).0;
            if record.fold_staged(version) {
                committed += 1;
            }
            // written back even when the fold was a no-op so the pending
            // state is cleared either way
            sqlx::query(
                r#"
                UPDATE sg_records
                SET    doc = $3, version = $4, staged = FALSE
                WHERE  database = $1 AND id = $2
                "#,
            )
            .bind(database)
            .bind(record.id.clone())
            .bind(Json(&record))
            .bind(record.version)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(committed)
    }

    #[instrument(skip(self), level = "debug")]
    async fn rollback_staged(&self, database: &str) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;

        let dropped = sqlx::query(
            r#"
            DELETE FROM sg_records
            WHERE  database = $1 AND staged AND version IS NULL
            "#,
        )
        .bind(database)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let rolled_back = sqlx::query(
            r#"
            UPDATE sg_records
            SET    doc = doc - 'next' - 'next_version', staged = FALSE
            WHERE  database = $1 AND staged
            "#,
        )
        .bind(database)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        Ok(dropped + rolled_back)
    }

    fn stream_changed(&self, database: &str, since: Option<Version>) -> RecordStream {
        let pool = self.pool.clone();
        let database = database.to_owned();
        let floor = since.unwrap_or(i64::MIN);

        let stream = async_stream::try_stream! {
            let mut last_id = String::new();
            loop {
                let rows = sqlx::query(
                    r#"
                    SELECT doc
                    FROM   sg_records
                    WHERE  database = $1 AND version > $2 AND id > $3
                    ORDER  BY id
                    LIMIT  $4
                    "#,
                )
                .bind(&database)
                .bind(floor)
                .bind(&last_id)
                .bind(STREAM_PAGE_SIZE)
                .fetch_all(&pool)
                .await?;

                let done = (rows.len() as i64) < STREAM_PAGE_SIZE;
                for row in rows {
                    let record = row.get::<Json<StoredRecord>, _>(0).0;
                    last_id.clone_from(&record.id);
                    yield record;
                }
                if done {
                    break;
                }
            }
        };
        stream.boxed()
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_status(&self, database: &str) -> Result<Option<DatabaseStatus>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT doc
            FROM   sg_status
            WHERE  database = $1
            "#,
        )
        .bind(database)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| row.get::<Json<DatabaseStatus>, _>(0).0))
    }

    #[instrument(skip(self, status), level = "debug")]
    async fn put_status(&self, status: &DatabaseStatus) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sg_status (database, doc)
            VALUES ($1, $2)
            ON CONFLICT (database) DO UPDATE SET doc = EXCLUDED.doc
            "#,
        )
        .bind(&status.database)
        .bind(Json(status))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self, lock), level = "debug")]
    async fn insert_lock(&self, lock: &LockDoc) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO sg_locks (id, owner, acquired_at, metadata)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&lock.id)
        .bind(&lock.owner)
        .bind(lock.acquired_at)
        .bind(&lock.metadata)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_lock(&self, id: &str) -> Result<Option<LockDoc>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, owner, acquired_at, metadata
            FROM   sg_locks
            WHERE  id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| LockDoc {
            id: row.get(0),
            owner: row.get(1),
            acquired_at: row.get(2),
            metadata: row.get(3),
        }))
    }

    #[instrument(skip(self, lock), level = "debug")]
    async fn replace_lock(&self, expected_owner: &str, lock: &LockDoc) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sg_locks
            SET    owner = $2, acquired_at = $3, metadata = $4
            WHERE  id = $1 AND owner = $5
            "#,
        )
        .bind(&lock.id)
        .bind(&lock.owner)
        .bind(lock.acquired_at)
        .bind(&lock.metadata)
        .bind(expected_owner)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), level = "debug")]
    async fn refresh_lock(
        &self,
        id: &str,
        owner: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sg_locks
            SET    acquired_at = $3
            WHERE  id = $1 AND owner = $2
            "#,
        )
        .bind(id)
        .bind(owner)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_lock(&self, id: &str, owner: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM sg_locks
            WHERE  id = $1 AND owner = $2
            "#,
        )
        .bind(id)
        .bind(owner)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, options), level = "debug")]
    async fn append_options_history(
        &self,
        database: &str,
        version: Version,
        options: &ParsingOptions,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sg_options_history (database, version, options)
            VALUES ($1, $2, $3)
            ON CONFLICT (database, version) DO UPDATE SET options = EXCLUDED.options
            "#,
        )
        .bind(database)
        .bind(version)
        .bind(Json(options))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
