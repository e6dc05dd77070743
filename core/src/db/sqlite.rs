// Tenon
// Copyright 2023 Julio Merino
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not
// use this file except in compliance with the License.  You may obtain a copy
// of the License at:
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.  See the
// License for the specific language governing permissions and limitations
// under the License.

//! Persistence context backed by an SQLite database.

use crate::db::{ContextSettings, Db, DbError, DbResult, PersistenceContext};
use crate::tx::IsolationLevel;
use async_trait::async_trait;
use log::{debug, warn};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{Sqlite, SqliteConnection, SqlitePool};

/// Takes a raw SQLx error `e` and converts it to our generic error type.
pub fn map_sqlx_error(e: sqlx::Error) -> DbError {
    match e {
        sqlx::Error::ColumnDecode { source, .. } => DbError::DataIntegrityError(source.to_string()),
        sqlx::Error::RowNotFound => DbError::NotFound,
        sqlx::Error::PoolTimedOut => DbError::Unavailable,
        e if e.to_string().contains("FOREIGN KEY constraint failed") => DbError::NotFound,
        e if e.to_string().contains("UNIQUE constraint failed") => DbError::AlreadyExists,
        e => DbError::BackendError(e.to_string()),
    }
}

/// Opens a pool of connections to the database identified by `conn_str`.
pub async fn connect(conn_str: &str) -> DbResult<SqliteDb> {
    let pool = SqlitePool::connect(conn_str).await.map_err(map_sqlx_error)?;
    Ok(SqliteDb { pool })
}

/// A database instance backed by an SQLite database.
#[derive(Clone)]
pub struct SqliteDb {
    /// Shared SQLite connection pool.  This is a cloneable type that all concurrent persistence
    /// contexts can use concurrently.
    pool: SqlitePool,
}

#[async_trait]
impl Db for SqliteDb {
    type Context = SqliteContext;

    async fn context(&self) -> DbResult<SqliteContext> {
        let conn = self.pool.acquire().await.map_err(map_sqlx_error)?;
        Ok(SqliteContext { conn: Some(conn), settings: ContextSettings::default(), active: false })
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// Persistence context that runs transactions on a dedicated SQLite connection.
///
/// SQLite transactions are always serializable, so the isolation level only matters for
/// `IsolationLevel::ReadUncommitted`, which enables dirty reads on shared-cache databases.
/// Serialize-read transactions take the write lock upfront so that concurrent writers cannot
/// invalidate what the transaction reads.
pub struct SqliteContext {
    /// Connection owned by this context, or `None` once the context is closed.
    conn: Option<PoolConnection<Sqlite>>,

    /// Current settings of the context.
    settings: ContextSettings,

    /// Whether we have issued a `BEGIN` that has not been ended yet.
    active: bool,
}

impl SqliteContext {
    /// Returns the connection of this context to issue queries against it.
    ///
    /// Queries issued while a transaction is active are part of that transaction.
    pub fn ex(&mut self) -> DbResult<&mut SqliteConnection> {
        match self.conn.as_mut() {
            Some(conn) => Ok(&mut **conn),
            None => Err(DbError::BackendError("Persistence context is closed".to_owned())),
        }
    }

    /// Executes the raw `sql` statement on the connection.
    async fn exec(&mut self, sql: &str) -> DbResult<()> {
        sqlx::Executor::execute(self.ex()?, sqlx::raw_sql(sql)).await.map_err(map_sqlx_error)?;
        Ok(())
    }

    /// Marks the active transaction as finished, failing if there was none.
    fn end(&mut self) -> DbResult<()> {
        if !self.active {
            return Err(DbError::BackendError("No active transaction".to_owned()));
        }
        self.active = false;
        Ok(())
    }

    /// Takes the connection out of the pool so that closing it discards the open transaction.
    fn discard_connection(&mut self) {
        if let Some(conn) = self.conn.take() {
            drop(conn.detach());
        }
        self.active = false;
    }
}

#[async_trait]
impl PersistenceContext for SqliteContext {
    async fn begin(&mut self) -> DbResult<()> {
        if self.active {
            return Err(DbError::BackendError("Transaction already active".to_owned()));
        }

        let read_uncommitted = self.settings.isolation == IsolationLevel::ReadUncommitted;
        self.exec(&format!("PRAGMA read_uncommitted = {}", i32::from(read_uncommitted))).await?;

        let stmt = if self.settings.serialize_read { "BEGIN IMMEDIATE" } else { "BEGIN DEFERRED" };
        self.exec(stmt).await?;
        self.active = true;
        debug!("Began transaction with {} ({})", stmt, self.settings.isolation);
        Ok(())
    }

    async fn commit(&mut self) -> DbResult<()> {
        self.end()?;
        if let Err(e) = self.exec("COMMIT").await {
            // A failed COMMIT can leave the transaction open.
            if let Err(e2) = self.exec("ROLLBACK").await {
                warn!("Failed to roll back after failed commit: {}", e2);
            }
            return Err(e);
        }
        Ok(())
    }

    async fn rollback(&mut self) -> DbResult<()> {
        self.end()?;
        if let Err(e) = self.exec("ROLLBACK").await {
            // The connection may still be in a transaction, so it must not go back to the pool.
            self.discard_connection();
            return Err(e);
        }
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn discard(&mut self) {
        if self.active {
            self.discard_connection();
        }
    }

    async fn close(&mut self) {
        if self.active {
            if let Err(e) = self.rollback().await {
                warn!("Failed to roll back transaction while closing context: {}", e);
            }
        }
        self.conn = None;
    }

    fn settings(&self) -> &ContextSettings {
        &self.settings
    }

    fn settings_mut(&mut self) -> &mut ContextSettings {
        &mut self.settings
    }
}

impl Drop for SqliteContext {
    fn drop(&mut self) {
        if self.active {
            warn!("Dropping SQLite context with an active transaction; discarding its connection");
            self.discard_connection();
        }
    }
}

/// Helper function to initialize the database with a schema.
pub async fn run_schema(ex: &mut SqliteConnection, schema: &str) -> DbResult<()> {
    sqlx::Executor::execute(ex, sqlx::raw_sql(schema)).await.map_err(map_sqlx_error)?;
    Ok(())
}

/// Test utilities for the SQLite connection.
#[cfg(any(feature = "testutils", test))]
pub mod testutils {
    use super::*;

    /// Initializes a test database and returns a persistence context on it.
    pub async fn setup() -> SqliteContext {
        let _can_fail = env_logger::builder().is_test(true).try_init();
        let db = connect(":memory:").await.unwrap();
        db.context().await.unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::testutils::*;
    use super::*;
    use crate::db::tests::generate_context_tests;
    use crate::tx::TxOptions;
    use crate::uow::UnitOfWork;
    use crate::uow::tests::{TestStore, generate_uow_tests};
    use sqlx::Row;

    #[async_trait]
    impl TestStore for SqliteContext {
        async fn insert(&mut self, value: &str) -> DbResult<()> {
            sqlx::query("INSERT INTO entries (value) VALUES (?)")
                .bind(value)
                .execute(self.ex()?)
                .await
                .map_err(map_sqlx_error)?;
            Ok(())
        }

        async fn values(&mut self) -> DbResult<Vec<String>> {
            let rows = sqlx::query("SELECT value FROM entries ORDER BY value")
                .fetch_all(self.ex()?)
                .await
                .map_err(map_sqlx_error)?;
            rows.iter().map(|row| row.try_get("value").map_err(map_sqlx_error)).collect()
        }
    }

    /// Initializes a test database with the schema needed by `TestStore`.
    async fn setup_store() -> SqliteContext {
        let mut context = setup().await;
        run_schema(context.ex().unwrap(), "CREATE TABLE entries (value TEXT NOT NULL)")
            .await
            .unwrap();
        context
    }

    generate_context_tests!(setup().await);

    generate_uow_tests!(setup_store().await);

    #[tokio::test]
    async fn test_serialize_read_transaction() {
        let mut uow = UnitOfWork::new(setup_store().await);

        let opts = TxOptions::new().with_serialize_read(true);
        uow.run_in_transaction_with(opts, |uow| {
            Box::pin(async move {
                let row = sqlx::query("SELECT COUNT(*) AS count FROM entries")
                    .fetch_one(uow.context_mut().ex()?)
                    .await
                    .map_err(map_sqlx_error)?;
                assert_eq!(0, row.get::<i64, _>("count"));
                Ok::<_, DbError>(())
            })
        })
        .await
        .unwrap();

        uow.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_uncommitted_pragma() {
        /// Queries the current value of the `read_uncommitted` pragma.
        async fn pragma(context: &mut SqliteContext) -> i64 {
            let row = sqlx::query("PRAGMA read_uncommitted")
                .fetch_one(context.ex().unwrap())
                .await
                .unwrap();
            row.get(0)
        }

        let mut context = setup().await;

        context.set_isolation_level(IsolationLevel::ReadUncommitted).unwrap();
        context.begin().await.unwrap();
        assert_eq!(1, pragma(&mut context).await);
        context.commit().await.unwrap();

        context.set_isolation_level(IsolationLevel::Serializable).unwrap();
        context.begin().await.unwrap();
        assert_eq!(0, pragma(&mut context).await);
        context.rollback().await.unwrap();

        context.close().await;
    }

    #[tokio::test]
    async fn test_close_releases_connection() {
        let db = connect("sqlite::memory:").await.unwrap();
        let mut context = db.context().await.unwrap();
        run_schema(context.ex().unwrap(), "CREATE TABLE entries (value TEXT NOT NULL)")
            .await
            .unwrap();

        context.begin().await.unwrap();
        context.insert("a").await.unwrap();
        context.close().await;
        assert!(!context.is_active());
        match context.ex() {
            Err(DbError::BackendError(e)) => assert!(e.contains("closed")),
            Err(e) => panic!("Must have failed with a BackendError but got: {:?}", e),
            Ok(_) => panic!("Must have failed"),
        }
    }

    #[tokio::test]
    async fn test_failed_rollback_discards_connection() {
        let mut context = setup().await;
        context.begin().await.unwrap();

        // End the transaction behind the context's back so that its ROLLBACK fails.
        sqlx::raw_sql("ROLLBACK").execute(context.ex().unwrap()).await.unwrap();
        context.rollback().await.unwrap_err();

        assert!(!context.is_active());
        match context.ex() {
            Err(DbError::BackendError(e)) => assert!(e.contains("closed")),
            Err(e) => panic!("Must have failed with a BackendError but got: {:?}", e),
            Ok(_) => panic!("Must have failed"),
        }
        context.close().await;
    }

    #[tokio::test]
    async fn test_constraint_errors() {
        let mut context = setup().await;
        run_schema(
            context.ex().unwrap(),
            "CREATE TABLE parents (id INTEGER PRIMARY KEY);
            CREATE TABLE children (parent INTEGER NOT NULL REFERENCES parents(id));
            PRAGMA foreign_keys = ON;",
        )
        .await
        .unwrap();

        sqlx::query("INSERT INTO parents (id) VALUES (1)")
            .execute(context.ex().unwrap())
            .await
            .unwrap();
        let e = sqlx::query("INSERT INTO parents (id) VALUES (1)")
            .execute(context.ex().unwrap())
            .await
            .unwrap_err();
        assert_eq!(DbError::AlreadyExists, map_sqlx_error(e));

        let e = sqlx::query("INSERT INTO children (parent) VALUES (2)")
            .execute(context.ex().unwrap())
            .await
            .unwrap_err();
        assert_eq!(DbError::NotFound, map_sqlx_error(e));

        context.close().await;
    }
}
