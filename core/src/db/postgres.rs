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

//! Persistence context backed by a PostgreSQL database.

use crate::db::{ContextSettings, Db, DbError, DbResult, PersistenceContext};
use crate::env::{get_optional_var, get_required_var};
use async_trait::async_trait;
use derivative::Derivative;
use futures::Future;
use log::{debug, warn};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{
    PgConnectOptions, PgConnection, PgDatabaseError, PgPool, PgPoolOptions, Postgres,
};
use std::time::Duration;

/// Default value for the `max_retries` configuration property.
const DEFAULT_MAX_RETRIES: u16 = 60;

/// Takes a raw SQLx error `e` and converts it to our generic error type.
pub fn map_sqlx_error(e: sqlx::Error) -> DbError {
    match e {
        sqlx::Error::ColumnDecode { source, .. } => DbError::DataIntegrityError(source.to_string()),
        sqlx::Error::Database(e) => match e.try_downcast_ref::<PgDatabaseError>() {
            Some(pg) => match pg.code() {
                "23503" /* foreign_key_violation */ => DbError::NotFound,
                "23505" /* unique_violation */ => DbError::AlreadyExists,
                "53300" /* too_many_connections */ => DbError::Unavailable,
                number => DbError::BackendError(format!("pgsql error {}: {}", number, e)),
            },
            None => DbError::BackendError(e.to_string()),
        },
        sqlx::Error::PoolTimedOut => DbError::Unavailable,
        sqlx::Error::RowNotFound => DbError::NotFound,
        e => DbError::BackendError(e.to_string()),
    }
}

/// Options to establish a connection to a PostgreSQL database.
#[derive(Derivative)]
#[derivative(Debug, Default)]
#[cfg_attr(test, derivative(PartialEq))]
pub struct PostgresOptions {
    /// Host to connect to.
    pub host: String,

    /// Port to connect to (typically 5432).
    pub port: u16,

    /// Database name to connect to.
    pub database: String,

    /// Username to establish the connection with.
    pub username: String,

    /// Password to establish the connection with.
    #[derivative(Debug = "ignore")]
    pub password: String,

    /// Minimum number of connections to keep open against the database.
    pub min_connections: Option<u32>,

    /// Maximum number of connections to allow against the database.
    pub max_connections: Option<u32>,

    /// Maximum number of attempts to retry a connection operation when the database does not seem
    /// to be available.
    pub max_retries: u16,
}

impl PostgresOptions {
    /// Initializes a set of options from environment variables whose name is prefixed with the
    /// given `prefix`.
    ///
    /// This will use variables such as `<prefix>_HOST`, `<prefix>_PORT`, `<prefix>_DATABASE`,
    /// `<prefix>_USERNAME`, `<prefix>_PASSWORD`, `<prefix>_MIN_CONNECTIONS`,
    /// `<prefix>_MAX_CONNECTIONS` and `<prefix>_MAX_RETRIES`.
    pub fn from_env(prefix: &str) -> Result<PostgresOptions, String> {
        Ok(PostgresOptions {
            host: get_required_var::<String>(prefix, "HOST")?,
            port: get_required_var::<u16>(prefix, "PORT")?,
            database: get_required_var::<String>(prefix, "DATABASE")?,
            username: get_required_var::<String>(prefix, "USERNAME")?,
            password: get_required_var::<String>(prefix, "PASSWORD")?,
            min_connections: get_optional_var::<u32>(prefix, "MIN_CONNECTIONS")?,
            max_connections: get_optional_var::<u32>(prefix, "MAX_CONNECTIONS")?,
            max_retries: get_optional_var::<u16>(prefix, "MAX_RETRIES")?
                .unwrap_or(DEFAULT_MAX_RETRIES),
        })
    }
}

/// Retries a database operation up to `retries` times.
async fn retry<Op, OpFut, T>(op: Op, mut retries: u16) -> DbResult<T>
where
    Op: Fn() -> OpFut,
    OpFut: Future<Output = Result<T, sqlx::Error>>,
    T: Send + Sync,
{
    let mut delay = Duration::from_millis(100 + u64::from(rand::random::<u16>() % 900));
    loop {
        match op().await.map_err(map_sqlx_error) {
            Ok(result) => return Ok(result),
            Err(DbError::Unavailable) => {
                if retries == 0 {
                    return Err(DbError::Unavailable);
                }
                retries -= 1;

                warn!(
                    "Database is unavailable; waiting {}ms before retrying with {} attempts left",
                    delay.as_millis(),
                    retries
                );

                tokio::time::sleep(delay).await;
                if delay < Duration::from_secs(5) {
                    delay += Duration::from_millis(u64::from(rand::random::<u16>() % 1000));
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// Shareable pool of connections from which persistence contexts are created.
#[derive(Clone)]
pub struct PostgresDb {
    /// Shared PostgreSQL connection pool.  This is a cloneable type that all concurrent
    /// persistence contexts can use concurrently.
    pool: PgPool,

    /// Maximum number of attempts to retry a connection operation when the database does not seem
    /// to be available.
    max_retries: u16,
}

impl PostgresDb {
    /// Creates a new connection based on a set of options.
    ///
    /// Note that this does *not* establish the connection.
    pub fn connect(opts: PostgresOptions) -> DbResult<Self> {
        let mut pool_options = PgPoolOptions::new();
        if let Some(min_connections) = opts.min_connections {
            pool_options = pool_options.min_connections(min_connections);
        }
        if let Some(max_connections) = opts.max_connections {
            pool_options = pool_options.max_connections(max_connections);
        }
        pool_options = pool_options.acquire_timeout(Duration::from_secs(2));

        let options = PgConnectOptions::new()
            .host(&opts.host)
            .port(opts.port)
            .database(&opts.database)
            .username(&opts.username)
            .password(&opts.password);

        let pool = pool_options.connect_lazy_with(options);
        Ok(Self { pool, max_retries: opts.max_retries })
    }
}

#[async_trait]
impl Db for PostgresDb {
    type Context = PostgresContext;

    /// Waits for the database to become available if necessary.
    async fn context(&self) -> DbResult<PostgresContext> {
        let conn = retry(|| self.pool.acquire(), self.max_retries).await?;
        Ok(PostgresContext {
            conn: Some(conn),
            settings: ContextSettings::default(),
            active: false,
        })
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// Persistence context that runs transactions on a dedicated PostgreSQL connection.
///
/// Transactions are opened with the isolation level of the context.  PostgreSQL has no
/// transaction-wide switch for locking reads, so queries that should honor the serialize-read
/// flag must append `locking_clause` to their `SELECT` statements.
pub struct PostgresContext {
    /// Connection owned by this context, or `None` once the context is closed.
    conn: Option<PoolConnection<Postgres>>,

    /// Current settings of the context.
    settings: ContextSettings,

    /// Whether we have issued a `BEGIN` that has not been ended yet.
    active: bool,
}

impl PostgresContext {
    /// Returns the connection of this context to issue queries against it.
    ///
    /// Queries issued while a transaction is active are part of that transaction.
    pub fn ex(&mut self) -> DbResult<&mut PgConnection> {
        match self.conn.as_mut() {
            Some(conn) => Ok(&mut **conn),
            None => Err(DbError::BackendError("Persistence context is closed".to_owned())),
        }
    }

    /// Returns the clause to append to `SELECT` statements so that they lock the rows they read
    /// when serialize-read is enabled.
    pub fn locking_clause(&self) -> &'static str {
        if self.active && self.settings.serialize_read { " FOR UPDATE" } else { "" }
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
impl PersistenceContext for PostgresContext {
    async fn begin(&mut self) -> DbResult<()> {
        if self.active {
            return Err(DbError::BackendError("Transaction already active".to_owned()));
        }

        let stmt = format!("BEGIN ISOLATION LEVEL {}", self.settings.isolation.as_sql());
        self.exec(&stmt).await?;
        self.active = true;
        debug!("Began transaction with {}", stmt);
        Ok(())
    }

    async fn commit(&mut self) -> DbResult<()> {
        self.end()?;
        self.exec("COMMIT").await
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

impl Drop for PostgresContext {
    fn drop(&mut self) {
        if self.active {
            warn!("Dropping PostgreSQL context with an active transaction; discarding connection");
            self.discard_connection();
        }
    }
}

/// Helper function to initialize the database with a schema.
pub async fn run_schema(ex: &mut PgConnection, schema: &str) -> DbResult<()> {
    // Strip out comments from the schema so that we can safely separate the statements by
    // looking for semicolons.
    let comments = regex::RegexBuilder::new("--.*$")
        .multi_line(true)
        .build()
        .map_err(|e| DbError::BackendError(e.to_string()))?;
    let schema = comments.replace_all(schema, "");

    for query_str in schema.split(';') {
        if query_str.trim().is_empty() {
            continue;
        }
        sqlx::query(query_str).execute(&mut *ex).await.map_err(map_sqlx_error)?;
    }
    Ok(())
}

/// Test utilities for the PostgreSQL connection.
#[cfg(any(feature = "testutils", test))]
pub mod testutils {
    use super::*;

    /// Creates a new connection to the test database and returns a persistence context on it.
    ///
    /// This sets up the connection to use the `pg_temp` schema by default so that any tables
    /// created during the test are deleted at disconnection time.  Note that for this to work,
    /// the context must keep its single connection open for the duration of the test.
    ///
    /// Given that this is for testing purposes only, any errors will panic.
    pub async fn setup() -> PostgresContext {
        let _can_fail = env_logger::builder().is_test(true).try_init();

        let mut opts = PostgresOptions::from_env("PGSQL_TEST").unwrap();
        opts.min_connections = Some(1);
        opts.max_connections = Some(1);
        let db = PostgresDb::connect(opts).unwrap();

        let mut context = db.context().await.unwrap();
        sqlx::query("SET search_path TO pg_temp").execute(context.ex().unwrap()).await.unwrap();
        context
    }
}
