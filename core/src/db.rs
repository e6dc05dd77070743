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

//! Generic abstraction over the persistence engine that units of work run against.
//!
//! The facilities in this module describe a persistence context: a single connection-like object
//! that can begin, commit and roll back one transaction at a time and that carries a few mutable
//! settings (isolation level, serialize-read flag and free-form properties).  The PostgreSQL
//! backend is for production use and the SQLite backend is primarily intended to support unit
//! tests.  The in-memory backend exists for tests that need fault injection.

use crate::tx::IsolationLevel;
use async_trait::async_trait;
use std::collections::BTreeMap;

#[cfg(any(test, feature = "testutils"))]
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;

/// Database errors.  Any unexpected errors that come from the database are classified as
/// `BackendError`, but errors we know about have more specific types.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum DbError {
    /// Indicates that a request to create an entry failed because it already exists.
    #[error("Already exists")]
    AlreadyExists,

    /// Catch-all error type for unexpected database errors.
    #[error("Database error: {0}")]
    BackendError(String),

    /// Indicates that a unit of work asked for transaction settings that are incompatible with
    /// the transaction that is already active.  This is a programming error and is never retried.
    #[error("Transaction configuration conflict: {0}")]
    ConfigurationConflict(String),

    /// Indicates a failure processing the data that already exists in the database.
    #[error("Data integrity error: {0}")]
    DataIntegrityError(String),

    /// Indicates that a requested entry does not exist.
    #[error("Entity not found")]
    NotFound,

    /// Indicates that the database is not available (maybe because of too many active concurrent
    /// connections).
    #[error("Unavailable")]
    Unavailable,
}

/// Result type for this module.
pub type DbResult<T> = Result<T, DbError>;

/// Mutable configuration of a persistence context.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ContextSettings {
    /// Isolation level that the next transaction will be opened with.
    pub isolation: IsolationLevel,

    /// Whether reads should lock the rows they return until the transaction ends.
    pub serialize_read: bool,

    /// Free-form named properties (fetch groups, detachment options, and the like) that the
    /// database layer can consult.
    pub properties: BTreeMap<String, String>,
}

/// Abstraction over a connection-like persistence context.
///
/// A context runs at most one transaction at a time.  Nesting is not the context's concern: that
/// is handled by `crate::uow::UnitOfWork`, which is the only expected caller of `begin`,
/// `commit` and `rollback`.
#[async_trait]
pub trait PersistenceContext: Send {
    /// Begins a transaction using the current settings.
    ///
    /// Fails if a transaction is already active.
    async fn begin(&mut self) -> DbResult<()>;

    /// Commits the active transaction.
    ///
    /// Fails if there is no active transaction.  The transaction is over once this returns,
    /// regardless of the outcome.
    async fn commit(&mut self) -> DbResult<()>;

    /// Rolls back the active transaction.
    ///
    /// Fails if there is no active transaction.  The transaction is over once this returns,
    /// regardless of the outcome.
    async fn rollback(&mut self) -> DbResult<()>;

    /// Returns true if a transaction is currently open.
    fn is_active(&self) -> bool;

    /// Forgets the active transaction without talking to the backend, which is left to roll it
    /// back on its own.  Does nothing if there is no active transaction.
    ///
    /// Backends may need to give up their connection to do this, in which case the context
    /// cannot issue queries afterwards.
    fn discard(&mut self);

    /// Releases the resources held by the context.  An active transaction is rolled back.
    async fn close(&mut self);

    /// Returns the current settings of the context.
    fn settings(&self) -> &ContextSettings;

    /// Returns the current settings of the context for modification.
    ///
    /// Callers should prefer the typed setters, which validate the changes.
    fn settings_mut(&mut self) -> &mut ContextSettings;

    /// Returns the isolation level that transactions are opened with.
    fn isolation_level(&self) -> IsolationLevel {
        self.settings().isolation
    }

    /// Sets the isolation level for the next transaction.
    ///
    /// Changing the isolation level of a transaction that is already open is not possible.
    fn set_isolation_level(&mut self, level: IsolationLevel) -> DbResult<()> {
        if self.is_active() && self.settings().isolation != level {
            return Err(DbError::BackendError(format!(
                "Cannot change isolation level from {} to {} while a transaction is active",
                self.settings().isolation,
                level
            )));
        }
        self.settings_mut().isolation = level;
        Ok(())
    }

    /// Returns whether reads lock the rows they return.
    fn serialize_read(&self) -> bool {
        self.settings().serialize_read
    }

    /// Sets whether reads lock the rows they return.
    ///
    /// Changing the flag of a transaction that is already open is not possible.
    fn set_serialize_read(&mut self, serialize_read: bool) -> DbResult<()> {
        if self.is_active() && self.settings().serialize_read != serialize_read {
            return Err(DbError::BackendError(format!(
                "Cannot change serialize-read from {} to {} while a transaction is active",
                self.settings().serialize_read,
                serialize_read
            )));
        }
        self.settings_mut().serialize_read = serialize_read;
        Ok(())
    }

    /// Returns the value of the property `name`, if set.
    fn property(&self, name: &str) -> Option<&str> {
        self.settings().properties.get(name).map(String::as_str)
    }

    /// Sets the property `name` to `value`, or removes it if `value` is `None`.
    fn set_property(&mut self, name: &str, value: Option<String>) -> DbResult<()> {
        let properties = &mut self.settings_mut().properties;
        match value {
            Some(value) => {
                properties.insert(name.to_owned(), value);
            }
            None => {
                properties.remove(name);
            }
        }
        Ok(())
    }
}

/// Abstraction over a database that hands out persistence contexts.
///
/// Each context owns one connection for as long as it lives, so contexts should be short-lived:
/// typically one per request handled by the driver.
#[async_trait]
pub trait Db: Send + Sync {
    /// Type of the persistence contexts created by this database.
    type Context: PersistenceContext;

    /// Creates a new persistence context.
    async fn context(&self) -> DbResult<Self::Context>;

    /// Closes the database, waiting for all contexts to be released first.
    async fn close(&self);
}

/// Macros to help instantiate tests for multiple database systems.
#[cfg(any(test, feature = "testutils"))]
pub mod testutils {
    pub use paste::paste;

    /// Instantiates the `module::name` test for the database configured by `setup`.
    ///
    /// The `extra` metadata parameter can be used to tag the generated tests.
    #[macro_export]
    macro_rules! generate_one_test [
        ( $name:ident, $setup:expr, $module:path $(, #[$extra:meta] )? ) => {
            #[tokio::test]
            $(#[$extra])?
            async fn $name() {
                $crate::db::testutils::paste! {
                    $module :: [< $name >]($setup).await;
                }
            }
        }
    ];

    pub use generate_one_test;

    /// Instantiates a collection of tests for a specific database system.
    ///
    /// The database implementation to run the tests against is determined by the `setup`
    /// expression, which needs to return a fresh persistence context.
    ///
    /// The `extra` metadata parameter can be used to tag the generated tests.
    #[macro_export]
    macro_rules! generate_tests [
        ( #[$extra:meta], $setup:expr, $module:path $(, $name:ident)+ ) => {
            $(
                $crate::db::testutils::generate_one_test!($name, $setup, $module, #[$extra]);
            )+
        };

        ( $setup:expr, $module:path $(, $name:ident)+ ) => {
            $(
                $crate::db::testutils::generate_one_test!($name, $setup, $module);
            )+
        };
    ];

    pub use generate_tests;
}
