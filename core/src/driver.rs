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

//! Generic business logic for any service.
//!
//! Every service should implement its own `Driver` type that owns the means to create
//! persistence contexts (such as a `PostgresDb`) plus any in-memory state required by the app.
//! Driver operations wrap their work in a `crate::uow::UnitOfWork` so that every operation is
//! atomic, and operations that are built out of other operations can call them from within their
//! own unit of work to make the whole composition atomic:
//!
//! ```rust
//! use tenon_core::db::PersistenceContext;
//! use tenon_core::driver::{DriverError, DriverResult};
//! use tenon_core::uow::UnitOfWork;
//!
//! async fn validate<C: PersistenceContext>(uow: &mut UnitOfWork<C>, n: u32) -> DriverResult<()> {
//!     uow.run_in_transaction(move |_uow| {
//!         Box::pin(async move {
//!             if n == 0 {
//!                 return Err(DriverError::InvalidInput("Must be positive".to_owned()));
//!             }
//!             Ok(())
//!         })
//!     })
//!     .await
//! }
//! ```
//!
//! Errors from the persistence layer convert into `DriverError` via `?`, including those that
//! units of work raise when they are nested with incompatible transaction options.

use crate::db::DbError;

/// Business logic errors.  These errors encompass backend and logical errors.
#[derive(Debug, PartialEq, thiserror::Error)]
pub enum DriverError {
    /// Indicates that a request to create an entry failed because it already exists.
    #[error("{0}")]
    AlreadyExists(String),

    /// Catch-all error type for unexpected database errors.
    #[error("{0}")]
    BackendError(String),

    /// Indicates an error in the input data.
    #[error("{0}")]
    InvalidInput(String),

    /// Indicates that a requested entry does not exist.
    #[error("{0}")]
    NotFound(String),

    /// Indicates that the backend is temporarily unable to serve requests.
    #[error("{0}")]
    Unavailable(String),
}

impl From<DbError> for DriverError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::AlreadyExists => DriverError::AlreadyExists(e.to_string()),
            DbError::BackendError(_) => DriverError::BackendError(e.to_string()),
            DbError::ConfigurationConflict(_) => DriverError::InvalidInput(e.to_string()),
            DbError::DataIntegrityError(_) => DriverError::BackendError(e.to_string()),
            DbError::NotFound => DriverError::NotFound(e.to_string()),
            DbError::Unavailable => DriverError::Unavailable(e.to_string()),
        }
    }
}

/// Result type for this module.
pub type DriverResult<T> = Result<T, DriverError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryContext;
    use crate::tx::{IsolationLevel, TxOptions};
    use crate::uow::UnitOfWork;

    #[test]
    fn test_from_db_error() {
        assert_eq!(
            DriverError::AlreadyExists("Already exists".to_owned()),
            DbError::AlreadyExists.into()
        );
        assert_eq!(
            DriverError::BackendError("Data integrity error: bad row".to_owned()),
            DbError::DataIntegrityError("bad row".to_owned()).into()
        );
        assert_eq!(
            DriverError::InvalidInput("Transaction configuration conflict: nope".to_owned()),
            DbError::ConfigurationConflict("nope".to_owned()).into()
        );
        assert_eq!(DriverError::NotFound("Entity not found".to_owned()), DbError::NotFound.into());
        assert_eq!(DriverError::Unavailable("Unavailable".to_owned()), DbError::Unavailable.into());
    }

    #[tokio::test]
    async fn test_conflict_surfaces_as_invalid_input() {
        let mut uow = UnitOfWork::new(MemoryContext::new());

        let result: DriverResult<()> = uow
            .run_in_transaction(|uow| {
                Box::pin(async move {
                    let opts = TxOptions::new().with_isolation(IsolationLevel::Serializable);
                    uow.run_in_transaction_with(opts, |_| {
                        Box::pin(async move { Ok::<_, DriverError>(()) })
                    })
                    .await
                })
            })
            .await;
        match result {
            Err(DriverError::InvalidInput(e)) => assert!(e.contains("SERIALIZABLE")),
            e => panic!("Must have failed with InvalidInput but got: {:?}", e),
        }
    }
}
