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

//! Entry point for running business logic inside database transactions.
//!
//! A `UnitOfWork` owns a persistence context and lets callers run closures ("work") inside a
//! transaction on it.  Work receives the `UnitOfWork` itself, which it can use to reach the
//! context and to run further units of work.  Those nested units of work join the transaction
//! opened by the outermost one, so helpers that need transactional guarantees can be composed
//! freely:
//!
//! ```rust
//! use tenon_core::db::{DbError, PersistenceContext};
//! use tenon_core::uow::UnitOfWork;
//!
//! async fn audit<C: PersistenceContext>(uow: &mut UnitOfWork<C>) -> Result<(), DbError> {
//!     uow.run_in_transaction(|uow| {
//!         Box::pin(async move {
//!             // Joins the transaction of the caller if there is one.
//!             assert!(uow.context().is_active());
//!             Ok::<_, DbError>(())
//!         })
//!     })
//!     .await
//! }
//!
//! async fn transfer<C: PersistenceContext>(uow: &mut UnitOfWork<C>) -> Result<(), DbError> {
//!     uow.run_in_transaction(|uow| {
//!         Box::pin(async move {
//!             audit(uow).await?;
//!             audit(uow).await
//!         })
//!     })
//!     .await
//! }
//! ```
//!
//! Only the outermost unit of work commits or rolls back.  An error returned by a nested unit of
//! work does not doom the transaction by itself: the caller gets to decide whether to propagate
//! it (in which case the outermost unit of work rolls back) or to recover from it.

use crate::db::{DbError, PersistenceContext};
use crate::tx::{Outcome, Scope, ScopedCustomization, TxCoordinator, TxOptions};
use futures::future::BoxFuture;
use log::warn;

/// Owner of a persistence context that runs units of work in transactions on it.
///
/// A `UnitOfWork` is meant to be used by one logical task at a time.  All operations take
/// `&mut self`, so nested units of work can only happen through the reference handed to work.
pub struct UnitOfWork<C: PersistenceContext> {
    /// The persistence context owned by this unit of work.
    context: C,

    /// Transaction state for `context`.
    coordinator: TxCoordinator<C>,

    /// Options used by the operations that do not take explicit options.
    defaults: TxOptions,
}

impl<C: PersistenceContext> UnitOfWork<C> {
    /// Creates a new unit of work that takes ownership of `context`.
    pub fn new(context: C) -> Self {
        Self { context, coordinator: TxCoordinator::default(), defaults: TxOptions::default() }
    }

    /// Replaces the options used by `run_in_transaction` and `call_in_transaction`.
    pub fn with_default_options(mut self, defaults: TxOptions) -> Self {
        self.defaults = defaults;
        self
    }

    /// Returns the options used by `run_in_transaction` and `call_in_transaction`.
    pub fn default_options(&self) -> TxOptions {
        self.defaults
    }

    /// Returns the persistence context.
    pub fn context(&self) -> &C {
        &self.context
    }

    /// Returns the persistence context for modification, typically to issue queries.
    pub fn context_mut(&mut self) -> &mut C {
        &mut self.context
    }

    /// Returns true if a transaction is active.
    pub fn in_transaction(&self) -> bool {
        self.coordinator.is_active()
    }

    /// Returns how many units of work are running in the active transaction.
    pub fn depth(&self) -> usize {
        self.coordinator.depth()
    }

    /// Starts a scope that overrides settings of the persistence context until it is dropped.
    pub fn customize(&mut self) -> ScopedCustomization<'_, C> {
        ScopedCustomization::new(&mut self.context)
    }

    /// Runs `work` in a transaction configured with the default options.
    pub async fn run_in_transaction<E, F>(&mut self, work: F) -> Result<(), E>
    where
        F: for<'a> FnOnce(&'a mut Self) -> BoxFuture<'a, Result<(), E>> + Send,
        E: From<DbError> + Send,
    {
        let opts = self.defaults;
        self.call_in_transaction_with(opts, work).await
    }

    /// Runs `work` in a transaction configured by `opts`.
    pub async fn run_in_transaction_with<E, F>(&mut self, opts: TxOptions, work: F) -> Result<(), E>
    where
        F: for<'a> FnOnce(&'a mut Self) -> BoxFuture<'a, Result<(), E>> + Send,
        E: From<DbError> + Send,
    {
        self.call_in_transaction_with(opts, work).await
    }

    /// Runs `work` in a transaction configured with the default options and returns its result.
    pub async fn call_in_transaction<T, E, F>(&mut self, work: F) -> Result<T, E>
    where
        F: for<'a> FnOnce(&'a mut Self) -> BoxFuture<'a, Result<T, E>> + Send,
        T: Send,
        E: From<DbError> + Send,
    {
        let opts = self.defaults;
        self.call_in_transaction_with(opts, work).await
    }

    /// Runs `work` in a transaction configured by `opts` and returns its result.
    ///
    /// If there is no active transaction, one is started with the isolation level and
    /// serialize-read flag requested in `opts` (or the context's current ones if unspecified).
    /// The transaction is committed if `work` succeeds and rolled back if it fails, and the
    /// context settings are restored in both cases.  Errors returned by `work` are returned
    /// unchanged, even if the rollback fails.
    ///
    /// If a transaction is already active, `work` runs within it without committing or rolling
    /// back anything.  Asking for a different isolation level or serialize-read flag than the
    /// active ones, or for `Propagation::RequiresNew`, fails with
    /// `DbError::ConfigurationConflict` before running `work`.
    ///
    /// If the returned future is dropped before it completes, as happens when a caller imposes a
    /// timeout, the unit of work counts as failed: a transaction it opened is rolled back when
    /// this `UnitOfWork` is next used to run work, or by `abort` or `close`.
    pub async fn call_in_transaction_with<T, E, F>(
        &mut self,
        opts: TxOptions,
        work: F,
    ) -> Result<T, E>
    where
        F: for<'a> FnOnce(&'a mut Self) -> BoxFuture<'a, Result<T, E>> + Send,
        T: Send,
        E: From<DbError> + Send,
    {
        let scope = self.coordinator.enter(&mut self.context, &opts).await?;

        let guard = self.coordinator.guard();
        let result = work(self).await;
        guard.release();

        match scope {
            Scope::Joined => {
                self.coordinator.leave();
                result
            }

            Scope::Outermost => match result {
                Ok(value) => {
                    self.coordinator.finish(&mut self.context, Outcome::Commit).await?;
                    Ok(value)
                }
                Err(e) => {
                    if let Err(rollback_err) =
                        self.coordinator.finish(&mut self.context, Outcome::Rollback).await
                    {
                        warn!(
                            "Failed to roll back transaction after failed work: {}",
                            rollback_err
                        );
                    }
                    Err(e)
                }
            },
        }
    }

    /// Rolls back the active transaction, including one left behind by a unit of work whose
    /// future was dropped before completion.  Does nothing if there is no transaction.
    pub async fn abort(&mut self) -> Result<(), DbError> {
        self.coordinator.abort(&mut self.context).await
    }

    /// Releases the persistence context, rolling back any transaction that is still active.
    pub async fn close(mut self) -> Result<(), DbError> {
        let result = self.abort().await;
        self.context.close().await;
        result
    }
}

impl<C: PersistenceContext> Drop for UnitOfWork<C> {
    fn drop(&mut self) {
        if self.context.is_active() {
            warn!("Dropping unit of work with an active transaction; leaving it to the backend");
        }
        self.coordinator.abandon(&mut self.context);
    }
}
