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

//! State machine that maps nested units of work onto a single database transaction.
//!
//! The coordinator does not run work itself.  Callers bracket every unit of work with `enter`
//! and, depending on what `enter` returned, with `leave` (joined scopes) or `finish` (the scope
//! that opened the transaction).  This split lets the caller hand out mutable access to the
//! context while the work runs.
//!
//! Futures running units of work can be dropped before they complete, for example when a caller
//! wraps them in a timeout.  Callers hold a `ScopeGuard` while the work runs so that the
//! coordinator learns about such scopes: the next time it is used, it discounts them and, if the
//! outermost scope was among them, rolls back the transaction it left behind.

use crate::db::{DbError, DbResult, PersistenceContext};
use crate::tx::customization::{RestoreStack, ScopedCustomization};
use crate::tx::{IsolationLevel, Propagation, TxOptions};
use log::{debug, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Role of a unit of work within the transaction it runs in.
#[derive(Debug, Eq, PartialEq)]
#[must_use]
pub enum Scope {
    /// The unit of work opened the transaction and must end it with `TxCoordinator::finish`.
    Outermost,

    /// The unit of work joined a transaction opened by a caller and must end its participation
    /// with `TxCoordinator::leave`.
    Joined,
}

/// Outcome requested for the transaction when the outermost scope finishes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// Makes the changes of the transaction permanent.
    Commit,

    /// Discards the changes of the transaction.
    Rollback,
}

/// Marks a scope returned by `TxCoordinator::enter` as running until `release` is called.
///
/// Dropping the guard without releasing it records the scope as cancelled.
#[must_use]
pub struct ScopeGuard {
    /// Counter of cancelled scopes shared with the coordinator, or `None` once released.
    cancelled: Option<Arc<AtomicUsize>>,
}

impl ScopeGuard {
    /// Marks the scope as completed.  Must be called before `TxCoordinator::leave` or
    /// `TxCoordinator::finish`.
    pub fn release(mut self) {
        self.cancelled = None;
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        if let Some(cancelled) = self.cancelled.take() {
            warn!("Unit of work dropped before completion");
            cancelled.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Bookkeeping for an open transaction.
struct ActiveTx<C> {
    /// Isolation level the transaction was opened with.
    isolation: IsolationLevel,

    /// Serialize-read flag the transaction was opened with.
    serialize_read: bool,

    /// Number of scopes currently running within the transaction, including the outermost one.
    depth: usize,

    /// Actions to restore the context settings that were overridden to open the transaction.
    saved: RestoreStack<C>,
}

/// Tracks whether a transaction is active on a persistence context and how deeply nested the
/// units of work running in it are.
pub struct TxCoordinator<C> {
    /// The open transaction, if any.
    active: Option<ActiveTx<C>>,

    /// Number of scopes whose guards were dropped without being released.
    cancelled: Arc<AtomicUsize>,
}

impl<C> Default for TxCoordinator<C> {
    fn default() -> Self {
        Self { active: None, cancelled: Arc::default() }
    }
}

impl<C: PersistenceContext> TxCoordinator<C> {
    /// Returns true if a transaction is active and some scope is still running in it.
    ///
    /// A transaction whose outermost scope was cancelled is not active even if it has not been
    /// rolled back yet.
    pub fn is_active(&self) -> bool {
        self.depth() > 0
    }

    /// Returns the number of scopes running within the active transaction, or 0 if there is
    /// no transaction.
    pub fn depth(&self) -> usize {
        let cancelled = self.cancelled.load(Ordering::SeqCst);
        self.active.as_ref().map(|tx| tx.depth.saturating_sub(cancelled)).unwrap_or(0)
    }

    /// Returns the isolation level and serialize-read flag of the active transaction, if any.
    pub fn active_settings(&self) -> Option<(IsolationLevel, bool)> {
        if !self.is_active() {
            return None;
        }
        self.active.as_ref().map(|tx| (tx.isolation, tx.serialize_read))
    }

    /// Returns a guard to hold while the work of a freshly-entered scope runs.
    pub fn guard(&self) -> ScopeGuard {
        ScopeGuard { cancelled: Some(Arc::clone(&self.cancelled)) }
    }

    /// Discounts the scopes whose guards were dropped from the active transaction.
    ///
    /// Returns true if the outermost scope was among them, in which case the transaction is left
    /// with a depth of 1 so that it can be finished.
    fn settle_cancelled(&mut self) -> bool {
        let cancelled = self.cancelled.swap(0, Ordering::SeqCst);
        if cancelled == 0 {
            return false;
        }
        match self.active.as_mut() {
            Some(tx) if tx.depth > cancelled => {
                debug!("Discounting {} cancelled scopes from depth {}", cancelled, tx.depth);
                tx.depth -= cancelled;
                false
            }
            Some(tx) => {
                tx.depth = 1;
                true
            }
            None => false,
        }
    }

    /// Enters a new scope on `context` configured by `opts`.
    ///
    /// If no transaction is active, overrides the context settings as requested by `opts` and
    /// begins a transaction, returning `Scope::Outermost`.  Otherwise, validates that `opts` is
    /// compatible with the active transaction and joins it, returning `Scope::Joined`.
    ///
    /// On error, the state of the coordinator and of any active transaction is left untouched.
    ///
    /// If the outermost scope of the active transaction was cancelled, that transaction is rolled
    /// back first, and any failure to do so is returned.
    pub async fn enter(&mut self, context: &mut C, opts: &TxOptions) -> DbResult<Scope> {
        if self.settle_cancelled() {
            warn!("Rolling back transaction left behind by a cancelled unit of work");
            self.finish(context, Outcome::Rollback).await?;
        }

        if let Some(tx) = self.active.as_mut() {
            check_compatible(tx, opts)?;
            tx.depth += 1;
            debug!("Joining active transaction at depth {}", tx.depth);
            return Ok(Scope::Joined);
        }

        self.begin(context, opts).await?;
        Ok(Scope::Outermost)
    }

    /// Opens a new transaction on `context` with the settings requested in `opts`.
    async fn begin(&mut self, context: &mut C, opts: &TxOptions) -> DbResult<()> {
        let mut scope = ScopedCustomization::new(context);
        if let Some(isolation) = opts.isolation() {
            scope.with_isolation_level(isolation)?;
        }
        if let Some(serialize_read) = opts.serialize_read() {
            scope.with_serialize_read(serialize_read)?;
        }

        let isolation = scope.isolation_level();
        let serialize_read = scope.serialize_read();
        debug!(
            "Beginning transaction with isolation {} and serialize-read {}",
            isolation, serialize_read
        );
        // If this fails, dropping the scope puts the previous settings back.
        scope.begin().await?;

        let saved = scope.detach();
        self.active = Some(ActiveTx { isolation, serialize_read, depth: 1, saved });
        Ok(())
    }

    /// Leaves a scope previously entered as `Scope::Joined`.
    ///
    /// This never affects the fate of the transaction, even if the unit of work that ran in the
    /// scope failed: that decision belongs to the outermost scope alone.
    pub fn leave(&mut self) {
        self.settle_cancelled();
        match self.active.as_mut() {
            Some(tx) if tx.depth > 1 => {
                debug!("Leaving joined transaction at depth {}", tx.depth);
                tx.depth -= 1;
            }
            _ => warn!("Leaving a joined scope that is not active; ignoring"),
        }
    }

    /// Finishes the scope previously entered as `Scope::Outermost`, ending the transaction with
    /// the requested `outcome` and restoring the settings that were in effect before it began.
    ///
    /// The coordinator is idle after this returns, even on error.
    pub async fn finish(&mut self, context: &mut C, outcome: Outcome) -> DbResult<()> {
        self.settle_cancelled();
        let tx = match self.active.take() {
            Some(tx) => tx,
            None => {
                return Err(DbError::BackendError(
                    "Cannot finish a transaction that is not active".to_owned(),
                ));
            }
        };
        if tx.depth != 1 {
            warn!("Finishing transaction with {} nested scopes still running", tx.depth - 1);
        }

        debug!("Ending transaction with {:?}", outcome);
        let result = match outcome {
            Outcome::Commit => context.commit().await,
            Outcome::Rollback => context.rollback().await,
        };
        let restored = tx.saved.restore(context);
        result.and(restored)
    }

    /// Rolls back the active transaction regardless of how many scopes are running in it.
    ///
    /// This is meant to clean up after units of work that never completed, such as those whose
    /// futures were dropped before finishing.  Does nothing if there is no active transaction.
    pub async fn abort(&mut self, context: &mut C) -> DbResult<()> {
        self.settle_cancelled();
        match self.active.as_mut() {
            Some(tx) => {
                warn!("Aborting transaction with {} scopes still running", tx.depth);
                tx.depth = 1;
                self.finish(context, Outcome::Rollback).await
            }
            None => Ok(()),
        }
    }

    /// Forgets about the active transaction without talking to the backend, discarding it from
    /// the context and restoring the context settings that were overridden when it began.
    ///
    /// Used when the context is about to be dropped and the backend will roll back the
    /// transaction on its own.
    pub(crate) fn abandon(&mut self, context: &mut C) {
        self.settle_cancelled();
        if let Some(tx) = self.active.take() {
            warn!("Abandoning transaction with {} scopes still running", tx.depth);
            context.discard();
            if let Err(e) = tx.saved.restore(context) {
                warn!("Failed to restore settings of abandoned transaction: {}", e);
            }
        }
    }
}

/// Checks if a scope configured with `opts` can join the active transaction `tx`.
fn check_compatible<C>(tx: &ActiveTx<C>, opts: &TxOptions) -> DbResult<()> {
    if opts.propagation() == Propagation::RequiresNew {
        return Err(DbError::ConfigurationConflict(format!(
            "Propagation is set to {}, but a transaction is already active \
            (isolation {}, serialize-read {})",
            Propagation::RequiresNew,
            tx.isolation,
            tx.serialize_read
        )));
    }

    if let Some(isolation) = opts.isolation() {
        if isolation != tx.isolation {
            return Err(DbError::ConfigurationConflict(format!(
                "Isolation level is set to {}, but the active transaction uses {}",
                isolation, tx.isolation
            )));
        }
    }

    if let Some(serialize_read) = opts.serialize_read() {
        if serialize_read != tx.serialize_read {
            return Err(DbError::ConfigurationConflict(format!(
                "Serialize-read is set to {}, but the active transaction uses {}",
                serialize_read, tx.serialize_read
            )));
        }
    }

    Ok(())
}
