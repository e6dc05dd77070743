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

//! Temporary overrides of persistence context settings with guaranteed restoration.

use crate::db::{DbResult, PersistenceContext};
use crate::tx::IsolationLevel;
use log::warn;
use std::mem;
use std::ops::{Deref, DerefMut};

/// Name of the property that selects the fetch group used when loading objects.
pub const FETCH_GROUP: &str = "fetch-group";

/// Name of the property that controls whether objects are detached when a transaction commits.
pub const DETACH_ALL_ON_COMMIT: &str = "detach-all-on-commit";

/// Closure that puts back one setting of a context of type `C`.
type RestoreAction<C> = Box<dyn FnOnce(&mut C) -> DbResult<()> + Send>;

/// Ordered collection of actions that undo a series of setting overrides.
///
/// Actions run in reverse order of registration so that overriding the same setting more than
/// once unwinds back to the value it had before the first override.
pub struct RestoreStack<C> {
    /// Pending actions, oldest first.
    actions: Vec<RestoreAction<C>>,
}

impl<C> Default for RestoreStack<C> {
    fn default() -> Self {
        Self { actions: vec![] }
    }
}

impl<C> RestoreStack<C> {
    /// Returns the number of pending restore actions.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Returns true if there is nothing to restore.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Records a new restore action.
    fn push(&mut self, action: RestoreAction<C>) {
        self.actions.push(action);
    }

    /// Runs all restore actions against `target`, newest first.
    ///
    /// All actions run even if some fail.  Every failure is logged and the first one is returned.
    pub fn restore(mut self, target: &mut C) -> DbResult<()> {
        let mut first_error = None;
        while let Some(action) = self.actions.pop() {
            if let Err(e) = action(target) {
                warn!("Failed to restore persistence context setting: {}", e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<C> Drop for RestoreStack<C> {
    fn drop(&mut self) {
        if !self.actions.is_empty() {
            warn!("Discarding {} setting overrides that were never restored", self.actions.len());
        }
    }
}

/// Guard that applies setting overrides to a persistence context and undoes them on exit.
///
/// The guard dereferences to the wrapped context so that code running within the scope can keep
/// using it.  Overrides are undone when the guard is closed, when it goes out of scope, or when
/// the stack unwinds through it.
pub struct ScopedCustomization<'a, C: PersistenceContext> {
    /// Context being customized.
    target: &'a mut C,

    /// Actions to undo the overrides applied so far.
    saved: RestoreStack<C>,
}

impl<'a, C: PersistenceContext> ScopedCustomization<'a, C> {
    /// Starts a customization scope over `target` with no overrides.
    pub fn new(target: &'a mut C) -> Self {
        Self { target, saved: RestoreStack::default() }
    }

    /// Overrides the isolation level of the context.
    pub fn with_isolation_level(&mut self, level: IsolationLevel) -> DbResult<&mut Self> {
        let previous = self.target.isolation_level();
        self.target.set_isolation_level(level)?;
        self.saved.push(Box::new(move |c: &mut C| c.set_isolation_level(previous)));
        Ok(self)
    }

    /// Overrides the serialize-read flag of the context.
    pub fn with_serialize_read(&mut self, serialize_read: bool) -> DbResult<&mut Self> {
        let previous = self.target.serialize_read();
        self.target.set_serialize_read(serialize_read)?;
        self.saved.push(Box::new(move |c: &mut C| c.set_serialize_read(previous)));
        Ok(self)
    }

    /// Sets the property `name` to `value`.
    pub fn with_property<V: Into<String>>(&mut self, name: &str, value: V) -> DbResult<&mut Self> {
        self.override_property(name, Some(value.into()))
    }

    /// Removes the property `name`.
    pub fn without_property(&mut self, name: &str) -> DbResult<&mut Self> {
        self.override_property(name, None)
    }

    /// Selects the fetch group to use while the scope is alive.
    pub fn with_fetch_group<V: Into<String>>(&mut self, group: V) -> DbResult<&mut Self> {
        self.with_property(FETCH_GROUP, group)
    }

    /// Sets whether objects are detached on commit while the scope is alive.
    pub fn with_detach_all_on_commit(&mut self, detach: bool) -> DbResult<&mut Self> {
        self.with_property(DETACH_ALL_ON_COMMIT, detach.to_string())
    }

    /// Common implementation of the property overrides.
    fn override_property(&mut self, name: &str, value: Option<String>) -> DbResult<&mut Self> {
        let previous = self.target.property(name).map(str::to_owned);
        self.target.set_property(name, value)?;
        let name = name.to_owned();
        self.saved.push(Box::new(move |c: &mut C| c.set_property(&name, previous)));
        Ok(self)
    }

    /// Ends the scope, undoing all overrides and reporting the first restoration failure.
    pub fn close(mut self) -> DbResult<()> {
        let saved = mem::take(&mut self.saved);
        saved.restore(&mut *self.target)
    }

    /// Ends the scope without undoing the overrides, handing the restore actions to the caller.
    ///
    /// This is useful when the overrides need to outlive the borrow of the context.  The caller
    /// becomes responsible for calling `RestoreStack::restore` at a later stage.
    pub fn detach(mut self) -> RestoreStack<C> {
        mem::take(&mut self.saved)
    }
}

impl<C: PersistenceContext> Deref for ScopedCustomization<'_, C> {
    type Target = C;

    fn deref(&self) -> &Self::Target {
        &*self.target
    }
}

impl<C: PersistenceContext> DerefMut for ScopedCustomization<'_, C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.target
    }
}

impl<C: PersistenceContext> Drop for ScopedCustomization<'_, C> {
    fn drop(&mut self) {
        let saved = mem::take(&mut self.saved);
        // Failures have already been logged.
        let _can_fail = saved.restore(&mut *self.target);
    }
}
