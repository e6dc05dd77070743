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

//! Persistence context backed by an in-memory map for testing purposes.

use crate::db::{ContextSettings, DbError, DbResult, PersistenceContext};
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Operation on the context that can be made to fail on demand.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Fault {
    /// Makes the next `begin` call fail.
    Begin,

    /// Makes the next `commit` call fail.  The transaction is discarded.
    Commit,

    /// Makes the next `rollback` call fail.  The transaction is discarded anyway.
    Rollback,
}

/// Persistence context that keeps string key/value pairs in memory.
///
/// Writes issued while a transaction is open are staged and only become visible to reads outside
/// of the transaction once it commits.  Every call to the transactional operations is recorded in
/// a journal so that tests can validate the exact protocol followed by callers.
#[derive(Debug, Default)]
pub struct MemoryContext {
    /// Current settings of the context.
    settings: ContextSettings,

    /// Committed data.
    data: BTreeMap<String, String>,

    /// Staged writes of the active transaction, or `None` if there is no transaction.  A `None`
    /// value in the map represents a deletion.
    staged: Option<BTreeMap<String, Option<String>>>,

    /// Settings in effect when the active transaction began.
    tx_settings: Option<ContextSettings>,

    /// Faults to inject in upcoming operations.
    faults: Vec<Fault>,

    /// Log of the transactional operations issued against this context.
    journal: Vec<String>,
}

impl MemoryContext {
    /// Creates a new empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arranges for the next call to the operation described by `fault` to fail.
    pub fn inject(&mut self, fault: Fault) {
        self.faults.push(fault);
    }

    /// Returns the log of transactional operations issued so far.
    pub fn journal(&self) -> &[String] {
        &self.journal
    }

    /// Returns the settings in effect when the active transaction began, if any.
    pub fn tx_settings(&self) -> Option<&ContextSettings> {
        self.tx_settings.as_ref()
    }

    /// Consumes the injected `fault` if there is one pending.
    fn take_fault(&mut self, fault: Fault) -> bool {
        match self.faults.iter().position(|f| *f == fault) {
            Some(i) => {
                self.faults.remove(i);
                true
            }
            None => false,
        }
    }

    /// Ends the active transaction, returning its staged writes.
    fn end(&mut self, what: &str) -> DbResult<BTreeMap<String, Option<String>>> {
        let staged = self
            .staged
            .take()
            .ok_or_else(|| DbError::BackendError("No active transaction".to_owned()))?;
        self.journal.push(what.to_owned());
        self.tx_settings = None;
        Ok(staged)
    }

    /// Gets the value of `key` as seen by the active transaction, if any.
    pub fn get(&self, key: &str) -> Option<String> {
        if let Some(staged) = &self.staged {
            if let Some(value) = staged.get(key) {
                return value.clone();
            }
        }
        self.data.get(key).cloned()
    }

    /// Sets `key` to `value`.  Outside of a transaction, the write is immediately visible.
    pub fn put<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        match &mut self.staged {
            Some(staged) => {
                staged.insert(key.into(), Some(value.into()));
            }
            None => {
                self.data.insert(key.into(), value.into());
            }
        }
    }

    /// Deletes `key`.  Outside of a transaction, the deletion is immediately visible.
    pub fn delete(&mut self, key: &str) {
        match &mut self.staged {
            Some(staged) => {
                staged.insert(key.to_owned(), None);
            }
            None => {
                self.data.remove(key);
            }
        }
    }

    /// Returns the committed data, ignoring any staged writes.
    pub fn committed(&self) -> &BTreeMap<String, String> {
        &self.data
    }
}

#[async_trait]
impl PersistenceContext for MemoryContext {
    async fn begin(&mut self) -> DbResult<()> {
        if self.staged.is_some() {
            return Err(DbError::BackendError("Transaction already active".to_owned()));
        }
        if self.take_fault(Fault::Begin) {
            self.journal.push("begin failed".to_owned());
            return Err(DbError::Unavailable);
        }
        self.journal.push(format!(
            "begin isolation={} serialize_read={}",
            self.settings.isolation, self.settings.serialize_read
        ));
        self.staged = Some(BTreeMap::default());
        self.tx_settings = Some(self.settings.clone());
        Ok(())
    }

    async fn commit(&mut self) -> DbResult<()> {
        let fail = self.staged.is_some() && self.take_fault(Fault::Commit);
        let staged = self.end(if fail { "commit failed" } else { "commit" })?;
        if fail {
            return Err(DbError::BackendError("Injected commit failure".to_owned()));
        }
        for (key, value) in staged {
            match value {
                Some(value) => self.data.insert(key, value),
                None => self.data.remove(&key),
            };
        }
        Ok(())
    }

    async fn rollback(&mut self) -> DbResult<()> {
        let fail = self.staged.is_some() && self.take_fault(Fault::Rollback);
        self.end(if fail { "rollback failed" } else { "rollback" })?;
        if fail {
            return Err(DbError::BackendError("Injected rollback failure".to_owned()));
        }
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.staged.is_some()
    }

    fn discard(&mut self) {
        if self.staged.take().is_some() {
            self.journal.push("discard".to_owned());
            self.tx_settings = None;
        }
    }

    async fn close(&mut self) {
        if self.staged.is_some() {
            self.journal.push("close with active transaction".to_owned());
        }
        self.staged = None;
        self.tx_settings = None;
    }

    fn settings(&self) -> &ContextSettings {
        &self.settings
    }

    fn settings_mut(&mut self) -> &mut ContextSettings {
        &mut self.settings
    }
}
