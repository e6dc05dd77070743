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

//! Business logic for the key/value store.
//!
//! Every operation comes in two flavors: a free function that takes a `UnitOfWork` and runs
//! within its transaction, and a `Driver` method that wraps the free function in a new unit of
//! work.  Operations built out of other operations call the free functions so that the whole
//! composition commits or rolls back as one.

use crate::db::KVStore;
use log::warn;
use tenon_core::db::{Db, PersistenceContext};
use tenon_core::driver::DriverResult;
use tenon_core::tx::TxOptions;
use tenon_core::uow::UnitOfWork;

mod key;
mod keys;
#[cfg(test)]
pub(crate) mod testutils;

pub use key::{delete_key, get_key, rename_key, set_key};
pub use keys::{get_keys, set_keys};

/// Returns the options for units of work that only read keys.
///
/// Only the default isolation level carries over.  The default propagation and serialize-read
/// flag are dropped so that reads can join the transactions opened by writes.
fn read_options<C: PersistenceContext>(uow: &UnitOfWork<C>) -> TxOptions {
    match uow.default_options().isolation() {
        Some(isolation) => TxOptions::new().with_isolation(isolation),
        None => TxOptions::new(),
    }
}

/// Returns the options for units of work that modify keys.
///
/// Writes read the current version of a key before bumping it, so they lock what they read to
/// avoid lost updates.
fn write_options<C: PersistenceContext>(uow: &UnitOfWork<C>) -> TxOptions {
    read_options(uow).with_serialize_read(true)
}

/// Business logic.
///
/// The public operations consume `self` because each of them runs in its own unit of work.
/// Callers that need to combine operations atomically should use the free functions in this
/// module with a shared `UnitOfWork` instead.
#[derive(Clone)]
pub struct Driver<D>
where
    D: Db + Clone + 'static,
    D::Context: KVStore,
{
    /// The database that the driver uses for persistence.
    db: D,

    /// Default options for the units of work created by the driver.
    defaults: TxOptions,
}

impl<D> Driver<D>
where
    D: Db + Clone + 'static,
    D::Context: KVStore,
{
    /// Creates a new driver backed by the given injected components.
    pub fn new(db: D, defaults: TxOptions) -> Self {
        Self { db, defaults }
    }

    /// Creates a new unit of work on a fresh persistence context.
    pub async fn uow(&self) -> DriverResult<UnitOfWork<D::Context>> {
        let context = self.db.context().await?;
        Ok(UnitOfWork::new(context).with_default_options(self.defaults))
    }

    /// Initializes the database schema.
    pub async fn migrate(self) -> DriverResult<()> {
        let mut uow = self.uow().await?;
        let result = uow
            .run_in_transaction(|uow| Box::pin(async move { uow.context_mut().migrate().await }))
            .await
            .map_err(Into::into);
        finish(uow, result).await
    }
}

/// Releases `uow` and returns `result`.
///
/// Errors in `result` take precedence over errors releasing the unit of work.
async fn finish<C: PersistenceContext, T>(
    uow: UnitOfWork<C>,
    result: DriverResult<T>,
) -> DriverResult<T> {
    match (result, uow.close().await) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e.into()),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(e2)) => {
            warn!("Failed to release unit of work after error: {}", e2);
            Err(e)
        }
    }
}
