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

//! Operations on groups of keys.

use crate::db::KVStore;
use crate::driver::{Driver, finish, read_options, set_key, write_options};
use crate::model::*;
use std::collections::BTreeSet;
use tenon_core::db::Db;
use tenon_core::driver::{DriverError, DriverResult};
use tenon_core::uow::UnitOfWork;

/// Gets a list of all existing keys.
pub async fn get_keys<C: KVStore>(uow: &mut UnitOfWork<C>) -> DriverResult<BTreeSet<Key>> {
    let opts = read_options(uow);
    uow.call_in_transaction_with(opts, |uow| {
        Box::pin(async move {
            let keys = uow.context_mut().get_keys().await?;
            Ok::<_, DriverError>(keys)
        })
    })
    .await
}

/// Sets all `entries` at once, returning the new entries in the same order.
///
/// Either all keys are updated or, if any update fails, none is.
pub async fn set_keys<C: KVStore>(
    uow: &mut UnitOfWork<C>,
    entries: Vec<(Key, String)>,
) -> DriverResult<Vec<Entry>> {
    let opts = write_options(uow);
    uow.call_in_transaction_with(opts, move |uow| {
        Box::pin(async move {
            let mut result = Vec::with_capacity(entries.len());
            for (key, value) in entries {
                result.push(set_key(uow, key, value).await?);
            }
            Ok::<_, DriverError>(result)
        })
    })
    .await
}

impl<D> Driver<D>
where
    D: Db + Clone + 'static,
    D::Context: KVStore,
{
    /// Gets a list of all existing keys.
    pub async fn get_keys(self) -> DriverResult<BTreeSet<Key>> {
        let mut uow = self.uow().await?;
        let result = get_keys(&mut uow).await;
        finish(uow, result).await
    }

    /// Sets all `entries` at once, returning the new entries in the same order.
    pub async fn set_keys(self, entries: Vec<(Key, String)>) -> DriverResult<Vec<Entry>> {
        let mut uow = self.uow().await?;
        let result = set_keys(&mut uow, entries).await;
        finish(uow, result).await
    }
}
