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

//! Operations on individual keys.

use crate::db::KVStore;
use crate::driver::{Driver, finish, read_options, write_options};
use crate::model::*;
use log::info;
use tenon_core::db::Db;
use tenon_core::driver::{DriverError, DriverResult};
use tenon_core::uow::UnitOfWork;

/// Deletes an existing `key`.
pub async fn delete_key<C: KVStore>(uow: &mut UnitOfWork<C>, key: Key) -> DriverResult<()> {
    let opts = write_options(uow);
    uow.run_in_transaction_with(opts, move |uow| {
        Box::pin(async move {
            uow.context_mut().delete_key(&key).await?;
            Ok::<_, DriverError>(())
        })
    })
    .await
}

/// Gets the current value of the given `key`.
pub async fn get_key<C: KVStore>(uow: &mut UnitOfWork<C>, key: Key) -> DriverResult<Entry> {
    let opts = read_options(uow);
    uow.call_in_transaction_with(opts, move |uow| {
        Box::pin(async move {
            let entry = uow.context_mut().get_key(&key).await?;
            Ok::<_, DriverError>(entry)
        })
    })
    .await
}

/// Sets `key` to `value`, incrementing its version.
pub async fn set_key<C: KVStore>(
    uow: &mut UnitOfWork<C>,
    key: Key,
    value: String,
) -> DriverResult<Entry> {
    if value.is_empty() {
        return Err(DriverError::InvalidInput(format!("Value for key {} cannot be empty", key)));
    }

    let opts = write_options(uow);
    uow.call_in_transaction_with(opts, move |uow| {
        Box::pin(async move {
            let version = match uow.context_mut().get_key_version(&key).await? {
                Some(version) => version.next()?,
                None => Version::initial(),
            };
            let entry = Entry::new(value, version);
            uow.context_mut().set_key(&key, &entry).await?;
            Ok::<_, DriverError>(entry)
        })
    })
    .await
}

/// Moves the value of `from` to the new key `to`.
///
/// The new key starts at the initial version.  Fails if `from` does not exist or if `to`
/// already exists, in which case nothing changes.
pub async fn rename_key<C: KVStore>(
    uow: &mut UnitOfWork<C>,
    from: Key,
    to: Key,
) -> DriverResult<Entry> {
    let opts = write_options(uow);
    uow.call_in_transaction_with(opts, move |uow| {
        Box::pin(async move {
            let old = get_key(uow, from.clone()).await?;
            if uow.context_mut().get_key_version(&to).await?.is_some() {
                return Err(DriverError::AlreadyExists(format!("Key {} already exists", to)));
            }
            delete_key(uow, from.clone()).await?;
            let (value, _version) = old.dissolve();
            let entry = set_key(uow, to.clone(), value).await?;
            info!("Renamed key {} to {}", from, to);
            Ok(entry)
        })
    })
    .await
}

impl<D> Driver<D>
where
    D: Db + Clone + 'static,
    D::Context: KVStore,
{
    /// Deletes an existing `key`.
    pub async fn delete_key(self, key: Key) -> DriverResult<()> {
        let mut uow = self.uow().await?;
        let result = delete_key(&mut uow, key).await;
        finish(uow, result).await
    }

    /// Gets the current value of the given `key`.
    pub async fn get_key(self, key: Key) -> DriverResult<Entry> {
        let mut uow = self.uow().await?;
        let result = get_key(&mut uow, key).await;
        finish(uow, result).await
    }

    /// Sets `key` to `value`, incrementing its version.
    pub async fn set_key(self, key: Key, value: String) -> DriverResult<Entry> {
        let mut uow = self.uow().await?;
        let result = set_key(&mut uow, key, value).await;
        finish(uow, result).await
    }

    /// Moves the value of `from` to the new key `to`.
    pub async fn rename_key(self, from: Key, to: Key) -> DriverResult<Entry> {
        let mut uow = self.uow().await?;
        let result = rename_key(&mut uow, from, to).await;
        finish(uow, result).await
    }
}
