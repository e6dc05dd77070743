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

//! Implementation of the database abstraction using PostgreSQL.

use crate::db::KVStore;
use crate::model::*;
use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::Row;
use std::collections::BTreeSet;
use tenon_core::db::postgres::{PostgresContext, map_sqlx_error, run_schema};
use tenon_core::db::{DbError, DbResult};

/// Schema to use to initialize the database.
const SCHEMA: &str = include_str!("postgres.sql");

#[async_trait]
impl KVStore for PostgresContext {
    async fn migrate(&mut self) -> DbResult<()> {
        run_schema(self.ex()?, SCHEMA).await
    }

    async fn delete_key(&mut self, key: &Key) -> DbResult<()> {
        let query_str = "DELETE FROM store WHERE key = $1";
        let done = sqlx::query(query_str)
            .bind(key.as_ref())
            .execute(self.ex()?)
            .await
            .map_err(map_sqlx_error)?;
        if done.rows_affected() == 0 {
            return Err(DbError::NotFound);
        } else if done.rows_affected() != 1 {
            return Err(DbError::BackendError("Deletion affected more than one row".to_owned()));
        }
        Ok(())
    }

    async fn get_key(&mut self, key: &Key) -> DbResult<Entry> {
        let query_str =
            format!("SELECT value, version FROM store WHERE key = $1{}", self.locking_clause());
        let row = sqlx::query(&query_str)
            .bind(key.as_ref())
            .fetch_one(self.ex()?)
            .await
            .map_err(map_sqlx_error)?;
        let value: String = row.try_get("value").map_err(map_sqlx_error)?;
        let version: i32 = row.try_get("version").map_err(map_sqlx_error)?;

        Ok(Entry::new(value, Version::from_i32(version)?))
    }

    async fn get_key_version(&mut self, key: &Key) -> DbResult<Option<Version>> {
        let query_str =
            format!("SELECT version FROM store WHERE key = $1{}", self.locking_clause());
        let maybe_row = sqlx::query(&query_str)
            .bind(key.as_ref())
            .fetch_optional(self.ex()?)
            .await
            .map_err(map_sqlx_error)?;
        match maybe_row {
            None => Ok(None),
            Some(row) => {
                let version: i32 = row.try_get("version").map_err(map_sqlx_error)?;
                Ok(Some(Version::from_i32(version)?))
            }
        }
    }

    async fn get_keys(&mut self) -> DbResult<BTreeSet<Key>> {
        let query_str = "SELECT key FROM store ORDER BY key";
        let mut rows = sqlx::query(query_str).fetch(self.ex()?);

        let mut keys = BTreeSet::default();
        while let Some(row) = rows.try_next().await.map_err(map_sqlx_error)? {
            let key: String = row.try_get("key").map_err(map_sqlx_error)?;
            keys.insert(Key::new(key));
        }
        Ok(keys)
    }

    async fn set_key(&mut self, key: &Key, entry: &Entry) -> DbResult<()> {
        let query_str = "
            INSERT INTO store (key, value, version)
            VALUES ($1, $2, $3)
            ON CONFLICT(key) DO UPDATE SET value = $2, version = $3
        ";
        let done = sqlx::query(query_str)
            .bind(key.as_ref())
            .bind(entry.value())
            .bind(entry.version().as_i32())
            .execute(self.ex()?)
            .await
            .map_err(map_sqlx_error)?;
        if done.rows_affected() != 1 {
            return Err(DbError::BackendError("Upsert affected more than one row".to_owned()));
        }
        Ok(())
    }
}
