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

//! Test utilities for the business layer.

use crate::db::KVStore;
use crate::driver::Driver;
use crate::model::Key;
use tenon_core::db::Db;
use tenon_core::db::sqlite::{self, SqliteContext, SqliteDb};
use tenon_core::tx::TxOptions;
use tenon_core::uow::UnitOfWork;

/// State of a running test.
pub(crate) struct TestContext {
    /// The database shared by the driver and the test.
    db: SqliteDb,

    /// The driver under test.
    driver: Driver<SqliteDb>,
}

impl TestContext {
    /// Initializes the driver using an in-memory database.
    pub(crate) async fn setup() -> Self {
        let _can_fail = env_logger::builder().is_test(true).try_init();

        let db = sqlite::connect(":memory:").await.unwrap();
        let driver = Driver::new(db.clone(), TxOptions::default());
        driver.clone().migrate().await.unwrap();
        Self { db, driver }
    }

    /// Returns a persistence context to directly query the database.
    pub(crate) async fn context(&self) -> SqliteContext {
        self.db.context().await.unwrap()
    }

    /// Returns a new unit of work to compose driver operations.
    pub(crate) async fn uow(&self) -> UnitOfWork<SqliteContext> {
        self.driver.uow().await.unwrap()
    }

    /// Returns a copy of the driver under test.
    pub(crate) fn driver(&self) -> Driver<SqliteDb> {
        self.driver.clone()
    }

    /// Returns a driver on the same database that uses `defaults` for its units of work.
    pub(crate) fn driver_with(&self, defaults: TxOptions) -> Driver<SqliteDb> {
        Driver::new(self.db.clone(), defaults)
    }
}

/// Asserts that `context` contains exactly the `exp` keys with the given values.
pub(crate) async fn assert_contents(context: &mut SqliteContext, exp: &[(&str, &str)]) {
    let keys = context.get_keys().await.unwrap();
    assert_eq!(exp.len(), keys.len(), "Unexpected keys: {:?}", keys);
    for (key, value) in exp {
        let entry = context.get_key(&Key::new((*key).to_owned())).await.unwrap();
        assert_eq!(*value, entry.value().as_str());
    }
}
