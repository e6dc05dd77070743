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

//! Sample key/value service built on top of Tenon's units of work.
//!
//! Every key holds a value and a version number that increases with each update.  Operations
//! that touch several keys, such as renames and batch updates, are composed out of the
//! single-key operations and run as one atomic unit of work.

// Keep these in sync with other top-level files.
#![warn(anonymous_parameters, bad_style, clippy::missing_docs_in_private_items, missing_docs)]
#![warn(unused, unused_extern_crates, unused_import_braces, unused_qualifications)]
#![warn(unsafe_code)]

use db::KVStore;
use driver::Driver;
use model::Key;
use tenon_core::db::Db;
use tenon_core::driver::{DriverError, DriverResult};

pub mod db;
pub mod driver;
pub mod model;

/// Usage message for `execute`.
const USAGE: &str = "Usage: migrate | keys | get KEY | set KEY VALUE | set-many KEY=VALUE... | \
delete KEY | rename FROM TO";

/// Runs the command described by `args` against `driver` and returns its textual output.
pub async fn execute<D>(driver: Driver<D>, args: &[String]) -> DriverResult<String>
where
    D: Db + Clone + 'static,
    D::Context: KVStore,
{
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    match args.as_slice() {
        ["migrate"] => {
            driver.migrate().await?;
            Ok(String::new())
        }

        ["keys"] => {
            let keys = driver.get_keys().await?;
            Ok(keys.iter().map(Key::to_string).collect::<Vec<String>>().join("\n"))
        }

        ["get", key] => {
            let entry = driver.get_key(Key::new((*key).to_owned())).await?;
            Ok(format!("{} (version {})", entry.value(), entry.version()))
        }

        ["set", key, value] => {
            let entry = driver.set_key(Key::new((*key).to_owned()), (*value).to_owned()).await?;
            Ok(format!("version {}", entry.version()))
        }

        ["set-many", pairs @ ..] if !pairs.is_empty() => {
            let mut entries = Vec::with_capacity(pairs.len());
            for pair in pairs {
                match pair.split_once('=') {
                    Some((key, value)) => entries.push((Key::new(key.to_owned()), value.to_owned())),
                    None => {
                        return Err(DriverError::InvalidInput(format!(
                            "Expected KEY=VALUE but got '{}'",
                            pair
                        )));
                    }
                }
            }
            let entries = driver.set_keys(entries).await?;
            Ok(entries
                .iter()
                .map(|entry| format!("version {}", entry.version()))
                .collect::<Vec<String>>()
                .join("\n"))
        }

        ["delete", key] => {
            driver.delete_key(Key::new((*key).to_owned())).await?;
            Ok(String::new())
        }

        ["rename", from, to] => {
            let entry = driver
                .rename_key(Key::new((*from).to_owned()), Key::new((*to).to_owned()))
                .await?;
            Ok(format!("version {}", entry.version()))
        }

        _ => Err(DriverError::InvalidInput(USAGE.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::testutils::*;

    /// Runs `execute` with the given raw arguments.
    async fn run(context: &TestContext, args: &[&str]) -> DriverResult<String> {
        let args: Vec<String> = args.iter().map(|a| (*a).to_owned()).collect();
        execute(context.driver(), &args).await
    }

    #[tokio::test]
    async fn test_execute_flow() {
        let context = TestContext::setup().await;

        assert_eq!("", run(&context, &["migrate"]).await.unwrap());
        assert_eq!("version 1", run(&context, &["set", "a", "first"]).await.unwrap());
        assert_eq!("version 2", run(&context, &["set", "a", "second"]).await.unwrap());
        assert_eq!("second (version 2)", run(&context, &["get", "a"]).await.unwrap());
        assert_eq!(
            "version 1\nversion 1",
            run(&context, &["set-many", "b=x", "c=y=z"]).await.unwrap()
        );
        assert_eq!("version 1", run(&context, &["rename", "c", "d"]).await.unwrap());
        assert_eq!("", run(&context, &["delete", "b"]).await.unwrap());
        assert_eq!("a\nd", run(&context, &["keys"]).await.unwrap());
        assert_eq!("y=z (version 1)", run(&context, &["get", "d"]).await.unwrap());
    }

    #[tokio::test]
    async fn test_execute_errors() {
        let context = TestContext::setup().await;

        let invalid: [&[&str]; 4] = [&[], &["get"], &["set-many"], &["unknown", "a"]];
        for args in invalid {
            match run(&context, args).await {
                Err(DriverError::InvalidInput(e)) => assert!(e.starts_with("Usage:")),
                e => panic!("Must have failed with InvalidInput but got: {:?}", e),
            }
        }

        match run(&context, &["set-many", "a=1", "b"]).await {
            Err(DriverError::InvalidInput(e)) => assert!(e.contains("'b'")),
            e => panic!("Must have failed with InvalidInput but got: {:?}", e),
        }
        assert_eq!("", run(&context, &["keys"]).await.unwrap());

        assert_eq!(
            DriverError::NotFound("Entity not found".to_owned()),
            run(&context, &["get", "missing"]).await.unwrap_err()
        );
    }
}
