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

//! Entry point to the sample service.
//!
//! The database is configured via the `PGSQL_PROD_*` environment variables and the default
//! transaction options via the optional `KV_TX_*` variables.  The command to run is given in the
//! arguments.

// Keep these in sync with other top-level files.
#![warn(anonymous_parameters, bad_style, clippy::missing_docs_in_private_items, missing_docs)]
#![warn(unused, unused_extern_crates, unused_import_braces, unused_qualifications)]
#![warn(unsafe_code)]

use std::env;
use std::process;
use tenon_core::db::Db;
use tenon_core::db::postgres::{PostgresDb, PostgresOptions};
use tenon_core::tx::TxOptions;
use tenon_example::driver::Driver;
use tenon_example::execute;

/// Sets up the driver from the environment and runs the command given in `args`.
async fn run(args: &[String]) -> Result<String, String> {
    let db_opts = PostgresOptions::from_env("PGSQL_PROD")?;
    let tx_opts = TxOptions::from_env("KV_TX")?;

    let db = PostgresDb::connect(db_opts).map_err(|e| e.to_string())?;
    let result = execute(Driver::new(db.clone(), tx_opts), args).await.map_err(|e| e.to_string());
    db.close().await;
    result
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().skip(1).collect();
    match run(&args).await {
        Ok(output) => {
            if !output.is_empty() {
                println!("{}", output);
            }
        }
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    }
}
