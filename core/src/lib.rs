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

//! Unit-of-work and transaction coordination core for thin services.
//!
//! Services built on this crate adhere to the following layered architecture, and they should
//! structure their code to have these modules as well:
//!
//! 1.  `model`: This is the base layer, providing high-level data types that represent concepts in
//!     the domain of the application.  There should be no logic in here.
//!
//! 1.  `db`: This is the persistence layer.  Services implement their domain-specific queries on
//!     top of a `PersistenceContext` such as `db::sqlite::SqliteContext`.
//!
//! 1.  `driver`: This is the business logic layer.  Services provide their own `Driver` type that
//!     runs every operation inside a `uow::UnitOfWork`, nesting units of work when operations
//!     are composed out of other operations.
//!
//! There are result and error types in every layer, such as `DbResult` and `DbError`.  Errors can
//! transparently float to the top of the app using the `?` operator.
//!
//! The `tx` module contains the machinery that lets nested units of work share a single
//! transaction: the per-call `tx::TxOptions`, the `tx::ScopedCustomization` guard that overrides
//! context settings with guaranteed restoration, and the `tx::TxCoordinator` state machine.
//!
//! This crate does not have any heavy dependencies except those that are required for all
//! services.  Database backends are enabled via the `postgres` and `sqlite` features.

// Keep these in sync with other top-level files.
#![warn(anonymous_parameters, bad_style, clippy::missing_docs_in_private_items, missing_docs)]
#![warn(unused, unused_extern_crates, unused_import_braces, unused_qualifications)]
#![warn(unsafe_code)]

pub mod db;
pub mod driver;
pub mod env;
pub mod tx;
pub mod uow;
