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

//! Building blocks for transaction coordination.
//!
//! Most services should not need to use these types directly other than `TxOptions`: the
//! `crate::uow::UnitOfWork` type ties them together.

pub mod coordinator;
pub mod customization;
mod options;

pub use coordinator::{Outcome, Scope, ScopeGuard, TxCoordinator};
pub use customization::{RestoreStack, ScopedCustomization};
pub use options::{IsolationLevel, Propagation, TxOptions};
