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

//! Data types for the key/value store.

use derive_getters::{Dissolve, Getters};
use derive_more::{AsRef, Constructor};
use std::fmt;
use tenon_core::db::DbError;
use tenon_core::driver::DriverError;

/// Errors caused by invalid data in the model.
#[derive(Debug, PartialEq, thiserror::Error)]
#[error("{0}")]
pub struct ModelError(pub String);

/// Result type for this module.
pub type ModelResult<T> = Result<T, ModelError>;

impl From<ModelError> for DbError {
    fn from(e: ModelError) -> Self {
        DbError::DataIntegrityError(e.0)
    }
}

impl From<ModelError> for DriverError {
    fn from(e: ModelError) -> Self {
        DriverError::InvalidInput(e.0)
    }
}

/// The name of a key in the store.
#[derive(AsRef, Clone, Constructor, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct Key(String);

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The version of a key, which increases with every update.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Version(i32);

impl Version {
    /// Returns the initial version assigned to new keys.
    pub fn initial() -> Version {
        Version(1)
    }

    /// Returns the next version to assign to an existing key.
    pub fn next(self) -> ModelResult<Version> {
        match self.0.checked_add(1) {
            Some(version) => Ok(Version(version)),
            None => Err(ModelError(format!("Version {} cannot be incremented", self.0))),
        }
    }

    /// Creates a version from an `i32` with range validation.
    pub fn from_i32(version: i32) -> ModelResult<Version> {
        if version < 1 {
            return Err(ModelError(format!("Version must be positive but got {}", version)));
        }
        Ok(Version(version))
    }

    /// Returns the version as an `i32`.
    pub fn as_i32(self) -> i32 {
        self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The value of a key along with its version.
#[derive(Constructor, Debug, Dissolve, Getters, PartialEq)]
pub struct Entry {
    /// The key's raw value.
    value: String,

    /// The key's current version number.
    version: Version,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_sequence() {
        let version = Version::initial();
        assert_eq!(1, version.as_i32());
        assert_eq!(Version::from_i32(2).unwrap(), version.next().unwrap());
    }

    #[test]
    fn test_version_limits() {
        Version::from_i32(0).unwrap_err();
        Version::from_i32(-5).unwrap_err();
        let max = Version::from_i32(i32::MAX).unwrap();
        assert!(max.next().unwrap_err().0.contains("cannot be incremented"));
    }
}
