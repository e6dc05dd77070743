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

//! Options that control how a unit of work maps onto a database transaction.

use crate::env::get_optional_var;
use std::fmt;
use std::str::FromStr;

/// Normalizes a user-provided enum spelling so that `read-committed`, `READ_COMMITTED` and
/// `Read Committed` all compare equal.
fn normalize(s: &str) -> String {
    s.trim()
        .chars()
        .map(|ch| if ch == '-' || ch == ' ' { '_' } else { ch.to_ascii_uppercase() })
        .collect()
}

/// Policy that decides what happens when a unit of work starts while a transaction is active.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Propagation {
    /// Joins the active transaction if there is one, or starts a new one otherwise.
    #[default]
    Required,

    /// Always starts a new transaction.
    ///
    /// Suspending an active transaction to start an independent one is not supported, so
    /// requesting this while a transaction is active is an error.
    RequiresNew,
}

impl fmt::Display for Propagation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Propagation::Required => f.write_str("REQUIRED"),
            Propagation::RequiresNew => f.write_str("REQUIRES_NEW"),
        }
    }
}

impl FromStr for Propagation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize(s).as_str() {
            "REQUIRED" => Ok(Propagation::Required),
            "REQUIRES_NEW" => Ok(Propagation::RequiresNew),
            _ => Err(format!("Unknown propagation '{}'", s)),
        }
    }
}

/// Concurrency-control strength requested for a transaction.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum IsolationLevel {
    /// Dirty reads are allowed.
    ReadUncommitted,

    /// Every statement sees data committed before the statement began.
    #[default]
    ReadCommitted,

    /// Every statement sees data committed before the transaction began.
    RepeatableRead,

    /// Transactions behave as if they had run one after the other.
    Serializable,
}

impl IsolationLevel {
    /// Returns the SQL spelling of the isolation level, suitable for `BEGIN` statements.
    pub fn as_sql(self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

impl FromStr for IsolationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize(s).as_str() {
            "READ_UNCOMMITTED" => Ok(IsolationLevel::ReadUncommitted),
            "READ_COMMITTED" => Ok(IsolationLevel::ReadCommitted),
            "REPEATABLE_READ" => Ok(IsolationLevel::RepeatableRead),
            "SERIALIZABLE" => Ok(IsolationLevel::Serializable),
            _ => Err(format!("Unknown isolation level '{}'", s)),
        }
    }
}

/// Immutable set of options for a unit of work.
///
/// Fields set to `None` mean "use whatever the persistence context currently has" when starting
/// a transaction, and "don't care" when joining one.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TxOptions {
    /// How to behave if a transaction is already active.
    propagation: Propagation,

    /// Isolation level to request, if any.
    isolation: Option<IsolationLevel>,

    /// Whether reads should lock the rows they return, if specified.
    serialize_read: Option<bool>,
}

impl TxOptions {
    /// Returns the default options: join or create a transaction and inherit the context's
    /// isolation level and serialize-read flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Initializes a set of options from environment variables whose name is prefixed with the
    /// given `prefix`.
    ///
    /// This will use the optional variables `<prefix>_PROPAGATION`, `<prefix>_ISOLATION` and
    /// `<prefix>_SERIALIZE_READ`.
    pub fn from_env(prefix: &str) -> Result<Self, String> {
        Ok(Self {
            propagation: get_optional_var::<Propagation>(prefix, "PROPAGATION")?
                .unwrap_or_default(),
            isolation: get_optional_var::<IsolationLevel>(prefix, "ISOLATION")?,
            serialize_read: get_optional_var::<bool>(prefix, "SERIALIZE_READ")?,
        })
    }

    /// Returns a copy of these options with the propagation policy replaced by `propagation`.
    pub fn with_propagation(self, propagation: Propagation) -> Self {
        Self { propagation, ..self }
    }

    /// Returns a copy of these options requesting the `isolation` level.
    pub fn with_isolation(self, isolation: IsolationLevel) -> Self {
        Self { isolation: Some(isolation), ..self }
    }

    /// Returns a copy of these options requesting `serialize_read`.
    pub fn with_serialize_read(self, serialize_read: bool) -> Self {
        Self { serialize_read: Some(serialize_read), ..self }
    }

    /// Returns the propagation policy.
    pub fn propagation(&self) -> Propagation {
        self.propagation
    }

    /// Returns the requested isolation level, if any.
    pub fn isolation(&self) -> Option<IsolationLevel> {
        self.isolation
    }

    /// Returns the requested serialize-read flag, if any.
    pub fn serialize_read(&self) -> Option<bool> {
        self.serialize_read
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opts = TxOptions::new();
        assert_eq!(Propagation::Required, opts.propagation());
        assert_eq!(None, opts.isolation());
        assert_eq!(None, opts.serialize_read());
        assert_eq!(TxOptions::default(), opts);
    }

    #[test]
    fn test_with_methods_do_not_modify_receiver() {
        let base = TxOptions::new();

        let opts = base
            .with_propagation(Propagation::RequiresNew)
            .with_isolation(IsolationLevel::Serializable)
            .with_serialize_read(true);

        assert_eq!(TxOptions::new(), base);
        assert_eq!(Propagation::RequiresNew, opts.propagation());
        assert_eq!(Some(IsolationLevel::Serializable), opts.isolation());
        assert_eq!(Some(true), opts.serialize_read());
    }

    #[test]
    fn test_with_methods_replace_previous_values() {
        let opts = TxOptions::new()
            .with_isolation(IsolationLevel::Serializable)
            .with_isolation(IsolationLevel::RepeatableRead)
            .with_serialize_read(true)
            .with_serialize_read(false);
        assert_eq!(Some(IsolationLevel::RepeatableRead), opts.isolation());
        assert_eq!(Some(false), opts.serialize_read());
    }

    #[test]
    fn test_isolation_level_display_and_parse() {
        for level in [
            IsolationLevel::ReadUncommitted,
            IsolationLevel::ReadCommitted,
            IsolationLevel::RepeatableRead,
            IsolationLevel::Serializable,
        ] {
            assert_eq!(level, level.to_string().parse::<IsolationLevel>().unwrap());
        }
        assert_eq!(IsolationLevel::ReadCommitted, "read-committed".parse().unwrap());
        assert_eq!(IsolationLevel::Serializable, " serializable ".parse().unwrap());
        assert_eq!(
            "Unknown isolation level 'snapshot'",
            "snapshot".parse::<IsolationLevel>().unwrap_err()
        );
    }

    #[test]
    fn test_propagation_display_and_parse() {
        assert_eq!("REQUIRES_NEW", Propagation::RequiresNew.to_string());
        assert_eq!(Propagation::RequiresNew, "requires new".parse().unwrap());
        assert_eq!(Propagation::Required, "Required".parse().unwrap());
        assert_eq!("Unknown propagation 'never'", "never".parse::<Propagation>().unwrap_err());
    }

    #[test]
    fn test_from_env_nothing_set() {
        temp_env::with_vars_unset(
            ["TXOPTS_PROPAGATION", "TXOPTS_ISOLATION", "TXOPTS_SERIALIZE_READ"],
            || {
                assert_eq!(TxOptions::new(), TxOptions::from_env("TXOPTS").unwrap());
            },
        );
    }

    #[test]
    fn test_from_env_everything_set() {
        temp_env::with_vars(
            [
                ("TXOPTS_PROPAGATION", Some("requires_new")),
                ("TXOPTS_ISOLATION", Some("REPEATABLE READ")),
                ("TXOPTS_SERIALIZE_READ", Some("true")),
            ],
            || {
                assert_eq!(
                    TxOptions::new()
                        .with_propagation(Propagation::RequiresNew)
                        .with_isolation(IsolationLevel::RepeatableRead)
                        .with_serialize_read(true),
                    TxOptions::from_env("TXOPTS").unwrap()
                );
            },
        );
    }

    #[test]
    fn test_from_env_bad_isolation() {
        temp_env::with_vars(
            [
                ("TXOPTS_PROPAGATION", None),
                ("TXOPTS_ISOLATION", Some("chaos")),
                ("TXOPTS_SERIALIZE_READ", None),
            ],
            || {
                let err = TxOptions::from_env("TXOPTS").unwrap_err();
                assert!(err.contains("TXOPTS_ISOLATION"));
                assert!(err.contains("Unknown isolation level 'chaos'"));
            },
        );
    }
}
