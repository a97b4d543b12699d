//! Instance configuration.
//!
//! [`Options`] mirrors the free-form options object callers hand to an
//! instance: a `database` selector whose meaning depends on the backend and a
//! `before` map of pre-hooks to run once, ahead of the first operation.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Selects the logical namespace inside a backend.
///
/// Redis switches databases by number, CouchDB and redb address them by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Database {
    Number(i64),
    Name(String),
}

impl fmt::Display for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Database::Number(n) => write!(f, "{}", n),
            Database::Name(name) => f.write_str(name),
        }
    }
}

impl From<&str> for Database {
    fn from(name: &str) -> Self {
        Database::Name(name.to_string())
    }
}

impl From<String> for Database {
    fn from(name: String) -> Self {
        Database::Name(name)
    }
}

impl From<i64> for Database {
    fn from(n: i64) -> Self {
        Database::Number(n)
    }
}

/// Configuration for a [`Dynamis`](crate::Dynamis) instance.
///
/// ```
/// use dynamis::Options;
/// use serde_json::json;
///
/// let options: Options = serde_json::from_value(json!({
///     "database": "sessions",
///     "before": { "prepare": [], "set": ["boot", true] }
/// })).unwrap();
///
/// assert_eq!(options.before.len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Backend-specific database selector.
    pub database: Option<Database>,
    /// Pre-hooks keyed by operation name, each with the arguments to pass.
    pub before: BTreeMap<String, Vec<Value>>,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn database(mut self, database: impl Into<Database>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Registers a pre-hook, replacing any earlier one with the same name.
    pub fn before(mut self, operation: &str, args: Vec<Value>) -> Self {
        self.before.insert(operation.to_string(), args);
        self
    }

    pub(crate) fn database_name(&self) -> Option<&str> {
        match &self.database {
            Some(Database::Name(name)) => Some(name),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deserialize_number_and_name() {
        let numeric: Options = serde_json::from_value(json!({ "database": 3 })).unwrap();
        assert_eq!(numeric.database, Some(Database::Number(3)));
        assert_eq!(numeric.database_name(), None);

        let named: Options = serde_json::from_value(json!({ "database": "dynamis" })).unwrap();
        assert_eq!(named.database_name(), Some("dynamis"));
        assert!(named.before.is_empty());
    }

    #[test]
    fn test_builder() {
        let options = Options::new()
            .database("cache")
            .before("flush", vec![])
            .before("set", vec![json!("k"), json!(1)]);

        assert_eq!(options.database, Some(Database::from("cache")));
        assert_eq!(options.before.get("set"), Some(&vec![json!("k"), json!(1)]));
        assert_eq!(options.before.get("flush"), Some(&vec![]));
    }
}
