//! Core type definitions for idbscope.

use crate::error::{CoreError, CoreResult};
use idbscope_engine::ConnectionId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Name of an object store.
pub type CollectionName = String;

/// Which database to open, and at which schema version.
///
/// An identity is immutable; opening with a different name or version
/// starts a new open cycle with a new value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatabaseIdentity {
    name: String,
    version: u64,
}

impl DatabaseIdentity {
    /// Creates an identity.
    ///
    /// # Errors
    ///
    /// Returns `InvalidIdentity` if `version` is zero.
    pub fn new(name: impl Into<String>, version: u64) -> CoreResult<Self> {
        if version == 0 {
            return Err(CoreError::invalid_identity(
                "version must be a positive integer",
            ));
        }
        Ok(Self {
            name: name.into(),
            version,
        })
    }

    /// Returns the database name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the schema version.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }
}

impl fmt::Display for DatabaseIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} v{}", self.name, self.version)
    }
}

/// The connection currently held by the controller.
///
/// Only the [`crate::ConnectionController`] creates, replaces or closes a
/// handle; other components borrow it for the duration of one call.
#[derive(Debug, PartialEq, Eq)]
pub struct ConnectionHandle {
    id: ConnectionId,
    identity: DatabaseIdentity,
}

impl ConnectionHandle {
    pub(crate) fn new(id: ConnectionId, identity: DatabaseIdentity) -> Self {
        Self { id, identity }
    }

    /// Returns the engine connection id.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Returns the database and version the connection was opened at.
    #[must_use]
    pub fn identity(&self) -> &DatabaseIdentity {
        &self.identity
    }

    /// Describes the connection the way event targets are shown.
    #[must_use]
    pub fn describe(&self) -> String {
        format!("IDBDatabase {}", self.identity)
    }
}

/// A stored value with its primary key split out.
///
/// Serializes as a flat object: `{"id": "a1", "qty": 2}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Primary key.
    pub id: String,
    /// Every other field of the stored value.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Record {
    /// Creates a record with no fields besides its key.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }

    /// Adds a field.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Builds a record from a stored object, reading the key at `key_path`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRecord` if the value is not an object or has no
    /// string at `key_path`.
    pub fn from_value(value: Value, key_path: &str) -> CoreResult<Self> {
        let Value::Object(mut fields) = value else {
            return Err(CoreError::invalid_record("value is not an object"));
        };
        match fields.remove(key_path) {
            Some(Value::String(id)) => Ok(Self { id, fields }),
            Some(other) => Err(CoreError::invalid_record(format!(
                "key '{key_path}' must be a string, found {other}"
            ))),
            None => Err(CoreError::invalid_record(format!(
                "missing key field '{key_path}'"
            ))),
        }
    }

    /// Parses a record from JSON text.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRecord` if the text is not a JSON object with a
    /// string at `key_path`.
    pub fn from_json(text: &str, key_path: &str) -> CoreResult<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| CoreError::invalid_record(format!("invalid JSON: {e}")))?;
        Self::from_value(value, key_path)
    }

    /// Returns the stored form, with the key placed at `key_path`.
    #[must_use]
    pub fn to_value(&self, key_path: &str) -> Value {
        let mut fields = self.fields.clone();
        fields.insert(key_path.to_string(), Value::String(self.id.clone()));
        Value::Object(fields)
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.id, Value::Object(self.fields.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identity_rejects_zero_version() {
        assert!(matches!(
            DatabaseIdentity::new("orders", 0),
            Err(CoreError::InvalidIdentity { .. })
        ));
        let identity = DatabaseIdentity::new("orders", 2).unwrap();
        assert_eq!(identity.to_string(), "orders v2");
    }

    #[test]
    fn record_from_value_splits_key() {
        let record = Record::from_value(json!({"id": "a1", "qty": 2}), "id").unwrap();
        assert_eq!(record, Record::new("a1").with_field("qty", 2));
        assert_eq!(record.to_value("id"), json!({"id": "a1", "qty": 2}));
    }

    #[test]
    fn record_with_custom_key_path() {
        let record = Record::from_json(r#"{"sku": "x-9", "name": "bolt"}"#, "sku").unwrap();
        assert_eq!(record.id, "x-9");
        assert_eq!(record.to_value("sku"), json!({"sku": "x-9", "name": "bolt"}));
    }

    #[test]
    fn record_rejects_bad_values() {
        assert!(Record::from_value(json!([1, 2]), "id").is_err());
        assert!(Record::from_value(json!({"id": 7}), "id").is_err());
        assert!(Record::from_value(json!({"qty": 1}), "id").is_err());
        assert!(Record::from_json("{not json", "id").is_err());
    }

    #[test]
    fn record_serializes_flat() {
        let record = Record::new("a1").with_field("qty", 2);
        assert_eq!(
            serde_json::to_value(&record).unwrap(),
            json!({"id": "a1", "qty": 2})
        );
    }
}
