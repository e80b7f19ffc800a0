//! Correlation identifiers
//!
//! Ids are document store object ids rendered as 24 lowercase hex digits.

use std::fmt;
use std::str::FromStr;

use bson::oid;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CoreError;

/// Globally unique 24-hex-digit identifier
///
/// Serializes as its plain hex string, not the extended-JSON `$oid` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(oid::ObjectId);

impl ObjectId {
    /// Generate a fresh id
    #[must_use]
    pub fn new() -> Self {
        Self(oid::ObjectId::new())
    }

    /// Parse a 24-hex-digit string
    ///
    /// # Errors
    /// Returns `CoreError::Validation` if the string is not 24 hex digits.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        oid::ObjectId::parse_str(s)
            .map(Self)
            .map_err(|_| CoreError::Validation(format!("invalid object id: {s}")))
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<oid::ObjectId> for ObjectId {
    fn from(id: oid::ObjectId) -> Self {
        Self(id)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.to_hex())
    }
}

impl FromStr for ObjectId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_hex())
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_ids_are_unique_and_24_hex() {
        let ids: HashSet<String> = (0..1000).map(|_| ObjectId::new().to_string()).collect();
        assert_eq!(ids.len(), 1000);
        assert!(ids.iter().all(|id| id.len() == 24));
        assert!(
            ids.iter()
                .all(|id| id.chars().all(|c| c.is_ascii_hexdigit()))
        );
    }

    #[test]
    fn test_parse_roundtrip_and_rejects_garbage() {
        let id = ObjectId::new();
        assert_eq!(ObjectId::parse(&id.to_string()).unwrap(), id);
        assert!(ObjectId::parse("0").is_err());
        assert!(matches!(
            ObjectId::parse("zzzzzzzzzzzzzzzzzzzzzzzz"),
            Err(CoreError::Validation(_))
        ));
    }

    #[test]
    fn test_serializes_as_plain_hex() {
        let id = ObjectId::new();
        let value = serde_json::to_value(id).unwrap();
        assert_eq!(value, serde_json::Value::String(id.to_string()));
        let back: ObjectId = serde_json::from_value(value).unwrap();
        assert_eq!(back, id);
    }
}
