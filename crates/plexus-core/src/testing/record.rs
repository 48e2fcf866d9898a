//! Record type used across the test suites

use crate::record::{PrimaryKey, Record};
use plexus_protocol::Elements;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Small enum field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MyEnum {
    /// First
    One,
    /// Second
    Two,
    /// Third
    Three,
}

/// Nested object field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Nested {
    /// Label
    pub label: String,
    /// Depth
    pub depth: i64,
}

/// Test record keyed by `MyString`.
///
/// Unset fields serialize as `null` so patches can tell "not set" from a
/// value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestRecord {
    /// Primary key
    pub my_string: String,
    /// Integer field
    pub my_int: Option<i64>,
    /// Enum field
    pub my_enum: Option<MyEnum>,
    /// List field
    pub tags: Option<Vec<String>>,
    /// Object field
    pub nested: Option<Nested>,
}

impl Record for TestRecord {
    fn model_type() -> &'static str {
        "TestRecord"
    }

    fn primary_key() -> PrimaryKey {
        PrimaryKey::new(["MyString"])
    }
}

impl TestRecord {
    /// Record with a key and an integer
    pub fn new(my_string: &str, my_int: i64) -> Self {
        Self {
            my_int: Some(my_int),
            ..Self::key(my_string)
        }
    }

    /// Record with only the key set
    pub fn key(my_string: &str) -> Self {
        Self {
            my_string: my_string.to_string(),
            my_int: None,
            my_enum: None,
            tags: None,
            nested: None,
        }
    }

    /// Set the enum field
    pub fn with_enum(mut self, value: MyEnum) -> Self {
        self.my_enum = Some(value);
        self
    }

    /// Single-record payload
    pub fn elements(&self) -> Elements {
        Elements::one(serde_json::to_value(self).unwrap_or_else(|_| json!({})))
    }
}
