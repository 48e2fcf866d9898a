//! Record types hosted by services and their primary-key decorator

use crate::{Error, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Separator between the values of a composite primary key
pub const KEY_SEPARATOR: &str = "::";

/// A record type a service can host.
///
/// Records are inspected through their serde form: field names are the
/// serialized names, so `#[serde(rename_all = "PascalCase")]` gives keys
/// like `MyString`.
pub trait Record: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Model type name carried by notifications
    fn model_type() -> &'static str;

    /// Fields that make up the primary key, in order
    fn primary_key() -> PrimaryKey;
}

/// Ordered list of fields that identify a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryKey {
    fields: Vec<String>,
}

impl PrimaryKey {
    /// Build from field names
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    /// Field names
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Deterministic key of a record in serde form.
    ///
    /// Fails with a validation error when a key field is missing or null.
    pub fn key_of(&self, record: &Value) -> Result<String> {
        if self.fields.is_empty() {
            return Err(Error::validation("primary key has no fields"));
        }
        let obj = record
            .as_object()
            .ok_or_else(|| Error::validation("record is not an object"))?;

        let mut parts = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            let part = match obj.get(field) {
                None | Some(Value::Null) => {
                    return Err(Error::validation(format!(
                        "primary key field {field:?} is missing"
                    )));
                }
                Some(Value::String(s)) => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                Some(Value::Bool(b)) => b.to_string(),
                Some(other) => other.to_string(),
            };
            parts.push(part);
        }
        Ok(parts.join(KEY_SEPARATOR))
    }

    /// Key of a typed record
    pub fn key_of_record<T: Serialize>(&self, record: &T) -> Result<String> {
        self.key_of(&serde_json::to_value(record)?)
    }
}
