//! Field-level change detection between two records
//!
//! Records are compared in their serde form. Objects (structs and maps) are
//! walked field by field; arrays and scalars are compared whole.

use plexus_protocol::NotificationChange;
use plexus_protocol::query::compare_values;
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// What kind of field a change touches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Number, string, bool
    Scalar,
    /// Array, replaced whole
    Container,
    /// Object appearing, disappearing or changing type
    Nested,
}

/// One field-level change
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    /// Path from the record root
    pub path: Vec<String>,
    /// Value before, `None` when the field was absent
    pub old_value: Option<Value>,
    /// Value after, `None` when the field is removed
    pub new_value: Option<Value>,
    /// Field kind
    pub kind: ChangeKind,
}

impl Change {
    /// Dotted property path
    pub fn property_id(&self) -> String {
        self.path.join(".")
    }

    /// Apply the change to a record
    pub fn apply(&self, target: &mut Value) {
        let Some((last, parents)) = self.path.split_last() else {
            if let Some(v) = &self.new_value {
                *target = v.clone();
            }
            return;
        };

        let mut current = target;
        for part in parents {
            if !current.is_object() {
                *current = Value::Object(Map::new());
            }
            current = match current {
                Value::Object(map) => map.entry(part.clone()).or_insert(Value::Null),
                _ => return,
            };
        }

        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        if let Value::Object(map) = current {
            match &self.new_value {
                Some(v) => {
                    map.insert(last.clone(), v.clone());
                }
                None => {
                    map.remove(last);
                }
            }
        }
    }

    /// Notification form, values JSON-encoded
    pub fn to_notification(&self) -> NotificationChange {
        NotificationChange {
            property_id: self.property_id(),
            old_value: self.old_value.as_ref().map(Value::to_string),
            new_value: self.new_value.as_ref().map(Value::to_string),
        }
    }

    /// Rebuild from notification form
    pub fn from_notification(change: &NotificationChange) -> serde_json::Result<Self> {
        let decode = |v: &Option<String>| -> serde_json::Result<Option<Value>> {
            v.as_deref().map(serde_json::from_str).transpose()
        };
        let new_value = decode(&change.new_value)?;
        let kind = match &new_value {
            Some(Value::Array(_)) => ChangeKind::Container,
            Some(Value::Object(_)) => ChangeKind::Nested,
            _ => ChangeKind::Scalar,
        };
        Ok(Self {
            path: change
                .property_id
                .split('.')
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect(),
            old_value: decode(&change.old_value)?,
            new_value,
            kind,
        })
    }
}

/// Structural diff between an old and a new record.
///
/// - `nil_is_valid`: a null in the new record clears the old value;
///   otherwise nulls mean "not set" and are skipped.
/// - `overwrite`: a field missing from a new object removes it from the old
///   one; otherwise missing fields are left alone (maps merge).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Updater {
    nil_is_valid: bool,
    overwrite: bool,
}

impl Updater {
    /// Updater with explicit flags
    pub fn new(nil_is_valid: bool, overwrite: bool) -> Self {
        Self {
            nil_is_valid,
            overwrite,
        }
    }

    /// Replace semantics (`Post`/`Put`): every diverging field is a change
    pub fn replace() -> Self {
        Self::new(true, true)
    }

    /// Patch semantics: only fields set in the new record change
    pub fn patch() -> Self {
        Self::new(false, false)
    }

    /// Changes that turn `old` into `new`, in field order
    pub fn diff(&self, old: &Value, new: &Value) -> Vec<Change> {
        let mut changes = Vec::new();
        self.compare(&mut Vec::new(), Some(old), Some(new), &mut changes);
        changes
    }

    fn compare(
        &self,
        path: &mut Vec<String>,
        old: Option<&Value>,
        new: Option<&Value>,
        out: &mut Vec<Change>,
    ) {
        match (old, new) {
            (_, None) => {
                // field missing from the new object
                if self.overwrite && self.nil_is_valid {
                    if let Some(old) = old {
                        out.push(Change {
                            path: path.clone(),
                            old_value: Some(old.clone()),
                            new_value: None,
                            kind: kind_of(old),
                        });
                    }
                }
            }
            (old, Some(Value::Null)) => {
                if !self.nil_is_valid {
                    return;
                }
                if let Some(old) = old.filter(|o| !o.is_null()) {
                    out.push(Change {
                        path: path.clone(),
                        old_value: Some(old.clone()),
                        new_value: Some(Value::Null),
                        kind: kind_of(old),
                    });
                }
            }
            (Some(Value::Object(old_map)), Some(Value::Object(new_map))) => {
                for (field, old_field) in old_map {
                    path.push(field.clone());
                    self.compare(path, Some(old_field), new_map.get(field), out);
                    path.pop();
                }
                for (field, new_field) in new_map {
                    if old_map.contains_key(field) {
                        continue;
                    }
                    path.push(field.clone());
                    self.compare(path, None, Some(new_field), out);
                    path.pop();
                }
            }
            (old, Some(new)) => {
                let differs = match old {
                    None => true,
                    Some(old) => !same_value(old, new),
                };
                if differs {
                    out.push(Change {
                        path: path.clone(),
                        old_value: old.cloned(),
                        new_value: Some(new.clone()),
                        kind: kind_of(new),
                    });
                }
            }
        }
    }
}

fn kind_of(value: &Value) -> ChangeKind {
    match value {
        Value::Array(_) => ChangeKind::Container,
        Value::Object(_) => ChangeKind::Nested,
        _ => ChangeKind::Scalar,
    }
}

fn same_value(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => compare_values(a, b) == Some(Ordering::Equal),
        _ => a == b,
    }
}

/// Apply a list of changes in order
pub fn apply_all(changes: &[Change], target: &mut Value) {
    for change in changes {
        change.apply(target);
    }
}
