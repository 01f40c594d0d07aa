//! Recursive schema descriptors, structural validation, and the canonical
//! string form used as the input to content-addressed topic names.

use serde_json::Value;
use std::fmt::Write as _;

use crate::error::SchemaError;

/// An ordered `name -> Schema` field. Kept as a `Vec` rather than a map so
/// insertion order is preserved for both `validate` diagnostics and the
/// canonical `string()` form.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub schema: Schema,
}

impl Field {
    pub fn new(name: impl Into<String>, schema: Schema) -> Self {
        Self {
            name: name.into(),
            schema,
        }
    }
}

/// A recursive sum type describing the shape of an event's payload.
///
/// `string()` is the canonical textual identity fed into SHA-1 for topic
/// naming (§3): two schemas compare structurally-equal iff their `string()`
/// outputs are byte-identical.
#[derive(Debug, Clone, PartialEq)]
pub enum Schema {
    String,
    Number,
    Boolean,
    Bytes,
    Optional(Box<Schema>),
    Array(Box<Schema>),
    Record(Vec<Field>),
    Union(Vec<Schema>),
}

impl Schema {
    pub fn record(fields: Vec<Field>) -> Self {
        Schema::Record(fields)
    }

    pub fn optional(inner: Schema) -> Self {
        Schema::Optional(Box::new(inner))
    }

    pub fn array(inner: Schema) -> Self {
        Schema::Array(Box::new(inner))
    }

    /// Builds a flat union with `other`; nested unions on either side are
    /// flattened so the string form of `(A | B) | C` equals `A | B | C`.
    pub fn or(self, other: Schema) -> Schema {
        let mut members = Vec::new();
        match self {
            Schema::Union(members_self) => members.extend(members_self),
            other => members.push(other),
        }
        match other {
            Schema::Union(members_other) => members.extend(members_other),
            other => members.push(other),
        }
        Schema::Union(members)
    }

    /// Returns the field list if this is a `Record`, else `None`.
    pub fn as_record_fields(&self) -> Option<&[Field]> {
        match self {
            Schema::Record(fields) => Some(fields),
            _ => None,
        }
    }

    /// Structurally validates `value` against this schema, returning a
    /// (possibly tree-structured) [`SchemaError`] tree on mismatch.
    pub fn validate(&self, value: &Value) -> Result<(), SchemaError> {
        match self {
            Schema::String => {
                if value.is_string() {
                    Ok(())
                } else {
                    Err(SchemaError::leaf(format!("expected string, got {}", kind_of(value))))
                }
            }
            Schema::Number => {
                if value.is_number() {
                    Ok(())
                } else {
                    Err(SchemaError::leaf(format!("expected number, got {}", kind_of(value))))
                }
            }
            Schema::Boolean => {
                if value.is_boolean() {
                    Ok(())
                } else {
                    Err(SchemaError::leaf(format!("expected boolean, got {}", kind_of(value))))
                }
            }
            Schema::Bytes => {
                // Bytes travel as base64-ish opaque strings at the JSON boundary.
                if value.is_string() {
                    Ok(())
                } else {
                    Err(SchemaError::leaf(format!("expected bytes, got {}", kind_of(value))))
                }
            }
            Schema::Optional(inner) => {
                if value.is_null() {
                    Ok(())
                } else {
                    inner.validate(value)
                }
            }
            Schema::Array(inner) => {
                let Value::Array(items) = value else {
                    return Err(SchemaError::leaf(format!("expected array, got {}", kind_of(value))));
                };
                let errors: Vec<SchemaError> = items
                    .iter()
                    .enumerate()
                    .filter_map(|(i, item)| inner.validate(item).err().map(|e| SchemaError::at(format!("[{i}]"), e)))
                    .collect();
                match SchemaError::collect("array", errors) {
                    Some(e) => Err(e),
                    None => Ok(()),
                }
            }
            Schema::Record(fields) => self.validate_record(fields, value),
            Schema::Union(members) => {
                if members.iter().any(|m| m.validate(value).is_ok()) {
                    Ok(())
                } else {
                    Err(SchemaError::leaf(format!("value matches none of {} union members", members.len())))
                }
            }
        }
    }

    fn validate_record(&self, fields: &[Field], value: &Value) -> Result<(), SchemaError> {
        let Value::Object(map) = value else {
            return Err(SchemaError::leaf(format!("expected record, got {}", kind_of(value))));
        };

        let mut errors = Vec::new();

        for field in fields {
            match map.get(&field.name) {
                Some(present) => {
                    if let Err(e) = field.schema.validate(present) {
                        errors.push(SchemaError::at(format!("\"{}\"", field.name), e));
                    }
                }
                None => {
                    if !is_optional(&field.schema) {
                        errors.push(SchemaError::missing_required(&field.name));
                    }
                }
            }
        }

        let declared: std::collections::HashSet<&str> = fields.iter().map(|f| f.name.as_str()).collect();
        for key in map.keys() {
            if !declared.contains(key.as_str()) {
                errors.push(SchemaError::leaf(format!("unexpected key \"{key}\"")));
            }
        }

        match SchemaError::collect("record", errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// The canonical string form, used verbatim as SHA-1 input for topic
    /// and namespace derivation. Records render as a brace block with
    /// two-space indent per nesting level, in field-insertion order.
    pub fn string(&self) -> String {
        let mut out = String::new();
        self.write_string(&mut out, 0);
        out
    }

    fn write_string(&self, out: &mut String, indent: usize) {
        match self {
            Schema::String => out.push_str("string"),
            Schema::Number => out.push_str("number"),
            Schema::Boolean => out.push_str("boolean"),
            Schema::Bytes => out.push_str("bytes"),
            Schema::Optional(inner) => {
                inner.write_string(out, indent);
                out.push('?');
            }
            Schema::Array(inner) => {
                inner.write_string(out, indent);
                out.push_str("[]");
            }
            Schema::Union(members) => {
                for (i, member) in members.iter().enumerate() {
                    if i > 0 {
                        out.push_str(" | ");
                    }
                    member.write_string(out, indent);
                }
            }
            Schema::Record(fields) => {
                out.push_str("{\n");
                let pad = "  ".repeat(indent + 1);
                for field in fields {
                    let _ = write!(out, "{pad}{}: ", field.name);
                    field.schema.write_string(out, indent + 1);
                    out.push('\n');
                }
                out.push_str(&"  ".repeat(indent));
                out.push('}');
            }
        }
    }
}

fn is_optional(schema: &Schema) -> bool {
    matches!(schema, Schema::Optional(_))
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registered_schema() -> Schema {
        Schema::record(vec![
            Field::new("id", Schema::String),
            Field::new("title", Schema::String),
        ])
    }

    #[test]
    fn record_string_form_is_stable_and_indented() {
        let s = registered_schema().string();
        assert_eq!(s, "{\n  id: string\n  title: string\n}");
    }

    #[test]
    fn equal_schemas_produce_equal_strings() {
        assert_eq!(registered_schema().string(), registered_schema().string());
    }

    #[test]
    fn nested_union_flattens_for_stable_string_form() {
        let nested = Schema::String.or(Schema::Number).or(Schema::Boolean);
        assert_eq!(nested.string(), "string | number | boolean");
    }

    #[test]
    fn validate_record_accepts_well_formed_value() {
        let schema = registered_schema();
        assert!(schema.validate(&json!({"id": "a", "title": "A"})).is_ok());
    }

    #[test]
    fn validate_record_reports_missing_required_field() {
        let schema = registered_schema();
        let err = schema.validate(&json!({"id": "a"})).unwrap_err();
        assert_eq!(err, SchemaError::missing_required("title"));
    }

    #[test]
    fn validate_record_collects_multiple_missing_fields_in_order() {
        let schema = registered_schema();
        let err = schema.validate(&json!({})).unwrap_err();
        assert_eq!(err.causes.len(), 2);
        assert_eq!(err.causes[0].description, "missing required \"id\"");
        assert_eq!(err.causes[1].description, "missing required \"title\"");
    }

    #[test]
    fn validate_record_rejects_undeclared_keys() {
        let schema = registered_schema();
        let err = schema
            .validate(&json!({"id": "a", "title": "A", "extra": 1}))
            .unwrap_err();
        assert_eq!(err.description, "unexpected key \"extra\"");
    }

    #[test]
    fn optional_field_may_be_absent_or_null() {
        let schema = Schema::record(vec![Field::new("nickname", Schema::optional(Schema::String))]);
        assert!(schema.validate(&json!({})).is_ok());
        assert!(schema.validate(&json!({"nickname": null})).is_ok());
        assert!(schema.validate(&json!({"nickname": "bo"})).is_ok());
    }

    #[test]
    fn array_validate_reports_index_scoped_errors() {
        let schema = Schema::array(Schema::Number);
        let err = schema.validate(&json!([1, "nope", 3])).unwrap_err();
        assert_eq!(err.causes[0].description, "[1]: expected number, got string");
    }
}
