//! Table schemas and patch validation.
//!
//! Change Capture validates every local put against the schema before the
//! write commits; a validation failure aborts the write.

use crate::{error::Result, Error, TableName};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Schema version, bumped by hosts when tables change shape.
pub type SchemaVersion = u32;

/// Field types supported in schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    Timestamp,
    /// Array of any values
    List,
    /// Arbitrary nested JSON
    Json,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FieldType::String => "String",
            FieldType::Int => "Int",
            FieldType::Float => "Float",
            FieldType::Bool => "Bool",
            FieldType::Timestamp => "Timestamp",
            FieldType::List => "List",
            FieldType::Json => "Json",
        };
        f.write_str(name)
    }
}

/// Definition of a field in a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    pub required: bool,
}

impl FieldDef {
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
        }
    }

    /// Validate a JSON value against this field definition.
    pub fn validate(&self, value: Option<&serde_json::Value>) -> Result<()> {
        match value {
            None | Some(serde_json::Value::Null) if self.required => {
                Err(Error::MissingRequiredField(self.name.clone()))
            }
            None | Some(serde_json::Value::Null) => Ok(()),
            Some(v) => self.validate_type(v),
        }
    }

    fn validate_type(&self, value: &serde_json::Value) -> Result<()> {
        let valid = match self.field_type {
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_number(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Timestamp => value.is_u64() || value.is_i64(),
            FieldType::List => value.is_array(),
            FieldType::Json => true,
        };

        if valid {
            Ok(())
        } else {
            Err(Error::TypeMismatch {
                field: self.name.clone(),
                expected: self.field_type.to_string(),
                got: json_type_name(value).to_string(),
            })
        }
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "Null",
        serde_json::Value::Bool(_) => "Bool",
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        serde_json::Value::Number(_) => "Float",
        serde_json::Value::String(_) => "String",
        serde_json::Value::Array(_) => "List",
        serde_json::Value::Object(_) => "Object",
    }
}

/// Declared shape of one business table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSchema {
    pub name: TableName,
    pub fields: Vec<FieldDef>,
}

impl TableSchema {
    pub fn new(name: impl Into<TableName>, fields: Vec<FieldDef>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }

    /// Validate a complete row.
    pub fn validate_row(&self, row: &serde_json::Value) -> Result<()> {
        let obj = row
            .as_object()
            .ok_or_else(|| Error::InvalidPayload("row must be an object".into()))?;
        for field in &self.fields {
            field.validate(obj.get(&field.name))?;
        }
        Ok(())
    }
}

/// Schemas of all synced tables.
///
/// An empty schema accepts any object for any table. Once a table is
/// declared, writes to undeclared tables are rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    pub version: SchemaVersion,
    pub tables: BTreeMap<TableName, TableSchema>,
}

impl Schema {
    pub fn new(version: SchemaVersion) -> Self {
        Self {
            version,
            tables: BTreeMap::new(),
        }
    }

    pub fn add_table(&mut self, table: TableSchema) -> &mut Self {
        self.tables.insert(table.name.clone(), table);
        self
    }

    /// Builder-style method to add a table.
    pub fn with_table(mut self, table: TableSchema) -> Self {
        self.add_table(table);
        self
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(name)
    }

    /// Validate a put of `patch` onto the row's `current` contents.
    ///
    /// Types are checked on every field the patch writes; required fields are
    /// checked on the row as it will look after the patch.
    pub fn validate_patch(
        &self,
        table: &str,
        patch: &serde_json::Value,
        current: Option<&serde_json::Value>,
    ) -> Result<()> {
        let patch = patch
            .as_object()
            .ok_or_else(|| Error::InvalidPayload("patch must be an object".into()))?;

        if self.tables.is_empty() {
            return Ok(());
        }
        let schema = self
            .tables
            .get(table)
            .ok_or_else(|| Error::TableNotFound(table.to_string()))?;

        let mut merged = current
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default();
        for (k, v) in patch {
            merged.insert(k.clone(), v.clone());
        }
        schema.validate_row(&serde_json::Value::Object(merged))
    }

    /// Whether deletes on `table` are accepted.
    pub fn validate_delete(&self, table: &str) -> Result<()> {
        if self.tables.is_empty() || self.tables.contains_key(table) {
            Ok(())
        } else {
            Err(Error::TableNotFound(table.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_schema() -> Schema {
        Schema::new(1).with_table(TableSchema::new(
            "threads",
            vec![
                FieldDef::required("title", FieldType::String),
                FieldDef::optional("replies", FieldType::Int),
                FieldDef::optional("tags", FieldType::List),
            ],
        ))
    }

    #[test]
    fn accepts_valid_patch() {
        let schema = test_schema();
        assert!(schema
            .validate_patch("threads", &json!({"title": "a", "tags": ["x"]}), None)
            .is_ok());
    }

    #[test]
    fn required_fields_checked_on_merged_row() {
        let schema = test_schema();
        let current = json!({"title": "a"});
        assert!(schema
            .validate_patch("threads", &json!({"replies": 2}), Some(&current))
            .is_ok());

        let result = schema.validate_patch("threads", &json!({"replies": 2}), None);
        assert!(matches!(result, Err(Error::MissingRequiredField(f)) if f == "title"));
    }

    #[test]
    fn null_clears_optional_but_not_required() {
        let schema = test_schema();
        let current = json!({"title": "a", "replies": 1});
        assert!(schema
            .validate_patch("threads", &json!({"replies": null}), Some(&current))
            .is_ok());
        assert!(schema
            .validate_patch("threads", &json!({"title": null}), Some(&current))
            .is_err());
    }

    #[test]
    fn wrong_type_is_rejected() {
        let schema = test_schema();
        let result = schema.validate_patch("threads", &json!({"title": "a", "tags": "x"}), None);
        assert!(matches!(
            result,
            Err(Error::TypeMismatch { field, expected, got })
                if field == "tags" && expected == "List" && got == "String"
        ));
    }

    #[test]
    fn unknown_table_is_rejected_once_tables_are_declared() {
        let schema = test_schema();
        let result = schema.validate_patch("posts", &json!({}), None);
        assert!(matches!(result, Err(Error::TableNotFound(t)) if t == "posts"));
        assert!(schema.validate_delete("posts").is_err());
        assert!(schema.validate_delete("threads").is_ok());
    }

    #[test]
    fn empty_schema_accepts_any_object() {
        let schema = Schema::default();
        assert!(schema.validate_patch("anything", &json!({"x": 1}), None).is_ok());
        assert!(matches!(
            schema.validate_patch("anything", &json!([1]), None),
            Err(Error::InvalidPayload(_))
        ));
    }

    #[test]
    fn schema_serialization() {
        let schema = test_schema();
        let json = serde_json::to_string(&schema).unwrap();
        let parsed: Schema = serde_json::from_str(&json).unwrap();
        assert_eq!(schema, parsed);
    }
}
