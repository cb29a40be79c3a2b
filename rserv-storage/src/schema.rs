//! Schema registry and document validation.
//!
//! One JSON file per entity under `schema/<schema_name>/`, mapping field
//! names to descriptors. A field descriptor is a tag-discriminated variant
//! over the recognised types; constraints that make no sense for a type
//! simply do not exist on its variant.

use crate::{Error, FieldError, Result};
use regex::Regex;
use rserv_api::DocId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    #[serde(flatten)]
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub primary_key: bool,
    /// `"entity"` or `"entity.field"` for scalar foreign keys.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub foreign_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FieldKind {
    String {
        #[serde(skip_serializing_if = "Option::is_none")]
        max_length: Option<usize>,
        #[serde(skip_serializing_if = "Option::is_none")]
        regex: Option<String>,
    },
    Integer {
        #[serde(skip_serializing_if = "Option::is_none")]
        min: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        max: Option<i64>,
    },
    Float {
        #[serde(skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
    },
    Boolean,
    Datetime,
    #[serde(rename = "REF")]
    Ref {
        entity: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        field: Option<String>,
    },
    List,
    Mapping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    Create,
    Replace,
    Patch,
}

#[derive(Debug, Clone)]
pub struct EntitySchema {
    pub fields: BTreeMap<String, FieldSpec>,
    patterns: BTreeMap<String, Regex>,
}

impl EntitySchema {
    fn from_fields(path: &Path, fields: BTreeMap<String, FieldSpec>) -> Result<Self> {
        let mut primary_keys = 0;
        let mut patterns = BTreeMap::new();
        for (name, spec) in &fields {
            if spec.primary_key {
                primary_keys += 1;
            }
            if let FieldKind::String {
                regex: Some(pattern),
                ..
            } = &spec.kind
            {
                let compiled = Regex::new(pattern).map_err(|e| Error::BadSchema {
                    path: path.to_path_buf(),
                    message: format!("field {name}: bad regex: {e}"),
                })?;
                patterns.insert(name.clone(), compiled);
            }
        }
        if primary_keys > 1 {
            return Err(Error::BadSchema {
                path: path.to_path_buf(),
                message: "more than one primary_key field".to_string(),
            });
        }
        Ok(Self { fields, patterns })
    }

    pub fn unique_fields(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(|(_, s)| s.unique)
            .map(|(n, _)| n.as_str())
    }

    pub fn ref_fields(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(|(_, s)| matches!(s.kind, FieldKind::Ref { .. }))
            .map(|(n, _)| n.as_str())
    }
}

/// All entity schemas of one schema name, plus the inverted referrer table
/// used by cascade deletion.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: BTreeMap<String, EntitySchema>,
    referrers: BTreeMap<String, Vec<(String, String)>>,
}

impl SchemaRegistry {
    /// Loads every `<entity>.json` under `schema_dir`. A missing directory
    /// yields an empty (schemaless) registry.
    pub fn load(schema_dir: &Path) -> Result<Self> {
        let mut schemas = BTreeMap::new();
        let entries = match fs::read_dir(schema_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(entity) = path.file_stem().and_then(|s| s.to_str()).map(String::from) else {
                continue;
            };
            let bytes = fs::read(&path)?;
            let fields: BTreeMap<String, FieldSpec> =
                serde_json::from_slice(&bytes).map_err(|e| Error::BadSchema {
                    path: path.clone(),
                    message: e.to_string(),
                })?;
            schemas.insert(entity, EntitySchema::from_fields(&path, fields)?);
        }

        let mut referrers: BTreeMap<String, Vec<(String, String)>> = BTreeMap::new();
        for (entity, schema) in &schemas {
            for (field, spec) in &schema.fields {
                let target = match &spec.kind {
                    FieldKind::Ref { entity: target, .. } => Some(target.clone()),
                    _ => spec
                        .foreign_key
                        .as_ref()
                        .map(|fk| fk.split('.').next().unwrap_or(fk).to_string()),
                };
                if let Some(target) = target {
                    referrers
                        .entry(target)
                        .or_default()
                        .push((entity.clone(), field.clone()));
                }
            }
        }

        Ok(Self { schemas, referrers })
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    pub fn get(&self, entity: &str) -> Option<&EntitySchema> {
        self.schemas.get(entity)
    }

    pub fn entities(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }

    /// Static referrer list `(source_entity, source_field)` for `entity`.
    pub fn referrers_of(&self, entity: &str) -> &[(String, String)] {
        self.referrers.get(entity).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Validates `doc` against the entity schema and returns the normalised
    /// document (reference values reduced to `{"id": n}`), or the list of
    /// field errors. Entities without a schema pass through unchanged.
    pub fn validate(
        &self,
        entity: &str,
        doc: &Map<String, Value>,
        mode: ValidationMode,
    ) -> std::result::Result<Map<String, Value>, Vec<FieldError>> {
        let Some(schema) = self.schemas.get(entity) else {
            return Ok(doc.clone());
        };

        let mut errors = Vec::new();
        let mut normalized = doc.clone();

        if mode != ValidationMode::Patch {
            for (name, spec) in &schema.fields {
                if spec.required && name != "id" {
                    match doc.get(name) {
                        None => errors.push(FieldError::new(name, "required field is missing")),
                        Some(Value::Null) => {
                            errors.push(FieldError::new(name, "required field is null"))
                        }
                        Some(_) => {}
                    }
                }
            }
        }

        if let Some(id) = doc.get("id") {
            if !matches!(id.as_u64(), Some(n) if n > 0) {
                errors.push(FieldError::new("id", "id must be a positive integer"));
            }
        }

        for (name, value) in doc {
            if name == "id" || value.is_null() {
                continue;
            }
            let Some(spec) = schema.fields.get(name) else {
                continue;
            };
            match check_field(schema, name, spec, value) {
                Ok(Some(replacement)) => {
                    normalized.insert(name.clone(), replacement);
                }
                Ok(None) => {}
                Err(e) => errors.push(e),
            }
        }

        if errors.is_empty() {
            Ok(normalized)
        } else {
            Err(errors)
        }
    }

    /// `(field, target_entity, target_id)` triples for every reference held
    /// by `doc`. Expects a normalised document.
    pub fn references_of(&self, entity: &str, doc: &Map<String, Value>) -> Vec<(String, String, DocId)> {
        let Some(schema) = self.schemas.get(entity) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for (field, spec) in &schema.fields {
            let FieldKind::Ref { entity: target, .. } = &spec.kind else {
                continue;
            };
            let Some(value) = doc.get(field) else {
                continue;
            };
            for id in ref_ids(value) {
                out.push((field.clone(), target.clone(), id));
            }
        }
        out
    }

    /// Scalar foreign keys of `doc`: `(field, target_entity, key_field, value)`.
    pub fn scalar_foreign_keys<'a>(
        &self,
        entity: &str,
        doc: &'a Map<String, Value>,
    ) -> Vec<(String, String, String, &'a Value)> {
        let Some(schema) = self.schemas.get(entity) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for (field, spec) in &schema.fields {
            if matches!(spec.kind, FieldKind::Ref { .. }) {
                continue;
            }
            let Some(fk) = &spec.foreign_key else {
                continue;
            };
            let Some(value) = doc.get(field) else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            let (target, key) = match fk.split_once('.') {
                Some((target, key)) => (target.to_string(), key.to_string()),
                None => (fk.clone(), "id".to_string()),
            };
            out.push((field.clone(), target, key, value));
        }
        out
    }
}

/// Extracts the target ids from a normalised reference value.
pub fn ref_ids(value: &Value) -> Vec<DocId> {
    match value {
        Value::Object(map) => map.get("id").and_then(Value::as_u64).into_iter().collect(),
        Value::Array(items) => items.iter().flat_map(ref_ids).collect(),
        _ => Vec::new(),
    }
}

fn check_field(
    schema: &EntitySchema,
    name: &str,
    spec: &FieldSpec,
    value: &Value,
) -> std::result::Result<Option<Value>, FieldError> {
    match &spec.kind {
        FieldKind::String { max_length, .. } => {
            let Some(s) = value.as_str() else {
                return Err(FieldError::new(name, "expected a string"));
            };
            if let Some(max) = max_length {
                if s.chars().count() > *max {
                    return Err(FieldError::new(
                        name,
                        format!("longer than max_length {max}"),
                    ));
                }
            }
            if let Some(pattern) = schema.patterns.get(name) {
                if !pattern.is_match(s) {
                    return Err(FieldError::new(name, "does not match regex"));
                }
            }
            Ok(None)
        }
        FieldKind::Integer { min, max } => {
            let Some(n) = value.as_i64().or_else(|| value.as_u64().map(|v| v as i64)) else {
                return Err(FieldError::new(name, "expected an integer"));
            };
            if value.is_f64() {
                return Err(FieldError::new(name, "expected an integer"));
            }
            if let Some(min) = min {
                if n < *min {
                    return Err(FieldError::new(name, format!("below min {min}")));
                }
            }
            if let Some(max) = max {
                if n > *max {
                    return Err(FieldError::new(name, format!("above max {max}")));
                }
            }
            Ok(None)
        }
        FieldKind::Float { min, max } => {
            let Some(n) = value.as_f64() else {
                return Err(FieldError::new(name, "expected a number"));
            };
            if let Some(min) = min {
                if n < *min {
                    return Err(FieldError::new(name, format!("below min {min}")));
                }
            }
            if let Some(max) = max {
                if n > *max {
                    return Err(FieldError::new(name, format!("above max {max}")));
                }
            }
            Ok(None)
        }
        FieldKind::Boolean => {
            if value.is_boolean() {
                Ok(None)
            } else {
                Err(FieldError::new(name, "expected a boolean"))
            }
        }
        FieldKind::Datetime => {
            let Some(s) = value.as_str() else {
                return Err(FieldError::new(name, "expected an RFC 3339 datetime string"));
            };
            match chrono::DateTime::parse_from_rfc3339(s) {
                Ok(_) => Ok(None),
                Err(e) => Err(FieldError::new(name, format!("bad datetime: {e}"))),
            }
        }
        FieldKind::Ref { entity, .. } => normalize_ref(name, entity, value).map(Some),
        FieldKind::List => {
            if value.is_array() {
                Ok(None)
            } else {
                Err(FieldError::new(name, "expected a list"))
            }
        }
        FieldKind::Mapping => {
            if value.is_object() {
                Ok(None)
            } else {
                Err(FieldError::new(name, "expected a mapping"))
            }
        }
    }
}

/// Accepts `{"id": n}` and the long form
/// `{"type": "REF", "entity": e, "field": f, "id": n}` (or a list of
/// either); always stores the short form.
fn normalize_ref(
    name: &str,
    target_entity: &str,
    value: &Value,
) -> std::result::Result<Value, FieldError> {
    match value {
        Value::Object(map) => {
            for key in map.keys() {
                if !matches!(key.as_str(), "id" | "type" | "entity" | "field") {
                    return Err(FieldError::new(
                        name,
                        format!("unexpected key {key:?} in reference value"),
                    ));
                }
            }
            if let Some(ty) = map.get("type") {
                if ty.as_str() != Some("REF") {
                    return Err(FieldError::new(name, "reference type must be \"REF\""));
                }
            }
            if let Some(entity) = map.get("entity") {
                if entity.as_str() != Some(target_entity) {
                    return Err(FieldError::new(
                        name,
                        format!("reference entity must be {target_entity:?}"),
                    ));
                }
            }
            let Some(id) = map.get("id").and_then(Value::as_u64).filter(|n| *n > 0) else {
                return Err(FieldError::new(
                    name,
                    "reference value needs a positive integer id",
                ));
            };
            Ok(serde_json::json!({ "id": id }))
        }
        Value::Array(items) => {
            let normalized = items
                .iter()
                .map(|item| normalize_ref(name, target_entity, item))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(Value::Array(normalized))
        }
        _ => Err(FieldError::new(
            name,
            "expected a reference object or list of references",
        )),
    }
}
