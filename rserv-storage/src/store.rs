//! Document store: CRUD over per-document JSON files with schema
//! validation, reference integrity, and edge-index maintenance.
//!
//! Writes to one document are serialised by the entity lock; the edge index
//! is updated before the lock is released, so a reader that observes the
//! new document also observes its edges. Reads never lock.

use crate::allocator;
use crate::fsio::{self, EntityLock};
use crate::graph::{DocRecord, EdgeIndex};
use crate::schema::{SchemaRegistry, ValidationMode};
use crate::{Error, FieldError, Result};
use rserv_api::{DocId, DocumentCache};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// What a `null` in a PATCH body means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchNull {
    /// Store an explicit null.
    Store,
    /// Delete the field.
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub patch_null: PatchNull,
    pub cascading_delete: bool,
    pub default_page_size: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            patch_null: PatchNull::Store,
            cascading_delete: false,
            default_page_size: 20,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Listing {
    pub items: Vec<Value>,
    pub total: usize,
    pub page: usize,
    pub per_page: usize,
}

/// A cache that never hits; the default when no driver is installed.
#[derive(Debug, Default)]
pub struct NoopCache;

impl DocumentCache for NoopCache {
    fn get(&self, _entity: &str, _id: DocId) -> Option<Value> {
        None
    }
    fn put(&self, _entity: &str, _id: DocId, _doc: Value) {}
    fn invalidate(&self, _entity: &str, _id: DocId) {}
    fn clear(&self) {}
}

type Listener = Box<dyn Fn(&str, DocId) + Send + Sync>;

pub struct DocumentStore {
    base: PathBuf,
    schema_name: String,
    registry: SchemaRegistry,
    graph: Option<Arc<EdgeIndex>>,
    cache: Arc<dyn DocumentCache>,
    listeners: RwLock<Vec<Listener>>,
    options: StoreOptions,
}

impl DocumentStore {
    /// Opens the store rooted at `base` and, when a graph index is
    /// attached, populates it (from `graph.index` or a full scan).
    pub fn open(
        base: impl Into<PathBuf>,
        schema_name: impl Into<String>,
        options: StoreOptions,
        graph: Option<Arc<EdgeIndex>>,
        cache: Arc<dyn DocumentCache>,
    ) -> Result<Self> {
        let base = base.into();
        let schema_name = schema_name.into();
        let registry = SchemaRegistry::load(&fsio::schema_dir(&base, &schema_name))?;
        let store = Self {
            base,
            schema_name,
            registry,
            graph,
            cache,
            listeners: RwLock::new(Vec::new()),
            options,
        };
        if let Some(graph) = &store.graph {
            graph.populate(|| store.scan_records())?;
        }
        Ok(store)
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// Registers an invalidation subscriber, called after every successful
    /// write with the affected `(entity, id)`.
    pub fn subscribe(&self, listener: Listener) {
        self.listeners.write().unwrap().push(listener);
    }

    fn entity_dir(&self, entity: &str) -> PathBuf {
        fsio::entity_dir(&self.base, &self.schema_name, entity)
    }

    /// Entities present on disk or declared by a schema.
    pub fn entities(&self) -> Result<Vec<String>> {
        let mut names: BTreeSet<String> =
            self.registry.entities().map(String::from).collect();
        let data = fsio::data_dir(&self.base, &self.schema_name);
        match fs::read_dir(&data) {
            Ok(entries) => {
                for entry in entries {
                    let entry = entry?;
                    if entry.file_type()?.is_dir() {
                        if let Some(name) = entry.file_name().to_str() {
                            if fsio::valid_entity_name(name) {
                                names.insert(name.to_string());
                            }
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(names.into_iter().collect())
    }

    /// Ids present in an entity directory, ascending.
    pub fn ids(&self, entity: &str) -> Result<Vec<DocId>> {
        let mut ids = Vec::new();
        let dir = self.entity_dir(entity);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<DocId>().ok())
            {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    pub fn create(&self, entity: &str, body: Map<String, Value>) -> Result<(DocId, Value)> {
        fsio::check_entity_name(entity)?;
        if body.contains_key("id") {
            return Err(Error::Validation(vec![FieldError::new(
                "id",
                "id is assigned by the server; use save to supply one",
            )]));
        }
        let dir = self.entity_dir(entity);
        let _guard = EntityLock::acquire(&dir)?;
        let id = allocator::allocate_locked(&dir)?;
        let doc = self.write_document(entity, id, body, ValidationMode::Create)?;
        Ok((id, doc))
    }

    /// Create with a caller-supplied id; fails if the id is taken.
    pub fn save(&self, entity: &str, id: DocId, body: Map<String, Value>) -> Result<Value> {
        fsio::check_entity_name(entity)?;
        check_body_id(&body, id)?;
        let dir = self.entity_dir(entity);
        let _guard = EntityLock::acquire(&dir)?;
        if fsio::read_json(&fsio::doc_path(&dir, id))?.is_some() {
            return Err(Error::IdExists {
                entity: entity.to_string(),
                id,
            });
        }
        let doc = self.write_document(entity, id, body, ValidationMode::Create)?;
        // Keep the allocator ahead of manually chosen ids.
        allocator::reserve_through_locked(&dir, id)?;
        Ok(doc)
    }

    pub fn get(&self, entity: &str, id: DocId) -> Result<Value> {
        fsio::check_entity_name(entity)?;
        if let Some(doc) = self.cache.get(entity, id) {
            return Ok(doc);
        }
        let doc = self.read_required(entity, id)?;
        self.cache.put(entity, id, doc.clone());
        Ok(doc)
    }

    pub fn replace(&self, entity: &str, id: DocId, body: Map<String, Value>) -> Result<Value> {
        fsio::check_entity_name(entity)?;
        check_body_id(&body, id)?;
        let dir = self.entity_dir(entity);
        let _guard = EntityLock::acquire(&dir)?;
        if fsio::read_json(&fsio::doc_path(&dir, id))?.is_none() {
            return Err(Error::NotFound {
                entity: entity.to_string(),
                id,
            });
        }
        self.write_document(entity, id, body, ValidationMode::Replace)
    }

    pub fn patch(&self, entity: &str, id: DocId, partial: Map<String, Value>) -> Result<Value> {
        fsio::check_entity_name(entity)?;
        check_body_id(&partial, id)?;
        let dir = self.entity_dir(entity);
        let _guard = EntityLock::acquire(&dir)?;
        let existing = fsio::read_json(&fsio::doc_path(&dir, id))?.ok_or_else(|| {
            Error::NotFound {
                entity: entity.to_string(),
                id,
            }
        })?;
        let mut merged = existing.as_object().cloned().unwrap_or_default();
        for (key, value) in partial {
            if key == "id" {
                continue;
            }
            if value.is_null() {
                match self.options.patch_null {
                    PatchNull::Delete => {
                        merged.remove(&key);
                    }
                    PatchNull::Store => {
                        merged.insert(key, Value::Null);
                    }
                }
            } else {
                merged.insert(key, value);
            }
        }
        merged.remove("id");
        self.write_document(entity, id, merged, ValidationMode::Patch)
    }

    /// Deletes a document. With `cascade` (and the store-wide policy on),
    /// every document that transitively references the target goes first.
    /// Without cascade, a referenced target is refused.
    pub fn delete(&self, entity: &str, id: DocId, cascade: bool) -> Result<()> {
        fsio::check_entity_name(entity)?;
        self.read_required(entity, id)?;

        let cascade = cascade && self.options.cascading_delete;
        if cascade {
            let victims = self.collect_cascade(entity, id)?;
            debug!(entity, id, victims = victims.len(), "cascade delete");
            // Referrers first, target last.
            for (victim_entity, victim_id) in victims.into_iter().rev() {
                self.delete_one(&victim_entity, victim_id)?;
            }
            Ok(())
        } else {
            let referrers = self.referring_documents(entity, id)?;
            if !referrers.is_empty() {
                return Err(Error::ReferencedDelete {
                    entity: entity.to_string(),
                    id,
                    referrers: referrers.len(),
                });
            }
            self.delete_one(entity, id)
        }
    }

    pub fn list(
        &self,
        entity: &str,
        page: Option<usize>,
        per_page: Option<usize>,
        sort: &[(String, SortOrder)],
    ) -> Result<Listing> {
        fsio::check_entity_name(entity)?;
        let mut items = Vec::new();
        let dir = self.entity_dir(entity);
        for id in self.ids(entity)? {
            if let Some(doc) = fsio::read_json(&fsio::doc_path(&dir, id))? {
                items.push(doc);
            }
        }
        if !sort.is_empty() {
            items.sort_by(|a, b| {
                for (field, order) in sort {
                    let av = a.get(field);
                    let bv = b.get(field);
                    let cmp = compare_optional(av, bv);
                    if cmp != std::cmp::Ordering::Equal {
                        return match order {
                            SortOrder::Asc => cmp,
                            SortOrder::Desc => cmp.reverse(),
                        };
                    }
                }
                std::cmp::Ordering::Equal
            });
        }
        let total = items.len();
        let per_page = per_page.unwrap_or(self.options.default_page_size).max(1);
        let page = page.unwrap_or(1).max(1);
        let start = (page - 1).saturating_mul(per_page).min(total);
        let end = start.saturating_add(per_page).min(total);
        Ok(Listing {
            items: items[start..end].to_vec(),
            total,
            page,
            per_page,
        })
    }

    /// Scans every document, producing the records the edge index rebuilds
    /// from.
    pub fn scan_records(&self) -> Result<Vec<DocRecord>> {
        let mut records = Vec::new();
        for entity in self.entities()? {
            let dir = self.entity_dir(&entity);
            for id in self.ids(&entity)? {
                let Some(doc) = fsio::read_json(&fsio::doc_path(&dir, id))? else {
                    continue;
                };
                let Some(map) = doc.as_object() else {
                    continue;
                };
                records.push(self.record_for(&entity, id, map));
            }
        }
        Ok(records)
    }

    fn record_for(&self, entity: &str, id: DocId, doc: &Map<String, Value>) -> DocRecord {
        let refs = self.registry.references_of(entity, doc);
        let ref_fields: BTreeSet<&str> = self
            .registry
            .get(entity)
            .map(|s| s.ref_fields().collect())
            .unwrap_or_default();
        let props = doc
            .iter()
            .filter(|(k, _)| !ref_fields.contains(k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        DocRecord {
            entity: entity.to_string(),
            id,
            props,
            refs,
        }
    }

    fn read_required(&self, entity: &str, id: DocId) -> Result<Value> {
        let path = fsio::doc_path(&self.entity_dir(entity), id);
        fsio::read_json(&path)?.ok_or_else(|| Error::NotFound {
            entity: entity.to_string(),
            id,
        })
    }

    /// Validation, integrity checks, file write, index update, and the
    /// invalidation broadcast. Caller holds the entity lock.
    fn write_document(
        &self,
        entity: &str,
        id: DocId,
        mut body: Map<String, Value>,
        mode: ValidationMode,
    ) -> Result<Value> {
        body.insert("id".to_string(), Value::from(id));
        let normalized = self
            .registry
            .validate(entity, &body, mode)
            .map_err(Error::Validation)?;
        self.check_foreign_keys(entity, &normalized)?;
        self.check_unique(entity, id, &normalized)?;

        let doc = Value::Object(normalized.clone());
        fsio::atomic_write_json(&fsio::doc_path(&self.entity_dir(entity), id), &doc)?;

        if let Some(graph) = &self.graph {
            let record = self.record_for(entity, id, &normalized);
            graph.upsert_document(entity, id, record.props, &record.refs)?;
        }
        self.notify(entity, id);
        debug!(entity, id, "wrote document");
        Ok(doc)
    }

    fn delete_one(&self, entity: &str, id: DocId) -> Result<()> {
        let dir = self.entity_dir(entity);
        let _guard = EntityLock::acquire(&dir)?;
        let path = fsio::doc_path(&dir, id);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if let Some(graph) = &self.graph {
            graph.remove_document(entity, id)?;
        }
        self.notify(entity, id);
        debug!(entity, id, "deleted document");
        Ok(())
    }

    fn notify(&self, entity: &str, id: DocId) {
        self.cache.invalidate(entity, id);
        for listener in self.listeners.read().unwrap().iter() {
            listener(entity, id);
        }
    }

    fn check_foreign_keys(&self, entity: &str, doc: &Map<String, Value>) -> Result<()> {
        for (field, target_entity, target_id) in self.registry.references_of(entity, doc) {
            let path = fsio::doc_path(&self.entity_dir(&target_entity), target_id);
            if fsio::read_json(&path)?.is_none() {
                return Err(Error::Integrity(format!(
                    "{field}: referenced document {target_entity}/{target_id} does not exist"
                )));
            }
        }
        for (field, target_entity, key, value) in self.registry.scalar_foreign_keys(entity, doc) {
            let found = if key == "id" {
                match value.as_u64() {
                    Some(id) => {
                        let path = fsio::doc_path(&self.entity_dir(&target_entity), id);
                        fsio::read_json(&path)?.is_some()
                    }
                    None => false,
                }
            } else {
                let dir = self.entity_dir(&target_entity);
                let mut found = false;
                for id in self.ids(&target_entity)? {
                    if let Some(doc) = fsio::read_json(&fsio::doc_path(&dir, id))? {
                        if doc.get(&key) == Some(value) {
                            found = true;
                            break;
                        }
                    }
                }
                found
            };
            if !found {
                return Err(Error::Integrity(format!(
                    "{field}: no {target_entity} document with {key} = {value}"
                )));
            }
        }
        Ok(())
    }

    fn check_unique(&self, entity: &str, id: DocId, doc: &Map<String, Value>) -> Result<()> {
        let Some(schema) = self.registry.get(entity) else {
            return Ok(());
        };
        let dir = self.entity_dir(entity);
        for field in schema.unique_fields() {
            let Some(value) = doc.get(field) else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            for other_id in self.ids(entity)? {
                if other_id == id {
                    continue;
                }
                if let Some(other) = fsio::read_json(&fsio::doc_path(&dir, other_id))? {
                    if other.get(field) == Some(value) {
                        return Err(Error::Integrity(format!(
                            "{field}: value {value} already used by {entity}/{other_id}"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Documents that hold a reference to `(entity, id)`.
    fn referring_documents(&self, entity: &str, id: DocId) -> Result<Vec<(String, DocId)>> {
        let mut out = Vec::new();
        for (src_entity, src_field) in self.registry.referrers_of(entity) {
            let dir = self.entity_dir(src_entity);
            for src_id in self.ids(src_entity)? {
                let Some(doc) = fsio::read_json(&fsio::doc_path(&dir, src_id))? else {
                    continue;
                };
                let Some(map) = doc.as_object() else {
                    continue;
                };
                if self.field_references(src_entity, src_field, map, entity, id) {
                    out.push((src_entity.clone(), src_id));
                }
            }
        }
        Ok(out)
    }

    fn field_references(
        &self,
        src_entity: &str,
        src_field: &str,
        doc: &Map<String, Value>,
        target_entity: &str,
        target_id: DocId,
    ) -> bool {
        for (field, tgt_entity, tgt_id) in self.registry.references_of(src_entity, doc) {
            if field == src_field && tgt_entity == target_entity && tgt_id == target_id {
                return true;
            }
        }
        for (field, tgt_entity, key, value) in self.registry.scalar_foreign_keys(src_entity, doc) {
            if field == src_field
                && tgt_entity == target_entity
                && key == "id"
                && value.as_u64() == Some(target_id)
            {
                return true;
            }
        }
        false
    }

    /// Breadth-first referrer closure of the target. The seen-set keeps
    /// reference cycles from looping; the result lists the target first.
    fn collect_cascade(&self, entity: &str, id: DocId) -> Result<Vec<(String, DocId)>> {
        let mut seen = BTreeSet::new();
        let mut order = Vec::new();
        let mut queue = std::collections::VecDeque::new();
        queue.push_back((entity.to_string(), id));
        seen.insert((entity.to_string(), id));
        while let Some((entity, id)) = queue.pop_front() {
            order.push((entity.clone(), id));
            for referrer in self.referring_documents(&entity, id)? {
                if seen.insert(referrer.clone()) {
                    queue.push_back(referrer);
                }
            }
        }
        Ok(order)
    }
}

fn check_body_id(body: &Map<String, Value>, id: DocId) -> Result<()> {
    if let Some(body_id) = body.get("id") {
        if body_id.as_u64() != Some(id) {
            return Err(Error::Validation(vec![FieldError::new(
                "id",
                format!("body id {body_id} does not match document id {id}"),
            )]));
        }
    }
    Ok(())
}

/// Total order over JSON for sorting: null < bool < number < string <
/// array < object; absent fields sort last.
fn compare_optional(a: Option<&Value>, b: Option<&Value>) -> std::cmp::Ordering {
    match (a, b) {
        (Some(a), Some(b)) => compare_json(a, b),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    }
}

pub fn compare_json(a: &Value, b: &Value) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }
    match (a, b) {
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        (Value::Number(a), Value::Number(b)) => {
            let a = a.as_f64().unwrap_or(f64::NAN);
            let b = b.as_f64().unwrap_or(f64::NAN);
            a.partial_cmp(&b).unwrap_or(Ordering::Equal)
        }
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (Value::Array(a), Value::Array(b)) => {
            for (x, y) in a.iter().zip(b.iter()) {
                let cmp = compare_json(x, y);
                if cmp != Ordering::Equal {
                    return cmp;
                }
            }
            a.len().cmp(&b.len())
        }
        _ => rank(a).cmp(&rank(b)),
    }
}
