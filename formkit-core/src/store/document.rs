//! In-memory document cache shared by every open form session.
//!
//! Documents are keyed by `(doctype, name)` and retained for the page
//! session unless explicitly evicted (forced reload). Mutations publish
//! [`ModelEvent`]s on a broadcast channel; the store itself enforces no
//! locking beyond its own map. Only the session that owns a document is
//! expected to mutate it; cross-session races are handled by the
//! staleness check in the form's refresh, not prevented here.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use once_cell::sync::Lazy;
use serde_json::{json, Map, Value};
use tokio::sync::broadcast;

use formkit_types::{
    value_is_empty, DocInfo, DocStatus, DocTypeMeta, Document, FieldType, CHILD_IDENTITY_KEYS,
};

use crate::error::FormError;

/// Keys never carried over when a document is copied.
static NO_COPY_FIELDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    let mut set: HashSet<&'static str> = CHILD_IDENTITY_KEYS.iter().copied().collect();
    set.insert("amended_from");
    set.insert("amendment_date");
    set
});

/// A single applied field mutation, as reported to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    pub doctype: String,
    pub name: String,
    pub fieldname: String,
    pub value: Value,
    /// Set when the change landed on a child row of the named document.
    pub parentfield: Option<String>,
    /// 1-based row position for child changes.
    pub idx: Option<usize>,
}

#[derive(Debug, Clone)]
pub enum ModelEvent {
    FieldChanged(FieldChange),
    DocSynced { doctype: String, name: String },
    DocRemoved { doctype: String, name: String },
    DocRenamed { doctype: String, old: String, new: String },
}

#[derive(Clone)]
pub struct DocumentStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    docs: Mutex<HashMap<(String, String), Document>>,
    docinfo: Mutex<HashMap<(String, String), DocInfo>>,
    tx: broadcast::Sender<ModelEvent>,
}

impl Default for DocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentStore {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(512);
        Self {
            inner: Arc::new(StoreInner {
                docs: Mutex::new(HashMap::new()),
                docinfo: Mutex::new(HashMap::new()),
                tx,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ModelEvent> {
        self.inner.tx.subscribe()
    }

    fn publish(&self, event: ModelEvent) {
        let _ = self.inner.tx.send(event);
    }

    fn key(doctype: &str, name: &str) -> (String, String) {
        (doctype.to_string(), name.to_string())
    }

    // ------------------------------------------------------------------
    // Cache access
    // ------------------------------------------------------------------

    pub fn insert(&self, doc: Document) {
        let key = Self::key(&doc.doctype, &doc.name);
        self.inner.docs.lock().unwrap().insert(key, doc);
    }

    pub fn get(&self, doctype: &str, name: &str) -> Option<Document> {
        self.inner
            .docs
            .lock()
            .unwrap()
            .get(&Self::key(doctype, name))
            .cloned()
    }

    pub fn contains(&self, doctype: &str, name: &str) -> bool {
        self.inner
            .docs
            .lock()
            .unwrap()
            .contains_key(&Self::key(doctype, name))
    }

    /// Evict a document, e.g. before a forced reload.
    pub fn remove(&self, doctype: &str, name: &str) {
        let removed = self
            .inner
            .docs
            .lock()
            .unwrap()
            .remove(&Self::key(doctype, name));
        if removed.is_some() {
            self.publish(ModelEvent::DocRemoved {
                doctype: doctype.to_string(),
                name: name.to_string(),
            });
        }
    }

    pub fn get_value(&self, doctype: &str, name: &str, fieldname: &str) -> Option<Value> {
        self.get(doctype, name)
            .and_then(|doc| doc.get(fieldname).cloned())
    }

    fn with_doc_mut<T>(
        &self,
        doctype: &str,
        name: &str,
        f: impl FnOnce(&mut Document) -> Result<T, FormError>,
    ) -> Result<T, FormError> {
        let mut docs = self.inner.docs.lock().unwrap();
        let doc = docs
            .get_mut(&Self::key(doctype, name))
            .ok_or_else(|| FormError::DocumentMissing {
                doctype: doctype.to_string(),
                name: name.to_string(),
            })?;
        f(doc)
    }

    // ------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------

    /// Write one field. Returns `None` (and leaves the document clean)
    /// when nothing effectively changed: same value, or both the old and
    /// new values are empty (text widgets round-trip nulls as "").
    pub fn set_value(
        &self,
        doctype: &str,
        name: &str,
        fieldname: &str,
        value: Value,
    ) -> Result<Option<FieldChange>, FormError> {
        let change = self.with_doc_mut(doctype, name, |doc| {
            let old = doc.get(fieldname);
            let old_empty = old.map(value_is_empty).unwrap_or(true);
            if old == Some(&value) || (old_empty && value_is_empty(&value)) {
                return Ok(None);
            }
            doc.set(fieldname, value.clone());
            doc.unsaved = true;
            Ok(Some(FieldChange {
                doctype: doctype.to_string(),
                name: name.to_string(),
                fieldname: fieldname.to_string(),
                value,
                parentfield: None,
                idx: None,
            }))
        })?;

        if let Some(change) = &change {
            self.publish(ModelEvent::FieldChanged(change.clone()));
        }
        Ok(change)
    }

    /// Write one field of a child row, addressed by 1-based position.
    pub fn set_child_value(
        &self,
        doctype: &str,
        name: &str,
        parentfield: &str,
        idx: usize,
        fieldname: &str,
        value: Value,
    ) -> Result<Option<FieldChange>, FormError> {
        let change = self.with_doc_mut(doctype, name, |doc| {
            let rows = doc
                .fields
                .get_mut(parentfield)
                .and_then(Value::as_array_mut)
                .ok_or_else(|| FormError::FieldNotFound(parentfield.to_string()))?;
            let row = rows
                .get_mut(idx.saturating_sub(1))
                .and_then(Value::as_object_mut)
                .ok_or_else(|| FormError::FieldNotFound(format!("{parentfield}[{idx}]")))?;

            if row.get(fieldname) == Some(&value) {
                return Ok(None);
            }
            row.insert(fieldname.to_string(), value.clone());
            doc.unsaved = true;
            Ok(Some(FieldChange {
                doctype: doctype.to_string(),
                name: name.to_string(),
                fieldname: fieldname.to_string(),
                value,
                parentfield: Some(parentfield.to_string()),
                idx: Some(idx),
            }))
        })?;

        if let Some(change) = &change {
            self.publish(ModelEvent::FieldChanged(change.clone()));
        }
        Ok(change)
    }

    /// Append a child row. Caller values never override the row's identity
    /// keys (`name`, `idx`, parent linkage). Returns the created row.
    pub fn add_child(
        &self,
        doctype: &str,
        name: &str,
        child_doctype: &str,
        parentfield: &str,
        values: Option<Map<String, Value>>,
        at_idx: Option<usize>,
    ) -> Result<Map<String, Value>, FormError> {
        self.with_doc_mut(doctype, name, |doc| {
            let rows = doc
                .fields
                .entry(parentfield.to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            let rows = rows
                .as_array_mut()
                .ok_or_else(|| FormError::FieldNotFound(parentfield.to_string()))?;

            let mut row = Map::new();
            if let Some(values) = values {
                for (key, value) in values {
                    if !CHILD_IDENTITY_KEYS.contains(&key.as_str()) {
                        row.insert(key, value);
                    }
                }
            }
            row.insert("doctype".into(), json!(child_doctype));
            row.insert("name".into(), json!(local_name(child_doctype)));
            row.insert("parent".into(), json!(name));
            row.insert("parenttype".into(), json!(doctype));
            row.insert("parentfield".into(), json!(parentfield));

            let pos = at_idx
                .map(|i| i.saturating_sub(1).min(rows.len()))
                .unwrap_or(rows.len());
            rows.insert(pos, Value::Object(row.clone()));
            renumber_rows(rows);
            doc.unsaved = true;

            // return the row with its final idx
            let row = rows[pos].as_object().cloned().unwrap_or(row);
            Ok(row)
        })
    }

    pub fn clear_table(&self, doctype: &str, name: &str, parentfield: &str) -> Result<(), FormError> {
        self.with_doc_mut(doctype, name, |doc| {
            doc.set(parentfield, Value::Array(Vec::new()));
            doc.unsaved = true;
            Ok(())
        })
    }

    pub fn mark_unsaved(&self, doctype: &str, name: &str) {
        let _ = self.with_doc_mut(doctype, name, |doc| {
            doc.unsaved = true;
            Ok(())
        });
    }

    /// Consume the one-shot first-render link-trigger flag.
    pub fn take_run_link_triggers(&self, doctype: &str, name: &str) -> bool {
        self.with_doc_mut(doctype, name, |doc| {
            Ok(std::mem::take(&mut doc.run_link_triggers))
        })
        .unwrap_or(false)
    }

    /// Server-pushed invalidation flag; picked up by the next refresh.
    pub fn mark_needs_refresh(&self, doctype: &str, name: &str) {
        let _ = self.with_doc_mut(doctype, name, |doc| {
            doc.needs_refresh = true;
            Ok(())
        });
    }

    // ------------------------------------------------------------------
    // Creation / copy / sync
    // ------------------------------------------------------------------

    /// Create a new local document with schema defaults applied and a
    /// temporary name. Inserted into the cache.
    pub fn new_doc(&self, meta: &DocTypeMeta) -> Document {
        let mut doc = Document::new(&meta.name, local_name(&meta.name));
        doc.islocal = true;

        let mut link_default = false;
        for df in meta.value_fields() {
            if let Some(default) = &df.default {
                doc.set(&df.fieldname, default.clone());
                if df.fieldtype == FieldType::Link {
                    link_default = true;
                }
            } else if df.fieldtype.is_table() {
                doc.set(&df.fieldname, Value::Array(Vec::new()));
            }
        }
        doc.run_link_triggers = link_default;

        self.insert(doc.clone());
        tracing::debug!(doctype = %meta.name, name = %doc.name, "created new local document");
        doc
    }

    /// Copy a document into a fresh local draft. Identity, amendment
    /// linkage and bookkeeping are stripped; child rows get new names and
    /// are re-parented. When `from_amend` is set the caller fills
    /// `amended_from` itself after the copy.
    pub fn copy_doc(
        &self,
        doctype: &str,
        name: &str,
        from_amend: bool,
    ) -> Result<Document, FormError> {
        let source = self.get(doctype, name).ok_or_else(|| FormError::DocumentMissing {
            doctype: doctype.to_string(),
            name: name.to_string(),
        })?;

        let mut doc = Document::new(doctype, local_name(doctype));
        doc.islocal = true;
        doc.docstatus = DocStatus::Draft;

        for (fieldname, value) in &source.fields {
            if NO_COPY_FIELDS.contains(fieldname.as_str()) && !(from_amend && fieldname == "amended_from")
            {
                continue;
            }
            match value {
                Value::Array(rows) if rows.iter().all(Value::is_object) => {
                    let copied: Vec<Value> = rows
                        .iter()
                        .filter_map(Value::as_object)
                        .map(|row| {
                            let mut new_row: Map<String, Value> = row
                                .iter()
                                .filter(|(k, _)| !CHILD_IDENTITY_KEYS.contains(&k.as_str()))
                                .map(|(k, v)| (k.clone(), v.clone()))
                                .collect();
                            let child_doctype = row
                                .get("doctype")
                                .and_then(Value::as_str)
                                .unwrap_or(doctype)
                                .to_string();
                            new_row.insert("doctype".into(), json!(child_doctype));
                            new_row.insert("name".into(), json!(local_name(&child_doctype)));
                            new_row.insert("parent".into(), json!(doc.name.clone()));
                            new_row.insert("parenttype".into(), json!(doctype));
                            new_row.insert("parentfield".into(), json!(fieldname.clone()));
                            Value::Object(new_row)
                        })
                        .collect();
                    let mut copied = copied;
                    renumber_rows(&mut copied);
                    doc.set(fieldname, Value::Array(copied));
                }
                other => doc.set(fieldname, other.clone()),
            }
        }

        self.insert(doc.clone());
        Ok(doc)
    }

    /// Replace the local copy with a server payload. Clears the dirty and
    /// local flags, stamps the sync time, and records the prior temporary
    /// name as `localname` when the server assigned a different one.
    pub fn sync(
        &self,
        server_doc: Value,
        replacing: Option<&str>,
    ) -> Result<Document, FormError> {
        let mut doc: Document = serde_json::from_value(server_doc)?;
        doc.islocal = false;
        doc.unsaved = false;
        doc.needs_refresh = false;
        doc.last_sync_on = Some(Utc::now());

        if let Some(old) = replacing {
            if old != doc.name {
                doc.localname = Some(old.to_string());
                self.inner
                    .docs
                    .lock()
                    .unwrap()
                    .remove(&Self::key(&doc.doctype, old));
            }
        }

        self.insert(doc.clone());
        self.publish(ModelEvent::DocSynced {
            doctype: doc.doctype.clone(),
            name: doc.name.clone(),
        });
        Ok(doc)
    }

    /// Consume the rename marker left by [`sync`](DocumentStore::sync).
    pub fn take_localname(&self, doctype: &str, name: &str) -> Option<String> {
        self.with_doc_mut(doctype, name, |doc| Ok(doc.localname.take()))
            .ok()
            .flatten()
    }

    pub fn rename(&self, doctype: &str, old: &str, new: &str) -> Result<(), FormError> {
        {
            let mut docs = self.inner.docs.lock().unwrap();
            let mut doc =
                docs.remove(&Self::key(doctype, old))
                    .ok_or_else(|| FormError::DocumentMissing {
                        doctype: doctype.to_string(),
                        name: old.to_string(),
                    })?;
            doc.name = new.to_string();
            docs.insert(Self::key(doctype, new), doc);
        }
        self.publish(ModelEvent::DocRenamed {
            doctype: doctype.to_string(),
            old: old.to_string(),
            new: new.to_string(),
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Docinfo
    // ------------------------------------------------------------------

    pub fn docinfo(&self, doctype: &str, name: &str) -> DocInfo {
        self.inner
            .docinfo
            .lock()
            .unwrap()
            .get(&Self::key(doctype, name))
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_docinfo(&self, doctype: &str, name: &str, info: DocInfo) {
        self.inner
            .docinfo
            .lock()
            .unwrap()
            .insert(Self::key(doctype, name), info);
    }
}

/// Temporary name for a not-yet-persisted document: `new-<slug>-<ulid>`.
pub fn local_name(doctype: &str) -> String {
    let slug: String = doctype
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    format!("new-{}-{}", slug, ulid::Ulid::new().to_string().to_lowercase())
}

/// Reassign 1-based `idx` after any structural row change.
fn renumber_rows(rows: &mut [Value]) {
    for (i, row) in rows.iter_mut().enumerate() {
        if let Some(obj) = row.as_object_mut() {
            obj.insert("idx".into(), json!(i + 1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use formkit_types::DocField;

    fn todo_meta() -> DocTypeMeta {
        DocTypeMeta {
            name: "ToDo".into(),
            fields: vec![
                DocField::new("description", FieldType::Data),
                {
                    let mut df = DocField::new("priority", FieldType::Select);
                    df.default = Some(json!("Medium"));
                    df
                },
                DocField::new("items", FieldType::Table).with_options("ToDo Item"),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_new_doc_applies_defaults() {
        let store = DocumentStore::new();
        let doc = store.new_doc(&todo_meta());

        assert!(doc.islocal);
        assert!(!doc.unsaved);
        assert!(doc.name.starts_with("new-todo-"));
        assert_eq!(doc.get_str("priority"), Some("Medium"));
        assert_eq!(doc.get("items"), Some(&json!([])));
        assert!(store.contains("ToDo", &doc.name));
    }

    #[test]
    fn test_set_value_marks_dirty_and_publishes() {
        let store = DocumentStore::new();
        let doc = store.new_doc(&todo_meta());
        let mut rx = store.subscribe();

        let change = store
            .set_value("ToDo", &doc.name, "description", json!("hello"))
            .unwrap()
            .unwrap();
        assert_eq!(change.fieldname, "description");
        assert!(store.get("ToDo", &doc.name).unwrap().unsaved);

        match rx.try_recv().unwrap() {
            ModelEvent::FieldChanged(c) => assert_eq!(c.value, json!("hello")),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_set_value_empty_to_empty_is_noop() {
        let store = DocumentStore::new();
        let doc = store.new_doc(&todo_meta());

        assert!(store
            .set_value("ToDo", &doc.name, "description", json!(""))
            .unwrap()
            .is_none());
        assert!(store
            .set_value("ToDo", &doc.name, "description", Value::Null)
            .unwrap()
            .is_none());
        assert!(!store.get("ToDo", &doc.name).unwrap().unsaved);
    }

    #[test]
    fn test_set_value_missing_doc() {
        let store = DocumentStore::new();
        let err = store
            .set_value("ToDo", "nope", "description", json!("x"))
            .unwrap_err();
        assert!(matches!(err, FormError::DocumentMissing { .. }));
    }

    #[test]
    fn test_add_child_assigns_identity() {
        let store = DocumentStore::new();
        let doc = store.new_doc(&todo_meta());

        let mut values = Map::new();
        values.insert("item".into(), json!("first"));
        // an attempt to smuggle identity in is ignored
        values.insert("idx".into(), json!(99));
        let row = store
            .add_child("ToDo", &doc.name, "ToDo Item", "items", Some(values), None)
            .unwrap();

        assert_eq!(row["idx"], json!(1));
        assert_eq!(row["item"], json!("first"));
        assert_eq!(row["parent"], json!(doc.name.clone()));
        assert_eq!(row["parentfield"], json!("items"));

        let row2 = store
            .add_child("ToDo", &doc.name, "ToDo Item", "items", None, None)
            .unwrap();
        assert_eq!(row2["idx"], json!(2));
    }

    #[test]
    fn test_child_value_and_clear_table() {
        let store = DocumentStore::new();
        let doc = store.new_doc(&todo_meta());
        store
            .add_child("ToDo", &doc.name, "ToDo Item", "items", None, None)
            .unwrap();

        store
            .set_child_value("ToDo", &doc.name, "items", 1, "item", json!("x"))
            .unwrap()
            .unwrap();
        let rows = store.get("ToDo", &doc.name).unwrap();
        assert_eq!(rows.child_rows("items")[0]["item"], json!("x"));

        store.clear_table("ToDo", &doc.name, "items").unwrap();
        assert!(store.get("ToDo", &doc.name).unwrap().child_rows("items").is_empty());
    }

    #[test]
    fn test_copy_doc_strips_identity_and_amendment() {
        let store = DocumentStore::new();
        let mut doc = Document::new("ToDo", "TD-0001");
        doc.set("description", json!("keep me"));
        doc.set("amended_from", json!("TD-0000"));
        doc.docstatus = DocStatus::Cancelled;
        store.insert(doc);

        let copy = store.copy_doc("ToDo", "TD-0001", false).unwrap();
        assert!(copy.islocal);
        assert_eq!(copy.docstatus, DocStatus::Draft);
        assert_eq!(copy.get_str("description"), Some("keep me"));
        assert!(copy.get("amended_from").is_none());
        assert_ne!(copy.name, "TD-0001");
    }

    #[test]
    fn test_sync_records_localname() {
        let store = DocumentStore::new();
        let doc = store.new_doc(&todo_meta());
        let old_name = doc.name.clone();

        let synced = store
            .sync(
                json!({"doctype": "ToDo", "name": "TD-0001", "docstatus": 0, "description": "hello"}),
                Some(&old_name),
            )
            .unwrap();

        assert_eq!(synced.name, "TD-0001");
        assert_eq!(synced.localname.as_deref(), Some(old_name.as_str()));
        assert!(!synced.unsaved);
        assert!(synced.last_sync_on.is_some());
        assert!(!store.contains("ToDo", &old_name));
        assert_eq!(
            store.take_localname("ToDo", "TD-0001").as_deref(),
            Some(old_name.as_str())
        );
        assert!(store.take_localname("ToDo", "TD-0001").is_none());
    }

    #[test]
    fn test_rename_moves_key() {
        let store = DocumentStore::new();
        store.insert(Document::new("ToDo", "old"));
        store.rename("ToDo", "old", "new").unwrap();
        assert!(!store.contains("ToDo", "old"));
        assert_eq!(store.get("ToDo", "new").unwrap().name, "new");
    }
}
