//! Session cache of doctype metadata, permissions and workflow verdicts.
//!
//! Schema definition and permission computation are owned by the server;
//! this store only holds what it was handed. Metadata is immutable for
//! the session (per-form docfield tweaks go through the layout overlay,
//! never here).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use formkit_types::{DocField, DocTypeMeta, PermissionSet, WorkflowState};

use crate::error::FormError;

#[derive(Clone, Default)]
pub struct MetaStore {
    inner: Arc<MetaInner>,
}

#[derive(Default)]
struct MetaInner {
    metas: Mutex<HashMap<String, Arc<DocTypeMeta>>>,
    permissions: Mutex<HashMap<String, PermissionSet>>,
    workflow: Mutex<HashMap<(String, String), WorkflowState>>,
}

impl MetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_meta(&self, meta: DocTypeMeta) {
        self.inner
            .metas
            .lock()
            .unwrap()
            .insert(meta.name.clone(), Arc::new(meta));
    }

    pub fn get_meta(&self, doctype: &str) -> Result<Arc<DocTypeMeta>, FormError> {
        self.inner
            .metas
            .lock()
            .unwrap()
            .get(doctype)
            .cloned()
            .ok_or_else(|| FormError::UnknownDoctype(doctype.to_string()))
    }

    pub fn docfield(&self, doctype: &str, fieldname: &str) -> Option<DocField> {
        self.get_meta(doctype)
            .ok()
            .and_then(|meta| meta.field(fieldname).cloned())
    }

    pub fn set_permissions(&self, doctype: &str, perms: PermissionSet) {
        self.inner
            .permissions
            .lock()
            .unwrap()
            .insert(doctype.to_string(), perms);
    }

    /// Precomputed permission rows for a doctype. Unknown doctypes deny
    /// everything.
    pub fn get_permissions(&self, doctype: &str) -> PermissionSet {
        self.inner
            .permissions
            .lock()
            .unwrap()
            .get(doctype)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_workflow_state(&self, doctype: &str, docname: &str, state: WorkflowState) {
        self.inner
            .workflow
            .lock()
            .unwrap()
            .insert((doctype.to_string(), docname.to_string()), state);
    }

    /// Whether the workflow engine froze direct edits on this document.
    pub fn workflow_read_only(&self, doctype: &str, docname: &str) -> bool {
        self.inner
            .workflow
            .lock()
            .unwrap()
            .get(&(doctype.to_string(), docname.to_string()))
            .map(|s| s.read_only)
            .unwrap_or(false)
    }

    /// Whether the workflow override grants an action the base permission
    /// bits deny.
    pub fn workflow_allows(
        &self,
        doctype: &str,
        docname: &str,
        action: formkit_types::FormAction,
    ) -> bool {
        self.inner
            .workflow
            .lock()
            .unwrap()
            .get(&(doctype.to_string(), docname.to_string()))
            .map(|s| s.allowed_actions.contains(&action))
            .unwrap_or(false)
    }

    pub fn has_workflow(&self, doctype: &str, docname: &str) -> bool {
        self.inner
            .workflow
            .lock()
            .unwrap()
            .contains_key(&(doctype.to_string(), docname.to_string()))
    }
}
